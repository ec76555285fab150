//! Asynchronous key-value storage
//!
//! Best-effort string store used for map settings and view positions.
//! There is no transactional guarantee across keys.

use anyhow::{Context, Result, anyhow};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Key-value storage service
#[allow(async_fn_in_trait)]
pub trait Storage {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

impl<T: Storage + ?Sized> Storage for &T {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key).await
    }
}

/// Storage key for a map instance's view position
pub fn map_position_key(map_id: &str) -> String {
    format!("{}-{}", crate::constants::storage::MAP_POSITION_KEY, map_id)
}

/// JSON object file mapping keys to string values
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default storage file location
    pub fn default_path() -> PathBuf {
        let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(crate::constants::config::APP_DIR);
        path.push(crate::constants::storage::FILENAME);
        path
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse storage file {:?}", self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read storage file {:?}", self.path)),
        }
    }

    async fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create storage directory {:?}", parent))?;
        }
        let contents = serde_json::to_string_pretty(entries).context("Failed to serialize storage")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write storage file {:?}", self.path))
    }
}

impl Storage for FileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries).await?;
        debug!(key = %key, bytes = value.len(), "Stored value");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

/// In-process storage for tests and simulations
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RefCell<BTreeMap<String, String>>,
    failing: Cell<bool>,
    writes: Cell<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(self, key: &str, value: &str) -> Self {
        self.entries.borrow_mut().insert(key.to_string(), value.to_string());
        self
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// Number of successful `set` calls
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    pub fn peek(&self, key: &str) -> Option<String> {
        self.entries.borrow().get(key).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.get() {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.entries.borrow_mut().insert(key.to_string(), value.to_string());
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_position_key_is_scoped_by_map_id() {
        assert_eq!(map_position_key("main-map"), "mapPosition-main-map");
        assert_ne!(map_position_key("a"), map_position_key("b"));
    }

    #[tokio::test]
    async fn test_file_storage_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("storage.json"));
        assert_eq!(storage.get("anything").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_storage_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nested").join("storage.json"));

        storage.set("a", "1").await.unwrap();
        storage.set("b", "2").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(storage.get("b").await.unwrap().as_deref(), Some("2"));

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert_eq!(storage.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_file_storage_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "not json").unwrap();

        let storage = FileStorage::new(path);
        assert!(storage.get("a").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_storage_failure_mode() {
        let storage = MemoryStorage::new().with_entry("k", "v");
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("v"));

        storage.set_failing(true);
        assert!(storage.get("k").await.is_err());
        assert!(storage.set("k", "w").await.is_err());
        assert_eq!(storage.writes(), 0);

        storage.set_failing(false);
        storage.set("k", "w").await.unwrap();
        assert_eq!(storage.peek("k").as_deref(), Some("w"));
        assert_eq!(storage.writes(), 1);
    }
}
