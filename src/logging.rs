//! Logging setup
//!
//! Events go to stderr and to a persistent debug log in the cache directory.
//! The debug log is capped: once it reaches its size limit it is truncated
//! and writing starts from scratch.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, registry};

use crate::constants::{config::APP_DIR, logging};

/// Log level from the `LOG_LEVEL` environment variable, defaulting to info
pub fn level_from_env() -> Level {
    parse_level(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Default debug log location
pub fn log_file_path() -> PathBuf {
    let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(APP_DIR);
    path.push(logging::LOG_DIR);
    path.push(logging::LOG_FILE);
    path
}

/// Append-only log file that starts over once it reaches `max_bytes`
#[derive(Debug)]
pub struct CappedLogFile {
    file: File,
    written: u64,
    max_bytes: u64,
}

impl CappedLogFile {
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        let written = file
            .metadata()
            .with_context(|| format!("Failed to stat log file {:?}", path))?
            .len();
        Ok(Self { file, written, max_bytes })
    }
}

impl Write for CappedLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written >= self.max_bytes {
            self.file.set_len(0)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Install the global subscriber
/// Returns the debug log path, or `None` when the file could not be opened
pub fn init(level: Level) -> Result<Option<PathBuf>> {
    let path = log_file_path();
    let (file_layer, file_error) = match CappedLogFile::open(&path, logging::MAX_LOG_FILE_BYTES) {
        Ok(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    let subscriber = registry()
        .with(LevelFilter::from_level(level))
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")?;

    match file_error {
        None => Ok(Some(path)),
        Some(e) => {
            tracing::warn!(error = ?e, "Debug log file unavailable, logging to stderr only");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_log_file_lives_in_app_cache_dir() {
        let path = log_file_path();
        assert!(path.ends_with("field-map/logs/debug-logs.txt"));
    }

    #[test]
    fn test_capped_file_appends_until_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("debug-logs.txt");

        let mut log = CappedLogFile::open(&path, 16).unwrap();
        log.write_all(b"0123456789").unwrap();
        log.write_all(b"abcdefghij").unwrap();
        log.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0123456789abcdefghij");

        // Over the cap: the next entry starts a fresh file
        log.write_all(b"fresh").unwrap();
        log.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh");
    }

    #[test]
    fn test_reopened_file_counts_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug-logs.txt");
        fs::write(&path, "x".repeat(32)).unwrap();

        let mut log = CappedLogFile::open(&path, 16).unwrap();
        log.write_all(b"new").unwrap();
        log.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
