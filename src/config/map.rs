//! Static map configuration: services, service groups, view limits
//!
//! Loaded once at startup from JSON and never mutated afterwards.
//! User-facing state (which services are visible) lives in `settings`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::{LatLngBounds, MapView, ZoomBounds};

/// Built-in configuration, used when no config file is present
const BUILTIN_CONFIG: &str = include_str!("../../assets/map.json");

/// Top-level map configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapConfiguration {
    pub initial_position: MapView,
    pub bounds: LatLngBounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub services: Vec<ServiceDefinition>,
    pub service_groups: Vec<ServiceGroup>,
}

/// A configured data source rendered as one map layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    #[serde(flatten)]
    pub zoom: ZoomBounds,
    #[serde(flatten)]
    pub kind: ServiceKind,
}

/// Service variants, tagged by `type` in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServiceKind {
    /// Tiled raster service (WMS)
    #[serde(rename = "WmsTiled", rename_all = "camelCase")]
    TiledRaster {
        url: String,
        layers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transparent: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_native_zoom: Option<u8>,
    },
    /// Pre-rendered tile cache published by a map server
    #[serde(rename = "AgsTiled", rename_all = "camelCase")]
    CachedTiles {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_native_zoom: Option<u8>,
    },
    /// Image-per-request service (dynamic map export)
    #[serde(rename = "AgsDynamic")]
    DynamicRaster { url: String },
    /// Rendered by bespoke vector logic keyed by service id
    Custom,
}

impl ServiceDefinition {
    pub fn is_custom(&self) -> bool {
        matches!(self.kind, ServiceKind::Custom)
    }
}

/// A set of mutually related services sharing a selection policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceGroup {
    pub id: String,
    pub title: String,
    pub services: Vec<String>,
    #[serde(default, rename = "isBasemapServiceGroup")]
    pub is_basemap_group: bool,
    #[serde(flatten)]
    pub selection: Selection,
}

/// Toggle semantics of a group, tagged by `selectionMode` in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "selectionMode")]
pub enum Selection {
    /// One service at a time is checked and cannot be unchecked
    #[serde(rename = "single", rename_all = "camelCase")]
    Single { default_service: String },
    /// One service at a time is checked and can be unchecked
    #[serde(rename = "single-checkable", rename_all = "camelCase")]
    SingleCheckable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_service: Option<String>,
    },
    /// Any number of services can be checked
    #[serde(rename = "multiple", rename_all = "camelCase")]
    Multiple {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_services: Option<Vec<String>>,
    },
}

/// Selection mode without the per-mode defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Single,
    SingleCheckable,
    Multiple,
}

impl Selection {
    pub fn mode(&self) -> SelectionMode {
        match self {
            Selection::Single { .. } => SelectionMode::Single,
            Selection::SingleCheckable { .. } => SelectionMode::SingleCheckable,
            Selection::Multiple { .. } => SelectionMode::Multiple,
        }
    }

    /// Services this group contributes to the default visible set
    pub fn defaults(&self) -> Vec<&str> {
        match self {
            Selection::Single { default_service } => vec![default_service.as_str()],
            Selection::SingleCheckable { default_service } => {
                default_service.iter().map(String::as_str).collect()
            }
            Selection::Multiple { default_services } => default_services
                .iter()
                .flatten()
                .map(String::as_str)
                .collect(),
        }
    }
}

impl ServiceGroup {
    pub fn contains(&self, service_id: &str) -> bool {
        self.services.iter().any(|id| id == service_id)
    }

    pub fn mode(&self) -> SelectionMode {
        self.selection.mode()
    }
}

impl MapConfiguration {
    /// Default config file location
    pub fn path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(crate::constants::config::APP_DIR);
        path.push(crate::constants::config::FILENAME);
        path
    }

    /// Configuration compiled into the binary
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CONFIG).context("Failed to parse built-in map configuration")
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: MapConfiguration =
            serde_json::from_str(contents).context("Invalid map configuration JSON")?;
        config.validate();
        Ok(config)
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read map configuration from {:?}", path))?;
        let config = Self::from_json(&contents)
            .with_context(|| format!("Failed to parse map configuration from {:?}", path))?;
        info!(
            path = %path.display(),
            services = config.services.len(),
            groups = config.service_groups.len(),
            "Loaded map configuration"
        );
        Ok(config)
    }

    /// Load the user's config file, falling back to the built-in one when absent
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if path.exists() {
            return Self::load_from(&path);
        }
        info!(path = %path.display(), "No map configuration file, using built-in configuration");
        Self::builtin()
    }

    pub fn service(&self, id: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|service| service.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&ServiceGroup> {
        self.service_groups.iter().find(|group| group.id == id)
    }

    /// Report configuration defects
    /// Defects are never fatal: missing services are skipped at render time
    fn validate(&self) {
        if self.min_zoom > self.max_zoom {
            warn!(min_zoom = self.min_zoom, max_zoom = self.max_zoom, "minZoom exceeds maxZoom");
        }

        if !self.bounds.contains(self.initial_position.center) {
            warn!(center = ?self.initial_position.center, "Initial position lies outside pan bounds");
        }

        for group in &self.service_groups {
            for service_id in &group.services {
                if self.service(service_id).is_none() {
                    warn!(group = %group.id, service = %service_id, "Service group references missing service");
                }
            }

            for default_id in group.selection.defaults() {
                if !group.contains(default_id) {
                    warn!(group = %group.id, service = %default_id, "Default service is not a member of its group");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_configuration_parses() {
        let config = MapConfiguration::builtin().unwrap();
        assert!(!config.services.is_empty());
        assert!(!config.service_groups.is_empty());
        assert!(config.min_zoom <= config.max_zoom);
        assert!(config.service_groups.iter().any(|g| g.is_basemap_group));
    }

    #[test]
    fn test_builtin_groups_reference_known_services() {
        let config = MapConfiguration::builtin().unwrap();
        for group in &config.service_groups {
            for id in &group.services {
                assert!(config.service(id).is_some(), "missing service {id}");
            }
        }
    }

    #[test]
    fn test_service_kinds_parse_from_type_tag() {
        let json = r#"[
            {"id": "topo", "title": "Topo", "thumbnail": "topo.png", "type": "WmsTiled",
             "url": "https://example.test/wms", "layers": ["a", "b"], "transparent": true, "minZoom": 3},
            {"id": "ortho", "title": "Ortho", "thumbnail": "ortho.png", "type": "AgsTiled",
             "url": "https://example.test/tiles", "maxNativeZoom": 17},
            {"id": "forest", "title": "Forest", "thumbnail": "forest.png", "type": "AgsDynamic",
             "url": "https://example.test/export", "maxZoom": 18},
            {"id": "districts", "title": "Districts", "thumbnail": "d.png", "type": "Custom"}
        ]"#;

        let services: Vec<ServiceDefinition> = serde_json::from_str(json).unwrap();
        assert_eq!(services.len(), 4);

        match &services[0].kind {
            ServiceKind::TiledRaster { layers, transparent, image_format, .. } => {
                assert_eq!(layers, &vec!["a".to_string(), "b".to_string()]);
                assert_eq!(*transparent, Some(true));
                assert_eq!(*image_format, None);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(services[0].zoom.min_zoom, Some(3));
        assert!(matches!(services[1].kind, ServiceKind::CachedTiles { max_native_zoom: Some(17), .. }));
        assert!(matches!(services[2].kind, ServiceKind::DynamicRaster { .. }));
        assert_eq!(services[2].zoom.max_zoom, Some(18));
        assert!(services[3].is_custom());
    }

    #[test]
    fn test_group_selection_modes_parse() {
        let json = r#"[
            {"id": "base", "title": "Base", "services": ["a", "b"], "isBasemapServiceGroup": true,
             "selectionMode": "single", "defaultService": "a"},
            {"id": "extra", "title": "Extra", "services": ["c"], "selectionMode": "single-checkable"},
            {"id": "over", "title": "Over", "services": ["d", "e"], "selectionMode": "multiple",
             "defaultServices": ["d", "e"]}
        ]"#;

        let groups: Vec<ServiceGroup> = serde_json::from_str(json).unwrap();
        assert!(groups[0].is_basemap_group);
        assert!(!groups[1].is_basemap_group);
        assert_eq!(groups[0].mode(), SelectionMode::Single);
        assert_eq!(groups[1].mode(), SelectionMode::SingleCheckable);
        assert_eq!(groups[2].mode(), SelectionMode::Multiple);
        assert_eq!(groups[0].selection.defaults(), vec!["a"]);
        assert!(groups[1].selection.defaults().is_empty());
        assert_eq!(groups[2].selection.defaults(), vec!["d", "e"]);
    }

    #[test]
    fn test_single_group_requires_default_service() {
        let json = r#"{"id": "base", "title": "Base", "services": ["a"], "selectionMode": "single"}"#;
        assert!(serde_json::from_str::<ServiceGroup>(json).is_err());
    }

    #[test]
    fn test_load_from_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = MapConfiguration::load_from(&dir.path().join("nope.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.json");
        std::fs::write(&path, BUILTIN_CONFIG).unwrap();

        let config = MapConfiguration::load_from(&path).unwrap();
        assert_eq!(config.services.len(), MapConfiguration::builtin().unwrap().services.len());
    }
}
