//! Application-wide constants
//!
//! This module contains all magic numbers and string literals used throughout
//! the map core, providing a single source of truth for constant values.

/// Key-value storage keys
pub mod storage {
    /// Process-wide map settings (visible services)
    pub const MAP_SETTINGS_KEY: &str = "mapSettings";

    /// Base key for per-map view position, suffixed with `-<mapId>`
    pub const MAP_POSITION_KEY: &str = "mapPosition";

    /// Storage file name inside the data directory
    pub const FILENAME: &str = "storage.json";
}

/// Config file locations
pub mod config {
    /// Application directory name under the platform config/data/cache dirs
    pub const APP_DIR: &str = "field-map";

    /// Map configuration file name
    pub const FILENAME: &str = "map.json";
}

/// Map engine rendering constants
pub mod map {
    /// Pane for basemap services (below overlays)
    pub const BASEMAP_PANE: &str = "basemapPane";

    /// Pane for overlay services
    pub const LAYER_PANE: &str = "layerPane";

    /// Image format requested from WMS services when none is configured
    pub const DEFAULT_IMAGE_FORMAT: &str = "image/png";

    /// Image format requested from dynamic map-server exports
    pub const DYNAMIC_EXPORT_FORMAT: &str = "image";

    /// Id of the main map instance on the map page
    pub const MAIN_MAP_ID: &str = "main-map";
}

/// Custom (bespoke vector) service ids
pub mod services {
    pub const DISTRICTS: &str = "districts";
    pub const OBSERVATIONS: &str = "observations";
    pub const DAMAGES: &str = "damages";
}

/// Position tracking constants
pub mod tracking {
    /// Recentering never zooms out below this level
    pub const MIN_RECENTER_ZOOM: u8 = 12;

    /// Sensor watch timeout in milliseconds
    pub const WATCH_TIMEOUT_MS: u32 = 3_000;

    /// Oldest cached sample accepted by the sensor watch, in milliseconds
    pub const WATCH_MAX_AGE_MS: u32 = 30_000;

    /// One-shot position fetch timeout in milliseconds
    pub const ONE_SHOT_TIMEOUT_MS: u32 = 10_000;

    /// Accuracy circle fill color
    pub const ACCURACY_FILL: &str = "#3ED6CA";

    /// Accuracy circle opacity
    pub const ACCURACY_OPACITY: f64 = 0.5;
}

/// Marker icons (url, size, anchor)
pub mod icons {
    use crate::engine::Icon;

    pub const OBSERVATION_PIN: Icon = Icon {
        url: "icons/map-pin-observations.svg",
        size: (28, 34),
        anchor: (14, 34),
    };

    pub const DAMAGE_PIN: Icon = Icon {
        url: "icons/map-pin-damage.svg",
        size: (28, 34),
        anchor: (14, 34),
    };

    pub const LOCATION_PIN: Icon = Icon {
        url: "icons/location-pin.svg",
        size: (32, 32),
        anchor: (16, 16),
    };

    pub const MAP_PIN: Icon = Icon {
        url: "icons/map-pin.svg",
        size: (96, 96),
        anchor: (48, 56),
    };
}

/// Scale bar constants
pub mod scale {
    /// Default maximum bar width in pixels
    pub const DEFAULT_MAX_WIDTH: f64 = 100.0;

    /// Distances at or above this many meters are labelled in kilometers
    pub const KILOMETER_THRESHOLD: f64 = 1000.0;
}

/// Persistent debug log
pub mod logging {
    pub const LOG_DIR: &str = "logs";

    pub const LOG_FILE: &str = "debug-logs.txt";

    /// Log file is truncated and restarted past this size (10 MB)
    pub const MAX_LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;
}
