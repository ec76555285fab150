//! Configuration and read-only inputs for the map core
//!
//! - **map**: static service/group definitions and view limits (JSON)
//! - **data**: externally refreshed districts, features and district selection

pub mod data;
pub mod map;

// Re-export commonly used types
pub use data::{DataContext, District, Feature, FeatureKind, PointGeometry};
pub use map::{MapConfiguration, Selection, SelectionMode, ServiceDefinition, ServiceGroup, ServiceKind};
