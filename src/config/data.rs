//! Externally supplied data rendered by the custom services
//!
//! Districts and features are fetched elsewhere and handed to the map as
//! read-only snapshots. A new snapshot replaces the previous one wholesale.

use serde::{Deserialize, Serialize};

use crate::types::LatLng;

/// Hunting district with its boundary in GeoJSON (WGS84)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct District {
    pub id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "shapeWgs")]
    pub shape: serde_json::Value,
}

/// GeoJSON point geometry; coordinates are `[lng, lat]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointGeometry {
    pub coordinates: [f64; 2],
}

impl PointGeometry {
    pub fn lat_lng(&self) -> LatLng {
        let [lng, lat] = self.coordinates;
        LatLng::new(lat, lng)
    }
}

/// Observation or damage report location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub geometry: PointGeometry,
}

impl Feature {
    pub fn at(position: LatLng) -> Self {
        Self {
            geometry: PointGeometry {
                coordinates: [position.lng, position.lat],
            },
        }
    }
}

/// Kinds of point features with their own service and icon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    Observations,
    Damages,
}

impl FeatureKind {
    pub fn from_service_id(id: &str) -> Option<Self> {
        match id {
            crate::constants::services::OBSERVATIONS => Some(FeatureKind::Observations),
            crate::constants::services::DAMAGES => Some(FeatureKind::Damages),
            _ => None,
        }
    }

    pub fn icon(self) -> crate::engine::Icon {
        match self {
            FeatureKind::Observations => crate::constants::icons::OBSERVATION_PIN,
            FeatureKind::Damages => crate::constants::icons::DAMAGE_PIN,
        }
    }
}

/// Snapshot of all external data the map renders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataContext {
    #[serde(default)]
    pub districts: Vec<District>,
    #[serde(default)]
    pub observations: Vec<Feature>,
    #[serde(default)]
    pub damages: Vec<Feature>,
    /// From the hunter's configuration
    #[serde(default)]
    pub selected_district: Option<u64>,
}

impl DataContext {
    pub fn features(&self, kind: FeatureKind) -> &[Feature] {
        match kind {
            FeatureKind::Observations => &self.observations,
            FeatureKind::Damages => &self.damages,
        }
    }

    pub fn selected_district(&self) -> Option<&District> {
        let selected = self.selected_district?;
        self.districts.iter().find(|district| district.id == selected)
    }
}
