//! Geographic value types shared by the host, tracker and persistence

use serde::{Deserialize, Serialize};

/// WGS84 coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Map center and zoom level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapView {
    pub center: LatLng,
    pub zoom: u8,
}

impl MapView {
    pub const fn new(center: LatLng, zoom: u8) -> Self {
        Self { center, zoom }
    }
}

/// Hard pan bounds as `[[south, west], [north, east]]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[[f64; 2]; 2]", into = "[[f64; 2]; 2]")]
pub struct LatLngBounds {
    pub south_west: LatLng,
    pub north_east: LatLng,
}

impl LatLngBounds {
    pub fn contains(&self, point: LatLng) -> bool {
        point.lat >= self.south_west.lat
            && point.lat <= self.north_east.lat
            && point.lng >= self.south_west.lng
            && point.lng <= self.north_east.lng
    }

    /// Clamp a point into the bounds; corner order does not matter
    pub fn clamp(&self, point: LatLng) -> LatLng {
        LatLng {
            lat: clamp_between(point.lat, self.south_west.lat, self.north_east.lat),
            lng: clamp_between(point.lng, self.south_west.lng, self.north_east.lng),
        }
    }
}

/// `f64::clamp` without its panics on swapped or NaN limits
fn clamp_between(value: f64, a: f64, b: f64) -> f64 {
    value.max(a.min(b)).min(a.max(b))
}

impl From<[[f64; 2]; 2]> for LatLngBounds {
    fn from(corners: [[f64; 2]; 2]) -> Self {
        let [[south, west], [north, east]] = corners;
        Self {
            south_west: LatLng::new(south.min(north), west.min(east)),
            north_east: LatLng::new(south.max(north), west.max(east)),
        }
    }
}

impl From<LatLngBounds> for [[f64; 2]; 2] {
    fn from(bounds: LatLngBounds) -> Self {
        [
            [bounds.south_west.lat, bounds.south_west.lng],
            [bounds.north_east.lat, bounds.north_east.lng],
        ]
    }
}

/// Optional per-layer zoom limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoomBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_zoom: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_zoom: Option<u8>,
}

/// A single device position reading
/// Never persisted beyond the tracking session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub position: LatLng,
    /// Accuracy radius in meters
    pub accuracy: f64,
}

impl PositionSample {
    pub const fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self {
            position: LatLng::new(lat, lng),
            accuracy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_from_corners_normalizes_order() {
        let bounds = LatLngBounds::from([[58.0, 28.0], [55.5, 20.5]]);
        assert_eq!(bounds.south_west, LatLng::new(55.5, 20.5));
        assert_eq!(bounds.north_east, LatLng::new(58.0, 28.0));
    }

    #[test]
    fn test_bounds_contains_and_clamp() {
        let bounds = LatLngBounds::from([[55.5, 20.5], [58.0, 28.0]]);
        assert!(bounds.contains(LatLng::new(56.9, 24.1)));
        assert!(!bounds.contains(LatLng::new(60.0, 24.1)));
        assert_eq!(bounds.clamp(LatLng::new(60.0, 19.0)), LatLng::new(58.0, 20.5));
    }

    #[test]
    fn test_clamp_tolerates_swapped_corners() {
        let bounds = LatLngBounds {
            south_west: LatLng::new(58.0, 28.0),
            north_east: LatLng::new(55.5, 20.5),
        };
        assert_eq!(bounds.clamp(LatLng::new(60.0, 19.0)), LatLng::new(58.0, 20.5));
        assert_eq!(bounds.clamp(LatLng::new(56.9, 24.1)), LatLng::new(56.9, 24.1));
    }

    #[test]
    fn test_view_serializes_as_center_and_zoom() {
        let view = MapView::new(LatLng::new(10.0, 20.0), 7);
        let json = serde_json::to_string(&view).unwrap();
        assert_eq!(json, r#"{"center":{"lat":10.0,"lng":20.0},"zoom":7}"#);
    }
}
