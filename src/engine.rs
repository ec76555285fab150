//! Mapping engine seam
//!
//! The map core never renders tiles itself. It drives an imperative engine
//! through [`MapEngine`]: create/destroy, view, panes, layer add/remove and
//! a queue of emitted events. [`HeadlessEngine`] is an in-memory engine that
//! records state instead of drawing; the CLI and the tests run on it.

use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};

use crate::types::{LatLng, LatLngBounds, MapView, ZoomBounds};

/// Named, z-ordered rendering pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pane {
    /// Below overlays
    Basemap,
    /// Above basemaps
    Layer,
}

impl Pane {
    pub fn name(self) -> &'static str {
        match self {
            Pane::Basemap => crate::constants::map::BASEMAP_PANE,
            Pane::Layer => crate::constants::map::LAYER_PANE,
        }
    }

    pub fn for_group(is_basemap_group: bool) -> Self {
        if is_basemap_group { Pane::Basemap } else { Pane::Layer }
    }
}

impl fmt::Display for Pane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Marker icon: image url, pixel size and anchor point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Icon {
    pub url: &'static str,
    pub size: (u32, u32),
    pub anchor: (u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Marker {
    pub position: LatLng,
    pub icon: Icon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircleStyle {
    pub fill_color: &'static str,
    pub opacity: f64,
    pub stroke: bool,
}

/// Description of an engine layer object
#[derive(Debug, Clone, PartialEq)]
pub enum EngineLayer {
    /// WMS tile layer
    WmsTiles {
        url: String,
        /// Comma-joined layer names
        layers: String,
        format: String,
        transparent: Option<bool>,
        max_native_zoom: Option<u8>,
        pane: Pane,
        zoom: ZoomBounds,
    },
    /// Tile cache published by a map server
    CachedTiles {
        url: String,
        max_native_zoom: Option<u8>,
        pane: Pane,
        zoom: ZoomBounds,
    },
    /// Image requested per view from a map server
    DynamicImage {
        url: String,
        format: String,
        pane: Pane,
        zoom: ZoomBounds,
    },
    /// GeoJSON geometry
    Geometry {
        geojson: serde_json::Value,
        pane: Pane,
    },
    /// Point markers removable as one unit
    MarkerGroup { markers: Vec<Marker>, pane: Pane },
    Marker(Marker),
    /// Circle with a radius in meters
    Circle {
        center: LatLng,
        radius: f64,
        style: CircleStyle,
    },
}

impl EngineLayer {
    pub fn pane(&self) -> Option<Pane> {
        match self {
            EngineLayer::WmsTiles { pane, .. }
            | EngineLayer::CachedTiles { pane, .. }
            | EngineLayer::DynamicImage { pane, .. }
            | EngineLayer::Geometry { pane, .. }
            | EngineLayer::MarkerGroup { pane, .. } => Some(*pane),
            EngineLayer::Marker(_) | EngineLayer::Circle { .. } => None,
        }
    }
}

/// Engine-assigned layer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineLayerId(pub u64);

/// Events emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapEvent {
    /// First view has been set
    Load,
    MoveStart,
    MoveEnd,
    Zoom,
}

/// Options applied at engine creation
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub zoom_control: bool,
    pub attribution_control: bool,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

/// Imperative mapping engine
pub trait MapEngine: Sized {
    /// Instantiate the engine bound to a container id
    fn create(container_id: &str, options: &EngineOptions) -> Result<Self>;
    fn set_max_bounds(&mut self, bounds: LatLngBounds);
    fn create_pane(&mut self, pane: Pane);
    fn set_view(&mut self, view: MapView);
    /// Current center and zoom, `None` until a view has been set
    fn view(&self) -> Option<MapView>;
    fn add_layer(&mut self, layer: EngineLayer) -> Result<EngineLayerId>;
    /// Returns false when the layer was not attached
    fn remove_layer(&mut self, id: EngineLayerId) -> bool;
    /// Drain events emitted since the last call
    fn take_events(&mut self) -> Vec<MapEvent>;
    /// Ground distance in meters spanned by `pixels` at the vertical center
    fn meters_across(&self, pixels: f64) -> f64;
    /// Destroy the instance; every later call is a no-op or an error
    fn remove(&mut self);
}

/// Web Mercator ground resolution at zoom 0 on the equator (meters per pixel)
const EQUATOR_METERS_PER_PIXEL: f64 = 156_543.033_92;

/// In-memory engine that records state instead of drawing
#[derive(Debug)]
pub struct HeadlessEngine {
    container_id: String,
    options: EngineOptions,
    bounds: Option<LatLngBounds>,
    panes: Vec<Pane>,
    view: Option<MapView>,
    layers: BTreeMap<EngineLayerId, EngineLayer>,
    next_layer: u64,
    events: Vec<MapEvent>,
    destroyed: bool,
}

impl HeadlessEngine {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn panes(&self) -> &[Pane] {
        &self.panes
    }

    pub fn bounds(&self) -> Option<LatLngBounds> {
        self.bounds
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Attached layers in insertion order
    pub fn layers(&self) -> impl Iterator<Item = (EngineLayerId, &EngineLayer)> {
        self.layers.iter().map(|(id, layer)| (*id, layer))
    }

    pub fn layer(&self, id: EngineLayerId) -> Option<&EngineLayer> {
        self.layers.get(&id)
    }

    pub fn layers_in(&self, pane: Pane) -> Vec<&EngineLayer> {
        self.layers
            .values()
            .filter(|layer| layer.pane() == Some(pane))
            .collect()
    }

    /// Simulate a user pan/zoom gesture
    pub fn user_move(&mut self, view: MapView) {
        debug!(?view, "User moved map");
        self.move_to(view);
    }

    fn constrain(&self, view: MapView) -> MapView {
        let center = match self.bounds {
            Some(bounds) => bounds.clamp(view.center),
            None => view.center,
        };
        // Inverted limits come from a bad config; treat them as a range
        let (low, high) = (
            self.options.min_zoom.min(self.options.max_zoom),
            self.options.min_zoom.max(self.options.max_zoom),
        );
        let zoom = view.zoom.clamp(low, high);
        MapView::new(center, zoom)
    }

    fn move_to(&mut self, view: MapView) {
        if self.destroyed {
            return;
        }

        let view = self.constrain(view);
        let previous = self.view;
        if previous == Some(view) {
            return;
        }

        self.view = Some(view);
        self.events.push(MapEvent::MoveStart);
        if previous.map(|v| v.zoom) != Some(view.zoom) {
            self.events.push(MapEvent::Zoom);
        }
        self.events.push(MapEvent::MoveEnd);
        if previous.is_none() {
            self.events.push(MapEvent::Load);
        }
    }
}

impl MapEngine for HeadlessEngine {
    fn create(container_id: &str, options: &EngineOptions) -> Result<Self> {
        if container_id.is_empty() {
            bail!("Map container id must not be empty");
        }
        Ok(Self {
            container_id: container_id.to_string(),
            options: options.clone(),
            bounds: None,
            panes: Vec::new(),
            view: None,
            layers: BTreeMap::new(),
            next_layer: 1,
            events: Vec::new(),
            destroyed: false,
        })
    }

    fn set_max_bounds(&mut self, bounds: LatLngBounds) {
        self.bounds = Some(bounds);
    }

    fn create_pane(&mut self, pane: Pane) {
        if !self.panes.contains(&pane) {
            self.panes.push(pane);
        }
    }

    fn set_view(&mut self, view: MapView) {
        self.move_to(view);
    }

    fn view(&self) -> Option<MapView> {
        if self.destroyed { None } else { self.view }
    }

    fn add_layer(&mut self, layer: EngineLayer) -> Result<EngineLayerId> {
        if self.destroyed {
            bail!("Map engine has been removed");
        }
        if let Some(pane) = layer.pane() {
            if !self.panes.contains(&pane) {
                return Err(anyhow!("Unknown pane '{}'", pane));
            }
        }

        let id = EngineLayerId(self.next_layer);
        self.next_layer += 1;
        trace!(layer = id.0, ?layer, "Layer added");
        self.layers.insert(id, layer);
        Ok(id)
    }

    fn remove_layer(&mut self, id: EngineLayerId) -> bool {
        let removed = self.layers.remove(&id).is_some();
        trace!(layer = id.0, removed, "Layer removed");
        removed
    }

    fn take_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.events)
    }

    fn meters_across(&self, pixels: f64) -> f64 {
        let Some(view) = self.view else {
            return 0.0;
        };
        let meters_per_pixel =
            EQUATOR_METERS_PER_PIXEL * view.center.lat.to_radians().cos() / 2f64.powi(i32::from(view.zoom));
        meters_per_pixel * pixels
    }

    fn remove(&mut self) {
        self.destroyed = true;
        self.layers.clear();
        self.events.clear();
    }
}

/// Headless engine whose events are held back until released
/// Lets tests observe a map that has not fired its load event yet
#[cfg(test)]
pub(crate) struct DeferredEngine {
    pub(crate) inner: HeadlessEngine,
    held: Vec<MapEvent>,
    released: bool,
}

#[cfg(test)]
impl DeferredEngine {
    pub(crate) fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
impl MapEngine for DeferredEngine {
    fn create(container_id: &str, options: &EngineOptions) -> Result<Self> {
        Ok(Self {
            inner: HeadlessEngine::create(container_id, options)?,
            held: Vec::new(),
            released: false,
        })
    }
    fn set_max_bounds(&mut self, bounds: LatLngBounds) {
        self.inner.set_max_bounds(bounds)
    }
    fn create_pane(&mut self, pane: Pane) {
        self.inner.create_pane(pane)
    }
    fn set_view(&mut self, view: MapView) {
        self.inner.set_view(view)
    }
    fn view(&self) -> Option<MapView> {
        self.inner.view()
    }
    fn add_layer(&mut self, layer: EngineLayer) -> Result<EngineLayerId> {
        self.inner.add_layer(layer)
    }
    fn remove_layer(&mut self, id: EngineLayerId) -> bool {
        self.inner.remove_layer(id)
    }
    fn take_events(&mut self) -> Vec<MapEvent> {
        self.held.extend(self.inner.take_events());
        if self.released { std::mem::take(&mut self.held) } else { Vec::new() }
    }
    fn meters_across(&self, pixels: f64) -> f64 {
        self.inner.meters_across(pixels)
    }
    fn remove(&mut self) {
        self.inner.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EngineOptions {
        EngineOptions {
            zoom_control: false,
            attribution_control: false,
            min_zoom: 5,
            max_zoom: 18,
        }
    }

    #[test]
    fn test_first_view_emits_load() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        engine.set_view(MapView::new(LatLng::new(56.0, 24.0), 7));
        let events = engine.take_events();
        assert_eq!(events.last(), Some(&MapEvent::Load));
        assert!(events.contains(&MapEvent::MoveStart));
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn test_same_view_emits_nothing() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        let view = MapView::new(LatLng::new(56.0, 24.0), 7);
        engine.set_view(view);
        engine.take_events();
        engine.set_view(view);
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn test_pan_without_zoom_change_emits_no_zoom_event() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        engine.set_view(MapView::new(LatLng::new(56.0, 24.0), 7));
        engine.take_events();
        engine.user_move(MapView::new(LatLng::new(56.5, 24.0), 7));
        assert_eq!(engine.take_events(), vec![MapEvent::MoveStart, MapEvent::MoveEnd]);
    }

    #[test]
    fn test_view_is_constrained_to_bounds_and_zoom_limits() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        engine.set_max_bounds(LatLngBounds::from([[55.0, 20.0], [58.0, 28.0]]));
        engine.set_view(MapView::new(LatLng::new(70.0, 24.0), 25));
        let view = engine.view().unwrap();
        assert_eq!(view.center, LatLng::new(58.0, 24.0));
        assert_eq!(view.zoom, 18);
    }

    #[test]
    fn test_layer_requires_known_pane() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        let layer = EngineLayer::MarkerGroup { markers: vec![], pane: Pane::Layer };
        assert!(engine.add_layer(layer.clone()).is_err());

        engine.create_pane(Pane::Layer);
        let id = engine.add_layer(layer).unwrap();
        assert_eq!(engine.layers_in(Pane::Layer).len(), 1);
        assert!(engine.remove_layer(id));
        assert!(!engine.remove_layer(id));
    }

    #[test]
    fn test_removed_engine_rejects_layers() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        engine.remove();
        assert!(engine.is_destroyed());
        assert!(engine.view().is_none());
        let circle = EngineLayer::Circle {
            center: LatLng::new(0.0, 0.0),
            radius: 1.0,
            style: CircleStyle { fill_color: "#000000", opacity: 1.0, stroke: false },
        };
        assert!(engine.add_layer(circle).is_err());
    }

    #[test]
    fn test_meters_across_halves_per_zoom_level() {
        let mut engine = HeadlessEngine::create("map", &options()).unwrap();
        engine.set_view(MapView::new(LatLng::new(0.0, 0.0), 10));
        let at_10 = engine.meters_across(100.0);
        engine.set_view(MapView::new(LatLng::new(0.0, 0.0), 11));
        let at_11 = engine.meters_across(100.0);
        assert!((at_10 / at_11 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_container_id_is_rejected() {
        assert!(HeadlessEngine::create("", &options()).is_err());
    }
}
