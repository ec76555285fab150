//! Map host: exclusive owner of the engine instance
//!
//! The host creates the engine, sets up panes and view limits, tracks the
//! `loaded` flag and routes engine events to registered listeners. Other
//! components only add and remove their own layers through it and never
//! keep engine references across a teardown: every handle is stamped with
//! the host instance that issued it.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MapConfiguration;
use crate::engine::{EngineLayer, EngineLayerId, EngineOptions, MapEngine, MapEvent, Pane};
use crate::types::MapView;

static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one host instance (one engine lifetime)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u64);

/// A layer attached through a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerHandle {
    host: HostId,
    layer: EngineLayerId,
}

impl LayerHandle {
    pub fn layer_id(&self) -> EngineLayerId {
        self.layer
    }
}

/// Registration of an event listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId {
    host: HostId,
    id: u64,
}

/// An event routed to one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub listener: ListenerId,
    pub event: MapEvent,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("map has not finished loading")]
    NotLoaded,
    #[error("map instance has been destroyed")]
    Destroyed,
    #[error("handle was issued by another map instance")]
    StaleHandle,
    #[error("engine rejected the operation: {0:#}")]
    Engine(anyhow::Error),
}

pub struct MapHost<E: MapEngine> {
    id: HostId,
    engine: E,
    container_id: String,
    loaded: bool,
    destroyed: bool,
    staged: Option<MapView>,
    listeners: Vec<(ListenerId, MapEvent)>,
    next_listener: u64,
    layers: BTreeSet<EngineLayerId>,
    queue: VecDeque<MapEvent>,
}

impl<E: MapEngine> MapHost<E> {
    /// Create the engine bound to `container_id` and set the first view
    /// First view is `view` when given, else the configured initial position
    pub fn create(container_id: &str, config: &MapConfiguration, view: Option<MapView>) -> Result<Self> {
        let options = EngineOptions {
            zoom_control: false,
            attribution_control: false,
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom,
        };

        let mut engine = E::create(container_id, &options)
            .with_context(|| format!("Failed to create map engine for container '{}'", container_id))?;
        engine.set_max_bounds(config.bounds);
        engine.create_pane(Pane::Basemap);
        engine.create_pane(Pane::Layer);

        let id = HostId(NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed));
        let mut host = Self {
            id,
            engine,
            container_id: container_id.to_string(),
            loaded: false,
            destroyed: false,
            staged: None,
            listeners: Vec::new(),
            next_listener: 1,
            layers: BTreeSet::new(),
            queue: VecDeque::new(),
        };

        let first_view = view.unwrap_or(config.initial_position);
        info!(container = %container_id, host = id.0, ?first_view, "Map created");
        host.engine.set_view(first_view);
        host.pump();
        Ok(host)
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// True once the engine has fired its first load event
    pub fn is_loaded(&self) -> bool {
        self.loaded && !self.destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Engine access for user input plumbing (gestures arrive from outside the core)
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn view(&self) -> Option<MapView> {
        if self.destroyed {
            return None;
        }
        self.engine.view()
    }

    /// Number of layers currently attached through this host
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn owns(&self, handle: LayerHandle) -> bool {
        handle.host == self.id && self.layers.contains(&handle.layer)
    }

    /// Set the view; staged until loaded, no-op when unchanged
    pub fn set_view(&mut self, view: MapView) {
        if self.destroyed {
            debug!(host = self.id.0, "Ignoring set_view on destroyed map");
            return;
        }
        if !self.loaded {
            debug!(?view, "Map not loaded, staging view");
            self.staged = Some(view);
            return;
        }
        if self.engine.view() == Some(view) {
            return;
        }
        self.engine.set_view(view);
        self.pump();
    }

    /// Set the view without announcing a move start
    /// Used for programmatic recentering that must not read as a user gesture
    pub fn set_view_quiet(&mut self, view: MapView) {
        if self.destroyed || !self.loaded {
            self.set_view(view);
            return;
        }
        self.pump();
        self.engine.set_view(view);
        for event in self.engine.take_events() {
            if event != MapEvent::MoveStart {
                self.accept(event);
            }
        }
    }

    pub fn add_layer(&mut self, layer: EngineLayer) -> Result<LayerHandle, HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        if !self.loaded {
            return Err(HostError::NotLoaded);
        }
        let layer = self.engine.add_layer(layer).map_err(HostError::Engine)?;
        self.layers.insert(layer);
        Ok(LayerHandle { host: self.id, layer })
    }

    /// Remove a layer previously added through this host
    pub fn remove_layer(&mut self, handle: LayerHandle) -> Result<(), HostError> {
        if handle.host != self.id {
            warn!(host = self.id.0, stale = handle.host.0, "Ignoring layer handle from another map instance");
            return Err(HostError::StaleHandle);
        }
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        if self.layers.remove(&handle.layer) {
            self.engine.remove_layer(handle.layer);
        } else {
            warn!(layer = handle.layer.0, "Layer was already removed");
        }
        Ok(())
    }

    pub fn subscribe(&mut self, event: MapEvent) -> Result<ListenerId, HostError> {
        if self.destroyed {
            return Err(HostError::Destroyed);
        }
        let listener = ListenerId { host: self.id, id: self.next_listener };
        self.next_listener += 1;
        self.listeners.push((listener, event));
        debug!(listener = listener.id, ?event, "Listener added");
        Ok(listener)
    }

    pub fn unsubscribe(&mut self, listener: ListenerId) {
        if listener.host != self.id {
            return;
        }
        self.listeners.retain(|(id, _)| *id != listener);
    }

    pub fn has_listener(&self, listener: ListenerId) -> bool {
        self.listeners.iter().any(|(id, _)| *id == listener)
    }

    pub fn meters_across(&self, pixels: f64) -> f64 {
        if self.destroyed {
            return 0.0;
        }
        self.engine.meters_across(pixels)
    }

    /// Pull pending engine events into the host queue
    pub fn pump(&mut self) {
        if self.destroyed {
            return;
        }
        for event in self.engine.take_events() {
            self.accept(event);
        }
    }

    /// Route queued events to the listeners registered for them
    pub fn dispatch(&mut self) -> Vec<Delivery> {
        self.pump();
        let mut deliveries = Vec::new();
        while let Some(event) = self.queue.pop_front() {
            deliveries.extend(
                self.listeners
                    .iter()
                    .filter(|(_, kind)| *kind == event)
                    .map(|(listener, _)| Delivery { listener: *listener, event }),
            );
        }
        deliveries
    }

    fn accept(&mut self, event: MapEvent) {
        if event == MapEvent::Load && !self.loaded {
            self.loaded = true;
            info!(container = %self.container_id, "Map loaded");
            if let Some(view) = self.staged.take() {
                if self.engine.view() != Some(view) {
                    self.engine.set_view(view);
                    let follow_up = self.engine.take_events();
                    self.queue.push_back(event);
                    self.queue.extend(follow_up);
                    return;
                }
            }
        }
        self.queue.push_back(event);
    }

    /// Destroy the engine instance
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        if !self.layers.is_empty() {
            warn!(count = self.layers.len(), "Destroying map with layers still attached");
        }
        self.engine.remove();
        self.destroyed = true;
        self.listeners.clear();
        self.layers.clear();
        self.queue.clear();
        info!(container = %self.container_id, host = self.id.0, "Map destroyed");
    }
}

impl<E: MapEngine> Drop for MapHost<E> {
    fn drop(&mut self) {
        self.teardown();
    }
}
