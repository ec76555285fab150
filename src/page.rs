//! Map page: composition root
//!
//! Wires the host, settings, layer reconciler, position tracker, view
//! persistence and scale bar together and runs them on one event loop.
//! Page inputs (button presses, data refreshes) and sensor readings are the
//! two event sources. Pending engine events are routed before sensor
//! readings, so a user gesture always reaches the tracker first.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DataContext, MapConfiguration};
use crate::constants::{icons, map::MAIN_MAP_ID};
use crate::engine::{EngineLayer, MapEngine, Marker};
use crate::geolocation::{Geolocation, SensorReading};
use crate::host::{LayerHandle, MapHost};
use crate::layers::{ConfiguredResolver, LayerReconciler, LayerResolver};
use crate::scale::{ScaleBar, ScaleState};
use crate::settings::{MapSettings, MenuGroup, SettingsStore, menu};
use crate::storage::Storage;
use crate::tracker::{PositionTracker, TrackingState};
use crate::types::{LatLng, MapView};
use crate::view_persistence::ViewPersistence;

/// Mount options
#[derive(Debug, Clone)]
pub struct PageOptions {
    /// Container id; also scopes the stored view position
    pub map_id: String,
    /// Caller-supplied first view
    pub view: Option<MapView>,
    /// Static pin marker
    pub pin: Option<LatLng>,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            map_id: MAIN_MAP_ID.to_string(),
            view: None,
            pin: None,
        }
    }
}

/// User and application inputs to a mounted page
#[derive(Debug, Clone)]
pub enum PageInput {
    ToggleTracking,
    /// Dismiss the tracking error
    ResetTracking,
    ToggleService { group_id: String, service_id: String },
    /// New districts/features/selected-district snapshot
    DataChanged(DataContext),
    ReturnHome,
    /// Caller sets the view explicitly
    SetView(MapView),
    /// The engine has pending events (e.g. after a user gesture)
    MapEvents,
}

enum Wake {
    Input(Option<PageInput>),
    Reading(SensorReading),
}

pub struct MapPage<E: MapEngine, S: Storage, G: Geolocation, R: LayerResolver = ConfiguredResolver> {
    config: MapConfiguration,
    storage: S,
    geo: G,
    resolver: R,
    host: MapHost<E>,
    settings: SettingsStore,
    data: DataContext,
    layers: LayerReconciler,
    tracker: PositionTracker,
    readings: mpsc::UnboundedReceiver<SensorReading>,
    persistence: ViewPersistence,
    scale: ScaleBar,
    pin_position: Option<LatLng>,
    pin: Option<LayerHandle>,
    ready: bool,
}

impl<E: MapEngine, S: Storage, G: Geolocation> MapPage<E, S, G> {
    /// Mount with raster layers built straight from configuration
    pub async fn mount(config: MapConfiguration, storage: S, geo: G, options: PageOptions) -> Result<Self> {
        Self::mount_with_resolver(config, storage, geo, ConfiguredResolver, options).await
    }
}

impl<E: MapEngine, S: Storage, G: Geolocation, R: LayerResolver> MapPage<E, S, G, R> {
    pub async fn mount_with_resolver(
        config: MapConfiguration,
        storage: S,
        geo: G,
        resolver: R,
        options: PageOptions,
    ) -> Result<Self> {
        let mut host = MapHost::create(&options.map_id, &config, options.view)
            .with_context(|| format!("Failed to mount map '{}'", options.map_id))?;
        // Events from creation predate every listener
        host.dispatch();

        let (sink, readings) = mpsc::unbounded_channel();
        let mut page = Self {
            config,
            storage,
            geo,
            resolver,
            host,
            settings: SettingsStore::new(),
            data: DataContext::default(),
            layers: LayerReconciler::new(),
            tracker: PositionTracker::new(sink),
            readings,
            persistence: ViewPersistence::new(&options.map_id),
            scale: ScaleBar::default(),
            pin_position: options.pin,
            pin: None,
            ready: false,
        };

        page.settings.load(&page.storage, &page.config).await;
        page.persist_settings().await;

        if let Err(e) = page.persistence.restore(&page.storage, &mut page.host).await {
            warn!(error = %e, "Cannot restore map position");
        }

        page.settle().await;
        info!(map = %options.map_id, loaded = page.host.is_loaded(), "Map page mounted");
        Ok(page)
    }

    pub fn config(&self) -> &MapConfiguration {
        &self.config
    }

    pub fn host(&self) -> &MapHost<E> {
        &self.host
    }

    /// Engine access for gestures arriving from outside the core
    /// Follow up with [`PageInput::MapEvents`]
    pub fn engine_mut(&mut self) -> &mut E {
        self.host.engine_mut()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn geolocation(&self) -> &G {
        &self.geo
    }

    pub fn settings(&self) -> Option<&MapSettings> {
        self.settings.settings()
    }

    pub fn settings_menu(&self) -> Vec<MenuGroup> {
        match self.settings.settings() {
            Some(settings) => menu(&self.config, settings, &self.data),
            None => Vec::new(),
        }
    }

    pub fn tracking(&self) -> TrackingState {
        self.tracker.state()
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn scale(&self) -> &ScaleState {
        self.scale.state()
    }

    pub fn view(&self) -> Option<MapView> {
        self.host.view()
    }

    pub async fn handle(&mut self, input: PageInput) {
        debug!(?input, "Page input");
        match input {
            PageInput::ToggleTracking => {
                self.tracker.toggle(&mut self.geo, &mut self.host);
            }
            PageInput::ResetTracking => {
                self.tracker.reset(&mut self.geo, &mut self.host);
            }
            PageInput::ToggleService { group_id, service_id } => {
                if self.settings.toggle(&group_id, &service_id, &self.config) {
                    self.persist_settings().await;
                    self.sync_layers().await;
                }
            }
            PageInput::DataChanged(data) => {
                self.data = data;
                self.sync_layers().await;
            }
            PageInput::ReturnHome => {
                self.host.set_view(self.config.initial_position);
            }
            PageInput::SetView(view) => {
                self.host.set_view(view);
            }
            PageInput::MapEvents => {}
        }
        self.settle().await;
    }

    /// Process everything already queued: map events, then sensor readings
    pub async fn settle(&mut self) {
        loop {
            let mut progressed = false;

            if !self.ready && self.host.is_loaded() {
                self.on_loaded().await;
                progressed = true;
            }

            // A queued user gesture must reach the tracker before a reading can recenter
            progressed |= self.route_map_events().await;

            while let Ok(reading) = self.readings.try_recv() {
                self.tracker.on_reading(reading, &mut self.geo, &mut self.host);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    /// Deliver pending engine events; returns whether any listener was called
    async fn route_map_events(&mut self) -> bool {
        let deliveries = self.host.dispatch();
        for delivery in &deliveries {
            if self.persistence.handles(delivery) {
                if let Err(e) = self.persistence.persist(&self.storage, &self.host).await {
                    warn!(error = ?e, "Failed to persist map position");
                }
            }
            if self.scale.handles(delivery) {
                self.scale.update(&self.host);
            }
            if self.tracker.handles(delivery) {
                self.tracker.on_map_move(&mut self.geo, &mut self.host);
            }
        }
        !deliveries.is_empty()
    }

    /// Event loop; returns once the input channel closes, after unmounting
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<PageInput>) {
        info!("Map page running");
        loop {
            let wake = tokio::select! {
                input = inputs.recv() => Wake::Input(input),
                Some(reading) = self.readings.recv() => Wake::Reading(reading),
            };
            match wake {
                Wake::Input(Some(input)) => self.handle(input).await,
                Wake::Input(None) => break,
                Wake::Reading(reading) => {
                    self.route_map_events().await;
                    self.tracker.on_reading(reading, &mut self.geo, &mut self.host);
                    self.settle().await;
                }
            }
        }
        self.unmount();
    }

    /// Release everything in reverse order of setup and destroy the map
    pub fn unmount(mut self) {
        self.tracker.teardown(&mut self.geo, &mut self.host);
        if let Some(pin) = self.pin.take() {
            if let Err(e) = self.host.remove_layer(pin) {
                warn!(error = %e, "Failed to remove pin marker");
            }
        }
        self.scale.unmount(&mut self.host);
        self.layers.teardown(&mut self.host);
        self.persistence.unmount(&mut self.host);
        info!(map = %self.host.container_id(), "Map page unmounted");
        self.host.destroy();
    }

    async fn on_loaded(&mut self) {
        self.ready = true;
        self.sync_layers().await;
        if let Err(e) = self.scale.mount(&mut self.host) {
            warn!(error = %e, "Cannot show scale bar");
        }
        if let Some(position) = self.pin_position {
            let marker = EngineLayer::Marker(Marker {
                position,
                icon: icons::MAP_PIN,
            });
            match self.host.add_layer(marker) {
                Ok(handle) => self.pin = Some(handle),
                Err(e) => warn!(error = %e, "Failed to add pin marker"),
            }
        }
    }

    async fn sync_layers(&mut self) {
        let Some(settings) = self.settings.settings() else {
            return;
        };
        self.layers
            .sync(&self.resolver, &self.config, settings, &self.data, &mut self.host)
            .await;
    }

    async fn persist_settings(&self) {
        if let Err(e) = self.settings.persist(&self.storage).await {
            warn!(error = ?e, "Failed to persist map settings");
        }
    }
}
