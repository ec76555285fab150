//! Layer reconciliation
//!
//! Each pass computes the desired layer set from configuration, settings and
//! the data snapshot, then diffs it against what this reconciler attached
//! earlier. Stale layers are removed before replacements are added, and an
//! unchanged desired set touches nothing.
//!
//! Raster services are looked up through a [`LayerResolver`], which may be
//! asynchronous. Such lookups become pending requests identified by a
//! [`LayerToken`]; a completion whose token was superseded in the meantime is
//! dropped without touching the map.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{DataContext, FeatureKind, MapConfiguration, ServiceDefinition, ServiceKind};
use crate::constants::{map, services};
use crate::engine::{EngineLayer, MapEngine, Marker, Pane};
use crate::host::{LayerHandle, MapHost};
use crate::settings::MapSettings;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("missing service '{service}' for service group '{group}'")]
    MissingService { group: String, service: String },
    #[error("no renderer for custom service '{0}'")]
    UnsupportedCustomService(String),
    #[error("failed to get layer for service '{service}': {source:#}")]
    Resolve { service: String, source: anyhow::Error },
}

/// Asynchronous lookup of the engine layer for a raster service
#[allow(async_fn_in_trait)]
pub trait LayerResolver {
    async fn resolve(&self, service: &ServiceDefinition, pane: Pane) -> Result<EngineLayer>;
}

/// Builds raster layers straight from their configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredResolver;

impl LayerResolver for ConfiguredResolver {
    async fn resolve(&self, service: &ServiceDefinition, pane: Pane) -> Result<EngineLayer> {
        raster_layer(service, pane)
    }
}

/// Engine layer for a raster service definition
pub fn raster_layer(service: &ServiceDefinition, pane: Pane) -> Result<EngineLayer> {
    let zoom = service.zoom;
    match &service.kind {
        ServiceKind::TiledRaster {
            url,
            layers,
            image_format,
            transparent,
            max_native_zoom,
        } => Ok(EngineLayer::WmsTiles {
            url: url.clone(),
            layers: layers.join(","),
            format: image_format.clone().unwrap_or_else(|| map::DEFAULT_IMAGE_FORMAT.to_string()),
            transparent: *transparent,
            max_native_zoom: *max_native_zoom,
            pane,
            zoom,
        }),
        ServiceKind::CachedTiles { url, max_native_zoom } => Ok(EngineLayer::CachedTiles {
            url: url.clone(),
            max_native_zoom: *max_native_zoom,
            pane,
            zoom,
        }),
        ServiceKind::DynamicRaster { url } => Ok(EngineLayer::DynamicImage {
            url: url.clone(),
            format: map::DYNAMIC_EXPORT_FORMAT.to_string(),
            pane,
            zoom,
        }),
        ServiceKind::Custom => Err(anyhow!("Service '{}' is not a raster service", service.id)),
    }
}

/// Identifies one asynchronous layer lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerToken(u64);

/// A raster lookup the caller must resolve and hand back through `complete`
#[derive(Debug, Clone)]
pub struct PendingLayer {
    pub token: LayerToken,
    pub service: ServiceDefinition,
    pub pane: Pane,
}

/// Result of one reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub pending: Vec<PendingLayer>,
    pub errors: Vec<ReconcileError>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LayerKey {
    group: String,
    service: String,
}

/// Inputs a layer was built from; a change means the layer is replaced
#[derive(Debug, Clone, PartialEq)]
enum LayerSpec {
    Raster { service: ServiceDefinition, pane: Pane },
    Custom(EngineLayer),
}

#[derive(Debug)]
enum SlotState {
    Pending(LayerToken),
    Attached(LayerHandle, EngineLayer),
    Failed,
}

#[derive(Debug)]
struct Slot {
    spec: LayerSpec,
    state: SlotState,
    /// Position in configured group/service order
    order: usize,
}

/// Keeps the map's service layers in line with settings and data
#[derive(Debug, Default)]
pub struct LayerReconciler {
    slots: BTreeMap<LayerKey, Slot>,
    next_token: u64,
}

impl LayerReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layers currently attached by this reconciler
    pub fn attached(&self) -> Vec<LayerHandle> {
        self.slots
            .values()
            .filter_map(|slot| match slot.state {
                SlotState::Attached(handle, _) => Some(handle),
                SlotState::Pending(_) | SlotState::Failed => None,
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot.state, SlotState::Pending(_)))
            .count()
    }

    /// Run one reconciliation pass; deferred until the host has loaded
    pub fn reconcile<E: MapEngine>(
        &mut self,
        config: &MapConfiguration,
        settings: &MapSettings,
        data: &DataContext,
        host: &mut MapHost<E>,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        if !host.is_loaded() {
            debug!("Map not loaded, deferring layer reconciliation");
            return outcome;
        }

        let desired = desired_layers(config, settings, data, &mut outcome.errors);

        let stale: Vec<LayerKey> = self
            .slots
            .iter()
            .filter(|(key, slot)| !desired.iter().any(|(k, spec)| k == *key && *spec == slot.spec))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(slot) = self.slots.remove(&key) {
                debug!(group = %key.group, service = %key.service, "Removing layer");
                release(slot, host);
            }
        }

        let mut restack_from: Vec<(Option<Pane>, usize)> = Vec::new();
        for (order, (key, spec)) in desired.into_iter().enumerate() {
            if let Some(slot) = self.slots.get_mut(&key) {
                slot.order = order;
                continue;
            }
            let state = match &spec {
                LayerSpec::Custom(layer) => match host.add_layer(layer.clone()) {
                    Ok(handle) => {
                        let pane = layer.pane();
                        if !restack_from.iter().any(|(p, _)| *p == pane) {
                            restack_from.push((pane, order));
                        }
                        SlotState::Attached(handle, layer.clone())
                    }
                    Err(e) => {
                        error!(service = %key.service, error = %e, "Failed to add layer");
                        SlotState::Failed
                    }
                },
                LayerSpec::Raster { service, pane } => {
                    self.next_token += 1;
                    let token = LayerToken(self.next_token);
                    outcome.pending.push(PendingLayer {
                        token,
                        service: service.clone(),
                        pane: *pane,
                    });
                    SlotState::Pending(token)
                }
            };
            self.slots.insert(key, Slot { spec, state, order });
        }
        for (pane, order) in restack_from {
            self.restack(pane, order, host);
        }

        for e in &outcome.errors {
            error!(error = %e, "Skipping service");
        }
        outcome
    }

    /// Attach the result of a raster lookup
    /// Results for superseded tokens are discarded
    pub fn complete<E: MapEngine>(
        &mut self,
        token: LayerToken,
        result: Result<EngineLayer>,
        host: &mut MapHost<E>,
    ) -> Option<LayerHandle> {
        let Some((key, slot)) = self
            .slots
            .iter_mut()
            .find(|(_, slot)| matches!(slot.state, SlotState::Pending(t) if t == token))
        else {
            debug!(token = token.0, "Discarding superseded layer lookup");
            return None;
        };

        let layer = match result {
            Ok(layer) => layer,
            Err(source) => {
                let e = ReconcileError::Resolve {
                    service: key.service.clone(),
                    source,
                };
                error!(error = %e, "Layer lookup failed");
                slot.state = SlotState::Failed;
                return None;
            }
        };

        let pane = layer.pane();
        match host.add_layer(layer.clone()) {
            Ok(handle) => {
                info!(service = %key.service, layer = handle.layer_id().0, "Layer attached");
                slot.state = SlotState::Attached(handle, layer);
                let order = slot.order;
                self.restack(pane, order, host);
                Some(handle)
            }
            Err(e) => {
                error!(service = %key.service, error = %e, "Failed to add layer");
                slot.state = SlotState::Failed;
                None
            }
        }
    }

    /// Resolve every pending lookup of a pass and attach the results
    pub async fn resolve_pending<R: LayerResolver, E: MapEngine>(
        &mut self,
        resolver: &R,
        pending: Vec<PendingLayer>,
        host: &mut MapHost<E>,
    ) {
        for request in pending {
            let result = resolver.resolve(&request.service, request.pane).await;
            self.complete(request.token, result, host);
        }
    }

    /// Reconcile and resolve in one step
    pub async fn sync<R: LayerResolver, E: MapEngine>(
        &mut self,
        resolver: &R,
        config: &MapConfiguration,
        settings: &MapSettings,
        data: &DataContext,
        host: &mut MapHost<E>,
    ) -> Vec<ReconcileError> {
        let outcome = self.reconcile(config, settings, data, host);
        self.resolve_pending(resolver, outcome.pending, host).await;
        outcome.errors
    }

    /// Re-add attached layers configured above `order` in `pane`
    /// New layers land on top of their pane, so later siblings are moved back above them
    fn restack<E: MapEngine>(&mut self, pane: Option<Pane>, order: usize, host: &mut MapHost<E>) {
        let mut above: Vec<&mut Slot> = self
            .slots
            .values_mut()
            .filter(|slot| slot.order > order)
            .filter(|slot| matches!(&slot.state, SlotState::Attached(_, layer) if layer.pane() == pane))
            .collect();
        if above.is_empty() {
            return;
        }
        above.sort_by_key(|slot| slot.order);
        debug!(count = above.len(), ?pane, "Restacking layers");

        for slot in above {
            let (handle, layer) = match &slot.state {
                SlotState::Attached(handle, layer) => (*handle, layer.clone()),
                SlotState::Pending(_) | SlotState::Failed => continue,
            };
            if let Err(e) = host.remove_layer(handle) {
                warn!(layer = handle.layer_id().0, error = %e, "Failed to remove layer");
            }
            slot.state = match host.add_layer(layer.clone()) {
                Ok(handle) => SlotState::Attached(handle, layer),
                Err(e) => {
                    error!(error = %e, "Failed to re-add layer");
                    SlotState::Failed
                }
            };
        }
    }

    /// Remove every layer this reconciler attached
    pub fn teardown<E: MapEngine>(&mut self, host: &mut MapHost<E>) {
        let count = self.slots.len();
        for (_, slot) in std::mem::take(&mut self.slots) {
            release(slot, host);
        }
        if count > 0 {
            debug!(count, "Layer reconciler torn down");
        }
    }
}

fn release<E: MapEngine>(slot: Slot, host: &mut MapHost<E>) {
    if let SlotState::Attached(handle, _) = slot.state {
        if let Err(e) = host.remove_layer(handle) {
            warn!(layer = handle.layer_id().0, error = %e, "Failed to remove layer");
        }
    }
}

/// Desired layers in configured order
fn desired_layers(
    config: &MapConfiguration,
    settings: &MapSettings,
    data: &DataContext,
    errors: &mut Vec<ReconcileError>,
) -> Vec<(LayerKey, LayerSpec)> {
    let mut desired = Vec::new();
    for group in &config.service_groups {
        let pane = Pane::for_group(group.is_basemap_group);
        for service_id in &group.services {
            if !settings.is_visible(service_id) {
                continue;
            }
            let Some(service) = config.service(service_id) else {
                errors.push(ReconcileError::MissingService {
                    group: group.id.clone(),
                    service: service_id.clone(),
                });
                continue;
            };

            let spec = if service.is_custom() {
                match custom_layer(&service.id, pane, data) {
                    Ok(Some(layer)) => LayerSpec::Custom(layer),
                    Ok(None) => continue,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                }
            } else {
                LayerSpec::Raster {
                    service: service.clone(),
                    pane,
                }
            };

            let key = LayerKey {
                group: group.id.clone(),
                service: service_id.clone(),
            };
            desired.push((key, spec));
        }
    }
    desired
}

/// Bespoke vector layer for a custom service; `None` when there is nothing to draw
fn custom_layer(service_id: &str, pane: Pane, data: &DataContext) -> Result<Option<EngineLayer>, ReconcileError> {
    if service_id == services::DISTRICTS {
        return Ok(data.selected_district().map(|district| EngineLayer::Geometry {
            geojson: district.shape.clone(),
            pane,
        }));
    }

    let Some(kind) = FeatureKind::from_service_id(service_id) else {
        return Err(ReconcileError::UnsupportedCustomService(service_id.to_string()));
    };
    let icon = kind.icon();
    let markers = data
        .features(kind)
        .iter()
        .map(|feature| Marker {
            position: feature.geometry.lat_lng(),
            icon,
        })
        .collect();
    Ok(Some(EngineLayer::MarkerGroup { markers, pane }))
}
