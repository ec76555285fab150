//! Per-map view position persistence
//!
//! Restores the stored center/zoom once on mount and writes the current
//! view back on every move end. There is no debouncing.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::engine::{MapEngine, MapEvent};
use crate::host::{Delivery, HostError, ListenerId, MapHost};
use crate::storage::{Storage, map_position_key};
use crate::types::MapView;

/// Marks one restore attempt; results for an outdated ticket are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreTicket(u64);

pub struct ViewPersistence {
    key: String,
    listener: Option<ListenerId>,
    epoch: u64,
}

impl ViewPersistence {
    pub fn new(map_id: &str) -> Self {
        Self {
            key: map_position_key(map_id),
            listener: None,
            epoch: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_mounted(&self) -> bool {
        self.listener.is_some()
    }

    /// Subscribe to move-end events and start a restore
    pub fn mount<E: MapEngine>(&mut self, host: &mut MapHost<E>) -> Result<RestoreTicket, HostError> {
        if let Some(listener) = self.listener.take() {
            host.unsubscribe(listener);
        }
        self.listener = Some(host.subscribe(MapEvent::MoveEnd)?);
        self.epoch += 1;
        Ok(RestoreTicket(self.epoch))
    }

    /// Read the stored view; missing, unreadable or malformed values read as none
    pub async fn read<S: Storage>(&self, storage: &S) -> Option<MapView> {
        let stored = match storage.get(&self.key).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(key = %self.key, error = ?e, "Failed to read map position");
                return None;
            }
        };
        match serde_json::from_str::<MapView>(&stored) {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Stored map position is malformed");
                None
            }
        }
    }

    /// Apply a restored view unless the restore was superseded
    pub fn finish_restore<E: MapEngine>(
        &self,
        ticket: RestoreTicket,
        view: Option<MapView>,
        host: &mut MapHost<E>,
    ) -> bool {
        if ticket.0 != self.epoch || self.listener.is_none() {
            debug!(key = %self.key, "Discarding superseded map position restore");
            return false;
        }
        let Some(view) = view else {
            return false;
        };
        info!(key = %self.key, ?view, "Restoring map position");
        host.set_view(view);
        true
    }

    /// Mount and restore in one step
    pub async fn restore<S: Storage, E: MapEngine>(&mut self, storage: &S, host: &mut MapHost<E>) -> Result<bool, HostError> {
        let ticket = self.mount(host)?;
        let view = self.read(storage).await;
        Ok(self.finish_restore(ticket, view, host))
    }

    pub fn handles(&self, delivery: &Delivery) -> bool {
        self.listener == Some(delivery.listener)
    }

    /// Serialized current view, to be written after a move end
    pub fn snapshot<E: MapEngine>(&self, host: &MapHost<E>) -> Result<Option<String>> {
        let Some(view) = host.view() else {
            return Ok(None);
        };
        let json = serde_json::to_string(&view).context("Failed to serialize map position")?;
        Ok(Some(json))
    }

    /// Write the current view
    pub async fn persist<S: Storage, E: MapEngine>(&self, storage: &S, host: &MapHost<E>) -> Result<()> {
        let Some(json) = self.snapshot(host)? else {
            return Ok(());
        };
        storage
            .set(&self.key, &json)
            .await
            .with_context(|| format!("Failed to save map position under '{}'", self.key))
    }

    /// Drop the move-end listener; in-flight restores are discarded
    pub fn unmount<E: MapEngine>(&mut self, host: &mut MapHost<E>) {
        if let Some(listener) = self.listener.take() {
            host.unsubscribe(listener);
        }
        self.epoch += 1;
    }
}
