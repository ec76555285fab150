//! Map settings: which services are visible
//!
//! The store starts in `Loading`, becomes `Loaded` once persisted settings
//! (or configuration defaults) arrive, and from then on reduces toggle
//! actions according to the owning group's selection mode. Every change
//! of the loaded settings is written back to storage.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{DataContext, MapConfiguration, SelectionMode, ServiceGroup};
use crate::constants::services;
use crate::constants::storage::MAP_SETTINGS_KEY;
use crate::storage::Storage;

/// The persisted settings entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSettings {
    pub visible_service_ids: Vec<String>,
}

impl MapSettings {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            visible_service_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_visible(&self, service_id: &str) -> bool {
        self.visible_service_ids.iter().any(|id| id == service_id)
    }

    /// Settings with one group toggled per its selection mode
    /// A service that is not in the group leaves the settings unchanged
    pub fn toggled(&self, group: &ServiceGroup, service_id: &str) -> MapSettings {
        if !group.contains(service_id) {
            return self.clone();
        }

        let outside_group = || {
            self.visible_service_ids
                .iter()
                .filter(|id| !group.contains(id))
                .cloned()
                .collect::<Vec<_>>()
        };

        let visible_service_ids = match group.mode() {
            SelectionMode::Single => {
                let mut ids = outside_group();
                ids.push(service_id.to_string());
                ids
            }
            SelectionMode::SingleCheckable => {
                let mut ids = outside_group();
                if !self.is_visible(service_id) {
                    ids.push(service_id.to_string());
                }
                ids
            }
            SelectionMode::Multiple => {
                if self.is_visible(service_id) {
                    self.visible_service_ids
                        .iter()
                        .filter(|id| id.as_str() != service_id)
                        .cloned()
                        .collect()
                } else {
                    let mut ids = self.visible_service_ids.clone();
                    ids.push(service_id.to_string());
                    ids
                }
            }
        };

        MapSettings { visible_service_ids }
    }
}

/// Default settings derived from configuration
pub fn default_settings(config: &MapConfiguration) -> MapSettings {
    let visible_service_ids = config
        .service_groups
        .iter()
        .flat_map(|group| group.selection.defaults())
        .map(str::to_string)
        .collect();
    MapSettings { visible_service_ids }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsState {
    Loading,
    Loaded(MapSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsAction {
    LoadingSuccess(MapSettings),
    ToggleService { group_id: String, service_id: String },
}

/// Pure reducer over (state, action)
pub fn reduce(state: &SettingsState, action: &SettingsAction, config: &MapConfiguration) -> SettingsState {
    match (state, action) {
        (SettingsState::Loading, SettingsAction::LoadingSuccess(settings)) => SettingsState::Loaded(settings.clone()),
        (SettingsState::Loaded(settings), SettingsAction::ToggleService { group_id, service_id }) => {
            match config.group(group_id) {
                Some(group) => SettingsState::Loaded(settings.toggled(group, service_id)),
                None => {
                    debug!(group = %group_id, "Toggle for unknown service group ignored");
                    state.clone()
                }
            }
        }
        (SettingsState::Loading, SettingsAction::ToggleService { .. })
        | (SettingsState::Loaded(_), SettingsAction::LoadingSuccess(_)) => state.clone(),
    }
}

/// Settings store for the lifetime of one map-settings scope
pub struct SettingsStore {
    state: SettingsState,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self { state: SettingsState::Loading }
    }
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SettingsState {
        &self.state
    }

    pub fn settings(&self) -> Option<&MapSettings> {
        match &self.state {
            SettingsState::Loaded(settings) => Some(settings),
            SettingsState::Loading => None,
        }
    }

    /// Apply an action; returns true when the state changed
    pub fn dispatch(&mut self, action: SettingsAction, config: &MapConfiguration) -> bool {
        let next = reduce(&self.state, &action, config);
        if next == self.state {
            return false;
        }
        debug!(?action, "Map settings changed");
        self.state = next;
        true
    }

    pub fn toggle(&mut self, group_id: &str, service_id: &str, config: &MapConfiguration) -> bool {
        self.dispatch(
            SettingsAction::ToggleService {
                group_id: group_id.to_string(),
                service_id: service_id.to_string(),
            },
            config,
        )
    }

    /// Restore persisted settings, falling back to configuration defaults
    /// Missing, unreadable and malformed values all count as "no prior value"
    pub async fn load<S: Storage>(&mut self, storage: &S, config: &MapConfiguration) {
        if self.state != SettingsState::Loading {
            return;
        }

        let stored = match storage.get(MAP_SETTINGS_KEY).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = ?e, "Failed to read map settings, using defaults");
                None
            }
        };

        let settings = match stored.as_deref().map(serde_json::from_str::<MapSettings>) {
            Some(Ok(settings)) => {
                info!(visible = settings.visible_service_ids.len(), "Restored map settings");
                settings
            }
            Some(Err(e)) => {
                warn!(error = %e, "Stored map settings are malformed, using defaults");
                default_settings(config)
            }
            None => default_settings(config),
        };

        self.dispatch(SettingsAction::LoadingSuccess(settings), config);
    }

    /// Write the loaded settings to storage
    pub async fn persist<S: Storage>(&self, storage: &S) -> Result<()> {
        let Some(settings) = self.settings() else {
            return Ok(());
        };
        let value = serde_json::to_string(settings).context("Failed to serialize map settings")?;
        storage
            .set(MAP_SETTINGS_KEY, &value)
            .await
            .context("Failed to save map settings")
    }
}

/// Control used to present a service in the settings menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Radio,
    Checkbox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MenuItem {
    pub service_id: String,
    pub title: String,
    pub thumbnail: String,
    pub checked: bool,
    pub control: Control,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MenuGroup {
    pub group_id: String,
    pub title: String,
    pub items: Vec<MenuItem>,
}

/// Settings menu: every group with its services and their checked state
pub fn menu(config: &MapConfiguration, settings: &MapSettings, data: &DataContext) -> Vec<MenuGroup> {
    config
        .service_groups
        .iter()
        .map(|group| {
            let control = match group.mode() {
                SelectionMode::Single => Control::Radio,
                SelectionMode::SingleCheckable | SelectionMode::Multiple => Control::Checkbox,
            };

            let items = group
                .services
                .iter()
                .filter_map(|service_id| {
                    let Some(service) = config.service(service_id) else {
                        error!(group = %group.id, service = %service_id, "Missing service for service group");
                        return None;
                    };
                    // No districts to show
                    if service.id == services::DISTRICTS && data.districts.is_empty() {
                        return None;
                    }
                    Some(MenuItem {
                        service_id: service.id.clone(),
                        title: service.title.clone(),
                        thumbnail: service.thumbnail.clone(),
                        checked: settings.is_visible(service_id),
                        control,
                    })
                })
                .collect();

            MenuGroup {
                group_id: group.id.clone(),
                title: group.title.clone(),
                items,
            }
        })
        .collect()
}
