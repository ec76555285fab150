//! Scale bar
//!
//! Measures the ground distance spanned by `max_width` pixels across the
//! vertical center of the map, rounds it down to a nice number and sizes the
//! bar to match. Recomputed on mount and on every zoom event.

use tracing::debug;

use crate::constants::scale::{DEFAULT_MAX_WIDTH, KILOMETER_THRESHOLD};
use crate::engine::{MapEngine, MapEvent};
use crate::host::{Delivery, HostError, ListenerId, MapHost};

/// Largest 1/2/3/5 x 10^n value that does not exceed `value`
/// Returns 0 for non-positive or non-finite input
pub fn round_down_nice(value: f64) -> f64 {
    if !value.is_finite() || value <= 0.0 {
        return 0.0;
    }

    let mut magnitude = 1.0;
    while magnitude * 10.0 <= value {
        magnitude *= 10.0;
    }
    while magnitude > value {
        magnitude /= 10.0;
    }

    [10.0, 5.0, 3.0, 2.0]
        .into_iter()
        .map(|step| magnitude * step)
        .find(|nice| *nice <= value)
        .unwrap_or(magnitude)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScaleState {
    pub label: String,
    /// Bar width in pixels
    pub width: u32,
}

impl ScaleState {
    /// Scale for a measured distance over `max_width` pixels
    pub fn measure(max_meters: f64, max_width: f64) -> Self {
        let meters = round_down_nice(max_meters);
        if meters <= 0.0 {
            return Self::default();
        }
        let label = if meters < KILOMETER_THRESHOLD {
            format!("{} m", meters)
        } else {
            format!("{} km", meters / 1000.0)
        };
        let width = (max_width * meters / max_meters).round() as u32;
        Self { label, width }
    }
}

pub struct ScaleBar {
    max_width: f64,
    listener: Option<ListenerId>,
    state: ScaleState,
}

impl Default for ScaleBar {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WIDTH)
    }
}

impl ScaleBar {
    pub fn new(max_width: f64) -> Self {
        Self {
            max_width,
            listener: None,
            state: ScaleState::default(),
        }
    }

    pub fn state(&self) -> &ScaleState {
        &self.state
    }

    pub fn mount<E: MapEngine>(&mut self, host: &mut MapHost<E>) -> Result<(), HostError> {
        if self.listener.is_none() {
            self.listener = Some(host.subscribe(MapEvent::Zoom)?);
        }
        self.update(host);
        Ok(())
    }

    pub fn handles(&self, delivery: &Delivery) -> bool {
        self.listener == Some(delivery.listener)
    }

    pub fn update<E: MapEngine>(&mut self, host: &MapHost<E>) -> &ScaleState {
        let max_meters = host.meters_across(self.max_width);
        self.state = ScaleState::measure(max_meters, self.max_width);
        debug!(label = %self.state.label, width = self.state.width, "Scale updated");
        &self.state
    }

    pub fn unmount<E: MapEngine>(&mut self, host: &mut MapHost<E>) {
        if let Some(listener) = self.listener.take() {
            host.unsubscribe(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfiguration;
    use crate::engine::HeadlessEngine;
    use crate::types::{LatLng, MapView};
    use proptest::prelude::*;

    #[test]
    fn test_round_down_nice_examples() {
        assert_eq!(round_down_nice(1.0), 1.0);
        assert_eq!(round_down_nice(1.9), 1.0);
        assert_eq!(round_down_nice(2.5), 2.0);
        assert_eq!(round_down_nice(4.99), 3.0);
        assert_eq!(round_down_nice(7.0), 5.0);
        assert_eq!(round_down_nice(10.0), 10.0);
        assert_eq!(round_down_nice(999.0), 500.0);
        assert_eq!(round_down_nice(1234.5), 1000.0);
        assert_eq!(round_down_nice(0.0), 0.0);
        assert_eq!(round_down_nice(-5.0), 0.0);
        assert!(round_down_nice(0.5) <= 0.5);
    }

    #[test]
    fn test_labels_switch_to_kilometers() {
        let scale = ScaleState::measure(740.0, 100.0);
        assert_eq!(scale.label, "500 m");
        assert_eq!(scale.width, 68);

        let scale = ScaleState::measure(2600.0, 100.0);
        assert_eq!(scale.label, "2 km");
        assert_eq!(scale.width, 77);
    }

    #[test]
    fn test_scale_bar_follows_zoom() {
        let config = MapConfiguration::builtin().unwrap();
        let mut host = MapHost::<HeadlessEngine>::create("map", &config, None).unwrap();
        host.dispatch();

        let mut bar = ScaleBar::default();
        bar.mount(&mut host).unwrap();
        let zoomed_out = bar.state().clone();
        assert!(!zoomed_out.label.is_empty());

        host.engine_mut().user_move(MapView::new(LatLng::new(56.88, 24.6), 15));
        let deliveries = host.dispatch();
        assert_eq!(deliveries.iter().filter(|d| bar.handles(d)).count(), 1);
        bar.update(&host);
        assert_ne!(bar.state(), &zoomed_out);
        assert!(bar.state().width <= 100);

        bar.unmount(&mut host);
        host.engine_mut().user_move(MapView::new(LatLng::new(56.88, 24.6), 10));
        assert!(host.dispatch().iter().all(|d| !bar.handles(d)));
    }

    proptest! {
        #[test]
        fn prop_nice_number_is_largest_not_exceeding(value in 0.001f64..1.0e7) {
            let nice = round_down_nice(value);
            prop_assert!(nice <= value);
            prop_assert!(nice > 0.0);

            // No larger nice number fits below the input
            let mut magnitude = 1.0e-4;
            while magnitude <= value {
                for step in [1.0, 2.0, 3.0, 5.0] {
                    let candidate = magnitude * step;
                    if candidate <= value {
                        prop_assert!(candidate <= nice * (1.0 + 1e-9), "{} > {} for {}", candidate, nice, value);
                    }
                }
                magnitude *= 10.0;
            }
        }
    }
}
