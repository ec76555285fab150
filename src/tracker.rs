//! Live position tracking
//!
//! [`reduce`] is the pure state machine. [`PositionTracker`] owns the side
//! effects that are bound to the current state rather than to actions:
//!
//! - a sensor watch exists while loading, active or in the background
//! - an accuracy circle and marker are drawn while a position is held
//! - while active the view follows the position and a move-start
//!   listener sends the tracker to the background on user pans
//!
//! Effects are synchronized after every transition, teardown first.

use std::fmt;
use tracing::{debug, error, info, warn};

use crate::constants::{icons, tracking};
use crate::engine::{CircleStyle, EngineLayer, MapEngine, MapEvent, Marker};
use crate::geolocation::{Geolocation, PositionError, SensorReading, SensorSink, WatchId, WatchOptions};
use crate::host::{Delivery, LayerHandle, ListenerId, MapHost};
use crate::types::{MapView, PositionSample};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackingState {
    Idle,
    Loading,
    Active(PositionSample),
    Background(PositionSample),
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackingAction {
    Toggle,
    PositionSuccess(PositionSample),
    PositionFailure,
    MapMove,
    Reset,
}

/// State name without the held position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Idle,
    Loading,
    Active,
    Background,
    Error,
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackingStatus::Idle => "idle",
            TrackingStatus::Loading => "loading",
            TrackingStatus::Active => "active",
            TrackingStatus::Background => "background",
            TrackingStatus::Error => "error",
        };
        f.write_str(name)
    }
}

impl TrackingState {
    pub fn status(&self) -> TrackingStatus {
        match self {
            TrackingState::Idle => TrackingStatus::Idle,
            TrackingState::Loading => TrackingStatus::Loading,
            TrackingState::Active(_) => TrackingStatus::Active,
            TrackingState::Background(_) => TrackingStatus::Background,
            TrackingState::Error => TrackingStatus::Error,
        }
    }

    pub fn sample(&self) -> Option<PositionSample> {
        match self {
            TrackingState::Active(sample) | TrackingState::Background(sample) => Some(*sample),
            TrackingState::Idle | TrackingState::Loading | TrackingState::Error => None,
        }
    }

    /// True for states that keep a sensor watch open
    pub fn is_watching(&self) -> bool {
        matches!(
            self,
            TrackingState::Loading | TrackingState::Active(_) | TrackingState::Background(_)
        )
    }
}

impl fmt::Display for TrackingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sample() {
            Some(sample) => write!(
                f,
                "{} ({:.5}, {:.5} ±{:.0} m)",
                self.status(),
                sample.position.lat,
                sample.position.lng,
                sample.accuracy
            ),
            None => write!(f, "{}", self.status()),
        }
    }
}

/// Tracking transition table; pairs without a transition return the state unchanged
pub fn reduce(state: TrackingState, action: TrackingAction) -> TrackingState {
    use TrackingAction::*;
    use TrackingState::*;

    match (state, action) {
        (Idle, Toggle) => Loading,
        (Loading, Toggle) => Idle,
        (Active(_), Toggle) => Idle,
        (Background(sample), Toggle) => Active(sample),
        (Error, Toggle) => Loading,

        (Loading, PositionSuccess(sample)) => Active(sample),
        (Active(_), PositionSuccess(sample)) => Active(sample),
        (Background(_), PositionSuccess(sample)) => Background(sample),
        (Idle | Error, PositionSuccess(_)) => state,

        (Loading, PositionFailure) => Error,
        // A late sensor error does not interrupt an established session
        (Idle | Active(_) | Background(_) | Error, PositionFailure) => state,

        (Active(sample), MapMove) => Background(sample),
        (Idle | Loading | Background(_) | Error, MapMove) => state,

        (Error, Reset) => Idle,
        (Idle | Loading | Active(_) | Background(_), Reset) => state,
    }
}

struct Overlay {
    sample: PositionSample,
    circle: Option<LayerHandle>,
    marker: Option<LayerHandle>,
}

/// Drives the sensor watch and map overlay from the tracking state
pub struct PositionTracker {
    state: TrackingState,
    sink: SensorSink,
    watch: Option<WatchId>,
    overlay: Option<Overlay>,
    move_listener: Option<ListenerId>,
    last_error: Option<PositionError>,
}

impl PositionTracker {
    /// Readings from watches started by this tracker are sent to `sink`
    pub fn new(sink: SensorSink) -> Self {
        Self {
            state: TrackingState::Idle,
            sink,
            watch: None,
            overlay: None,
            move_listener: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn status(&self) -> TrackingStatus {
        self.state.status()
    }

    pub fn watch(&self) -> Option<WatchId> {
        self.watch
    }

    /// Error shown while in the error state; dismissed by `reset`
    pub fn error(&self) -> Option<&PositionError> {
        self.last_error.as_ref()
    }

    /// Layers drawn for the current position
    pub fn overlay_layers(&self) -> Vec<LayerHandle> {
        self.overlay
            .iter()
            .flat_map(|overlay| overlay.circle.into_iter().chain(overlay.marker))
            .collect()
    }

    pub fn has_move_listener(&self) -> bool {
        self.move_listener.is_some()
    }

    pub fn toggle<G: Geolocation, E: MapEngine>(&mut self, geo: &mut G, host: &mut MapHost<E>) -> TrackingState {
        self.apply(TrackingAction::Toggle, geo, host)
    }

    pub fn reset<G: Geolocation, E: MapEngine>(&mut self, geo: &mut G, host: &mut MapHost<E>) -> TrackingState {
        self.apply(TrackingAction::Reset, geo, host)
    }

    /// Whether a host event delivery belongs to this tracker
    pub fn handles(&self, delivery: &Delivery) -> bool {
        self.move_listener == Some(delivery.listener)
    }

    pub fn on_map_move<G: Geolocation, E: MapEngine>(&mut self, geo: &mut G, host: &mut MapHost<E>) -> TrackingState {
        self.apply(TrackingAction::MapMove, geo, host)
    }

    /// Feed a sensor reading; readings from other watches are ignored
    pub fn on_reading<G: Geolocation, E: MapEngine>(
        &mut self,
        reading: SensorReading,
        geo: &mut G,
        host: &mut MapHost<E>,
    ) -> TrackingState {
        if self.watch != Some(reading.watch) {
            debug!(watch = reading.watch.0, "Ignoring reading from a cleared watch");
            return self.state;
        }
        match reading.result {
            Ok(sample) => self.apply(TrackingAction::PositionSuccess(sample), geo, host),
            Err(e) => {
                error!(error = %e, "Failed to watch position");
                self.fail(e, geo, host)
            }
        }
    }

    /// Apply an action and bring the effects in line with the new state
    pub fn apply<G: Geolocation, E: MapEngine>(
        &mut self,
        action: TrackingAction,
        geo: &mut G,
        host: &mut MapHost<E>,
    ) -> TrackingState {
        let previous = self.state;
        let next = reduce(previous, action);
        if next == previous {
            return next;
        }

        if previous.status() != next.status() {
            info!(from = %previous.status(), to = %next.status(), "Tracking state changed");
        }
        if next.status() != TrackingStatus::Error {
            self.last_error = None;
        }
        self.state = next;
        self.sync_effects(previous, geo, host);
        self.state
    }

    fn fail<G: Geolocation, E: MapEngine>(
        &mut self,
        e: PositionError,
        geo: &mut G,
        host: &mut MapHost<E>,
    ) -> TrackingState {
        let state = self.apply(TrackingAction::PositionFailure, geo, host);
        if state == TrackingState::Error {
            self.last_error = Some(e);
        }
        state
    }

    fn sync_effects<G: Geolocation, E: MapEngine>(
        &mut self,
        previous: TrackingState,
        geo: &mut G,
        host: &mut MapHost<E>,
    ) {
        let next = self.state;
        let active = matches!(next, TrackingState::Active(_));

        // Teardown, reverse of setup order
        if !active {
            if let Some(listener) = self.move_listener.take() {
                host.unsubscribe(listener);
            }
        }
        if self.overlay.as_ref().map(|o| o.sample) != next.sample() {
            self.clear_overlay(host);
        }
        if !next.is_watching() {
            if let Some(watch) = self.watch.take() {
                geo.clear_watch(watch);
            }
        }

        // Setup
        if next.is_watching() && self.watch.is_none() {
            match geo.watch_position(&WatchOptions::tracking(), self.sink.clone()) {
                Ok(watch) => {
                    debug!(watch = watch.0, "Position watch started");
                    self.watch = Some(watch);
                }
                Err(e) => {
                    error!(error = %e, "Failed to start position watch");
                    self.fail(e, geo, host);
                    return;
                }
            }
        }

        if let Some(sample) = next.sample() {
            if self.overlay.is_none() {
                self.draw_overlay(sample, host);
            }
        }

        if let TrackingState::Active(sample) = next {
            if previous != next {
                let zoom = host
                    .view()
                    .map_or(tracking::MIN_RECENTER_ZOOM, |view| view.zoom.max(tracking::MIN_RECENTER_ZOOM));
                host.set_view_quiet(MapView::new(sample.position, zoom));
            }
            if self.move_listener.is_none() {
                match host.subscribe(MapEvent::MoveStart) {
                    Ok(listener) => self.move_listener = Some(listener),
                    Err(e) => warn!(error = %e, "Cannot listen for map moves"),
                }
            }
        }
    }

    fn draw_overlay<E: MapEngine>(&mut self, sample: PositionSample, host: &mut MapHost<E>) {
        let circle = EngineLayer::Circle {
            center: sample.position,
            radius: sample.accuracy,
            style: CircleStyle {
                fill_color: tracking::ACCURACY_FILL,
                opacity: tracking::ACCURACY_OPACITY,
                stroke: false,
            },
        };
        let marker = EngineLayer::Marker(Marker {
            position: sample.position,
            icon: icons::LOCATION_PIN,
        });

        let mut add = |layer| match host.add_layer(layer) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Cannot draw tracked position");
                None
            }
        };
        let circle = add(circle);
        let marker = add(marker);
        self.overlay = Some(Overlay { sample, circle, marker });
    }

    fn clear_overlay<E: MapEngine>(&mut self, host: &mut MapHost<E>) {
        let Some(overlay) = self.overlay.take() else {
            return;
        };
        for handle in overlay.circle.into_iter().chain(overlay.marker) {
            if let Err(e) = host.remove_layer(handle) {
                debug!(error = %e, "Tracked position layer already gone");
            }
        }
    }

    /// Release every effect and return to idle
    pub fn teardown<G: Geolocation, E: MapEngine>(&mut self, geo: &mut G, host: &mut MapHost<E>) {
        if let Some(listener) = self.move_listener.take() {
            host.unsubscribe(listener);
        }
        self.clear_overlay(host);
        if let Some(watch) = self.watch.take() {
            geo.clear_watch(watch);
        }
        self.state = TrackingState::Idle;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfiguration;
    use crate::engine::HeadlessEngine;
    use crate::geolocation::SimulatedGeolocation;
    use crate::types::LatLng;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    const FIX: PositionSample = PositionSample::new(56.95, 24.1, 15.0);
    const OTHER_FIX: PositionSample = PositionSample::new(56.96, 24.12, 8.0);

    struct Rig {
        tracker: PositionTracker,
        geo: SimulatedGeolocation,
        host: MapHost<HeadlessEngine>,
        readings: mpsc::UnboundedReceiver<SensorReading>,
    }

    impl Rig {
        fn new() -> Self {
            let config = MapConfiguration::builtin().unwrap();
            let mut host = MapHost::create("map", &config, None).unwrap();
            host.dispatch();
            let (tx, readings) = mpsc::unbounded_channel();
            Self {
                tracker: PositionTracker::new(tx),
                geo: SimulatedGeolocation::new(),
                host,
                readings,
            }
        }

        fn toggle(&mut self) -> TrackingState {
            self.tracker.toggle(&mut self.geo, &mut self.host)
        }

        fn reset(&mut self) -> TrackingState {
            self.tracker.reset(&mut self.geo, &mut self.host)
        }

        /// Emit from the sensor and deliver everything queued
        fn sense(&mut self, result: Result<PositionSample, PositionError>) -> TrackingState {
            self.geo.emit(result);
            while let Ok(reading) = self.readings.try_recv() {
                self.tracker.on_reading(reading, &mut self.geo, &mut self.host);
            }
            self.tracker.state()
        }

        /// Route map events to the tracker
        fn route(&mut self) -> TrackingState {
            for delivery in self.host.dispatch() {
                if self.tracker.handles(&delivery) {
                    self.tracker.on_map_move(&mut self.geo, &mut self.host);
                }
            }
            self.tracker.state()
        }

        fn pan(&mut self) -> TrackingState {
            let view = self.host.view().unwrap();
            let lat = if view.center.lat > 57.0 { view.center.lat - 0.05 } else { view.center.lat + 0.05 };
            self.host.engine_mut().user_move(MapView::new(LatLng::new(lat, view.center.lng), view.zoom));
            self.route()
        }
    }

    #[test]
    fn test_transition_table() {
        use TrackingAction::*;
        use TrackingState::*;

        let cases = [
            (Idle, Toggle, Loading),
            (Idle, PositionSuccess(FIX), Idle),
            (Idle, PositionFailure, Idle),
            (Idle, MapMove, Idle),
            (Idle, Reset, Idle),
            (Loading, Toggle, Idle),
            (Loading, PositionSuccess(FIX), Active(FIX)),
            (Loading, PositionFailure, Error),
            (Loading, MapMove, Loading),
            (Loading, Reset, Loading),
            (Active(FIX), Toggle, Idle),
            (Active(FIX), PositionSuccess(OTHER_FIX), Active(OTHER_FIX)),
            (Active(FIX), PositionFailure, Active(FIX)),
            (Active(FIX), MapMove, Background(FIX)),
            (Active(FIX), Reset, Active(FIX)),
            (Background(FIX), Toggle, Active(FIX)),
            (Background(FIX), PositionSuccess(OTHER_FIX), Background(OTHER_FIX)),
            (Background(FIX), PositionFailure, Background(FIX)),
            (Background(FIX), MapMove, Background(FIX)),
            (Background(FIX), Reset, Background(FIX)),
            (Error, Toggle, Loading),
            (Error, PositionSuccess(FIX), Error),
            (Error, PositionFailure, Error),
            (Error, MapMove, Error),
            (Error, Reset, Idle),
        ];

        for (state, action, expected) in cases {
            assert_eq!(reduce(state, action), expected, "{state:?} + {action:?}");
        }
    }

    #[test]
    fn test_toggle_on_then_fix_then_pan_then_resume() {
        let mut rig = Rig::new();

        assert_eq!(rig.toggle(), TrackingState::Loading);
        assert_eq!(rig.sense(Ok(FIX)), TrackingState::Active(FIX));
        assert_eq!(rig.pan(), TrackingState::Background(FIX));
        assert_eq!(rig.toggle(), TrackingState::Active(FIX));
    }

    #[test]
    fn test_failure_while_loading_then_reset() {
        let mut rig = Rig::new();

        rig.toggle();
        assert_eq!(rig.sense(Err(PositionError::PermissionDenied)), TrackingState::Error);
        assert_eq!(rig.tracker.error(), Some(&PositionError::PermissionDenied));
        assert!(rig.geo.live_watches().is_empty());

        assert_eq!(rig.reset(), TrackingState::Idle);
        assert!(rig.tracker.error().is_none());
    }

    #[test]
    fn test_failure_while_active_is_swallowed() {
        let mut rig = Rig::new();
        rig.toggle();
        rig.sense(Ok(FIX));

        assert_eq!(rig.sense(Err(PositionError::Timeout)), TrackingState::Active(FIX));
        assert_eq!(rig.geo.live_watches().len(), 1);
        assert!(rig.tracker.error().is_none());
    }

    #[test]
    fn test_failure_while_background_is_swallowed() {
        let mut rig = Rig::new();
        rig.toggle();
        rig.sense(Ok(FIX));
        assert_eq!(rig.pan(), TrackingState::Background(FIX));
        let watch = rig.tracker.watch();
        let overlay = rig.tracker.overlay_layers();
        assert_eq!(overlay.len(), 2);
        let view = rig.host.view();

        assert_eq!(rig.sense(Err(PositionError::Timeout)), TrackingState::Background(FIX));
        assert_eq!(rig.tracker.watch(), watch);
        assert_eq!(rig.geo.live_watches().len(), 1);
        assert_eq!(rig.tracker.overlay_layers(), overlay);
        assert!(overlay.iter().all(|layer| rig.host.owns(*layer)));
        assert!(rig.tracker.error().is_none());
        assert!(!rig.tracker.has_move_listener());
        assert_eq!(rig.host.view(), view);
    }

    #[test]
    fn test_single_watch_for_whole_session() {
        let mut rig = Rig::new();
        rig.toggle();
        let watch = rig.tracker.watch();
        assert!(watch.is_some());

        rig.sense(Ok(FIX));
        rig.pan();
        rig.sense(Ok(OTHER_FIX));
        rig.toggle();
        assert_eq!(rig.tracker.watch(), watch);
        assert_eq!(rig.geo.created_watches(), 1);

        rig.toggle();
        assert!(rig.tracker.watch().is_none());
        assert!(rig.geo.live_watches().is_empty());
    }

    #[test]
    fn test_reading_from_cleared_watch_is_ignored() {
        let mut rig = Rig::new();
        rig.toggle();
        let old = rig.tracker.watch().unwrap();
        rig.toggle();
        rig.toggle();

        let stale = SensorReading { watch: old, result: Ok(FIX) };
        let state = rig.tracker.on_reading(stale, &mut rig.geo, &mut rig.host);
        assert_eq!(state, TrackingState::Loading);
    }

    #[test]
    fn test_overlay_follows_position() {
        let mut rig = Rig::new();
        rig.toggle();
        assert!(rig.tracker.overlay_layers().is_empty());

        rig.sense(Ok(FIX));
        let first = rig.tracker.overlay_layers();
        assert_eq!(first.len(), 2);
        assert_eq!(rig.host.layer_count(), 2);

        rig.sense(Ok(OTHER_FIX));
        let second = rig.tracker.overlay_layers();
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|handle| !rig.host.owns(*handle)));
        assert_eq!(rig.host.layer_count(), 2);

        let circle = rig.host.engine().layer(second[0].layer_id()).unwrap();
        assert!(matches!(
            circle,
            EngineLayer::Circle { radius, style, .. } if *radius == 8.0 && !style.stroke && style.fill_color == "#3ED6CA"
        ));

        rig.toggle();
        assert!(rig.tracker.overlay_layers().is_empty());
        assert_eq!(rig.host.layer_count(), 0);
    }

    #[test]
    fn test_recenter_raises_zoom_but_never_lowers_it() {
        let mut rig = Rig::new();
        assert_eq!(rig.host.view().unwrap().zoom, 7);

        rig.toggle();
        rig.sense(Ok(FIX));
        let view = rig.host.view().unwrap();
        assert_eq!(view.zoom, 12);
        assert_eq!(view.center, FIX.position);

        // Programmatic recenter must not push the tracker to the background
        assert_eq!(rig.route(), TrackingState::Active(FIX));

        rig.pan();
        rig.host.engine_mut().user_move(MapView::new(FIX.position, 15));
        rig.route();
        rig.toggle();
        assert_eq!(rig.host.view().unwrap().zoom, 15);
        assert_eq!(rig.route(), TrackingState::Active(FIX));
    }

    #[test]
    fn test_background_updates_do_not_recenter() {
        let mut rig = Rig::new();
        rig.toggle();
        rig.sense(Ok(FIX));
        rig.pan();
        let panned = rig.host.view();

        assert_eq!(rig.sense(Ok(OTHER_FIX)), TrackingState::Background(OTHER_FIX));
        assert_eq!(rig.host.view(), panned);
        assert!(!rig.tracker.has_move_listener());
    }

    #[test]
    fn test_unsupported_sensor_fails_loading() {
        let mut rig = Rig::new();
        rig.geo = SimulatedGeolocation::unsupported();
        assert_eq!(rig.toggle(), TrackingState::Error);
        assert_eq!(rig.tracker.error(), Some(&PositionError::Unsupported));
        assert!(rig.tracker.watch().is_none());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut rig = Rig::new();
        rig.toggle();
        rig.sense(Ok(FIX));

        rig.tracker.teardown(&mut rig.geo, &mut rig.host);
        assert_eq!(rig.tracker.state(), TrackingState::Idle);
        assert!(rig.geo.live_watches().is_empty());
        assert_eq!(rig.host.layer_count(), 0);
        assert!(!rig.tracker.has_move_listener());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Toggle,
        Reset,
        Sample(f64),
        Failure,
        Pan,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Toggle),
            Just(Step::Reset),
            (0.0f64..0.5).prop_map(Step::Sample),
            Just(Step::Failure),
            Just(Step::Pan),
        ]
    }

    proptest! {
        #[test]
        fn prop_effects_match_state(steps in proptest::collection::vec(step(), 1..40)) {
            let mut rig = Rig::new();
            for step in steps {
                match step {
                    Step::Toggle => { rig.toggle(); }
                    Step::Reset => { rig.reset(); }
                    Step::Sample(offset) => {
                        rig.sense(Ok(PositionSample::new(56.5 + offset, 24.0 + offset, 10.0)));
                    }
                    Step::Failure => { rig.sense(Err(PositionError::Timeout)); }
                    Step::Pan => { rig.pan(); }
                }

                let state = rig.tracker.state();
                let live = rig.geo.live_watches();
                prop_assert_eq!(live.len(), usize::from(state.is_watching()));
                prop_assert_eq!(rig.tracker.watch(), live.first().copied());
                prop_assert_eq!(rig.tracker.overlay_layers().len(), if state.sample().is_some() { 2 } else { 0 });
                prop_assert_eq!(rig.host.layer_count(), rig.tracker.overlay_layers().len());
                prop_assert_eq!(rig.tracker.has_move_listener(), state.status() == TrackingStatus::Active);
            }
        }
    }
}
