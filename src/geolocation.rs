//! Device geolocation service
//!
//! The platform sensor sits behind [`Geolocation`]. Watch callbacks are
//! delivered as [`SensorReading`]s on a channel so that they arrive on the
//! caller's event loop; every reading carries the id of the watch that
//! produced it, which lets consumers ignore readings from a cleared watch.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::tracking;
use crate::types::{LatLng, PositionSample};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("geolocation permission denied")]
    PermissionDenied,
    #[error("geolocation permission cannot be requested")]
    CannotRequestPermission,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("timed out waiting for a position")]
    Timeout,
    #[error("geolocation is not supported on this device")]
    Unsupported,
    #[error("position watch failed: {0}")]
    WatchFailed(String),
}

/// Sensor request options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub enable_high_accuracy: bool,
    pub timeout_ms: u32,
    pub maximum_age_ms: u32,
}

impl WatchOptions {
    /// Options for the live tracking watch
    pub const fn tracking() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: tracking::WATCH_TIMEOUT_MS,
            maximum_age_ms: tracking::WATCH_MAX_AGE_MS,
        }
    }

    /// Options for a single fresh fix
    pub const fn one_shot() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: tracking::ONE_SHOT_TIMEOUT_MS,
            maximum_age_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// One watch callback: a sample or an error
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub watch: WatchId,
    pub result: Result<PositionSample, PositionError>,
}

pub type SensorSink = mpsc::UnboundedSender<SensorReading>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Prompt,
    Denied,
}

/// Platform geolocation service
#[allow(async_fn_in_trait)]
pub trait Geolocation {
    /// Start a watch; readings are sent to `sink` until `clear_watch`
    fn watch_position(&mut self, options: &WatchOptions, sink: SensorSink) -> Result<WatchId, PositionError>;
    fn clear_watch(&mut self, watch: WatchId);
    async fn current_position(&self, options: &WatchOptions) -> Result<PositionSample, PositionError>;
    async fn permission(&self) -> PermissionState;
    /// Prompt the user; returns the resulting permission state
    async fn request_permission(&self) -> Result<PermissionState, PositionError>;
}

/// Fetch one position, asking for permission first when needed
pub async fn locate_once<G: Geolocation>(geo: &G) -> Result<LatLng, PositionError> {
    match geo.permission().await {
        PermissionState::Denied => return Err(PositionError::PermissionDenied),
        PermissionState::Prompt => match geo.request_permission().await? {
            PermissionState::Granted => {}
            PermissionState::Prompt | PermissionState::Denied => return Err(PositionError::PermissionDenied),
        },
        PermissionState::Granted => {}
    }

    let sample = geo.current_position(&WatchOptions::one_shot()).await?;
    Ok(sample.position)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionStatus {
    Loading,
    Success(LatLng),
    Failure,
}

/// Marks one fetch; a result for an older generation is ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

/// One-shot current position with restartable fetches
#[derive(Debug)]
pub struct CurrentPosition {
    status: PositionStatus,
    generation: u64,
}

impl Default for CurrentPosition {
    fn default() -> Self {
        Self {
            status: PositionStatus::Loading,
            generation: 0,
        }
    }
}

impl CurrentPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PositionStatus {
        self.status
    }

    /// Start (or restart) a fetch; any fetch still in flight is superseded
    pub fn fetch(&mut self) -> FetchTicket {
        self.generation += 1;
        self.status = PositionStatus::Loading;
        FetchTicket(self.generation)
    }

    /// Record a fetch result; returns false when the fetch was superseded
    pub fn resolve(&mut self, ticket: FetchTicket, result: Result<LatLng, PositionError>) -> bool {
        if ticket.0 != self.generation {
            debug!(ticket = ticket.0, current = self.generation, "Ignoring superseded position fetch");
            return false;
        }
        self.status = match result {
            Ok(position) => PositionStatus::Success(position),
            Err(e) => {
                warn!(error = %e, "Failed to get current position");
                PositionStatus::Failure
            }
        };
        true
    }

    /// Supersede any fetch in flight without starting a new one
    pub fn cancel(&mut self) {
        self.generation += 1;
    }

    /// Fetch and resolve in one step
    pub async fn refresh<G: Geolocation>(&mut self, geo: &G) -> PositionStatus {
        let ticket = self.fetch();
        let result = locate_once(geo).await;
        self.resolve(ticket, result);
        self.status
    }
}

/// Scriptable geolocation service for tests and simulated sessions
#[derive(Debug)]
pub struct SimulatedGeolocation {
    watches: BTreeMap<WatchId, SensorSink>,
    next_watch: u64,
    created: usize,
    permission: Cell<PermissionState>,
    granted_on_request: Cell<bool>,
    fixes: RefCell<VecDeque<Result<PositionSample, PositionError>>>,
    unsupported: bool,
}

impl Default for SimulatedGeolocation {
    fn default() -> Self {
        Self {
            watches: BTreeMap::new(),
            next_watch: 1,
            created: 0,
            permission: Cell::new(PermissionState::Granted),
            granted_on_request: Cell::new(true),
            fixes: RefCell::new(VecDeque::new()),
            unsupported: false,
        }
    }
}

impl SimulatedGeolocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device without a position sensor
    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    pub fn set_permission(&self, state: PermissionState) {
        self.permission.set(state);
    }

    /// Whether a permission prompt is accepted
    pub fn set_granted_on_request(&self, granted: bool) {
        self.granted_on_request.set(granted);
    }

    /// Queue the result of the next one-shot fetch
    pub fn push_fix(&self, result: Result<PositionSample, PositionError>) {
        self.fixes.borrow_mut().push_back(result);
    }

    pub fn live_watches(&self) -> Vec<WatchId> {
        self.watches.keys().copied().collect()
    }

    /// Number of watches started so far
    pub fn created_watches(&self) -> usize {
        self.created
    }

    /// Deliver a reading to every live watch; returns the number of recipients
    pub fn emit(&self, result: Result<PositionSample, PositionError>) -> usize {
        let mut delivered = 0;
        for (watch, sink) in &self.watches {
            let reading = SensorReading {
                watch: *watch,
                result: result.clone(),
            };
            if sink.send(reading).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Geolocation for SimulatedGeolocation {
    fn watch_position(&mut self, options: &WatchOptions, sink: SensorSink) -> Result<WatchId, PositionError> {
        if self.unsupported {
            return Err(PositionError::Unsupported);
        }
        let watch = WatchId(self.next_watch);
        self.next_watch += 1;
        self.created += 1;
        self.watches.insert(watch, sink);
        debug!(watch = watch.0, ?options, "Position watch started");
        Ok(watch)
    }

    fn clear_watch(&mut self, watch: WatchId) {
        if self.watches.remove(&watch).is_some() {
            debug!(watch = watch.0, "Position watch cleared");
        }
    }

    async fn current_position(&self, _options: &WatchOptions) -> Result<PositionSample, PositionError> {
        if self.unsupported {
            return Err(PositionError::Unsupported);
        }
        self.fixes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(PositionError::PositionUnavailable("no fix queued".to_string())))
    }

    async fn permission(&self) -> PermissionState {
        self.permission.get()
    }

    async fn request_permission(&self) -> Result<PermissionState, PositionError> {
        if self.unsupported {
            return Err(PositionError::CannotRequestPermission);
        }
        let state = if self.granted_on_request.get() {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        info!(?state, "Geolocation permission requested");
        self.permission.set(state);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIX: PositionSample = PositionSample::new(56.95, 24.1, 12.0);

    #[test]
    fn test_watch_options() {
        let options = WatchOptions::tracking();
        assert!(options.enable_high_accuracy);
        assert_eq!(options.timeout_ms, 3_000);
        assert_eq!(options.maximum_age_ms, 30_000);
        assert_eq!(WatchOptions::one_shot().maximum_age_ms, 0);
    }

    #[tokio::test]
    async fn test_simulated_watch_delivers_until_cleared() {
        let mut geo = SimulatedGeolocation::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let watch = geo.watch_position(&WatchOptions::tracking(), tx).unwrap();
        assert_eq!(geo.emit(Ok(FIX)), 1);
        assert_eq!(rx.recv().await, Some(SensorReading { watch, result: Ok(FIX) }));

        geo.clear_watch(watch);
        assert!(geo.live_watches().is_empty());
        assert_eq!(geo.emit(Ok(FIX)), 0);
    }

    #[tokio::test]
    async fn test_locate_once_granted() {
        let geo = SimulatedGeolocation::new();
        geo.push_fix(Ok(FIX));
        assert_eq!(locate_once(&geo).await, Ok(FIX.position));
    }

    #[tokio::test]
    async fn test_locate_once_denied() {
        let geo = SimulatedGeolocation::new();
        geo.set_permission(PermissionState::Denied);
        geo.push_fix(Ok(FIX));
        assert_eq!(locate_once(&geo).await, Err(PositionError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_locate_once_prompts_then_fetches() {
        let geo = SimulatedGeolocation::new();
        geo.set_permission(PermissionState::Prompt);
        geo.push_fix(Ok(FIX));
        assert_eq!(locate_once(&geo).await, Ok(FIX.position));
        assert_eq!(geo.permission().await, PermissionState::Granted);

        let refused = SimulatedGeolocation::new();
        refused.set_permission(PermissionState::Prompt);
        refused.set_granted_on_request(false);
        assert_eq!(locate_once(&refused).await, Err(PositionError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_current_position_refresh() {
        let geo = SimulatedGeolocation::new();
        let mut current = CurrentPosition::new();
        assert_eq!(current.status(), PositionStatus::Loading);

        assert_eq!(current.refresh(&geo).await, PositionStatus::Failure);

        geo.push_fix(Ok(FIX));
        assert_eq!(current.refresh(&geo).await, PositionStatus::Success(FIX.position));
    }

    #[test]
    fn test_superseded_fetch_is_ignored() {
        let mut current = CurrentPosition::new();
        let first = current.fetch();
        let second = current.fetch();

        assert!(!current.resolve(first, Ok(LatLng::new(1.0, 1.0))));
        assert_eq!(current.status(), PositionStatus::Loading);
        assert!(current.resolve(second, Ok(LatLng::new(2.0, 2.0))));
        assert_eq!(current.status(), PositionStatus::Success(LatLng::new(2.0, 2.0)));

        let third = current.fetch();
        current.cancel();
        assert!(!current.resolve(third, Err(PositionError::Timeout)));
    }

    #[test]
    fn test_unsupported_device() {
        let mut geo = SimulatedGeolocation::unsupported();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(geo.watch_position(&WatchOptions::tracking(), tx), Err(PositionError::Unsupported));
    }
}
