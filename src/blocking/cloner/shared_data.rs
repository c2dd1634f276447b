//! State shared by every cloner of one initial-sync attempt.

use crate::blocking::checkpoint::Checkpoints;
use crate::blocking::clock::Clock;
use crate::error::CloneError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

struct State {
    /// Status of the entire attempt. Every cloner checks this at each stage
    /// boundary and exits if it has become non-OK.
    status: Result<(), CloneError>,
    /// Operations currently retrying a transient error.
    retrying_operations: u32,
    /// Total retry attempts across all operations; initial attempts are not
    /// counted, so a healthy attempt stays at 0.
    total_retries: u64,
    /// When the current outage began. Set iff `retrying_operations > 0`.
    unreachable_since: Option<SystemTime>,
    /// Accumulated duration of completed outages.
    total_time_unreachable: Duration,
}

/// Shared by every cloner of one attempt; constructed before the first cloner
/// and outlives them all.
///
/// The immutable attributes (feature compatibility version and rollback id of
/// the sync source at attempt start) are readable without locking; the rest
/// lives behind one mutex, which is never held across I/O.
pub struct SyncSharedData {
    fcv: String,
    rollback_id: i32,
    /// How long a stage may stay in its retry window while the sync source is
    /// unreachable. The single knob every retry bound derives from.
    allowed_outage: Duration,
    checkpoints: Arc<Checkpoints>,
    state: Mutex<State>,
}

impl SyncSharedData {
    pub fn new(fcv: impl Into<String>, rollback_id: i32, allowed_outage: Duration) -> SyncSharedData {
        SyncSharedData {
            fcv: fcv.into(),
            rollback_id,
            allowed_outage,
            checkpoints: Arc::new(Checkpoints::new()),
            state: Mutex::new(State {
                status: Ok(()),
                retrying_operations: 0,
                total_retries: 0,
                unreachable_since: None,
                total_time_unreachable: Duration::ZERO,
            }),
        }
    }

    /// Sync source feature compatibility version at the start of the attempt.
    pub fn fcv(&self) -> &str {
        &self.fcv
    }

    /// Sync source rollback id at the start of the attempt.
    pub fn rollback_id(&self) -> i32 {
        self.rollback_id
    }

    pub fn allowed_outage_duration(&self) -> Duration {
        self.allowed_outage
    }

    /// Stage checkpoint pause registry for this attempt.
    pub fn checkpoints(&self) -> Arc<Checkpoints> {
        Arc::clone(&self.checkpoints)
    }

    pub fn status(&self) -> Result<(), CloneError> {
        self.state.lock().unwrap().status.clone()
    }

    /// Replace the attempt status unconditionally. Used from outside the
    /// cloners, e.g. to stop the attempt at shutdown; in-flight cloners exit
    /// at their next stage boundary or checkpoint.
    pub fn set_status(&self, status: Result<(), CloneError>) {
        self.state.lock().unwrap().status = status;
    }

    /// Set the attempt status if and only if it is still OK, so the first
    /// fatal error wins and is never clobbered.
    pub fn set_status_if_ok(&self, error: CloneError) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_ok() {
            state.status = Err(error);
        }
    }

    pub fn retrying_operations(&self) -> u32 {
        self.state.lock().unwrap().retrying_operations
    }

    pub fn total_retries(&self) -> u64 {
        self.state.lock().unwrap().total_retries
    }

    pub fn increment_total_retries(&self) {
        self.state.lock().unwrap().total_retries += 1;
    }

    /// Record that an operation has started retrying; the first one opens an
    /// outage. Returns the new count.
    pub fn increment_retrying_operations(&self, clock: &dyn Clock) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.retrying_operations += 1;
        if state.retrying_operations == 1 {
            state.unreachable_since = Some(clock.now());
        }
        state.retrying_operations
    }

    /// Record that an operation has stopped retrying; the last one closes the
    /// outage and accumulates its duration. Returns the new count.
    pub fn decrement_retrying_operations(&self, clock: &dyn Clock) -> u32 {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.retrying_operations > 0);
        state.retrying_operations = state.retrying_operations.saturating_sub(1);
        if state.retrying_operations == 0 {
            if let Some(since) = state.unreachable_since.take() {
                state.total_time_unreachable += clock
                    .now()
                    .duration_since(since)
                    .unwrap_or(Duration::ZERO);
            }
        }
        state.retrying_operations
    }

    /// Total time the sync source has been unreachable, including any current
    /// outage.
    pub fn total_time_unreachable(&self, clock: &dyn Clock) -> Duration {
        let state = self.state.lock().unwrap();
        let current = state
            .unreachable_since
            .map(|since| clock.now().duration_since(since).unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        state.total_time_unreachable + current
    }

    /// Duration of the current outage, or `None` if no operation is retrying.
    pub fn current_outage_duration(&self, clock: &dyn Clock) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .unreachable_since
            .map(|since| clock.now().duration_since(since).unwrap_or(Duration::ZERO))
    }
}
