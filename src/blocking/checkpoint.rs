//! Pause points at cloner stage boundaries.
//!
//! The cloner runtime announces a checkpoint immediately before and after
//! every stage. A test (or an operator poking at a stuck node) can register a
//! pause point matching a particular cloner, stage and cloned unit; the
//! announcing thread then blocks until the pause point is released. The
//! runtime itself does no synchronisation beyond the announcement, and a
//! paused cloner resumes as soon as the attempt status turns non-OK so
//! shutdown is never held up.

use crate::blocking::cloner::SyncSharedData;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointSite {
    BeforeStage,
    AfterStage,
}

/// Selects which checkpoint announcements a pause point applies to.
/// Unset fields match anything.
#[derive(Clone, Debug, Default)]
pub struct CheckpointMatcher {
    cloner: Option<String>,
    stage: Option<String>,
    tag: Option<String>,
}

impl CheckpointMatcher {
    pub fn new() -> CheckpointMatcher {
        CheckpointMatcher::default()
    }

    pub fn cloner(mut self, name: impl Into<String>) -> Self {
        self.cloner = Some(name.into());
        self
    }

    pub fn stage(mut self, name: impl Into<String>) -> Self {
        self.stage = Some(name.into());
        self
    }

    /// Match the identifying tag of the unit being cloned: the database name
    /// for a database cloner, the namespace for a collection cloner.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    fn matches(&self, cloner: &str, stage: &str, tag: &str) -> bool {
        self.cloner.as_deref().map_or(true, |c| c == cloner)
            && self.stage.as_deref().map_or(true, |s| s == stage)
            && self.tag.as_deref().map_or(true, |t| t == tag)
    }
}

struct PointGate {
    enabled: bool,
    times_entered: u64,
}

struct PointState {
    gate: Mutex<PointGate>,
    cond: Condvar,
}

struct PausePoint {
    site: CheckpointSite,
    matcher: CheckpointMatcher,
    state: Arc<PointState>,
}

/// Registry of active pause points for one initial-sync attempt.
#[derive(Default)]
pub struct Checkpoints {
    points: Mutex<Vec<PausePoint>>,
}

const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl Checkpoints {
    pub fn new() -> Checkpoints {
        Checkpoints::default()
    }

    /// Register a pause point. The returned handle releases it when dropped.
    pub fn pause(&self, site: CheckpointSite, matcher: CheckpointMatcher) -> PauseHandle {
        let state = Arc::new(PointState {
            gate: Mutex::new(PointGate {
                enabled: true,
                times_entered: 0,
            }),
            cond: Condvar::new(),
        });
        let mut points = self.points.lock().unwrap();
        points.retain(|p| p.state.gate.lock().unwrap().enabled);
        points.push(PausePoint {
            site,
            matcher,
            state: Arc::clone(&state),
        });
        PauseHandle { state }
    }

    /// Announce a checkpoint; blocks while a matching pause point is enabled.
    pub(crate) fn hit(
        &self,
        site: CheckpointSite,
        cloner: &str,
        stage: &str,
        tag: &str,
        shared: &SyncSharedData,
    ) {
        let matching: Vec<Arc<PointState>> = {
            let points = self.points.lock().unwrap();
            points
                .iter()
                .filter(|p| p.site == site && p.matcher.matches(cloner, stage, tag))
                .map(|p| Arc::clone(&p.state))
                .collect()
        };
        for state in matching {
            let mut gate = state.gate.lock().unwrap();
            if !gate.enabled {
                continue;
            }
            gate.times_entered += 1;
            state.cond.notify_all();
            // The attempt status lives behind its own mutex, so poll it
            // rather than waiting for a wakeup that would never come.
            while gate.enabled && shared.status().is_ok() {
                let (g, _) = state.cond.wait_timeout(gate, PAUSE_POLL_INTERVAL).unwrap();
                gate = g;
            }
        }
    }
}

/// Controls one registered pause point.
pub struct PauseHandle {
    state: Arc<PointState>,
}

impl PauseHandle {
    /// How many times a cloner has reached this pause point.
    pub fn times_entered(&self) -> u64 {
        self.state.gate.lock().unwrap().times_entered
    }

    /// Block until the pause point has been entered at least `n` times.
    pub fn wait_for_times_entered(&self, n: u64) {
        let mut gate = self.state.gate.lock().unwrap();
        while gate.times_entered < n {
            gate = self.state.cond.wait(gate).unwrap();
        }
    }

    /// Disable the pause point and release anyone blocked on it.
    pub fn release(&self) {
        let mut gate = self.state.gate.lock().unwrap();
        gate.enabled = false;
        self.state.cond.notify_all();
    }
}

impl Drop for PauseHandle {
    fn drop(&mut self) {
        self.release();
    }
}
