//! The staged, retryable runtime every cloner is built on.
//!
//! A cloner is an ordered list of [`Stage`]s plus un-retried pre/post hooks.
//! Each stage is a retryable chunk of work, usually built around a network
//! operation: the stage action does the work and returns an error on failure;
//! the stage's transient predicate decides whether that error is retryable.
//! If it is, the runtime reconnects the upstream client and restarts the
//! stage from its beginning, for as long as the current outage stays inside
//! the window allowed by [`SyncSharedData`]; if not, the error fails the
//! whole attempt.

use crate::blocking::checkpoint::CheckpointSite;
use crate::blocking::clock::Clock;
use crate::blocking::cloner::SyncSharedData;
use crate::error::{CloneError, Result};
use crossbeam::channel::{bounded, Receiver};
use rayon::ThreadPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const RECONNECT_SLEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What the cloner should do once a stage completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterStage {
    /// Continue to the next stage.
    Continue,
    /// Skip all remaining stages, including the post-stage hook.
    SkipRemaining,
}

/// One retryable unit of work inside a cloner. Each cloner type provides a
/// fixed table of these.
pub struct Stage<C> {
    name: &'static str,
    action: fn(&mut C) -> Result<AfterStage>,
    is_transient: fn(&CloneError) -> bool,
}

impl<C> Stage<C> {
    /// A stage retried on transient network errors.
    pub fn retryable(name: &'static str, action: fn(&mut C) -> Result<AfterStage>) -> Stage<C> {
        Stage {
            name,
            action,
            is_transient: CloneError::is_network,
        }
    }

    /// A stage never retried; any failure is fatal.
    pub fn fatal_on_error(name: &'static str, action: fn(&mut C) -> Result<AfterStage>) -> Stage<C> {
        Stage {
            name,
            action,
            is_transient: |_| false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

struct CoreState {
    active: bool,
    started: bool,
    status: Result<()>,
}

/// State common to every cloner: identity, the shared attempt state, and the
/// local run status.
pub struct ClonerCore {
    name: &'static str,
    source: String,
    shared: Arc<SyncSharedData>,
    clock: Arc<dyn Clock>,
    stop_after_stage: Option<String>,
    state: Mutex<CoreState>,
}

impl ClonerCore {
    pub fn new(
        name: &'static str,
        source: impl Into<String>,
        shared: Arc<SyncSharedData>,
        clock: Arc<dyn Clock>,
    ) -> ClonerCore {
        ClonerCore {
            name,
            source: source.into(),
            shared,
            clock,
            stop_after_stage: None,
            state: Mutex::new(CoreState {
                active: false,
                started: false,
                status: Ok(()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn shared(&self) -> &Arc<SyncSharedData> {
        &self.shared
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// True while `run()` is executing; for status reporting only.
    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// The status `run()` finished with.
    pub fn status(&self) -> Result<()> {
        self.state.lock().unwrap().status.clone()
    }

    /// For tests: make `run()` exit cleanly once the named stage has finished.
    pub fn set_stop_after_stage_for_test(&mut self, stage: impl Into<String>) {
        self.stop_after_stage = Some(stage.into());
    }
}

/// A cloner: staged work over one unit (all databases, one database, one
/// collection), driven by [`Cloner::run`].
pub trait Cloner: Sized {
    fn core(&self) -> &ClonerCore;

    fn core_mut(&mut self) -> &mut ClonerCore;

    /// Ordered stage table for this cloner type.
    fn stages(&self) -> Vec<Stage<Self>>;

    /// Hook run before the stages; not retried. An error becomes the
    /// cloner's status and aborts the run.
    fn pre_stage(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hook run after the stages; not retried. An error sets both the
    /// cloner's and the attempt's status.
    fn post_stage(&mut self) -> Result<()> {
        Ok(())
    }

    /// Identifies the unit being cloned at checkpoint pauses: the database
    /// name or the namespace.
    fn checkpoint_tag(&self) -> String {
        String::new()
    }

    /// Re-establish and re-authenticate the upstream connection during a
    /// transient-error retry.
    fn reconnect(&mut self) -> Result<()>;

    /// Run the cloner to completion or failure. Must be called at most once
    /// per instance. Returns the cloner's own status if that is not OK,
    /// otherwise the shared attempt status.
    fn run(&mut self) -> Result<()> {
        {
            let core = self.core();
            let mut state = core.state.lock().unwrap();
            assert!(
                !state.started,
                "{} run() called more than once",
                core.name
            );
            state.started = true;
            state.active = true;
        }
        let result = match run_impl(self) {
            Ok(()) => self.core().shared().status(),
            Err(e) => {
                // First fatal error wins; a no-op when this cloner is merely
                // propagating a failure it observed.
                self.core().shared().set_status_if_ok(e.clone());
                Err(e)
            }
        };
        {
            let core = self.core();
            let mut state = core.state.lock().unwrap();
            state.active = false;
            state.status = result.clone();
        }
        if let Err(e) = &result {
            warn!(cloner = self.core().name(), error = %e, "Cloner finished with an error. ");
        }
        result
    }

    /// Execute `run()` on the given pool, resolving the returned handle with
    /// the same value.
    fn run_on_pool(mut self, pool: &ThreadPool) -> ClonerHandle
    where
        Self: Send + 'static,
    {
        let (sender, receiver) = bounded(1);
        pool.spawn(move || {
            let _ = sender.send(self.run());
        });
        ClonerHandle { receiver }
    }
}

/// Single-shot result of a cloner started with [`Cloner::run_on_pool`].
pub struct ClonerHandle {
    receiver: Receiver<Result<()>>,
}

impl ClonerHandle {
    /// Block until the cloner finishes.
    pub fn join(self) -> Result<()> {
        self.receiver.recv().unwrap_or_else(|_| {
            Err(CloneError::Aborted {
                message: "cloner exited without reporting a status".to_string(),
            })
        })
    }

    /// The cloner's result if it has already finished.
    pub fn try_join(&self) -> Option<Result<()>> {
        self.receiver.try_recv().ok()
    }
}

fn run_impl<C: Cloner>(cloner: &mut C) -> Result<()> {
    cloner.pre_stage()?;
    let after = run_stages(cloner)?;
    if after == AfterStage::Continue {
        cloner.post_stage()?;
    }
    Ok(())
}

fn run_stages<C: Cloner>(cloner: &mut C) -> Result<AfterStage> {
    for stage in cloner.stages() {
        let after = run_stage(cloner, &stage)?;
        if after == AfterStage::SkipRemaining {
            return Ok(AfterStage::SkipRemaining);
        }
        let core = cloner.core();
        if core.stop_after_stage.as_deref() == Some(stage.name) {
            info!(
                cloner = core.name(),
                stage = stage.name,
                "Stopping after stage for test. "
            );
            return Ok(AfterStage::SkipRemaining);
        }
    }
    Ok(AfterStage::Continue)
}

fn run_stage<C: Cloner>(cloner: &mut C, stage: &Stage<C>) -> Result<AfterStage> {
    let cloner_name = cloner.core().name();
    let shared = Arc::clone(cloner.core().shared());
    let clock = Arc::clone(cloner.core().clock());
    let checkpoints = shared.checkpoints();
    loop {
        // Another cloner may have failed the attempt; do no further work.
        shared.status()?;
        let tag = cloner.checkpoint_tag();
        checkpoints.hit(
            CheckpointSite::BeforeStage,
            cloner_name,
            stage.name,
            &tag,
            &shared,
        );
        let attempt = (stage.action)(&mut *cloner);
        match attempt {
            Ok(after) => {
                checkpoints.hit(
                    CheckpointSite::AfterStage,
                    cloner_name,
                    stage.name,
                    &tag,
                    &shared,
                );
                return Ok(after);
            }
            Err(e) => {
                if !(stage.is_transient)(&e) {
                    shared.set_status_if_ok(e.clone());
                    return Err(e);
                }
                warn!(
                    cloner = cloner_name,
                    stage = stage.name,
                    error = %e,
                    "Transient error in cloner stage; reconnecting to the sync source. "
                );
                shared.increment_retrying_operations(clock.as_ref());
                shared.increment_total_retries();
                let reconnected = reconnect_within_outage_window(
                    cloner,
                    &shared,
                    clock.as_ref(),
                    cloner_name,
                    stage.name,
                    &e,
                );
                shared.decrement_retrying_operations(clock.as_ref());
                if let Err(fatal) = reconnected {
                    shared.set_status_if_ok(fatal.clone());
                    return Err(fatal);
                }
                debug!(
                    cloner = cloner_name,
                    stage = stage.name,
                    "Reconnected to the sync source; restarting stage. "
                );
            }
        }
    }
}

/// Keep trying to reconnect while the current outage stays inside the shared
/// retry window. On exhaustion the stage fails with the error that opened the
/// outage.
fn reconnect_within_outage_window<C: Cloner>(
    cloner: &mut C,
    shared: &SyncSharedData,
    clock: &dyn Clock,
    cloner_name: &'static str,
    stage_name: &'static str,
    cause: &CloneError,
) -> Result<()> {
    loop {
        shared.status()?;
        match cloner.reconnect() {
            Ok(()) => return Ok(()),
            Err(reconnect_error) => {
                let outage = shared
                    .current_outage_duration(clock)
                    .unwrap_or(Duration::ZERO);
                if outage >= shared.allowed_outage_duration() {
                    warn!(
                        cloner = cloner_name,
                        stage = stage_name,
                        outage_secs = outage.as_secs(),
                        "Exhausted the retry period while the sync source was unreachable. "
                    );
                    return Err(cause.clone());
                }
                debug!(error = %reconnect_error, "Reconnect attempt failed; will retry. ");
                clock.sleep(RECONNECT_SLEEP_INTERVAL);
            }
        }
    }
}
