//! Orchestrator / Executor
//!
//! Runs registered steps in resolver order under the `orchestration` lock.
//! The idempotency gate lives here and only here: a step whose idempotency
//! key exists in the state store is skipped without invoking its action.
//!
//! # Run Algorithm
//!
//! 1. Acquire the `orchestration` lock (fails fast with `Busy`)
//! 2. Re-read the state store and resolve the step order
//! 3. For each step: skip if marked, otherwise run the action
//! 4. On success write the completion marker before moving on
//! 5. On failure record `LAST_FAILED_STEP` and halt at exactly that step
//!
//! Resuming is just running again: completed steps are skipped, so the run
//! re-enters at the step that failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::lock::{LockError, LockManager, LockScope};
use crate::logic::resolver::{ResolveError, StepRegistry};
use crate::state_store::{StateError, StateStore};
use crate::step::{StepContext, StepStatus, StepTransitionError};

/// State key naming the step that halted the last run.
pub const LAST_FAILED_STEP: &str = "LAST_FAILED_STEP";
/// State key holding the human-readable reason for the last halt.
pub const LAST_FAILURE_REASON: &str = "LAST_FAILURE_REASON";
/// State key holding when the last halt happened.
pub const LAST_FAILURE_AT: &str = "LAST_FAILURE_AT";

/// Errors ending an orchestration run.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Completion markers cannot be recorded; no further progress is safe
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] StepTransitionError),

    /// A step's action failed; the run halted at this step
    #[error("step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// A termination signal arrived; `step` did not complete
    #[error("interrupted at step {step}")]
    Interrupted { step: String },
}

impl OrchestratorError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::StepFailed { .. } => 1,
            Self::Interrupted { .. } | Self::Lock(LockError::Interrupted { .. }) => 130,
            Self::Lock(LockError::Busy { .. }) => 75,
            _ => 2,
        }
    }

    /// Id of the step the run halted at, if a step halted it.
    pub fn halted_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } | Self::Interrupted { step } => Some(step),
            _ => None,
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Steps whose action ran and completed, in order
    pub executed: Vec<String>,
    /// Steps skipped because their marker already existed, in order
    pub skipped: Vec<String>,
}

/// The last recorded halt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub step: String,
    pub reason: String,
    pub at: String,
}

/// Completion status of one step as recorded in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepState {
    pub id: String,
    pub key: String,
    pub dependencies: Vec<String>,
    /// Marker value (completion timestamp) if the step is complete
    pub completed: Option<String>,
}

/// Drives the registered steps against a state store.
pub struct Orchestrator<S: StateStore> {
    registry: StepRegistry,
    store: S,
    locks: LockManager,
    interrupt: Arc<AtomicBool>,
}

impl<S: StateStore> Orchestrator<S> {
    pub fn new(registry: StepRegistry, store: S, locks: LockManager) -> Self {
        Self {
            registry,
            store,
            locks,
            interrupt: crate::process_guard::interrupt_flag(),
        }
    }

    /// Use a specific interrupt flag instead of the process-wide one.
    /// Lock waits watch the same flag.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.locks = self.locks.with_interrupt(Arc::clone(&flag));
        self.interrupt = flag;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Run every step not yet marked complete.
    ///
    /// This is both a fresh run and a resume.
    pub fn run(&mut self) -> Result<RunReport, OrchestratorError> {
        let _guard = self.locks.acquire(LockScope::Orchestration)?;
        self.run_locked()
    }

    /// Clear one step's marker and run; with everything else marked, only
    /// that step executes.
    pub fn force_rerun(&mut self, step_id: &str) -> Result<RunReport, OrchestratorError> {
        let _guard = self.locks.acquire(LockScope::Orchestration)?;
        self.store.refresh()?;
        let key = self.step_key(step_id)?;
        info!("Forcing re-run of step {}", step_id);
        self.store.remove(&key)?;
        self.run_locked()
    }

    /// Record a step as complete without running it (fixed out-of-band).
    pub fn mark_complete(&mut self, step_id: &str) -> Result<(), OrchestratorError> {
        let _guard = self.locks.acquire(LockScope::Orchestration)?;
        self.store.refresh()?;
        let key = self.step_key(step_id)?;
        self.store.save(&key, &completion_marker())?;
        info!("Marked step {} complete", step_id);
        Ok(())
    }

    /// Clear a step's completion marker without running anything.
    pub fn reset(&mut self, step_id: &str) -> Result<(), OrchestratorError> {
        let _guard = self.locks.acquire(LockScope::Orchestration)?;
        self.store.refresh()?;
        let key = self.step_key(step_id)?;
        self.store.remove(&key)?;
        info!("Cleared completion marker of step {}", step_id);
        Ok(())
    }

    /// Completion state of every step, in execution order.
    pub fn status(&self) -> Result<Vec<StepState>, OrchestratorError> {
        let order = self.registry.resolve()?;
        Ok(order
            .into_iter()
            .map(|step| StepState {
                id: step.id().to_string(),
                key: step.key().to_string(),
                dependencies: step.dependencies().to_vec(),
                completed: self
                    .store
                    .exists(step.key())
                    .then(|| self.store.load(step.key(), "")),
            })
            .collect())
    }

    /// The halt recorded by the last failed run, if any.
    pub fn last_failure(&self) -> Option<FailureRecord> {
        if !self.store.exists(LAST_FAILED_STEP) {
            return None;
        }
        Some(FailureRecord {
            step: self.store.load(LAST_FAILED_STEP, ""),
            reason: self.store.load(LAST_FAILURE_REASON, ""),
            at: self.store.load(LAST_FAILURE_AT, ""),
        })
    }

    fn step_key(&self, step_id: &str) -> Result<String, OrchestratorError> {
        self.registry
            .get(step_id)
            .map(|s| s.key().to_string())
            .ok_or_else(|| ResolveError::UnknownStep(step_id.to_string()).into())
    }

    /// The step loop. Caller holds the orchestration lock.
    fn run_locked(&mut self) -> Result<RunReport, OrchestratorError> {
        self.store.refresh()?;
        let order = self.registry.resolve()?;
        let mut report = RunReport::default();

        info!("Running {} step(s)", order.len());

        for step in order {
            let mut status = StepStatus::Pending;

            if self.store.exists(step.key()) {
                status.transition(StepStatus::Completed)?;
                debug!("Skipping step {}: {} already recorded", step.id(), step.key());
                report.skipped.push(step.id().to_string());
                continue;
            }

            if self.interrupt.load(Ordering::SeqCst) {
                warn!("Interrupted before step {}", step.id());
                record_failure(&mut self.store, step.id(), "interrupted before start")?;
                return Err(OrchestratorError::Interrupted {
                    step: step.id().to_string(),
                });
            }

            status = status.transition(StepStatus::Running)?;
            info!("Running step {} ({})", step.id(), step.action().describe());

            let ctx = StepContext {
                step_id: step.id().to_string(),
                state: self.store.entries().into_iter().collect(),
            };

            match step.action().run(&ctx) {
                Ok(()) => {
                    self.store.save(step.key(), &completion_marker())?;
                    status.transition(StepStatus::Completed)?;
                    info!("Step {} completed", step.id());
                    report.executed.push(step.id().to_string());
                }
                Err(e) => {
                    status.transition(StepStatus::Failed)?;
                    let reason = format!("{:#}", e);
                    error!("Step {} failed: {}", step.id(), reason);
                    record_failure(&mut self.store, step.id(), &reason)?;

                    if self.interrupt.load(Ordering::SeqCst) {
                        return Err(OrchestratorError::Interrupted {
                            step: step.id().to_string(),
                        });
                    }
                    return Err(OrchestratorError::StepFailed {
                        step: step.id().to_string(),
                        reason,
                    });
                }
            }
        }

        clear_failure(&mut self.store)?;
        info!(
            "All steps complete ({} executed, {} skipped)",
            report.executed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Marker value written for completed steps.
pub fn completion_marker() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn record_failure<S: StateStore>(store: &mut S, step: &str, reason: &str) -> Result<(), StateError> {
    // Values are single-line; keep the first line of multi-line causes.
    let reason = reason.lines().next().unwrap_or_default();
    store.save(LAST_FAILED_STEP, step)?;
    store.save(LAST_FAILURE_REASON, reason)?;
    store.save(LAST_FAILURE_AT, &completion_marker())
}

fn clear_failure<S: StateStore>(store: &mut S) -> Result<(), StateError> {
    store.remove(LAST_FAILED_STEP)?;
    store.remove(LAST_FAILURE_REASON)?;
    store.remove(LAST_FAILURE_AT)
}
