//! Steps and their per-run state machine
//!
//! A [`Step`] pairs an id and its declared dependencies with a
//! [`ProvisioningAction`]. Whether a step has completed is never held in
//! memory: it is the presence of the step's idempotency key in the state
//! store. [`StepStatus`] only tracks a step within a single run.
//!
//! # Status Flow
//!
//! ```text
//! Pending
//!    ↓
//! Running
//!    ↓
//! Completed | Failed
//! ```
//!
//! `Completed` is persisted as a marker. `Failed` is terminal for the run but
//! leaves no marker, so the next run retries the step.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use strum::{Display, EnumString};
use thiserror::Error;

/// Per-run status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    /// Not yet attempted in this run and not marked complete
    Pending,
    /// Action currently executing
    Running,
    /// Action succeeded and the completion marker is recorded (terminal)
    Completed,
    /// Action failed in this run (terminal for the run)
    Failed,
}

impl StepStatus {
    /// Returns true for `Completed` and `Failed`
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validate a transition to `to`.
    ///
    /// Allowed: `Pending -> Running`, `Running -> Completed`,
    /// `Running -> Failed`. A marker found in the state store moves a step
    /// straight from `Pending` to `Completed` without running it.
    pub fn transition(self, to: StepStatus) -> Result<StepStatus, StepTransitionError> {
        if self.is_terminal() {
            return Err(StepTransitionError::FromTerminal { from: self, to });
        }
        if self == to {
            return Err(StepTransitionError::AlreadyAt { status: to });
        }
        match (self, to) {
            (Self::Pending, Self::Running)
            | (Self::Pending, Self::Completed)
            | (Self::Running, Self::Completed)
            | (Self::Running, Self::Failed) => Ok(to),
            _ => Err(StepTransitionError::Invalid { from: self, to }),
        }
    }
}

/// Errors raised by invalid status transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepTransitionError {
    #[error("Cannot leave terminal status {from} for {to}")]
    FromTerminal { from: StepStatus, to: StepStatus },

    #[error("Invalid step transition {from} -> {to}")]
    Invalid { from: StepStatus, to: StepStatus },

    #[error("Step is already {status}")]
    AlreadyAt { status: StepStatus },
}

/// What an action gets to see while it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Id of the step being executed
    pub step_id: String,
    /// Snapshot of the state store taken just before the action started
    pub state: BTreeMap<String, String>,
}

impl StepContext {
    /// Value of a state key, if recorded.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.state.get(key).map(String::as_str)
    }

    /// Value of a state key, or an error naming the missing key.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) => Ok(value),
            None => bail!("step {} requires state key {}", self.step_id, key),
        }
    }
}

/// A provisioning action invoked by a step.
///
/// Actions are opaque to the orchestrator beyond success or failure. They
/// must be safe to run again: an interruption after the action's side effects
/// but before its completion marker is written causes a re-run.
pub trait ProvisioningAction {
    fn run(&self, ctx: &StepContext) -> Result<()>;

    /// Short human description for status output.
    fn describe(&self) -> String {
        "custom action".to_string()
    }
}

impl<F> ProvisioningAction for F
where
    F: Fn(&StepContext) -> Result<()>,
{
    fn run(&self, ctx: &StepContext) -> Result<()> {
        self(ctx)
    }
}

/// A named unit of provisioning work.
pub struct Step {
    id: String,
    dependencies: Vec<String>,
    idempotency_key: String,
    action: Box<dyn ProvisioningAction>,
}

impl Step {
    /// New step whose idempotency key is its id.
    pub fn new(id: impl Into<String>, action: impl ProvisioningAction + 'static) -> Self {
        let id = id.into();
        Self {
            idempotency_key: id.clone(),
            id,
            dependencies: Vec::new(),
            action: Box::new(action),
        }
    }

    /// New step from a closure.
    pub fn from_fn<F>(id: impl Into<String>, action: F) -> Self
    where
        F: Fn(&StepContext) -> Result<()> + 'static,
    {
        Self::new(id, action)
    }

    /// Declare a prerequisite step.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Override the state key recording completion.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn action(&self) -> &dyn ProvisioningAction {
        self.action.as_ref()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("idempotency_key", &self.idempotency_key)
            .field("action", &self.action.describe())
            .finish()
    }
}

// ============================================================================
// Bounded polling for actions
// ============================================================================

/// Poll `probe` every `interval` until it returns true or `timeout` passes.
///
/// Returns an error naming `what` on timeout. This is for actions that wait
/// on a service (a database socket, a web server port); the orchestrator
/// itself never waits on anything but locks.
pub fn wait_until<F>(what: &str, timeout: Duration, interval: Duration, mut probe: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if probe() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            bail!("timed out after {:?} waiting for {}", timeout, what);
        }
        thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// Wait for a filesystem path (e.g. a unix socket) to appear.
pub fn wait_for_path(path: &Path, timeout: Duration) -> Result<()> {
    wait_until(
        &path.display().to_string(),
        timeout,
        Duration::from_millis(250),
        || path.exists(),
    )
}

/// Wait for a TCP listener to accept connections.
pub fn wait_for_tcp(addr: SocketAddr, timeout: Duration) -> Result<()> {
    wait_until(&addr.to_string(), timeout, Duration::from_millis(250), || {
        TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
    })
}
