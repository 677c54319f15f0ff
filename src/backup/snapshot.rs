//! Snapshot sources
//!
//! A source writes one complete archive (data dump plus file tree) to the
//! path it is handed. It never sees the final artifact location; the
//! producer stages and promotes the file.

use std::path::PathBuf;

use anyhow::{bail, Result};

use super::tier::Tier;
use crate::script_runner::run_script_safe;
use crate::script_traits::SnapshotCommandArgs;

/// What a source is asked to capture.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    /// Staging path the archive must be written to.
    pub output: PathBuf,
    pub tier: Tier,
    pub name: String,
    /// Provisioning state, for locating databases and document roots.
    pub state: Vec<(String, String)>,
}

pub trait SnapshotSource: Send + Sync {
    fn capture(&self, request: &SnapshotRequest) -> Result<()>;

    fn describe(&self) -> String {
        "snapshot source".to_string()
    }
}

/// Runs the configured snapshot command.
///
/// The command receives `BACKUP_OUTPUT`, `BACKUP_TIER`, `BACKUP_NAME` and the
/// state entries in its environment and must exit 0 after writing
/// `BACKUP_OUTPUT`.
#[derive(Debug, Clone)]
pub struct CommandSnapshot {
    command: Vec<String>,
}

impl CommandSnapshot {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl SnapshotSource for CommandSnapshot {
    fn capture(&self, request: &SnapshotRequest) -> Result<()> {
        if self.command.is_empty() {
            bail!("no snapshot command configured");
        }
        let args = SnapshotCommandArgs {
            command: self.command.clone(),
            output: request.output.clone(),
            tier: request.tier.to_string(),
            name: request.name.clone(),
            state: request.state.clone(),
        };
        run_script_safe(&args)?.ensure_success("snapshot command")?;
        if !request.output.is_file() {
            bail!(
                "snapshot command exited 0 but did not write {}",
                request.output.display()
            );
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.command.join(" ")
    }
}

/// Adapts a closure into a [`SnapshotSource`].
pub struct FnSnapshot<F>(F);

/// Wrap a closure as a snapshot source.
pub fn snapshot_fn<F>(f: F) -> FnSnapshot<F>
where
    F: Fn(&SnapshotRequest) -> Result<()> + Send + Sync,
{
    FnSnapshot(f)
}

impl<F> SnapshotSource for FnSnapshot<F>
where
    F: Fn(&SnapshotRequest) -> Result<()> + Send + Sync,
{
    fn capture(&self, request: &SnapshotRequest) -> Result<()> {
        (self.0)(request)
    }
}
