//! Tiered retention
//!
//! Pinned artifacts are partitioned out before any selection happens, so
//! the deletion list is built only from unpinned artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::artifact::{list_tier, BackupArtifact};
use super::tier::Tier;
use super::BackupError;

/// Number of unpinned artifacts kept per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
}

impl RetentionPolicy {
    pub fn keep_count(&self, tier: Tier) -> usize {
        match tier {
            Tier::Daily => self.daily,
            Tier::Weekly => self.weekly,
            Tier::Monthly => self.monthly,
        }
    }
}

/// Selection made for one tier, before anything is deleted.
#[derive(Debug, Clone, Default)]
pub struct PrunePlan {
    pub pinned: Vec<BackupArtifact>,
    /// Newest unpinned artifacts, newest first.
    pub keep: Vec<BackupArtifact>,
    /// Unpinned artifacts beyond the keep count, oldest first.
    pub delete: Vec<BackupArtifact>,
}

/// Decide which artifacts of a tier to keep.
pub fn plan_prune(artifacts: Vec<BackupArtifact>, keep_count: usize) -> PrunePlan {
    let (pinned, mut unpinned): (Vec<_>, Vec<_>) =
        artifacts.into_iter().partition(|a| a.pinned);

    unpinned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
    let mut delete = unpinned.split_off(keep_count.min(unpinned.len()));
    delete.reverse();

    PrunePlan {
        pinned,
        keep: unpinned,
        delete,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub tier: Tier,
    pub kept: usize,
    pub pinned: usize,
    /// Deleted archives, in deletion order.
    pub removed: Vec<PathBuf>,
}

/// Delete one artifact and its sidecar. The archive goes first so a crash
/// in between never leaves a discoverable archive without its checksum.
fn remove_artifact(artifact: &BackupArtifact) -> Result<(), BackupError> {
    fs::remove_file(&artifact.path).map_err(BackupError::io(&artifact.path))?;
    remove_if_present(&artifact.checksum_path())
}

fn remove_if_present(path: &Path) -> Result<(), BackupError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::io(path)(e)),
    }
}

/// Apply a retention policy to `root`. Callers must hold the backup lock.
pub fn prune(root: &Path, tier: Tier, keep_count: usize) -> Result<PruneReport, BackupError> {
    let plan = plan_prune(list_tier(root, tier)?, keep_count);
    debug!(
        "{} tier: keeping {}, {} pinned, deleting {}",
        tier,
        plan.keep.len(),
        plan.pinned.len(),
        plan.delete.len()
    );

    let mut removed = Vec::with_capacity(plan.delete.len());
    for artifact in &plan.delete {
        remove_artifact(artifact)?;
        info!("pruned {}", artifact.path.display());
        removed.push(artifact.path.clone());
    }

    Ok(PruneReport {
        tier,
        kept: plan.keep.len(),
        pinned: plan.pinned.len(),
        removed,
    })
}
