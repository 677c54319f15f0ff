//! Tiered backups
//!
//! A backup run ([`BackupService::trigger`]) produces one artifact, files it
//! under the tier its creation date falls in, and applies retention to
//! every tier. The whole run holds the `backup` lock, which is independent
//! of the orchestration lock: backups may run while provisioning does.
//!
//! # Module Structure
//!
//! - `tier` - daily/weekly/monthly classification
//! - `artifact` - on-disk layout, checksums, pin markers
//! - `snapshot` - sources that write the archive
//! - `producer` - staged, atomic artifact creation
//! - `retention` - keep-count pruning that never touches pinned artifacts

pub mod artifact;
pub mod producer;
pub mod retention;
pub mod snapshot;
pub mod tier;

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub use artifact::{BackupArtifact, Verification};
pub use producer::BackupProducer;
pub use retention::{PruneReport, RetentionPolicy};
pub use snapshot::{CommandSnapshot, SnapshotRequest, SnapshotSource};
pub use tier::Tier;

use crate::config_file::BackupConfig;
use crate::lock::{LockError, LockManager, LockScope};
use crate::state_store::{StateError, StateStore};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("backup I/O error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("snapshot failed: {0:#}")]
    Snapshot(anyhow::Error),

    #[error("artifact {} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("{} is not a backup artifact", .0.display())]
    NotAnArtifact(PathBuf),
}

impl BackupError {
    /// `map_err` adapter attaching the path an I/O error happened on.
    pub(crate) fn io<P: AsRef<Path>>(path: P) -> impl FnOnce(io::Error) -> BackupError {
        let path = path.as_ref().to_path_buf();
        move |source| BackupError::Io { path, source }
    }
}

/// Result of one backup run.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub artifact: BackupArtifact,
    pub pruned: Vec<PruneReport>,
}

impl TriggerReport {
    pub fn removed_count(&self) -> usize {
        self.pruned.iter().map(|r| r.removed.len()).sum()
    }
}

pub struct BackupService<S: StateStore> {
    root: PathBuf,
    retention: RetentionPolicy,
    locks: LockManager,
    producer: BackupProducer,
    store: S,
}

impl<S: StateStore> BackupService<S> {
    pub fn new(
        config: &BackupConfig,
        locks: LockManager,
        store: S,
        source: impl SnapshotSource + 'static,
    ) -> Self {
        Self {
            root: config.root.clone(),
            retention: config.retention,
            locks,
            producer: BackupProducer::new(
                config.root.clone(),
                config.name.clone(),
                config.week_ends_on,
                source,
            ),
            store,
        }
    }

    /// Service backed by the configured snapshot command.
    pub fn from_config(config: &BackupConfig, locks: LockManager, store: S) -> Self {
        let source = CommandSnapshot::new(config.snapshot_command.clone());
        Self::new(config, locks, store, source)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Produce an artifact now and apply retention to every tier.
    ///
    /// The tier is chosen from the server's local calendar date.
    pub fn trigger(&mut self) -> Result<TriggerReport, BackupError> {
        self.trigger_at(Local::now())
    }

    /// [`trigger`](Self::trigger) with an explicit creation time. The tier
    /// follows the date in `now`'s time zone.
    pub fn trigger_at<Tz: TimeZone>(
        &mut self,
        now: DateTime<Tz>,
    ) -> Result<TriggerReport, BackupError> {
        let _guard = self.locks.acquire(LockScope::Backup)?;
        self.store.refresh()?;

        let artifact = self.producer.produce(now, &self.store.entries())?;
        let pruned = self.prune_locked(&Tier::ALL)?;

        info!(
            "backup complete: {} ({} tier), {} artifact(s) pruned",
            artifact.path.display(),
            artifact.tier,
            pruned.iter().map(|r| r.removed.len()).sum::<usize>()
        );
        Ok(TriggerReport { artifact, pruned })
    }

    /// Apply retention without producing anything.
    pub fn prune(&self, tier: Option<Tier>) -> Result<Vec<PruneReport>, BackupError> {
        let _guard = self.locks.acquire(LockScope::Backup)?;
        match tier {
            Some(tier) => self.prune_locked(&[tier]),
            None => self.prune_locked(&Tier::ALL),
        }
    }

    fn prune_locked(&self, tiers: &[Tier]) -> Result<Vec<PruneReport>, BackupError> {
        tiers
            .iter()
            .map(|&tier| retention::prune(&self.root, tier, self.retention.keep_count(tier)))
            .collect()
    }

    /// Artifacts of one tier, or all tiers, oldest first within a tier.
    pub fn list(&self, tier: Option<Tier>) -> Result<Vec<BackupArtifact>, BackupError> {
        let tiers: &[Tier] = match &tier {
            Some(tier) => std::slice::from_ref(tier),
            None => &Tier::ALL,
        };
        let mut all = Vec::new();
        for &tier in tiers {
            all.extend(artifact::list_tier(&self.root, tier)?);
        }
        Ok(all)
    }

    /// Find an artifact by path or by bare file name. Paths must resolve
    /// to somewhere under the backup root.
    pub fn locate(&self, name: &str) -> Result<PathBuf, BackupError> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            let not_ours = || BackupError::NotAnArtifact(candidate.to_path_buf());
            let resolved = candidate.canonicalize().map_err(|_| not_ours())?;
            let root = self.root.canonicalize().map_err(|_| not_ours())?;
            if !resolved.starts_with(&root) {
                return Err(not_ours());
            }
            return Ok(resolved);
        }
        Tier::ALL
            .iter()
            .map(|tier| self.root.join(tier.as_ref()).join(candidate))
            .find(|path| path.is_file())
            .ok_or_else(|| BackupError::NotAnArtifact(candidate.to_path_buf()))
    }

    pub fn verify(&self, name: &str) -> Result<(PathBuf, Verification), BackupError> {
        let path = self.locate(name)?;
        BackupArtifact::from_path(&path)?;
        let verification = artifact::verify(&path)?;
        Ok((path, verification))
    }

    /// Verify every artifact under the root.
    pub fn verify_all(&self) -> Result<Vec<(BackupArtifact, Verification)>, BackupError> {
        self.list(None)?
            .into_iter()
            .map(|a| {
                let verification = artifact::verify(&a.path)?;
                Ok::<_, BackupError>((a, verification))
            })
            .collect()
    }

    /// Pin under the backup lock so retention never races the marker.
    pub fn pin(&self, name: &str) -> Result<BackupArtifact, BackupError> {
        let path = self.locate(name)?;
        let _guard = self.locks.acquire(LockScope::Backup)?;
        artifact::pin(&path)
    }

    pub fn unpin(&self, name: &str) -> Result<BackupArtifact, BackupError> {
        let path = self.locate(name)?;
        let _guard = self.locks.acquire(LockScope::Backup)?;
        artifact::unpin(&path)
    }
}
