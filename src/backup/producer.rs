//! Artifact production
//!
//! A snapshot is written to `<root>/.staging/` first and only renamed into
//! its tier directory once it is complete and flushed. The rename is the
//! commit point: a failure before it leaves nothing discoverable.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc, Weekday};
use tracing::{debug, info, warn};

use super::artifact::{artifact_file_name, write_checksum, BackupArtifact};
use super::snapshot::{SnapshotRequest, SnapshotSource};
use super::tier::Tier;
use super::BackupError;

pub const STAGING_DIR: &str = ".staging";
const PARTIAL_SUFFIX: &str = ".partial";

/// Removes the staged file on drop unless it was promoted.
struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Flush and atomically move the staged file to `target`.
    fn promote(mut self, target: &Path) -> Result<(), BackupError> {
        File::open(&self.path)
            .and_then(|f| f.sync_all())
            .map_err(BackupError::io(&self.path))?;
        fs::rename(&self.path, target).map_err(BackupError::io(target))?;
        self.armed = false;
        if let Some(parent) = target.parent() {
            sync_dir(parent).map_err(BackupError::io(parent))?;
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("discarded staged file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not discard staged file {}: {}", self.path.display(), e),
        }
    }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

pub struct BackupProducer {
    root: PathBuf,
    name: String,
    week_ends_on: Weekday,
    source: Box<dyn SnapshotSource>,
}

impl BackupProducer {
    pub fn new(
        root: impl Into<PathBuf>,
        name: impl Into<String>,
        week_ends_on: Weekday,
        source: impl SnapshotSource + 'static,
    ) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            week_ends_on,
            source: Box::new(source),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Capture a snapshot taken at `now` and commit it to its tier.
    ///
    /// The tier follows the calendar date in `now`'s own time zone; the
    /// file name always carries the UTC instant.
    ///
    /// Callers must hold the backup lock: stale staging files are purged
    /// on entry on the assumption that no other producer is running.
    pub fn produce<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
        state: &[(String, String)],
    ) -> Result<BackupArtifact, BackupError> {
        let tier = Tier::classify(now.date_naive(), self.week_ends_on);
        let now = now.with_timezone(&Utc);
        let file_name = artifact_file_name(&self.name, now);
        let tier_dir = self.root.join(tier.as_ref());
        let staging_dir = self.staging_dir();

        fs::create_dir_all(&tier_dir).map_err(BackupError::io(&tier_dir))?;
        fs::create_dir_all(&staging_dir).map_err(BackupError::io(&staging_dir))?;
        self.purge_staging()?;

        let final_path = tier_dir.join(&file_name);
        if final_path.exists() {
            return Err(BackupError::AlreadyExists(final_path));
        }

        let staging_path = staging_dir.join(format!("{}{}", file_name, PARTIAL_SUFFIX));
        let staged = StagedFile::new(staging_path.clone());

        info!(
            "producing {} backup {} via {}",
            tier,
            file_name,
            self.source.describe()
        );
        let request = SnapshotRequest {
            output: staging_path.clone(),
            tier,
            name: self.name.clone(),
            state: state.to_vec(),
        };
        self.source
            .capture(&request)
            .map_err(BackupError::Snapshot)?;
        if !staging_path.is_file() {
            return Err(BackupError::Snapshot(anyhow::anyhow!(
                "snapshot source did not write {}",
                staging_path.display()
            )));
        }

        staged.promote(&final_path)?;

        // The archive is committed; a sidecar failure leaves it in place
        // and surfaces as MissingChecksum on verify.
        let checksum = write_checksum(&final_path).map_err(BackupError::io(&final_path))?;
        info!("committed {} ({})", final_path.display(), checksum);

        Ok(BackupArtifact {
            tier,
            name: self.name.clone(),
            created_at: now,
            path: final_path,
            checksum: Some(checksum),
            pinned: false,
        })
    }

    /// Delete leftovers of interrupted productions.
    pub fn purge_staging(&self) -> Result<usize, BackupError> {
        let staging_dir = self.staging_dir();
        let entries = match fs::read_dir(&staging_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BackupError::io(&staging_dir)(e)),
        };
        let mut purged = 0;
        for entry in entries {
            let path = entry.map_err(BackupError::io(&staging_dir))?.path();
            if path.is_file() {
                fs::remove_file(&path).map_err(BackupError::io(&path))?;
                warn!("removed stale staging file {}", path.display());
                purged += 1;
            }
        }
        Ok(purged)
    }
}
