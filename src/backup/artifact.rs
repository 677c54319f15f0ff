//! Backup artifacts on disk
//!
//! Layout under the backup root:
//!
//! ```text
//! <root>/<tier>/<name>_<YYYYmmddTHHMMSS.mmmZ>.archive
//! <root>/<tier>/<name>_<YYYYmmddTHHMMSS.mmmZ>.archive.sha256
//! <root>/<tier>/<name>_<YYYYmmddTHHMMSS.mmmZ>.archive.pinned
//! ```
//!
//! The checksum sidecar uses `sha256sum` format so operators can check it
//! with standard tools. The pinned marker is an empty file.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::tier::Tier;
use super::BackupError;

pub const ARCHIVE_EXTENSION: &str = "archive";
pub const CHECKSUM_SUFFIX: &str = ".sha256";
pub const PIN_SUFFIX: &str = ".pinned";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// Name of an archive created at `created_at`.
pub fn artifact_file_name(name: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        name,
        created_at.format(TIMESTAMP_FORMAT),
        ARCHIVE_EXTENSION
    )
}

/// Split an archive file name into its backup name and creation time.
pub fn parse_file_name(file_name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = file_name.strip_suffix(&format!(".{}", ARCHIVE_EXTENSION))?;
    let (name, stamp) = stem.rsplit_once('_')?;
    if name.is_empty() {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((name.to_string(), naive.and_utc()))
}

/// Outcome of checking an archive against its sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Mismatch { expected: String, actual: String },
    MissingChecksum,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }
}

/// A discovered archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArtifact {
    pub tier: Tier,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    /// Recorded SHA-256, if the sidecar exists and is well-formed.
    pub checksum: Option<String>,
    pub pinned: bool,
}

impl BackupArtifact {
    /// Load an archive's metadata from its path.
    pub fn from_path(path: &Path) -> Result<Self, BackupError> {
        let not_artifact = || BackupError::NotAnArtifact(path.to_path_buf());
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(not_artifact)?;
        let (name, created_at) = parse_file_name(file_name).ok_or_else(not_artifact)?;
        let tier = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<Tier>().ok())
            .ok_or_else(not_artifact)?;
        if !path.is_file() {
            return Err(not_artifact());
        }

        Ok(Self {
            tier,
            name,
            created_at,
            path: path.to_path_buf(),
            checksum: read_checksum(path).map_err(BackupError::io(checksum_path(path)))?,
            pinned: pin_path(path).exists(),
        })
    }

    pub fn checksum_path(&self) -> PathBuf {
        checksum_path(&self.path)
    }

    pub fn pin_path(&self) -> PathBuf {
        pin_path(&self.path)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn checksum_path(archive: &Path) -> PathBuf {
    with_suffix(archive, CHECKSUM_SUFFIX)
}

pub fn pin_path(archive: &Path) -> PathBuf {
    with_suffix(archive, PIN_SUFFIX)
}

/// All archives of one tier, oldest first.
///
/// A missing tier directory yields an empty list. Files that do not match
/// the archive naming scheme are ignored.
pub fn list_tier(root: &Path, tier: Tier) -> Result<Vec<BackupArtifact>, BackupError> {
    let dir = root.join(tier.as_ref());
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io(&dir)(e)),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BackupError::io(&dir))?;
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((name, created_at)) = parse_file_name(file_name) else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        artifacts.push(BackupArtifact {
            tier,
            name,
            created_at,
            checksum: read_checksum(&path).map_err(BackupError::io(checksum_path(&path)))?,
            pinned: pin_path(&path).exists(),
            path,
        });
    }

    artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
    debug!("{} tier: {} artifact(s) in {}", tier, artifacts.len(), dir.display());
    Ok(artifacts)
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the archive's checksum and write its sidecar atomically.
pub fn write_checksum(archive: &Path) -> io::Result<String> {
    let digest = sha256_file(archive)?;
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sidecar = checksum_path(archive);
    let tmp = with_suffix(&sidecar, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{}  {}", digest, file_name)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &sidecar)?;
    debug!("wrote checksum {}", sidecar.display());
    Ok(digest)
}

/// Read the recorded checksum. A missing or malformed sidecar is `None`.
pub fn read_checksum(archive: &Path) -> io::Result<Option<String>> {
    let file = match File::open(checksum_path(archive)) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line)?;
    let digest = line.split_whitespace().next().unwrap_or("");
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(Some(digest.to_ascii_lowercase()))
    } else {
        Ok(None)
    }
}

/// Recompute the archive digest and compare it with the sidecar.
pub fn verify(archive: &Path) -> Result<Verification, BackupError> {
    let Some(expected) = read_checksum(archive).map_err(BackupError::io(checksum_path(archive)))?
    else {
        return Ok(Verification::MissingChecksum);
    };
    let actual = sha256_file(archive).map_err(BackupError::io(archive))?;
    if actual == expected {
        Ok(Verification::Verified)
    } else {
        Ok(Verification::Mismatch { expected, actual })
    }
}

/// Exempt an archive from retention. Pinning twice is a no-op.
pub fn pin(archive: &Path) -> Result<BackupArtifact, BackupError> {
    let mut artifact = BackupArtifact::from_path(archive)?;
    let marker = artifact.pin_path();
    File::create(&marker)
        .and_then(|f| f.sync_all())
        .map_err(BackupError::io(&marker))?;
    artifact.pinned = true;
    info!("pinned {}", archive.display());
    Ok(artifact)
}

/// Return an archive to normal retention.
pub fn unpin(archive: &Path) -> Result<BackupArtifact, BackupError> {
    let mut artifact = BackupArtifact::from_path(archive)?;
    let marker = artifact.pin_path();
    match fs::remove_file(&marker) {
        Ok(()) => info!("unpinned {}", archive.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BackupError::io(&marker)(e)),
    }
    artifact.pinned = false;
    Ok(artifact)
}
