//! Durable key/value state
//!
//! The state store is the single record of what has been done: step
//! completion markers, the last recorded failure, and operator-supplied
//! values such as `DOMAIN` that provisioning scripts consume.
//!
//! # On-disk format
//!
//! ```text
//! # comments and blank lines are ignored
//! DOMAIN=example.org
//! PREFLIGHT_COMPLETED=2026-10-18T09:12:44Z
//! ```
//!
//! One `KEY=value` pair per line, no nesting, no escaping. A missing file is
//! an empty state. When a key appears twice the last line wins.
//!
//! # Durability
//!
//! Every `save`/`remove` rewrites the whole file into a temp sibling, calls
//! `fsync`, renames it over the original and syncs the parent directory.
//! A concurrent reader sees either the old file or the new one, never a torn
//! value, and a returned `Ok` means the write survived a crash.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by a state store.
///
/// All of them are fatal to an orchestration run: without durable completion
/// markers the orchestrator cannot make safe progress.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invalid state key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("invalid value for state key {key}: values cannot contain newlines")]
    InvalidValue { key: String },

    #[error("state file {} is not readable: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {} is not writable: {source}", .path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keyed persistence contract shared by the orchestrator and backup service.
pub trait StateStore {
    /// Returns true if `key` has a recorded value (possibly empty).
    fn exists(&self, key: &str) -> bool;

    /// Returns the value for `key`, or `default` when absent.
    fn load(&self, key: &str, default: &str) -> String;

    /// Create or overwrite `key`. Durable once this returns `Ok`.
    fn save(&mut self, key: &str, value: &str) -> Result<(), StateError>;

    /// Remove `key`. Removing an absent key is a no-op.
    fn remove(&mut self, key: &str) -> Result<(), StateError>;

    /// All entries, sorted by key.
    fn entries(&self) -> Vec<(String, String)>;

    /// Pick up writes made by other processes. Called after taking a lock.
    fn refresh(&mut self) -> Result<(), StateError> {
        Ok(())
    }
}

/// Validate a key before it is written.
pub fn validate_key(key: &str) -> Result<(), StateError> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.contains('=') {
        "key contains '='"
    } else if key.chars().any(char::is_whitespace) {
        "key contains whitespace"
    } else if key.starts_with('#') {
        "key starts with '#'"
    } else {
        return Ok(());
    };
    Err(StateError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

fn validate_entry(key: &str, value: &str) -> Result<(), StateError> {
    validate_key(key)?;
    if value.contains('\n') || value.contains('\r') {
        return Err(StateError::InvalidValue {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Parse the flat `KEY=value` format.
pub fn parse_entries(content: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match trimmed.split_once('=') {
            Some((key, value)) if validate_key(key).is_ok() => {
                entries.insert(key.to_string(), value.to_string());
            }
            _ => warn!("Ignoring malformed state line {}: {:?}", lineno + 1, line),
        }
    }
    entries
}

/// Render entries back to the flat format.
pub fn render_entries(entries: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// State store backed by a flat `KEY=value` file.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStateStore {
    /// Open (or lazily create) the state file at `path`.
    ///
    /// A missing file is an empty state; the file and its parent directory
    /// are created on the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => parse_entries(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file {} does not exist yet", path.display());
                BTreeMap::new()
            }
            Err(source) => return Err(StateError::Unreadable { path, source }),
        };
        Ok(Self { path, entries })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StateError> {
        let unwritable = |source| StateError::Unwritable {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(unwritable)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, std::process::id()));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(render_entries(entries).as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            File::open(&dir)?.sync_all()
        };

        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            unwritable(e)
        })
    }
}

impl StateStore for FileStateStore {
    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn load(&self, key: &str, default: &str) -> String {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StateError> {
        validate_entry(key, value)?;
        // Commit to memory only after the file write succeeded.
        let mut next = self.entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        self.entries = next;
        debug!("state: set {}", key);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StateError> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        let mut next = self.entries.clone();
        next.remove(key);
        self.persist(&next)?;
        self.entries = next;
        debug!("state: removed {}", key);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn refresh(&mut self) -> Result<(), StateError> {
        *self = Self::open(self.path.clone())?;
        Ok(())
    }
}

/// Non-durable state store for tests and previews.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn load(&self, key: &str, default: &str) -> String {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StateError> {
        validate_entry(key, value)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StateError> {
        self.entries.remove(key);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_state() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state.env")).unwrap();
        assert!(!store.exists("DOMAIN"));
        assert_eq!(store.load("DOMAIN", "fallback"), "fallback");
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_save_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.env");

        let mut store = FileStateStore::open(&path).unwrap();
        store.save("DOMAIN", "example.org").unwrap();
        store.save("PREFLIGHT_COMPLETED", "true").unwrap();
        store.save("DOMAIN", "example.net").unwrap();

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.load("DOMAIN", ""), "example.net");
        assert!(reopened.exists("PREFLIGHT_COMPLETED"));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "DOMAIN=example.net\nPREFLIGHT_COMPLETED=true\n");
    }

    #[test]
    fn test_empty_value_is_present() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::open(dir.path().join("state.env")).unwrap();
        store.save("ADMIN_EMAIL", "").unwrap();
        assert!(store.exists("ADMIN_EMAIL"));
        assert_eq!(store.load("ADMIN_EMAIL", "unset"), "");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.env");
        let mut store = FileStateStore::open(&path).unwrap();

        store.remove("NEVER_WRITTEN").unwrap();
        assert!(!path.exists(), "removing an absent key must not touch disk");

        store.save("KEY", "v").unwrap();
        store.remove("KEY").unwrap();
        store.remove("KEY").unwrap();
        assert!(!FileStateStore::open(&path).unwrap().exists("KEY"));
    }

    #[test]
    fn test_parse_skips_comments_and_malformed_lines() {
        let entries = parse_entries("# header\n\nDOMAIN=a=b\nnot a pair\n=novalue\nX=1\nX=2\n");
        assert_eq!(entries.get("DOMAIN").map(String::as_str), Some("a=b"));
        assert_eq!(entries.get("X").map(String::as_str), Some("2"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_invalid_keys_and_values_rejected() {
        let mut store = MemoryStateStore::new();
        assert!(matches!(
            store.save("", "v"),
            Err(StateError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.save("A=B", "v"),
            Err(StateError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.save("A B", "v"),
            Err(StateError::InvalidKey { .. })
        ));
        assert!(matches!(
            store.save("KEY", "line1\nline2"),
            Err(StateError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unwritable_location_is_reported() {
        let dir = tempdir().unwrap();
        let parent = dir.path().join("lib");
        fs::create_dir(&parent).unwrap();
        let mut store = FileStateStore::open(parent.join("state.env")).unwrap();

        // A regular file now sits where the parent directory should be.
        fs::remove_dir(&parent).unwrap();
        fs::write(&parent, "x").unwrap();

        let err = store.save("KEY", "v").unwrap_err();
        assert!(matches!(err, StateError::Unwritable { .. }));
        assert!(!store.exists("KEY"), "failed write must not update memory");
    }

    #[test]
    fn test_refresh_sees_other_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.env");
        let mut reader = FileStateStore::open(&path).unwrap();
        let mut writer = FileStateStore::open(&path).unwrap();

        writer.save("DOMAIN", "example.org").unwrap();
        assert!(!reader.exists("DOMAIN"));
        reader.refresh().unwrap();
        assert_eq!(reader.load("DOMAIN", ""), "example.org");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::open(dir.path().join("state.env")).unwrap();
        store.save("A", "1").unwrap();
        store.save("B", "2").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.env".to_string()]);
    }
}
