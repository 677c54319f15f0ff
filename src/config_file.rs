//! Configuration file handling.
//!
//! stackpilot reads a single JSON document. Retention counts have no
//! built-in defaults and must be present in the file.
//!
//! ```json
//! {
//!   "state_file": "/var/lib/stackpilot/state.env",
//!   "lock_dir": "/run/stackpilot",
//!   "lock_timeout_secs": 30,
//!   "scripts_dir": "/usr/lib/stackpilot/steps",
//!   "backup": {
//!     "root": "/var/backups/stackpilot",
//!     "name": "stack",
//!     "week_ends_on": "Sun",
//!     "retention": { "daily": 7, "weekly": 4, "monthly": 12 },
//!     "snapshot_command": ["/usr/lib/stackpilot/snapshot.sh"]
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::RetentionPolicy;
use crate::lock::LockManager;

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_week_end() -> Weekday {
    Weekday::Sun
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Flat `KEY=value` file holding provisioning state
    pub state_file: PathBuf,
    /// Directory holding `<scope>.lock` files
    pub lock_dir: PathBuf,
    /// How long to wait for a busy lock before giving up
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Directory holding `<step>.sh` provisioning scripts
    pub scripts_dir: PathBuf,
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Archive root; tiers live in subdirectories
    pub root: PathBuf,
    /// Prefix of every artifact file name
    pub name: String,
    #[serde(default = "default_week_end")]
    pub week_ends_on: Weekday,
    pub retention: RetentionPolicy,
    /// argv of the command that writes `BACKUP_OUTPUT`
    pub snapshot_command: Vec<String>,
}

impl StackConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load and validate in one step
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load_from_file(&path)?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path.as_ref()))?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_file.as_os_str().is_empty() {
            anyhow::bail!("state_file must be specified");
        }
        if self.state_file.file_name().is_none() {
            anyhow::bail!("state_file must name a file, got {:?}", self.state_file);
        }
        if self.lock_dir.as_os_str().is_empty() {
            anyhow::bail!("lock_dir must be specified");
        }
        if self.scripts_dir.as_os_str().is_empty() {
            anyhow::bail!("scripts_dir must be specified");
        }
        self.backup.validate()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(self.lock_dir.clone(), self.lock_timeout())
    }

    /// Sample configuration, also used by `validate --print-example`
    pub fn example() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/stackpilot/state.env"),
            lock_dir: PathBuf::from("/run/stackpilot"),
            lock_timeout_secs: default_lock_timeout_secs(),
            scripts_dir: PathBuf::from("/usr/lib/stackpilot/steps"),
            backup: BackupConfig {
                root: PathBuf::from("/var/backups/stackpilot"),
                name: "stack".to_string(),
                week_ends_on: default_week_end(),
                retention: RetentionPolicy {
                    daily: 7,
                    weekly: 4,
                    monthly: 12,
                },
                snapshot_command: vec!["/usr/lib/stackpilot/snapshot.sh".to_string()],
            },
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            anyhow::bail!("backup.root must be specified");
        }
        let name = self.name.trim();
        if name.is_empty() {
            anyhow::bail!("backup.name must be specified");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("backup.name can only contain letters, numbers, '-' and '_'");
        }
        if self.snapshot_command.is_empty() || self.snapshot_command[0].trim().is_empty() {
            anyhow::bail!("backup.snapshot_command must name a program");
        }
        Ok(())
    }
}
