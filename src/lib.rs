//! stackpilot Library
//!
//! Idempotent, state-driven provisioning of a server stack plus tiered
//! backups with retention. The binary in `main.rs` is a thin CLI over
//! these modules.

pub mod backup;
pub mod cli;
pub mod config_file;
pub mod error;
pub mod lock;
pub mod logic;
pub mod orchestrator;
pub mod process_guard;
pub mod script_runner;
pub mod script_traits;
pub mod state_store;
pub mod step;
pub mod steps;

// Re-export main types for convenience
pub use backup::{
    BackupArtifact, BackupError, BackupService, PruneReport, RetentionPolicy, SnapshotSource,
    Tier, TriggerReport, Verification,
};
pub use config_file::{BackupConfig, StackConfig};
pub use error::StackError;
pub use lock::{LockError, LockGuard, LockManager, LockScope};
pub use logic::resolver::{ResolveError, StepRegistry};
pub use orchestrator::{Orchestrator, OrchestratorError, RunReport};
pub use process_guard::{ChildRegistry, CommandProcessGroup};
pub use script_runner::{run_script_safe, ScriptOutput};
pub use script_traits::ScriptArgs;
pub use state_store::{FileStateStore, MemoryStateStore, StateError, StateStore};
pub use step::{ProvisioningAction, Step, StepContext, StepStatus};
