//! Typed script invocation contracts.
//!
//! Provisioning scripts and snapshot commands are external collaborators.
//! Instead of raw argument vectors, each invocation is a struct implementing
//! [`ScriptArgs`], so the command line and environment contract live in one
//! place.

use std::path::PathBuf;

/// Trait for typed script arguments.
///
/// # Contract
///
/// - `program()`: the executable to launch (`bash`, a dump tool, ...)
/// - `to_cli_args()`: arguments exactly as the script expects them
/// - `get_env_vars()`: environment variables the script requires
/// - `label()`: short name used in logs and error messages
pub trait ScriptArgs {
    fn program(&self) -> String {
        "bash".to_string()
    }

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)>;

    fn label(&self) -> String;
}

/// Invocation of a step's provisioning script: `bash <scripts_dir>/<step>.sh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepScriptArgs {
    pub script: PathBuf,
    pub step_id: String,
    pub state_file: Option<PathBuf>,
    /// State entries exported to the script
    pub state: Vec<(String, String)>,
}

impl ScriptArgs for StepScriptArgs {
    fn to_cli_args(&self) -> Vec<String> {
        vec![self.script.display().to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        let mut env = self.state.clone();
        env.push(("STACKPILOT_STEP".to_string(), self.step_id.clone()));
        if let Some(path) = &self.state_file {
            env.push((
                "STACKPILOT_STATE_FILE".to_string(),
                path.display().to_string(),
            ));
        }
        env
    }

    fn label(&self) -> String {
        format!("step {}", self.step_id)
    }
}

/// Invocation of the configured snapshot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCommandArgs {
    /// argv; the first element is the program
    pub command: Vec<String>,
    pub output: PathBuf,
    pub tier: String,
    pub name: String,
    /// State entries exported to the command
    pub state: Vec<(String, String)>,
}

impl ScriptArgs for SnapshotCommandArgs {
    fn program(&self) -> String {
        self.command.first().cloned().unwrap_or_default()
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.command.iter().skip(1).cloned().collect()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        let mut env = self.state.clone();
        env.push(("BACKUP_OUTPUT".to_string(), self.output.display().to_string()));
        env.push(("BACKUP_TIER".to_string(), self.tier.clone()));
        env.push(("BACKUP_NAME".to_string(), self.name.clone()));
        env
    }

    fn label(&self) -> String {
        format!("snapshot command {}", self.program())
    }
}
