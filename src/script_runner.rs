//! Type-Safe Script Execution
//!
//! The only sanctioned way to launch a provisioning script or snapshot
//! command. Every child goes through [`run_script_safe`] so that:
//!
//! - it runs in its own process group and dies with its parent
//! - its PID is registered for cleanup on SIGINT/SIGTERM
//! - its arguments and environment come from a [`ScriptArgs`] contract

use crate::process_guard::{ChildHandle, CommandProcessGroup};
use crate::script_traits::ScriptArgs;
use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Execute a script with type-safe arguments and wait for it.
///
/// stdin is null: scripts must be non-interactive. Secrets in the
/// environment are not logged, only variable names.
///
/// # Returns
///
/// - `Ok(output)` - the script ran; check `output.success`
/// - `Err` - the program could not be spawned or waited on
pub fn run_script_safe<T: ScriptArgs>(args: &T) -> Result<ScriptOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();
    let label = args.label();

    let env_names: Vec<&str> = env_vars.iter().map(|(k, _)| k.as_str()).collect();
    info!("run_script_safe: {} {:?} env={:?}", program, cli_args, env_names);

    let mut cmd = Command::new(&program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {}: {}", label, program))?;
    let _registration = ChildHandle::register(child.id());

    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed waiting for {}", label))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();

    for line in stdout.lines() {
        debug!("[{}] {}", label, line);
    }

    if output.status.success() {
        info!("{} executed successfully", label);
    } else {
        warn!("{} failed with exit code {:?}", label, exit_code);
    }

    Ok(ScriptOutput {
        stdout,
        stderr,
        exit_code,
        success: output.status.success(),
    })
}

/// Output from a script execution.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// Standard output from the script.
    pub stdout: String,
    /// Standard error from the script.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the script exited successfully (exit code 0).
    pub success: bool,
}

impl ScriptOutput {
    /// Check if the script succeeded and return an error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let detail = self.stderr.trim();
        match self.exit_code {
            Some(code) => anyhow::bail!("{} failed (exit code {}): {}", context, code, detail),
            None => anyhow::bail!("{} was terminated by a signal: {}", context, detail),
        }
    }
}
