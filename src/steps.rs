//! Built-in step vocabulary
//!
//! The stack is provisioned by a fixed set of steps, each backed by a bash
//! script named after the step in the configured scripts directory.
//!
//! | Step | Depends on | Completion key |
//! |------|------------|----------------|
//! | `preflight` | — | `PREFLIGHT_COMPLETED` |
//! | `packages` | `preflight` | `PACKAGES_COMPLETED` |
//! | `database` | `packages` | `DATABASE_COMPLETED` |
//! | `application` | `database` | `APPLICATION_COMPLETED` |
//! | `webserver` | `application` | `WEBSERVER_COMPLETED` |
//! | `tls` | `webserver` | `TLS_COMPLETED` |
//! | `firewall` | `packages` | `FIREWALL_COMPLETED` |
//! | `backup_schedule` | `application` | `BACKUP_SCHEDULE_COMPLETED` |

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::config_file::StackConfig;
use crate::logic::resolver::{ResolveError, StepRegistry};
use crate::script_runner::run_script_safe;
use crate::script_traits::StepScriptArgs;
use crate::step::{ProvisioningAction, Step, StepContext};

/// `(id, dependencies)` in registration order.
pub const BUILTIN_STEPS: &[(&str, &[&str])] = &[
    ("preflight", &[]),
    ("packages", &["preflight"]),
    ("database", &["packages"]),
    ("application", &["database"]),
    ("webserver", &["application"]),
    ("tls", &["webserver"]),
    ("firewall", &["packages"]),
    ("backup_schedule", &["application"]),
];

/// State key recording completion of a built-in step.
pub fn completion_key(step_id: &str) -> String {
    format!("{}_COMPLETED", step_id.to_ascii_uppercase())
}

/// Runs `<scripts_dir>/<step>.sh` with the state exported to its environment.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    script: PathBuf,
    state_file: Option<PathBuf>,
}

impl ScriptAction {
    pub fn new(scripts_dir: &Path, step_id: &str, state_file: Option<PathBuf>) -> Self {
        Self {
            script: scripts_dir.join(format!("{}.sh", step_id)),
            state_file,
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

impl ProvisioningAction for ScriptAction {
    fn run(&self, ctx: &StepContext) -> Result<()> {
        if !self.script.is_file() {
            bail!("provisioning script {} not found", self.script.display());
        }
        let args = StepScriptArgs {
            script: self.script.clone(),
            step_id: ctx.step_id.clone(),
            state_file: self.state_file.clone(),
            state: ctx
                .state
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        run_script_safe(&args)?.ensure_success(&self.script.display().to_string())
    }

    fn describe(&self) -> String {
        format!("bash {}", self.script.display())
    }
}

/// Registry of the built-in steps wired to the configured scripts.
pub fn default_registry(config: &StackConfig) -> Result<StepRegistry, ResolveError> {
    BUILTIN_STEPS
        .iter()
        .fold(StepRegistry::builder(), |builder, (id, deps)| {
            let action = ScriptAction::new(&config.scripts_dir, id, Some(config.state_file.clone()));
            let step = deps
                .iter()
                .fold(Step::new(*id, action), |step, dep| step.depends_on(*dep))
                .idempotency_key(completion_key(id));
            builder.step(step)
        })
        .build()
}
