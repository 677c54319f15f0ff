use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::backup::Tier;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stackpilot/config.json";

/// stackpilot - idempotent server provisioning and tiered backups
#[derive(Parser)]
#[command(name = "stackpilot")]
#[command(about = "Resumable server provisioning with tiered, verified backups")]
#[command(version)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "STACKPILOT_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every provisioning step not yet recorded as complete
    Run,
    /// Report the last recorded failure, then continue the run
    Resume,
    /// Clear one step's completion marker and run it again
    Rerun {
        /// Step id (e.g. webserver)
        step: String,
    },
    /// Record a step as complete without running it
    Mark {
        /// Step id
        step: String,
    },
    /// Clear a step's completion marker without running anything
    Reset {
        /// Step id
        step: String,
    },
    /// Show the completion state of every step
    Status,
    /// Inspect or edit the provisioning state file
    State {
        #[command(subcommand)]
        action: StateCommands,
    },
    /// Produce, inspect and prune backups
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },
    /// Load and validate the configuration file
    Validate {
        /// Print a sample configuration instead
        #[arg(long)]
        print_example: bool,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Print one value
    Get { key: String },
    /// Set one value
    Set { key: String, value: String },
    /// Remove one key
    Unset { key: String },
    /// Print every entry as KEY=value
    List,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Produce one artifact now and apply retention (scheduler entry point)
    Run,
    /// List artifacts, oldest first within each tier
    List {
        /// Only this tier (daily, weekly, monthly)
        #[arg(short, long)]
        tier: Option<Tier>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Recompute checksums; exits 1 if any artifact fails
    Verify {
        /// Artifact path or file name; all artifacts when omitted
        artifact: Option<String>,
    },
    /// Exempt an artifact from retention
    Pin { artifact: String },
    /// Return an artifact to normal retention
    Unpin { artifact: String },
    /// Apply retention without producing a new artifact
    Prune {
        /// Only this tier
        #[arg(short, long)]
        tier: Option<Tier>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["stackpilot"]).is_err());
    }

    #[test]
    fn test_cli_run_with_config() {
        let cli = Cli::try_parse_from(["stackpilot", "--config", "/srv/stack.json", "run"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/srv/stack.json");
        assert!(matches!(cli.command, Commands::Run));
    }

    #[test]
    fn test_cli_config_after_subcommand() {
        let cli = Cli::try_parse_from(["stackpilot", "status", "-c", "/srv/stack.json"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/srv/stack.json");
    }

    #[test]
    fn test_cli_rerun_step() {
        let cli = Cli::try_parse_from(["stackpilot", "rerun", "webserver"]).unwrap();
        match cli.command {
            Commands::Rerun { step } => assert_eq!(step, "webserver"),
            _ => panic!("Expected Rerun command"),
        }
        assert!(Cli::try_parse_from(["stackpilot", "rerun"]).is_err());
    }

    #[test]
    fn test_cli_state_set() {
        let cli =
            Cli::try_parse_from(["stackpilot", "state", "set", "DOMAIN", "example.org"]).unwrap();
        match cli.command {
            Commands::State {
                action: StateCommands::Set { key, value },
            } => {
                assert_eq!(key, "DOMAIN");
                assert_eq!(value, "example.org");
            }
            _ => panic!("Expected State Set command"),
        }
    }

    #[test]
    fn test_cli_backup_list_tier() {
        let cli =
            Cli::try_parse_from(["stackpilot", "backup", "list", "--tier", "weekly"]).unwrap();
        match cli.command {
            Commands::Backup {
                action: BackupCommands::List { tier, json },
            } => {
                assert_eq!(tier, Some(Tier::Weekly));
                assert!(!json);
            }
            _ => panic!("Expected Backup List command"),
        }
    }

    #[test]
    fn test_cli_backup_rejects_unknown_tier() {
        assert!(Cli::try_parse_from(["stackpilot", "backup", "prune", "--tier", "hourly"]).is_err());
    }

    #[test]
    fn test_cli_backup_verify_all() {
        let cli = Cli::try_parse_from(["stackpilot", "backup", "verify"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backup {
                action: BackupCommands::Verify { artifact: None }
            }
        ));
    }

    #[test]
    fn test_cli_validate_print_example() {
        let cli = Cli::try_parse_from(["stackpilot", "validate", "--print-example"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Validate {
                print_example: true
            }
        ));
    }
}
