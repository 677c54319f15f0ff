//! stackpilot - Main entry point
//!
//! Thin dispatch over the library: load configuration, build the
//! orchestrator or backup service, print results to stdout and diagnostics
//! to stderr, and map errors onto exit codes.

use std::path::Path;
use std::process::ExitCode;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use stackpilot::backup::{BackupService, Verification};
use stackpilot::cli::{BackupCommands, Cli, Commands, StateCommands};
use stackpilot::config_file::StackConfig;
use stackpilot::error::{Result, StackError};
use stackpilot::lock::LockScope;
use stackpilot::orchestrator::{Orchestrator, RunReport};
use stackpilot::process_guard;
use stackpilot::state_store::{FileStateStore, StateStore};
use stackpilot::steps::default_registry;

/// Initialize logging. `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();

    // Children are still reaped via Drop if this fails.
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let cli = Cli::parse_args();
    debug!("Using configuration {:?}", cli.config);

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn report_error(err: &StackError) {
    error!("{}", err);
    match err {
        StackError::Orchestrator(oe) => match oe.halted_step() {
            Some(step) => eprintln!("✗ Halted at step {}: {}", step, oe),
            None => eprintln!("✗ {}", oe),
        },
        _ => eprintln!("✗ {}", err),
    }
}

fn load_config(path: &Path) -> Result<StackConfig> {
    StackConfig::load_validated(path).map_err(|e| StackError::config(format!("{:#}", e)))
}

fn orchestrator(config: &StackConfig) -> Result<Orchestrator<FileStateStore>> {
    let registry = default_registry(config)?;
    let store = FileStateStore::open(&config.state_file)?;
    Ok(Orchestrator::new(registry, store, config.lock_manager()))
}

fn backup_service(config: &StackConfig) -> Result<BackupService<FileStateStore>> {
    let store = FileStateStore::open(&config.state_file)?;
    Ok(BackupService::from_config(
        &config.backup,
        config.lock_manager(),
        store,
    ))
}

fn print_run_report(report: &RunReport) {
    println!(
        "✓ All steps complete: {} executed, {} already done",
        report.executed.len(),
        report.skipped.len()
    );
    for step in &report.executed {
        println!("  ran  {}", step);
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    if let Commands::Validate { print_example } = cli.command {
        return validate(&cli.config, print_example);
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => {
            let report = orchestrator(&config)?.run()?;
            print_run_report(&report);
        }
        Commands::Resume => {
            let mut orch = orchestrator(&config)?;
            match orch.last_failure() {
                Some(failure) => eprintln!(
                    "Resuming after step {} failed at {}: {}",
                    failure.step, failure.at, failure.reason
                ),
                None => info!("No recorded failure; running pending steps"),
            }
            let report = orch.run()?;
            print_run_report(&report);
        }
        Commands::Rerun { step } => {
            let report = orchestrator(&config)?.force_rerun(&step)?;
            print_run_report(&report);
        }
        Commands::Mark { step } => {
            orchestrator(&config)?.mark_complete(&step)?;
            println!("✓ Step {} marked complete", step);
        }
        Commands::Reset { step } => {
            orchestrator(&config)?.reset(&step)?;
            println!("✓ Step {} will run again on the next run", step);
        }
        Commands::Status => {
            let orch = orchestrator(&config)?;
            for state in orch.status()? {
                match &state.completed {
                    Some(at) => println!("{:<16} done     {}", state.id, at),
                    None => println!("{:<16} pending", state.id),
                }
            }
            if let Some(failure) = orch.last_failure() {
                println!(
                    "\nLast failure: step {} at {}: {}",
                    failure.step, failure.at, failure.reason
                );
            }
        }
        Commands::State { action } => return state_command(&config, action),
        Commands::Backup { action } => return backup_command(&config, action),
        Commands::Validate { .. } => {}
    }

    Ok(ExitCode::SUCCESS)
}

fn validate(path: &Path, print_example: bool) -> Result<ExitCode> {
    if print_example {
        println!("{}", serde_json::to_string_pretty(&StackConfig::example())?);
        return Ok(ExitCode::SUCCESS);
    }
    info!("Validating configuration file: {:?}", path);
    load_config(path)?;
    println!("✓ Configuration file is valid: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn state_command(config: &StackConfig, action: StateCommands) -> Result<ExitCode> {
    let mut store = FileStateStore::open(&config.state_file)?;

    match action {
        StateCommands::Get { key } => {
            if !store.exists(&key) {
                eprintln!("✗ {} is not set", key);
                return Ok(ExitCode::from(1));
            }
            println!("{}", store.load(&key, ""));
        }
        StateCommands::List => {
            for (key, value) in store.entries() {
                println!("{}={}", key, value);
            }
        }
        StateCommands::Set { key, value } => {
            // Writers of the state file serialize on the orchestration lock.
            let _guard = config.lock_manager().acquire(LockScope::Orchestration)?;
            store.refresh()?;
            store.save(&key, &value)?;
            info!("Set {}", key);
        }
        StateCommands::Unset { key } => {
            let _guard = config.lock_manager().acquire(LockScope::Orchestration)?;
            store.refresh()?;
            store.remove(&key)?;
            info!("Removed {}", key);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn backup_command(config: &StackConfig, action: BackupCommands) -> Result<ExitCode> {
    let mut service = backup_service(config)?;

    match action {
        BackupCommands::Run => {
            let report = service.trigger()?;
            println!(
                "✓ {} ({} tier), {} pruned",
                report.artifact.path.display(),
                report.artifact.tier,
                report.removed_count()
            );
        }
        BackupCommands::List { tier, json } => {
            let artifacts = service.list(tier)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&artifacts)?);
            } else {
                for artifact in &artifacts {
                    println!(
                        "{:<8} {}  {}{}",
                        artifact.tier.as_ref(),
                        artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                        artifact.path.display(),
                        if artifact.pinned { "  [pinned]" } else { "" }
                    );
                }
            }
        }
        BackupCommands::Verify { artifact } => {
            let results = match artifact {
                Some(name) => vec![service.verify(&name)?],
                None => service
                    .verify_all()?
                    .into_iter()
                    .map(|(a, v)| (a.path, v))
                    .collect(),
            };
            let mut failed = 0;
            for (path, verification) in &results {
                match verification {
                    Verification::Verified => println!("✓ {}", path.display()),
                    Verification::Mismatch { expected, actual } => {
                        failed += 1;
                        println!(
                            "✗ {}: checksum mismatch (expected {}, got {})",
                            path.display(),
                            expected,
                            actual
                        );
                    }
                    Verification::MissingChecksum => {
                        failed += 1;
                        println!("✗ {}: no checksum recorded", path.display());
                    }
                }
            }
            if failed > 0 {
                eprintln!("✗ {} of {} artifact(s) failed verification", failed, results.len());
                return Ok(ExitCode::from(1));
            }
        }
        BackupCommands::Pin { artifact } => {
            let pinned = service.pin(&artifact)?;
            println!("✓ Pinned {}", pinned.path.display());
        }
        BackupCommands::Unpin { artifact } => {
            let unpinned = service.unpin(&artifact)?;
            println!("✓ Unpinned {}", unpinned.path.display());
        }
        BackupCommands::Prune { tier } => {
            for report in service.prune(tier)? {
                println!(
                    "{:<8} kept {}, pinned {}, removed {}",
                    report.tier.as_ref(),
                    report.kept,
                    report.pinned,
                    report.removed.len()
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
