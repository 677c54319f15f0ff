//! Orchestrator integration tests
//!
//! These tests verify:
//! - Completed steps are skipped without invoking their action
//! - A failed run resumes exactly at the failed step
//! - Operator marks, resets and forced re-runs
//! - State persists across processes through the state file
//! - A second orchestrator fails with Busy while the lock is held
//! - An unwritable state file stops the run without claiming progress

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stackpilot::lock::{LockError, LockManager, LockScope};
use stackpilot::logic::resolver::{ResolveError, StepRegistry};
use stackpilot::orchestrator::{Orchestrator, OrchestratorError, LAST_FAILED_STEP};
use stackpilot::error::StackError;
use stackpilot::state_store::{FileStateStore, MemoryStateStore, StateError, StateStore};
use stackpilot::step::{Step, StepContext};

/// Records which actions ran and lets a test make `b` fail on demand.
#[derive(Clone, Default)]
struct Harness {
    ran: Arc<Mutex<Vec<String>>>,
    fail_b: Arc<AtomicBool>,
}

impl Harness {
    fn step(&self, id: &'static str) -> Step {
        let ran = Arc::clone(&self.ran);
        let fail_b = Arc::clone(&self.fail_b);
        Step::from_fn(id, move |ctx: &StepContext| {
            if ctx.step_id == "b" && fail_b.load(Ordering::SeqCst) {
                anyhow::bail!("database socket not ready");
            }
            ran.lock().unwrap().push(ctx.step_id.clone());
            Ok(())
        })
    }

    /// a -> b -> c
    fn registry(&self) -> StepRegistry {
        StepRegistry::builder()
            .step(self.step("a").idempotency_key("A_COMPLETED"))
            .step(self.step("b").depends_on("a").idempotency_key("B_COMPLETED"))
            .step(self.step("c").depends_on("b").idempotency_key("C_COMPLETED"))
            .build()
            .unwrap()
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.ran.lock().unwrap())
    }
}

/// Memory store whose writes of one key fail as if the disk were full.
struct UnwritableKey {
    inner: MemoryStateStore,
    key: &'static str,
}

impl StateStore for UnwritableKey {
    fn exists(&self, key: &str) -> bool {
        self.inner.exists(key)
    }

    fn load(&self, key: &str, default: &str) -> String {
        self.inner.load(key, default)
    }

    fn save(&mut self, key: &str, value: &str) -> Result<(), StateError> {
        if key == self.key {
            return Err(StateError::Unwritable {
                path: "/var/lib/stackpilot/state.env".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "No space left on device"),
            });
        }
        self.inner.save(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StateError> {
        self.inner.remove(key)
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.inner.entries()
    }
}

fn locks(dir: &std::path::Path) -> LockManager {
    LockManager::new(dir.join("locks"), Duration::from_millis(300))
}

fn orchestrator<S: StateStore>(
    harness: &Harness,
    store: S,
    dir: &std::path::Path,
) -> Orchestrator<S> {
    Orchestrator::new(harness.registry(), store, locks(dir))
        .with_interrupt(Arc::new(AtomicBool::new(false)))
}

#[test]
fn test_second_run_skips_everything() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());

    let first = orch.run().unwrap();
    assert_eq!(first.executed, ["a", "b", "c"]);
    assert_eq!(harness.take(), ["a", "b", "c"]);

    let second = orch.run().unwrap();
    assert!(second.executed.is_empty());
    assert_eq!(second.skipped, ["a", "b", "c"]);
    assert!(harness.take().is_empty());
}

#[test]
fn test_resume_reenters_at_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    harness.fail_b.store(true, Ordering::SeqCst);
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());

    let err = orch.run().unwrap_err();
    match &err {
        OrchestratorError::StepFailed { step, reason } => {
            assert_eq!(step, "b");
            assert!(reason.contains("database socket not ready"));
        }
        other => panic!("Expected StepFailed, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);
    assert_eq!(harness.take(), ["a"]);
    assert!(orch.store().exists("A_COMPLETED"));
    assert!(!orch.store().exists("B_COMPLETED"));
    assert!(!orch.store().exists("C_COMPLETED"));
    assert_eq!(orch.last_failure().unwrap().step, "b");

    harness.fail_b.store(false, Ordering::SeqCst);
    let report = orch.run().unwrap();
    assert_eq!(report.skipped, ["a"]);
    assert_eq!(report.executed, ["b", "c"]);
    assert_eq!(harness.take(), ["b", "c"]);
    assert!(orch.last_failure().is_none());
    assert!(!orch.store().exists(LAST_FAILED_STEP));
}

#[test]
fn test_out_of_band_mark_skips_failed_step() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    harness.fail_b.store(true, Ordering::SeqCst);
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());

    assert!(orch.run().is_err());
    harness.take();

    // The operator fixed `b` by hand.
    orch.mark_complete("b").unwrap();
    let report = orch.run().unwrap();
    assert_eq!(report.executed, ["c"]);
    assert_eq!(harness.take(), ["c"]);
}

#[test]
fn test_force_rerun_runs_only_that_step() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());
    orch.run().unwrap();
    harness.take();

    let report = orch.force_rerun("b").unwrap();
    assert_eq!(report.executed, ["b"]);
    assert_eq!(report.skipped, ["a", "c"]);
    assert_eq!(harness.take(), ["b"]);
    assert!(orch.store().exists("B_COMPLETED"));
}

#[test]
fn test_reset_and_unknown_step() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());
    orch.run().unwrap();

    orch.reset("c").unwrap();
    let status = orch.status().unwrap();
    let c = status.iter().find(|s| s.id == "c").unwrap();
    assert!(c.completed.is_none());
    assert!(status.iter().filter(|s| s.id != "c").all(|s| s.completed.is_some()));

    let err = orch.mark_complete("nginx").unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Resolve(ResolveError::UnknownStep(ref id)) if id == "nginx"
    ));
}

#[test]
fn test_unwritable_marker_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::default();
    let store = UnwritableKey {
        inner: MemoryStateStore::new(),
        key: "B_COMPLETED",
    };
    let mut orch = orchestrator(&harness, store, dir.path());

    let err = orch.run().unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::State(StateError::Unwritable { .. })
    ));
    assert_eq!(err.exit_code(), 2);
    assert!(err.halted_step().is_none());

    // `b` ran but is not recorded, and nothing after it started.
    assert_eq!(harness.take(), ["a", "b"]);
    assert!(orch.store().exists("A_COMPLETED"));
    assert!(!orch.store().exists("B_COMPLETED"));
    assert!(!orch.store().exists("C_COMPLETED"));

    let err: StackError = err.into();
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_actions_see_state() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_step = Arc::clone(&seen);
    let registry = StepRegistry::builder()
        .step(Step::from_fn("webserver", move |ctx: &StepContext| {
            *seen_in_step.lock().unwrap() = ctx.require("DOMAIN")?.to_string();
            Ok(())
        }))
        .build()
        .unwrap();

    let mut store = MemoryStateStore::new();
    store.save("DOMAIN", "example.org").unwrap();
    let mut orch = Orchestrator::new(registry, store, locks(dir.path()))
        .with_interrupt(Arc::new(AtomicBool::new(false)));
    orch.run().unwrap();

    assert_eq!(*seen.lock().unwrap(), "example.org");
}

#[test]
fn test_state_file_persists_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.env");
    let harness = Harness::default();

    {
        let store = FileStateStore::open(&state_path).unwrap();
        let mut orch = orchestrator(&harness, store, dir.path());
        orch.run().unwrap();
    }
    assert_eq!(harness.take(), ["a", "b", "c"]);

    let content = std::fs::read_to_string(&state_path).unwrap();
    assert!(content.contains("A_COMPLETED="));
    assert!(content.contains("C_COMPLETED="));

    // A fresh process sees the markers and does nothing.
    let store = FileStateStore::open(&state_path).unwrap();
    let mut orch = orchestrator(&harness, store, dir.path());
    let report = orch.run().unwrap();
    assert!(report.executed.is_empty());
    assert!(harness.take().is_empty());
}

#[test]
fn test_interrupt_halts_before_next_step() {
    let dir = tempfile::tempdir().unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let count = Arc::new(AtomicUsize::new(0));

    let (flag_a, count_a) = (Arc::clone(&flag), Arc::clone(&count));
    let count_b = Arc::clone(&count);
    let registry = StepRegistry::builder()
        .step(Step::from_fn("a", move |_: &StepContext| {
            count_a.fetch_add(1, Ordering::SeqCst);
            // SIGTERM arrives while `a` is finishing.
            flag_a.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .step(
            Step::from_fn("b", move |_: &StepContext| {
                count_b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .depends_on("a"),
        )
        .build()
        .unwrap();

    let mut orch = Orchestrator::new(registry, MemoryStateStore::new(), locks(dir.path()))
        .with_interrupt(Arc::clone(&flag));
    let err = orch.run().unwrap_err();

    assert!(matches!(err, OrchestratorError::Interrupted { ref step } if step == "b"));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(orch.store().exists("a"));
    assert!(!orch.store().exists("b"));
}

#[test]
fn test_concurrent_orchestrator_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let holder = locks(dir.path());
    let _held = holder.acquire(LockScope::Orchestration).unwrap();

    let harness = Harness::default();
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());
    let err = orch.run().unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Lock(LockError::Busy {
            scope: LockScope::Orchestration,
            ..
        })
    ));
    assert_eq!(err.exit_code(), 75);
    assert!(harness.take().is_empty());
}

#[test]
fn test_backup_lock_does_not_block_orchestration() {
    let dir = tempfile::tempdir().unwrap();
    let holder = locks(dir.path());
    let _held = holder.acquire(LockScope::Backup).unwrap();

    let harness = Harness::default();
    let mut orch = orchestrator(&harness, MemoryStateStore::new(), dir.path());
    assert!(orch.run().is_ok());
}

#[test]
fn test_cycle_rejected_at_build() {
    let harness = Harness::default();
    let err = StepRegistry::builder()
        .step(harness.step("a").depends_on("b"))
        .step(harness.step("b").depends_on("a"))
        .build()
        .unwrap_err();
    assert!(matches!(err, ResolveError::Cycle(_)));
}
