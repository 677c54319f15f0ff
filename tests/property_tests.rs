//! Property-Based Tests for stackpilot
//!
//! These tests verify:
//! - Retention never selects a pinned artifact and keeps at most N unpinned
//! - Retention deletes strictly older artifacts than it keeps, oldest first
//! - Step ordering places every dependency before its dependents
//! - Tier classification precedence

use std::path::PathBuf;

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use proptest::prelude::*;

use stackpilot::backup::artifact::BackupArtifact;
use stackpilot::backup::retention::plan_prune;
use stackpilot::backup::Tier;
use stackpilot::logic::resolver::StepRegistry;
use stackpilot::step::{Step, StepContext};

// =============================================================================
// Retention
// =============================================================================

/// Artifacts with distinct creation times; the bool marks pinned ones.
fn artifacts_strategy() -> impl Strategy<Value = Vec<BackupArtifact>> {
    prop::collection::btree_set(0i64..100_000, 0..30)
        .prop_flat_map(|offsets| {
            let n = offsets.len();
            (Just(offsets), prop::collection::vec(any::<bool>(), n))
        })
        .prop_map(|(offsets, pins)| {
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            offsets
                .into_iter()
                .zip(pins)
                .map(|(offset, pinned)| BackupArtifact {
                    tier: Tier::Daily,
                    name: "site".to_string(),
                    created_at: base + Duration::seconds(offset),
                    path: PathBuf::from(format!("/b/daily/{offset}.archive")),
                    checksum: None,
                    pinned,
                })
                .collect()
        })
}

proptest! {
    /// Pinned artifacts are never deletion candidates
    #[test]
    fn prune_never_deletes_pinned(artifacts in artifacts_strategy(), keep in 0usize..10) {
        let pinned_in = artifacts.iter().filter(|a| a.pinned).count();
        let plan = plan_prune(artifacts, keep);
        prop_assert!(plan.delete.iter().all(|a| !a.pinned));
        prop_assert!(plan.keep.iter().all(|a| !a.pinned));
        prop_assert_eq!(plan.pinned.len(), pinned_in);
    }

    /// Exactly min(keep, unpinned) survive; nothing is lost or duplicated
    #[test]
    fn prune_keeps_at_most_keep_count(artifacts in artifacts_strategy(), keep in 0usize..10) {
        let total = artifacts.len();
        let unpinned = artifacts.iter().filter(|a| !a.pinned).count();
        let plan = plan_prune(artifacts, keep);
        prop_assert_eq!(plan.keep.len(), keep.min(unpinned));
        prop_assert_eq!(plan.keep.len() + plan.delete.len() + plan.pinned.len(), total);
    }

    /// Kept artifacts are the newest; deletions run oldest first
    #[test]
    fn prune_deletes_oldest_first(artifacts in artifacts_strategy(), keep in 0usize..10) {
        let plan = plan_prune(artifacts, keep);
        if let (Some(oldest_kept), Some(newest_deleted)) =
            (plan.keep.iter().map(|a| a.created_at).min(), plan.delete.last())
        {
            prop_assert!(newest_deleted.created_at < oldest_kept);
        }
        prop_assert!(plan.delete.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }
}

// =============================================================================
// Step ordering
// =============================================================================

/// Adjacency matrix; step i may depend on any j < i, so the graph is acyclic.
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<bool>>> {
    (1usize..12).prop_flat_map(|n| prop::collection::vec(prop::collection::vec(any::<bool>(), n), n))
}

fn build(matrix: &[Vec<bool>], reverse: bool) -> StepRegistry {
    let mut steps: Vec<Step> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let step = Step::from_fn(format!("s{i}"), |_: &StepContext| Ok(()));
            row.iter()
                .take(i)
                .enumerate()
                .filter(|(_, edge)| **edge)
                .fold(step, |step, (j, _)| step.depends_on(format!("s{j}")))
        })
        .collect();
    if reverse {
        steps.reverse();
    }
    steps
        .into_iter()
        .fold(StepRegistry::builder(), |b, s| b.step(s))
        .build()
        .expect("acyclic graph must resolve")
}

proptest! {
    /// Every dependency precedes its dependent
    #[test]
    fn resolve_respects_dependencies(matrix in dag_strategy(), reverse in any::<bool>()) {
        let registry = build(&matrix, reverse);
        let order: Vec<&str> = registry.resolve().unwrap().into_iter().map(|s| s.id()).collect();
        prop_assert_eq!(order.len(), matrix.len());

        let position = |id: &str| order.iter().position(|o| *o == id).unwrap();
        for step in registry.steps() {
            for dep in step.dependencies() {
                prop_assert!(position(dep) < position(step.id()));
            }
        }
    }

    /// Resolution is deterministic for a given registration
    #[test]
    fn resolve_is_stable(matrix in dag_strategy()) {
        let registry = build(&matrix, false);
        let first: Vec<String> = registry.resolve().unwrap().iter().map(|s| s.id().to_string()).collect();
        let second: Vec<String> = registry.resolve().unwrap().iter().map(|s| s.id().to_string()).collect();
        prop_assert_eq!(first, second);
    }
}

// =============================================================================
// Tier classification
// =============================================================================

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

proptest! {
    /// Day 1 is always monthly, whatever the weekday
    #[test]
    fn first_of_month_always_monthly(year in 2000i32..2100, month in 1u32..=12, week_end in 0usize..7) {
        let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
        let week_end = WEEKDAYS[week_end];
        prop_assert_eq!(Tier::classify(date, week_end), Tier::Monthly);
    }

    /// Past day 1, weekly exactly on the configured week end
    #[test]
    fn weekly_only_on_week_end(days in 0i64..20_000, week_end in 0usize..7) {
        let date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + Duration::days(days);
        let week_end = WEEKDAYS[week_end];
        let tier = Tier::classify(date, week_end);
        if date.day() != 1 {
            prop_assert_eq!(tier == Tier::Weekly, date.weekday() == week_end);
            prop_assert!(tier != Tier::Monthly);
        }
    }
}
