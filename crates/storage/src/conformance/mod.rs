//! Conformance test suite for `HatchStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `HatchStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Experiments**: insertion, duplicate detection, not-found errors
//! - **Snapshot isolation**: uncommitted writes invisible, aborted writes discarded
//! - **Version validation / OCC**: stale writes rejected without side effects
//! - **Change history**: ids, ordering, atomicity with the record write
//! - **Buckets**: group instances, range ownership, overlap rejection
//! - **Concurrency**: racing snapshots on the same resource, exactly one wins
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use hatch_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod buckets;
mod changelog;
mod concurrent;
mod experiments;
mod snapshot;

use std::fmt;
use std::future::Future;

use hatch_core::{
    Application, BucketRange, ChangeLogEntry, ExperimentPayload, ExperimentRecord,
    IsolationGroup, RandomizationUnit,
};
use time::macros::datetime;

use crate::HatchStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "experiments", "snapshot", "buckets").
    pub category: String,
    /// Test name (e.g. "insert_starts_at_version_0").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: result.is_ok(),
            message: result.err(),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(experiments::run_experiment_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(changelog::run_changelog_tests(&factory).await);
    results.extend(buckets::run_bucket_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_experiment(slug: &str) -> ExperimentRecord {
    ExperimentRecord::new_draft(
        slug,
        Application::Desktop,
        50.0,
        ExperimentPayload {
            name: format!("{slug} name"),
            targeting: "true".to_string(),
            ..Default::default()
        },
    )
}

fn make_entry(record: &ExperimentRecord, previous: Option<&ChangeLogEntry>, minute: i64) -> ChangeLogEntry {
    ChangeLogEntry::next(
        previous,
        record,
        "conformance",
        None,
        datetime!(2026-01-01 00:00 UTC) + time::Duration::minutes(minute),
    )
    .expect("record serializes")
}

fn make_group(name: &str, instance: u32) -> IsolationGroup {
    IsolationGroup {
        name: name.to_string(),
        instance,
        total_capacity: 10_000,
        randomization_unit: RandomizationUnit::NormandyId,
    }
}

fn make_range(name: &str, instance: u32, start: u32, count: u32, experiment: &str) -> BucketRange {
    BucketRange {
        group_name: name.to_string(),
        group_instance: instance,
        start,
        count,
        experiment: experiment.to_string(),
    }
}

/// Insert and commit an experiment.
async fn seed_experiment<S: HatchStorage>(s: &S, slug: &str) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_experiment(&mut snap, make_experiment(slug))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit seed: {e}"))
}
