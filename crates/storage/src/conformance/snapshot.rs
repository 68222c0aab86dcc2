//! Snapshot isolation conformance tests.
//!
//! Verifies that uncommitted writes are invisible outside a snapshot,
//! committed writes are visible, and aborted or dropped snapshots are
//! discarded.

use std::future::Future;

use hatch_core::Status;

use super::{make_experiment, make_group, make_range, seed_experiment, TestResult};
use crate::{HatchStorage, StorageError};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_insert_invisible",
        uncommitted_insert_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "uncommitted_update_invisible",
        uncommitted_update_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_reads_its_own_writes",
        snapshot_reads_its_own_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_all_writes",
        abort_discards_all_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "dropped_snapshot_discards_writes",
        dropped_snapshot_discards_writes(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "sequential_snapshots_see_prior_commits",
        sequential_snapshots_see_prior_commits(factory).await,
    ));

    results
}

async fn uncommitted_insert_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_experiment(&mut snap, make_experiment("exp-a"))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let visible = s.get_experiment("exp-a").await;
    let listed = s
        .list_experiments(None, None)
        .await
        .map_err(|e| format!("list: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    if !matches!(visible, Err(StorageError::ExperimentNotFound { .. })) {
        return Err(format!("uncommitted insert visible: {visible:?}"));
    }
    if !listed.is_empty() {
        return Err(format!("uncommitted insert listed: {} records", listed.len()));
    }
    s.get_experiment("exp-a")
        .await
        .map(|_| ())
        .map_err(|e| format!("committed insert not visible: {e}"))
}

async fn uncommitted_update_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_experiment(&s, "exp-a").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut record = s
        .get_experiment_for_update(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    record.status = Status::Preview;
    s.update_experiment(&mut snap, &record)
        .await
        .map_err(|e| format!("update: {e}"))?;

    let outside = s.get_experiment("exp-a").await.map_err(|e| format!("get: {e}"))?;
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if outside.status != Status::Draft {
        return Err(format!("uncommitted update visible: {}", outside.status));
    }
    Ok(())
}

async fn snapshot_reads_its_own_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_experiment(&mut snap, make_experiment("exp-a"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("exp-a", 1))
        .await
        .map_err(|e| format!("group: {e}"))?;
    s.insert_bucket_range(&mut snap, make_range("exp-a", 1, 0, 500, "exp-a"))
        .await
        .map_err(|e| format!("range: {e}"))?;

    let record = s
        .get_experiment_for_update(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    let range = s
        .get_bucket_range_for_update(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("range lookup: {e}"))?;
    let latest = s
        .latest_isolation_group_for_update(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("group lookup: {e}"))?;
    let _ = s.abort_snapshot(snap).await;

    if record.slug != "exp-a" {
        return Err(format!("read back wrong record {}", record.slug));
    }
    if range.map(|r| r.count) != Some(500) {
        return Err("range written in snapshot not readable".to_string());
    }
    match latest {
        Some((group, ranges)) if group.instance == 1 && ranges.len() == 1 => Ok(()),
        other => Err(format!("expected instance 1 with one range, got {other:?}")),
    }
}

async fn abort_discards_all_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_experiment(&mut snap, make_experiment("exp-a"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("exp-a", 1))
        .await
        .map_err(|e| format!("group: {e}"))?;
    s.insert_bucket_range(&mut snap, make_range("exp-a", 1, 0, 500, "exp-a"))
        .await
        .map_err(|e| format!("range: {e}"))?;
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if s.get_experiment("exp-a").await.is_ok() {
        return Err("aborted experiment visible".to_string());
    }
    if s.get_isolation_group("exp-a", 1)
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("aborted group visible".to_string());
    }
    if s.get_bucket_range("exp-a")
        .await
        .map_err(|e| e.to_string())?
        .is_some()
    {
        return Err("aborted range visible".to_string());
    }
    Ok(())
}

async fn dropped_snapshot_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        s.insert_experiment(&mut snap, make_experiment("exp-a"))
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }
    if s.get_experiment("exp-a").await.is_ok() {
        return Err("dropped snapshot's insert visible".to_string());
    }
    Ok(())
}

async fn sequential_snapshots_see_prior_commits<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_experiment(&s, "exp-a").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.get_experiment_for_update(&mut snap, "exp-a").await;
    let _ = s.abort_snapshot(snap).await;
    result
        .map(|_| ())
        .map_err(|e| format!("prior commit not visible in new snapshot: {e}"))
}
