//! Isolation group and bucket range conformance tests.

use std::future::Future;

use super::{make_group, make_range, TestResult};
use crate::{HatchStorage, StorageError};

pub(super) async fn run_bucket_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "buckets",
        "no_group_yields_none",
        no_group_yields_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "latest_group_is_highest_instance",
        latest_group_is_highest_instance(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "duplicate_group_instance_rejected",
        duplicate_group_instance_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "range_requires_group",
        range_requires_group(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "overlapping_range_rejected",
        overlapping_range_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "second_range_for_experiment_rejected",
        second_range_for_experiment_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "buckets",
        "ranges_listed_by_start",
        ranges_listed_by_start(factory).await,
    ));

    results
}

async fn no_group_yields_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let latest = s
        .latest_isolation_group_for_update(&mut snap, "nothing-here")
        .await
        .map_err(|e| format!("latest: {e}"))?;
    let range = s
        .get_bucket_range_for_update(&mut snap, "nothing-here")
        .await
        .map_err(|e| format!("range: {e}"))?;
    let _ = s.abort_snapshot(snap).await;
    if latest.is_some() || range.is_some() {
        return Err(format!("expected nothing, got {latest:?} / {range:?}"));
    }
    Ok(())
}

async fn latest_group_is_highest_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for instance in [2, 1, 3] {
        s.insert_isolation_group(&mut snap, make_group("desktop-shared", instance))
            .await
            .map_err(|e| format!("group {instance}: {e}"))?;
    }
    s.insert_bucket_range(&mut snap, make_range("desktop-shared", 1, 0, 7000, "exp-a"))
        .await
        .map_err(|e| format!("range a: {e}"))?;
    s.insert_bucket_range(&mut snap, make_range("desktop-shared", 3, 0, 4000, "exp-b"))
        .await
        .map_err(|e| format!("range b: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let latest = s
        .latest_isolation_group_for_update(&mut snap, "desktop-shared")
        .await
        .map_err(|e| format!("latest: {e}"))?;
    let _ = s.abort_snapshot(snap).await;

    match latest {
        Some((group, ranges)) if group.instance == 3 => {
            if ranges.len() != 1 || ranges[0].experiment != "exp-b" {
                return Err(format!("expected only exp-b in instance 3, got {ranges:?}"));
            }
            Ok(())
        }
        other => Err(format!("expected instance 3, got {other:?}")),
    }
}

async fn duplicate_group_instance_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("g", 1))
        .await
        .map_err(|e| format!("first: {e}"))?;
    let result = s.insert_isolation_group(&mut snap, make_group("g", 1)).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

async fn range_requires_group<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s
        .insert_bucket_range(&mut snap, make_range("g", 1, 0, 100, "exp-a"))
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::GroupNotFound { name, instance }) if name == "g" && instance == 1 => {
            Ok(())
        }
        other => Err(format!("expected GroupNotFound(g, 1), got {other:?}")),
    }
}

async fn overlapping_range_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("g", 1))
        .await
        .map_err(|e| format!("group: {e}"))?;
    s.insert_bucket_range(&mut snap, make_range("g", 1, 0, 500, "exp-a"))
        .await
        .map_err(|e| format!("range a: {e}"))?;
    let overlap = s
        .insert_bucket_range(&mut snap, make_range("g", 1, 499, 10, "exp-b"))
        .await;
    let adjacent = s
        .insert_bucket_range(&mut snap, make_range("g", 1, 500, 10, "exp-c"))
        .await;
    let _ = s.abort_snapshot(snap).await;

    if !matches!(overlap, Err(StorageError::RangeOverlap { .. })) {
        return Err(format!("expected RangeOverlap, got {overlap:?}"));
    }
    adjacent.map_err(|e| format!("adjacent range rejected: {e}"))
}

async fn second_range_for_experiment_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("g", 1))
        .await
        .map_err(|e| format!("group: {e}"))?;
    s.insert_bucket_range(&mut snap, make_range("g", 1, 0, 100, "exp-a"))
        .await
        .map_err(|e| format!("range: {e}"))?;
    let result = s
        .insert_bucket_range(&mut snap, make_range("g", 1, 100, 100, "exp-a"))
        .await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

async fn ranges_listed_by_start<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    s.insert_isolation_group(&mut snap, make_group("g", 1))
        .await
        .map_err(|e| format!("group: {e}"))?;
    for (start, slug) in [(200, "exp-z"), (0, "exp-y"), (100, "exp-x")] {
        s.insert_bucket_range(&mut snap, make_range("g", 1, start, 100, slug))
            .await
            .map_err(|e| format!("range {slug}: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let starts: Vec<u32> = s
        .list_bucket_ranges("g", 1)
        .await
        .map_err(|e| format!("list: {e}"))?
        .iter()
        .map(|r| r.start)
        .collect();
    if starts != [0, 100, 200] {
        return Err(format!("expected starts [0, 100, 200], got {starts:?}"));
    }
    Ok(())
}
