//! Experiment insertion, lookup, and version (OCC) conformance tests.

use std::future::Future;

use hatch_core::{Application, PublishStatus, Status};

use super::{make_experiment, seed_experiment, TestResult};
use crate::{HatchStorage, StorageError};

pub(super) async fn run_experiment_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "experiments",
        "insert_starts_at_version_0",
        insert_starts_at_version_0(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "duplicate_insert_already_exists",
        duplicate_insert_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "get_nonexistent_not_found",
        get_nonexistent_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "get_for_update_nonexistent_not_found",
        get_for_update_nonexistent_not_found(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "update_increments_version",
        update_increments_version(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "stale_version_conflicts",
        stale_version_conflicts(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "conflict_does_not_change_record",
        conflict_does_not_change_record(factory).await,
    ));
    results.push(TestResult::from_result(
        "experiments",
        "list_filters_by_application_and_publish_status",
        list_filters_by_application_and_publish_status(factory).await,
    ));

    results
}

// ── Insert ───────────────────────────────────────────────────────────────────

async fn insert_starts_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut record = make_experiment("exp-a");
    record.version = 41;
    s.insert_experiment(&mut snap, record)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = s
        .get_experiment("exp-a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 0 {
        return Err(format!("expected version 0, got {}", stored.version));
    }
    if stored.status != Status::Draft || stored.publish_status != PublishStatus::Idle {
        return Err(format!(
            "expected DRAFT/IDLE, got {}/{}",
            stored.status, stored.publish_status
        ));
    }
    Ok(())
}

async fn duplicate_insert_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_experiment(&s, "exp-a").await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.insert_experiment(&mut snap, make_experiment("exp-a")).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::AlreadyExists { .. }) => Ok(()),
        other => Err(format!("expected AlreadyExists, got {other:?}")),
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

async fn get_nonexistent_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_experiment("missing").await {
        Err(StorageError::ExperimentNotFound { slug }) if slug == "missing" => Ok(()),
        other => Err(format!("expected ExperimentNotFound(missing), got {other:?}")),
    }
}

async fn get_for_update_nonexistent_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let result = s.get_experiment_for_update(&mut snap, "missing").await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::ExperimentNotFound { .. }) => Ok(()),
        other => Err(format!("expected ExperimentNotFound, got {other:?}")),
    }
}

// ── Version validation ───────────────────────────────────────────────────────

async fn update_increments_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_experiment(&s, "exp-a").await?;

    for expected in 1..=3 {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        let mut record = s
            .get_experiment_for_update(&mut snap, "exp-a")
            .await
            .map_err(|e| format!("get: {e}"))?;
        record.status = Status::Preview;
        let version = s
            .update_experiment(&mut snap, &record)
            .await
            .map_err(|e| format!("update: {e}"))?;
        s.commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
        if version != expected {
            return Err(format!("expected version {expected}, got {version}"));
        }
    }

    let stored = s.get_experiment("exp-a").await.map_err(|e| format!("get: {e}"))?;
    if stored.version != 3 || stored.status != Status::Preview {
        return Err(format!(
            "expected PREVIEW at version 3, got {} at {}",
            stored.status, stored.version
        ));
    }
    Ok(())
}

async fn stale_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
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
    record.version = 7;
    let result = s.update_experiment(&mut snap, &record).await;
    let _ = s.abort_snapshot(snap).await;
    match result {
        Err(StorageError::VersionConflict {
            slug,
            expected_version,
        }) if slug == "exp-a" && expected_version == 7 => Ok(()),
        other => Err(format!("expected VersionConflict(exp-a, 7), got {other:?}")),
    }
}

async fn conflict_does_not_change_record<S, F, Fut>(factory: &F) -> Result<(), String>
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
    record.version = 3;
    record.status = Status::Preview;
    if s.update_experiment(&mut snap, &record).await.is_ok() {
        return Err("stale update unexpectedly succeeded".to_string());
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = s.get_experiment("exp-a").await.map_err(|e| format!("get: {e}"))?;
    if stored.version != 0 || stored.status != Status::Draft {
        return Err(format!(
            "record changed by failed update: {} at version {}",
            stored.status, stored.version
        ));
    }
    Ok(())
}

// ── Queries ──────────────────────────────────────────────────────────────────

async fn list_filters_by_application_and_publish_status<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    for (slug, app, publish) in [
        ("desk-1", Application::Desktop, PublishStatus::Review),
        ("desk-2", Application::Desktop, PublishStatus::Idle),
        ("fenix-1", Application::Fenix, PublishStatus::Review),
    ] {
        let mut record = make_experiment(slug);
        record.application = app;
        record.publish_status = publish;
        s.insert_experiment(&mut snap, record)
            .await
            .map_err(|e| format!("insert {slug}: {e}"))?;
    }
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let slugs = |records: Vec<hatch_core::ExperimentRecord>| {
        records.into_iter().map(|r| r.slug).collect::<Vec<_>>()
    };
    let all = slugs(s.list_experiments(None, None).await.map_err(|e| e.to_string())?);
    if all.len() != 3 {
        return Err(format!("expected 3 experiments, got {all:?}"));
    }
    let desktop_review = slugs(
        s.list_experiments(Some(Application::Desktop), Some(PublishStatus::Review))
            .await
            .map_err(|e| e.to_string())?,
    );
    if desktop_review != vec!["desk-1".to_string()] {
        return Err(format!("expected [desk-1], got {desktop_review:?}"));
    }
    Ok(())
}
