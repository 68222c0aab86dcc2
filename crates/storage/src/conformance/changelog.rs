//! Change history conformance tests.
//!
//! Entries are written in the same snapshot as the record change they
//! describe, receive strictly increasing ids, and replay as a chain.

use std::future::Future;

use hatch_core::changelog::verify_replay;
use hatch_core::{PublishStatus, Status};

use super::{make_entry, make_experiment, TestResult};
use crate::HatchStorage;

pub(super) async fn run_changelog_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "changelog",
        "empty_history_for_unknown_experiment",
        empty_history_for_unknown_experiment(factory).await,
    ));
    results.push(TestResult::from_result(
        "changelog",
        "ids_strictly_increase",
        ids_strictly_increase(factory).await,
    ));
    results.push(TestResult::from_result(
        "changelog",
        "latest_entry_visible_in_snapshot",
        latest_entry_visible_in_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "changelog",
        "abort_discards_entry_with_update",
        abort_discards_entry_with_update(factory).await,
    ));
    results.push(TestResult::from_result(
        "changelog",
        "history_replays",
        history_replays(factory).await,
    ));

    results
}

async fn empty_history_for_unknown_experiment<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let entries = s
        .list_changelog("missing")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !entries.is_empty() {
        return Err(format!("expected no entries, got {}", entries.len()));
    }
    Ok(())
}

/// Create a record with its creation entry, then apply `steps` one
/// snapshot at a time, each with its own entry.
async fn write_history<S: HatchStorage>(
    s: &S,
    steps: &[(Status, PublishStatus)],
) -> Result<(), String> {
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let record = make_experiment("exp-a");
    s.insert_experiment(&mut snap, record.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.append_changelog(&mut snap, make_entry(&record, None, 0))
        .await
        .map_err(|e| format!("append: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    for (minute, (status, publish)) in steps.iter().enumerate() {
        let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
        let mut record = s
            .get_experiment_for_update(&mut snap, "exp-a")
            .await
            .map_err(|e| format!("get: {e}"))?;
        let previous = s
            .latest_changelog_entry(&mut snap, "exp-a")
            .await
            .map_err(|e| format!("latest: {e}"))?;
        record.status = *status;
        record.publish_status = *publish;
        s.update_experiment(&mut snap, &record)
            .await
            .map_err(|e| format!("update: {e}"))?;
        s.append_changelog(
            &mut snap,
            make_entry(&record, previous.as_ref(), minute as i64 + 1),
        )
        .await
        .map_err(|e| format!("append: {e}"))?;
        s.commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }
    Ok(())
}

async fn ids_strictly_increase<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    write_history(
        &s,
        &[
            (Status::Preview, PublishStatus::Idle),
            (Status::Draft, PublishStatus::Idle),
        ],
    )
    .await?;

    let entries = s.list_changelog("exp-a").await.map_err(|e| e.to_string())?;
    if entries.len() != 3 {
        return Err(format!("expected 3 entries, got {}", entries.len()));
    }
    if entries.iter().any(|e| e.id == 0) {
        return Err("entry left without an id".to_string());
    }
    if !entries.windows(2).all(|w| w[0].id < w[1].id) {
        return Err(format!(
            "ids not increasing: {:?}",
            entries.iter().map(|e| e.id).collect::<Vec<_>>()
        ));
    }
    Ok(())
}

async fn latest_entry_visible_in_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let record = make_experiment("exp-a");
    s.insert_experiment(&mut snap, record.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.append_changelog(&mut snap, make_entry(&record, None, 0))
        .await
        .map_err(|e| format!("append: {e}"))?;
    let latest = s
        .latest_changelog_entry(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("latest: {e}"))?;
    let _ = s.abort_snapshot(snap).await;

    match latest {
        Some(entry) if entry.new_status == Status::Draft && entry.old_status.is_none() => Ok(()),
        other => Err(format!("expected creation entry, got {other:?}")),
    }
}

async fn abort_discards_entry_with_update<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    write_history(&s, &[]).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| format!("begin: {e}"))?;
    let mut record = s
        .get_experiment_for_update(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    let previous = s
        .latest_changelog_entry(&mut snap, "exp-a")
        .await
        .map_err(|e| format!("latest: {e}"))?;
    record.status = Status::Preview;
    s.update_experiment(&mut snap, &record)
        .await
        .map_err(|e| format!("update: {e}"))?;
    s.append_changelog(&mut snap, make_entry(&record, previous.as_ref(), 5))
        .await
        .map_err(|e| format!("append: {e}"))?;
    s.abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let entries = s.list_changelog("exp-a").await.map_err(|e| e.to_string())?;
    if entries.len() != 1 {
        return Err(format!("aborted entry kept: {} entries", entries.len()));
    }
    Ok(())
}

async fn history_replays<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    write_history(
        &s,
        &[
            (Status::Draft, PublishStatus::Review),
            (Status::Draft, PublishStatus::Approved),
            (Status::Live, PublishStatus::Idle),
            (Status::Complete, PublishStatus::Idle),
        ],
    )
    .await?;

    let entries = s.list_changelog("exp-a").await.map_err(|e| e.to_string())?;
    verify_replay(&entries).map_err(|e| format!("replay: {e}"))?;
    match entries.last() {
        Some(last) if last.new_status == Status::Complete => Ok(()),
        other => Err(format!("expected COMPLETE last, got {other:?}")),
    }
}
