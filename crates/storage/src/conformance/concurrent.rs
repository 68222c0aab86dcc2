use std::future::Future;
use std::sync::Arc;

use hatch_core::{PublishStatus, Status};

use super::{make_entry, make_experiment, make_group, make_range, seed_experiment, TestResult};
use crate::{HatchStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_exactly_one_wins",
        concurrent_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_range_claims_exactly_one_wins",
        concurrent_range_claims_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_experiments_all_succeed",
        concurrent_updates_different_experiments_all_succeed(factory).await,
    ));

    results
}

/// Tally task outcomes: `Ok(true)` won, `Ok(false)` lost the race.
async fn tally(
    handles: Vec<tokio::task::JoinHandle<Result<bool, StorageError>>>,
) -> Result<(usize, usize), String> {
    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }
    Ok((winners, losers))
}

// ── Same experiment: exactly one wins ───────────────────────────────────────

/// N tasks each move the same experiment into review from version 0 and log
/// the change. Whether a loser is caught at update time (stale version) or
/// at commit time (serialization failure), exactly one commit lands and the
/// history gains exactly one entry.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_experiment(&*storage, "exp-a").await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            let mut record = make_experiment("exp-a");
            record.publish_status = PublishStatus::Review;
            let previous = s.latest_changelog_entry(&mut snap, "exp-a").await?;
            let result = s.update_experiment(&mut snap, &record).await;
            match result {
                Ok(_) => {
                    s.append_changelog(&mut snap, make_entry(&record, previous.as_ref(), i as i64))
                        .await?;
                    match s.commit_snapshot(snap).await {
                        Ok(()) => Ok(true),
                        Err(e) if e.is_conflict() => Ok(false),
                        Err(e) => Err(e),
                    }
                }
                Err(e) if e.is_conflict() => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, losers) = tally(handles).await?;
    if winners != 1 || losers != N - 1 {
        return Err(format!(
            "expected 1 winner and {} losers, got {winners} and {losers}",
            N - 1
        ));
    }

    let record = storage
        .get_experiment("exp-a")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if record.version != 1 || record.publish_status != PublishStatus::Review {
        return Err(format!(
            "expected REVIEW at version 1, got {} at {}",
            record.publish_status, record.version
        ));
    }
    let entries = storage
        .list_changelog("exp-a")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if entries.len() != 1 {
        return Err(format!("expected 1 history entry, got {}", entries.len()));
    }
    Ok(())
}

// ── Same group: exactly one range claim wins ────────────────────────────────

/// N tasks, one per experiment, race to claim the same buckets of one group
/// instance. Losers fail with a conflict or, when they run after the winner
/// committed, with an overlap. No two committed ranges overlap.
async fn concurrent_range_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .insert_isolation_group(&mut snap, make_group("shared", 1))
            .await
            .map_err(|e| format!("group: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit group: {e}"))?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let slug = format!("exp-{i}");
            let mut snap = s.begin_snapshot().await?;
            s.latest_isolation_group_for_update(&mut snap, "shared")
                .await?;
            let result = s
                .insert_bucket_range(&mut snap, make_range("shared", 1, 0, 500, &slug))
                .await;
            match result {
                Ok(()) => match s.commit_snapshot(snap).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_conflict() => Ok(false),
                    Err(e) => Err(e),
                },
                Err(e) if e.is_conflict() || matches!(e, StorageError::RangeOverlap { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let (winners, _) = tally(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 range claim, got {winners}"));
    }
    let ranges = storage
        .list_bucket_ranges("shared", 1)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if ranges.len() != 1 {
        return Err(format!("expected 1 committed range, got {}", ranges.len()));
    }
    Ok(())
}

// ── Different experiments: all succeed ──────────────────────────────────────

async fn concurrent_updates_different_experiments_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: HatchStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_experiment(&*storage, &format!("exp-{i}")).await?;
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let slug = format!("exp-{i}");
            let mut snap = s.begin_snapshot().await?;
            let mut record = s.get_experiment_for_update(&mut snap, &slug).await?;
            record.status = Status::Preview;
            s.update_experiment(&mut snap, &record).await?;
            s.commit_snapshot(snap).await?;
            Ok(true)
        }));
    }

    let (winners, _) = tally(handles).await?;
    if winners != N {
        return Err(format!("expected all {N} updates to commit, got {winners}"));
    }
    for i in 0..N {
        let record = storage
            .get_experiment(&format!("exp-{i}"))
            .await
            .map_err(|e| format!("get: {e}"))?;
        if record.status != Status::Preview || record.version != 1 {
            return Err(format!(
                "exp-{i}: expected PREVIEW at version 1, got {} at {}",
                record.status, record.version
            ));
        }
    }
    Ok(())
}
