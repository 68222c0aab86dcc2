//! Writing history entries in the same snapshot as the change they describe.

use hatch_core::{ChangeLogEntry, ExperimentRecord, Lifecycle};
use hatch_storage::{HatchStorage, StorageError};
use time::OffsetDateTime;

/// Append the history entry for `record` as it was just written.
///
/// The "before" statuses come from the latest stored entry. The timestamp
/// never goes backwards relative to that entry, so `(timestamp, id)`
/// ordering holds even if the wall clock steps back.
pub async fn record_change<S: HatchStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    record: &ExperimentRecord,
    actor: &str,
    message: Option<String>,
) -> Result<ChangeLogEntry, StorageError> {
    let previous = storage
        .latest_changelog_entry(snapshot, &record.slug)
        .await?;
    let now = OffsetDateTime::now_utc();
    let timestamp = match &previous {
        Some(prev) if prev.timestamp > now => prev.timestamp,
        _ => now,
    };
    let entry = ChangeLogEntry::next(previous.as_ref(), record, actor, message, timestamp)
        .map_err(|e| {
            StorageError::Backend(format!("failed to snapshot experiment {}: {e}", record.slug))
        })?;
    storage.append_changelog(snapshot, entry.clone()).await?;
    Ok(entry)
}

/// Move `record` to `lifecycle`, store it, and log the change.
///
/// `record` must have been read for update in `snapshot`; on success it
/// carries the new lifecycle and storage version.
pub async fn write_transition<S: HatchStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    record: &mut ExperimentRecord,
    lifecycle: Lifecycle,
    actor: &str,
    message: Option<String>,
) -> Result<ChangeLogEntry, StorageError> {
    record.set_lifecycle(lifecycle);
    record.version = storage.update_experiment(snapshot, record).await?;
    record_change(storage, snapshot, record, actor, message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_core::{Application, ExperimentPayload, PublishStatus, Status};
    use hatch_storage::MemoryStorage;

    #[tokio::test]
    async fn transition_entries_chain() {
        let storage = MemoryStorage::new();
        let record = ExperimentRecord::new_draft(
            "exp-a",
            Application::Fenix,
            5.0,
            ExperimentPayload::default(),
        );

        let mut snap = storage.begin_snapshot().await.unwrap();
        storage.insert_experiment(&mut snap, record.clone()).await.unwrap();
        let created = record_change(&storage, &mut snap, &record, "alice", None)
            .await
            .unwrap();
        storage.commit_snapshot(snap).await.unwrap();
        assert_eq!(created.old_status, None);

        let mut snap = storage.begin_snapshot().await.unwrap();
        let mut record = storage.get_experiment_for_update(&mut snap, "exp-a").await.unwrap();
        let entry = write_transition(
            &storage,
            &mut snap,
            &mut record,
            Lifecycle::new(Status::Draft, Some(Status::Live), PublishStatus::Review),
            "alice",
            Some("ready".into()),
        )
        .await
        .unwrap();
        storage.commit_snapshot(snap).await.unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(entry.old_status, Some(Status::Draft));
        assert_eq!(entry.old_publish_status, Some(PublishStatus::Idle));
        assert_eq!(entry.new_publish_status, PublishStatus::Review);
        assert_eq!(entry.data_snapshot["version"], 1);
        assert!(entry.timestamp >= created.timestamp);

        let history = storage.list_changelog("exp-a").await.unwrap();
        assert_eq!(history.len(), 2);
        hatch_core::changelog::verify_replay(&history).unwrap();
    }
}
