//! Append-only change history of an experiment.
//!
//! Every accepted lifecycle change writes one [`ChangeLogEntry`]. The
//! "before" half of an entry is taken from the previous entry, never from
//! the record being written, so the history replays as a chain:
//! `entries[i + 1].old_status == entries[i].new_status`.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{ExperimentRecord, PublishStatus, Status};

/// Actor recorded for transitions the system makes on its own.
pub const SYSTEM_ACTOR: &str = "hatch";

/// One immutable entry of an experiment's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Assigned by storage on append; strictly increasing.
    #[serde(default)]
    pub id: u64,
    pub experiment: String,
    /// `None` only for the entry written when the record was created.
    pub old_status: Option<Status>,
    pub new_status: Status,
    pub old_publish_status: Option<PublishStatus>,
    pub new_publish_status: PublishStatus,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The full record as written.
    pub data_snapshot: serde_json::Value,
}

impl ChangeLogEntry {
    /// Build the entry describing `record` as it is about to be stored.
    ///
    /// `previous` is the latest stored entry for the record, or `None` when
    /// the record is being created.
    pub fn next(
        previous: Option<&ChangeLogEntry>,
        record: &ExperimentRecord,
        actor: &str,
        message: Option<String>,
        timestamp: OffsetDateTime,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: 0,
            experiment: record.slug.clone(),
            old_status: previous.map(|p| p.new_status),
            new_status: record.status,
            old_publish_status: previous.map(|p| p.new_publish_status),
            new_publish_status: record.publish_status,
            actor: actor.to_string(),
            timestamp,
            message,
            data_snapshot: serde_json::to_value(record)?,
        })
    }

    /// Whether this entry moved the record into the publish queue.
    pub fn requests_review(&self) -> bool {
        self.new_publish_status == PublishStatus::Review
            && self.old_publish_status != Some(PublishStatus::Review)
    }
}

/// A break in the replay chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("entry {index} belongs to '{found}', expected '{expected}'")]
    ForeignEntry {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("entry {index} is out of order")]
    OutOfOrder { index: usize },

    #[error("entry {index} has no previous status but is not the first entry")]
    MissingOldStatus { index: usize },

    #[error("first entry records a previous status {old}")]
    UnexpectedOldStatus { old: Status },

    #[error("entry {index} starts from {old:?} but the previous entry ended at {previous}")]
    BrokenChain {
        index: usize,
        old: Option<Status>,
        previous: Status,
    },
}

/// Status the record held after its latest recorded change. `None` means
/// the record has no history yet.
pub fn current_status(entries: &[ChangeLogEntry]) -> Option<Status> {
    entries.last().map(|e| e.new_status)
}

/// The entry that queued the record for its current review request.
pub fn latest_review_request(entries: &[ChangeLogEntry]) -> Option<&ChangeLogEntry> {
    entries.iter().rev().find(|e| e.requests_review())
}

/// Check that a record's entries replay as one ordered chain.
pub fn verify_replay(entries: &[ChangeLogEntry]) -> Result<(), ReplayError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    if let Some(old) = first.old_status {
        return Err(ReplayError::UnexpectedOldStatus { old });
    }

    for (index, pair) in entries.windows(2).enumerate() {
        let (prev, entry) = (&pair[0], &pair[1]);
        let index = index + 1;
        if entry.experiment != first.experiment {
            return Err(ReplayError::ForeignEntry {
                index,
                expected: first.experiment.clone(),
                found: entry.experiment.clone(),
            });
        }
        if (entry.timestamp, entry.id) <= (prev.timestamp, prev.id) {
            return Err(ReplayError::OutOfOrder { index });
        }
        match entry.old_status {
            None => return Err(ReplayError::MissingOldStatus { index }),
            Some(old) if old != prev.new_status => {
                return Err(ReplayError::BrokenChain {
                    index,
                    old: Some(old),
                    previous: prev.new_status,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Application, ExperimentPayload};
    use time::macros::datetime;

    fn record(status: Status, publish: PublishStatus) -> ExperimentRecord {
        let mut r = ExperimentRecord::new_draft(
            "exp-a",
            Application::Fenix,
            25.0,
            ExperimentPayload::default(),
        );
        r.status = status;
        r.publish_status = publish;
        r
    }

    fn history() -> Vec<ChangeLogEntry> {
        let t0 = datetime!(2026-01-01 00:00 UTC);
        let mut entries: Vec<ChangeLogEntry> = Vec::new();
        let steps = [
            (Status::Draft, PublishStatus::Idle),
            (Status::Draft, PublishStatus::Review),
            (Status::Draft, PublishStatus::Approved),
            (Status::Live, PublishStatus::Idle),
        ];
        for (i, (status, publish)) in steps.into_iter().enumerate() {
            let mut entry = ChangeLogEntry::next(
                entries.last(),
                &record(status, publish),
                "dev@example.com",
                None,
                t0 + time::Duration::minutes(i as i64),
            )
            .unwrap();
            entry.id = i as u64 + 1;
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn creation_entry_has_no_previous_status() {
        let entries = history();
        assert_eq!(entries[0].old_status, None);
        assert_eq!(entries[0].old_publish_status, None);
        assert_eq!(entries[0].data_snapshot["slug"], "exp-a");
    }

    #[test]
    fn chain_replays() {
        let entries = history();
        assert_eq!(verify_replay(&entries), Ok(()));
        assert_eq!(current_status(&entries), Some(Status::Live));
        assert_eq!(current_status(&[]), None);
    }

    #[test]
    fn old_status_comes_from_previous_entry() {
        let entries = history();
        for pair in entries.windows(2) {
            assert_eq!(pair[1].old_status, Some(pair[0].new_status));
            assert_eq!(pair[1].old_publish_status, Some(pair[0].new_publish_status));
        }
    }

    #[test]
    fn broken_chain_detected() {
        let mut entries = history();
        entries[2].old_status = Some(Status::Preview);
        assert!(matches!(
            verify_replay(&entries),
            Err(ReplayError::BrokenChain { index: 2, .. })
        ));
    }

    #[test]
    fn out_of_order_detected() {
        let mut entries = history();
        entries.swap(1, 2);
        assert!(verify_replay(&entries).is_err());
    }

    #[test]
    fn review_request_lookup() {
        let entries = history();
        let request = latest_review_request(&entries).unwrap();
        assert_eq!(request.id, 2);
        assert!(latest_review_request(&entries[..1]).is_none());
    }

    #[test]
    fn entry_serializes_rfc3339_timestamp() {
        let entries = history();
        let json = serde_json::to_value(&entries[1]).unwrap();
        assert_eq!(json["timestamp"], "2026-01-01T00:01:00Z");
        assert_eq!(json["old_status"], "DRAFT");
        assert!(json.get("message").is_none());
    }
}
