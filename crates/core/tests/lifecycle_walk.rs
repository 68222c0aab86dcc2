//! Random walks over caller-requested lifecycle changes.
//!
//! Callers can only move a record between DRAFT and PREVIEW and queue it
//! for review. Whatever sequence of requests they send, an accepted change
//! never lands a record in LIVE or COMPLETE, and the history written for the
//! accepted changes always replays.

use hatch_core::changelog::verify_replay;
use hatch_core::{
    validate, Application, ChangeLogEntry, ExperimentPayload, ExperimentRecord, Lifecycle,
    PublishStatus, Status,
};
use proptest::prelude::*;
use time::macros::datetime;

fn status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

fn publish_status() -> impl Strategy<Value = PublishStatus> {
    prop::sample::select(PublishStatus::ALL.to_vec())
}

fn request() -> impl Strategy<Value = Lifecycle> {
    (status(), prop::option::of(status()), publish_status())
        .prop_map(|(status, next, publish)| Lifecycle::new(status, next, publish))
}

/// Apply each accepted request in turn, writing a history entry for it.
fn walk(requests: &[Lifecycle]) -> (ExperimentRecord, Vec<ChangeLogEntry>) {
    let t0 = datetime!(2026-03-01 09:00 UTC);
    let mut record =
        ExperimentRecord::new_draft("walk", Application::Fenix, 50.0, ExperimentPayload::default());
    let mut history = vec![ChangeLogEntry::next(None, &record, "dev", None, t0).unwrap()];
    history[0].id = 1;

    for requested in requests {
        if validate(&record.lifecycle(), requested).is_err() {
            continue;
        }
        record.set_lifecycle(*requested);
        record.version += 1;
        let at = t0 + time::Duration::seconds(history.len() as i64);
        let mut entry = ChangeLogEntry::next(history.last(), &record, "dev", None, at).unwrap();
        entry.id = history.len() as u64 + 1;
        history.push(entry);
    }
    (record, history)
}

proptest! {
    #[test]
    fn callers_never_publish_directly(requests in prop::collection::vec(request(), 0..40)) {
        let (record, history) = walk(&requests);
        prop_assert!(matches!(record.status, Status::Draft | Status::Preview));
        prop_assert_ne!(record.publish_status, PublishStatus::Waiting);
        for entry in &history {
            prop_assert!(!matches!(entry.new_status, Status::Live | Status::Complete));
        }
    }

    #[test]
    fn accepted_history_replays(requests in prop::collection::vec(request(), 0..40)) {
        let (record, history) = walk(&requests);
        prop_assert_eq!(verify_replay(&history), Ok(()));
        prop_assert_eq!(history.len() as i64, record.version + 1);
    }

    #[test]
    fn queued_records_carry_a_target(requests in prop::collection::vec(request(), 1..40)) {
        let (record, _) = walk(&requests);
        let requested_publish = matches!(
            record.publish_status,
            PublishStatus::Review | PublishStatus::Approved
        );
        prop_assert_eq!(requested_publish, record.status_next.is_some());
    }
}

#[test]
fn review_cycle_then_cancel() {
    let (record, history) = walk(&[
        Lifecycle::new(Status::Preview, None, PublishStatus::Idle),
        Lifecycle::new(Status::Preview, Some(Status::Live), PublishStatus::Review),
        // Re-queuing the same target is refused.
        Lifecycle::new(Status::Preview, Some(Status::Live), PublishStatus::Review),
        Lifecycle::new(Status::Preview, None, PublishStatus::Idle),
    ]);

    assert_eq!(record.lifecycle(), Lifecycle::idle(Status::Preview));
    assert_eq!(history.len(), 4);
    assert!(history[2].requests_review());
    assert_eq!(history[3].old_publish_status, Some(PublishStatus::Review));
}
