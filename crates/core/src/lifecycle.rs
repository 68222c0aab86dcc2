//! Lifecycle state machine for experiment status and publish status.
//!
//! [`validate`] decides whether an externally requested [`Lifecycle`] may
//! replace the current one. It is a pure function: it never mutates the
//! record and returns the same answer for the same inputs.
//!
//! Rules:
//!
//! - `status` moves only within DRAFT/PREVIEW, or stays put once LIVE or
//!   COMPLETE. LIVE and COMPLETE are reached through `status_next` and the
//!   publish queue, never by direct assignment.
//! - `publish_status` may be set to IDLE, REVIEW or APPROVED from anywhere.
//!   WAITING belongs to the broker and is never accepted from a caller.
//!   DIRTY marks an edited live experiment and is only accepted while LIVE.
//! - `status_next` is LIVE for DRAFT/PREVIEW, LIVE (update) or COMPLETE for
//!   LIVE, and nothing for COMPLETE. Re-queuing the target a record is
//!   already in flight for is rejected.
//! - `status_next` and a publish request (REVIEW/APPROVED) come as a pair.

use crate::types::{Lifecycle, PublishStatus, Status};

/// A rejected transition request, with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("status cannot change from {from} to {to}; {to} is reached through the publish queue")]
    StatusNotReachable { from: Status, to: Status },

    #[error("publish status {requested} is set by the publish queue and cannot be requested")]
    PublishStatusNotSettable { requested: PublishStatus },

    #[error("publish status DIRTY is only valid for a LIVE experiment, not {status}")]
    DirtyRequiresLive { status: Status },

    #[error("{status} experiments cannot request {target} as next status")]
    StatusNextNotAllowed { status: Status, target: Status },

    #[error("experiment is already queued for {target} ({publish_status})")]
    AlreadyQueued {
        target: Status,
        publish_status: PublishStatus,
    },

    #[error("next status {target} requires publish status REVIEW or APPROVED, not {publish_status}")]
    StatusNextWithoutPublishRequest {
        target: Status,
        publish_status: PublishStatus,
    },

    #[error("publish status {publish_status} requires a next status")]
    PublishRequestWithoutStatusNext { publish_status: PublishStatus },
}

/// Statuses a caller may assign directly, given the current status.
pub fn reachable_statuses(from: Status) -> &'static [Status] {
    match from {
        Status::Draft | Status::Preview => &[Status::Draft, Status::Preview],
        Status::Live => &[Status::Live],
        Status::Complete => &[Status::Complete],
    }
}

/// Targets a record may queue for through `status_next`.
pub fn queueable_targets(from: Status) -> &'static [Status] {
    match from {
        Status::Draft | Status::Preview => &[Status::Live],
        Status::Live => &[Status::Live, Status::Complete],
        Status::Complete => &[],
    }
}

/// Publish statuses a caller may assign directly.
fn publish_status_settable(requested: PublishStatus, current_status: Status) -> Result<(), ValidationError> {
    match requested {
        PublishStatus::Idle | PublishStatus::Review | PublishStatus::Approved => Ok(()),
        PublishStatus::Waiting => Err(ValidationError::PublishStatusNotSettable { requested }),
        PublishStatus::Dirty => match current_status {
            Status::Live => Ok(()),
            status => Err(ValidationError::DirtyRequiresLive { status }),
        },
    }
}

/// Validate a requested lifecycle change against the current lifecycle.
pub fn validate(current: &Lifecycle, requested: &Lifecycle) -> Result<(), ValidationError> {
    if !reachable_statuses(current.status).contains(&requested.status) {
        return Err(ValidationError::StatusNotReachable {
            from: current.status,
            to: requested.status,
        });
    }

    publish_status_settable(requested.publish_status, current.status)?;

    let publish_request = matches!(
        requested.publish_status,
        PublishStatus::Review | PublishStatus::Approved
    );

    match requested.status_next {
        Some(target) => {
            if !queueable_targets(current.status).contains(&target) {
                return Err(ValidationError::StatusNextNotAllowed {
                    status: current.status,
                    target,
                });
            }
            if current.status_next == Some(target) && current.publish_status.is_in_flight() {
                return Err(ValidationError::AlreadyQueued {
                    target,
                    publish_status: current.publish_status,
                });
            }
            if !publish_request {
                return Err(ValidationError::StatusNextWithoutPublishRequest {
                    target,
                    publish_status: requested.publish_status,
                });
            }
        }
        None if publish_request => {
            return Err(ValidationError::PublishRequestWithoutStatusNext {
                publish_status: requested.publish_status,
            });
        }
        None => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_lifecycles() -> Vec<Lifecycle> {
        let mut out = Vec::new();
        for status in Status::ALL {
            for publish in PublishStatus::ALL {
                out.push(Lifecycle::new(*status, None, *publish));
                for next in Status::ALL {
                    out.push(Lifecycle::new(*status, Some(*next), *publish));
                }
            }
        }
        out
    }

    #[test]
    fn draft_requests_launch() {
        let current = Lifecycle::idle(Status::Draft);
        let requested = Lifecycle::new(Status::Draft, Some(Status::Live), PublishStatus::Review);
        assert_eq!(validate(&current, &requested), Ok(()));
    }

    #[test]
    fn preview_requests_launch() {
        let current = Lifecycle::idle(Status::Preview);
        let requested = Lifecycle::new(Status::Preview, Some(Status::Live), PublishStatus::Review);
        assert_eq!(validate(&current, &requested), Ok(()));
    }

    #[test]
    fn draft_and_preview_move_freely() {
        for from in [Status::Draft, Status::Preview] {
            for to in [Status::Draft, Status::Preview] {
                assert!(validate(&Lifecycle::idle(from), &Lifecycle::idle(to)).is_ok());
            }
        }
    }

    #[test]
    fn direct_jump_to_live_rejected() {
        let err = validate(&Lifecycle::idle(Status::Draft), &Lifecycle::idle(Status::Live))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::StatusNotReachable {
                from: Status::Draft,
                to: Status::Live
            }
        );
        assert!(err.to_string().contains("publish queue"));
    }

    #[test]
    fn live_cannot_return_to_draft() {
        let err = validate(&Lifecycle::idle(Status::Live), &Lifecycle::idle(Status::Draft))
            .unwrap_err();
        assert!(matches!(err, ValidationError::StatusNotReachable { .. }));
    }

    #[test]
    fn waiting_never_settable() {
        for current in all_lifecycles() {
            let requested = Lifecycle::new(current.status, None, PublishStatus::Waiting);
            assert_eq!(
                validate(&current, &requested),
                Err(ValidationError::PublishStatusNotSettable {
                    requested: PublishStatus::Waiting
                }),
                "current: {current}"
            );
        }
    }

    #[test]
    fn dirty_only_while_live() {
        let live = Lifecycle::idle(Status::Live);
        assert!(validate(&live, &Lifecycle::new(Status::Live, None, PublishStatus::Dirty)).is_ok());
        let draft = Lifecycle::idle(Status::Draft);
        assert_eq!(
            validate(&draft, &Lifecycle::new(Status::Draft, None, PublishStatus::Dirty)),
            Err(ValidationError::DirtyRequiresLive {
                status: Status::Draft
            })
        );
    }

    #[test]
    fn live_may_update_or_end() {
        let current = Lifecycle::new(Status::Live, None, PublishStatus::Dirty);
        for target in [Status::Live, Status::Complete] {
            let requested = Lifecycle::new(Status::Live, Some(target), PublishStatus::Review);
            assert!(validate(&current, &requested).is_ok(), "target {target}");
        }
    }

    #[test]
    fn draft_cannot_queue_complete() {
        let requested = Lifecycle::new(Status::Draft, Some(Status::Complete), PublishStatus::Review);
        assert_eq!(
            validate(&Lifecycle::idle(Status::Draft), &requested),
            Err(ValidationError::StatusNextNotAllowed {
                status: Status::Draft,
                target: Status::Complete
            })
        );
    }

    #[test]
    fn draft_is_never_a_next_status() {
        for status in Status::ALL {
            let requested = Lifecycle::new(*status, Some(Status::Draft), PublishStatus::Review);
            assert!(validate(&Lifecycle::idle(*status), &requested).is_err());
        }
    }

    #[test]
    fn complete_is_terminal() {
        let current = Lifecycle::idle(Status::Complete);
        for target in Status::ALL {
            let requested = Lifecycle::new(Status::Complete, Some(*target), PublishStatus::Review);
            assert!(validate(&current, &requested).is_err());
        }
        assert!(validate(&current, &Lifecycle::idle(Status::Complete)).is_ok());
    }

    #[test]
    fn duplicate_queue_rejected() {
        for publish in [PublishStatus::Review, PublishStatus::Approved, PublishStatus::Waiting] {
            let current = Lifecycle::new(Status::Draft, Some(Status::Live), publish);
            let requested = Lifecycle::new(Status::Draft, Some(Status::Live), PublishStatus::Review);
            assert_eq!(
                validate(&current, &requested),
                Err(ValidationError::AlreadyQueued {
                    target: Status::Live,
                    publish_status: publish
                })
            );
        }
    }

    #[test]
    fn live_update_in_flight_may_switch_to_end() {
        let current = Lifecycle::new(Status::Live, Some(Status::Live), PublishStatus::Review);
        let requested = Lifecycle::new(Status::Live, Some(Status::Complete), PublishStatus::Review);
        assert!(validate(&current, &requested).is_ok());
    }

    #[test]
    fn cancel_review_allowed() {
        let current = Lifecycle::new(Status::Draft, Some(Status::Live), PublishStatus::Review);
        assert!(validate(&current, &Lifecycle::idle(Status::Draft)).is_ok());
    }

    #[test]
    fn status_next_and_publish_request_are_paired() {
        let current = Lifecycle::idle(Status::Draft);
        assert!(matches!(
            validate(&current, &Lifecycle::new(Status::Draft, Some(Status::Live), PublishStatus::Idle)),
            Err(ValidationError::StatusNextWithoutPublishRequest { .. })
        ));
        assert!(matches!(
            validate(&current, &Lifecycle::new(Status::Draft, None, PublishStatus::Review)),
            Err(ValidationError::PublishRequestWithoutStatusNext { .. })
        ));
    }

    #[test]
    fn validate_is_total_and_deterministic() {
        let lifecycles = all_lifecycles();
        for current in &lifecycles {
            for requested in &lifecycles {
                let first = validate(current, requested);
                let second = validate(current, requested);
                assert_eq!(first, second);

                if first.is_ok() {
                    // Accepted requests keep the data-model invariants.
                    if requested.status_next.is_some() {
                        assert!(requested.publish_status.is_in_flight());
                    }
                    assert_ne!(requested.publish_status, PublishStatus::Waiting);
                    if matches!(current.status, Status::Draft | Status::Preview) {
                        assert!(matches!(requested.status, Status::Draft | Status::Preview));
                    }
                    if current.status == Status::Complete {
                        assert_eq!(requested.status_next, None);
                    }
                }
            }
        }
    }
}
