//! Single-flight publish queue.
//!
//! One [`PublishQueueBroker::reconcile`] call per application and tick:
//!
//! 1. Compensate a rejected review: restore the affected record to its
//!    prior status and roll the remote workspace back.
//! 2. Stop while the workspace has a review pending. The remote review
//!    status is the only lock; this assumes a single coordinator process
//!    per application.
//! 3. Pick the queued record (publish status REVIEW) whose review was
//!    requested first.
//! 4. Allocate its buckets, push it to the workspace, request review (or
//!    sign it directly) and mark it APPROVED (or WAITING).
//!
//! A remote failure abandons the tick before the candidate's local status
//! changes, so the next tick redoes the same work.
//!
//! The candidate is re-read and must still be in REVIEW before anything is
//! sent. A caller cancelling it between that read and the final local write
//! still leaves the pushed workspace pending review while the local write
//! fails with a version conflict; the reviewer's decision then has no local
//! record to land on. Closing that window needs the same single coordinator
//! that step 2 already assumes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hatch_core::{
    changelog::latest_review_request, requested_count, Application, ExperimentRecord, Lifecycle,
    PublishStatus, Status, WireRecord, SYSTEM_ACTOR,
};
use hatch_storage::{HatchStorage, StorageError};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::allocator::{AllocationError, BucketAllocator};
use crate::changelog::write_transition;
use crate::config::ApplicationConfig;
use crate::remote::kinto::DEFAULT_REVIEWER;
use crate::remote::{RemoteConfigStore, RemoteError, ReviewStatus, WorkspaceStatus};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("application {0} is not configured")]
    UnknownApplication(Application),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("bucket allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error("experiment {slug} is queued with next status {target:?}, expected LIVE or COMPLETE")]
    InvalidStatusNext { slug: String, target: Option<Status> },
}

/// What a push did with the candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushOutcome {
    pub slug: String,
    pub status_next: Status,
    pub publish_status: PublishStatus,
}

/// Outcome of one reconcile tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub application: Application,
    pub review_status: ReviewStatus,
    /// Record restored after a rejected review, if any.
    pub rolled_back: Option<String>,
    /// Whether a pending review stopped the tick.
    pub blocked: bool,
    pub pushed: Option<PushOutcome>,
    /// Records still waiting in the queue after this tick.
    pub queued: Vec<String>,
}

impl ReconcileReport {
    fn new(application: Application, review_status: ReviewStatus) -> Self {
        Self {
            application,
            review_status,
            rolled_back: None,
            blocked: false,
            pushed: None,
            queued: Vec::new(),
        }
    }
}

pub struct PublishQueueBroker<S, R: ?Sized> {
    storage: Arc<S>,
    remote: Arc<R>,
    applications: BTreeMap<Application, ApplicationConfig>,
    /// Serialises ticks of the same application within this process.
    locks: BTreeMap<Application, Mutex<()>>,
}

impl<S, R> PublishQueueBroker<S, R>
where
    S: HatchStorage,
    R: RemoteConfigStore + ?Sized,
{
    pub fn new(
        storage: Arc<S>,
        remote: Arc<R>,
        applications: impl IntoIterator<Item = ApplicationConfig>,
    ) -> Self {
        let applications: BTreeMap<_, _> = applications
            .into_iter()
            .map(|config| (config.application, config))
            .collect();
        let locks = applications.keys().map(|app| (*app, Mutex::new(()))).collect();
        Self {
            storage,
            remote,
            applications,
            locks,
        }
    }

    pub fn applications(&self) -> impl Iterator<Item = &ApplicationConfig> {
        self.applications.values()
    }

    pub fn application(&self, application: Application) -> Result<&ApplicationConfig, BrokerError> {
        self.applications
            .get(&application)
            .ok_or(BrokerError::UnknownApplication(application))
    }

    /// Run one publish tick for `application`.
    pub async fn reconcile(&self, application: Application) -> Result<ReconcileReport, BrokerError> {
        let config = self.application(application)?;
        let _guard = match self.locks.get(&application) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        let collection = config.collection.as_str();

        let status = self.remote.workspace_status(collection).await?;
        let mut report = ReconcileReport::new(application, status.review_status);
        tracing::debug!(
            application = %application,
            collection,
            review_status = %status.review_status,
            "reconciling publish queue"
        );

        // 1. Rejection compensation.
        let mut pending = status.review_status == ReviewStatus::PendingReview;
        if status.review_status == ReviewStatus::Rejected {
            report.rolled_back = self.compensate_rejection(config, &status).await?;
            pending = false;
        }

        // 2. Single-flight admission.
        if pending {
            report.blocked = true;
            report.queued = self.queue(application).await?;
            tracing::debug!(application = %application, collection, "review pending, queue held");
            return Ok(report);
        }

        // 3. Candidate selection.
        let mut queue = self.queue(application).await?;
        if queue.is_empty() {
            return Ok(report);
        }
        let candidate = queue.remove(0);
        report.queued = queue;

        // 4. Push.
        report.pushed = self.push(config, &candidate).await?;
        Ok(report)
    }

    /// Records of `application` in REVIEW, in the order they requested it.
    async fn queue(&self, application: Application) -> Result<Vec<String>, BrokerError> {
        let records = self
            .storage
            .list_experiments(Some(application), Some(PublishStatus::Review))
            .await?;

        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let history = self.storage.list_changelog(&record.slug).await?;
            let key: Option<(OffsetDateTime, u64)> =
                latest_review_request(&history).map(|entry| (entry.timestamp, entry.id));
            keyed.push((key.is_none(), key, record.slug));
        }
        // Records with a review request entry first, oldest request first.
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, _, slug)| slug).collect())
    }

    async fn compensate_rejection(
        &self,
        config: &ApplicationConfig,
        status: &WorkspaceStatus,
    ) -> Result<Option<String>, BrokerError> {
        let collection = config.collection.as_str();
        let workspace = self.remote.list_workspace_records(collection).await?;
        let main: BTreeSet<String> = self
            .remote
            .list_main_records(collection)
            .await?
            .into_iter()
            .collect();
        let added: Vec<&String> = workspace.iter().filter(|id| !main.contains(*id)).collect();
        if added.len() > 1 {
            tracing::warn!(
                collection,
                records = ?added,
                "rejected workspace holds several new records, compensating the first"
            );
        }

        let (slug, delete_from_workspace) = match added.first() {
            Some(id) => (Some((*id).clone()), true),
            None => (self.single_in_flight(config.application).await?, false),
        };

        if let Some(slug) = &slug {
            self.restore_rejected(slug, status).await?;
            if delete_from_workspace {
                self.remote.delete_record(collection, slug).await?;
            }
        } else {
            tracing::warn!(collection, "rejected review matches no local experiment");
        }

        self.remote.rollback(collection).await?;
        tracing::info!(
            collection,
            slug = slug.as_deref().unwrap_or("-"),
            "rolled back rejected review"
        );
        Ok(slug)
    }

    /// The only record of `application` waiting on the remote store.
    async fn single_in_flight(&self, application: Application) -> Result<Option<String>, BrokerError> {
        let in_flight: Vec<ExperimentRecord> = self
            .storage
            .list_experiments(Some(application), None)
            .await?
            .into_iter()
            .filter(|r| r.publish_status.is_awaiting_remote())
            .collect();
        match in_flight.as_slice() {
            [only] => Ok(Some(only.slug.clone())),
            [] => Ok(None),
            many => {
                tracing::warn!(
                    application = %application,
                    count = many.len(),
                    "several experiments awaiting the remote store, cannot attribute rejection"
                );
                Ok(None)
            }
        }
    }

    /// Put a rejected record back where it was before it was queued.
    async fn restore_rejected(&self, slug: &str, status: &WorkspaceStatus) -> Result<(), BrokerError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let mut record = match storage.get_experiment_for_update(&mut snapshot, slug).await {
            Ok(record) => record,
            Err(StorageError::ExperimentNotFound { .. }) => {
                let _ = storage.abort_snapshot(snapshot).await;
                tracing::warn!(slug, "rejected record is not a known experiment");
                return Ok(());
            }
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        };

        if !record.publish_status.is_awaiting_remote() {
            storage.abort_snapshot(snapshot).await?;
            tracing::debug!(slug, "rejection already compensated");
            return Ok(());
        }

        let prior = match record.status {
            Status::Draft | Status::Preview => Status::Draft,
            Status::Live => Status::Live,
            Status::Complete => Status::Complete,
        };
        let actor = status.reviewed_by.as_deref().unwrap_or(DEFAULT_REVIEWER);
        let result = write_transition(
            storage,
            &mut snapshot,
            &mut record,
            Lifecycle::idle(prior),
            actor,
            status.reviewer_comment.clone(),
        )
        .await;
        match result {
            Ok(_) => storage.commit_snapshot(snapshot).await?,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        }
        tracing::info!(
            slug,
            status = %prior,
            reviewer = actor,
            comment = status.reviewer_comment.as_deref().unwrap_or(""),
            "review rejected, experiment restored"
        );
        Ok(())
    }

    /// Push `slug` unless it left the queue since it was selected.
    async fn push(
        &self,
        config: &ApplicationConfig,
        slug: &str,
    ) -> Result<Option<PushOutcome>, BrokerError> {
        let collection = config.collection.as_str();
        let record = self.storage.get_experiment(slug).await?;
        if record.publish_status != PublishStatus::Review {
            tracing::debug!(
                slug,
                publish_status = %record.publish_status,
                "candidate left the queue before push"
            );
            return Ok(None);
        }
        let target = match record.status_next {
            Some(target @ (Status::Live | Status::Complete)) => target,
            other => {
                return Err(BrokerError::InvalidStatusNext {
                    slug: slug.to_string(),
                    target: other,
                })
            }
        };

        match target {
            Status::Complete => {
                self.remote.delete_record(collection, slug).await?;
            }
            _ => {
                let allocator = BucketAllocator::new(self.storage.clone(), config.total_capacity);
                let (group, range) = allocator
                    .allocate(
                        slug,
                        record.isolation_group_name(),
                        config.randomization_unit(),
                        requested_count(record.population_fraction, config.total_capacity),
                    )
                    .await?;
                let wire = WireRecord::build(&record, &group, &range);
                self.remote.put_record(collection, &wire).await?;
            }
        }

        let publish_status = if config.review_required {
            self.remote.request_review(collection).await?;
            PublishStatus::Approved
        } else {
            self.remote.request_sign(collection).await?;
            PublishStatus::Waiting
        };

        // The record was read outside this snapshot; its version guards
        // against a concurrent edit.
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let lifecycle = Lifecycle::new(record.status, Some(target), publish_status);
        let mut current = record;
        let result = write_transition(
            storage,
            &mut snapshot,
            &mut current,
            lifecycle,
            SYSTEM_ACTOR,
            None,
        )
        .await;
        match result {
            Ok(_) => storage.commit_snapshot(snapshot).await?,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            slug,
            collection,
            status_next = %target,
            publish_status = %publish_status,
            "pushed experiment"
        );
        Ok(Some(PushOutcome {
            slug: slug.to_string(),
            status_next: target,
            publish_status,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{CreateExperiment, MutationService, TransitionRequest};
    use crate::remote::MemoryStore;
    use hatch_core::ExperimentPayload;
    use hatch_storage::MemoryStorage;

    struct Harness {
        storage: Arc<MemoryStorage>,
        remote: Arc<MemoryStore>,
        broker: PublishQueueBroker<MemoryStorage, MemoryStore>,
        mutations: MutationService<MemoryStorage>,
    }

    fn harness(review_required: bool) -> Harness {
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(MemoryStore::new());
        let config = ApplicationConfig::new(Application::Desktop)
            .with_collection("desktop")
            .with_review_required(review_required);
        Harness {
            broker: PublishQueueBroker::new(storage.clone(), remote.clone(), [config]),
            mutations: MutationService::new(storage.clone()),
            storage,
            remote,
        }
    }

    impl Harness {
        async fn queue_launch(&self, slug: &str, fraction: f64) {
            self.mutations
                .create(
                    CreateExperiment {
                        slug: slug.into(),
                        application: Application::Desktop,
                        population_fraction: fraction,
                        isolation_group: None,
                        payload: ExperimentPayload::default(),
                    },
                    "alice",
                )
                .await
                .unwrap();
            self.mutations
                .request_transition(
                    slug,
                    &TransitionRequest::request_review(Status::Live),
                    "alice",
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn empty_queue_does_nothing() {
        let h = harness(true);
        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(report.pushed, None);
        assert!(!report.blocked);
        assert_eq!(h.remote.review_status("desktop"), ReviewStatus::None);
    }

    #[tokio::test]
    async fn unknown_application_rejected() {
        let h = harness(true);
        assert!(matches!(
            h.broker.reconcile(Application::Ios).await,
            Err(BrokerError::UnknownApplication(Application::Ios))
        ));
    }

    #[tokio::test]
    async fn push_allocates_and_requests_review() {
        let h = harness(true);
        h.queue_launch("exp-a", 70.0).await;

        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        let pushed = report.pushed.unwrap();
        assert_eq!(pushed.publish_status, PublishStatus::Approved);

        let wire = h.remote.workspace_record("desktop", "exp-a").unwrap();
        assert_eq!(wire["bucketConfig"]["namespace"], "exp-a-1");
        assert_eq!(wire["bucketConfig"]["count"], 7000);
        assert_eq!(wire["bucketConfig"]["randomizationUnit"], "normandy_id");
        assert_eq!(h.remote.review_status("desktop"), ReviewStatus::PendingReview);

        let record = h.storage.get_experiment("exp-a").await.unwrap();
        assert_eq!(record.publish_status, PublishStatus::Approved);
        assert_eq!(record.status, Status::Draft);
        let history = h.storage.list_changelog("exp-a").await.unwrap();
        assert_eq!(history.last().unwrap().actor, SYSTEM_ACTOR);
    }

    #[tokio::test]
    async fn auto_sign_marks_waiting() {
        let h = harness(false);
        h.queue_launch("exp-a", 10.0).await;
        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(report.pushed.unwrap().publish_status, PublishStatus::Waiting);
        assert!(h.remote.main_record("desktop", "exp-a").is_some());
    }

    #[tokio::test]
    async fn oldest_request_goes_first() {
        let h = harness(true);
        h.queue_launch("exp-b", 10.0).await;
        h.queue_launch("exp-a", 10.0).await;

        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(report.pushed.unwrap().slug, "exp-b");
        assert_eq!(report.queued, vec!["exp-a"]);
    }

    #[tokio::test]
    async fn cancelled_candidate_is_not_pushed() {
        let h = harness(true);
        h.queue_launch("exp-a", 10.0).await;
        let cancel = TransitionRequest {
            publish_status: Some(PublishStatus::Idle),
            ..Default::default()
        };
        h.mutations
            .request_transition("exp-a", &cancel, "alice", None)
            .await
            .unwrap();

        // Selected before the cancel landed.
        let config = h.broker.application(Application::Desktop).unwrap();
        assert_eq!(h.broker.push(config, "exp-a").await.unwrap(), None);

        assert!(h.remote.calls().is_empty(), "{:?}", h.remote.calls());
        assert!(h.storage.get_bucket_range("exp-a").await.unwrap().is_none());
        let record = h.storage.get_experiment("exp-a").await.unwrap();
        assert_eq!(record.lifecycle(), Lifecycle::idle(Status::Draft));
    }

    #[tokio::test]
    async fn remote_failure_leaves_candidate_queued() {
        let h = harness(true);
        h.queue_launch("exp-a", 10.0).await;
        h.remote.set_unavailable(true);

        let err = h.broker.reconcile(Application::Desktop).await.unwrap_err();
        assert!(matches!(err, BrokerError::Remote(_)));
        let record = h.storage.get_experiment("exp-a").await.unwrap();
        assert_eq!(record.publish_status, PublishStatus::Review);

        h.remote.set_unavailable(false);
        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(report.pushed.unwrap().slug, "exp-a");
    }

    #[tokio::test]
    async fn rejection_restores_draft_once() {
        let h = harness(true);
        h.queue_launch("exp-a", 10.0).await;
        h.broker.reconcile(Application::Desktop).await.unwrap();
        h.remote.reject("desktop", "bob", "needs changes");

        let report = h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(report.rolled_back.as_deref(), Some("exp-a"));

        let record = h.storage.get_experiment("exp-a").await.unwrap();
        assert_eq!(record.lifecycle(), Lifecycle::idle(Status::Draft));
        assert!(h.remote.workspace_record("desktop", "exp-a").is_none());

        let history = h.storage.list_changelog("exp-a").await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.message.as_deref(), Some("needs changes"));
        assert_eq!(last.actor, "bob");

        // Already compensated: a second rejection signal changes nothing locally.
        h.remote.reject("desktop", "bob", "needs changes");
        h.broker.reconcile(Application::Desktop).await.unwrap();
        assert_eq!(h.storage.list_changelog("exp-a").await.unwrap().len(), history.len());
    }
}
