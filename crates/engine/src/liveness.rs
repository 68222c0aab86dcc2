//! Mirrors remote publication back into local status.
//!
//! Local status lags the remote store, never the reverse: a record becomes
//! LIVE once its slug shows up in the main bucket, and COMPLETE once a live
//! record's slug is gone from it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hatch_core::{Application, ExperimentRecord, Lifecycle, Status, SYSTEM_ACTOR};
use hatch_storage::{HatchStorage, StorageError};
use serde::Serialize;

use crate::broker::BrokerError;
use crate::changelog::write_transition;
use crate::config::ApplicationConfig;
use crate::remote::{RemoteConfigStore, ReviewStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivenessReport {
    pub went_live: Vec<String>,
    pub completed: Vec<String>,
}

/// Status a record should settle into given what the remote store shows,
/// or `None` to leave it alone.
pub fn observed_status(
    record: &ExperimentRecord,
    in_main: bool,
    review_status: ReviewStatus,
) -> Option<Status> {
    let awaiting = record.publish_status.is_awaiting_remote();
    match (record.status, record.status_next) {
        // Launch confirmed.
        (Status::Draft | Status::Preview, Some(Status::Live)) if awaiting && in_main => {
            Some(Status::Live)
        }
        // Update confirmed. The slug was in main before the update too, so
        // only a signed workspace tells the update apart from the old copy.
        (Status::Live, Some(Status::Live))
            if awaiting && in_main && review_status == ReviewStatus::Signed =>
        {
            Some(Status::Live)
        }
        (Status::Live, _) if !in_main => Some(Status::Complete),
        _ => None,
    }
}

pub struct LivenessReconciler<S, R: ?Sized> {
    storage: Arc<S>,
    remote: Arc<R>,
    applications: BTreeMap<Application, ApplicationConfig>,
}

impl<S, R> LivenessReconciler<S, R>
where
    S: HatchStorage,
    R: RemoteConfigStore + ?Sized,
{
    pub fn new(
        storage: Arc<S>,
        remote: Arc<R>,
        applications: impl IntoIterator<Item = ApplicationConfig>,
    ) -> Self {
        Self {
            storage,
            remote,
            applications: applications
                .into_iter()
                .map(|config| (config.application, config))
                .collect(),
        }
    }

    /// Settle every record of `application` whose remote state moved on.
    pub async fn reconcile_liveness(
        &self,
        application: Application,
    ) -> Result<LivenessReport, BrokerError> {
        let config = self
            .applications
            .get(&application)
            .ok_or(BrokerError::UnknownApplication(application))?;
        let collection = config.collection.as_str();
        let main: BTreeSet<String> = self
            .remote
            .list_main_records(collection)
            .await?
            .into_iter()
            .collect();
        let review_status = self.remote.workspace_status(collection).await?.review_status;

        let mut report = LivenessReport::default();
        let records = self
            .storage
            .list_experiments(Some(config.application), None)
            .await?;
        for record in records {
            if observed_status(&record, main.contains(&record.slug), review_status).is_none() {
                continue;
            }
            let settled = self
                .settle(&record.slug, main.contains(&record.slug), review_status)
                .await?;
            match settled {
                Some(Status::Live) => report.went_live.push(record.slug),
                Some(Status::Complete) => report.completed.push(record.slug),
                _ => {}
            }
        }

        if !report.went_live.is_empty() || !report.completed.is_empty() {
            tracing::info!(
                application = %config.application,
                collection,
                went_live = ?report.went_live,
                completed = ?report.completed,
                "liveness reconciled"
            );
        }
        Ok(report)
    }

    /// Re-check one record under lock and apply the observed status.
    async fn settle(
        &self,
        slug: &str,
        in_main: bool,
        review_status: ReviewStatus,
    ) -> Result<Option<Status>, BrokerError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        let mut record = match storage.get_experiment_for_update(&mut snapshot, slug).await {
            Ok(record) => record,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        };
        let Some(status) = observed_status(&record, in_main, review_status) else {
            storage.abort_snapshot(snapshot).await?;
            return Ok(None);
        };

        let result: Result<_, StorageError> = write_transition(
            storage,
            &mut snapshot,
            &mut record,
            Lifecycle::idle(status),
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
        tracing::debug!(slug, status = %status, "settled experiment status");
        Ok(Some(status))
    }
}
