//! The write path for requested changes.
//!
//! Every accepted change stores the record and its history entry in one
//! snapshot. Rejected requests leave no trace.

use std::sync::Arc;

use hatch_core::types::validate_population_fraction;
use hatch_core::{
    is_reserved_field, validate, Application, ExperimentPayload, ExperimentRecord, Lifecycle,
    PublishStatus, Status, ValidationError,
};
use hatch_storage::{HatchStorage, StorageError};
use serde::{Deserialize, Serialize};

use crate::changelog::{record_change, write_transition};

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("invalid transition: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("experiment not found: {slug}")]
    NotFound { slug: String },

    #[error("experiment already exists: {slug}")]
    AlreadyExists { slug: String },

    #[error("experiment {slug} was changed concurrently; reload and retry")]
    Conflict { slug: String },

    #[error(transparent)]
    Storage(StorageError),
}

impl MutationError {
    fn from_storage(slug: &str, e: StorageError) -> Self {
        match e {
            StorageError::ExperimentNotFound { slug } => MutationError::NotFound { slug },
            StorageError::AlreadyExists { .. } => MutationError::AlreadyExists {
                slug: slug.to_string(),
            },
            e if e.is_conflict() => MutationError::Conflict {
                slug: slug.to_string(),
            },
            e => MutationError::Storage(e),
        }
    }
}

/// A new experiment as submitted by the authoring layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperiment {
    pub slug: String,
    pub application: Application,
    pub population_fraction: f64,
    #[serde(default)]
    pub isolation_group: Option<String>,
    #[serde(default)]
    pub payload: ExperimentPayload,
}

/// A requested lifecycle change. Omitted `status` and `publish_status`
/// keep their current values; `status_next` is taken as given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionRequest {
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub status_next: Option<Status>,
    #[serde(default)]
    pub publish_status: Option<PublishStatus>,
}

impl TransitionRequest {
    /// Queue for launch or update review.
    pub fn request_review(target: Status) -> Self {
        Self {
            status: None,
            status_next: Some(target),
            publish_status: Some(PublishStatus::Review),
        }
    }

    fn resolve(&self, current: &Lifecycle) -> Lifecycle {
        Lifecycle::new(
            self.status.unwrap_or(current.status),
            self.status_next,
            self.publish_status.unwrap_or(current.publish_status),
        )
    }
}

fn validate_slug(slug: &str) -> Result<(), MutationError> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MutationError::InvalidRequest(format!(
            "slug '{slug}' must be non-empty lowercase letters, digits, '-' or '_'"
        )))
    }
}

pub struct MutationService<S> {
    storage: Arc<S>,
}

impl<S: HatchStorage> MutationService<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Insert a DRAFT/IDLE record with its creation entry.
    pub async fn create(
        &self,
        request: CreateExperiment,
        actor: &str,
    ) -> Result<ExperimentRecord, MutationError> {
        validate_slug(&request.slug)?;
        validate_population_fraction(request.population_fraction)
            .map_err(MutationError::InvalidRequest)?;
        if let Some(group) = &request.isolation_group {
            validate_slug(group)?;
        }
        if let Some(key) = request.payload.extra.keys().find(|key| is_reserved_field(key)) {
            return Err(MutationError::InvalidRequest(format!(
                "payload field '{key}' is computed on publish and cannot be set"
            )));
        }

        let mut record = ExperimentRecord::new_draft(
            request.slug,
            request.application,
            request.population_fraction,
            request.payload,
        );
        record.isolation_group = request.isolation_group;

        let storage = &*self.storage;
        let slug = record.slug.clone();
        let mut snapshot = storage
            .begin_snapshot()
            .await
            .map_err(|e| MutationError::from_storage(&slug, e))?;
        let result = async {
            storage.insert_experiment(&mut snapshot, record.clone()).await?;
            record_change(storage, &mut snapshot, &record, actor, None).await
        }
        .await;
        finish(storage, snapshot, &slug, result).await?;

        tracing::info!(slug = %slug, application = %record.application, actor, "experiment created");
        Ok(record)
    }

    /// Validate and apply a lifecycle change requested by `actor`.
    pub async fn request_transition(
        &self,
        slug: &str,
        request: &TransitionRequest,
        actor: &str,
        message: Option<String>,
    ) -> Result<ExperimentRecord, MutationError> {
        let storage = &*self.storage;
        let mut snapshot = storage
            .begin_snapshot()
            .await
            .map_err(|e| MutationError::from_storage(slug, e))?;

        let mut record = match storage.get_experiment_for_update(&mut snapshot, slug).await {
            Ok(record) => record,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(MutationError::from_storage(slug, e));
            }
        };

        let current = record.lifecycle();
        let requested = request.resolve(&current);
        if let Err(e) = validate(&current, &requested) {
            let _ = storage.abort_snapshot(snapshot).await;
            tracing::debug!(slug, %current, %requested, reason = %e, "transition rejected");
            return Err(e.into());
        }

        let result =
            write_transition(storage, &mut snapshot, &mut record, requested, actor, message).await;
        finish(storage, snapshot, slug, result).await?;

        tracing::info!(slug, from = %current, to = %requested, actor, "transition applied");
        Ok(record)
    }
}

/// Commit on success, abort on failure.
async fn finish<S: HatchStorage, T>(
    storage: &S,
    snapshot: S::Snapshot,
    slug: &str,
    result: Result<T, StorageError>,
) -> Result<T, MutationError> {
    match result {
        Ok(value) => {
            storage
                .commit_snapshot(snapshot)
                .await
                .map_err(|e| MutationError::from_storage(slug, e))?;
            Ok(value)
        }
        Err(e) => {
            let _ = storage.abort_snapshot(snapshot).await;
            Err(MutationError::from_storage(slug, e))
        }
    }
}
