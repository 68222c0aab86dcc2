//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hatch_core::{Application, PublishStatus, Status};
use hatch_engine::{
    AllocationError, BrokerError, CreateExperiment, MutationError, TickReport, TransitionRequest,
};
use hatch_storage::{HatchStorage, StorageError};
use serde::Deserialize;

use super::state::AppState;
use super::{json_error, DEFAULT_API_ACTOR};

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let applications: Vec<serde_json::Value> = state
        .broker
        .applications()
        .map(|config| {
            serde_json::json!({
                "application": config.application,
                "collection": config.collection,
                "review_required": config.review_required,
            })
        })
        .collect();
    let response = serde_json::json!({
        "status": "ok",
        "hatch_version": env!("CARGO_PKG_VERSION"),
        "applications": applications,
    });
    (StatusCode::OK, Json(response))
}

/// GET /experiments/{slug}
pub(crate) async fn handle_get_experiment(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    match state.storage.get_experiment(&slug).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => storage_error(&e),
    }
}

/// GET /experiments/{slug}/changelog
pub(crate) async fn handle_get_changelog(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Response {
    if let Err(e) = state.storage.get_experiment(&slug).await {
        return storage_error(&e);
    }
    match state.storage.list_changelog(&slug).await {
        Ok(history) => (StatusCode::OK, Json(history)).into_response(),
        Err(e) => storage_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    #[serde(flatten)]
    experiment: CreateExperiment,
    #[serde(default)]
    actor: Option<String>,
}

/// POST /experiments
pub(crate) async fn handle_create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let body: CreateBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => {
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, &format!("invalid body: {}", e))
                .into_response()
        }
    };
    let actor = body.actor.as_deref().unwrap_or(DEFAULT_API_ACTOR);
    match state.mutations.create(body.experiment, actor).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => mutation_error(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransitionBody {
    #[serde(default)]
    status: Option<Status>,
    #[serde(default)]
    status_next: Option<Status>,
    #[serde(default)]
    publish_status: Option<PublishStatus>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// POST /experiments/{slug}/transition
pub(crate) async fn handle_transition(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let body: TransitionBody = match serde_json::from_value(body) {
        Ok(body) => body,
        Err(e) => {
            return json_error(StatusCode::UNPROCESSABLE_ENTITY, &format!("invalid body: {}", e))
                .into_response()
        }
    };
    let request = TransitionRequest {
        status: body.status,
        status_next: body.status_next,
        publish_status: body.publish_status,
    };
    let actor = body.actor.as_deref().unwrap_or(DEFAULT_API_ACTOR);
    match state
        .mutations
        .request_transition(&slug, &request, actor, body.message)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => mutation_error(&e),
    }
}

/// POST /applications/{app}/reconcile
pub(crate) async fn handle_reconcile(
    State(state): State<Arc<AppState>>,
    Path(app): Path<String>,
) -> Response {
    let application: Application = match app.parse() {
        Ok(application) => application,
        Err(e) => return json_error(StatusCode::NOT_FOUND, &e.to_string()).into_response(),
    };

    let publish = match state.broker.reconcile(application).await {
        Ok(report) => report,
        Err(e) => return broker_error(&e),
    };
    let liveness = match state.liveness.reconcile_liveness(application).await {
        Ok(report) => report,
        Err(e) => return broker_error(&e),
    };
    let report = TickReport {
        application,
        publish: Ok(publish),
        liveness: Ok(liveness),
    };
    (StatusCode::OK, Json(report)).into_response()
}

fn storage_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::ExperimentNotFound { .. } | StorageError::GroupNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        StorageError::AlreadyExists { .. } | StorageError::RangeOverlap { .. } => {
            StatusCode::CONFLICT
        }
        e if e.is_conflict() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn storage_error(e: &StorageError) -> Response {
    json_error(storage_status(e), &e.to_string()).into_response()
}

fn mutation_error(e: &MutationError) -> Response {
    let status = match e {
        MutationError::Validation(_) | MutationError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MutationError::NotFound { .. } => StatusCode::NOT_FOUND,
        MutationError::AlreadyExists { .. } | MutationError::Conflict { .. } => {
            StatusCode::CONFLICT
        }
        MutationError::Storage(e) => storage_status(e),
    };
    json_error(status, &e.to_string()).into_response()
}

fn broker_error(e: &BrokerError) -> Response {
    let status = match e {
        BrokerError::UnknownApplication(_) => StatusCode::NOT_FOUND,
        BrokerError::Remote(_) => StatusCode::BAD_GATEWAY,
        BrokerError::Storage(e) => storage_status(e),
        BrokerError::Allocation(AllocationError::RetriesExhausted { .. }) => StatusCode::CONFLICT,
        BrokerError::Allocation(AllocationError::Invalid(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::Allocation(AllocationError::Storage(e)) => storage_status(e),
        BrokerError::InvalidStatusNext { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    };
    json_error(status, &e.to_string()).into_response()
}
