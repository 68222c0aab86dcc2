//! Kinto-style HTTP remote store.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime. Records are written to the
//! `main-workspace` bucket; clients read the `main` bucket. Review state
//! lives in the workspace collection's `status` metadata field.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use hatch_core::WireRecord;
use serde_json::{json, Value};

use super::{RemoteConfigStore, RemoteError, ReviewStatus, WorkspaceStatus};

pub const WORKSPACE_BUCKET: &str = "main-workspace";
pub const MAIN_BUCKET: &str = "main";

/// Actor name used when the reviewer is unknown.
pub const DEFAULT_REVIEWER: &str = "remote-settings";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KintoAuth {
    Anonymous,
    Basic { user: String, password: String },
    Bearer(String),
}

impl KintoAuth {
    /// Parse a `user:password` credential.
    pub fn basic(credential: &str) -> Result<Self, RemoteError> {
        let (user, password) = credential.split_once(':').ok_or_else(|| {
            RemoteError::Config("basic credential must have the form user:password".to_string())
        })?;
        Ok(KintoAuth::Basic {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    fn header_value(&self) -> Option<String> {
        match self {
            KintoAuth::Anonymous => None,
            KintoAuth::Basic { user, password } => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{user}:{password}"));
                Some(format!("Basic {encoded}"))
            }
            KintoAuth::Bearer(token) => Some(format!("Bearer {token}")),
        }
    }
}

enum Method {
    Get,
    Put(Value),
    Patch(Value),
    Delete,
}

/// Client for a Kinto server, e.g. `https://settings.example.com/v1`.
pub struct KintoStore {
    base_url: String,
    auth: KintoAuth,
    agent: ureq::Agent,
}

impl KintoStore {
    pub fn new(base_url: &str, auth: KintoAuth) -> Self {
        Self::with_timeout(base_url, auth, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, auth: KintoAuth, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        KintoStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn collection_url(&self, bucket: &str, collection: &str) -> String {
        format!("{}/buckets/{bucket}/collections/{collection}", self.base_url)
    }

    fn records_url(&self, bucket: &str, collection: &str) -> String {
        format!("{}/records", self.collection_url(bucket, collection))
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{id}", self.records_url(WORKSPACE_BUCKET, collection))
    }

    /// Run one request off the async runtime. Returns the decoded body for
    /// GET requests. A DELETE of a missing record succeeds.
    async fn execute(
        &self,
        collection: &str,
        method: Method,
        url: String,
    ) -> Result<Option<Value>, RemoteError> {
        let agent = self.agent.clone();
        let auth = self.auth.header_value();
        let owned_collection = collection.to_string();

        tracing::debug!(collection, url = %url, "remote request");

        tokio::task::spawn_blocking(move || {
            let collection = owned_collection;
            let is_get = matches!(method, Method::Get);
            let is_delete = matches!(method, Method::Delete);
            let result = match method {
                Method::Get => with_auth(agent.get(&url), auth.as_deref()).call(),
                Method::Put(body) => with_auth(agent.put(&url), auth.as_deref()).send_json(&body),
                Method::Patch(body) => {
                    with_auth(agent.patch(&url), auth.as_deref()).send_json(&body)
                }
                Method::Delete => with_auth(agent.delete(&url), auth.as_deref()).call(),
            };

            let response = match result {
                Ok(response) => response,
                Err(ureq::Error::StatusCode(404)) if is_delete => return Ok(None),
                Err(ureq::Error::StatusCode(status)) => {
                    return Err(RemoteError::Status { collection, status })
                }
                Err(e) => {
                    return Err(RemoteError::Request {
                        collection,
                        message: e.to_string(),
                    })
                }
            };

            if !is_get {
                return Ok(None);
            }
            response
                .into_body()
                .read_json::<Value>()
                .map(Some)
                .map_err(|e| RemoteError::Decode {
                    collection,
                    message: format!("failed to parse response as JSON: {e}"),
                })
        })
        .await
        .map_err(|e| RemoteError::Request {
            collection: collection.to_string(),
            message: format!("task join error: {e}"),
        })?
    }

    async fn get(&self, collection: &str, url: String) -> Result<Value, RemoteError> {
        self.execute(collection, Method::Get, url)
            .await?
            .ok_or_else(|| RemoteError::Decode {
                collection: collection.to_string(),
                message: "empty response".to_string(),
            })
    }

    async fn set_status(&self, collection: &str, status: &str) -> Result<(), RemoteError> {
        let url = self.collection_url(WORKSPACE_BUCKET, collection);
        tracing::info!(collection, status, "updating collection status");
        self.execute(
            collection,
            Method::Patch(json!({ "data": { "status": status } })),
            url,
        )
        .await
        .map(|_| ())
    }

    async fn record_ids(&self, bucket: &str, collection: &str) -> Result<Vec<String>, RemoteError> {
        let url = format!("{}?_fields=id", self.records_url(bucket, collection));
        let body = self.get(collection, url).await?;
        parse_record_ids(collection, &body)
    }
}

fn with_auth<B>(request: ureq::RequestBuilder<B>, auth: Option<&str>) -> ureq::RequestBuilder<B> {
    match auth {
        Some(value) => request.header("Authorization", value),
        None => request,
    }
}

/// Map collection metadata (`{"data": {...}}`) to a workspace status.
pub fn parse_workspace_status(metadata: &Value) -> WorkspaceStatus {
    let data = metadata.get("data").unwrap_or(metadata);
    let review_status = match data.get("status").and_then(Value::as_str) {
        Some("to-review") | Some("to-sign") | Some("to-rollback") => ReviewStatus::PendingReview,
        Some("work-in-progress") => ReviewStatus::Rejected,
        Some("signed") => ReviewStatus::Signed,
        _ => ReviewStatus::None,
    };
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    WorkspaceStatus {
        review_status,
        reviewer_comment: text("last_reviewer_comment"),
        reviewed_by: text("last_review_by"),
    }
}

/// Extract record ids from a record listing (`{"data": [{"id": ...}]}`).
pub fn parse_record_ids(collection: &str, body: &Value) -> Result<Vec<String>, RemoteError> {
    let records = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| RemoteError::Decode {
            collection: collection.to_string(),
            message: "record listing has no data array".to_string(),
        })?;
    records
        .iter()
        .map(|record| {
            record
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RemoteError::Decode {
                    collection: collection.to_string(),
                    message: "record without an id".to_string(),
                })
        })
        .collect()
}

#[async_trait]
impl RemoteConfigStore for KintoStore {
    async fn workspace_status(&self, collection: &str) -> Result<WorkspaceStatus, RemoteError> {
        let url = self.collection_url(WORKSPACE_BUCKET, collection);
        let metadata = self.get(collection, url).await?;
        Ok(parse_workspace_status(&metadata))
    }

    async fn put_record(&self, collection: &str, record: &WireRecord) -> Result<(), RemoteError> {
        let data = record.to_json().map_err(|e| RemoteError::Decode {
            collection: collection.to_string(),
            message: format!("failed to encode record {}: {e}", record.id),
        })?;
        let url = self.record_url(collection, &record.id);
        self.execute(collection, Method::Put(json!({ "data": data })), url)
            .await
            .map(|_| ())
    }

    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.record_url(collection, id);
        self.execute(collection, Method::Delete, url).await.map(|_| ())
    }

    async fn request_review(&self, collection: &str) -> Result<(), RemoteError> {
        self.set_status(collection, "to-review").await
    }

    async fn request_sign(&self, collection: &str) -> Result<(), RemoteError> {
        self.set_status(collection, "to-sign").await
    }

    async fn rollback(&self, collection: &str) -> Result<(), RemoteError> {
        self.set_status(collection, "to-rollback").await
    }

    async fn list_main_records(&self, collection: &str) -> Result<Vec<String>, RemoteError> {
        self.record_ids(MAIN_BUCKET, collection).await
    }

    async fn list_workspace_records(&self, collection: &str) -> Result<Vec<String>, RemoteError> {
        self.record_ids(WORKSPACE_BUCKET, collection).await
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            ("to-review", ReviewStatus::PendingReview),
            ("to-sign", ReviewStatus::PendingReview),
            ("to-rollback", ReviewStatus::PendingReview),
            ("work-in-progress", ReviewStatus::Rejected),
            ("signed", ReviewStatus::Signed),
        ];
        for (raw, expected) in cases {
            let status = parse_workspace_status(&json!({ "data": { "status": raw } }));
            assert_eq!(status.review_status, expected, "{raw}");
        }
        assert_eq!(
            parse_workspace_status(&json!({ "data": {} })).review_status,
            ReviewStatus::None
        );
    }

    #[test]
    fn reviewer_details_extracted() {
        let status = parse_workspace_status(&json!({
            "data": {
                "status": "work-in-progress",
                "last_reviewer_comment": "needs changes",
                "last_review_by": "account:reviewer",
                "last_editor_comment": ""
            }
        }));
        assert_eq!(status.review_status, ReviewStatus::Rejected);
        assert_eq!(status.reviewer_comment.as_deref(), Some("needs changes"));
        assert_eq!(status.reviewed_by.as_deref(), Some("account:reviewer"));
    }

    #[test]
    fn empty_comment_is_none() {
        let status = parse_workspace_status(&json!({
            "data": { "status": "signed", "last_reviewer_comment": "" }
        }));
        assert_eq!(status.reviewer_comment, None);
    }

    #[test]
    fn record_ids_parsed() {
        let ids = parse_record_ids(
            "c",
            &json!({ "data": [{ "id": "exp-a" }, { "id": "exp-b", "last_modified": 1 }] }),
        )
        .unwrap();
        assert_eq!(ids, vec!["exp-a", "exp-b"]);
    }

    #[test]
    fn record_listing_without_data_is_decode_error() {
        assert!(matches!(
            parse_record_ids("c", &json!({ "error": "nope" })),
            Err(RemoteError::Decode { .. })
        ));
    }

    #[test]
    fn basic_auth_header() {
        let auth = KintoAuth::basic("admin:s3cret").unwrap();
        assert_eq!(
            auth.header_value().as_deref(),
            Some("Basic YWRtaW46czNjcmV0")
        );
        assert!(KintoAuth::basic("no-colon").is_err());
        assert_eq!(
            KintoAuth::Bearer("tok".into()).header_value().as_deref(),
            Some("Bearer tok")
        );
        assert_eq!(KintoAuth::Anonymous.header_value(), None);
    }

    #[test]
    fn urls_built_from_base() {
        let store = KintoStore::new("http://localhost:8888/v1/", KintoAuth::Anonymous);
        assert_eq!(
            store.record_url("hatch-desktop", "exp-a"),
            "http://localhost:8888/v1/buckets/main-workspace/collections/hatch-desktop/records/exp-a"
        );
        assert_eq!(
            store.records_url(MAIN_BUCKET, "hatch-desktop"),
            "http://localhost:8888/v1/buckets/main/collections/hatch-desktop/records"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_request_error() {
        let store = KintoStore::with_timeout(
            "http://127.0.0.1:1",
            KintoAuth::Anonymous,
            Duration::from_secs(2),
        );
        let err = store.workspace_status("c").await.unwrap_err();
        assert!(matches!(err, RemoteError::Request { .. }), "{err:?}");
    }
}
