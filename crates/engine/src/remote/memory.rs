//! In-process remote store.
//!
//! Behaves like the HTTP store from the publisher's side and exposes the
//! reviewer's side as plain methods ([`approve`](MemoryStore::approve),
//! [`reject`](MemoryStore::reject)) plus a way to end an experiment from
//! outside ([`remove_from_main`](MemoryStore::remove_from_main)). Used by
//! tests and by `hatch serve` when no remote URL is configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use hatch_core::WireRecord;
use serde_json::Value;

use super::{RemoteConfigStore, RemoteError, ReviewStatus, WorkspaceStatus};

#[derive(Debug, Clone)]
struct Collection {
    workspace: BTreeMap<String, Value>,
    main: BTreeMap<String, Value>,
    status: WorkspaceStatus,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            workspace: BTreeMap::new(),
            main: BTreeMap::new(),
            status: WorkspaceStatus::new(ReviewStatus::None),
        }
    }
}

impl Collection {
    fn publish(&mut self) {
        self.main = self.workspace.clone();
        self.status.review_status = ReviewStatus::Signed;
    }
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    unavailable: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against a collection, failing while the store is marked
    /// unavailable.
    fn with_collection<T>(
        &self,
        op: &str,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> T,
    ) -> Result<T, RemoteError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(RemoteError::Unavailable(format!("{op} {collection}")));
        }
        inner.calls.push(format!("{op} {collection}"));
        Ok(f(inner.collections.entry(collection.to_string()).or_default()))
    }

    // ── Reviewer and operator hooks ────────────────────────────────────

    /// Approve the pending change: main takes the workspace content.
    pub fn approve(&self, collection: &str, reviewer: &str) {
        let mut inner = self.lock();
        let c = inner.collections.entry(collection.to_string()).or_default();
        c.publish();
        c.status.reviewer_comment = None;
        c.status.reviewed_by = Some(reviewer.to_string());
    }

    /// Decline the pending change. The workspace keeps it until rolled back.
    pub fn reject(&self, collection: &str, reviewer: &str, comment: &str) {
        let mut inner = self.lock();
        let c = inner.collections.entry(collection.to_string()).or_default();
        c.status = WorkspaceStatus {
            review_status: ReviewStatus::Rejected,
            reviewer_comment: Some(comment.to_string()),
            reviewed_by: Some(reviewer.to_string()),
        };
    }

    /// Remove a record from both buckets, as if ended outside this system.
    pub fn remove_from_main(&self, collection: &str, id: &str) {
        let mut inner = self.lock();
        let c = inner.collections.entry(collection.to_string()).or_default();
        c.main.remove(id);
        c.workspace.remove(id);
    }

    /// Make every publisher-side call fail with [`RemoteError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    // ── Inspection ─────────────────────────────────────────────────────

    pub fn review_status(&self, collection: &str) -> ReviewStatus {
        self.lock()
            .collections
            .get(collection)
            .map_or(ReviewStatus::None, |c| c.status.review_status)
    }

    pub fn workspace_record(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.workspace.get(id).cloned())
    }

    pub fn main_record(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.main.get(id).cloned())
    }

    /// Publisher-side calls made so far, as `"<operation> <collection>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl RemoteConfigStore for MemoryStore {
    async fn workspace_status(&self, collection: &str) -> Result<WorkspaceStatus, RemoteError> {
        self.with_collection("workspace_status", collection, |c| c.status.clone())
    }

    async fn put_record(&self, collection: &str, record: &WireRecord) -> Result<(), RemoteError> {
        let data = record.to_json().map_err(|e| RemoteError::Decode {
            collection: collection.to_string(),
            message: e.to_string(),
        })?;
        self.with_collection("put_record", collection, |c| {
            c.workspace.insert(record.id.clone(), data);
        })
    }

    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.with_collection("delete_record", collection, |c| {
            c.workspace.remove(id);
        })
    }

    async fn request_review(&self, collection: &str) -> Result<(), RemoteError> {
        self.with_collection("request_review", collection, |c| {
            c.status.review_status = ReviewStatus::PendingReview;
        })
    }

    async fn request_sign(&self, collection: &str) -> Result<(), RemoteError> {
        self.with_collection("request_sign", collection, Collection::publish)
    }

    async fn rollback(&self, collection: &str) -> Result<(), RemoteError> {
        self.with_collection("rollback", collection, |c| {
            c.workspace = c.main.clone();
            c.status.review_status = ReviewStatus::Signed;
        })
    }

    async fn list_main_records(&self, collection: &str) -> Result<Vec<String>, RemoteError> {
        self.with_collection("list_main_records", collection, |c| {
            c.main.keys().cloned().collect()
        })
    }

    async fn list_workspace_records(&self, collection: &str) -> Result<Vec<String>, RemoteError> {
        self.with_collection("list_workspace_records", collection, |c| {
            c.workspace.keys().cloned().collect()
        })
    }
}
