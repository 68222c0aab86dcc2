//! Remote configuration store abstraction.
//!
//! The remote store keeps two buckets per collection: a *workspace* that
//! publishers write into, and a *main* bucket that clients read. Moving
//! workspace content into main goes through a review (or a direct sign
//! when review is disabled for the application).
//!
//! - [`KintoStore`] talks to a Kinto-style HTTP service.
//! - [`MemoryStore`] is an in-process stand-in with review hooks.

pub mod kinto;
pub mod memory;

pub use kinto::{KintoAuth, KintoStore};
pub use memory::MemoryStore;

use async_trait::async_trait;
use hatch_core::WireRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

// ──────────────────────────────────────────────
// Review status
// ──────────────────────────────────────────────

/// Review state of a collection's workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    /// Nothing was ever signed or requested.
    None,
    /// A review or sign request is outstanding.
    PendingReview,
    /// The last review was declined; the workspace still holds the change.
    Rejected,
    /// Workspace and main agree.
    Signed,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReviewStatus::None => "NONE",
            ReviewStatus::PendingReview => "PENDING_REVIEW",
            ReviewStatus::Rejected => "REJECTED",
            ReviewStatus::Signed => "SIGNED",
        })
    }
}

/// Workspace state plus the details of the last review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub review_status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
}

impl WorkspaceStatus {
    pub fn new(review_status: ReviewStatus) -> Self {
        Self {
            review_status,
            reviewer_comment: None,
            reviewed_by: None,
        }
    }
}

// ──────────────────────────────────────────────
// RemoteError
// ──────────────────────────────────────────────

/// Errors talking to the remote store. All of them are transient from the
/// broker's point of view: the tick is abandoned and retried later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request to collection '{collection}' failed: {message}")]
    Request { collection: String, message: String },

    #[error("collection '{collection}' answered HTTP {status}")]
    Status { collection: String, status: u16 },

    #[error("unexpected response from collection '{collection}': {message}")]
    Decode { collection: String, message: String },

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store config error: {0}")]
    Config(String),
}

// ──────────────────────────────────────────────
// RemoteConfigStore
// ──────────────────────────────────────────────

/// Operations the publisher needs from the remote store.
///
/// Record operations act on the collection's workspace. Only review
/// approval (outside this system) or [`request_sign`](Self::request_sign)
/// moves workspace content into main.
#[async_trait]
pub trait RemoteConfigStore: Send + Sync + 'static {
    async fn workspace_status(&self, collection: &str) -> Result<WorkspaceStatus, RemoteError>;

    /// Create or replace a record in the workspace.
    async fn put_record(&self, collection: &str, record: &WireRecord) -> Result<(), RemoteError>;

    /// Delete a record from the workspace. Deleting an absent record is not
    /// an error.
    async fn delete_record(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

    /// Ask a human reviewer to approve the workspace.
    async fn request_review(&self, collection: &str) -> Result<(), RemoteError>;

    /// Sign the workspace directly, copying it into main.
    async fn request_sign(&self, collection: &str) -> Result<(), RemoteError>;

    /// Reset the workspace to the content of main.
    async fn rollback(&self, collection: &str) -> Result<(), RemoteError>;

    async fn list_main_records(&self, collection: &str) -> Result<Vec<String>, RemoteError>;

    async fn list_workspace_records(&self, collection: &str) -> Result<Vec<String>, RemoteError>;
}
