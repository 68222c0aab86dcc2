/// All errors that can be returned by a HatchStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict on an experiment: the record
    /// was modified since it was read. The expected version was not found.
    #[error("version conflict on experiment {slug}: expected version {expected_version}")]
    VersionConflict { slug: String, expected_version: i64 },

    /// A snapshot read or wrote a resource that another snapshot committed
    /// first. The whole snapshot is rejected and may be retried.
    #[error("serialization failure on {resource}: committed concurrently by another snapshot")]
    SerializationFailure { resource: String },

    /// No experiment with the given slug.
    #[error("experiment not found: {slug}")]
    ExperimentNotFound { slug: String },

    /// The resource (experiment, group instance, or an experiment's range)
    /// already exists.
    #[error("already exists: {resource}")]
    AlreadyExists { resource: String },

    /// A bucket range referenced a group instance that does not exist.
    #[error("isolation group not found: {name}-{instance}")]
    GroupNotFound { name: String, instance: u32 },

    /// A bucket range would overlap a range of the same group instance.
    #[error("range [{start}, +{count}) overlaps an existing range of {name}-{instance}")]
    RangeOverlap {
        name: String,
        instance: u32,
        start: u32,
        count: u32,
    },

    /// A backend-specific storage error (I/O, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Conflicts are transient: retrying against fresh state may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::VersionConflict { .. } | StorageError::SerializationFailure { .. }
        )
    }
}
