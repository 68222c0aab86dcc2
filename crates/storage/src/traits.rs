use async_trait::async_trait;
use hatch_core::{
    Application, BucketRange, ChangeLogEntry, ExperimentRecord, IsolationGroup, PublishStatus,
};

use crate::error::StorageError;

/// The storage trait for Hatch backends.
///
/// A `HatchStorage` implementation provides durable, transactional storage
/// for experiment records, their change history, isolation groups, and
/// bucket ranges.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()` -- start a transaction, returns a `Snapshot`
/// 2. Call snapshot methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` -- commit and consume the transaction
///    OR `abort_snapshot(snapshot)` -- roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the transaction MUST be
/// rolled back.
///
/// ## Serializability
///
/// Every resource a snapshot reads or writes through a snapshot method is
/// locked for update: an experiment by slug, an isolation group by name.
/// When two snapshots touch the same resource, the first to commit wins and
/// the other fails with `StorageError::SerializationFailure`. The bucket
/// allocator relies on this to compute a group's used capacity and insert
/// the next range without overlap.
///
/// ## OCC Conflict Detection
///
/// `update_experiment` performs an optimistic concurrency check against the
/// record's `version`. On mismatch it returns
/// `Err(StorageError::VersionConflict { .. })`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared by the
/// scheduler tasks and the admin API.
#[async_trait]
pub trait HatchStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Experiments (within snapshot) ─────────────────────────────────────────

    /// Insert a new experiment. Its `version` is reset to 0.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the slug is taken.
    async fn insert_experiment(
        &self,
        snapshot: &mut Self::Snapshot,
        record: ExperimentRecord,
    ) -> Result<(), StorageError>;

    /// Read an experiment, locking it for update.
    ///
    /// Returns `Err(StorageError::ExperimentNotFound)` if it does not exist.
    async fn get_experiment_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        slug: &str,
    ) -> Result<ExperimentRecord, StorageError>;

    /// Write an experiment read earlier in the snapshot (OCC).
    ///
    /// The write is conditional on the stored version equalling
    /// `record.version`. Returns the new version on success.
    async fn update_experiment(
        &self,
        snapshot: &mut Self::Snapshot,
        record: &ExperimentRecord,
    ) -> Result<i64, StorageError>;

    // ── Change history (within snapshot) ──────────────────────────────────────

    /// Latest history entry of an experiment, if any.
    async fn latest_changelog_entry(
        &self,
        snapshot: &mut Self::Snapshot,
        slug: &str,
    ) -> Result<Option<ChangeLogEntry>, StorageError>;

    /// Append a history entry. The entry's `id` is assigned by the backend
    /// and is strictly increasing in commit order.
    ///
    /// CRITICAL: must be called in the SAME snapshot as the experiment write
    /// it describes. No lifecycle change without its history entry.
    async fn append_changelog(
        &self,
        snapshot: &mut Self::Snapshot,
        entry: ChangeLogEntry,
    ) -> Result<(), StorageError>;

    // ── Buckets (within snapshot) ─────────────────────────────────────────────

    /// The bucket range owned by an experiment, if allocated.
    async fn get_bucket_range_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        experiment: &str,
    ) -> Result<Option<BucketRange>, StorageError>;

    /// The highest-numbered instance of an isolation group together with its
    /// ranges, locking the group name for update.
    async fn latest_isolation_group_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        name: &str,
    ) -> Result<Option<(IsolationGroup, Vec<BucketRange>)>, StorageError>;

    /// Create an isolation group instance.
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if `(name, instance)` exists.
    async fn insert_isolation_group(
        &self,
        snapshot: &mut Self::Snapshot,
        group: IsolationGroup,
    ) -> Result<(), StorageError>;

    /// Insert a bucket range.
    ///
    /// Fails with `GroupNotFound` if its group instance does not exist,
    /// `AlreadyExists` if the experiment already owns a range, and
    /// `RangeOverlap` if it overlaps a range of the same group instance.
    async fn insert_bucket_range(
        &self,
        snapshot: &mut Self::Snapshot,
        range: BucketRange,
    ) -> Result<(), StorageError>;

    // ── Queries (outside snapshot, committed data only) ──────────────────────

    /// Read an experiment without locking.
    async fn get_experiment(&self, slug: &str) -> Result<ExperimentRecord, StorageError>;

    /// List experiments, optionally filtered by application and publish status.
    async fn list_experiments(
        &self,
        application: Option<Application>,
        publish_status: Option<PublishStatus>,
    ) -> Result<Vec<ExperimentRecord>, StorageError>;

    /// An experiment's history in append order.
    async fn list_changelog(&self, slug: &str) -> Result<Vec<ChangeLogEntry>, StorageError>;

    /// The bucket range owned by an experiment, if allocated.
    async fn get_bucket_range(&self, experiment: &str)
        -> Result<Option<BucketRange>, StorageError>;

    /// One isolation group instance.
    async fn get_isolation_group(
        &self,
        name: &str,
        instance: u32,
    ) -> Result<Option<IsolationGroup>, StorageError>;

    /// All ranges of one group instance, ordered by start.
    async fn list_bucket_ranges(
        &self,
        name: &str,
        instance: u32,
    ) -> Result<Vec<BucketRange>, StorageError>;
}
