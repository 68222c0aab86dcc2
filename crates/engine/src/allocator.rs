//! Transactional bucket allocation.
//!
//! [`BucketAllocator::allocate`] reads the latest instance of an isolation
//! group and its ranges for update, plans the next range with
//! [`hatch_core::plan_allocation`], and writes the plan in the same
//! snapshot. Two allocators racing on one group conflict at commit; the
//! loser retries against fresh state, so callers only see a conflict once
//! the retry budget is spent.

use std::sync::Arc;

use hatch_core::{plan_allocation, BucketError, BucketRange, IsolationGroup, RandomizationUnit};
use hatch_storage::{HatchStorage, StorageError};

/// Attempts before a conflicting allocation gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid allocation request: {0}")]
    Invalid(#[from] BucketError),

    #[error("allocation for {experiment} still conflicting after {attempts} attempts")]
    RetriesExhausted { experiment: String, attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct BucketAllocator<S> {
    storage: Arc<S>,
    total_capacity: u32,
    max_attempts: u32,
}

impl<S: HatchStorage> BucketAllocator<S> {
    /// Allocator creating new group instances with `total_capacity` buckets.
    pub fn new(storage: Arc<S>, total_capacity: u32) -> Self {
        Self {
            storage,
            total_capacity,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Give `experiment` a range of `count` buckets in the latest instance
    /// of `group_name`, paging to a new instance when it does not fit.
    ///
    /// Returns the existing range unchanged if the experiment already owns
    /// one.
    pub async fn allocate(
        &self,
        experiment: &str,
        group_name: &str,
        randomization_unit: RandomizationUnit,
        count: u32,
    ) -> Result<(IsolationGroup, BucketRange), AllocationError> {
        for attempt in 1..=self.max_attempts {
            match self
                .try_allocate(experiment, group_name, randomization_unit, count)
                .await
            {
                Err(AllocationError::Storage(e)) if e.is_conflict() => {
                    tracing::debug!(
                        experiment,
                        group = group_name,
                        attempt,
                        error = %e,
                        "allocation conflicted, retrying"
                    );
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
        Err(AllocationError::RetriesExhausted {
            experiment: experiment.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn try_allocate(
        &self,
        experiment: &str,
        group_name: &str,
        randomization_unit: RandomizationUnit,
        count: u32,
    ) -> Result<(IsolationGroup, BucketRange), AllocationError> {
        let storage = &*self.storage;
        let mut snapshot = storage.begin_snapshot().await?;
        match self
            .allocate_in(&mut snapshot, experiment, group_name, randomization_unit, count)
            .await
        {
            Ok(Allocated::Existing(range)) => {
                storage.abort_snapshot(snapshot).await?;
                let group = storage
                    .get_isolation_group(&range.group_name, range.group_instance)
                    .await?
                    .ok_or_else(|| StorageError::GroupNotFound {
                        name: range.group_name.clone(),
                        instance: range.group_instance,
                    })?;
                Ok((group, range))
            }
            Ok(Allocated::New(group, range)) => {
                storage.commit_snapshot(snapshot).await?;
                tracing::info!(
                    experiment,
                    namespace = %group.namespace(),
                    start = range.start,
                    count = range.count,
                    "allocated buckets"
                );
                Ok((group, range))
            }
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                Err(e)
            }
        }
    }

    async fn allocate_in(
        &self,
        snapshot: &mut S::Snapshot,
        experiment: &str,
        group_name: &str,
        randomization_unit: RandomizationUnit,
        count: u32,
    ) -> Result<Allocated, AllocationError> {
        let storage = &*self.storage;
        if let Some(range) = storage
            .get_bucket_range_for_update(snapshot, experiment)
            .await?
        {
            return Ok(Allocated::Existing(range));
        }

        let latest = storage
            .latest_isolation_group_for_update(snapshot, group_name)
            .await?;
        let usage = latest
            .as_ref()
            .map(|(group, ranges)| (group, hatch_core::bucket::used_buckets(ranges)));
        let plan = plan_allocation(
            group_name,
            randomization_unit,
            self.total_capacity,
            usage,
            count,
        )?;

        let create_group = plan.create_group;
        let (group, range) = plan.into_range(experiment);
        if create_group {
            storage
                .insert_isolation_group(snapshot, group.clone())
                .await?;
        }
        storage.insert_bucket_range(snapshot, range.clone()).await?;
        Ok(Allocated::New(group, range))
    }
}

enum Allocated {
    Existing(BucketRange),
    New(IsolationGroup, BucketRange),
}
