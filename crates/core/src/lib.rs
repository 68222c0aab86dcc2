//! hatch-core: experiment domain model for the Hatch publisher.
//!
//! Pure, I/O-free building blocks shared by storage and the engine:
//!
//! - [`types`] -- experiment records, isolation groups, bucket ranges, enums
//! - [`lifecycle`] -- the status / publish-status state machine
//! - [`bucket`] -- allocation planning over a fixed hash space
//! - [`changelog`] -- append-only history entries and replay checks
//! - [`wire`] -- the record shape published to the remote store

pub mod bucket;
pub mod changelog;
pub mod lifecycle;
pub mod types;
pub mod wire;

pub use bucket::{plan_allocation, requested_count, AllocationPlan, BucketError};
pub use changelog::{ChangeLogEntry, ReplayError, SYSTEM_ACTOR};
pub use lifecycle::{validate, ValidationError};
pub use types::{
    Application, BucketRange, ExperimentPayload, ExperimentRecord, IsolationGroup, Lifecycle,
    ParseEnumError, PublishStatus, RandomizationUnit, Status,
};
pub use wire::{is_reserved_field, BucketConfig, WireRecord, RESERVED_FIELDS};
