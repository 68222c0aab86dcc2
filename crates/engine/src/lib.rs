//! hatch-engine: the moving parts of experiment publication.
//!
//! - [`allocator`] -- transactional bucket allocation with conflict retry
//! - [`changelog`] -- writing history entries alongside record changes
//! - [`mutation`] -- creating records and applying requested transitions
//! - [`remote`] -- the remote configuration store seam and its clients
//! - [`broker`] -- the single-flight publish queue
//! - [`liveness`] -- mirroring remote publication back into local status
//! - [`scheduler`] -- periodic ticks per application

pub mod allocator;
pub mod broker;
pub mod changelog;
pub mod config;
pub mod liveness;
pub mod mutation;
pub mod remote;
pub mod scheduler;

pub use allocator::{AllocationError, BucketAllocator};
pub use broker::{BrokerError, PublishQueueBroker, PushOutcome, ReconcileReport};
pub use config::ApplicationConfig;
pub use liveness::{LivenessReconciler, LivenessReport};
pub use mutation::{CreateExperiment, MutationError, MutationService, TransitionRequest};
pub use remote::{RemoteConfigStore, RemoteError, ReviewStatus, WorkspaceStatus};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
