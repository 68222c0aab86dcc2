//! Application state shared across request handlers.

use std::sync::Arc;

use hatch_engine::{LivenessReconciler, MutationService, PublishQueueBroker};
use hatch_storage::MemoryStorage;

use crate::context::{Context, Remote};

pub(crate) struct AppState {
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) mutations: MutationService<MemoryStorage>,
    pub(crate) broker: Arc<PublishQueueBroker<MemoryStorage, Remote>>,
    pub(crate) liveness: Arc<LivenessReconciler<MemoryStorage, Remote>>,
}

impl AppState {
    pub(crate) fn new(ctx: Context) -> Self {
        Self {
            storage: ctx.storage,
            mutations: ctx.mutations,
            broker: ctx.broker,
            liveness: ctx.liveness,
        }
    }
}
