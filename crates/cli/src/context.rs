//! Process-wide services, built once from the configuration.

use std::sync::Arc;

use hatch_engine::remote::{KintoStore, MemoryStore};
use hatch_engine::{
    LivenessReconciler, MutationService, PublishQueueBroker, RemoteConfigStore, Scheduler,
};
use hatch_storage::{MemoryStorage, StorageError};

use crate::config::{ConfigError, HatchConfig};

pub(crate) type Remote = dyn RemoteConfigStore;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not open storage: {0}")]
    Storage(#[from] StorageError),
}

pub(crate) struct Context {
    pub(crate) config: HatchConfig,
    pub(crate) storage: Arc<MemoryStorage>,
    pub(crate) mutations: MutationService<MemoryStorage>,
    pub(crate) broker: Arc<PublishQueueBroker<MemoryStorage, Remote>>,
    pub(crate) liveness: Arc<LivenessReconciler<MemoryStorage, Remote>>,
}

impl Context {
    pub(crate) fn new(config: HatchConfig) -> Result<Self, ContextError> {
        let storage = Arc::new(MemoryStorage::open(config.storage_path())?);
        let remote: Arc<Remote> = match &config.remote.url {
            Some(url) => {
                tracing::info!(url = %url, "publishing to remote settings server");
                Arc::new(KintoStore::with_timeout(
                    url,
                    config.remote_auth()?,
                    config.remote_timeout(),
                ))
            }
            None => {
                tracing::info!("no remote url configured, publishing to the in-process store");
                Arc::new(MemoryStore::new())
            }
        };
        let applications = config.applications();

        Ok(Self {
            mutations: MutationService::new(storage.clone()),
            broker: Arc::new(PublishQueueBroker::new(
                storage.clone(),
                remote.clone(),
                applications.clone(),
            )),
            liveness: Arc::new(LivenessReconciler::new(storage.clone(), remote, applications)),
            storage,
            config,
        })
    }

    pub(crate) fn scheduler(&self) -> Scheduler<MemoryStorage, Remote> {
        Scheduler::new(
            self.broker.clone(),
            self.liveness.clone(),
            self.config.scheduler(),
        )
    }
}
