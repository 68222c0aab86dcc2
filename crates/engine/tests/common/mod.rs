//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hatch_core::{Application, ExperimentPayload, ExperimentRecord, Status};
use hatch_engine::remote::MemoryStore;
use hatch_engine::{
    ApplicationConfig, CreateExperiment, LivenessReconciler, MutationService, PublishQueueBroker,
    TransitionRequest,
};
use hatch_storage::{HatchStorage, MemoryStorage};
use tracing_subscriber::EnvFilter;

pub const APP: Application = Application::Fenix;
pub const COLLECTION: &str = "fenix";

/// Route engine logs through the test harness so they show up on failure.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hatch_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub struct World {
    pub storage: Arc<MemoryStorage>,
    pub remote: Arc<MemoryStore>,
    pub broker: PublishQueueBroker<MemoryStorage, MemoryStore>,
    pub liveness: LivenessReconciler<MemoryStorage, MemoryStore>,
    pub mutations: MutationService<MemoryStorage>,
}

impl World {
    pub fn new() -> Self {
        init_test_logging();
        let storage = Arc::new(MemoryStorage::new());
        let remote = Arc::new(MemoryStore::new());
        let apps = [ApplicationConfig::new(APP).with_collection(COLLECTION)];
        Self {
            broker: PublishQueueBroker::new(storage.clone(), remote.clone(), apps.clone()),
            liveness: LivenessReconciler::new(storage.clone(), remote.clone(), apps),
            mutations: MutationService::new(storage.clone()),
            storage,
            remote,
        }
    }

    pub async fn create(&self, slug: &str, fraction: f64) -> ExperimentRecord {
        self.create_with(slug, fraction, None).await
    }

    pub async fn create_in_group(&self, slug: &str, fraction: f64, group: &str) -> ExperimentRecord {
        self.create_with(slug, fraction, Some(group.to_string())).await
    }

    async fn create_with(
        &self,
        slug: &str,
        fraction: f64,
        isolation_group: Option<String>,
    ) -> ExperimentRecord {
        self.mutations
            .create(
                CreateExperiment {
                    slug: slug.into(),
                    application: APP,
                    population_fraction: fraction,
                    isolation_group,
                    payload: ExperimentPayload::default(),
                },
                "alice",
            )
            .await
            .unwrap()
    }

    pub async fn request(&self, slug: &str, target: Status) -> ExperimentRecord {
        self.mutations
            .request_transition(slug, &TransitionRequest::request_review(target), "alice", None)
            .await
            .unwrap()
    }

    pub async fn record(&self, slug: &str) -> ExperimentRecord {
        self.storage.get_experiment(slug).await.unwrap()
    }

    /// Run the publish and liveness ticks once each.
    pub async fn tick(&self) {
        self.broker.reconcile(APP).await.unwrap();
        self.liveness.reconcile_liveness(APP).await.unwrap();
    }

    /// Create, queue, push, approve and observe a launch.
    pub async fn launch(&self, slug: &str, fraction: f64) {
        self.create(slug, fraction).await;
        self.request(slug, Status::Live).await;
        self.broker.reconcile(APP).await.unwrap();
        self.remote.approve(COLLECTION, "bob");
        self.liveness.reconcile_liveness(APP).await.unwrap();
        assert_eq!(self.record(slug).await.status, Status::Live);
    }
}
