//! Periodic driver for the broker and the liveness reconciler.
//!
//! Each configured application gets two independent interval loops. A tick
//! that fails is logged and the loop carries on; the next interval retries
//! the same work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hatch_core::Application;
use hatch_storage::HatchStorage;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::broker::{PublishQueueBroker, ReconcileReport};
use crate::liveness::{LivenessReconciler, LivenessReport};
use crate::remote::RemoteConfigStore;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_JITTER: Duration = Duration::from_secs(5);
/// Shortest period a loop will tick at; shorter intervals are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub publish_interval: Duration,
    pub liveness_interval: Duration,
    /// Upper bound of the random delay added before each loop's first tick.
    pub jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// Result of one publish and one liveness pass over an application.
///
/// A failed step is reported as its error message so that one broken
/// application does not hide the others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub application: Application,
    pub publish: Result<ReconcileReport, String>,
    pub liveness: Result<LivenessReport, String>,
}

impl TickReport {
    pub fn is_ok(&self) -> bool {
        self.publish.is_ok() && self.liveness.is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Publish,
    Liveness,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Publish => "publish",
            Job::Liveness => "liveness",
        }
    }
}

pub struct Scheduler<S, R: ?Sized> {
    broker: Arc<PublishQueueBroker<S, R>>,
    liveness: Arc<LivenessReconciler<S, R>>,
    config: SchedulerConfig,
}

impl<S, R> Scheduler<S, R>
where
    S: HatchStorage,
    R: RemoteConfigStore + ?Sized,
{
    pub fn new(
        broker: Arc<PublishQueueBroker<S, R>>,
        liveness: Arc<LivenessReconciler<S, R>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            broker,
            liveness,
            config,
        }
    }

    fn applications(&self) -> Vec<Application> {
        self.broker.applications().map(|c| c.application).collect()
    }

    /// Run every application once: publish tick first, then liveness.
    pub async fn run_once(&self) -> Vec<TickReport> {
        let mut reports = Vec::new();
        for application in self.applications() {
            let publish = self
                .broker
                .reconcile(application)
                .await
                .map_err(|e| e.to_string());
            let liveness = self
                .liveness
                .reconcile_liveness(application)
                .await
                .map_err(|e| e.to_string());
            reports.push(TickReport {
                application,
                publish,
                liveness,
            });
        }
        reports
    }

    /// Run the interval loops until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut handles = Vec::new();
        for application in self.applications() {
            handles.push(self.spawn(application, Job::Publish, self.config.publish_interval));
            handles.push(self.spawn(application, Job::Liveness, self.config.liveness_interval));
        }
        tracing::info!(
            loops = handles.len(),
            publish_interval = ?self.config.publish_interval,
            liveness_interval = ?self.config.liveness_interval,
            "scheduler started"
        );

        shutdown.await;
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("scheduler stopped");
    }

    fn spawn(&self, application: Application, job: Job, period: Duration) -> JoinHandle<()> {
        if period < MIN_INTERVAL {
            tracing::warn!(
                application = %application,
                job = job.name(),
                period = ?period,
                "interval below minimum, using {:?}",
                MIN_INTERVAL
            );
        }
        let period = period.max(MIN_INTERVAL);
        let delay = jitter(self.config.jitter);
        let broker = self.broker.clone();
        let liveness = self.liveness.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let result = match job {
                    Job::Publish => broker.reconcile(application).await.map(|_| ()),
                    Job::Liveness => liveness.reconcile_liveness(application).await.map(|_| ()),
                };
                if let Err(e) = result {
                    tracing::warn!(
                        application = %application,
                        job = job.name(),
                        error = %e,
                        "tick failed, retrying next interval"
                    );
                }
            }
        })
    }
}

fn jitter(max: Duration) -> Duration {
    let millis = max.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
