//! Apply Queue
//!
//! Orchestrator writes happen after the registry commit, off the request
//! path. Each orchestrator gets its own lane: a bounded FIFO drained by a
//! dedicated worker, so commands for the same object are applied in the
//! order they were accepted and an unreachable orchestrator only stalls its
//! own lane. Submission never waits; a full lane is reported as unavailable.
//! Transient failures are retried with exponential backoff; exhausted
//! commands are logged and counted.

use crate::controlplane::metrics::ApiMetrics;
use crate::domain::ports::{BackupStorageProjection, ClusterOrchestratorRef, ObjectRef};
use crate::error::{Error, ErrorAction, Result};
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Apply queue configuration
#[derive(Debug, Clone)]
pub struct ApplyQueueConfig {
    /// Commands buffered per orchestrator before submissions are refused
    pub capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up on a command after this long
    pub max_elapsed: Duration,
}

impl Default for ApplyQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

/// A write to carry out against an orchestrator
pub enum ApplyCommand {
    Apply {
        orchestrator: ClusterOrchestratorRef,
        object: ObjectRef,
        manifest: Value,
    },
    Remove {
        orchestrator: ClusterOrchestratorRef,
        object: ObjectRef,
    },
    ApplyBackupStorage {
        orchestrator: ClusterOrchestratorRef,
        namespace: String,
        storage: BackupStorageProjection,
    },
    /// Resolves once every earlier command of the lane has been handled
    Barrier(oneshot::Sender<()>),
}

impl ApplyCommand {
    fn describe(&self) -> String {
        match self {
            ApplyCommand::Apply { object, .. } => format!("apply {}", object),
            ApplyCommand::Remove { object, .. } => format!("remove {}", object),
            ApplyCommand::ApplyBackupStorage {
                namespace, storage, ..
            } => format!("apply BackupStorage/{}/{}", namespace, storage.name),
            ApplyCommand::Barrier(_) => "barrier".to_string(),
        }
    }

    fn orchestrator(&self) -> Option<&ClusterOrchestratorRef> {
        match self {
            ApplyCommand::Apply { orchestrator, .. }
            | ApplyCommand::Remove { orchestrator, .. }
            | ApplyCommand::ApplyBackupStorage { orchestrator, .. } => Some(orchestrator),
            ApplyCommand::Barrier(_) => None,
        }
    }

    async fn run_once(&self) -> Result<()> {
        match self {
            ApplyCommand::Apply {
                orchestrator,
                object,
                manifest,
            } => orchestrator.apply(object, manifest.clone()).await,
            ApplyCommand::Remove {
                orchestrator,
                object,
            } => orchestrator.remove(object).await,
            ApplyCommand::ApplyBackupStorage {
                orchestrator,
                namespace,
                storage,
            } => orchestrator.apply_backup_storage(namespace, storage).await,
            ApplyCommand::Barrier(_) => Ok(()),
        }
    }
}

/// Lanes are keyed by orchestrator identity
fn lane_key(orchestrator: &ClusterOrchestratorRef) -> usize {
    Arc::as_ptr(orchestrator) as *const () as usize
}

struct Lanes {
    config: ApplyQueueConfig,
    metrics: Arc<ApiMetrics>,
    shutdown: CancellationToken,
    senders: DashMap<usize, mpsc::Sender<ApplyCommand>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle for submitting commands to the per-orchestrator workers
#[derive(Clone)]
pub struct ApplyQueue {
    lanes: Arc<Lanes>,
}

impl ApplyQueue {
    /// Start the queue, returning the submit handle and a task that
    /// completes once every lane worker has stopped after shutdown
    pub fn start(
        config: ApplyQueueConfig,
        metrics: Arc<ApiMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let lanes = Arc::new(Lanes {
            config,
            metrics,
            shutdown: shutdown.clone(),
            senders: DashMap::new(),
            workers: Mutex::new(Vec::new()),
        });
        let supervised = lanes.clone();
        let handle = tokio::spawn(async move {
            shutdown.cancelled().await;
            let workers: Vec<_> = supervised.workers.lock().drain(..).collect();
            for worker in workers {
                let _ = worker.await;
            }
            info!("Apply queue stopped");
        });
        (Self { lanes }, handle)
    }

    /// Sender of the orchestrator's lane, starting its worker on first use
    fn lane(&self, orchestrator: &ClusterOrchestratorRef) -> mpsc::Sender<ApplyCommand> {
        let lanes = &self.lanes;
        lanes
            .senders
            .entry(lane_key(orchestrator))
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(lanes.config.capacity.max(1));
                let worker = Worker {
                    config: lanes.config.clone(),
                    metrics: lanes.metrics.clone(),
                    lane: orchestrator.orchestrator_name().to_string(),
                };
                let handle = tokio::spawn(worker.run(receiver, lanes.shutdown.clone()));
                lanes.workers.lock().push(handle);
                sender
            })
            .clone()
    }

    pub fn submit(&self, command: ApplyCommand) -> Result<()> {
        if self.lanes.shutdown.is_cancelled() {
            return Err(Error::Internal("apply queue is closed".to_string()));
        }
        let Some(orchestrator) = command.orchestrator() else {
            return Err(Error::Internal(
                "barriers are only submitted by flush".to_string(),
            ));
        };
        let sender = self.lane(orchestrator);
        self.lanes.metrics.apply_queue_depth.inc();
        sender.try_send(command).map_err(|e| {
            self.lanes.metrics.apply_queue_depth.dec();
            match e {
                TrySendError::Full(command) => Error::OrchestratorUnavailable(format!(
                    "apply queue is full, could not {}",
                    command.describe()
                )),
                TrySendError::Closed(_) => Error::Internal("apply queue is closed".to_string()),
            }
        })
    }

    pub fn apply(
        &self,
        orchestrator: ClusterOrchestratorRef,
        object: ObjectRef,
        manifest: Value,
    ) -> Result<()> {
        self.submit(ApplyCommand::Apply {
            orchestrator,
            object,
            manifest,
        })
    }

    pub fn remove(&self, orchestrator: ClusterOrchestratorRef, object: ObjectRef) -> Result<()> {
        self.submit(ApplyCommand::Remove {
            orchestrator,
            object,
        })
    }

    pub fn apply_backup_storage(
        &self,
        orchestrator: ClusterOrchestratorRef,
        namespace: String,
        storage: BackupStorageProjection,
    ) -> Result<()> {
        self.submit(ApplyCommand::ApplyBackupStorage {
            orchestrator,
            namespace,
            storage,
        })
    }

    /// Wait until every command submitted so far has been handled
    pub async fn flush(&self) -> Result<()> {
        let senders: Vec<_> = self
            .lanes
            .senders
            .iter()
            .map(|lane| lane.value().clone())
            .collect();
        for sender in senders {
            let (tx, rx) = oneshot::channel();
            self.lanes.metrics.apply_queue_depth.inc();
            if sender.send(ApplyCommand::Barrier(tx)).await.is_err() {
                self.lanes.metrics.apply_queue_depth.dec();
                return Err(Error::Internal("apply queue is closed".to_string()));
            }
            rx.await
                .map_err(|_| Error::Internal("apply queue stopped before flush".to_string()))?;
        }
        Ok(())
    }
}

struct Worker {
    config: ApplyQueueConfig,
    metrics: Arc<ApiMetrics>,
    /// Orchestrator the lane writes to
    lane: String,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<ApplyCommand>, shutdown: CancellationToken) {
        info!("Apply lane for {} started", self.lane);
        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = receiver.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.metrics.apply_queue_depth.dec();
            self.handle(command, &shutdown).await;
        }
        info!("Apply lane for {} stopped", self.lane);
    }

    async fn handle(&self, command: ApplyCommand, shutdown: &CancellationToken) {
        if let ApplyCommand::Barrier(done) = command {
            let _ = done.send(());
            return;
        }

        let description = command.describe();
        let policy = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: Some(self.config.max_elapsed),
            ..Default::default()
        };

        let command = &command;
        let metrics = &self.metrics;
        let attempt = || async move {
            command.run_once().await.map_err(|e| {
                let retry = match e.action() {
                    ErrorAction::RetryWithBackoff => backoff::Error::transient(e),
                    ErrorAction::RetryAfter(delay) => backoff::Error::retry_after(e, delay),
                    ErrorAction::Drop => backoff::Error::permanent(e),
                };
                if !matches!(retry, backoff::Error::Permanent(_)) {
                    metrics.apply_retries.inc();
                }
                retry
            })
        };

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                warn!("Shutdown interrupted {}", description);
                return;
            }
            outcome = backoff::future::retry_notify(policy, attempt, |e: Error, wait: Duration| {
                debug!("Retrying {} in {:?}: {}", description, wait, e);
            }) => outcome,
        };

        match outcome {
            Ok(()) => debug!("Completed {}", description),
            Err(e) => {
                self.metrics.apply_failures.inc();
                error!("Giving up on {}: {}", description, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::orchestrator::InMemoryOrchestrator;
    use crate::domain::ports::{ClusterOrchestrator, ObjectKind};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn config() -> ApplyQueueConfig {
        ApplyQueueConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_elapsed: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn start() -> (ApplyQueue, Arc<InMemoryOrchestrator>, Arc<ApiMetrics>) {
        let metrics = Arc::new(ApiMetrics::new().unwrap());
        let (queue, _) = ApplyQueue::start(config(), metrics.clone(), CancellationToken::new());
        (queue, Arc::new(InMemoryOrchestrator::new()), metrics)
    }

    #[tokio::test]
    async fn test_commands_apply_in_order() {
        let (queue, orchestrator, metrics) = start();
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");

        queue
            .apply(orchestrator.clone(), object.clone(), json!({ "spec": { "v": 1 } }))
            .unwrap();
        queue
            .apply(orchestrator.clone(), object.clone(), json!({ "spec": { "v": 2 } }))
            .unwrap();
        queue.flush().await.unwrap();

        let applied = orchestrator.applied(&object).await.unwrap();
        assert_eq!(applied["spec"]["v"], 2);

        queue.remove(orchestrator.clone(), object.clone()).unwrap();
        queue.flush().await.unwrap();
        assert!(orchestrator.applied(&object).await.is_none());
        assert_eq!(metrics.apply_queue_depth.get(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (queue, orchestrator, metrics) = start();
        let object = ObjectRef::new(ObjectKind::DatabaseClusterBackup, "team-a", "b1");
        orchestrator.fail_next(2);

        queue
            .apply(orchestrator.clone(), object.clone(), json!({}))
            .unwrap();
        queue.flush().await.unwrap();

        assert!(orchestrator.applied(&object).await.is_some());
        assert_eq!(metrics.apply_retries.get(), 2);
        assert_eq!(metrics.apply_failures.get(), 0);
    }

    #[tokio::test]
    async fn test_failing_orchestrator_does_not_stall_others() {
        let metrics = Arc::new(ApiMetrics::new().unwrap());
        let config = ApplyQueueConfig {
            max_elapsed: Duration::from_secs(60),
            ..config()
        };
        let (queue, _) = ApplyQueue::start(config, metrics, CancellationToken::new());
        let failing = Arc::new(InMemoryOrchestrator::new());
        let healthy = Arc::new(InMemoryOrchestrator::new());
        failing.fail_next(1000);

        let stuck = ObjectRef::new(ObjectKind::DatabaseCluster, "dbaas", "legacy");
        queue.apply(failing.clone(), stuck.clone(), json!({})).unwrap();
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        queue.apply(healthy.clone(), object.clone(), json!({})).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while healthy.applied(&object).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(failing.applied(&stuck).await.is_none());
    }

    #[tokio::test]
    async fn test_full_lane_is_refused() {
        let metrics = Arc::new(ApiMetrics::new().unwrap());
        let config = ApplyQueueConfig {
            capacity: 1,
            max_elapsed: Duration::from_secs(60),
            ..config()
        };
        let (queue, _) = ApplyQueue::start(config, metrics.clone(), CancellationToken::new());
        let orchestrator = Arc::new(InMemoryOrchestrator::new());
        orchestrator.fail_next(1000);

        let object = |name: &str| ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", name);
        // the worker picks up the first command and keeps retrying it
        queue.apply(orchestrator.clone(), object("a"), json!({})).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.apply_queue_depth.get() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        queue.apply(orchestrator.clone(), object("b"), json!({})).unwrap();

        let err = queue
            .apply(orchestrator.clone(), object("c"), json!({}))
            .unwrap_err();
        assert_matches!(err, Error::OrchestratorUnavailable(_));
        assert_eq!(metrics.apply_queue_depth.get(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let metrics = Arc::new(ApiMetrics::new().unwrap());
        let shutdown = CancellationToken::new();
        let (queue, supervisor) =
            ApplyQueue::start(ApplyQueueConfig::default(), metrics, shutdown.clone());
        let orchestrator: ClusterOrchestratorRef = Arc::new(InMemoryOrchestrator::new());
        let object = ObjectRef::new(ObjectKind::DatabaseCluster, "team-a", "orders");
        queue.apply(orchestrator.clone(), object.clone(), json!({})).unwrap();
        queue.flush().await.unwrap();

        shutdown.cancel();
        supervisor.await.unwrap();

        assert!(queue.apply(orchestrator.clone(), object, json!({})).is_err());
        assert!(orchestrator.health_check().await.unwrap());
    }
}
