//! Application-root mutation pipeline
//!
//! Owns the dispatcher, the offline queue, and the connectivity monitor
//! as explicitly constructed, dependency-injected instances; features
//! receive the pipeline rather than reaching for process-wide globals,
//! which keeps single-instance semantics without hidden state and makes
//! every collaborator substitutable in tests.
//!
//! Routing: a submission while offline is captured durably; a submission
//! while online runs through the bounded dispatcher, and falls back to
//! offline capture if the device lost connectivity along the way. The
//! offline queue drains after an online enqueue, on the offline→online
//! transition, and once at startup.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::{EnqueueOptions, Priority, QueueConfig, QueueError, QueueStatus, RequestQueue};
use crate::network::NetworkMonitor;
use crate::offline::{
    DrainReport, MutationExecutor, MutationKind, OfflineError, OfflineQueue, OfflineQueueConfig,
    QueuedMutation,
};
use crate::storage::StorageBackend;

/// Error types for pipeline submissions
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("offline capture failed: {0}")]
    Offline(#[from] OfflineError),

    #[error(transparent)]
    Dispatch(#[from] QueueError),
}

/// What happened to a submitted mutation
#[derive(Debug)]
pub enum Submission {
    /// Executed against the backend
    Completed,
    /// Captured for replay; the id locates it in the offline queue
    Queued(Uuid),
}

/// Configuration for the whole pipeline
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub dispatch: QueueConfig,
    pub offline: OfflineQueueConfig,
}

/// The offline-resilient mutation pipeline
pub struct MutationPipeline {
    dispatcher: RequestQueue<()>,
    offline: Arc<OfflineQueue>,
    network: Arc<dyn NetworkMonitor>,
    executor: Arc<dyn MutationExecutor>,
}

impl MutationPipeline {
    /// Build the pipeline, rehydrate the offline queue, and start the
    /// reconnect listener; drains immediately if work survived a restart
    /// and the device is online.
    pub async fn new(
        storage: Arc<dyn StorageBackend>,
        network: Arc<dyn NetworkMonitor>,
        executor: Arc<dyn MutationExecutor>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let offline = Arc::new(
            OfflineQueue::load(storage, network.clone(), config.offline).await,
        );

        let pipeline = Arc::new(Self {
            dispatcher: RequestQueue::new(config.dispatch),
            offline,
            network,
            executor,
        });

        Self::spawn_reconnect_listener(&pipeline);

        if pipeline.network.is_online() && !pipeline.offline.is_empty().await {
            let startup = pipeline.clone();
            tokio::spawn(async move {
                let report = startup.drain_offline().await;
                log::info!(
                    "startup drain: {} replayed, {} kept, {} dropped",
                    report.succeeded,
                    report.kept,
                    report.dropped
                );
            });
        }

        pipeline
    }

    /// Submit one mutation with the given urgency
    ///
    /// Offline submissions are captured, not failed. An online submission
    /// that exhausts its retries while the device has gone offline is
    /// captured as well; every other terminal error propagates.
    pub async fn submit(
        &self,
        mutation: QueuedMutation,
        priority: Priority,
    ) -> Result<Submission, PipelineError> {
        if !self.network.is_online() {
            return self.capture(mutation).await;
        }

        let executor = self.executor.clone();
        let task_mutation = mutation.clone();
        let handle = self.dispatcher.enqueue(
            move || {
                let executor = executor.clone();
                let mutation = task_mutation.clone();
                async move { executor.execute(&mutation).await }
            },
            EnqueueOptions::default()
                .priority(priority)
                .max_retries(mutation.max_retries)
                .id(mutation.id),
        )?;

        match handle.join().await {
            Ok(()) => Ok(Submission::Completed),
            Err(QueueError::RetriesExhausted { .. }) if !self.network.is_online() => {
                log::info!(
                    "mutation {} failed while connectivity dropped, capturing offline",
                    mutation.id
                );
                self.capture(mutation).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Build and submit an order-creation mutation
    ///
    /// Stamps a client-generated idempotency key into the payload so the
    /// backend's atomic reserve-and-create entry point can dedupe
    /// replays. Orders ride at high priority: checkout must not starve
    /// behind background refreshes.
    pub async fn place_order(
        &self,
        mut data: serde_json::Value,
    ) -> Result<Submission, PipelineError> {
        if let Some(object) = data.as_object_mut() {
            object
                .entry("idempotency_key".to_string())
                .or_insert_with(|| serde_json::Value::String(Uuid::new_v4().to_string()));
        }
        let mutation = QueuedMutation::new(MutationKind::Order, "create_order", data);
        self.submit(mutation, Priority::High).await
    }

    /// Replay everything currently pending through the executor
    pub async fn drain_offline(&self) -> DrainReport {
        self.offline.process_queue(self.executor.as_ref()).await
    }

    /// The durable queue, for pending-count indicators and subscriptions
    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.offline
    }

    /// Dispatcher occupancy, for load shedding decisions
    pub fn dispatcher_status(&self) -> QueueStatus {
        self.dispatcher.status()
    }

    async fn capture(&self, mutation: QueuedMutation) -> Result<Submission, PipelineError> {
        let id = mutation.id;
        self.offline.enqueue(mutation).await?;

        // Connectivity can return between the offline check and the
        // capture; drain right away rather than waiting for an edge.
        if self.network.is_online() {
            self.drain_offline().await;
        }
        Ok(Submission::Queued(id))
    }

    fn spawn_reconnect_listener(pipeline: &Arc<Self>) {
        let mut rx = pipeline.network.watch();
        let mut was_online = pipeline.network.is_online();
        let pipeline = Arc::downgrade(pipeline);

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if online && !was_online {
                    let Some(pipeline) = pipeline.upgrade() else { break };
                    let report = pipeline.drain_offline().await;
                    if report.succeeded + report.kept + report.dropped > 0 {
                        log::info!(
                            "reconnect drain: {} replayed, {} kept, {} dropped",
                            report.succeeded,
                            report.kept,
                            report.dropped
                        );
                    }
                }
                was_online = online;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SharedNetwork;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct FakeBackend {
        executed: StdMutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executed: StdMutex::new(Vec::new()),
            })
        }

        fn operations(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl MutationExecutor for FakeBackend {
        async fn execute(&self, mutation: &QueuedMutation) -> anyhow::Result<()> {
            self.executed.lock().unwrap().push(mutation.operation.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_online_submission_completes() {
        let backend = FakeBackend::new();
        let network = Arc::new(SharedNetwork::new(true));
        let pipeline = MutationPipeline::new(
            Arc::new(MemoryStorage::new()),
            network,
            backend.clone(),
            PipelineConfig::default(),
        )
        .await;

        let mutation = QueuedMutation::new(
            MutationKind::Product,
            "update_product",
            json!({"id": "p1"}),
        );
        let outcome = pipeline.submit(mutation, Priority::Medium).await.unwrap();

        assert!(matches!(outcome, Submission::Completed));
        assert_eq!(backend.operations(), vec!["update_product"]);
    }

    #[tokio::test]
    async fn test_offline_submission_is_captured() {
        let backend = FakeBackend::new();
        let network = Arc::new(SharedNetwork::new(false));
        let pipeline = MutationPipeline::new(
            Arc::new(MemoryStorage::new()),
            network,
            backend.clone(),
            PipelineConfig::default(),
        )
        .await;

        let mutation =
            QueuedMutation::new(MutationKind::Order, "create_order", json!({"total": 10}));
        let id = mutation.id;
        let outcome = pipeline.submit(mutation, Priority::High).await.unwrap();

        assert!(matches!(outcome, Submission::Queued(q) if q == id));
        assert!(backend.operations().is_empty());
        assert_eq!(pipeline.offline_queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_place_order_stamps_idempotency_key() {
        let backend = FakeBackend::new();
        let network = Arc::new(SharedNetwork::new(false));
        let pipeline = MutationPipeline::new(
            Arc::new(MemoryStorage::new()),
            network,
            backend,
            PipelineConfig::default(),
        )
        .await;

        pipeline.place_order(json!({"total": 40})).await.unwrap();

        let pending = pipeline.offline_queue().get_queue().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Order);
        let key = pending[0].data["idempotency_key"].as_str().unwrap();
        assert!(Uuid::parse_str(key).is_ok());
    }
}
