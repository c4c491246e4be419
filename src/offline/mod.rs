//! Durable offline mutation queue
//!
//! Mutations made while disconnected are captured here as persisted
//! intents and replayed through a caller-supplied executor once
//! connectivity is confirmed. The queue is loaded from storage at
//! process start and every committed change is mirrored back, so a
//! restart picks up where the device left off.
//!
//! Persistence is best-effort: if the mirror write fails the in-memory
//! operation stands and the failure is logged, trading durability for
//! liveness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::network::NetworkMonitor;
use crate::storage::StorageBackend;

/// Fixed storage key for the persisted mutation list
pub const OFFLINE_QUEUE_KEY: &str = "shopsync_offline_queue";

/// Error types for offline queue operations
#[derive(Error, Debug)]
pub enum OfflineError {
    /// The queue is full and holds nothing evictable
    #[error("offline queue saturated ({0} mutations pending)")]
    Saturated(usize),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Domain a mutation belongs to; `Other` is the evictable class
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Order,
    Product,
    Profile,
    Other,
}

/// One durable intent to mutate remote state
///
/// The payload is opaque to the queue; the caller's executor dispatches
/// on `kind`/`operation`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MutationKind,
    pub operation: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub retries: u32,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
}

impl QueuedMutation {
    pub fn new(kind: MutationKind, operation: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            operation: operation.into(),
            data,
            timestamp: Utc::now(),
            retries: 0,
            max_retries: 3,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Replays one queued mutation against the remote backend
///
/// Supplied by the calling feature; the queue knows nothing of payload
/// shapes beyond the [`QueuedMutation`] envelope.
#[async_trait::async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn execute(&self, mutation: &QueuedMutation) -> anyhow::Result<()>;
}

/// Outcome of one drain pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Replayed and removed
    pub succeeded: usize,
    /// Failed but kept for the next pass
    pub kept: usize,
    /// Failed terminally and dropped
    pub dropped: usize,
}

/// Configuration for an [`OfflineQueue`]
#[derive(Clone, Debug)]
pub struct OfflineQueueConfig {
    /// Maximum persisted mutations before eviction kicks in
    pub max_queue_size: usize,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self { max_queue_size: 100 }
    }
}

type Subscriber = Box<dyn Fn(&[QueuedMutation]) + Send + Sync>;

/// The persisted, ordered list of pending mutations
pub struct OfflineQueue {
    storage: Arc<dyn StorageBackend>,
    network: Arc<dyn NetworkMonitor>,
    config: OfflineQueueConfig,
    queue: tokio::sync::Mutex<Vec<QueuedMutation>>,
    draining: AtomicBool,
    subscribers: StdMutex<HashMap<Uuid, Subscriber>>,
}

impl OfflineQueue {
    /// Rehydrate the queue from storage
    ///
    /// A missing or unreadable blob starts the queue empty; corruption is
    /// logged, not fatal.
    pub async fn load(
        storage: Arc<dyn StorageBackend>,
        network: Arc<dyn NetworkMonitor>,
        config: OfflineQueueConfig,
    ) -> Self {
        let queue = match storage.get(OFFLINE_QUEUE_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str::<Vec<QueuedMutation>>(&blob) {
                Ok(mutations) => {
                    log::info!("offline queue rehydrated: {} pending", mutations.len());
                    mutations
                }
                Err(e) => {
                    log::warn!("offline queue blob unreadable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("offline queue load failed, starting empty: {}", e);
                Vec::new()
            }
        };

        Self {
            storage,
            network,
            config,
            queue: tokio::sync::Mutex::new(queue),
            draining: AtomicBool::new(false),
            subscribers: StdMutex::new(HashMap::new()),
        }
    }

    /// Append a mutation and mirror the list to storage
    ///
    /// Exactly one live copy of an id exists at a time: re-enqueueing an
    /// id replaces the earlier entry. When the list is full, the oldest
    /// `Other` mutation is evicted to make room; with nothing evictable
    /// the enqueue fails with [`OfflineError::Saturated`].
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<(), OfflineError> {
        {
            let mut queue = self.queue.lock().await;

            if let Some(existing) = queue.iter().position(|m| m.id == mutation.id) {
                queue.remove(existing);
            }

            if queue.len() >= self.config.max_queue_size {
                match oldest_evictable(&queue) {
                    Some(index) => {
                        let evicted = queue.remove(index);
                        log::warn!(
                            "offline queue full, evicting {} mutation {}",
                            evicted.operation,
                            evicted.id
                        );
                    }
                    None => return Err(OfflineError::Saturated(queue.len())),
                }
            }

            queue.push(mutation);
            self.persist(&queue).await;
            self.notify_subscribers(&queue);
        }
        Ok(())
    }

    /// Replay pending mutations oldest-first through the executor
    ///
    /// A no-op while another drain runs, while offline, or when empty.
    /// Failures do not abort the pass: this is a best-effort batch. A
    /// mutation out of retries is dropped and logged.
    pub async fn process_queue(&self, executor: &dyn MutationExecutor) -> DrainReport {
        if !self.network.is_online() {
            return DrainReport::default();
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return DrainReport::default();
        }

        let report = self.drain_once(executor).await;
        self.draining.store(false, Ordering::SeqCst);

        if report.succeeded + report.dropped > 0 {
            let queue = self.queue.lock().await;
            self.notify_subscribers(&queue);
        }
        report
    }

    async fn drain_once(&self, executor: &dyn MutationExecutor) -> DrainReport {
        let snapshot: Vec<QueuedMutation> = {
            let mut queue = self.queue.lock().await;
            queue.sort_by_key(|m| m.timestamp);
            queue.clone()
        };
        if snapshot.is_empty() {
            return DrainReport::default();
        }

        log::info!("draining offline queue: {} mutations", snapshot.len());
        let mut report = DrainReport::default();

        for mutation in snapshot {
            match executor.execute(&mutation).await {
                Ok(()) => {
                    let mut queue = self.queue.lock().await;
                    queue.retain(|m| m.id != mutation.id);
                    self.persist(&queue).await;
                    report.succeeded += 1;
                }
                Err(e) => {
                    let mut queue = self.queue.lock().await;
                    if let Some(entry) = queue.iter_mut().find(|m| m.id == mutation.id) {
                        entry.retries += 1;
                        if entry.retries >= entry.max_retries {
                            log::warn!(
                                "dropping mutation {} ({}) after {} failed replays: {}",
                                mutation.id,
                                mutation.operation,
                                entry.retries,
                                e
                            );
                            queue.retain(|m| m.id != mutation.id);
                            report.dropped += 1;
                        } else {
                            log::debug!(
                                "mutation {} replay failed (attempt {}): {}",
                                mutation.id,
                                entry.retries,
                                e
                            );
                            report.kept += 1;
                        }
                        self.persist(&queue).await;
                    }
                }
            }
        }
        report
    }

    /// Remove one mutation by id
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|m| m.id != id);
        let removed = queue.len() != before;
        if removed {
            self.persist(&queue).await;
            self.notify_subscribers(&queue);
        }
        removed
    }

    /// Drop every pending mutation
    pub async fn clear(&self) {
        let mut queue = self.queue.lock().await;
        queue.clear();
        self.persist(&queue).await;
        self.notify_subscribers(&queue);
    }

    /// Snapshot of the pending mutations, oldest first
    pub async fn get_queue(&self) -> Vec<QueuedMutation> {
        let mut snapshot = self.queue.lock().await.clone();
        snapshot.sort_by_key(|m| m.timestamp);
        snapshot
    }

    /// Number of pending mutations
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether no mutations are pending
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Register a callback invoked with the pending list on every change
    pub fn subscribe(&self, callback: impl Fn(&[QueuedMutation]) + Send + Sync + 'static) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, Box::new(callback));
        }
        id
    }

    /// Remove a previously registered callback
    pub fn unsubscribe(&self, id: Uuid) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&id);
        }
    }

    /// Mirror the list to storage; failures are logged, not surfaced
    async fn persist(&self, queue: &[QueuedMutation]) {
        let blob = match serde_json::to_string(queue) {
            Ok(blob) => blob,
            Err(e) => {
                log::warn!("offline queue serialization failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.set(OFFLINE_QUEUE_KEY, &blob).await {
            log::warn!("offline queue persist failed: {}", e);
        }
    }

    fn notify_subscribers(&self, queue: &[QueuedMutation]) {
        if let Ok(subs) = self.subscribers.lock() {
            for callback in subs.values() {
                callback(queue);
            }
        }
    }
}

fn oldest_evictable(queue: &[QueuedMutation]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .filter(|(_, m)| m.kind == MutationKind::Other)
        .min_by_key(|(_, m)| m.timestamp)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SharedNetwork;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct RecordingExecutor {
        executed: StdMutex<Vec<Uuid>>,
        fail_ids: Vec<Uuid>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            Self {
                executed: StdMutex::new(Vec::new()),
                fail_ids: Vec::new(),
            }
        }

        fn failing_on(fail_ids: Vec<Uuid>) -> Self {
            Self {
                executed: StdMutex::new(Vec::new()),
                fail_ids,
            }
        }
    }

    #[async_trait::async_trait]
    impl MutationExecutor for RecordingExecutor {
        async fn execute(&self, mutation: &QueuedMutation) -> anyhow::Result<()> {
            self.executed.lock().unwrap().push(mutation.id);
            if self.fail_ids.contains(&mutation.id) {
                anyhow::bail!("replay rejected");
            }
            Ok(())
        }
    }

    async fn queue_with(
        storage: MemoryStorage,
        online: bool,
        max_queue_size: usize,
    ) -> OfflineQueue {
        OfflineQueue::load(
            Arc::new(storage),
            Arc::new(SharedNetwork::new(online)),
            OfflineQueueConfig { max_queue_size },
        )
        .await
    }

    fn mutation(kind: MutationKind, operation: &str) -> QueuedMutation {
        QueuedMutation::new(kind, operation, json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_round_trip_survives_restart() {
        let storage = MemoryStorage::new();
        let m = mutation(MutationKind::Order, "create_order");

        {
            let queue = queue_with(storage.clone(), false, 100).await;
            queue.enqueue(m.clone()).await.unwrap();
        }

        // Fresh queue over the same storage simulates a process restart.
        let revived = queue_with(storage, false, 100).await;
        let pending = revived.get_queue().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m.id);
        assert_eq!(pending[0].operation, "create_order");
        assert_eq!(pending[0].data, m.data);
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_one_live_copy() {
        let queue = queue_with(MemoryStorage::new(), false, 100).await;
        let first = mutation(MutationKind::Product, "update_product");
        let second = QueuedMutation::new(
            MutationKind::Product,
            "update_product",
            json!({"n": 2}),
        )
        .with_id(first.id);

        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        let pending = queue.get_queue().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest_other_first() {
        let queue = queue_with(MemoryStorage::new(), false, 2).await;
        let other_old = mutation(MutationKind::Other, "log_view");
        let other_new = mutation(MutationKind::Other, "log_click");
        queue.enqueue(other_old.clone()).await.unwrap();
        queue.enqueue(other_new.clone()).await.unwrap();

        let order = mutation(MutationKind::Order, "create_order");
        queue.enqueue(order.clone()).await.unwrap();

        let ids: Vec<Uuid> = queue.get_queue().await.iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&other_old.id));
        assert!(ids.contains(&other_new.id));
        assert!(ids.contains(&order.id));
    }

    #[tokio::test]
    async fn test_saturated_without_evictable_items() {
        let queue = queue_with(MemoryStorage::new(), false, 1).await;
        queue
            .enqueue(mutation(MutationKind::Order, "create_order"))
            .await
            .unwrap();

        let err = queue
            .enqueue(mutation(MutationKind::Profile, "update_profile"))
            .await
            .unwrap_err();
        assert!(matches!(err, OfflineError::Saturated(1)));
    }

    #[tokio::test]
    async fn test_drain_is_noop_while_offline() {
        let queue = queue_with(MemoryStorage::new(), false, 100).await;
        queue
            .enqueue(mutation(MutationKind::Order, "create_order"))
            .await
            .unwrap();

        let executor = RecordingExecutor::new();
        let report = queue.process_queue(&executor).await;
        assert_eq!(report, DrainReport::default());
        assert!(executor.executed.lock().unwrap().is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_replays_oldest_first_and_removes() {
        let queue = queue_with(MemoryStorage::new(), true, 100).await;
        let mut first = mutation(MutationKind::Product, "update_product");
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        let second = mutation(MutationKind::Order, "create_order");
        // Enqueued out of timestamp order on purpose.
        queue.enqueue(second.clone()).await.unwrap();
        queue.enqueue(first.clone()).await.unwrap();

        let executor = RecordingExecutor::new();
        let report = queue.process_queue(&executor).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(*executor.executed.lock().unwrap(), vec![first.id, second.id]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_keeps_failed_items_under_retry_ceiling() {
        let queue = queue_with(MemoryStorage::new(), true, 100).await;
        let flaky = mutation(MutationKind::Product, "update_product");
        let good = mutation(MutationKind::Order, "create_order");
        queue.enqueue(flaky.clone()).await.unwrap();
        queue.enqueue(good.clone()).await.unwrap();

        let executor = RecordingExecutor::failing_on(vec![flaky.id]);
        let report = queue.process_queue(&executor).await;

        // The failure must not abort the pass: the later item replays.
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.kept, 1);
        let pending = queue.get_queue().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, flaky.id);
        assert_eq!(pending[0].retries, 1);
    }

    #[tokio::test]
    async fn test_drain_drops_after_max_retries() {
        let queue = queue_with(MemoryStorage::new(), true, 100).await;
        let doomed = mutation(MutationKind::Other, "sync_prefs").with_max_retries(2);
        queue.enqueue(doomed.clone()).await.unwrap();

        let executor = RecordingExecutor::failing_on(vec![doomed.id]);
        assert_eq!(queue.process_queue(&executor).await.kept, 1);
        assert_eq!(queue.process_queue(&executor).await.dropped, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let queue = queue_with(MemoryStorage::new(), false, 100).await;
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_sub = seen.clone();
        let sub_id = queue.subscribe(move |pending| {
            seen_sub.store(pending.len(), Ordering::SeqCst);
        });

        queue
            .enqueue(mutation(MutationKind::Order, "create_order"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        queue.clear().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        queue.unsubscribe(sub_id);
    }

    #[tokio::test]
    async fn test_remove_by_id_persists() {
        let storage = MemoryStorage::new();
        let queue = queue_with(storage.clone(), false, 100).await;
        let m = mutation(MutationKind::Profile, "update_profile");
        queue.enqueue(m.clone()).await.unwrap();

        assert!(queue.remove(m.id).await);
        assert!(!queue.remove(m.id).await);

        let revived = queue_with(storage, false, 100).await;
        assert!(revived.is_empty().await);
    }

    #[test]
    fn test_persisted_envelope_shape() {
        let m = QueuedMutation::new(
            MutationKind::Order,
            "create_order",
            json!({"total": 40}),
        );
        let value = serde_json::to_value(&m).unwrap();
        assert_eq!(value["type"], json!("order"));
        for field in ["id", "operation", "data", "timestamp", "retries", "maxRetries"] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }
}
