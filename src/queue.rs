//! # Offline Mutation Queue
//!
//! Durable, priority-ordered buffering for mutations that could not be
//! confirmed delivered, plus autonomous draining when connectivity
//! allows.
//!
//! ```text
//! caller ──enqueue──► [ pending ops, priority order ] ──drain──► delivery fns
//!                        │                   ▲
//!                     persist       connectivity / timer
//! ```
//!
//! Every queue mutation is written to durable storage before control
//! returns, so buffered mutations survive process restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::storage::KeyValueStore;
use crate::types::OperationKind;

/// Storage keys for durable state
const QUEUE_KEY: &str = "sync.pending_ops";
const LAST_DRAIN_KEY: &str = "sync.last_drain_at";
const ERROR_LOG_KEY: &str = "sync.error_log";

/// Default priority for enqueued mutations
pub const DEFAULT_PRIORITY: i32 = 5;

/// A single buffered mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Stable for the operation's lifetime
    pub id: String,
    pub kind: OperationKind,
    /// Opaque to the queue; interpreted by the delivery function
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Higher values drain first
    pub priority: i32,
}

impl PendingOperation {
    /// Create a new pending operation with a fresh id.
    pub fn new(kind: OperationKind, payload: Value, priority: i32) -> Self {
        let id = format!(
            "{}-{}-{:04x}",
            kind.as_str(),
            Utc::now().timestamp_millis(),
            rand::random::<u16>()
        );
        Self {
            id,
            kind,
            payload,
            created_at: Utc::now(),
            attempt_count: 0,
            last_attempt_at: None,
            priority,
        }
    }

    fn mark_attempt(&mut self) {
        self.attempt_count += 1;
        self.last_attempt_at = Some(Utc::now());
    }
}

/// Terminal failure recorded in the rolling log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFailure {
    pub operation_id: String,
    pub kind: OperationKind,
    pub attempt_count: u32,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Snapshot of the queue's current condition.
///
/// Recomputed on demand and pushed to observers on every state
/// transition. Informational only; never the source of truth for a
/// business decision.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub draining: bool,
    pub pending_items: usize,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<SyncFailure>,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct OfflineQueueConfig {
    /// Delivery attempts before an operation is dropped as terminal
    pub max_attempts: u32,
    /// Opportunistic drain interval while online
    pub drain_interval: Duration,
    /// Rolling error log capacity
    pub error_log_capacity: usize,
    /// Entries older than this are evicted from the error log
    pub error_log_window: Duration,
    /// Override for delivery retry behavior; `None` uses the per-kind
    /// preset
    pub delivery_retry: Option<RetryPolicy>,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            drain_interval: Duration::from_secs(30),
            error_log_capacity: 20,
            error_log_window: Duration::from_secs(24 * 3600),
            delivery_retry: None,
        }
    }
}

/// Per-kind delivery function: the seam to the remote API.
pub type DeliveryFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer callback receiving status snapshots.
pub type StatusListener = Box<dyn Fn(&SyncStatus) + Send + Sync>;

/// Observer subscription handle.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
}

/// Durable offline mutation queue with autonomous draining.
///
/// Construct one per running client at application start and pass it by
/// reference to consumers; cloning produces a cheap handle onto the same
/// queue for spawned tasks.
#[derive(Clone)]
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    storage: Arc<dyn KeyValueStore>,
    connectivity: watch::Receiver<bool>,
    ops: Arc<Mutex<Vec<PendingOperation>>>,
    delivery: Arc<RwLock<HashMap<OperationKind, DeliveryFn>>>,
    executor: RetryExecutor,
    drain_lock: Arc<Mutex<()>>,
    draining: Arc<AtomicBool>,
    last_drain_at: Arc<Mutex<Option<DateTime<Utc>>>>,
    error_log: Arc<Mutex<VecDeque<SyncFailure>>>,
    observers: Arc<Mutex<HashMap<u64, StatusListener>>>,
    next_observer_id: Arc<AtomicU64>,
    shutdown_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl OfflineQueue {
    pub fn new(
        config: OfflineQueueConfig,
        storage: Arc<dyn KeyValueStore>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            storage,
            connectivity,
            ops: Arc::new(Mutex::new(Vec::new())),
            delivery: Arc::new(RwLock::new(HashMap::new())),
            executor: RetryExecutor::new(),
            drain_lock: Arc::new(Mutex::new(())),
            draining: Arc::new(AtomicBool::new(false)),
            last_drain_at: Arc::new(Mutex::new(None)),
            error_log: Arc::new(Mutex::new(VecDeque::new())),
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_observer_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Restore queue contents and drain bookkeeping from storage.
    pub async fn load(&self) -> Result<()> {
        if let Some(raw) = self.storage.get(QUEUE_KEY)? {
            let restored: Vec<PendingOperation> = serde_json::from_str(&raw)?;
            let count = restored.len();
            *self.ops.lock().await = restored;
            info!(target: "offline_queue", count, "Restored pending operations");
        }
        if let Some(raw) = self.storage.get(LAST_DRAIN_KEY)? {
            *self.last_drain_at.lock().await = Some(serde_json::from_str(&raw)?);
        }
        if let Some(raw) = self.storage.get(ERROR_LOG_KEY)? {
            *self.error_log.lock().await = serde_json::from_str(&raw)?;
        }
        Ok(())
    }

    /// Register the delivery function for an operation kind.
    pub async fn register_delivery<F, Fut>(&self, kind: OperationKind, delivery: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let delivery: DeliveryFn =
            Arc::new(move |payload| -> BoxFuture<'static, Result<()>> {
                Box::pin(delivery(payload))
            });
        self.delivery.write().await.insert(kind, delivery);
    }

    /// Current reachability flag.
    pub fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Buffer a mutation for later delivery. Never blocks on the network;
    /// the operation is persisted before control returns. While online, a
    /// drain attempt is scheduled in the background.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        payload: Value,
        priority: i32,
    ) -> Result<String> {
        let op = PendingOperation::new(kind, payload, priority);
        let id = op.id.clone();
        {
            let mut ops = self.ops.lock().await;
            ops.push(op);
            self.persist(&ops)?;
        }
        debug!(
            target: "offline_queue",
            id = %id,
            kind = %kind,
            priority,
            "Operation enqueued"
        );
        self.notify_observers().await;

        if self.is_online() {
            let queue = self.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.drain(false).await {
                    warn!(target: "offline_queue", error = %e, "Background drain failed");
                }
            });
        }
        Ok(id)
    }

    /// Remove a specific pending operation, e.g. after out-of-band
    /// delivery confirmation.
    pub async fn dequeue(&self, operation_id: &str) -> Result<bool> {
        let removed = {
            let mut ops = self.ops.lock().await;
            let before = ops.len();
            ops.retain(|op| op.id != operation_id);
            let removed = ops.len() != before;
            if removed {
                self.persist(&ops)?;
            }
            removed
        };
        if removed {
            debug!(target: "offline_queue", id = operation_id, "Operation dequeued");
            self.notify_observers().await;
        }
        Ok(removed)
    }

    /// All pending operations, highest priority first. Equal priorities
    /// keep insertion order.
    pub async fn list_pending(&self) -> Vec<PendingOperation> {
        let ops = self.ops.lock().await;
        let mut sorted = ops.clone();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));
        sorted
    }

    /// Number of pending operations.
    pub async fn pending_count(&self) -> usize {
        self.ops.lock().await.len()
    }

    /// Empty the queue unconditionally. User-initiated data loss; never
    /// called automatically.
    pub async fn clear_all(&self) -> Result<()> {
        {
            let mut ops = self.ops.lock().await;
            let dropped = ops.len();
            ops.clear();
            self.persist(&ops)?;
            warn!(target: "offline_queue", dropped, "Queue cleared");
        }
        self.notify_observers().await;
        Ok(())
    }

    /// Attempt delivery for every pending operation in priority order.
    ///
    /// A drain already in progress makes this a no-op unless `force` is
    /// set; an offline queue returns immediately. Connectivity loss
    /// mid-pass aborts, leaving the remaining items pending. Returns
    /// `true` only if every item processed in this pass succeeded.
    pub async fn drain(&self, force: bool) -> Result<bool> {
        let _guard = if force {
            self.drain_lock.lock().await
        } else {
            match self.drain_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(target: "offline_queue", "Drain already in progress");
                    return Ok(false);
                }
            }
        };

        if !self.is_online() {
            debug!(target: "offline_queue", "Offline, drain skipped");
            return Ok(false);
        }

        self.draining.store(true, Ordering::SeqCst);
        self.notify_observers().await;

        let result = self.drain_pass().await;

        self.draining.store(false, Ordering::SeqCst);
        self.notify_observers().await;
        result
    }

    async fn drain_pass(&self) -> Result<bool> {
        let pending = self.list_pending().await;
        if !pending.is_empty() {
            info!(target: "offline_queue", pending = pending.len(), "Draining queue");
        }

        let mut all_ok = true;
        for op in pending {
            if !self.is_online() {
                warn!(target: "offline_queue", "Connectivity lost mid-drain, aborting pass");
                all_ok = false;
                break;
            }
            match self.attempt_delivery(&op).await {
                Ok(()) => {
                    {
                        let mut ops = self.ops.lock().await;
                        ops.retain(|o| o.id != op.id);
                        self.persist(&ops)?;
                    }
                    debug!(target: "offline_queue", id = %op.id, "Operation delivered");
                    self.notify_observers().await;
                }
                Err(e) => {
                    all_ok = false;
                    self.record_failure(&op, &e).await?;
                }
            }
        }

        if all_ok {
            let now = Utc::now();
            *self.last_drain_at.lock().await = Some(now);
            self.storage
                .set(LAST_DRAIN_KEY, &serde_json::to_string(&now)?)?;
            info!(target: "offline_queue", "Drain completed");
        }
        Ok(all_ok)
    }

    /// One delivery attempt for one operation, run through the retry
    /// executor under the kind's policy. The operation id doubles as the
    /// dedup key, so a forced overlapping drain cannot double-deliver.
    async fn attempt_delivery(&self, op: &PendingOperation) -> Result<()> {
        let delivery = self.delivery.read().await.get(&op.kind).cloned();
        let Some(delivery) = delivery else {
            return Err(SyncError::NoDeliveryHandler(op.kind.as_str().to_string()));
        };

        let policy = self
            .config
            .delivery_retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::for_kind(op.kind));
        let payload = op.payload.clone();
        let outcome = self
            .executor
            .run(
                move || {
                    let delivery = delivery.clone();
                    let payload = payload.clone();
                    async move { delivery(payload).await.map(|_| Value::Null) }
                },
                &policy,
                Some(&op.id),
            )
            .await;

        if outcome.success {
            Ok(())
        } else {
            Err(SyncError::network(
                outcome
                    .error
                    .unwrap_or_else(|| "delivery failed".to_string()),
            ))
        }
    }

    async fn record_failure(&self, op: &PendingOperation, error: &SyncError) -> Result<()> {
        let terminal = {
            let mut ops = self.ops.lock().await;
            let Some(entry) = ops.iter_mut().find(|o| o.id == op.id) else {
                // Dequeued out-of-band while we were attempting it.
                return Ok(());
            };
            entry.mark_attempt();
            let attempts = entry.attempt_count;
            let terminal = attempts >= self.config.max_attempts;
            if terminal {
                ops.retain(|o| o.id != op.id);
            }
            self.persist(&ops)?;
            terminal.then_some(attempts)
        };

        match terminal {
            Some(attempts) => {
                warn!(
                    target: "offline_queue",
                    id = %op.id,
                    attempts,
                    error = %error,
                    "Operation dropped after max attempts"
                );
                self.push_failure(SyncFailure {
                    operation_id: op.id.clone(),
                    kind: op.kind,
                    attempt_count: attempts,
                    message: error.to_string(),
                    occurred_at: Utc::now(),
                })
                .await?;
            }
            None => {
                debug!(
                    target: "offline_queue",
                    id = %op.id,
                    error = %error,
                    "Delivery failed, kept for a later drain"
                );
            }
        }
        self.notify_observers().await;
        Ok(())
    }

    async fn push_failure(&self, failure: SyncFailure) -> Result<()> {
        let mut log = self.error_log.lock().await;
        log.push_back(failure);

        let window = chrono::Duration::from_std(self.config.error_log_window)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = Utc::now() - window;
        while let Some(front) = log.front() {
            if log.len() > self.config.error_log_capacity || front.occurred_at < cutoff {
                log.pop_front();
            } else {
                break;
            }
        }
        self.storage
            .set(ERROR_LOG_KEY, &serde_json::to_string(&*log)?)?;
        Ok(())
    }

    /// Current status snapshot. Recomputed on demand.
    pub async fn status(&self) -> SyncStatus {
        let pending_items = self.ops.lock().await.len();
        let last_drain_at = *self.last_drain_at.lock().await;
        let recent_failures = self.error_log.lock().await.iter().cloned().collect();
        SyncStatus {
            online: self.is_online(),
            draining: self.draining.load(Ordering::SeqCst),
            pending_items,
            last_drain_at,
            recent_failures,
        }
    }

    /// Register a status observer. The listener immediately receives one
    /// snapshot, so observers never render from an uninitialized state.
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.status().await;
        listener(&snapshot);
        self.observers.lock().await.insert(id, Box::new(listener));
        Subscription { id }
    }

    /// Remove a status observer.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.observers.lock().await.remove(&subscription.id).is_some()
    }

    async fn notify_observers(&self) {
        let snapshot = self.status().await;
        let observers = self.observers.lock().await;
        for listener in observers.values() {
            listener(&snapshot);
        }
    }

    /// Start the connectivity listener and the periodic drain timer.
    ///
    /// Coming back online always triggers a drain; going offline only
    /// updates status. The timer is a safety net against missed
    /// connectivity events.
    pub async fn start(&self) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let queue = self.clone();
        let mut connectivity = self.connectivity.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.drain_interval);
            loop {
                tokio::select! {
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            // Connectivity publisher dropped.
                            break;
                        }
                        let online = *connectivity.borrow_and_update();
                        if online {
                            info!(target: "offline_queue", "Back online, draining");
                            if let Err(e) = queue.drain(false).await {
                                warn!(target: "offline_queue", error = %e, "Reconnect drain failed");
                            }
                        } else {
                            debug!(target: "offline_queue", "Went offline");
                            queue.notify_observers().await;
                        }
                    }
                    _ = ticker.tick() => {
                        if queue.is_online() && queue.pending_count().await > 0 {
                            if let Err(e) = queue.drain(false).await {
                                warn!(target: "offline_queue", error = %e, "Periodic drain failed");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(target: "offline_queue", "Queue loop shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the background loop started by [`start`](Self::start).
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }

    fn persist(&self, ops: &[PendingOperation]) -> Result<()> {
        self.storage.set(QUEUE_KEY, &serde_json::to_string(ops)?)
    }
}
