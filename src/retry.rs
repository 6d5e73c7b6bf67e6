//! # Retry Executor
//!
//! Runs a single asynchronous operation with bounded retries, exponential
//! backoff, optional jitter, and deduplication of concurrent callers that
//! share an operation key.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::types::OperationKind;

/// Predicate deciding whether a failed attempt is worth repeating.
pub type RetryPredicate = Arc<dyn Fn(&SyncError) -> bool + Send + Sync>;

/// Callback invoked before each retry sleep.
pub type OnRetry = Arc<dyn Fn(u32, &SyncError) + Send + Sync>;

/// Backoff and retry configuration for one class of operation.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any computed delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.0]
    pub jitter: bool,
    /// Which errors are worth retrying
    pub predicate: RetryPredicate,
    /// Observer for retry scheduling
    pub on_retry: Option<OnRetry>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            predicate: Arc::new(|e: &SyncError| e.is_transient()),
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), before jitter:
    /// `min(base_delay * backoff_multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// Marking an exercise done: standard policy.
    pub fn exercise_completion() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Day progression: slightly more patient.
    pub fn day_progression() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Bulk progress persistence: failure here means data loss, so retry
    /// hardest and on the broadest error class.
    pub fn bulk_persistence() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            predicate: Arc::new(|e: &SyncError| {
                !matches!(e, SyncError::Rejected { .. } | SyncError::InvalidInput(_))
            }),
            ..Self::default()
        }
    }

    /// Milestone progression: duplicating an advancement is destructive,
    /// so retry least and only on server-side failures.
    pub fn milestone_progression() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_secs(2),
            predicate: Arc::new(|e: &SyncError| e.is_server_error()),
            ..Self::default()
        }
    }

    /// Preset governing delivery attempts for an operation kind.
    pub fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::ExerciseCompletion => Self::exercise_completion(),
            OperationKind::DayProgression => Self::day_progression(),
            OperationKind::MilestoneAdvancement => Self::milestone_progression(),
            OperationKind::ProgressUpdate => Self::bulk_persistence(),
        }
    }
}

/// Final report of a retried execution.
///
/// Never surfaced as `Err`; callers branch on `success`.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Attempts actually made, including the first
    pub attempts: u32,
    pub total_time: Duration,
}

impl RetryOutcome {
    fn succeeded(data: Value, attempts: u32, started: Instant) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            attempts,
            total_time: started.elapsed(),
        }
    }

    fn failed(error: &SyncError, attempts: u32, started: Instant) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            attempts,
            total_time: started.elapsed(),
        }
    }
}

type OutcomeRx = watch::Receiver<Option<RetryOutcome>>;

/// Executes operations with backoff and keyed deduplication.
///
/// Callers that share an operation key while one execution is in flight
/// all receive that execution's outcome; the operation body runs once.
#[derive(Clone)]
pub struct RetryExecutor {
    in_flight: Arc<Mutex<HashMap<String, OutcomeRx>>>,
    cancelled: Arc<Mutex<HashSet<String>>>,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run `operation` under `policy`, retrying failed attempts the
    /// predicate approves of until the budget runs out.
    ///
    /// With a key, a concurrent caller holding the same key joins the
    /// in-flight execution instead of starting a duplicate.
    pub async fn run<F, Fut>(
        &self,
        operation: F,
        policy: &RetryPolicy,
        key: Option<&str>,
    ) -> RetryOutcome
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Value>> + Send,
    {
        let tx = if let Some(key) = key {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rx) = in_flight.get(key) {
                let mut rx = rx.clone();
                drop(in_flight);
                debug!(target: "retry", key, "Joining in-flight execution");
                loop {
                    if let Some(outcome) = rx.borrow_and_update().clone() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        // Executor side dropped without publishing.
                        return RetryOutcome {
                            success: false,
                            data: None,
                            error: Some("in-flight execution dropped".to_string()),
                            attempts: 0,
                            total_time: Duration::ZERO,
                        };
                    }
                }
            }
            let (tx, rx) = watch::channel(None);
            in_flight.insert(key.to_string(), rx);
            Some(tx)
        } else {
            None
        };

        let outcome = self.execute(operation, policy, key).await;

        if let Some(key) = key {
            self.in_flight.lock().await.remove(key);
            self.cancelled.lock().await.remove(key);
        }
        if let Some(tx) = tx {
            let _ = tx.send(Some(outcome.clone()));
        }
        outcome
    }

    async fn execute<F, Fut>(
        &self,
        mut operation: F,
        policy: &RetryPolicy,
        key: Option<&str>,
    ) -> RetryOutcome
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Value>> + Send,
    {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match operation().await {
                Ok(data) => {
                    debug!(target: "retry", attempts, "Operation succeeded");
                    return RetryOutcome::succeeded(data, attempts, started);
                }
                Err(e) => {
                    if !(policy.predicate)(&e) {
                        debug!(target: "retry", attempts, error = %e, "Error not retryable");
                        return RetryOutcome::failed(&e, attempts, started);
                    }
                    if attempts > policy.max_retries {
                        warn!(target: "retry", attempts, error = %e, "Retry budget exhausted");
                        return RetryOutcome::failed(&e, attempts, started);
                    }
                    if let Some(key) = key {
                        if self.take_cancelled(key).await {
                            debug!(target: "retry", key, "Cancelled, not rescheduling");
                            return RetryOutcome::failed(&e, attempts, started);
                        }
                    }
                    let delay = policy.jittered(policy.delay_for_attempt(attempts));
                    if let Some(on_retry) = &policy.on_retry {
                        on_retry(attempts, &e);
                    }
                    debug!(
                        target: "retry",
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Scheduling retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Prevent further scheduled retries for `key` and drop its dedup
    /// bookkeeping. An attempt already in flight is not interrupted; its
    /// failure is reported instead of rescheduled.
    pub async fn cancel(&self, key: &str) -> bool {
        let removed = self.in_flight.lock().await.remove(key).is_some();
        if removed {
            self.cancelled.lock().await.insert(key.to_string());
            debug!(target: "retry", key, "Execution cancelled");
        }
        removed
    }

    /// Cancel every keyed execution currently in flight.
    pub async fn cancel_all(&self) {
        let mut in_flight = self.in_flight.lock().await;
        let mut cancelled = self.cancelled.lock().await;
        for key in in_flight.keys() {
            cancelled.insert(key.clone());
        }
        in_flight.clear();
    }

    /// Number of keyed executions currently in flight.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn take_cancelled(&self, key: &str) -> bool {
        self.cancelled.lock().await.remove(key)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}
