//! Strategy execution for classified errors under a global concurrency cap.
//!
//! [`RecoveryManager::recover`] looks up the error's strategy and retry
//! policy, then runs the caller's operation or fallback accordingly. At most
//! `max_concurrent_recoveries` recoveries are in flight at once; the size
//! check and the insert into the active map happen under the same lock, and
//! an excess request is rejected immediately with an escalate outcome.
//!
//! Every recovery runs under a child of the manager's root
//! [`CancellationToken`] and is bounded by `global_timeout_ms`.

use crate::classifier::{ClassifiedError, ErrorContext};
use crate::error::{Result, ResilienceError};
use crate::taxonomy::{ErrorKind, RecoveryStrategy, RetryPolicy};
use crate::traits::{Operation, RecoveryListener};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Samples kept for the rolling average recovery time.
pub const RECOVERY_TIME_SAMPLES: usize = 100;

/// Intent the caller must act on after a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoverySignal {
    /// The caller should reset the affected state.
    ResetRequired,
    /// The caller should disable the affected feature.
    DisableRequired,
    /// The failure may be ignored.
    Ignored,
    /// The failure was handed back to the caller.
    Escalated,
    /// The recovery was cancelled before it finished.
    Cancelled,
    /// The recovery exceeded the global timeout.
    TimedOut,
}

/// Result of one recovery attempt.
///
/// `error` is present exactly when `success` is false.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub success: bool,
    /// Strategy that produced this outcome.
    pub strategy: RecoveryStrategy,
    /// Number of times the operation was invoked.
    pub retry_count: u32,
    /// When attempts are exhausted (or throttled), how long to wait before
    /// trying again from outside.
    pub next_retry_delay: Option<Duration>,
    pub fallback_used: bool,
    pub error: Option<ClassifiedError>,
    pub signal: Option<RecoverySignal>,
}

impl RecoveryOutcome {
    /// Successful outcome with no attempts recorded.
    pub fn succeeded(strategy: RecoveryStrategy) -> Self {
        Self {
            success: true,
            strategy,
            retry_count: 0,
            next_retry_delay: None,
            fallback_used: false,
            error: None,
            signal: None,
        }
    }

    /// Failed outcome carrying `error`.
    pub fn failed(strategy: RecoveryStrategy, error: ClassifiedError) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::succeeded(strategy)
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_next_retry_delay(mut self, delay: Duration) -> Self {
        self.next_retry_delay = Some(delay);
        self
    }

    pub fn with_fallback_used(mut self) -> Self {
        self.fallback_used = true;
        self
    }

    pub fn with_signal(mut self, signal: RecoverySignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Collapse into a crate result for callers that only need pass/fail.
    pub fn into_result(self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        Err(match self.signal {
            Some(RecoverySignal::Cancelled) => ResilienceError::Cancelled,
            Some(RecoverySignal::TimedOut) => ResilienceError::Timeout,
            _ => ResilienceError::Unrecoverable(
                self.error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| self.strategy.to_string()),
            ),
        })
    }

    fn status(&self) -> &'static str {
        if self.success { "success" } else { "failure" }
    }
}

/// Tunables for [`RecoveryManager`].
///
/// # Example JSON
///
/// ```json
/// { "max_concurrent_recoveries": 10, "global_timeout_ms": 300000, "enable_metrics": true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryManagerConfig {
    /// Recoveries allowed in flight at once.
    pub max_concurrent_recoveries: usize,
    /// Upper bound for a single recovery, in milliseconds.
    pub global_timeout_ms: u64,
    /// Emit `metrics` crate counters and histograms.
    pub enable_metrics: bool,
}

impl Default for RecoveryManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 10,
            global_timeout_ms: 300_000,
            enable_metrics: true,
        }
    }
}

impl RecoveryManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_recoveries == 0 {
            return Err(ResilienceError::Config(
                "max_concurrent_recoveries must be greater than 0".to_string(),
            ));
        }
        if self.global_timeout_ms == 0 {
            return Err(ResilienceError::Config(
                "global_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }
}

/// Identifier of an in-flight recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecoveryId(u64);

impl fmt::Display for RecoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recovery-{}", self.0)
    }
}

/// Identifier returned by [`RecoveryManager::add_recovery_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecoveryListenerId(u64);

/// Snapshot of an in-flight recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRecovery {
    pub id: RecoveryId,
    pub kind: ErrorKind,
    pub channel_id: Option<String>,
    pub strategy: RecoveryStrategy,
    /// Operation invocations so far.
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Aggregate counters over all recoveries since the last reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean over the last [`RECOVERY_TIME_SAMPLES`] recoveries.
    pub average_recovery_time: Duration,
    pub active: usize,
}

/// Dedupe key: the same failure instance is never recovered twice at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RecoveryKey {
    kind: ErrorKind,
    channel: String,
    timestamp_ms: i64,
}

impl RecoveryKey {
    fn for_error(error: &ClassifiedError) -> Self {
        Self {
            kind: error.kind(),
            channel: error.channel_id().unwrap_or("global").to_string(),
            timestamp_ms: error.timestamp().timestamp_millis(),
        }
    }
}

struct ActiveEntry {
    id: RecoveryId,
    kind: ErrorKind,
    channel_id: Option<String>,
    strategy: RecoveryStrategy,
    attempts: Arc<AtomicU32>,
    started: Instant,
    token: CancellationToken,
}

#[derive(Default)]
struct StatsInner {
    attempts: u64,
    successes: u64,
    failures: u64,
    samples: VecDeque<Duration>,
}

/// Removes the active entry when the recovery finishes, however it finishes.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashMap<RecoveryKey, ActiveEntry>>,
    key: RecoveryKey,
    id: RecoveryId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(&self.key).is_some_and(|e| e.id == self.id) {
            active.remove(&self.key);
        }
    }
}

struct Admitted<'a> {
    guard: ActiveGuard<'a>,
    token: CancellationToken,
    attempts: Arc<AtomicU32>,
}

/// Executes recovery strategies.
///
/// Shared process-wide behind an `Arc`; all methods take `&self`.
pub struct RecoveryManager {
    config: RecoveryManagerConfig,
    policies: RwLock<HashMap<ErrorKind, RetryPolicy>>,
    active: Mutex<HashMap<RecoveryKey, ActiveEntry>>,
    next_id: AtomicU64,
    stats: Mutex<StatsInner>,
    listeners: RwLock<Vec<(RecoveryListenerId, Arc<dyn RecoveryListener>)>>,
    root: CancellationToken,
}

impl RecoveryManager {
    pub fn new(config: RecoveryManagerConfig) -> Self {
        Self {
            config,
            policies: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(StatsInner::default()),
            listeners: RwLock::new(Vec::new()),
            root: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RecoveryManagerConfig {
        &self.config
    }

    /// Override the retry policy for `kind`.
    pub fn set_retry_policy(&self, kind: ErrorKind, policy: RetryPolicy) -> Result<()> {
        policy.validate()?;
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, policy);
        Ok(())
    }

    /// Effective policy for `kind`: the override if set, else the default table.
    pub fn retry_policy(&self, kind: ErrorKind) -> RetryPolicy {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| RetryPolicy::for_kind(kind))
    }

    /// Run the strategy assigned to `error`.
    ///
    /// `operation` is re-invoked by the retry strategies; `fallback` is run
    /// once by the fallback strategy. A missing callable makes those
    /// strategies fail.
    pub async fn recover(
        &self,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
    ) -> RecoveryOutcome {
        self.run(error.strategy(), error, operation, fallback, None)
            .await
    }

    /// [`recover`](Self::recover), additionally aborted when `cancel` fires.
    pub async fn recover_with_cancel(
        &self,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        self.run(error.strategy(), error, operation, fallback, Some(cancel))
            .await
    }

    /// Run `strategy` instead of the one assigned to the error's kind. The
    /// retry policy is still the kind's.
    pub async fn recover_as(
        &self,
        strategy: RecoveryStrategy,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
    ) -> RecoveryOutcome {
        self.run(strategy, error, operation, fallback, None).await
    }

    async fn run(
        &self,
        strategy: RecoveryStrategy,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
        cancel: Option<&CancellationToken>,
    ) -> RecoveryOutcome {
        let start = Instant::now();

        let outcome = match self.admit(error, strategy) {
            Err(rejected) => rejected,
            Ok(Admitted {
                guard,
                token,
                attempts,
            }) => {
                self.notify(error, |l| l.on_recovery_start(error, strategy));
                let caller = cancel.cloned().unwrap_or_default();
                let body = self.execute(strategy, error, operation, fallback, &attempts);
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Self::aborted(strategy, error, &attempts, RecoverySignal::Cancelled),
                    _ = caller.cancelled() => Self::aborted(strategy, error, &attempts, RecoverySignal::Cancelled),
                    res = tokio::time::timeout(self.config.global_timeout(), body) => match res {
                        Ok(outcome) => outcome,
                        Err(_) => Self::aborted(strategy, error, &attempts, RecoverySignal::TimedOut),
                    },
                };
                drop(guard);
                outcome
            }
        };

        self.record(outcome.strategy, &outcome, start.elapsed());
        self.notify(error, |l| l.on_recovery_finish(error, &outcome));
        outcome
    }

    fn notify(&self, error: &ClassifiedError, f: impl Fn(&dyn RecoveryListener)) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                tracing::warn!(kind = %error.kind(), "Recovery listener panicked");
            }
        }
    }

    /// Observe every recovery this manager runs or rejects.
    pub fn add_recovery_listener(
        &self,
        listener: impl RecoveryListener + 'static,
    ) -> RecoveryListenerId {
        let id = RecoveryListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_recovery_listener(&self, id: RecoveryListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn admit(
        &self,
        error: &ClassifiedError,
        strategy: RecoveryStrategy,
    ) -> std::result::Result<Admitted<'_>, RecoveryOutcome> {
        let key = RecoveryKey::for_error(error);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = active.get(&key) {
            tracing::debug!(
                kind = %error.kind(),
                channel_id = error.channel_id(),
                recovery = %existing.id,
                "Recovery already in progress"
            );
            return Err(RecoveryOutcome::failed(existing.strategy, error.clone())
                .with_retry_count(existing.attempts.load(Ordering::SeqCst)));
        }

        if active.len() >= self.config.max_concurrent_recoveries {
            tracing::warn!(
                kind = %error.kind(),
                channel_id = error.channel_id(),
                limit = self.config.max_concurrent_recoveries,
                "Maximum concurrent recoveries exceeded"
            );
            let context = ErrorContext {
                timestamp: None,
                ..error.context().clone()
            };
            let rejection = ClassifiedError::new(
                ErrorKind::Unknown,
                "Maximum concurrent recoveries exceeded",
                context,
            );
            return Err(
                RecoveryOutcome::failed(RecoveryStrategy::Escalate, rejection)
                    .with_signal(RecoverySignal::Escalated),
            );
        }

        let id = RecoveryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = self.root.child_token();
        let attempts = Arc::new(AtomicU32::new(0));
        active.insert(
            key.clone(),
            ActiveEntry {
                id,
                kind: error.kind(),
                channel_id: error.channel_id().map(str::to_string),
                strategy,
                attempts: attempts.clone(),
                started: Instant::now(),
                token: token.clone(),
            },
        );

        Ok(Admitted {
            guard: ActiveGuard {
                active: &self.active,
                key,
                id,
            },
            token,
            attempts,
        })
    }

    async fn execute(
        &self,
        strategy: RecoveryStrategy,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
        attempts: &AtomicU32,
    ) -> RecoveryOutcome {
        match strategy {
            RecoveryStrategy::Retry | RecoveryStrategy::ExponentialBackoff => {
                let Some(operation) = operation else {
                    return RecoveryOutcome::failed(strategy, error.clone());
                };
                let policy = self.retry_policy(error.kind());
                self.retry_loop(strategy, error, operation, &policy, attempts)
                    .await
            }
            RecoveryStrategy::Fallback => {
                let Some(fallback) = fallback else {
                    return RecoveryOutcome::failed(strategy, error.clone());
                };
                match fallback.run().await {
                    Ok(()) => RecoveryOutcome::succeeded(strategy).with_fallback_used(),
                    Err(e) => {
                        tracing::warn!(kind = %error.kind(), error = %e, "Fallback failed");
                        RecoveryOutcome::failed(strategy, error.clone())
                    }
                }
            }
            RecoveryStrategy::Reset => {
                RecoveryOutcome::succeeded(strategy).with_signal(RecoverySignal::ResetRequired)
            }
            RecoveryStrategy::Disable => {
                RecoveryOutcome::succeeded(strategy).with_signal(RecoverySignal::DisableRequired)
            }
            RecoveryStrategy::Ignore => {
                RecoveryOutcome::succeeded(strategy).with_signal(RecoverySignal::Ignored)
            }
            RecoveryStrategy::Escalate => RecoveryOutcome::failed(strategy, error.clone())
                .with_signal(RecoverySignal::Escalated),
        }
    }

    async fn retry_loop(
        &self,
        strategy: RecoveryStrategy,
        error: &ClassifiedError,
        operation: &dyn Operation,
        policy: &RetryPolicy,
        attempts: &AtomicU32,
    ) -> RecoveryOutcome {
        let exponential = strategy == RecoveryStrategy::ExponentialBackoff;
        let delay_for = |attempt: u32| {
            let jitter = rand::rng().random::<f64>();
            if exponential {
                policy.backoff_delay(attempt, jitter)
            } else {
                policy.fixed_delay(jitter)
            }
        };

        for attempt in 0..policy.max_retries {
            attempts.store(attempt + 1, Ordering::SeqCst);
            match operation.run().await {
                Ok(()) => {
                    tracing::info!(
                        kind = %error.kind(),
                        channel_id = error.channel_id(),
                        attempt = attempt + 1,
                        "Recovery succeeded"
                    );
                    return RecoveryOutcome::succeeded(strategy).with_retry_count(attempt + 1);
                }
                Err(e) if attempt + 1 < policy.max_retries => {
                    let backoff = delay_for(attempt);
                    tracing::warn!(
                        kind = %error.kind(),
                        channel_id = error.channel_id(),
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying recovery operation"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::warn!(
                        kind = %error.kind(),
                        channel_id = error.channel_id(),
                        attempt = attempt + 1,
                        error = %e,
                        "Recovery attempts exhausted"
                    );
                }
            }
        }

        let outcome = RecoveryOutcome::failed(strategy, error.clone())
            .with_retry_count(policy.max_retries);
        if exponential {
            outcome.with_next_retry_delay(delay_for(policy.max_retries))
        } else {
            outcome
        }
    }

    fn aborted(
        strategy: RecoveryStrategy,
        error: &ClassifiedError,
        attempts: &AtomicU32,
        signal: RecoverySignal,
    ) -> RecoveryOutcome {
        tracing::info!(
            kind = %error.kind(),
            channel_id = error.channel_id(),
            ?signal,
            "Recovery aborted"
        );
        RecoveryOutcome::failed(strategy, error.clone())
            .with_retry_count(attempts.load(Ordering::SeqCst))
            .with_signal(signal)
    }

    fn record(&self, strategy: RecoveryStrategy, outcome: &RecoveryOutcome, elapsed: Duration) {
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.attempts += 1;
            if outcome.success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.samples.push_back(elapsed);
            if stats.samples.len() > RECOVERY_TIME_SAMPLES {
                stats.samples.pop_front();
            }
        }

        if self.config.enable_metrics {
            metrics::histogram!(
                "error_recovery.duration_seconds",
                "strategy" => strategy.as_str()
            )
            .record(elapsed.as_secs_f64());

            metrics::counter!(
                "error_recovery.total",
                "strategy" => strategy.as_str(),
                "status" => outcome.status()
            )
            .increment(1);
        }
    }

    /// In-flight recoveries.
    pub fn active_recoveries(&self) -> Vec<ActiveRecovery> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = active
            .values()
            .map(|e| ActiveRecovery {
                id: e.id,
                kind: e.kind,
                channel_id: e.channel_id.clone(),
                strategy: e.strategy,
                attempts: e.attempts.load(Ordering::SeqCst),
                elapsed: e.started.elapsed(),
            })
            .collect();
        list.sort_by_key(|r| r.id);
        list
    }

    /// Abort one in-flight recovery. Returns whether it was found.
    pub fn cancel_recovery(&self, id: RecoveryId) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.values().find(|e| e.id == id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> RecoveryStats {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let average_recovery_time = if stats.samples.is_empty() {
            Duration::ZERO
        } else {
            stats.samples.iter().sum::<Duration>() / stats.samples.len() as u32
        };
        RecoveryStats {
            attempts: stats.attempts,
            successes: stats.successes,
            failures: stats.failures,
            average_recovery_time,
            active,
        }
    }

    /// Cancel and forget every in-flight recovery.
    pub fn clear_active_recoveries(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in active.values() {
            entry.token.cancel();
        }
        active.clear();
    }

    /// Cancel all recoveries, present and future, and drop listeners.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.clear_active_recoveries();
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryManagerConfig::default())
    }
}
