//! The single entry point consumers call on failure.
//!
//! [`ErrorHandler::handle`] runs a fixed sequence: classify, count, log,
//! notify listeners, then either run a custom per-kind handler or throttle and
//! delegate to the [`RecoveryManager`]. Counting and logging always finish
//! before any recovery starts. Nothing that goes wrong inside the handler's
//! own machinery (listeners, custom handlers) reaches the caller; the outcome
//! is returned as data.

use crate::classifier::{ClassifiedError, ErrorContext, RawError, classify};
use crate::clock::SharedClock;
use crate::rate_limit::{ERROR_RECOVERY, RateLimiter};
use crate::recovery::{RECOVERY_TIME_SAMPLES, RecoveryManager, RecoveryOutcome};
use crate::taxonomy::{ErrorKind, Severity};
use crate::traits::{CustomHandler, ErrorListener, Operation, RecoveryListener};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Level used for error-log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Level chosen for an error of `severity` when no override is set.
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => Self::Error,
            Severity::Medium => Self::Warn,
            Severity::Low => Self::Info,
        }
    }
}

/// Handler behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    /// Run recovery for retryable errors.
    pub enable_auto_recovery: bool,
    /// Keep the in-memory error log and emit tracing records.
    pub enable_logging: bool,
    /// Maintain [`ErrorMetrics`] and emit `metrics` counters.
    pub enable_metrics: bool,
    /// Fixed level for error records. `None` picks the level by severity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    /// Capacity of the error log ring buffer.
    pub max_log_entries: usize,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            enable_auto_recovery: true,
            enable_logging: true,
            enable_metrics: true,
            log_level: None,
            max_log_entries: 100,
        }
    }
}

impl ErrorHandlerConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_log_entries == 0 {
            return Err(crate::error::ResilienceError::Config(
                "max_log_entries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Anything [`ErrorHandler::handle`] accepts: a raw failure to classify, or an
/// already classified error.
#[derive(Debug, Clone)]
pub enum Failure {
    Raw(RawError),
    Classified(ClassifiedError),
}

impl From<RawError> for Failure {
    fn from(raw: RawError) -> Self {
        Self::Raw(raw)
    }
}

impl From<ClassifiedError> for Failure {
    fn from(error: ClassifiedError) -> Self {
        Self::Classified(error)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        // Keep the original classification if one travelled inside anyhow.
        match err.downcast::<ClassifiedError>() {
            Ok(classified) => Self::Classified(classified),
            Err(other) => Self::Raw(other.into()),
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::Raw(err.into())
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self::Raw(message.into())
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::Raw(message.into())
    }
}

/// Identifier of an error log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogEntryId(u64);

/// Identifier returned by [`ErrorHandler::add_error_listener`] and
/// [`ErrorHandler::add_recovery_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One handled error.
#[derive(Debug, Clone)]
pub struct ErrorLogEntry {
    pub id: LogEntryId,
    pub timestamp: DateTime<Utc>,
    pub error: ClassifiedError,
    pub level: LogLevel,
    /// User-facing text for the error's kind.
    pub message: &'static str,
    pub resolved: bool,
    pub resolution_time: Option<DateTime<Utc>>,
}

/// Process-wide error counters. Reset with [`ErrorHandler::clear_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetrics {
    pub total_errors: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub errors_by_severity: BTreeMap<Severity, u64>,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    /// Mean over the last [`RECOVERY_TIME_SAMPLES`] recoveries.
    pub average_recovery_time: Duration,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Default for ErrorMetrics {
    fn default() -> Self {
        Self {
            total_errors: 0,
            errors_by_kind: ErrorKind::ALL.into_iter().map(|k| (k, 0)).collect(),
            errors_by_severity: Severity::ALL.into_iter().map(|s| (s, 0)).collect(),
            recovery_attempts: 0,
            successful_recoveries: 0,
            failed_recoveries: 0,
            average_recovery_time: Duration::ZERO,
            last_error_time: None,
        }
    }
}

#[derive(Default)]
struct MetricsState {
    metrics: ErrorMetrics,
    recovery_samples: VecDeque<Duration>,
}

impl MetricsState {
    fn push_sample(&mut self, elapsed: Duration) {
        self.recovery_samples.push_back(elapsed);
        if self.recovery_samples.len() > RECOVERY_TIME_SAMPLES {
            self.recovery_samples.pop_front();
        }
        let total: Duration = self.recovery_samples.iter().sum();
        self.metrics.average_recovery_time = total / self.recovery_samples.len() as u32;
    }
}

/// Orchestrates classification, bookkeeping, and recovery.
pub struct ErrorHandler {
    config: RwLock<ErrorHandlerConfig>,
    clock: SharedClock,
    recovery: Arc<RecoveryManager>,
    rate_limiter: Arc<RateLimiter>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ErrorListener>)>>,
    recovery_listeners: RwLock<Vec<(ListenerId, Arc<dyn RecoveryListener>)>>,
    custom_handlers: RwLock<HashMap<ErrorKind, Arc<dyn CustomHandler>>>,
    log: Mutex<VecDeque<ErrorLogEntry>>,
    metrics: Mutex<MetricsState>,
    next_id: AtomicU64,
}

impl ErrorHandler {
    pub fn new(
        config: ErrorHandlerConfig,
        clock: SharedClock,
        recovery: Arc<RecoveryManager>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            recovery,
            rate_limiter,
            listeners: RwLock::new(Vec::new()),
            recovery_listeners: RwLock::new(Vec::new()),
            custom_handlers: RwLock::new(HashMap::new()),
            log: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(MetricsState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Handle a failure and attempt recovery.
    ///
    /// `operation` is what the retry strategies re-run; `fallback` is what the
    /// fallback strategy runs. Either may be absent, in which case the
    /// strategies that need them report failure.
    pub async fn handle(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
    ) -> RecoveryOutcome {
        let config = self.config();
        let error = self.classify(failure, context);

        if config.enable_metrics {
            self.count_error(&error);
        }
        let entry = config
            .enable_logging
            .then(|| self.log_error(&error, &config));
        self.notify_listeners(&error);

        let custom = self
            .custom_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&error.kind())
            .cloned();
        if let Some(custom) = custom {
            match custom.handle(&error).await {
                Ok(outcome) => {
                    self.finish(&error, entry, &outcome, &config);
                    return outcome;
                }
                Err(e) => {
                    tracing::error!(
                        kind = %error.kind(),
                        error = %e,
                        "Custom error handler failed, using default recovery"
                    );
                }
            }
        }

        if config.enable_auto_recovery && error.is_retryable() {
            let outcome = self.attempt_recovery(&error, operation, fallback).await;
            self.finish(&error, entry, &outcome, &config);
            return outcome;
        }

        RecoveryOutcome::failed(error.strategy(), error)
    }

    /// Classify `failure` with this handler's clock. Already classified
    /// errors pass through unchanged and `context` is ignored.
    pub fn classify(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
    ) -> ClassifiedError {
        match failure.into() {
            Failure::Classified(error) => error,
            Failure::Raw(raw) => classify(raw, context, self.clock.as_ref()),
        }
    }

    /// [`handle`](Self::handle) with an operation to retry.
    pub async fn handle_with_retry(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
        operation: &dyn Operation,
    ) -> RecoveryOutcome {
        self.handle(failure, context, Some(operation), None).await
    }

    /// [`handle`](Self::handle) with a fallback.
    pub async fn handle_with_fallback(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
        fallback: &dyn Operation,
    ) -> RecoveryOutcome {
        self.handle(failure, context, None, Some(fallback)).await
    }

    /// Run `operation` once; on failure, route the error through
    /// [`handle`](Self::handle) with the same operation as the retry target.
    ///
    /// Returns `Ok(None)` if the first call succeeded, `Ok(Some(outcome))` if
    /// recovery succeeded, and the classified error otherwise.
    pub async fn call_with_error_handling(
        &self,
        context: Option<ErrorContext>,
        operation: &dyn Operation,
    ) -> std::result::Result<Option<RecoveryOutcome>, ClassifiedError> {
        let err = match operation.run().await {
            Ok(()) => return Ok(None),
            Err(e) => e,
        };

        let outcome = self.handle(err, context, Some(operation), None).await;
        match outcome.error.clone() {
            Some(error) if !outcome.success => Err(error),
            _ => Ok(Some(outcome)),
        }
    }

    async fn attempt_recovery(
        &self,
        error: &ClassifiedError,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
    ) -> RecoveryOutcome {
        let channel = error.channel_id();
        self.update_metrics(|m| m.metrics.recovery_attempts += 1);

        let decision = self.rate_limiter.check_limit(ERROR_RECOVERY, channel);
        if !decision.allowed {
            self.update_metrics(|m| m.metrics.failed_recoveries += 1);
            tracing::warn!(
                kind = %error.kind(),
                channel_id = channel,
                retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                "Error recovery throttled"
            );
            let mut context = ErrorContext::operation("error_recovery_rate_limit");
            context.channel_id = channel.map(str::to_string);
            let throttled = classify(
                RawError::new("Rate limit exceeded for error recovery"),
                Some(context),
                self.clock.as_ref(),
            );
            let outcome = RecoveryOutcome::failed(error.strategy(), throttled);
            return match decision.retry_after {
                Some(delay) => outcome.with_next_retry_delay(delay),
                None => outcome,
            };
        }

        let start = Instant::now();
        let outcome = self.recovery.recover(error, operation, fallback).await;
        let elapsed = start.elapsed();

        if outcome.success {
            self.rate_limiter.record_request(ERROR_RECOVERY, channel);
        } else {
            self.rate_limiter.record_error(ERROR_RECOVERY, channel);
        }
        self.update_metrics(|m| {
            if outcome.success {
                m.metrics.successful_recoveries += 1;
            } else {
                m.metrics.failed_recoveries += 1;
            }
            m.push_sample(elapsed);
        });
        outcome
    }

    fn finish(
        &self,
        error: &ClassifiedError,
        entry: Option<LogEntryId>,
        outcome: &RecoveryOutcome,
        config: &ErrorHandlerConfig,
    ) {
        self.notify_recovery_listeners(error, outcome);
        if !config.enable_logging {
            return;
        }
        if outcome.success {
            tracing::info!(
                kind = %error.kind(),
                strategy = %outcome.strategy,
                retry_count = outcome.retry_count,
                "Recovery succeeded"
            );
            if let Some(id) = entry {
                self.mark_resolved(id);
            }
        } else {
            tracing::warn!(
                kind = %error.kind(),
                strategy = %outcome.strategy,
                retry_count = outcome.retry_count,
                "Recovery failed"
            );
        }
    }

    fn count_error(&self, error: &ClassifiedError) {
        self.update_metrics(|m| {
            m.metrics.total_errors += 1;
            *m.metrics.errors_by_kind.entry(error.kind()).or_default() += 1;
            *m.metrics
                .errors_by_severity
                .entry(error.severity())
                .or_default() += 1;
            m.metrics.last_error_time = Some(error.timestamp());
        });
        metrics::counter!(
            "realtime_errors.total",
            "kind" => error.kind().as_str(),
            "severity" => error.severity().as_str()
        )
        .increment(1);
    }

    fn update_metrics(&self, f: impl FnOnce(&mut MetricsState)) {
        let mut state = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    fn log_error(&self, error: &ClassifiedError, config: &ErrorHandlerConfig) -> LogEntryId {
        let level = config
            .log_level
            .unwrap_or_else(|| LogLevel::for_severity(error.severity()));
        let id = LogEntryId(self.next_id.fetch_add(1, Ordering::SeqCst));

        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.push_back(ErrorLogEntry {
                id,
                timestamp: error.timestamp(),
                error: error.clone(),
                level,
                message: error.friendly_message(),
                resolved: false,
                resolution_time: None,
            });
            while log.len() > config.max_log_entries {
                log.pop_front();
            }
        }

        let kind = error.kind().as_str();
        let severity = error.severity().as_str();
        let channel_id = error.channel_id();
        let code = error.code();
        match level {
            LogLevel::Error => {
                tracing::error!(kind, severity, channel_id, code, "{error}")
            }
            LogLevel::Warn => tracing::warn!(kind, severity, channel_id, code, "{error}"),
            LogLevel::Info => tracing::info!(kind, severity, channel_id, code, "{error}"),
            LogLevel::Debug => {
                tracing::debug!(kind, severity, channel_id, code, "{error}")
            }
        }
        id
    }

    fn mark_resolved(&self, id: LogEntryId) {
        let now = self.clock.now();
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = log.iter_mut().find(|e| e.id == id) {
            entry.resolved = true;
            entry.resolution_time = Some(now);
        }
    }

    fn notify_listeners(&self, error: &ClassifiedError) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_error(error))).is_err() {
                tracing::warn!(kind = %error.kind(), "Error listener panicked");
            }
        }
    }

    fn notify_recovery_listeners(&self, error: &ClassifiedError, outcome: &RecoveryOutcome) {
        let listeners: Vec<_> = self
            .recovery_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_recovery_finish(error, outcome)))
                .is_err()
            {
                tracing::warn!(kind = %error.kind(), "Recovery listener panicked");
            }
        }
    }

    /// Register a passive observer.
    pub fn add_error_listener(&self, listener: impl ErrorListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Observe the final outcome of every recovery this handler attempts:
    /// custom handlers, throttled attempts, and manager recoveries. Only
    /// [`RecoveryListener::on_recovery_finish`] is called.
    pub fn add_recovery_listener(&self, listener: impl RecoveryListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.recovery_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_recovery_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .recovery_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Replace default recovery for `kind`.
    pub fn set_custom_handler(&self, kind: ErrorKind, handler: Arc<dyn CustomHandler>) {
        self.custom_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }

    pub fn remove_custom_handler(&self, kind: ErrorKind) -> bool {
        self.custom_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
            .is_some()
    }

    pub fn metrics(&self) -> ErrorMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone()
    }

    /// Log entries, oldest first.
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn unresolved_errors(&self) -> Vec<ErrorLogEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.resolved)
            .cloned()
            .collect()
    }

    pub fn clear_error_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn clear_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = MetricsState::default();
    }

    pub fn config(&self) -> ErrorHandlerConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the configuration. Takes effect for the next handled error.
    pub fn update_config(&self, config: ErrorHandlerConfig) -> crate::error::Result<()> {
        config.validate()?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    pub fn recovery_manager(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Drop listeners, custom handlers, the log, and the metrics.
    pub fn shutdown(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.recovery_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.custom_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.clear_error_log();
        self.clear_metrics();
    }
}
