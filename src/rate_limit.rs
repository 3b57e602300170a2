//! Multi-strategy rate limiting keyed by operation type and instance.
//!
//! Each operation type has exactly one [`RateLimitConfig`]. State is tracked
//! per key (`operation` or `operation:instance`) and created lazily on first
//! use. [`RateLimiter::check_limit`] is a probe: apart from pruning expired
//! window timestamps it never changes state, so callers may ask "could I go
//! now?" as often as they like. Only [`record_request`](RateLimiter::record_request)
//! and [`record_error`](RateLimiter::record_error) mutate.
//!
//! Operation types without a config, or whose config has a zero window or a
//! zero request budget, are always allowed.

use crate::clock::{Clock, SharedClock};
use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Operation type for live channel connections.
pub const REALTIME_CONNECTION: &str = "realtime_connection";
/// Operation type for live channel subscriptions.
pub const REALTIME_SUBSCRIPTION: &str = "realtime_subscription";
/// Operation type for read API calls.
pub const API_FETCH: &str = "api_fetch";
/// Operation type for write API calls.
pub const API_MUTATION: &str = "api_mutation";
/// Operation type for periodic polling.
pub const POLLING: &str = "polling";
/// Operation type the error handler uses to throttle its own recoveries.
pub const ERROR_RECOVERY: &str = "error_recovery";

/// Idle states older than this are dropped by [`RateLimiter::cleanup`].
pub const STATE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_BACKOFF_MS: u64 = 300_000;
const UNLIMITED_RESET_MS: i64 = 60_000;

/// Admission algorithm for one operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Count requests in aligned `window_ms` buckets.
    FixedWindow,
    /// Count requests in the trailing `window_ms`.
    SlidingWindow,
    /// Continuously refilled permits, one consumed per request.
    TokenBucket,
    /// Sliding-window admission plus a growing block after consecutive errors.
    ExponentialBackoff,
}

/// Limits for one operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests admitted per window (or bucket capacity).
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Admission algorithm.
    pub strategy: RateLimitStrategy,
    /// Extra burst capacity. Carried for callers; admission does not use it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_allowance: Option<u32>,
    /// Backoff growth per consecutive error. Defaults to 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    /// First backoff interval in milliseconds. Defaults to 1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<u64>,
    /// Backoff ceiling in milliseconds. Defaults to 300000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration, strategy: RateLimitStrategy) -> Self {
        Self {
            max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            strategy,
            burst_allowance: None,
            backoff_multiplier: None,
            base_backoff_ms: None,
            max_backoff_ms: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst_allowance = Some(burst);
        self
    }

    /// Set the backoff-on-error parameters.
    pub fn with_backoff(mut self, base: Duration, multiplier: f64, max: Duration) -> Self {
        self.base_backoff_ms = Some(u64::try_from(base.as_millis()).unwrap_or(u64::MAX));
        self.backoff_multiplier = Some(multiplier);
        self.max_backoff_ms = Some(u64::try_from(max.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// A zero window or zero budget disables limiting for the type.
    pub fn is_effective(&self) -> bool {
        self.max_requests > 0 && self.window_ms > 0
    }

    fn window(&self) -> i64 {
        i64::try_from(self.window_ms).unwrap_or(i64::MAX)
    }

    /// Backoff for the `consecutive_errors`-th error in a row:
    /// `min(base * multiplier^(n-1), max)`.
    pub fn backoff_for(&self, consecutive_errors: u32) -> Duration {
        let base = self.base_backoff_ms.unwrap_or(DEFAULT_BASE_BACKOFF_MS) as f64;
        let multiplier = self
            .backoff_multiplier
            .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER)
            .max(1.0);
        let max = self.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS) as f64;
        let exponent = i32::try_from(consecutive_errors.saturating_sub(1)).unwrap_or(i32::MAX);
        Duration::from_millis((base * multiplier.powi(exponent)).min(max) as u64)
    }
}

/// Built-in limits for the operation types used by live-sync clients.
pub fn default_rate_limits() -> HashMap<String, RateLimitConfig> {
    let minute = Duration::from_secs(60);
    HashMap::from([
        (
            REALTIME_CONNECTION.to_string(),
            RateLimitConfig::new(100, minute, RateLimitStrategy::SlidingWindow).with_burst(10),
        ),
        (
            REALTIME_SUBSCRIPTION.to_string(),
            RateLimitConfig::new(50, minute, RateLimitStrategy::SlidingWindow).with_burst(5),
        ),
        (
            API_FETCH.to_string(),
            RateLimitConfig::new(200, minute, RateLimitStrategy::TokenBucket).with_burst(20),
        ),
        (
            API_MUTATION.to_string(),
            RateLimitConfig::new(100, minute, RateLimitStrategy::SlidingWindow).with_burst(10),
        ),
        (
            POLLING.to_string(),
            RateLimitConfig::new(60, minute, RateLimitStrategy::FixedWindow),
        ),
        (
            ERROR_RECOVERY.to_string(),
            RateLimitConfig::new(10, minute, RateLimitStrategy::ExponentialBackoff).with_backoff(
                Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
                DEFAULT_BACKOFF_MULTIPLIER,
                Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            ),
        ),
    ])
}

/// Answer to "may this operation proceed now?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests (or whole tokens) left; `u64::MAX` when unlimited.
    pub remaining: u64,
    /// When the limiting state next loosens.
    pub reset_time: DateTime<Utc>,
    /// Suggested wait when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Usage snapshot for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    /// Requests recorded within the trailing window.
    pub requests: usize,
    pub remaining: u64,
    /// Tokens currently available (token bucket only).
    pub tokens: f64,
    pub backoff_until: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone)]
struct KeyState {
    requests: VecDeque<i64>,
    tokens: f64,
    last_refill: i64,
    backoff_until: i64,
    consecutive_errors: u32,
    last_activity: i64,
}

impl KeyState {
    fn new(config: &RateLimitConfig, now: i64) -> Self {
        Self {
            requests: VecDeque::new(),
            tokens: f64::from(config.max_requests),
            last_refill: now,
            backoff_until: 0,
            consecutive_errors: 0,
            last_activity: now,
        }
    }

    /// Tokens available at `now` without committing the refill.
    fn available_tokens(&self, config: &RateLimitConfig, now: i64) -> f64 {
        let capacity = f64::from(config.max_requests);
        let elapsed = (now - self.last_refill).max(0) as f64;
        let refill = elapsed * capacity / config.window_ms as f64;
        (self.tokens + refill).min(capacity)
    }

    fn prune_before(&mut self, cutoff: i64) {
        while self.requests.front().is_some_and(|ts| *ts < cutoff) {
            self.requests.pop_front();
        }
    }

    fn count_in_trailing_window(&self, window: i64, now: i64) -> usize {
        self.requests.iter().filter(|ts| **ts > now - window).count()
    }
}

struct Inner {
    configs: RwLock<HashMap<String, RateLimitConfig>>,
    states: Mutex<HashMap<String, KeyState>>,
    clock: SharedClock,
}

impl Inner {
    fn effective_config(&self, operation: &str) -> Option<RateLimitConfig> {
        let configs = self.configs.read().unwrap_or_else(PoisonError::into_inner);
        configs.get(operation).filter(|c| c.is_effective()).cloned()
    }

    fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let retention = STATE_RETENTION.as_millis() as i64;
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let before = states.len();
        states.retain(|_, state| {
            state.prune_before(now - retention);
            !(state.requests.is_empty()
                && state.backoff_until < now
                && now - state.last_activity > retention)
        });
        before - states.len()
    }
}

fn state_key(operation: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{operation}:{id}"),
        None => operation.to_string(),
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ms_to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Process-wide rate limiter.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct RateLimiter {
    inner: Arc<Inner>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Limiter preloaded with [`default_rate_limits`].
    pub fn new(clock: SharedClock) -> Self {
        Self::with_configs(clock, default_rate_limits())
    }

    /// Limiter with exactly `configs`.
    pub fn with_configs(clock: SharedClock, configs: HashMap<String, RateLimitConfig>) -> Self {
        Self {
            inner: Arc::new(Inner {
                configs: RwLock::new(configs),
                states: Mutex::new(HashMap::new()),
                clock,
            }),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Install or replace the config for `operation`. Existing state for the
    /// type is kept.
    pub fn set_rate_limit(&self, operation: impl Into<String>, config: RateLimitConfig) {
        let mut configs = self
            .inner
            .configs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        configs.insert(operation.into(), config);
    }

    pub fn rate_limit(&self, operation: &str) -> Option<RateLimitConfig> {
        let configs = self
            .inner
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        configs.get(operation).cloned()
    }

    /// Whether `operation` (for `identifier`) may proceed now.
    pub fn check_limit(&self, operation: &str, identifier: Option<&str>) -> RateLimitDecision {
        let now = self.inner.clock.now_ms();
        let Some(config) = self.inner.effective_config(operation) else {
            return RateLimitDecision {
                allowed: true,
                remaining: u64::MAX,
                reset_time: ms_to_datetime(now + UNLIMITED_RESET_MS),
                retry_after: None,
                reason: None,
            };
        };

        let decision = {
            let mut states = self
                .inner
                .states
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(state_key(operation, identifier))
                .or_insert_with(|| KeyState::new(&config, now));
            Self::decide(state, &config, now)
        };

        metrics::counter!(
            "rate_limit.decisions",
            "operation" => operation.to_string(),
            "allowed" => if decision.allowed { "true" } else { "false" }
        )
        .increment(1);

        if !decision.allowed {
            tracing::debug!(
                operation,
                identifier,
                retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                "Rate limit denied"
            );
        }
        decision
    }

    fn decide(state: &mut KeyState, config: &RateLimitConfig, now: i64) -> RateLimitDecision {
        if state.backoff_until > now {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_time: ms_to_datetime(state.backoff_until),
                retry_after: Some(ms_to_duration(state.backoff_until - now)),
                reason: Some("exponential backoff active".to_string()),
            };
        }

        let max = u64::from(config.max_requests);
        let window = config.window();
        match config.strategy {
            RateLimitStrategy::FixedWindow => {
                let window_start = now.div_euclid(window) * window;
                let window_end = window_start.saturating_add(window);
                state.prune_before(window_start);
                let remaining = max.saturating_sub(state.requests.len() as u64);
                Self::windowed(remaining, window_end, now)
            }
            RateLimitStrategy::SlidingWindow | RateLimitStrategy::ExponentialBackoff => {
                state.prune_before(now.saturating_sub(window) + 1);
                let remaining = max.saturating_sub(state.requests.len() as u64);
                let reset = state
                    .requests
                    .front()
                    .map_or(now.saturating_add(window), |oldest| {
                        oldest.saturating_add(window)
                    });
                Self::windowed(remaining, reset, now)
            }
            RateLimitStrategy::TokenBucket => {
                let available = state.available_tokens(config, now);
                let whole = available.floor();
                let ms_per_token = config.window_ms as f64 / f64::from(config.max_requests);
                let until_next = if available >= f64::from(config.max_requests) {
                    0
                } else {
                    ((whole + 1.0 - available) * ms_per_token).ceil() as i64
                };
                let allowed = available >= 1.0;
                RateLimitDecision {
                    allowed,
                    remaining: whole as u64,
                    reset_time: ms_to_datetime(now + until_next),
                    retry_after: (!allowed).then(|| ms_to_duration(until_next)),
                    reason: None,
                }
            }
        }
    }

    fn windowed(remaining: u64, reset: i64, now: i64) -> RateLimitDecision {
        let allowed = remaining > 0;
        RateLimitDecision {
            allowed,
            remaining,
            reset_time: ms_to_datetime(reset),
            retry_after: (!allowed).then(|| ms_to_duration(reset - now)),
            reason: None,
        }
    }

    /// Record that `operation` proceeded. For the backoff strategy this also
    /// clears the consecutive error count and lifts any active backoff.
    pub fn record_request(&self, operation: &str, identifier: Option<&str>) {
        let Some(config) = self.inner.effective_config(operation) else {
            return;
        };
        let now = self.inner.clock.now_ms();
        let mut states = self
            .inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(state_key(operation, identifier))
            .or_insert_with(|| KeyState::new(&config, now));
        state.last_activity = now;

        let window = config.window();
        match config.strategy {
            RateLimitStrategy::FixedWindow => {
                state.prune_before(now.div_euclid(window) * window);
                state.requests.push_back(now);
            }
            RateLimitStrategy::SlidingWindow => {
                state.prune_before(now.saturating_sub(window) + 1);
                state.requests.push_back(now);
            }
            RateLimitStrategy::TokenBucket => {
                state.tokens = (state.available_tokens(&config, now) - 1.0).max(0.0);
                state.last_refill = now;
            }
            RateLimitStrategy::ExponentialBackoff => {
                state.prune_before(now.saturating_sub(window) + 1);
                state.requests.push_back(now);
                state.consecutive_errors = 0;
                state.backoff_until = 0;
            }
        }
    }

    /// Record a failed attempt. Only the backoff strategy reacts: it blocks
    /// the key for `min(base * multiplier^(n-1), max)` after the n-th
    /// consecutive error.
    pub fn record_error(&self, operation: &str, identifier: Option<&str>) {
        let Some(config) = self.inner.effective_config(operation) else {
            return;
        };
        if config.strategy != RateLimitStrategy::ExponentialBackoff {
            return;
        }
        let now = self.inner.clock.now_ms();
        let mut states = self
            .inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(state_key(operation, identifier))
            .or_insert_with(|| KeyState::new(&config, now));
        state.last_activity = now;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        let backoff = config.backoff_for(state.consecutive_errors);
        state.backoff_until =
            now.saturating_add(i64::try_from(backoff.as_millis()).unwrap_or(i64::MAX));

        tracing::warn!(
            operation,
            identifier,
            consecutive_errors = state.consecutive_errors,
            backoff_ms = backoff.as_millis() as u64,
            "Backing off after consecutive errors"
        );
    }

    /// Usage snapshot for a key that has state and a config.
    pub fn stats(&self, operation: &str, identifier: Option<&str>) -> Option<RateLimitStats> {
        let config = self.inner.effective_config(operation)?;
        let now = self.inner.clock.now_ms();
        let states = self
            .inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.get(&state_key(operation, identifier))?;
        let requests = state.count_in_trailing_window(config.window(), now);
        Some(RateLimitStats {
            requests,
            remaining: u64::from(config.max_requests).saturating_sub(requests as u64),
            tokens: state.available_tokens(&config, now),
            backoff_until: (state.backoff_until > 0).then(|| ms_to_datetime(state.backoff_until)),
            consecutive_errors: state.consecutive_errors,
        })
    }

    /// Run `f` if admitted, recording success or error afterwards.
    ///
    /// A denial is returned as [`ResilienceError::RateLimited`] inside the
    /// `anyhow` error without running `f`.
    pub async fn with_rate_limit<T, F, Fut>(
        &self,
        operation: &str,
        identifier: Option<&str>,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let decision = self.check_limit(operation, identifier);
        if !decision.allowed {
            return Err(ResilienceError::RateLimited {
                operation: operation.to_string(),
                retry_after: decision.retry_after,
            }
            .into());
        }

        match f().await {
            Ok(value) => {
                self.record_request(operation, identifier);
                Ok(value)
            }
            Err(e) => {
                self.record_error(operation, identifier);
                Err(e)
            }
        }
    }

    /// Drop idle, empty states older than [`STATE_RETENTION`]. Returns how
    /// many keys were removed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Run [`cleanup`](Self::cleanup) every `every` on the current tokio
    /// runtime until [`shutdown`](Self::shutdown). Replaces a running task.
    /// A zero period is raised to one millisecond.
    pub fn start_cleanup_task(&self, every: Duration) {
        let every = every.max(Duration::from_millis(1));
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Dropped idle rate limit state");
                }
            }
        });
        let mut slot = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Forget all per-key state. Configs are kept.
    pub fn reset(&self) {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stop the cleanup task and clear all state.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.reset();
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self
            .cleanup_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
