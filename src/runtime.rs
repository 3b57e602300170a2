//! Process-wide wiring of the rate limiter, recovery manager, and handler.

use crate::boundary::{BoundaryConfig, ErrorBoundary};
use crate::classifier::{ClassifiedError, ErrorContext};
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::ResilienceConfig;
use crate::error::{ResilienceError, Result};
use crate::handler::{ErrorHandler, Failure};
use crate::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
use crate::recovery::{RecoveryManager, RecoveryOutcome};
use crate::taxonomy::{ErrorKind, RetryPolicy};
use crate::traits::Operation;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default period of the rate limiter's idle-state cleanup task.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The explicit, injectable replacement for module-level singletons.
///
/// Build one at process start with [`ResilienceRuntime::builder()`], share
/// the returned `Arc`, and call [`shutdown`](Self::shutdown) on exit.
pub struct ResilienceRuntime {
    config: ResilienceConfig,
    clock: SharedClock,
    rate_limiter: Arc<RateLimiter>,
    recovery: Arc<RecoveryManager>,
    handler: Arc<ErrorHandler>,
}

impl ResilienceRuntime {
    pub fn builder() -> ResilienceRuntimeBuilder {
        ResilienceRuntimeBuilder::default()
    }

    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Configuration the runtime was built from.
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shorthand for [`ErrorHandler::handle`].
    pub async fn handle(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
        operation: Option<&dyn Operation>,
        fallback: Option<&dyn Operation>,
    ) -> RecoveryOutcome {
        self.handler
            .handle(failure, context, operation, fallback)
            .await
    }

    pub fn classify(
        &self,
        failure: impl Into<Failure>,
        context: Option<ErrorContext>,
    ) -> ClassifiedError {
        self.handler.classify(failure, context)
    }

    pub fn check_rate_limit(&self, operation: &str, identifier: Option<&str>) -> RateLimitDecision {
        self.rate_limiter.check_limit(operation, identifier)
    }

    pub fn record_request(&self, operation: &str, identifier: Option<&str>) {
        self.rate_limiter.record_request(operation, identifier);
    }

    pub fn record_error(&self, operation: &str, identifier: Option<&str>) {
        self.rate_limiter.record_error(operation, identifier);
    }

    /// New boundary wired to this runtime's handler.
    pub fn error_boundary(&self, config: BoundaryConfig) -> ErrorBoundary {
        ErrorBoundary::new(self.handler.clone(), config)
    }

    /// Cancel in-flight recoveries, stop background tasks, and clear all
    /// in-memory state.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down resilience runtime");
        self.recovery.shutdown();
        self.rate_limiter.shutdown();
        self.handler.shutdown();
    }
}

/// Builder for [`ResilienceRuntime`].
///
/// ```rust,no_run
/// # use realtime_resilience::ResilienceRuntime;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = ResilienceRuntime::builder()
///     .config_from_env()?
///     .build()?;
/// let outcome = runtime.handle("connection failed", None, None, None).await;
/// # Ok(())
/// # }
/// ```
pub struct ResilienceRuntimeBuilder {
    config: ResilienceConfig,
    clock: SharedClock,
    rate_limits: HashMap<String, RateLimitConfig>,
    retry_policies: Vec<(ErrorKind, RetryPolicy)>,
    cleanup_interval: Option<Duration>,
}

impl Default for ResilienceRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: ResilienceConfig::default(),
            clock: Arc::new(SystemClock),
            rate_limits: HashMap::new(),
            retry_policies: Vec::new(),
            cleanup_interval: Some(DEFAULT_CLEANUP_INTERVAL),
        }
    }
}

impl ResilienceRuntimeBuilder {
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config_from_str(mut self, s: &str) -> Result<Self> {
        self.config = ResilienceConfig::from_json_str(s)?;
        Ok(self)
    }

    pub fn config_from_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.config = ResilienceConfig::from_file(path)?;
        Ok(self)
    }

    /// Load configuration from the file named by
    /// [`CONFIG_ENV_VAR`](crate::config::CONFIG_ENV_VAR), if set.
    pub fn config_from_env(mut self) -> Result<Self> {
        self.config = ResilienceConfig::from_env()?;
        Ok(self)
    }

    /// Time source for rate-limit windows and error timestamps.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Add or override a rate limit. Applied after the config's own limits.
    pub fn rate_limit(mut self, operation: impl Into<String>, config: RateLimitConfig) -> Self {
        self.rate_limits.insert(operation.into(), config);
        self
    }

    /// Override a retry policy. Applied after the config's own overrides.
    pub fn retry_policy(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.retry_policies.push((kind, policy));
        self
    }

    /// Period of the idle-state cleanup task. Must be non-zero.
    pub fn cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = Some(every);
        self
    }

    /// Do not start the cleanup task; callers run
    /// [`RateLimiter::cleanup`] themselves.
    pub fn without_cleanup_task(mut self) -> Self {
        self.cleanup_interval = None;
        self
    }

    /// Validate everything and wire the components together.
    ///
    /// The cleanup task is only started when called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<ResilienceRuntime>> {
        self.config.validate()?;
        if self.cleanup_interval.is_some_and(|every| every.is_zero()) {
            return Err(ResilienceError::Config(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        let rate_limiter = Arc::new(RateLimiter::new(self.clock.clone()));
        for (operation, limit) in self.config.rate_limits.iter().chain(&self.rate_limits) {
            rate_limiter.set_rate_limit(operation.clone(), limit.clone());
        }

        let recovery = Arc::new(RecoveryManager::new(self.config.recovery.clone()));
        let overrides = self
            .config
            .retry_policies
            .iter()
            .map(|(kind, policy)| (*kind, policy.clone()))
            .chain(self.retry_policies);
        for (kind, policy) in overrides {
            recovery.set_retry_policy(kind, policy)?;
        }

        let handler = Arc::new(ErrorHandler::new(
            self.config.handler.clone(),
            self.clock.clone(),
            recovery.clone(),
            rate_limiter.clone(),
        ));

        match self.cleanup_interval {
            Some(every) if tokio::runtime::Handle::try_current().is_ok() => {
                rate_limiter.start_cleanup_task(every);
            }
            Some(_) => {
                tracing::debug!("No tokio runtime; rate limit cleanup task not started");
            }
            None => {}
        }

        tracing::info!(
            max_concurrent_recoveries = self.config.recovery.max_concurrent_recoveries,
            rate_limits = self.config.rate_limits.len() + self.rate_limits.len(),
            "Resilience runtime ready"
        );

        Ok(Arc::new(ResilienceRuntime {
            config: self.config,
            clock: self.clock,
            rate_limiter,
            recovery,
            handler,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::rate_limit::RateLimitStrategy;

    #[test]
    fn builder_overrides_apply_after_config() {
        let config = ResilienceConfig::from_json_str(
            r#"{ "rate_limits": { "search": { "max_requests": 5, "window_ms": 1000, "strategy": "fixed_window" } } }"#,
        )
        .unwrap();
        let runtime = ResilienceRuntime::builder()
            .config(config)
            .clock(MockClock::fixed())
            .rate_limit(
                "search",
                RateLimitConfig::new(1, Duration::from_secs(1), RateLimitStrategy::SlidingWindow),
            )
            .retry_policy(ErrorKind::Fetch, RetryPolicy::new(1, 1, 1, 1.0, false))
            .build()
            .unwrap();

        let limit = runtime.rate_limiter().rate_limit("search").unwrap();
        assert_eq!(limit.max_requests, 1);
        assert_eq!(runtime.recovery().retry_policy(ErrorKind::Fetch).max_retries, 1);
        // Built-in limits are still present.
        assert!(runtime.rate_limiter().rate_limit("api_fetch").is_some());
    }

    #[test]
    fn invalid_retry_override_fails_build() {
        let result = ResilienceRuntime::builder()
            .retry_policy(ErrorKind::Fetch, RetryPolicy::new(1, 10, 1, 1.0, false))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn builds_outside_tokio() {
        let runtime = ResilienceRuntime::builder().build().unwrap();
        runtime.shutdown();
        assert!(runtime.recovery().is_shutdown());
    }
}
