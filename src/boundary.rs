//! Framework-agnostic error boundary.
//!
//! A presentation layer wraps a component in an [`ErrorBoundary`], feeds it
//! whatever the component raised via [`capture`](ErrorBoundary::capture), and
//! renders from [`view`](ErrorBoundary::view). All decisions are delegated to
//! the [`ErrorHandler`] and its [`RecoveryManager`](crate::RecoveryManager);
//! the boundary only tracks counts and the disabled flag.

use crate::classifier::{ClassifiedError, ErrorContext};
use crate::handler::{ErrorHandler, Failure};
use crate::traits::Operation;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Operation tag attached to failures captured by a boundary.
pub const COMPONENT_RENDER: &str = "component_render";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Captured errors (or failed retries) before the boundary gives up.
    pub max_errors_before_disable: u32,
    /// First automatic retry delay, doubled per retry.
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_errors_before_disable: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
        }
    }
}

/// Snapshot of a boundary.
#[derive(Debug, Clone, Default)]
pub struct BoundaryState {
    pub error: Option<ClassifiedError>,
    pub error_count: u32,
    pub retry_count: u32,
    pub disabled: bool,
}

/// What the presentation layer should render.
#[derive(Debug, Clone)]
pub enum BoundaryView {
    /// No captured error; render the wrapped component.
    Content,
    /// Render a fallback for `error`, offering a retry when `can_retry`.
    Fallback {
        error: ClassifiedError,
        message: &'static str,
        can_retry: bool,
    },
    /// The boundary has given up.
    Disabled { error: ClassifiedError },
}

pub struct ErrorBoundary {
    handler: Arc<ErrorHandler>,
    config: BoundaryConfig,
    state: Mutex<BoundaryState>,
}

impl ErrorBoundary {
    pub fn new(handler: Arc<ErrorHandler>, config: BoundaryConfig) -> Self {
        Self {
            handler,
            config,
            state: Mutex::new(BoundaryState::default()),
        }
    }

    /// Record a failure raised while rendering and route it through the
    /// handler. `rerender` is offered to the handler as the retry target.
    ///
    /// Critical errors are returned as `Err` after bookkeeping so the caller
    /// can propagate them to a supervising layer.
    pub async fn capture(
        &self,
        failure: impl Into<Failure>,
        rerender: Option<&dyn Operation>,
    ) -> std::result::Result<BoundaryView, ClassifiedError> {
        let error = self
            .handler
            .classify(failure, Some(ErrorContext::operation(COMPONENT_RENDER)));

        {
            let mut state = self.lock();
            state.error_count += 1;
            state.disabled = state.error_count >= self.config.max_errors_before_disable;
            state.error = Some(error.clone());
            tracing::error!(
                kind = %error.kind(),
                error_count = state.error_count,
                disabled = state.disabled,
                "Error boundary captured failure"
            );
        }

        let outcome = self
            .handler
            .handle(error.clone(), None, rerender, None)
            .await;
        if outcome.success {
            self.reset();
        }

        if Self::should_propagate(&error) {
            return Err(error);
        }
        Ok(self.view())
    }

    /// Ask the recovery manager to recover the captured error once more.
    /// Returns whether the boundary is clear afterwards.
    pub async fn retry(&self, rerender: Option<&dyn Operation>) -> bool {
        let error = {
            let state = self.lock();
            match &state.error {
                Some(error) if !state.disabled => error.clone(),
                Some(_) => return false,
                None => return true,
            }
        };

        let outcome = self
            .handler
            .recovery_manager()
            .recover(&error, rerender, None)
            .await;
        if outcome.success {
            self.reset();
            return true;
        }

        let mut state = self.lock();
        state.retry_count += 1;
        if state.retry_count >= self.config.max_errors_before_disable {
            state.disabled = true;
        }
        false
    }

    /// Delay before the next automatic retry, or `None` when the boundary
    /// should not retry on its own.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let state = self.lock();
        let error = state.error.as_ref()?;
        if state.disabled
            || state.retry_count >= self.config.max_errors_before_disable
            || !error.is_recoverable()
        {
            return None;
        }
        let delay = self
            .config
            .retry_base_ms
            .saturating_mul(1u64 << state.retry_count.min(32))
            .min(self.config.retry_max_ms);
        Some(Duration::from_millis(delay))
    }

    /// Clear the error, the counters, and the disabled flag.
    pub fn reset(&self) {
        *self.lock() = BoundaryState::default();
    }

    /// A retry is offered only for recoverable errors while enabled.
    pub fn can_retry(&self) -> bool {
        let state = self.lock();
        !state.disabled && state.error.as_ref().is_some_and(|e| e.is_recoverable())
    }

    pub fn should_propagate(error: &ClassifiedError) -> bool {
        error.is_critical()
    }

    pub fn state(&self) -> BoundaryState {
        self.lock().clone()
    }

    pub fn view(&self) -> BoundaryView {
        let state = self.lock();
        match &state.error {
            None => BoundaryView::Content,
            Some(error) if state.disabled => BoundaryView::Disabled {
                error: error.clone(),
            },
            Some(error) => BoundaryView::Fallback {
                error: error.clone(),
                message: error.friendly_message(),
                can_retry: error.is_recoverable(),
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoundaryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
