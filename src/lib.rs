//! Failure classification, recovery strategies, and rate limiting for
//! live-synchronization clients.
//!
//! Live channels fail in many ways: sockets drop, the backend throttles,
//! tokens expire, a poll times out. This crate turns each failure into a
//! canonical [`ClassifiedError`] whose kind fixes its severity, retryability,
//! and recovery strategy, then executes that strategy under a global
//! concurrency cap and a multi-strategy rate limiter.
//!
//! # Key concepts
//!
//! - **[`classify`](classifier::classify)**: pure mapping from a raw failure
//!   (provider code, message, HTTP status, error class, context tag) to a
//!   [`ClassifiedError`].
//! - **[`RateLimiter`]**: fixed window, sliding window, token bucket, and
//!   backoff-on-error admission keyed by `operation[:instance]`.
//! - **[`RecoveryManager`]**: runs retry, exponential backoff, fallback,
//!   reset, disable, ignore, or escalate for a classified error.
//! - **[`ErrorHandler`]**: the single entry point; classifies, counts, logs,
//!   notifies listeners, throttles, and recovers.
//! - **[`ResilienceRuntime`]**: builds and owns the three services above.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use realtime_resilience::{ErrorContext, ResilienceRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = ResilienceRuntime::builder().build()?;
//!
//! let resubscribe = || async {
//!     // re-join the channel here
//!     Ok::<_, anyhow::Error>(())
//! };
//! let outcome = runtime
//!     .handle(
//!         "websocket error: socket closed",
//!         Some(ErrorContext::operation("subscribe").with_channel("shifts:region-1")),
//!         Some(&resubscribe),
//!         None,
//!     )
//!     .await;
//! assert!(outcome.success);
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod boundary;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod rate_limit;
pub mod recovery;
pub mod runtime;
pub mod taxonomy;
pub mod traits;

#[cfg(test)]
mod mock;

pub use boundary::{BoundaryConfig, BoundaryView, ErrorBoundary};
pub use classifier::{ClassifiedError, ErrorContext, FailureClass, RawError, classify};
pub use clock::{Clock, MockClock, SharedClock, SystemClock};
pub use config::ResilienceConfig;
pub use error::{ResilienceError, Result};
pub use handler::{ErrorHandler, ErrorHandlerConfig, ErrorMetrics, Failure, LogLevel};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitStrategy, RateLimiter};
pub use recovery::{
    RecoveryListenerId, RecoveryManager, RecoveryManagerConfig, RecoveryOutcome, RecoverySignal,
};
pub use runtime::{ResilienceRuntime, ResilienceRuntimeBuilder};
pub use taxonomy::{ErrorKind, RecoveryStrategy, RetryPolicy, Severity};
pub use traits::{CustomHandler, ErrorListener, Operation, RecoveryListener};
