//! Seams between the resilience core and the code it protects.
//!
//! The core never knows what an operation does: a re-subscribe, a re-fetch,
//! or a cached read all look the same through [`Operation`]. Closures
//! returning an owned future of `anyhow::Result<T>` implement it
//! automatically; clone what the future needs into it.

use crate::classifier::ClassifiedError;
use crate::recovery::RecoveryOutcome;
use crate::taxonomy::RecoveryStrategy;
use async_trait::async_trait;
use std::future::Future;

/// A fallible unit of work the core may invoke during recovery, either as the
/// retried operation or as the fallback.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Run the operation once. Any error counts as a failed attempt.
    async fn run(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut, T> Operation for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self)().await.map(|_| ())
    }
}

/// Replaces default recovery for one [`ErrorKind`](crate::taxonomy::ErrorKind).
///
/// Registered with
/// [`ErrorHandler::set_custom_handler`](crate::handler::ErrorHandler::set_custom_handler).
/// Returning `Err` makes the handler log the failure and fall back to
/// default recovery.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    /// Decide how to recover from `error`.
    async fn handle(&self, error: &ClassifiedError) -> anyhow::Result<RecoveryOutcome>;
}

/// Passive observer notified of every handled error.
///
/// Listeners run synchronously on the handling task; a panicking listener is
/// caught and logged.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, error: &ClassifiedError);
}

impl<F> ErrorListener for F
where
    F: Fn(&ClassifiedError) + Send + Sync,
{
    fn on_error(&self, error: &ClassifiedError) {
        (self)(error)
    }
}

/// Observer of recovery attempts and their outcomes.
///
/// Registered with
/// [`RecoveryManager::add_recovery_listener`](crate::recovery::RecoveryManager::add_recovery_listener)
/// to see every strategy the manager runs, or with
/// [`ErrorHandler::add_recovery_listener`](crate::handler::ErrorHandler::add_recovery_listener)
/// to see the final outcome of each handled error, custom handlers and
/// throttled attempts included. Panics are caught and logged.
pub trait RecoveryListener: Send + Sync {
    /// An admitted recovery is about to run `strategy`.
    fn on_recovery_start(&self, _error: &ClassifiedError, _strategy: RecoveryStrategy) {}

    /// A recovery finished, successfully or not. Rejected recoveries (cap,
    /// duplicate) are reported here without a preceding start.
    fn on_recovery_finish(&self, error: &ClassifiedError, outcome: &RecoveryOutcome);
}

impl<F> RecoveryListener for F
where
    F: Fn(&ClassifiedError, &RecoveryOutcome) + Send + Sync,
{
    fn on_recovery_finish(&self, error: &ClassifiedError, outcome: &RecoveryOutcome) {
        (self)(error, outcome)
    }
}
