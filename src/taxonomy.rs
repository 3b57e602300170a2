//! The failure taxonomy and its fixed policy tables.
//!
//! Every [`ErrorKind`] maps to exactly one [`Severity`], one retryability flag,
//! one [`RecoveryStrategy`], and one default [`RetryPolicy`]. These lookups are
//! the whole policy: a classified error never carries values that disagree
//! with its kind.

use crate::error::{Result, ResilienceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification category assigned to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Channel or socket could not be established, or dropped.
    Connection,
    /// The backend throttled the client.
    RateLimit,
    /// Credentials were rejected or expired.
    Authentication,
    /// The client is misconfigured (unknown tenant, bad table, etc.).
    Configuration,
    /// A request/response fetch failed.
    Fetch,
    /// A periodic poll failed.
    Polling,
    /// A live subscription could not be joined or was dropped.
    Subscription,
    /// The network itself is unavailable.
    Network,
    /// An operation did not finish in time.
    Timeout,
    /// Input or payload did not have the expected shape.
    Validation,
    /// Nothing else matched.
    Unknown,
}

impl ErrorKind {
    /// All kinds in classification order.
    pub const ALL: [ErrorKind; 11] = [
        ErrorKind::Connection,
        ErrorKind::RateLimit,
        ErrorKind::Authentication,
        ErrorKind::Configuration,
        ErrorKind::Fetch,
        ErrorKind::Polling,
        ErrorKind::Subscription,
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::Validation,
        ErrorKind::Unknown,
    ];

    /// Fixed severity for this kind.
    pub const fn severity(self) -> Severity {
        match self {
            Self::Connection | Self::Authentication | Self::Subscription | Self::Network => {
                Severity::High
            }
            Self::RateLimit | Self::Fetch | Self::Timeout | Self::Unknown => Severity::Medium,
            Self::Configuration | Self::Validation => Severity::Critical,
            Self::Polling => Severity::Low,
        }
    }

    /// Whether failures of this kind may succeed when attempted again.
    pub const fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Authentication | Self::Configuration | Self::Validation
        )
    }

    /// Fixed recovery strategy for this kind.
    pub const fn strategy(self) -> RecoveryStrategy {
        match self {
            Self::Connection | Self::RateLimit | Self::Network => {
                RecoveryStrategy::ExponentialBackoff
            }
            Self::Authentication | Self::Configuration | Self::Validation => {
                RecoveryStrategy::Escalate
            }
            Self::Fetch | Self::Subscription | Self::Timeout | Self::Unknown => {
                RecoveryStrategy::Retry
            }
            Self::Polling => RecoveryStrategy::Fallback,
        }
    }

    /// User-facing description suitable for a status banner.
    pub const fn friendly_message(self) -> &'static str {
        match self {
            Self::Connection => "Connection problem. Trying to reconnect...",
            Self::RateLimit => "Too many requests. Waiting before trying again...",
            Self::Authentication => "Authentication failed. Please check your credentials.",
            Self::Configuration => "Configuration error. Please check the parameters.",
            Self::Fetch => "Failed to load data. Trying again...",
            Self::Polling => "Automatic refresh failed.",
            Self::Subscription => "Live connection error.",
            Self::Network => "Network problem. Please check your connection.",
            Self::Timeout => "The operation took too long. Trying again...",
            Self::Validation => "Invalid data was provided.",
            Self::Unknown => "Unexpected error. Trying to resolve...",
        }
    }

    /// Stable snake_case label, used for metrics and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Fetch => "fetch",
            Self::Polling => "polling",
            Self::Subscription => "subscription",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How badly a failure affects the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Does not affect critical functionality.
    Low,
    /// Affects functionality but is recoverable.
    Medium,
    /// Affects critical functionality.
    High,
    /// The system is not functional.
    Critical,
}

impl Severity {
    /// All severities, lowest first.
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Stable lowercase label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery policy bound to a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-run the operation with a fixed delay between attempts.
    Retry,
    /// Re-run the operation with exponentially growing delays.
    ExponentialBackoff,
    /// Run the caller's fallback once.
    Fallback,
    /// Signal that the failure can be ignored.
    Ignore,
    /// Hand the failure back to the caller unchanged.
    Escalate,
    /// Signal that the caller must reset its state.
    Reset,
    /// Signal that the caller must disable the feature.
    Disable,
}

impl RecoveryStrategy {
    /// Stable snake_case label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::ExponentialBackoff => "exponential_backoff",
            Self::Fallback => "fallback",
            Self::Ignore => "ignore",
            Self::Escalate => "escalate",
            Self::Reset => "reset",
            Self::Disable => "disable",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry and backoff parameters for one kind.
///
/// # Example JSON
///
/// ```json
/// { "max_retries": 5, "base_delay_ms": 1000, "max_delay_ms": 30000,
///   "backoff_multiplier": 2.0, "jitter": true }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of operation attempts.
    pub max_retries: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt by exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to computed delays.
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from its raw parameters.
    pub const fn new(
        max_retries: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier,
            jitter,
        }
    }

    /// Default policy for `kind`.
    pub const fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Connection => Self::new(5, 1_000, 30_000, 2.0, true),
            ErrorKind::RateLimit => Self::new(3, 5_000, 60_000, 2.0, true),
            ErrorKind::Authentication => Self::new(1, 1_000, 5_000, 1.0, false),
            ErrorKind::Configuration => Self::new(0, 0, 0, 1.0, false),
            ErrorKind::Fetch => Self::new(3, 2_000, 15_000, 1.5, true),
            ErrorKind::Polling => Self::new(2, 3_000, 10_000, 1.5, true),
            ErrorKind::Subscription => Self::new(3, 2_000, 20_000, 2.0, true),
            ErrorKind::Network => Self::new(4, 1_500, 25_000, 2.0, true),
            ErrorKind::Timeout => Self::new(3, 2_000, 15_000, 1.8, true),
            ErrorKind::Validation => Self::new(0, 0, 0, 1.0, false),
            ErrorKind::Unknown => Self::new(2, 3_000, 10_000, 2.0, true),
        }
    }

    /// Check `base <= max` and a finite multiplier of at least 1.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ResilienceError::Config(format!(
                "Retry base delay {}ms exceeds max delay {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ResilienceError::Config(format!(
                "Backoff multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Delay used by the fixed-delay retry strategy: the base delay plus up to
    /// one second of jitter, capped at the max delay. `jitter_unit` is a sample
    /// in `[0, 1)`.
    pub fn fixed_delay(&self, jitter_unit: f64) -> Duration {
        let mut delay = self.base_delay_ms as f64;
        if self.jitter {
            delay += jitter_unit * 1_000.0;
        }
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay before retry number `attempt` (0-based) under exponential backoff:
    /// `base * multiplier^attempt`, plus up to 10% jitter, capped at the max
    /// delay.
    pub fn backoff_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        if self.jitter {
            delay += jitter_unit * delay * 0.1;
        }
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}
