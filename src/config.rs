//! JSON configuration for the whole resilience runtime.
//!
//! Every section is optional; missing fields take their defaults. Loading
//! always validates, so a [`ResilienceConfig`] obtained from any constructor
//! here is safe to hand to the runtime builder.
//!
//! # Example
//!
//! ```json
//! {
//!   "recovery": { "max_concurrent_recoveries": 5 },
//!   "handler": { "log_level": "warn", "max_log_entries": 50 },
//!   "retry_policies": {
//!     "fetch": { "max_retries": 2, "base_delay_ms": 500, "max_delay_ms": 4000,
//!                "backoff_multiplier": 2.0, "jitter": false }
//!   },
//!   "rate_limits": {
//!     "api_fetch": { "max_requests": 50, "window_ms": 10000, "strategy": "token_bucket" }
//!   }
//! }
//! ```

use crate::error::{Result, ResilienceError};
use crate::handler::ErrorHandlerConfig;
use crate::rate_limit::RateLimitConfig;
use crate::recovery::RecoveryManagerConfig;
use crate::taxonomy::{ErrorKind, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV_VAR: &str = "REALTIME_RESILIENCE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub recovery: RecoveryManagerConfig,
    pub handler: ErrorHandlerConfig,
    /// Per-kind overrides of the default retry table.
    pub retry_policies: BTreeMap<ErrorKind, RetryPolicy>,
    /// Per-operation overrides of, or additions to, the default rate limits.
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        self.recovery.validate()?;
        self.handler.validate()?;
        for (kind, policy) in &self.retry_policies {
            policy.validate().map_err(|e| {
                ResilienceError::Config(format!("Invalid retry policy for '{kind}': {e}"))
            })?;
        }
        for (operation, limit) in &self.rate_limits {
            let multiplier = limit.backoff_multiplier.unwrap_or(1.0);
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ResilienceError::Config(format!(
                    "Rate limit '{operation}' has invalid backoff multiplier {multiplier}"
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| ResilienceError::Config(format!("Invalid resilience config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ResilienceError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&contents)
    }

    /// Load from the file named by [`CONFIG_ENV_VAR`], or defaults when the
    /// variable is unset or empty.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => {
                tracing::debug!(path = %path, "Loading resilience config from environment");
                Self::from_file(path.trim())
            }
            _ => Ok(Self::default()),
        }
    }
}
