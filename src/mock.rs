#![allow(dead_code)]

//! Mock operations for unit tests.
//!
//! All types are gated with `#[cfg(test)]`.

use crate::classifier::ClassifiedError;
use crate::recovery::RecoveryOutcome;
use crate::taxonomy::RecoveryStrategy;
use crate::traits::{CustomHandler, Operation};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Operation that fails a scripted number of times, then succeeds.
pub struct FlakyOperation {
    fail_count: AtomicU32,
    always_fail: bool,
    delay: Duration,
    call_count: AtomicU32,
    message: String,
}

impl FlakyOperation {
    pub fn succeeding() -> Self {
        Self {
            fail_count: AtomicU32::new(0),
            always_fail: false,
            delay: Duration::ZERO,
            call_count: AtomicU32::new(0),
            message: "Mock operation failure".to_string(),
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::succeeding()
        }
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = AtomicU32::new(count);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation for FlakyOperation {
    async fn run(&self) -> anyhow::Result<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.always_fail {
            anyhow::bail!("{}", self.message);
        }

        let remaining = self.fail_count.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("{}", self.message);
        }
        Ok(())
    }
}

/// Custom handler returning a fixed result and counting invocations.
pub struct MockCustomHandler {
    fail: bool,
    call_count: AtomicU32,
}

impl MockCustomHandler {
    pub fn new() -> Self {
        Self {
            fail: false,
            call_count: AtomicU32::new(0),
        }
    }

    pub fn with_failure(mut self, fail: bool) -> Self {
        self.fail = fail;
        self
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CustomHandler for MockCustomHandler {
    async fn handle(&self, _error: &ClassifiedError) -> anyhow::Result<RecoveryOutcome> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("Mock custom handler failure");
        }
        Ok(RecoveryOutcome::succeeded(RecoveryStrategy::Ignore))
    }
}
