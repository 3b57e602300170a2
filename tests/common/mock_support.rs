//! Scripted operations and helpers shared by the integration tests.

use async_trait::async_trait;
use realtime_resilience::{
    ClassifiedError, ErrorContext, ErrorKind, MockClock, Operation, RecoveryListener,
    RecoveryManager, RecoveryOutcome, RecoveryStrategy, ResilienceRuntime, RetryPolicy,
};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Operation that fails `fail_count` times, then succeeds.
pub struct ScriptedOperation {
    fail_count: AtomicU32,
    always_fail: bool,
    delay_ms: u64,
    call_count: Arc<AtomicU32>,
    message: String,
}

impl ScriptedOperation {
    pub fn succeeding() -> Self {
        Self {
            fail_count: AtomicU32::new(0),
            always_fail: false,
            delay_ms: 0,
            call_count: Arc::new(AtomicU32::new(0)),
            message: "scripted failure".to_string(),
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

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn with_call_tracker(mut self, tracker: Arc<AtomicU32>) -> Self {
        self.call_count = tracker;
        self
    }

    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operation for ScriptedOperation {
    async fn run(&self) -> anyhow::Result<()> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }

        if self.always_fail {
            anyhow::bail!("{}", self.message);
        }

        if self.fail_count.load(Ordering::SeqCst) > 0 {
            self.fail_count.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("{}", self.message);
        }
        Ok(())
    }
}

/// Custom handler that always reports success with the ignore strategy.
pub struct IgnoringHandler {
    pub calls: AtomicU32,
}

impl IgnoringHandler {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl realtime_resilience::CustomHandler for IgnoringHandler {
    async fn handle(&self, _error: &ClassifiedError) -> anyhow::Result<RecoveryOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RecoveryOutcome::succeeded(RecoveryStrategy::Ignore))
    }
}

/// What a [`RecordingListener`] saw.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryEvent {
    Started {
        channel: String,
        strategy: RecoveryStrategy,
    },
    Finished {
        channel: String,
        strategy: RecoveryStrategy,
        success: bool,
    },
}

/// Recovery listener that records every event. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<RecoveryEvent>>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<RecoveryEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn channel_of(error: &ClassifiedError) -> String {
    error.channel_id().unwrap_or("global").to_string()
}

impl RecoveryListener for RecordingListener {
    fn on_recovery_start(&self, error: &ClassifiedError, strategy: RecoveryStrategy) {
        self.events.lock().unwrap().push(RecoveryEvent::Started {
            channel: channel_of(error),
            strategy,
        });
    }

    fn on_recovery_finish(&self, error: &ClassifiedError, outcome: &RecoveryOutcome) {
        self.events.lock().unwrap().push(RecoveryEvent::Finished {
            channel: channel_of(error),
            strategy: outcome.strategy,
            success: outcome.success,
        });
    }
}

/// Millisecond-scale copy of the default retry table.
pub fn fast_policy(kind: ErrorKind) -> RetryPolicy {
    let default = RetryPolicy::for_kind(kind);
    RetryPolicy::new(default.max_retries, 1, 10, default.backoff_multiplier, false)
}

/// Runtime on a mock clock with fast retry policies and no cleanup task.
pub fn fast_runtime(clock: &MockClock) -> Arc<ResilienceRuntime> {
    let mut builder = ResilienceRuntime::builder()
        .clock(clock.clone())
        .without_cleanup_task();
    for kind in ErrorKind::ALL {
        builder = builder.retry_policy(kind, fast_policy(kind));
    }
    builder.build().unwrap()
}

/// Classified error of `kind` on its own channel.
pub fn error_on(kind: ErrorKind, channel: &str) -> ClassifiedError {
    ClassifiedError::new(
        kind,
        format!("{kind} failure"),
        ErrorContext::default().with_channel(channel),
    )
}

/// Poll until at least `count` recoveries are in flight.
pub async fn wait_for_active(manager: &RecoveryManager, count: usize) {
    for _ in 0..400 {
        if manager.active_recoveries().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} active recoveries");
}

/// Recovery manager with the fast retry table.
pub fn fast_manager(max_concurrent: usize) -> Arc<RecoveryManager> {
    let manager = RecoveryManager::new(realtime_resilience::RecoveryManagerConfig {
        max_concurrent_recoveries: max_concurrent,
        ..Default::default()
    });
    for kind in ErrorKind::ALL {
        manager.set_retry_policy(kind, fast_policy(kind)).unwrap();
    }
    Arc::new(manager)
}
