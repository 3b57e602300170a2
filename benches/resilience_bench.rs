use criterion::{Criterion, criterion_group, criterion_main};
use realtime_resilience::rate_limit::{API_FETCH, REALTIME_CONNECTION};
use realtime_resilience::{
    ErrorContext, ErrorKind, MockClock, RawError, RecoveryManager, ResilienceRuntime, RetryPolicy,
    SystemClock, classify,
};
use std::hint::black_box;
use tokio::runtime::Runtime;

fn bench_classify(c: &mut Criterion) {
    let clock = SystemClock;

    c.bench_function("classify_provider_code", |b| {
        b.iter(|| {
            classify(
                black_box(RawError::new("channel closed").with_code("RealtimeRestarting")),
                None,
                &clock,
            )
        })
    });

    // Worst case: no pattern matches, falls through every kind.
    c.bench_function("classify_unmatched_message", |b| {
        b.iter(|| {
            classify(
                black_box(RawError::new("the flux capacitor melted")),
                Some(ErrorContext::operation("render")),
                &clock,
            )
        })
    });
}

fn bench_rate_limit(c: &mut Criterion) {
    let runtime = ResilienceRuntime::builder()
        .clock(MockClock::fixed())
        .without_cleanup_task()
        .build()
        .unwrap();

    c.bench_function("check_limit_token_bucket", |b| {
        b.iter(|| runtime.check_rate_limit(black_box(API_FETCH), Some("bench")))
    });

    for i in 0..50 {
        runtime.record_request(REALTIME_CONNECTION, Some(&format!("ch-{}", i % 5)));
    }
    c.bench_function("check_limit_sliding_window", |b| {
        b.iter(|| runtime.check_rate_limit(black_box(REALTIME_CONNECTION), Some("ch-0")))
    });
}

fn bench_recover(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let manager = RecoveryManager::default();
    manager
        .set_retry_policy(ErrorKind::Fetch, RetryPolicy::new(3, 0, 0, 1.0, false))
        .unwrap();
    let op = || async { Ok::<_, anyhow::Error>(()) };

    c.bench_function("recover_retry_first_attempt", |b| {
        b.to_async(&rt).iter(|| async {
            let error = realtime_resilience::ClassifiedError::new(
                ErrorKind::Fetch,
                "fetch failed",
                ErrorContext::default(),
            );
            manager.recover(&error, Some(&op), None).await
        })
    });
}

criterion_group!(benches, bench_classify, bench_rate_limit, bench_recover);
criterion_main!(benches);
