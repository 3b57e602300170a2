//! Tests for failure classification and the taxonomy tables

use realtime_resilience::classifier::{classify_kind, kind_for_provider_code};
use realtime_resilience::{
    ClassifiedError, Clock, ErrorContext, ErrorKind, FailureClass, MockClock, RawError,
    RecoveryStrategy, Severity, classify,
};

fn classify_at(raw: RawError, context: Option<ErrorContext>) -> ClassifiedError {
    classify(raw, context, &MockClock::fixed())
}

#[test]
fn test_provider_codes_map_to_kinds() {
    let cases = [
        ("UnableToConnectToProject", ErrorKind::Connection),
        ("RealtimeRestarting", ErrorKind::Connection),
        ("ChannelRateLimitReached", ErrorKind::RateLimit),
        ("JwtSignatureError", ErrorKind::Authentication),
        ("MalformedJWT", ErrorKind::Authentication),
        ("TenantNotFound", ErrorKind::Configuration),
        ("TimeoutOnRpcCall", ErrorKind::Timeout),
    ];
    for (code, kind) in cases {
        assert_eq!(kind_for_provider_code(code), Some(kind), "code {code}");
    }
    assert_eq!(kind_for_provider_code("NotARealCode"), None);
}

#[test]
fn test_message_patterns() {
    let cases = [
        ("WebSocket error: handshake rejected", ErrorKind::Connection),
        ("Too many requests, slow down", ErrorKind::RateLimit),
        ("JWT expired at 12:00", ErrorKind::Authentication),
        ("Missing parameter: table", ErrorKind::Configuration),
        ("Fetch failed: 502 Bad Gateway", ErrorKind::Fetch),
        ("poll failed after restart", ErrorKind::Polling),
        ("Subscription failed for shifts", ErrorKind::Subscription),
        ("Device is offline", ErrorKind::Network),
        ("Operation timed out", ErrorKind::Timeout),
        ("Validation error: name is required", ErrorKind::Validation),
        ("the flux capacitor melted", ErrorKind::Unknown),
    ];
    for (message, kind) in cases {
        assert_eq!(
            classify_at(RawError::new(message), None).kind(),
            kind,
            "message {message:?}"
        );
    }
}

#[test]
fn test_patterns_are_case_insensitive() {
    assert_eq!(
        classify_at(RawError::new("UNAUTHORIZED"), None).kind(),
        ErrorKind::Authentication
    );
    assert_eq!(
        classify_at(RawError::new("Socket Closed"), None).kind(),
        ErrorKind::Connection
    );
}

#[test]
fn test_status_only_matches_when_message_is_silent() {
    // Message says fetch, status says auth: message wins.
    let raw = RawError::new("request failed").with_status(401);
    assert_eq!(classify_at(raw, None).kind(), ErrorKind::Fetch);

    let raw = RawError::new("no details").with_status(429);
    assert_eq!(classify_at(raw, None).kind(), ErrorKind::RateLimit);
}

#[test]
fn test_failure_class_hint() {
    let cases = [
        (FailureClass::TypeMismatch, ErrorKind::Validation),
        (FailureClass::UndefinedReference, ErrorKind::Configuration),
        (FailureClass::Aborted, ErrorKind::Timeout),
        (FailureClass::NetworkFailure, ErrorKind::Network),
    ];
    for (class, kind) in cases {
        let raw = RawError::new("something odd").with_class(class);
        assert_eq!(classify_at(raw, None).kind(), kind, "class {class:?}");
    }
}

#[test]
fn test_operation_context_is_last_resort() {
    let cases = [
        ("fetch", ErrorKind::Fetch),
        ("subscribe", ErrorKind::Subscription),
        ("poll", ErrorKind::Polling),
        ("render", ErrorKind::Unknown),
    ];
    for (operation, kind) in cases {
        let error = classify_at(
            RawError::new("something odd"),
            Some(ErrorContext::operation(operation)),
        );
        assert_eq!(error.kind(), kind, "operation {operation}");
    }

    // A matching message beats the context tag.
    let error = classify_at(
        RawError::new("Unauthorized"),
        Some(ErrorContext::operation("poll")),
    );
    assert_eq!(error.kind(), ErrorKind::Authentication);
}

#[test]
fn test_classified_error_agrees_with_its_kind() {
    for kind in ErrorKind::ALL {
        let error = ClassifiedError::new(kind, "x", ErrorContext::default());
        assert_eq!(error.severity(), kind.severity());
        assert_eq!(error.is_retryable(), kind.is_retryable());
        assert_eq!(error.strategy(), kind.strategy());
        assert_eq!(error.friendly_message(), kind.friendly_message());
        assert_eq!(error.is_critical(), kind.severity() == Severity::Critical);
    }
}

#[test]
fn test_polling_is_low_severity_fallback() {
    let error = classify_at(RawError::new("polling error"), None);
    assert_eq!(error.severity(), Severity::Low);
    assert_eq!(error.strategy(), RecoveryStrategy::Fallback);
    assert!(error.is_recoverable());
}

#[test]
fn test_context_is_preserved() {
    let context = ErrorContext::operation("subscribe")
        .with_channel("shifts:region-1")
        .with_table("shifts");
    let error = classify_at(RawError::new("channel error").with_code("X-1"), Some(context));

    assert_eq!(error.channel_id(), Some("shifts:region-1"));
    assert_eq!(error.context().table.as_deref(), Some("shifts"));
    assert_eq!(error.code(), Some("X-1"));
    assert_eq!(error.to_string(), "[subscription] channel error");
}

#[test]
fn test_explicit_timestamp_is_kept() {
    let clock = MockClock::fixed();
    let earlier = clock.now() - chrono::Duration::minutes(5);
    let error = classify(
        RawError::new("x"),
        Some(ErrorContext::default().at(earlier)),
        &clock,
    );
    assert_eq!(error.timestamp(), earlier);
}

#[test]
fn test_summary_is_serializable() {
    let error = classify_at(
        RawError::new("Fetch failed"),
        Some(ErrorContext::operation("fetch").with_endpoint("/shifts")),
    );
    let json = serde_json::to_value(error.summary()).unwrap();
    assert_eq!(json["kind"], "fetch");
    assert_eq!(json["severity"], "medium");
    assert_eq!(json["retryable"], true);
    assert_eq!(json["strategy"], "retry");
}

#[test]
fn test_anyhow_wrapped_io_error_keeps_hint() {
    let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read stalled");
    let raw: RawError = anyhow::Error::new(io).into();
    assert_eq!(raw.class, FailureClass::TimedOut);
    assert_eq!(
        classify_kind(&raw, &ErrorContext::default()),
        ErrorKind::Timeout
    );
    assert!(raw.source.is_some());
}

#[test]
fn test_json_error_is_validation() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    assert_eq!(classify_at(err.into(), None).kind(), ErrorKind::Validation);
}

#[test]
fn test_connection_failed_is_high_severity_backoff() {
    let error = classify_at(RawError::new("Connection failed"), None);
    assert_eq!(error.kind(), ErrorKind::Connection);
    assert_eq!(error.severity(), Severity::High);
    assert!(error.is_retryable());
    assert_eq!(error.strategy(), RecoveryStrategy::ExponentialBackoff);
}

#[test]
fn test_unauthorized_escalates() {
    let error = classify_at(RawError::new("Unauthorized"), None);
    assert_eq!(error.kind(), ErrorKind::Authentication);
    assert!(!error.is_retryable());
    assert_eq!(error.strategy(), RecoveryStrategy::Escalate);
}

#[test]
fn test_policy_table() {
    use RecoveryStrategy::{Escalate, ExponentialBackoff, Fallback, Retry};
    use Severity::{Critical, High, Low, Medium};

    let table = [
        (ErrorKind::Connection, High, true, ExponentialBackoff),
        (ErrorKind::RateLimit, Medium, true, ExponentialBackoff),
        (ErrorKind::Authentication, High, false, Escalate),
        (ErrorKind::Configuration, Critical, false, Escalate),
        (ErrorKind::Fetch, Medium, true, Retry),
        (ErrorKind::Polling, Low, true, Fallback),
        (ErrorKind::Subscription, High, true, Retry),
        (ErrorKind::Network, High, true, ExponentialBackoff),
        (ErrorKind::Timeout, Medium, true, Retry),
        (ErrorKind::Validation, Critical, false, Escalate),
        (ErrorKind::Unknown, Medium, true, Retry),
    ];
    assert_eq!(table.len(), ErrorKind::ALL.len());

    for (kind, severity, retryable, strategy) in table {
        let first = ClassifiedError::new(kind, "first", ErrorContext::default());
        let second = ClassifiedError::new(kind, "second", ErrorContext::operation("poll"));
        for error in [first, second] {
            assert_eq!(error.severity(), severity, "{kind}");
            assert_eq!(error.is_retryable(), retryable, "{kind}");
            assert_eq!(error.strategy(), strategy, "{kind}");
        }
    }
}
