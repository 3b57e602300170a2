//! Turns arbitrary failures into canonical [`ClassifiedError`] records.
//!
//! Classification is a pure function of the raw failure, its context, and two
//! fixed tables (provider codes and message patterns). The first matching
//! rule wins:
//!
//! 1. provider code lookup (see [`kind_for_provider_code`]),
//! 2. ordered, case-insensitive message patterns per kind (an HTTP status is
//!    matched as its decimal text),
//! 3. the failure class heuristic ([`FailureClass`]),
//! 4. the `operation` tag in the [`ErrorContext`],
//! 5. [`ErrorKind::Unknown`].

use crate::clock::Clock;
use crate::taxonomy::{ErrorKind, RecoveryStrategy, Severity};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Message used when a raw failure carries no text.
pub const DEFAULT_MESSAGE: &str = "unknown error";

/// Coarse shape of a failure, independent of its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailureClass {
    /// A value had the wrong type or shape.
    TypeMismatch,
    /// A name, symbol, or resource could not be resolved.
    UndefinedReference,
    /// The operation was aborted or cancelled.
    Aborted,
    /// A network-level failure (refused, reset, unreachable).
    NetworkFailure,
    /// The operation timed out.
    TimedOut,
    /// No structural hint.
    #[default]
    Other,
}

impl FailureClass {
    fn kind(self) -> Option<ErrorKind> {
        match self {
            Self::TypeMismatch => Some(ErrorKind::Validation),
            Self::UndefinedReference => Some(ErrorKind::Configuration),
            Self::Aborted | Self::TimedOut => Some(ErrorKind::Timeout),
            Self::NetworkFailure => Some(ErrorKind::Network),
            Self::Other => None,
        }
    }
}

/// A failure as reported by a caller, before classification.
#[derive(Debug, Clone, Default)]
pub struct RawError {
    /// Human-readable message.
    pub message: Option<String>,
    /// Provider-specific error code (e.g. `"TenantNotFound"`).
    pub code: Option<String>,
    /// HTTP status code, if the failure came from an HTTP exchange.
    pub status: Option<u16>,
    /// Structural hint about the failure.
    pub class: FailureClass,
    /// Original error, retained for diagnostics only.
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl RawError {
    /// Raw failure carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach a provider code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach an HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a failure class hint.
    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }

    /// Attach the original error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The message, or [`DEFAULT_MESSAGE`] when absent or empty.
    pub fn message_or_default(&self) -> &str {
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => DEFAULT_MESSAGE,
        }
    }
}

impl From<&str> for RawError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for RawError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for RawError {
    fn from(err: anyhow::Error) -> Self {
        // A wrapped io/json/elapsed error keeps its structural hint.
        let class = if let Some(io) = err.downcast_ref::<std::io::Error>() {
            io_failure_class(io.kind())
        } else if err.downcast_ref::<serde_json::Error>().is_some() {
            FailureClass::TypeMismatch
        } else if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            FailureClass::TimedOut
        } else {
            FailureClass::Other
        };
        let source: Box<dyn std::error::Error + Send + Sync> = err.into();
        Self {
            message: Some(source.to_string()),
            class,
            source: Some(Arc::from(source)),
            ..Default::default()
        }
    }
}

impl From<std::io::Error> for RawError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
            .with_class(io_failure_class(err.kind()))
            .with_source(err)
    }
}

impl From<serde_json::Error> for RawError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
            .with_class(FailureClass::TypeMismatch)
            .with_source(err)
    }
}

impl From<tokio::time::error::Elapsed> for RawError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(err.to_string())
            .with_class(FailureClass::TimedOut)
            .with_source(err)
    }
}

fn io_failure_class(kind: std::io::ErrorKind) -> FailureClass {
    use std::io::ErrorKind as Io;
    match kind {
        Io::TimedOut => FailureClass::TimedOut,
        Io::Interrupted => FailureClass::Aborted,
        Io::InvalidData | Io::InvalidInput => FailureClass::TypeMismatch,
        Io::NotFound => FailureClass::UndefinedReference,
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::AddrNotAvailable => FailureClass::NetworkFailure,
        _ => FailureClass::Other,
    }
}

/// Caller-supplied hints about where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Operation name, e.g. `"fetch"`, `"subscribe"`, `"poll"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Live channel or instance identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Endpoint that was called.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Table the operation touched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// When the failure was observed. Filled from the clock when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Session identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// User identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ErrorContext {
    /// Context tagged with an operation name.
    pub fn operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    /// Attach a channel id.
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Attach an endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Attach a table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach an explicit timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Canonical, immutable failure record.
///
/// Severity, retryability, and strategy are not stored: they are derived
/// from [`kind`](Self::kind) on every access.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    context: ErrorContext,
    timestamp: DateTime<Utc>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ClassifiedError {
    /// Build a record of a known kind directly.
    pub fn new(kind: ErrorKind, message: impl Into<String>, context: ErrorContext) -> Self {
        let timestamp = context.timestamp.unwrap_or_else(Utc::now);
        Self {
            kind,
            message: message.into(),
            code: None,
            context: ErrorContext {
                timestamp: Some(timestamp),
                ..context
            },
            timestamp,
            cause: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.kind.strategy()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.context.channel_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The original failure, for diagnostics only.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Retryable and not critical.
    pub fn is_recoverable(&self) -> bool {
        self.is_retryable() && self.severity() != Severity::Critical
    }

    pub fn is_critical(&self) -> bool {
        self.severity() == Severity::Critical
    }

    /// User-facing description for this error's kind.
    pub fn friendly_message(&self) -> &'static str {
        self.kind.friendly_message()
    }

    /// Flat, serializable view for logs and dashboards.
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind,
            severity: self.severity(),
            retryable: self.is_retryable(),
            strategy: self.strategy(),
            message: self.message.clone(),
            code: self.code.clone(),
            channel_id: self.context.channel_id.clone(),
            timestamp: self.timestamp,
            context: self.context.clone(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Serializable projection of a [`ClassifiedError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub strategy: RecoveryStrategy,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub context: ErrorContext,
}

/// Kind assigned to a provider-specific error code, if the code is known.
pub fn kind_for_provider_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "UnableToConnectToProject" | "RealtimeRestarting" | "DatabaseConnectionIssue" => {
            ErrorKind::Connection
        }
        "ConnectionRateLimitReached" | "ChannelRateLimitReached" | "ClientJoinRateLimitReached" => {
            ErrorKind::RateLimit
        }
        "UnableToSetPolicies" | "InvalidJWTExpiration" | "JwtSignatureError" | "Unauthorized"
        | "MalformedJWT" => ErrorKind::Authentication,
        "TenantNotFound" => ErrorKind::Configuration,
        "TimeoutOnRpcCall" => ErrorKind::Timeout,
        _ => return None,
    };
    Some(kind)
}

/// Ordered message patterns; the first kind with a matching pattern wins.
const MESSAGE_PATTERNS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Connection,
        &[
            r"(?i)connection.*failed",
            r"(?i)websocket.*error",
            r"(?i)network.*error",
            r"(?i)unable.*connect",
            r"(?i)connection.*lost",
            r"(?i)connection.*timeout",
            r"(?i)socket.*closed",
        ],
    ),
    (
        ErrorKind::RateLimit,
        &[
            r"(?i)rate.*limit",
            r"(?i)too.*many.*requests",
            r"(?i)quota.*exceeded",
            r"(?i)throttle",
            r"429",
        ],
    ),
    (
        ErrorKind::Authentication,
        &[
            r"(?i)unauthorized",
            r"(?i)authentication.*failed",
            r"(?i)invalid.*token",
            r"(?i)jwt.*expired",
            r"(?i)access.*denied",
            r"401",
            r"403",
        ],
    ),
    (
        ErrorKind::Configuration,
        &[
            r"(?i)configuration.*error",
            r"(?i)invalid.*config",
            r"(?i)missing.*parameter",
            r"(?i)invalid.*table",
            r"(?i)schema.*error",
        ],
    ),
    (
        ErrorKind::Fetch,
        &[
            r"(?i)fetch.*failed",
            r"(?i)http.*error",
            r"(?i)request.*failed",
            r"(?i)api.*error",
            r"500",
            r"502",
            r"503",
            r"504",
        ],
    ),
    (
        ErrorKind::Polling,
        &[
            r"(?i)polling.*error",
            r"(?i)poll.*failed",
            r"(?i)interval.*error",
        ],
    ),
    (
        ErrorKind::Subscription,
        &[
            r"(?i)subscription.*failed",
            r"(?i)channel.*error",
            r"(?i)subscribe.*error",
            r"(?i)realtime.*error",
        ],
    ),
    (
        ErrorKind::Network,
        &[
            r"(?i)network.*unavailable",
            r"(?i)offline",
            r"(?i)no.*internet",
            r"(?i)dns.*error",
            r"(?i)host.*unreachable",
        ],
    ),
    (
        ErrorKind::Timeout,
        &[
            r"(?i)timeout",
            r"(?i)timed.*out",
            r"(?i)request.*timeout",
            r"(?i)operation.*timeout",
        ],
    ),
    (
        ErrorKind::Validation,
        &[
            r"(?i)validation.*error",
            r"(?i)invalid.*input",
            r"(?i)schema.*validation",
            r"(?i)type.*error",
        ],
    ),
];

static COMPILED_PATTERNS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    MESSAGE_PATTERNS
        .iter()
        .flat_map(|(kind, patterns)| {
            patterns
                .iter()
                // Patterns are literals covered by tests.
                .filter_map(move |p| Regex::new(p).ok().map(|re| (*kind, re)))
        })
        .collect()
});

/// Kind whose message patterns match `text`, if any.
pub fn kind_for_message(text: &str) -> Option<ErrorKind> {
    COMPILED_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
}

fn kind_for_context(context: &ErrorContext) -> Option<ErrorKind> {
    match context.operation.as_deref()? {
        "fetch" => Some(ErrorKind::Fetch),
        "subscribe" => Some(ErrorKind::Subscription),
        "poll" => Some(ErrorKind::Polling),
        _ => None,
    }
}

/// Assign a kind to a raw failure. Never fails; ambiguous input yields
/// [`ErrorKind::Unknown`].
pub fn classify_kind(raw: &RawError, context: &ErrorContext) -> ErrorKind {
    if let Some(kind) = raw.code.as_deref().and_then(kind_for_provider_code) {
        return kind;
    }

    let message = raw.message_or_default();
    if let Some(kind) = kind_for_message(message) {
        return kind;
    }
    if let Some(kind) = raw.status.and_then(|s| kind_for_message(&s.to_string())) {
        return kind;
    }

    if let Some(kind) = raw.class.kind() {
        return kind;
    }

    kind_for_context(context).unwrap_or(ErrorKind::Unknown)
}

/// Classify `raw` in `context`, stamping the record with `clock` when the
/// context carries no timestamp.
pub fn classify(raw: RawError, context: Option<ErrorContext>, clock: &dyn Clock) -> ClassifiedError {
    let mut context = context.unwrap_or_default();
    let timestamp = *context.timestamp.get_or_insert_with(|| clock.now());
    let kind = classify_kind(&raw, &context);
    let message = raw.message_or_default().to_string();

    ClassifiedError {
        kind,
        message,
        code: raw.code,
        context,
        timestamp,
        cause: raw.source,
    }
}
