//! Error types for ForgeFlow operations.
//!
//! This module defines the canonical error type used throughout ForgeFlow.
//! All subsystems return `Result<T, ForgeFlowError>`, and every fault carries
//! an [`ErrorKind`] from a closed taxonomy. Retry, breaker, and DLQ decisions
//! inspect only the kind, never the message.

use std::io;
use thiserror::Error;

/// Coarse failure category for a taxonomy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected to succeed on a later attempt.
    Transient,
    /// Will not succeed without operator or caller intervention.
    Permanent,
    /// Durable state is suspect; the current operation must abort.
    Fatal,
    /// Refused by a gate (safe mode, open breaker) before execution.
    Refused,
}

/// Closed set of ForgeFlow error kinds.
///
/// The wire names (`PROVIDER_RATE_LIMIT`, ...) are stable: they appear in DLQ
/// entries, audit events, and operator-facing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProviderRateLimit,
    NetworkTimeout,
    Transient5xx,
    ServiceUnavailable,
    InvalidCredentials,
    NotFound,
    SchemaInvalid,
    LockTimeout,
    WalIntegrity,
    SafeModeReadOnly,
    CircuitBreakerOpen,
    OperationFailed,
}

impl ErrorKind {
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::ProviderRateLimit | Self::NetworkTimeout | Self::Transient5xx => {
                ErrorCategory::Transient
            }
            // Transient in origin, but it is the breaker-open signal and must
            // not be retried by the same invocation.
            Self::ServiceUnavailable => ErrorCategory::Transient,
            Self::InvalidCredentials
            | Self::NotFound
            | Self::SchemaInvalid
            | Self::LockTimeout
            | Self::OperationFailed => ErrorCategory::Permanent,
            Self::WalIntegrity => ErrorCategory::Fatal,
            Self::SafeModeReadOnly | Self::CircuitBreakerOpen => ErrorCategory::Refused,
        }
    }

    /// Whether the retry layer may re-attempt an operation that failed with
    /// this kind.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimit | Self::NetworkTimeout | Self::Transient5xx
        )
    }

    /// Stable wire name used in persisted records and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderRateLimit => "PROVIDER_RATE_LIMIT",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::Transient5xx => "TRANSIENT_5XX",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::NotFound => "NOT_FOUND",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::WalIntegrity => "WAL_INTEGRITY",
            Self::SafeModeReadOnly => "SAFE_MODE_READ_ONLY",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::OperationFailed => "OPERATION_FAILED",
        }
    }

    /// Parse a stable wire name back into a kind.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "PROVIDER_RATE_LIMIT" => Self::ProviderRateLimit,
            "NETWORK_TIMEOUT" => Self::NetworkTimeout,
            "TRANSIENT_5XX" => Self::Transient5xx,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            "INVALID_CREDENTIALS" => Self::InvalidCredentials,
            "NOT_FOUND" => Self::NotFound,
            "SCHEMA_INVALID" => Self::SchemaInvalid,
            "LOCK_TIMEOUT" => Self::LockTimeout,
            "WAL_INTEGRITY" => Self::WalIntegrity,
            "SAFE_MODE_READ_ONLY" => Self::SafeModeReadOnly,
            "CIRCUIT_BREAKER_OPEN" => Self::CircuitBreakerOpen,
            "OPERATION_FAILED" => Self::OperationFailed,
            _ => return None,
        })
    }

    /// Map an HTTP status code seen by a provider wrapper to a kind.
    ///
    /// 401/403 are credential failures, 404 is a missing resource, 429 is a
    /// rate limit, and any 5xx is a transient server fault.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::InvalidCredentials,
            404 => Self::NotFound,
            429 => Self::ProviderRateLimit,
            500..=599 => Self::Transient5xx,
            _ => Self::OperationFailed,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical error type for all ForgeFlow operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// I/O and JSON errors auto-convert via `#[from]`; both surface as
/// `OPERATION_FAILED` to the taxonomy.
#[derive(Error, Debug)]
pub enum ForgeFlowError {
    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error (auto-converts from `serde_json::Error`)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A classified fault carrying a taxonomy kind and optional cause.
    #[error("{kind}: {message}")]
    Fault {
        kind: ErrorKind,
        message: String,
        #[source]
        source: Option<Box<ForgeFlowError>>,
    },
}

impl ForgeFlowError {
    /// Construct a classified fault.
    pub fn fault(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Fault {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Construct a classified fault wrapping an underlying cause.
    pub fn with_cause(kind: ErrorKind, message: impl Into<String>, cause: ForgeFlowError) -> Self {
        Self::Fault {
            kind,
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// The taxonomy kind of this error. I/O and JSON errors classify as
    /// `OPERATION_FAILED`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fault { kind, .. } => *kind,
            Self::Io(_) | Self::Json(_) => ErrorKind::OperationFailed,
        }
    }

    /// Whether the retry layer may re-attempt after this error.
    pub fn retryable(&self) -> bool {
        self.kind().retryable()
    }
}
