//! Error types for the billsync engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the engine's own API (configuration, persistence, input).
///
/// Provider-side failures never abort the caller; they are captured into a
/// [`SyncResult`](crate::status::SyncResult) instead. They only appear here when
/// an operation is inherently synchronous with the provider (e.g. testing a
/// connection).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid bill snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Invalid event template: {0}")]
    Template(#[from] TemplateError),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Credential store error: {0}")]
    Credentials(String),

    #[error("Bill store error: {0}")]
    BillStore(String),

    #[error("Conflict '{0}' not found")]
    ConflictNotFound(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// A field-level validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Template parse failures, reported when settings are validated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("stray '}}' at byte {0}")]
    StrayBrace(usize),

    #[error("{0}")]
    Invalid(#[from] ValidationError),
}

/// Failure reported by a provider adapter.
///
/// Adapters translate their wire-level signals into these variants; the
/// engine only ever reasons about [`ProviderError::kind`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("credential expired and could not be refreshed: {0}")]
    AuthExpired(String),

    #[error("rate limited by provider{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider request timed out after {0}s")]
    Timeout(u64),

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("remote event not found: {0}")]
    NotFound(String),

    #[error("remote conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Error taxonomy used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthError,
    TransientError,
    ValidationError,
    Conflict,
    PermanentFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::TransientError => "TRANSIENT_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::PermanentFailure => "PERMANENT_FAILURE",
        };
        f.write_str(label)
    }
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Auth(_) | ProviderError::AuthExpired(_) => ErrorKind::AuthError,
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Transient(_) => ErrorKind::TransientError,
            ProviderError::NotFound(_) | ProviderError::Conflict(_) => ErrorKind::Conflict,
            ProviderError::Validation(_) => ErrorKind::ValidationError,
        }
    }

    /// Provider-supplied wait hint, if the failure was a rate limit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status code onto the uniform taxonomy.
    ///
    /// Adapters call this after handling their own provider-specific signals
    /// (e.g. throttling reported with a 403).
    pub fn from_http_status(status: u16, retry_after: Option<Duration>, detail: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(detail),
            429 => ProviderError::RateLimited { retry_after },
            404 | 410 => ProviderError::NotFound(detail),
            409 | 412 => ProviderError::Conflict(detail),
            400 | 422 => ProviderError::Validation(ValidationError::new("event", detail)),
            _ => ProviderError::Transient(format!("HTTP {status}: {detail}")),
        }
    }
}

/// Parse a `Retry-After` header value given in seconds.
///
/// HTTP-date values are not interpreted; callers fall back to computed backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
