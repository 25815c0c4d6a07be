//! Error types for the generation worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ai::ProviderKind;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Classification of a failed generation attempt.
///
/// Transient kinds are retried with backoff; everything else is recorded
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    ProviderUnavailable,
    RateLimited,
    QuotaExceeded,
    InvalidCredentials,
    MalformedResponse,
    InvalidRequest,
    Storage,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::ProviderUnavailable | Self::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::InvalidCredentials => "invalid_credentials",
            Self::MalformedResponse => "malformed_response",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage",
        };
        write!(f, "{s}")
    }
}

/// A failed call to an AI provider (or the persistence step right after it).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider} {kind}: {message}")]
pub struct GenerationError {
    pub provider: ProviderKind,
    pub kind: ErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(provider: ProviderKind, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider,
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Concurrency limiter errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("No concurrency slot for {provider} within {waited:?}")]
    ConcurrencyExhausted {
        provider: ProviderKind,
        waited: Duration,
    },

    #[error("Concurrency limiter misconfigured: {0}")]
    Misconfigured(String),

    #[error("Concurrency limiter closed")]
    Closed,
}

/// Cycle-fatal worker errors. Per-item failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Pause registry unreadable: {0}")]
    Pause(String),

    #[error("Database unavailable: {0}")]
    Database(#[from] DatabaseError),

    #[error("Limiter unavailable: {0}")]
    Limiter(#[from] LimiterError),

    #[error("Worker already in state {state}, cannot transition to {target}")]
    InvalidTransition { state: String, target: String },

    #[error("Cycle exceeded maximum duration of {0:?}")]
    Watchdog(Duration),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::ProviderUnavailable.is_transient());
        assert!(!ErrorKind::QuotaExceeded.is_transient());
        assert!(!ErrorKind::InvalidCredentials.is_transient());
        assert!(!ErrorKind::MalformedResponse.is_transient());
    }

    #[test]
    fn generation_error_display() {
        let err = GenerationError::new(ProviderKind::Google, ErrorKind::QuotaExceeded, "monthly cap");
        assert_eq!(err.to_string(), "google quota_exceeded: monthly cap");
    }
}
