//! Error types for qmd-repair.
//!
//! Taxonomy:
//! - Expected failures: bad config, bad input lines, unparseable documents
//! - Infrastructure failures: generation service, network, timeout, IO
//! - Internal invariant violations (bugs)

use thiserror::Error;

/// Top-level error type for qmd-repair.
#[derive(Debug, Error)]
pub enum RepairError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED — input or configuration was wrong
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE — service or filesystem failed underneath us
    // ═══════════════════════════════════════════════════════════════════

    #[error("Generation service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL — should not happen
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by the chat-completions endpoint.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited by service: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RepairError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth another transport attempt.
    ///
    /// Network failures, timeouts, 429s and 5xx responses are; any other
    /// service status is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Network(_)
                | Self::Service(ServiceError::RateLimited { .. })
                | Self::Service(ServiceError::ApiError { status: 500..=599, .. })
        )
    }

    /// Wait already imposed by the service before the next attempt, in seconds.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::Service(ServiceError::RateLimited {
                retry_after_secs, ..
            }) => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for qmd-repair.
pub type Result<T> = std::result::Result<T, RepairError>;
