//! Crate-wide error taxonomy.
//!
//! Each variant maps to exactly one outcome the orchestrator can turn into
//! an HTTP response; the message shown to the caller is always the generic
//! category, never the internal detail.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SecurityError {
    #[error("rate limit exceeded")]
    OverLimit { retry_after_secs: u64 },

    #[error("request rejected: {0}")]
    RequestRejected(String),

    #[error("too many failed attempts")]
    IdentityAbuse {
        scope: String,
        retry_after_secs: u64,
    },

    #[error("CSRF token validation failed")]
    TokenMismatch,

    #[error("request entity too large")]
    RequestTooLarge,

    #[error("request-uri too long")]
    UriTooLong,

    #[error("security engine unavailable")]
    Internal(String),
}

pub type SecurityResult<T> = Result<T, SecurityError>;
