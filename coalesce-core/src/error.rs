//! Error types for coalesce.
//!
//! Producers report failures through [`CoalesceError`]. Three variants are
//! "classified" application errors ([`CoalesceError::is_classified`]): the cache
//! hands those to every waiter unchanged. Everything else is treated as an
//! unexpected failure.
//!
//! The error is `Clone` because a single in-flight outcome is fanned out to
//! every caller attached to it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using `CoalesceError`.
pub type Result<T> = std::result::Result<T, CoalesceError>;

/// Why an upstream refused a request for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminalReason {
    /// HTTP 401 or an equivalent "bad credentials" status.
    Unauthorized,
    /// HTTP 403.
    Forbidden,
    /// HTTP 404 or an explicit empty-result status from the upstream.
    NotFound,
    /// Any other 4xx: the request itself is wrong and retrying cannot help.
    Rejected,
}

impl TerminalReason {
    /// Maps an HTTP status code to a terminal reason, if it is one.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            429 => None,
            400..=499 => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Main error type for all coalesce operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CoalesceError {
    // ═══════════════════════════════════════════════════════════════════════════
    // CLASSIFIED UPSTREAM ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// The upstream refused the request and retrying cannot change that.
    #[error("Upstream {reason}: {message}")]
    TerminalUpstream {
        /// Why the upstream refused.
        reason: TerminalReason,
        /// Upstream detail, for logs.
        message: String,
    },

    /// The upstream kept rate limiting until the retry budget ran out.
    #[error("Rate limited by upstream during '{operation}' after {attempts} attempts")]
    RateLimited {
        /// Name of the fetch operation.
        operation: String,
        /// Attempts spent.
        attempts: u32,
    },

    /// 5xx, network, or malformed responses until the retry budget ran out.
    #[error("Upstream service error during '{operation}' after {attempts} attempts: {reason}")]
    UpstreamService {
        /// Name of the fetch operation.
        operation: String,
        /// Attempts spent.
        attempts: u32,
        /// Last failure seen.
        reason: String,
    },

    // ═══════════════════════════════════════════════════════════════════════════
    // STORE & CODEC ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cache store I/O failed.
    #[error("Cache store error: {0}")]
    Store(String),

    /// A payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A value could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ═══════════════════════════════════════════════════════════════════════════
    // CONFIGURATION & INTERNAL ERRORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Anything not covered above.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoalesceError {
    /// Creates a terminal not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::TerminalUpstream {
            reason: TerminalReason::NotFound,
            message: message.into(),
        }
    }

    /// Returns true for application errors that are propagated verbatim to
    /// every waiter of a key.
    pub fn is_classified(&self) -> bool {
        matches!(
            self,
            CoalesceError::TerminalUpstream { .. }
                | CoalesceError::RateLimited { .. }
                | CoalesceError::UpstreamService { .. }
        )
    }

    /// Returns true if the upstream refused the request for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoalesceError::TerminalUpstream { .. })
    }

    /// Returns true if the upstream reported that nothing exists for the request.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoalesceError::TerminalUpstream {
                reason: TerminalReason::NotFound,
                ..
            }
        )
    }

    /// Returns true if trying again later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoalesceError::RateLimited { .. }
                | CoalesceError::UpstreamService { .. }
                | CoalesceError::Store(_)
        )
    }
}

impl From<serde_json::Error> for CoalesceError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CoalesceError::Deserialization(err.to_string())
        } else {
            CoalesceError::Serialization(err.to_string())
        }
    }
}
