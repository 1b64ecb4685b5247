//! Error types for the synchronization layer.

use thiserror::Error;

use crate::QueryKey;

/// Why a single backend request could not produce a value.
///
/// The variants only influence diagnostics; every one of them is recovered
/// the same way on the read path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    /// Connection refused, DNS, TLS, or the request could not be sent.
    #[error("network error: {message}")]
    Network { message: String },

    /// No response within the configured timeout.
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The backend answered with a non-2xx status.
    #[error("request failed ({status}): {body}")]
    Status { status: u16, body: String },

    /// The body was not valid JSON for the expected record type.
    #[error("invalid response body: {message}")]
    Parse { message: String },
}

impl FetchFailure {
    /// Whether this failure happened below the HTTP layer.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::Status { .. } => "status",
            Self::Parse { .. } => "parse",
        }
    }
}

impl From<reqwest::Error> for FetchFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { after_ms: 0 };
        }
        if err.is_decode() {
            return Self::Parse {
                message: err.to_string(),
            };
        }
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the cache, the coordinator and the side channels.
///
/// Cloneable so a single in-flight fetch result can be handed to every
/// caller that attached to it.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// A backend request failed.
    #[error(transparent)]
    Fetch(#[from] FetchFailure),

    /// Nothing to show: the fetch failed, no fallback exists and the key
    /// has never held data.
    #[error("no data available for {key}: {reason}")]
    Unavailable { key: QueryKey, reason: String },

    /// No loader has been registered for the key.
    #[error("no loader registered for {0}")]
    NoLoader(QueryKey),

    /// A write failed; any optimistic patch has been rolled back.
    #[error("mutation {mutation} failed: {reason}")]
    Mutation { mutation: String, reason: String },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The handoff channel could not be read or written.
    #[error("handoff error: {0}")]
    Handoff(String),
}

impl SyncError {
    /// Build a mutation failure from any displayable cause.
    pub fn mutation(mutation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Mutation {
            mutation: mutation.into(),
            reason: reason.to_string(),
        }
    }
}
