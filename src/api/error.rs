use std::time::Duration;

use thiserror::Error;

use super::retry::Idempotency;

/// Failure of one exchange call.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rejected by exchange: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// The request may have taken effect; only a later query can tell.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, ExchangeError::Timeout { .. } | ExchangeError::Network(_))
    }

    /// Whether repeating the call is safe and may succeed.
    pub fn is_retryable(&self, idempotency: Idempotency) -> bool {
        match self {
            ExchangeError::RateLimited(_) => true,
            ExchangeError::Timeout { .. } | ExchangeError::Network(_) => {
                idempotency == Idempotency::Idempotent
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Malformed(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}
