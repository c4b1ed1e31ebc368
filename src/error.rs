//! Error types for admission-gate.

use crate::roster::RosterUnavailable;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the verification gate.
///
/// Expected negative outcomes (a badly formatted label, an application id
/// missing from the roster) are not errors; they are branches of the
/// verification state machine. Everything here is a genuine fault.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The roster could not answer a lookup.
    #[error(transparent)]
    Roster(#[from] RosterUnavailable),

    /// The provider failed while assigning or revoking a credential.
    #[error("credential grant failed: {0}")]
    CredentialGrant(String),

    /// The provider asked the caller to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Interval the provider asked us to wait.
        retry_after: Duration,
    },

    /// The response handle outlived its validity window.
    #[error("response handle expired")]
    ResponseExpired,

    /// A notification could not be delivered.
    #[error("notification failed: {0}")]
    Notify(String),

    /// The audit trail could not be appended to.
    #[error("audit error: {0}")]
    Audit(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),

    /// Unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Provider-requested wait, if this is a throttling error.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Audit(e.to_string())
    }
}
