//! Roster access for admission-gate.
//!
//! The roster is the authoritative list of valid application ids, read from
//! one column of an external table. The engine only ever reads it.
//!
//! # Architecture
//!
//! ```text
//! lookup(id)
//!      │
//!      ▼
//! ┌──────────────────────┐
//! │ Snapshot fresh?      │──── yes ──► answer from memory
//! └─────────┬────────────┘
//!           │ no
//!           ▼
//! ┌──────────────────────┐
//! │ Cooling down?        │──── yes ──► RosterUnavailable (no I/O)
//! └─────────┬────────────┘
//!           │ no
//!           ▼
//! ┌──────────────────────┐
//! │ Join / start the one │
//! │ in-flight refetch    │
//! └─────────┬────────────┘
//!           │
//!    ┌──────┴───────┐
//!    │              │
//!  fetched     not found / exhausted
//!    │              │
//!    ▼              ▼
//! swap snapshot  RosterUnavailable
//! and answer     (cooldown after N transient failures)
//! ```

mod cache;
mod file;
mod sheets;

pub use cache::{backoff_delay, CacheStats, RosterCache, RosterPolicy, RosterSnapshot};
pub use file::FileRosterSource;
pub use sheets::{SheetsConfig, SheetsRosterSource};

use crate::config::{RosterConfig, RosterSourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Answer from a roster lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The id is on the roster.
    Present,
    /// The roster was consulted and the id is not on it.
    Absent,
}

/// Failure of a single fetch, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// The roster resource itself does not exist. Permanent.
    #[error("roster resource not found: {0}")]
    NotFound(String),

    /// The backend throttled us. Transient.
    #[error("roster backend rate limited: {0}")]
    RateLimited(String),

    /// Connection or timeout failure. Transient.
    #[error("roster network error: {0}")]
    Network(String),

    /// Anything else. Treated as transient.
    #[error("roster fetch failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Whether retrying can never help.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Why a lookup could not be answered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RosterUnavailable {
    /// The roster resource is missing.
    #[error("roster unavailable: {0}")]
    Missing(String),

    /// Every attempt in the refresh cycle failed.
    #[error("roster unavailable after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made in the cycle.
        attempts: u32,
        /// Last classified failure.
        last_error: String,
    },

    /// The backend is cooling down after repeated failures.
    #[error("roster unavailable, cooling down for another {remaining:?}")]
    CoolingDown {
        /// Time left in the cooldown.
        remaining: Duration,
    },

    /// The cache has been torn down.
    #[error("roster cache is shut down")]
    ShutDown,
}

/// A read-only source of application ids.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// Fetch the full designated column.
    async fn fetch(&self) -> std::result::Result<Vec<String>, FetchError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Build the configured roster source.
///
/// # Errors
///
/// Returns `Error::Config` if required settings are missing.
pub fn source_from_config(config: &RosterConfig) -> Result<Arc<dyn RosterSource>> {
    match config.source {
        RosterSourceKind::Sheets => {
            if config.spreadsheet_id.is_empty() {
                return Err(Error::Config("roster.spreadsheet_id is required".to_string()));
            }
            let api_key = std::env::var(&config.api_key_env).ok();
            let bearer_token = std::env::var(&config.token_env).ok();
            if api_key.is_none() && bearer_token.is_none() {
                tracing::warn!(
                    "Neither {} nor {} is set, the sheet must be public",
                    config.api_key_env,
                    config.token_env
                );
            }
            let source = SheetsRosterSource::new(SheetsConfig {
                spreadsheet_id: config.spreadsheet_id.clone(),
                worksheet: config.worksheet.clone(),
                column: config.column.clone(),
                api_key,
                bearer_token,
                timeout: config.fetch_timeout(),
                ..SheetsConfig::default()
            })?;
            Ok(Arc::new(source))
        }
        RosterSourceKind::File => {
            let path = config
                .file_path
                .clone()
                .ok_or_else(|| Error::Config("roster.file_path is required".to_string()))?;
            Ok(Arc::new(FileRosterSource::new(path)))
        }
    }
}
