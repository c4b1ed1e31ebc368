//! Append-only audit trail of verification outcomes.
//!
//! Records carry identifiers, labels and outcomes only. They are written
//! one JSON object per line, each line in a single write under a lock, so
//! concurrent flows never interleave inside a record.

use crate::error::{Error, Result};
use crate::gateway::ClaimantId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome class recorded for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Credential granted.
    Granted,
    /// Format rejected or not on the roster.
    Denied,
    /// Routed to human review.
    Escalated,
    /// Roster unavailable or an internal fault.
    Errored,
    /// Credential removed by an operator.
    Revoked,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Claimant.
    pub claimant_id: ClaimantId,
    /// Label at the time of the attempt.
    pub label: String,
    /// Outcome class.
    pub outcome: AuditOutcome,
    /// Short machine-readable reason.
    pub reason: String,
    /// When the attempt ended.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Create a record stamped now.
    #[must_use]
    pub fn now(
        claimant_id: ClaimantId,
        label: impl Into<String>,
        outcome: AuditOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            claimant_id,
            label: label.into(),
            outcome,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one record.
    async fn append(&self, record: AuditRecord) -> Result<()>;
}

/// JSON-lines audit file.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditLog {
    /// Open (or create) the audit file for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory or file cannot be created.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        debug!("Audit trail at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Location of the audit file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records back.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is malformed.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory audit trail.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    /// Create an empty trail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    /// Records for one claimant.
    #[must_use]
    pub fn for_claimant(&self, claimant: ClaimantId) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.claimant_id == claimant)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
