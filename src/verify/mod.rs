//! Verification engine for admission-gate.
//!
//! Each `VerifyRequested` event runs one attempt through a small state
//! machine:
//!
//! ```text
//!   RECEIVED
//!      │  validate label
//!      ▼
//!   FORMAT_CHECKED ──── bad format ────► FORMAT_REJECTED
//!      │
//!      ▼  roster lookup
//!   ROSTER_QUERIED ─┬── present ───────► GRANTED   (credential + welcome)
//!                   ├── absent ────────► DENIED
//!                   └── unavailable ───► ROSTER_ERROR
//!
//!   any non-terminal state ── fault ───► ERRORED
//! ```
//!
//! Admission goes through the [`DedupGuard`]; the returned token is held
//! until the attempt has answered the claimant and written its audit
//! record, and is released on every exit path.

mod dedup;
mod escalation;
mod format;
mod orchestrator;

pub use dedup::{AlreadyInFlight, DedupGuard, InFlightToken};
pub use escalation::EscalationNotifier;
pub use format::{ApplicationId, FormatError, LabelFormat};
pub use orchestrator::{AttemptOutcome, AttemptState, VerificationAttempt, Verifier, VerifierConfig};

use crate::audit::{AuditRecord, AuditSink};
use crate::event::{GateEvent, OperatorLog};
use crate::gateway::{CredentialSink, Notifier};
use crate::retry::Retrier;
use std::sync::Arc;
use tracing::error;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Credential store.
    pub credentials: Arc<dyn CredentialSink>,
    /// Channel poster.
    pub notifier: Arc<dyn Notifier>,
    /// Audit trail.
    pub audit: Arc<dyn AuditSink>,
    /// Wrapper for throttle-prone provider calls.
    pub retrier: Retrier,
    /// Operator status stream.
    pub ops: OperatorLog,
}

impl Collaborators {
    /// Append an audit record; failures are reported to the operator log
    /// and never reach the claimant.
    pub(crate) async fn write_audit(&self, record: AuditRecord) {
        let claimant = record.claimant_id;
        if let Err(e) = self.audit.append(record).await {
            error!("Failed to write audit record for {claimant}: {e}");
            self.ops.emit(GateEvent::Error {
                message: format!("audit write failed for {}: {e}", claimant.mention()),
            });
        }
    }
}
