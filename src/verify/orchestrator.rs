//! Verification orchestrator: runs one attempt per `VerifyRequested` event.

use super::dedup::DedupGuard;
use super::format::{ApplicationId, LabelFormat};
use super::Collaborators;
use crate::audit::{AuditOutcome, AuditRecord};
use crate::error::{Error, Result};
use crate::event::GateEvent;
use crate::gateway::{ChannelId, Claimant, ClaimantId, Reply, ResponseHandle, Responder};
use crate::roster::{Lookup, RosterCache};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the verifier.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Time allowed before a provisional acknowledgment is sent.
    pub ack_budget: Duration,
    /// Channel that receives a welcome message on each grant.
    pub welcome_channel: Option<ChannelId>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            ack_budget: Duration::from_millis(2_500),
            welcome_channel: None,
        }
    }
}

/// States of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Event accepted past the dedup guard.
    Received,
    /// Label has been run through the validator.
    FormatChecked,
    /// Label rejected. Terminal.
    FormatRejected,
    /// Roster lookup in progress.
    RosterQueried,
    /// Credential granted. Terminal.
    Granted,
    /// Id not on the roster. Terminal.
    Denied,
    /// Roster could not be consulted. Terminal.
    RosterError,
    /// Unexpected fault. Terminal.
    Errored,
}

impl AttemptState {
    /// Whether the attempt is over.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FormatRejected | Self::Granted | Self::Denied | Self::RosterError | Self::Errored
        )
    }

    /// Whether the machine allows `self -> next`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Received, Self::FormatChecked)
            | (Self::FormatChecked, Self::FormatRejected | Self::RosterQueried)
            | (Self::RosterQueried, Self::Granted | Self::Denied | Self::RosterError) => true,
            (from, Self::Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Audit class for a terminal state.
    #[must_use]
    pub fn audit_outcome(self) -> Option<AuditOutcome> {
        match self {
            Self::Granted => Some(AuditOutcome::Granted),
            Self::FormatRejected | Self::Denied => Some(AuditOutcome::Denied),
            Self::RosterError | Self::Errored => Some(AuditOutcome::Errored),
            Self::Received | Self::FormatChecked | Self::RosterQueried => None,
        }
    }

    /// Upper-case state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::FormatChecked => "FORMAT_CHECKED",
            Self::FormatRejected => "FORMAT_REJECTED",
            Self::RosterQueried => "ROSTER_QUERIED",
            Self::Granted => "GRANTED",
            Self::Denied => "DENIED",
            Self::RosterError => "ROSTER_ERROR",
            Self::Errored => "ERRORED",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handling one `VerifyRequested` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Credential granted.
    Granted,
    /// Id not on the roster.
    Denied,
    /// Label rejected.
    FormatRejected,
    /// Roster unavailable.
    RosterError,
    /// Internal or provider fault.
    Errored,
    /// Rejected at admission: another attempt is running.
    AlreadyInFlight,
}

impl AttemptOutcome {
    fn from_state(state: AttemptState) -> Self {
        match state {
            AttemptState::Granted => Self::Granted,
            AttemptState::Denied => Self::Denied,
            AttemptState::FormatRejected => Self::FormatRejected,
            AttemptState::RosterError => Self::RosterError,
            _ => Self::Errored,
        }
    }
}

/// One in-memory verification attempt. Never persisted beyond its audit
/// record.
#[derive(Debug, Clone)]
pub struct VerificationAttempt {
    claimant: Claimant,
    application_id: Option<ApplicationId>,
    state: AttemptState,
    reason: String,
    received_at: DateTime<Utc>,
}

impl VerificationAttempt {
    /// Start an attempt in `RECEIVED`.
    #[must_use]
    pub fn new(claimant: Claimant) -> Self {
        Self {
            claimant,
            application_id: None,
            state: AttemptState::Received,
            reason: String::new(),
            received_at: Utc::now(),
        }
    }

    /// The claimant.
    #[must_use]
    pub fn claimant(&self) -> &Claimant {
        &self.claimant
    }

    /// Parsed id, once the format check passed.
    #[must_use]
    pub fn application_id(&self) -> Option<&ApplicationId> {
        self.application_id.as_ref()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Why the attempt ended.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// When the event arrived.
    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` for a transition the machine does not allow.
    pub fn advance(&mut self, next: AttemptState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::Internal(format!(
                "illegal transition {} -> {next}",
                self.state
            )));
        }
        debug!("Attempt for {}: {} -> {next}", self.claimant.id, self.state);
        self.state = next;
        Ok(())
    }

    fn conclude(&mut self, state: AttemptState, reason: impl Into<String>) -> Result<()> {
        self.advance(state)?;
        self.reason = reason.into();
        Ok(())
    }

    fn fail(&mut self, reason: String) {
        if self.state.is_terminal() {
            warn!(
                "Fault after {} for {}: {reason}",
                self.state, self.claimant.id
            );
        }
        self.state = AttemptState::Errored;
        self.reason = reason;
    }
}

/// The verification orchestrator.
///
/// Composes the format validator, roster cache and dedup guard, and emits
/// the credential grant, claimant replies, welcome notification and audit
/// record for each attempt.
pub struct Verifier {
    format: LabelFormat,
    roster: RosterCache,
    guard: DedupGuard,
    deps: Collaborators,
    config: VerifierConfig,
}

impl Verifier {
    /// Create a new verifier.
    #[must_use]
    pub fn new(
        format: LabelFormat,
        roster: RosterCache,
        deps: Collaborators,
        config: VerifierConfig,
    ) -> Self {
        info!(
            "Verifier initialized (prefix={}, ack_budget={:?})",
            format.prefix(),
            config.ack_budget
        );
        Self {
            format,
            roster,
            guard: DedupGuard::new(),
            deps,
            config,
        }
    }

    /// The roster cache.
    #[must_use]
    pub fn roster(&self) -> &RosterCache {
        &self.roster
    }

    /// The dedup guard.
    #[must_use]
    pub fn guard(&self) -> &DedupGuard {
        &self.guard
    }

    /// Handle one `VerifyRequested` event end to end.
    ///
    /// Never fails: faults, including panics inside the attempt, end in
    /// [`AttemptOutcome::Errored`] with a plain-language reply.
    pub async fn handle_verify(
        &self,
        claimant: Claimant,
        handle: Arc<dyn ResponseHandle>,
    ) -> AttemptOutcome {
        let responder = Responder::new(claimant.id, handle, self.deps.ops.clone());

        let token = match self.guard.try_enter(claimant.id) {
            Ok(token) => token,
            Err(busy) => {
                debug!("{busy}");
                responder.send(Reply::PleaseWait).await;
                return AttemptOutcome::AlreadyInFlight;
            }
        };

        let mut attempt = VerificationAttempt::new(claimant);
        let evaluation = AssertUnwindSafe(self.evaluate(&mut attempt)).catch_unwind();
        let result = responder.within(self.config.ack_budget, evaluation).await;
        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(fault)) => {
                error!("Verification fault for {}: {fault}", attempt.claimant.id);
                let reply = match fault {
                    Error::CredentialGrant(_) => Reply::GrantFailed,
                    _ => Reply::SomethingWentWrong,
                };
                attempt.fail(fault.to_string());
                reply
            }
            Err(payload) => {
                let reason = format!("internal fault: {}", panic_message(payload.as_ref()));
                error!("Verification for {} panicked: {reason}", attempt.claimant.id);
                attempt.fail(reason);
                Reply::SomethingWentWrong
            }
        };

        responder.send(reply).await;
        if attempt.state == AttemptState::Granted {
            self.welcome(attempt.claimant.id).await;
        }
        self.record(&attempt).await;

        self.guard.exit(token);
        AttemptOutcome::from_state(attempt.state)
    }

    async fn evaluate(&self, attempt: &mut VerificationAttempt) -> Result<Reply> {
        attempt.advance(AttemptState::FormatChecked)?;
        let id = match self.format.validate(&attempt.claimant.label) {
            Ok(id) => id,
            Err(e) => {
                debug!("{e}");
                attempt.conclude(AttemptState::FormatRejected, "label format")?;
                return Ok(Reply::BadFormat);
            }
        };

        attempt.application_id = Some(id.clone());
        attempt.advance(AttemptState::RosterQueried)?;
        match self.roster.lookup(id.as_str()).await {
            Err(unavailable) => {
                attempt.conclude(AttemptState::RosterError, unavailable.to_string())?;
                Ok(Reply::RosterOffline)
            }
            Ok(Lookup::Absent) => {
                attempt.conclude(AttemptState::Denied, "application id not on roster")?;
                Ok(Reply::NotOnRoster)
            }
            Ok(Lookup::Present) => {
                let newly_granted = self.grant(attempt.claimant.id).await?;
                let reason = if newly_granted {
                    "roster match"
                } else {
                    "roster match, credential already held"
                };
                attempt.conclude(AttemptState::Granted, reason)?;
                Ok(Reply::Verified)
            }
        }
    }

    /// Assign the credential unless already held. Returns whether a grant
    /// call was made.
    async fn grant(&self, claimant: ClaimantId) -> Result<bool> {
        match self.deps.credentials.has_credential(claimant).await {
            Ok(true) => {
                debug!("{claimant} already holds the credential");
                return Ok(false);
            }
            Ok(false) => {}
            Err(e) => warn!("Could not read credential state for {claimant}, granting: {e}"),
        }

        self.deps
            .retrier
            .execute("grant credential", || self.deps.credentials.grant(claimant))
            .await
            .map_err(|e| match e {
                Error::CredentialGrant(_) => e,
                other => Error::CredentialGrant(other.to_string()),
            })?;
        Ok(true)
    }

    async fn welcome(&self, claimant: ClaimantId) {
        let Some(channel) = self.config.welcome_channel else {
            return;
        };
        let message = format!(
            "Welcome, {}! You have been verified and granted access to the server.",
            claimant.mention()
        );
        let result = self
            .deps
            .retrier
            .execute("welcome notification", || {
                self.deps.notifier.post(channel, &message)
            })
            .await;
        if let Err(e) = result {
            warn!("Welcome notification for {claimant} failed: {e}");
        }
    }

    async fn record(&self, attempt: &VerificationAttempt) {
        let Some(outcome) = attempt.state.audit_outcome() else {
            return;
        };
        self.deps.ops.emit(GateEvent::AttemptFinished {
            claimant: attempt.claimant.id,
            state: attempt.state.to_string(),
            reason: attempt.reason.clone(),
        });
        self.deps
            .write_audit(AuditRecord::now(
                attempt.claimant.id,
                attempt.claimant.label.clone(),
                outcome,
                attempt.reason.clone(),
            ))
            .await;
    }

    /// Remove the credential from a claimant. Returns whether they held it.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialGrant` if the provider refuses the change.
    pub async fn unverify(&self, claimant: ClaimantId) -> Result<bool> {
        if !self.deps.credentials.has_credential(claimant).await? {
            return Ok(false);
        }
        self.deps
            .retrier
            .execute("revoke credential", || self.deps.credentials.revoke(claimant))
            .await
            .map_err(|e| Error::CredentialGrant(e.to_string()))?;

        info!("Credential revoked for {claimant}");
        self.deps
            .write_audit(AuditRecord::now(
                claimant,
                String::new(),
                AuditOutcome::Revoked,
                "credential revoked",
            ))
            .await;
        Ok(true)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
