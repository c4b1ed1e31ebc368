//! Per-claimant mutual exclusion for verification attempts.
//!
//! Admission is a synchronous check-and-insert under a lock that is never
//! held across an `.await`, so no task can observe a stale "not in flight"
//! answer. Release happens when the [`InFlightToken`] is dropped, which
//! covers every exit path: normal return, early return, error, panic
//! unwinding, and cancellation of the owning future.

use crate::gateway::ClaimantId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// A second attempt arrived while one was already running.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("verification already in flight for {0}")]
pub struct AlreadyInFlight(pub ClaimantId);

/// Set of claimants currently inside the orchestrator.
#[derive(Clone, Default)]
pub struct DedupGuard {
    in_flight: Arc<Mutex<HashSet<ClaimantId>>>,
}

impl DedupGuard {
    /// Create an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `claimant` unless an attempt is already running for them.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInFlight` if the claimant holds a token.
    pub fn try_enter(&self, claimant: ClaimantId) -> Result<InFlightToken, AlreadyInFlight> {
        if !self.in_flight.lock().insert(claimant) {
            return Err(AlreadyInFlight(claimant));
        }
        trace!("{claimant} entered verification");
        Ok(InFlightToken {
            claimant,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Release a token explicitly. Equivalent to dropping it.
    pub fn exit(&self, token: InFlightToken) {
        drop(token);
    }

    /// Whether an attempt is running for `claimant`.
    #[must_use]
    pub fn is_in_flight(&self, claimant: ClaimantId) -> bool {
        self.in_flight.lock().contains(&claimant)
    }

    /// Number of attempts running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether no attempt is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.lock().is_empty()
    }
}

/// Proof of admission. Releases the claimant when dropped.
#[derive(Debug)]
#[must_use = "dropping the token immediately releases the claimant"]
pub struct InFlightToken {
    claimant: ClaimantId,
    in_flight: Arc<Mutex<HashSet<ClaimantId>>>,
}

impl InFlightToken {
    /// The admitted claimant.
    #[must_use]
    pub fn claimant(&self) -> ClaimantId {
        self.claimant
    }
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.claimant);
        trace!("{} left verification", self.claimant);
    }
}
