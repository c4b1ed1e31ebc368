//! Boundary between the engine and the chat gateway.
//!
//! The engine never touches the gateway's native objects. An adapter turns
//! gateway interactions into [`InboundEvent`]s carrying a minimal
//! [`Claimant`] and a [`ResponseHandle`], and implements [`CredentialSink`]
//! and [`Notifier`] on top of the provider's API.

use crate::error::{Error, Result};
use crate::event::{GateEvent, OperatorLog};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Stable numeric identity of a claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimantId(pub u64);

impl ClaimantId {
    /// Mention markup for this claimant.
    #[must_use]
    pub fn mention(&self) -> String {
        format!("<@{}>", self.0)
    }
}

impl fmt::Display for ClaimantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a channel notifications are posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

/// Identity of a role that can be mentioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub u64);

impl RoleId {
    /// Mention markup for this role.
    #[must_use]
    pub fn mention(&self) -> String {
        format!("<@&{}>", self.0)
    }
}

/// The claimant as seen by the engine: an id and the label they currently
/// display. Read per event, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimant {
    /// Stable id.
    pub id: ClaimantId,
    /// Self-chosen display label.
    pub label: String,
}

impl Claimant {
    /// Create a claimant value.
    #[must_use]
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id: ClaimantId(id),
            label: label.into(),
        }
    }
}

/// Plain-language responses shown to claimants.
///
/// Backend error text never reaches a claimant; every outcome maps to one
/// of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Credential granted.
    Verified,
    /// Label does not follow the application id format.
    BadFormat,
    /// Application id is not on the roster.
    NotOnRoster,
    /// Roster could not be consulted.
    RosterOffline,
    /// Roster matched but the credential could not be assigned.
    GrantFailed,
    /// Unexpected fault.
    SomethingWentWrong,
    /// Another attempt for this claimant is still running.
    PleaseWait,
    /// Provisional acknowledgment; the outcome follows later.
    Working,
    /// Review request delivered.
    EscalationSent,
    /// Review request could not be delivered.
    EscalationFailed,
}

impl Reply {
    /// Text sent to the claimant.
    #[must_use]
    pub fn text(&self) -> &'static str {
        match self {
            Self::Verified => "You have been verified and granted access to other channels.",
            Self::BadFormat => {
                "You have not renamed in proper format. If you think I made a mistake, \
                 refer to manual verification."
            }
            Self::NotOnRoster => {
                "I couldn't verify your identity. Please request manual verification for human help."
            }
            Self::RosterOffline => {
                "Verification system is currently offline. Please try again later \
                 or request manual verification."
            }
            Self::GrantFailed => {
                "Verification successful, but I was unable to grant access. \
                 Please request manual verification."
            }
            Self::SomethingWentWrong => {
                "Something went wrong while verifying you. Please request manual verification."
            }
            Self::PleaseWait => "Your verification is already in progress. Please wait.",
            Self::Working => "Checking your application, this can take a moment...",
            Self::EscalationSent => {
                "Your request for manual verification has been sent. Please wait for a helper \
                 to assist you. Stand by."
            }
            Self::EscalationFailed => {
                "I couldn't reach the helpers right now. Please try again in a few minutes."
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Capability to answer the interaction that triggered an event.
///
/// `acknowledge` may be called once, inside the provider's short validity
/// window. `follow_up` may be called any number of times afterwards.
/// Either returns [`Error::ResponseExpired`] once the handle is no longer
/// usable.
#[async_trait]
pub trait ResponseHandle: Send + Sync {
    /// Send the single initial acknowledgment.
    async fn acknowledge(&self, reply: Reply) -> Result<()>;

    /// Send a follow-up message after the acknowledgment.
    async fn follow_up(&self, reply: Reply) -> Result<()>;
}

/// Engine-side wrapper around a [`ResponseHandle`].
///
/// Routes the first send to `acknowledge` and every later one to
/// `follow_up`. Delivery failures are logged, never retried and never
/// propagated: there is no way to reach a requester whose handle vanished.
pub struct Responder {
    claimant: ClaimantId,
    handle: Arc<dyn ResponseHandle>,
    acknowledged: AtomicBool,
    ops: OperatorLog,
}

impl Responder {
    /// Wrap a handle for one interaction.
    #[must_use]
    pub fn new(claimant: ClaimantId, handle: Arc<dyn ResponseHandle>, ops: OperatorLog) -> Self {
        Self {
            claimant,
            handle,
            acknowledged: AtomicBool::new(false),
            ops,
        }
    }

    /// Whether the initial acknowledgment has been used.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Run `work`, sending a provisional [`Reply::Working`] acknowledgment
    /// if it has not finished within `budget`. The work itself is never
    /// cancelled; its final answer then goes out as a follow-up.
    pub async fn within<F: Future>(&self, budget: Duration, work: F) -> F::Output {
        tokio::pin!(work);
        match tokio::time::timeout(budget, &mut work).await {
            Ok(output) => output,
            Err(_) => {
                debug!("{} still working after {:?}, acknowledging early", self.claimant, budget);
                self.send(Reply::Working).await;
                work.await
            }
        }
    }

    /// Deliver a reply. Returns `true` if the provider accepted it.
    pub async fn send(&self, reply: Reply) -> bool {
        let first = !self.acknowledged.swap(true, Ordering::SeqCst);
        let result = if first {
            self.handle.acknowledge(reply).await
        } else {
            self.handle.follow_up(reply).await
        };

        match result {
            Ok(()) => {
                debug!("Delivered {:?} to {}", reply, self.claimant);
                true
            }
            Err(Error::ResponseExpired) => {
                warn!("Response handle for {} expired, dropping {:?}", self.claimant, reply);
                self.ops.emit(GateEvent::DeliveryDropped {
                    claimant: self.claimant,
                    reason: "response handle expired".to_string(),
                });
                false
            }
            Err(e) => {
                warn!("Failed to deliver {:?} to {}: {}", reply, self.claimant, e);
                self.ops.emit(GateEvent::DeliveryDropped {
                    claimant: self.claimant,
                    reason: e.to_string(),
                });
                false
            }
        }
    }
}

/// The external credential store: a binary grant keyed by claimant.
///
/// `grant` and `revoke` are assumed idempotent at the protocol boundary.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    /// Whether the claimant currently holds the credential.
    async fn has_credential(&self, claimant: ClaimantId) -> Result<bool>;

    /// Assign the credential.
    async fn grant(&self, claimant: ClaimantId) -> Result<()>;

    /// Remove the credential.
    async fn revoke(&self, claimant: ClaimantId) -> Result<()>;
}

/// Posts messages to channels (review, welcome, operator log).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post a message to a channel.
    async fn post(&self, channel: ChannelId, message: &str) -> Result<()>;
}

/// Events delivered to the engine by the gateway adapter.
pub enum InboundEvent {
    /// The claimant pressed "verify".
    VerifyRequested {
        /// Who asked, with their current label.
        claimant: Claimant,
        /// Where to answer.
        handle: Arc<dyn ResponseHandle>,
    },
    /// The claimant asked for manual verification.
    EscalationRequested {
        /// Who asked.
        claimant: ClaimantId,
        /// Where to answer.
        handle: Arc<dyn ResponseHandle>,
    },
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerifyRequested { claimant, .. } => f
                .debug_struct("VerifyRequested")
                .field("claimant", claimant)
                .finish_non_exhaustive(),
            Self::EscalationRequested { claimant, .. } => f
                .debug_struct("EscalationRequested")
                .field("claimant", claimant)
                .finish_non_exhaustive(),
        }
    }
}
