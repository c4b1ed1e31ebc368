//! Gate event system.
//!
//! The operator log is best-effort: events are traced and broadcast to any
//! subscriber, and a missing or lagging subscriber never slows a claimant.

use crate::gateway::{ChannelId, ClaimantId, Notifier};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Events emitted by the gate.
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// Gate has started successfully.
    Started,

    /// Gate is shutting down.
    ShuttingDown,

    /// A new roster snapshot replaced the previous one.
    RosterRefreshed {
        /// Number of entries in the new snapshot.
        entries: usize,
    },

    /// The roster backend is cooling down after repeated failures.
    RosterCooldown {
        /// How long lookups will fail fast.
        duration: Duration,
    },

    /// A verification attempt reached a terminal state.
    AttemptFinished {
        /// Claimant.
        claimant: ClaimantId,
        /// Terminal state name.
        state: String,
        /// Short reason.
        reason: String,
    },

    /// A claimant asked for human review.
    Escalated {
        /// Claimant.
        claimant: ClaimantId,
    },

    /// A reply could not be delivered to a claimant.
    DeliveryDropped {
        /// Claimant.
        claimant: ClaimantId,
        /// Why delivery failed.
        reason: String,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

impl fmt::Display for GateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "Verification gate started"),
            Self::ShuttingDown => write!(f, "Verification gate shutting down"),
            Self::RosterRefreshed { entries } => {
                write!(f, "Roster refreshed ({entries} entries)")
            }
            Self::RosterCooldown { duration } => {
                write!(f, "Roster backend cooling down for {}s", duration.as_secs())
            }
            Self::AttemptFinished {
                claimant,
                state,
                reason,
            } => write!(f, "Verification for {} ended {state}: {reason}", claimant.mention()),
            Self::Escalated { claimant } => {
                write!(f, "{} requested manual verification", claimant.mention())
            }
            Self::DeliveryDropped { claimant, reason } => {
                write!(f, "Could not reply to {}: {reason}", claimant.mention())
            }
            Self::Error { message } => write!(f, "Error: {message}"),
        }
    }
}

/// Channel for receiving gate events.
pub type GateEventsChannel = broadcast::Receiver<GateEvent>;

/// Sender for gate events.
pub type GateEventsSender = broadcast::Sender<GateEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GateEventsSender, GateEventsChannel) {
    broadcast::channel(256)
}

/// Structured operator status stream.
#[derive(Clone)]
pub struct OperatorLog {
    events: GateEventsSender,
}

impl OperatorLog {
    /// Wrap an event sender.
    #[must_use]
    pub fn new(events: GateEventsSender) -> Self {
        Self { events }
    }

    /// Operator log with nobody listening.
    #[must_use]
    pub fn detached() -> Self {
        let (events, _) = create_event_channel();
        Self { events }
    }

    /// Subscribe to the stream.
    #[must_use]
    pub fn subscribe(&self) -> GateEventsChannel {
        self.events.subscribe()
    }

    /// Record an event. Never blocks and never fails.
    pub fn emit(&self, event: GateEvent) {
        match &event {
            GateEvent::Error { .. } => error!("{event}"),
            GateEvent::DeliveryDropped { .. } | GateEvent::RosterCooldown { .. } => {
                warn!("{event}");
            }
            _ => info!("{event}"),
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Relay every event to a channel through the notifier.
    ///
    /// Lagged events are skipped and failed posts are dropped. The task ends
    /// when all senders are gone.
    pub fn forward_to(&self, notifier: Arc<dyn Notifier>, channel: ChannelId) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = notifier.post(channel, &event.to_string()).await {
                            debug!("Operator log post failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Operator log forwarder skipped {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
