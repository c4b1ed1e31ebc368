//! # admission-gate
//!
//! Identity-verification gate for a community space.
//!
//! A claimant renames themself to their application id (`RA_<digits>_<name>`)
//! and presses "verify". The gate checks the label format, looks the id up
//! in an authoritative roster (one column of a spreadsheet), and on a match
//! grants the verified credential. Anything else is routed towards human
//! review.
//!
//! ## Components
//!
//! - [`verify::LabelFormat`]: pure format validator
//! - [`roster::RosterCache`]: TTL snapshot of the roster with backoff,
//!   cooldown and single-flight refetch
//! - [`verify::DedupGuard`]: at most one in-flight attempt per claimant
//! - [`verify::Verifier`]: the per-attempt state machine
//! - [`verify::EscalationNotifier`]: fan-out to the human review channel
//! - [`retry::Retrier`]: rate-limit aware wrapper for throttle-prone calls
//!
//! The chat gateway itself is not part of this crate. Adapters implement
//! [`gateway::ResponseHandle`], [`gateway::CredentialSink`] and
//! [`gateway::Notifier`] and feed [`gateway::InboundEvent`]s into a
//! [`RunningGate`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod config;
pub mod error;
pub mod event;
pub mod gate;
pub mod gateway;
pub mod moderation;
pub mod retry;
pub mod roster;
pub mod verify;

pub use config::GateConfig;
pub use error::{Error, Result};
pub use event::{create_event_channel, GateEvent, GateEventsChannel, GateEventsSender, OperatorLog};
pub use gate::{GateBuilder, GateHandle, RunningGate};
pub use gateway::{Claimant, ClaimantId, InboundEvent, Reply};
pub use verify::{AttemptOutcome, Verifier};
