//! Escalation to human review.
//!
//! Every explicit request is honoured: one post to the review channel and
//! one confirmation to the claimant. Nothing is remembered between calls.

use super::Collaborators;
use crate::audit::{AuditOutcome, AuditRecord};
use crate::config::EscalationConfig;
use crate::error::{Error, Result};
use crate::event::GateEvent;
use crate::gateway::{ClaimantId, Reply, ResponseHandle, Responder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Routes claimants to the human review channel.
pub struct EscalationNotifier {
    deps: Collaborators,
    config: EscalationConfig,
    ack_budget: Duration,
}

impl EscalationNotifier {
    /// Create a notifier.
    #[must_use]
    pub fn new(deps: Collaborators, config: EscalationConfig, ack_budget: Duration) -> Self {
        if config.review_channel.is_none() {
            tracing::warn!("No review channel configured, escalations will fail");
        }
        Self {
            deps,
            config,
            ack_budget,
        }
    }

    /// Handle one `EscalationRequested` event. Returns whether reviewers
    /// were notified.
    pub async fn escalate(&self, claimant: ClaimantId, handle: Arc<dyn ResponseHandle>) -> bool {
        let responder = Responder::new(claimant, handle, self.deps.ops.clone());
        let result = responder
            .within(self.ack_budget, self.notify_reviewers(claimant))
            .await;

        match result {
            Ok(()) => {
                info!("{claimant} escalated to human review");
                self.deps.ops.emit(GateEvent::Escalated { claimant });
                responder.send(Reply::EscalationSent).await;
                self.deps
                    .write_audit(AuditRecord::now(
                        claimant,
                        String::new(),
                        AuditOutcome::Escalated,
                        "manual verification requested",
                    ))
                    .await;
                true
            }
            Err(e) => {
                error!("Escalation for {claimant} failed: {e}");
                self.deps.ops.emit(GateEvent::Error {
                    message: format!("escalation for {} failed: {e}", claimant.mention()),
                });
                responder.send(Reply::EscalationFailed).await;
                self.deps
                    .write_audit(AuditRecord::now(
                        claimant,
                        String::new(),
                        AuditOutcome::Errored,
                        format!("escalation failed: {e}"),
                    ))
                    .await;
                false
            }
        }
    }

    async fn notify_reviewers(&self, claimant: ClaimantId) -> Result<()> {
        let channel = self
            .config
            .review_channel
            .ok_or_else(|| Error::Config("escalation.review_channel is not set".to_string()))?;

        let message = match self.config.helper_role {
            Some(role) => format!(
                "{} {} has requested manual verification.",
                role.mention(),
                claimant.mention()
            ),
            None => format!("{} has requested manual verification.", claimant.mention()),
        };

        self.deps
            .retrier
            .execute("review notification", || {
                self.deps.notifier.post(channel, &message)
            })
            .await
    }
}
