//! Moderation helpers that go through the rate-limit retrier.
//!
//! Two operations need more than a single provider call: bulk message
//! deletion, which the provider caps per request and throttles, and timed
//! mutes, which need a reversal later on.
//!
//! Mute reversals are detached tokio tasks. They live only as long as the
//! process: a restart forgets every pending reversal and leaves those
//! claimants muted until someone lifts the mute by hand.

use crate::error::Result;
use crate::event::{GateEvent, OperatorLog};
use crate::gateway::{ChannelId, ClaimantId};
use crate::retry::Retrier;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest number of messages the provider deletes per request.
pub const PURGE_BATCH_SIZE: u32 = 100;

/// Provider calls used by the moderation helpers.
#[async_trait]
pub trait ModerationProvider: Send + Sync {
    /// Delete up to `count` of the most recent messages in `channel`.
    /// Returns how many were actually deleted.
    async fn delete_messages(&self, channel: ChannelId, count: u32) -> Result<u32>;

    /// Apply or lift a mute.
    async fn set_muted(&self, claimant: ClaimantId, muted: bool) -> Result<()>;
}

/// Delete `amount` recent messages from `channel`, one batch at a time.
///
/// Stops early once the provider deletes fewer messages than requested,
/// which means the channel has run out.
///
/// # Errors
///
/// Returns the first batch error the retrier could not absorb. Messages
/// deleted by earlier batches stay deleted.
pub async fn purge(
    provider: &dyn ModerationProvider,
    retrier: &Retrier,
    channel: ChannelId,
    amount: u32,
) -> Result<u32> {
    let mut remaining = amount;
    let mut deleted = 0;

    while remaining > 0 {
        let batch = remaining.min(PURGE_BATCH_SIZE);
        let removed = retrier
            .execute("purge batch", || provider.delete_messages(channel, batch))
            .await?;
        deleted += removed;
        remaining -= batch;
        debug!("Purged {removed}/{batch} messages from channel {}", channel.0);
        if removed < batch {
            break;
        }
    }

    info!("Purged {deleted} messages from channel {}", channel.0);
    Ok(deleted)
}

type Reversals = Arc<Mutex<HashMap<ClaimantId, (u64, JoinHandle<()>)>>>;

/// Applies mutes and schedules their reversal.
pub struct MuteScheduler {
    provider: Arc<dyn ModerationProvider>,
    retrier: Retrier,
    ops: OperatorLog,
    pending: Reversals,
    next_reversal: AtomicU64,
}

impl MuteScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(provider: Arc<dyn ModerationProvider>, retrier: Retrier, ops: OperatorLog) -> Self {
        Self {
            provider,
            retrier,
            ops,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_reversal: AtomicU64::new(0),
        }
    }

    /// Mute `claimant` and lift the mute after `duration`.
    ///
    /// Muting someone who already has a pending reversal replaces it, so
    /// the latest duration wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the mute itself could not be applied; no
    /// reversal is scheduled in that case.
    pub async fn mute(&self, claimant: ClaimantId, duration: Duration) -> Result<()> {
        self.retrier
            .execute("apply mute", || self.provider.set_muted(claimant, true))
            .await?;
        info!("{claimant} muted for {:?}", duration);

        let provider = Arc::clone(&self.provider);
        let retrier = self.retrier;
        let ops = self.ops.clone();
        let reversals = Arc::clone(&self.pending);
        let id = self.next_reversal.fetch_add(1, Ordering::Relaxed);

        // Held across the spawn so the task cannot finish before its entry exists.
        let mut pending = self.pending.lock();
        let reversal = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            match retrier
                .execute("lift mute", || provider.set_muted(claimant, false))
                .await
            {
                Ok(()) => info!("Mute lifted for {claimant}"),
                Err(e) => {
                    warn!("Failed to lift mute for {claimant}: {e}");
                    ops.emit(GateEvent::Error {
                        message: format!("failed to lift mute for {}: {e}", claimant.mention()),
                    });
                }
            }
            let mut reversals = reversals.lock();
            if reversals.get(&claimant).is_some_and(|(entry, _)| *entry == id) {
                reversals.remove(&claimant);
            }
        });

        if let Some((_, previous)) = pending.insert(claimant, (id, reversal)) {
            previous.abort();
        }
        Ok(())
    }

    /// Lift a mute now and cancel its scheduled reversal.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider refuses the change.
    pub async fn unmute(&self, claimant: ClaimantId) -> Result<()> {
        let reversal = self.pending.lock().remove(&claimant);
        if let Some((_, reversal)) = reversal {
            reversal.abort();
        }
        self.retrier
            .execute("lift mute", || self.provider.set_muted(claimant, false))
            .await?;
        info!("Mute lifted for {claimant}");
        Ok(())
    }

    /// Number of reversals still waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for MuteScheduler {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            warn!("{pending} mute reversals still pending; they end with the process");
        }
    }
}
