//! TTL snapshot cache over a roster source.
//!
//! Snapshots are immutable and shared behind `Arc`; a refetch builds a new
//! one and swaps it in. At most one refetch runs at a time and every caller
//! that needs it awaits the same result. Repeated transient failures put
//! the cache into a cooldown during which lookups fail without I/O.

use super::{FetchError, Lookup, RosterSource, RosterUnavailable};
use crate::config::RosterConfig;
use crate::event::{GateEvent, OperatorLog};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type RefreshResult = Result<Arc<RosterSnapshot>, RosterUnavailable>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Freshness, retry and cooldown policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPolicy {
    /// Age after which a snapshot is refetched.
    pub ttl: Duration,
    /// Timeout for a single fetch.
    pub fetch_timeout: Duration,
    /// Fetch attempts per refresh cycle.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Consecutive transient failures that start a cooldown.
    pub failure_threshold: u32,
    /// How long lookups fail fast once cooling down.
    pub cooldown: Duration,
}

impl Default for RosterPolicy {
    fn default() -> Self {
        Self::from(&RosterConfig::default())
    }
}

impl From<&RosterConfig> for RosterPolicy {
    fn from(config: &RosterConfig) -> Self {
        Self {
            ttl: config.ttl(),
            fetch_timeout: config.fetch_timeout(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
        }
    }
}

impl RosterPolicy {
    /// Upper bound on how long one refresh cycle can take.
    #[must_use]
    pub fn worst_case_latency(&self) -> Duration {
        let fetches = self.fetch_timeout.saturating_mul(self.max_attempts);
        (1..self.max_attempts)
            .map(|attempt| backoff_delay(self, attempt))
            .fold(fetches, Duration::saturating_add)
    }
}

/// Delay to wait after the `attempt`-th failed fetch (1-indexed).
///
/// `initial_backoff * 2^(attempt-1)`, clamped to `max_backoff`.
#[must_use]
pub fn backoff_delay(policy: &RosterPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    policy
        .initial_backoff
        .checked_mul(1u32 << exponent)
        .map_or(policy.max_backoff, |delay| delay.min(policy.max_backoff))
}

/// One immutable fetch of the roster column.
#[derive(Debug)]
pub struct RosterSnapshot {
    entries: Vec<String>,
    index: HashSet<String>,
    fetched_at: Instant,
    fetched_at_utc: DateTime<Utc>,
}

impl RosterSnapshot {
    /// Build a snapshot from raw column cells. Cells are trimmed and blank
    /// cells dropped; order is preserved.
    #[must_use]
    pub fn from_cells(cells: Vec<String>) -> Self {
        let entries: Vec<String> = cells
            .into_iter()
            .map(|cell| cell.trim().to_string())
            .filter(|cell| !cell.is_empty())
            .collect();
        let index = entries.iter().cloned().collect();
        Self {
            entries,
            index,
            fetched_at: Instant::now(),
            fetched_at_utc: Utc::now(),
        }
    }

    /// Whether the id is on the roster.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Entries in column order.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time since the fetch.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Wall-clock time of the fetch.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at_utc
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Lookups answered from a fresh snapshot.
    pub hits: u64,
    /// Fetch calls made against the source.
    pub fetches: u64,
    /// Fetch calls that failed.
    pub failures: u64,
    /// Snapshots swapped in.
    pub refreshes: u64,
    /// Lookups refused during a cooldown.
    pub cooldown_rejections: u64,
}

struct Inflight {
    id: u64,
    refresh: SharedRefresh,
    abort: AbortHandle,
}

#[derive(Default)]
struct State {
    snapshot: Option<Arc<RosterSnapshot>>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    inflight: Option<Inflight>,
    next_refresh_id: u64,
    shut_down: bool,
}

impl State {
    /// Forget the in-flight refetch, but only if it is still `id`.
    fn clear_inflight(&mut self, id: u64) {
        if self.inflight.as_ref().is_some_and(|inflight| inflight.id == id) {
            self.inflight = None;
        }
    }
}

/// Clears the in-flight slot when the refresh task ends, however it ends.
struct InflightGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inner.state.lock().clear_inflight(self.id);
    }
}

struct Inner {
    source: Arc<dyn RosterSource>,
    policy: RosterPolicy,
    state: Mutex<State>,
    stats: Mutex<CacheStats>,
    ops: OperatorLog,
}

/// Roster cache with explicit lifecycle (`init`, `refresh`, `teardown`).
///
/// Cheap to clone; clones share the same snapshot and in-flight refetch.
#[derive(Clone)]
pub struct RosterCache {
    inner: Arc<Inner>,
}

impl RosterCache {
    /// Create a cache over `source`. Nothing is fetched until the first
    /// lookup or an explicit [`init`](Self::init).
    #[must_use]
    pub fn new(source: Arc<dyn RosterSource>, policy: RosterPolicy, ops: OperatorLog) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                policy,
                state: Mutex::new(State::default()),
                stats: Mutex::new(CacheStats::default()),
                ops,
            }),
        }
    }

    /// Fetch the first snapshot eagerly.
    ///
    /// # Errors
    ///
    /// Returns `RosterUnavailable` if the fetch fails; the cache stays
    /// usable and will try again on the next lookup.
    pub async fn init(&self) -> Result<usize, RosterUnavailable> {
        info!("Initializing roster cache from {}", self.inner.source.describe());
        let snapshot = self.refresh().await?;
        Ok(snapshot.len())
    }

    /// Refetch regardless of snapshot age. Joins a refetch already in flight.
    ///
    /// # Errors
    ///
    /// Returns `RosterUnavailable` if the cache is cooling down, shut down,
    /// or the refetch fails.
    pub async fn refresh(&self) -> RefreshResult {
        let refresh = {
            let mut state = self.inner.state.lock();
            self.admit(&mut state)?;
            self.join_or_start(&mut state)
        };
        refresh.await
    }

    /// Drop the snapshot and cancel any in-flight refetch. Later lookups
    /// fail with [`RosterUnavailable::ShutDown`].
    pub fn teardown(&self) {
        let inflight = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            state.snapshot = None;
            state.inflight.take()
        };
        if let Some(inflight) = inflight {
            inflight.abort.abort();
        }
        debug!("Roster cache torn down");
    }

    /// Check whether `id` is on the roster.
    ///
    /// Answers from memory while the snapshot is fresh; otherwise awaits a
    /// (shared) refetch. Never takes longer than
    /// [`RosterPolicy::worst_case_latency`].
    ///
    /// # Errors
    ///
    /// Returns `RosterUnavailable` if no fresh snapshot can be obtained.
    pub async fn lookup(&self, id: &str) -> Result<Lookup, RosterUnavailable> {
        let snapshot = self.current().await?;
        Ok(if snapshot.contains(id) {
            Lookup::Present
        } else {
            Lookup::Absent
        })
    }

    /// A fresh snapshot, refetching if needed.
    ///
    /// # Errors
    ///
    /// Returns `RosterUnavailable` if no fresh snapshot can be obtained.
    pub async fn current(&self) -> RefreshResult {
        let refresh = {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return Err(RosterUnavailable::ShutDown);
            }
            if let Some(snapshot) = &state.snapshot {
                if snapshot.age() < self.inner.policy.ttl {
                    self.inner.stats.lock().hits += 1;
                    return Ok(Arc::clone(snapshot));
                }
            }
            self.admit(&mut state)?;
            self.join_or_start(&mut state)
        };
        refresh.await
    }

    /// The current snapshot, fresh or not.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<RosterSnapshot>> {
        self.inner.state.lock().snapshot.clone()
    }

    /// Whether lookups are currently failing fast.
    #[must_use]
    pub fn is_cooling_down(&self) -> bool {
        self.inner
            .state
            .lock()
            .cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Get current cache statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.lock().clone()
    }

    /// The policy in force.
    #[must_use]
    pub fn policy(&self) -> &RosterPolicy {
        &self.inner.policy
    }

    fn admit(&self, state: &mut State) -> Result<(), RosterUnavailable> {
        if state.shut_down {
            return Err(RosterUnavailable::ShutDown);
        }
        if let Some(until) = state.cooldown_until {
            let now = Instant::now();
            if now < until {
                self.inner.stats.lock().cooldown_rejections += 1;
                return Err(RosterUnavailable::CoolingDown {
                    remaining: until - now,
                });
            }
            state.cooldown_until = None;
        }
        Ok(())
    }

    fn join_or_start(&self, state: &mut State) -> SharedRefresh {
        if let Some(inflight) = &state.inflight {
            return inflight.refresh.clone();
        }

        let id = state.next_refresh_id;
        state.next_refresh_id = id.wrapping_add(1);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _clear = InflightGuard {
                inner: Arc::clone(&inner),
                id,
            };
            inner.refresh_cycle(id).await
        });
        let abort = task.abort_handle();
        let refresh = async move {
            task.await.unwrap_or_else(|e| {
                if e.is_cancelled() {
                    Err(RosterUnavailable::ShutDown)
                } else {
                    Err(RosterUnavailable::Exhausted {
                        attempts: 0,
                        last_error: format!("refresh task failed: {e}"),
                    })
                }
            })
        }
        .boxed()
        .shared();

        state.inflight = Some(Inflight {
            id,
            refresh: refresh.clone(),
            abort,
        });
        refresh
    }
}

impl Inner {
    async fn fetch_once(&self) -> Result<Vec<String>, FetchError> {
        self.stats.lock().fetches += 1;
        let fetch = AssertUnwindSafe(self.source.fetch()).catch_unwind();
        match tokio::time::timeout(self.policy.fetch_timeout, fetch).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FetchError::Other(format!(
                "roster source {} panicked",
                self.source.describe()
            ))),
            Err(_) => Err(FetchError::Network(format!(
                "fetch timed out after {:?}",
                self.policy.fetch_timeout
            ))),
        }
    }

    async fn refresh_cycle(&self, id: u64) -> RefreshResult {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match self.fetch_once().await {
                Ok(cells) => break Ok(Arc::new(RosterSnapshot::from_cells(cells))),
                Err(e) if e.is_permanent() => {
                    self.stats.lock().failures += 1;
                    warn!("Roster source {} is missing: {e}", self.source.describe());
                    break Err(RosterUnavailable::Missing(e.to_string()));
                }
                Err(e) => {
                    self.stats.lock().failures += 1;
                    let failures = {
                        let mut state = self.state.lock();
                        state.consecutive_failures += 1;
                        state.consecutive_failures
                    };
                    warn!(
                        "Roster fetch attempt {attempt}/{} failed ({failures} consecutive): {e}",
                        self.policy.max_attempts
                    );
                    if failures >= self.policy.failure_threshold
                        || attempt >= self.policy.max_attempts
                    {
                        break Err(RosterUnavailable::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    tokio::time::sleep(backoff_delay(&self.policy, attempt)).await;
                }
            }
        };

        let event = {
            let mut state = self.state.lock();
            state.clear_inflight(id);
            match &result {
                Ok(snapshot) if !state.shut_down => {
                    state.snapshot = Some(Arc::clone(snapshot));
                    state.consecutive_failures = 0;
                    state.cooldown_until = None;
                    self.stats.lock().refreshes += 1;
                    Some(GateEvent::RosterRefreshed {
                        entries: snapshot.len(),
                    })
                }
                Err(RosterUnavailable::Exhausted { .. })
                    if state.consecutive_failures >= self.policy.failure_threshold =>
                {
                    state.consecutive_failures = 0;
                    state.cooldown_until = Instant::now().checked_add(self.policy.cooldown);
                    if state.cooldown_until.is_none() {
                        warn!("Cooldown {:?} is out of range, skipping it", self.policy.cooldown);
                    }
                    Some(GateEvent::RosterCooldown {
                        duration: self.policy.cooldown,
                    })
                }
                _ => None,
            }
        };
        if let Some(event) = event {
            self.ops.emit(event);
        }

        result
    }
}
