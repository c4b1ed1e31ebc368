//! In-memory collaborators for driving the engine without a chat provider.

use admission_gate::audit::MemoryAuditLog;
use admission_gate::config::EscalationConfig;
use admission_gate::event::{create_event_channel, GateEventsChannel, OperatorLog};
use admission_gate::gateway::{
    ChannelId, ClaimantId, CredentialSink, Notifier, Reply, ResponseHandle, RoleId,
};
use admission_gate::retry::Retrier;
use admission_gate::roster::{FetchError, RosterCache, RosterPolicy, RosterSource};
use admission_gate::verify::{
    Collaborators, EscalationNotifier, LabelFormat, Verifier, VerifierConfig,
};
use admission_gate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Channel reviewers watch in every scenario.
pub const REVIEW_CHANNEL: ChannelId = ChannelId(900);
/// Channel welcome messages go to.
pub const WELCOME_CHANNEL: ChannelId = ChannelId(901);
/// Role mentioned in review requests.
pub const HELPER_ROLE: RoleId = RoleId(77);

type FetchResult = std::result::Result<Vec<String>, FetchError>;

/// Roster source with a call counter and scripted answers.
pub struct ScriptedRoster {
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
    script: Mutex<VecDeque<FetchResult>>,
    fallback: Mutex<FetchResult>,
    latency: Mutex<Duration>,
}

impl ScriptedRoster {
    /// A roster that always returns `entries`.
    pub fn with_entries(entries: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(entries.iter().map(ToString::to_string).collect())),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// A roster whose every fetch fails with `error`.
    pub fn failing(error: FetchError) -> Arc<Self> {
        let roster = Self::with_entries(&[]);
        *roster.fallback.lock() = Err(error);
        roster
    }

    /// Answer the next fetches with these results, then fall back.
    pub fn push(&self, result: FetchResult) {
        self.script.lock().push_back(result);
    }

    /// Make every fetch take this long.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fetch calls made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive fetch calls.
    pub fn gaps(&self) -> Vec<Duration> {
        self.call_times
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl RosterSource for ScriptedRoster {
    async fn fetch(&self) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().push(Instant::now());
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().clone())
    }

    fn describe(&self) -> String {
        "scripted roster".to_string()
    }
}

/// Credential store backed by a set.
#[derive(Default)]
pub struct FakeCredentials {
    holders: Mutex<HashSet<ClaimantId>>,
    grant_calls: AtomicU32,
    throttled_grants: AtomicU32,
    refuse: AtomicBool,
    explode: AtomicBool,
}

impl FakeCredentials {
    /// Mark `claimant` as already holding the credential.
    pub fn preload(&self, claimant: ClaimantId) {
        self.holders.lock().insert(claimant);
    }

    /// Whether `claimant` holds the credential.
    pub fn holds(&self, claimant: ClaimantId) -> bool {
        self.holders.lock().contains(&claimant)
    }

    /// Grant calls made so far.
    pub fn grant_calls(&self) -> u32 {
        self.grant_calls.load(Ordering::SeqCst)
    }

    /// Throttle the next `count` grants, asking for a one second wait.
    pub fn throttle_grants(&self, count: u32) {
        self.throttled_grants.store(count, Ordering::SeqCst);
    }

    /// Make grants fail with a provider error.
    pub fn refuse_grants(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make grants panic.
    pub fn panic_on_grant(&self, explode: bool) {
        self.explode.store(explode, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialSink for FakeCredentials {
    async fn has_credential(&self, claimant: ClaimantId) -> Result<bool> {
        Ok(self.holds(claimant))
    }

    async fn grant(&self, claimant: ClaimantId) -> Result<()> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);
        if self.explode.load(Ordering::SeqCst) {
            panic!("credential store exploded");
        }
        let throttled = self
            .throttled_grants
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if throttled.is_ok() {
            return Err(Error::RateLimited {
                retry_after: Duration::from_secs(1),
            });
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Internal("missing permissions".to_string()));
        }
        self.holders.lock().insert(claimant);
        Ok(())
    }

    async fn revoke(&self, claimant: ClaimantId) -> Result<()> {
        self.holders.lock().remove(&claimant);
        Ok(())
    }
}

/// Notifier that records every post.
#[derive(Default)]
pub struct RecordingNotifier {
    posts: Mutex<Vec<(ChannelId, String)>>,
}

impl RecordingNotifier {
    /// Posts made to `channel`.
    pub fn posts_to(&self, channel: ChannelId) -> Vec<String> {
        self.posts
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post(&self, channel: ChannelId, message: &str) -> Result<()> {
        self.posts.lock().push((channel, message.to_string()));
        Ok(())
    }
}

/// Response handle recording the acknowledgment and follow-ups.
#[derive(Default)]
pub struct RecordingHandle {
    acks: Mutex<Vec<(Reply, Instant)>>,
    follow_ups: Mutex<Vec<Reply>>,
    expired: AtomicBool,
}

impl RecordingHandle {
    /// A fresh handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handle that is already unusable.
    pub fn expired() -> Arc<Self> {
        let handle = Self::new();
        handle.expired.store(true, Ordering::SeqCst);
        handle
    }

    /// The acknowledgment, if any.
    pub fn ack(&self) -> Option<Reply> {
        self.acks.lock().first().map(|(reply, _)| *reply)
    }

    /// When the acknowledgment was sent.
    pub fn ack_time(&self) -> Option<Instant> {
        self.acks.lock().first().map(|(_, at)| *at)
    }

    /// Number of acknowledgments (must never exceed one).
    pub fn ack_count(&self) -> usize {
        self.acks.lock().len()
    }

    /// Follow-ups in order.
    pub fn follow_ups(&self) -> Vec<Reply> {
        self.follow_ups.lock().clone()
    }

    /// The last reply the claimant saw.
    pub fn final_reply(&self) -> Option<Reply> {
        self.follow_ups.lock().last().copied().or_else(|| self.ack())
    }
}

#[async_trait]
impl ResponseHandle for RecordingHandle {
    async fn acknowledge(&self, reply: Reply) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::ResponseExpired);
        }
        self.acks.lock().push((reply, Instant::now()));
        Ok(())
    }

    async fn follow_up(&self, reply: Reply) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::ResponseExpired);
        }
        self.follow_ups.lock().push(reply);
        Ok(())
    }
}

/// Fast backoff policy used by most scenarios.
pub fn test_policy() -> RosterPolicy {
    RosterPolicy {
        ttl: Duration::from_secs(300),
        fetch_timeout: Duration::from_secs(10),
        max_attempts: 4,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(8),
        failure_threshold: 4,
        cooldown: Duration::from_secs(60),
    }
}

/// The engine wired to in-memory collaborators.
pub struct TestEngine {
    /// Orchestrator under test.
    pub verifier: Arc<Verifier>,
    /// Escalation path.
    pub escalation: EscalationNotifier,
    /// Roster source behind the cache.
    pub roster: Arc<ScriptedRoster>,
    /// Credential store.
    pub credentials: Arc<FakeCredentials>,
    /// Channel poster.
    pub notifier: Arc<RecordingNotifier>,
    /// Audit trail.
    pub audit: Arc<MemoryAuditLog>,
    /// Operator stream.
    pub events: GateEventsChannel,
}

impl TestEngine {
    /// Engine over `roster` with the default test policy.
    pub fn new(roster: Arc<ScriptedRoster>) -> Self {
        Self::with_policy(roster, test_policy())
    }

    /// Engine over `roster` with a custom policy.
    pub fn with_policy(roster: Arc<ScriptedRoster>, policy: RosterPolicy) -> Self {
        let (events_tx, events) = create_event_channel();
        let ops = OperatorLog::new(events_tx);
        let credentials = Arc::new(FakeCredentials::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let audit = Arc::new(MemoryAuditLog::new());

        let deps = Collaborators {
            credentials: credentials.clone(),
            notifier: notifier.clone(),
            audit: audit.clone(),
            retrier: Retrier::default(),
            ops: ops.clone(),
        };
        let cache = RosterCache::new(roster.clone(), policy, ops);
        let format = LabelFormat::new("RA", true).expect("valid prefix");
        let verifier = Verifier::new(
            format,
            cache,
            deps.clone(),
            VerifierConfig {
                ack_budget: Duration::from_millis(2_500),
                welcome_channel: Some(WELCOME_CHANNEL),
            },
        );
        let escalation = EscalationNotifier::new(
            deps,
            EscalationConfig {
                review_channel: Some(REVIEW_CHANNEL),
                helper_role: Some(HELPER_ROLE),
            },
            Duration::from_millis(2_500),
        );

        Self {
            verifier: Arc::new(verifier),
            escalation,
            roster,
            credentials,
            notifier,
            audit,
            events,
        }
    }
}
