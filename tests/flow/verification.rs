//! End-to-end verification scenarios against in-memory collaborators.

use super::harness::{
    RecordingHandle, ScriptedRoster, TestEngine, HELPER_ROLE, REVIEW_CHANNEL, WELCOME_CHANNEL,
};
use admission_gate::audit::AuditOutcome;
use admission_gate::gateway::{Claimant, ClaimantId, Reply};
use admission_gate::roster::FetchError;
use admission_gate::{AttemptOutcome, GateEvent};
use std::time::Duration;
use tokio::time::Instant;

const JANE: u64 = 1001;
const BOB: u64 = 1002;

#[tokio::test(start_paused = true)]
async fn test_listed_claimant_is_granted() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe", "RA_7_alice"]));
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Granted);
    assert!(engine.credentials.holds(ClaimantId(JANE)));
    assert_eq!(handle.ack(), Some(Reply::Verified));
    assert!(handle.follow_ups().is_empty());

    let records = engine.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].claimant_id, ClaimantId(JANE));
    assert_eq!(records[0].label, "RA_42_janedoe");
    assert_eq!(records[0].outcome, AuditOutcome::Granted);

    let welcomes = engine.notifier.posts_to(WELCOME_CHANNEL);
    assert_eq!(welcomes.len(), 1);
    assert!(welcomes[0].contains("<@1001>"));
}

#[tokio::test(start_paused = true)]
async fn test_bad_label_never_touches_roster() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    let handle = RecordingHandle::new();

    for label in ["janedoe", "RA42_janedoe", "RA_abc_janedoe", "RA_42_", " RA_42_janedoe"] {
        let outcome = engine
            .verifier
            .handle_verify(Claimant::new(JANE, label), RecordingHandle::new())
            .await;
        assert_eq!(outcome, AttemptOutcome::FormatRejected, "label {label:?}");
    }

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "janedoe"), handle.clone())
        .await;
    assert_eq!(outcome, AttemptOutcome::FormatRejected);
    assert_eq!(handle.ack(), Some(Reply::BadFormat));
    assert_eq!(engine.roster.calls(), 0);
    assert!(!engine.credentials.holds(ClaimantId(JANE)));
    assert!(engine
        .audit
        .records()
        .iter()
        .all(|r| r.outcome == AuditOutcome::Denied));
}

#[tokio::test(start_paused = true)]
async fn test_unlisted_claimant_is_denied() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(BOB, "RA_7_bob"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Denied);
    assert_eq!(handle.ack(), Some(Reply::NotOnRoster));
    assert_eq!(engine.credentials.grant_calls(), 0);
    let records = engine.audit.for_claimant(ClaimantId(BOB));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Denied);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_roster_backs_off_then_cools_down() {
    let engine = TestEngine::new(ScriptedRoster::failing(FetchError::RateLimited(
        "429".to_string(),
    )));
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::RosterError);
    assert_eq!(engine.roster.calls(), 4);
    let gaps = engine.roster.gaps();
    assert_eq!(gaps.len(), 3);
    assert!(gaps.windows(2).all(|pair| pair[1] >= pair[0]), "gaps {gaps:?}");
    assert!(gaps[0] >= Duration::from_millis(500));

    // Backoff outlasted the ack budget: provisional ack, then the answer.
    assert_eq!(handle.ack(), Some(Reply::Working));
    assert_eq!(handle.follow_ups(), vec![Reply::RosterOffline]);
    assert_eq!(engine.verifier.guard().len(), 0);

    // Cooling down: no network access, immediate failure.
    let started = Instant::now();
    let again = RecordingHandle::new();
    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(BOB, "RA_7_bob"), again.clone())
        .await;
    assert_eq!(outcome, AttemptOutcome::RosterError);
    assert_eq!(engine.roster.calls(), 4);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(again.ack(), Some(Reply::RosterOffline));

    let errored = engine
        .audit
        .records()
        .iter()
        .filter(|r| r.outcome == AuditOutcome::Errored)
        .count();
    assert_eq!(errored, 2);
}

#[tokio::test(start_paused = true)]
async fn test_roster_recovers_after_cooldown() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    for _ in 0..4 {
        engine
            .roster
            .push(Err(FetchError::Network("connection reset".to_string())));
    }

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), RecordingHandle::new())
        .await;
    assert_eq!(outcome, AttemptOutcome::RosterError);
    assert!(engine.verifier.roster().is_cooling_down());

    tokio::time::sleep(Duration::from_secs(61)).await;

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), RecordingHandle::new())
        .await;
    assert_eq!(outcome, AttemptOutcome::Granted);
    assert_eq!(engine.roster.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_missing_roster_is_not_retried() {
    let engine = TestEngine::new(ScriptedRoster::failing(FetchError::NotFound(
        "no such sheet".to_string(),
    )));
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::RosterError);
    assert_eq!(engine.roster.calls(), 1);
    assert!(!engine.verifier.roster().is_cooling_down());
    assert_eq!(handle.ack(), Some(Reply::RosterOffline));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_presses_run_once() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.roster.set_latency(Duration::from_secs(1));
    let first = RecordingHandle::new();
    let second = RecordingHandle::new();

    let (a, b) = tokio::join!(
        engine
            .verifier
            .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), first.clone()),
        engine
            .verifier
            .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), second.clone()),
    );

    assert_eq!(a, AttemptOutcome::Granted);
    assert_eq!(b, AttemptOutcome::AlreadyInFlight);
    assert_eq!(second.ack(), Some(Reply::PleaseWait));
    assert_eq!(first.final_reply(), Some(Reply::Verified));
    assert_eq!(engine.credentials.grant_calls(), 1);
    assert_eq!(engine.audit.for_claimant(ClaimantId(JANE)).len(), 1);
    assert!(engine.verifier.guard().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_many_claimants_share_one_refetch() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_1_a", "RA_2_b", "RA_3_c"]));
    engine.roster.set_latency(Duration::from_secs(1));

    let (a, b, c) = tokio::join!(
        engine
            .verifier
            .handle_verify(Claimant::new(1, "RA_1_a"), RecordingHandle::new()),
        engine
            .verifier
            .handle_verify(Claimant::new(2, "RA_2_b"), RecordingHandle::new()),
        engine
            .verifier
            .handle_verify(Claimant::new(3, "RA_9_z"), RecordingHandle::new()),
    );

    assert_eq!(a, AttemptOutcome::Granted);
    assert_eq!(b, AttemptOutcome::Granted);
    assert_eq!(c, AttemptOutcome::Denied);
    assert_eq!(engine.roster.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_grant_is_idempotent() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.credentials.preload(ClaimantId(JANE));

    for _ in 0..2 {
        let handle = RecordingHandle::new();
        let outcome = engine
            .verifier
            .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
            .await;
        assert_eq!(outcome, AttemptOutcome::Granted);
        assert_eq!(handle.ack(), Some(Reply::Verified));
    }

    assert_eq!(engine.credentials.grant_calls(), 0);
    assert!(engine.credentials.holds(ClaimantId(JANE)));
    let records = engine.audit.for_claimant(ClaimantId(JANE));
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.outcome == AuditOutcome::Granted));
}

#[tokio::test(start_paused = true)]
async fn test_slow_roster_gets_provisional_ack() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.roster.set_latency(Duration::from_secs(4));
    let handle = RecordingHandle::new();
    let started = Instant::now();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Granted);
    assert_eq!(handle.ack_count(), 1);
    assert_eq!(handle.ack(), Some(Reply::Working));
    let acked_after = handle.ack_time().map(|at| at - started);
    assert_eq!(acked_after, Some(Duration::from_millis(2_500)));
    assert_eq!(handle.follow_ups(), vec![Reply::Verified]);
}

#[tokio::test(start_paused = true)]
async fn test_panic_releases_guard() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.credentials.panic_on_grant(true);
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Errored);
    assert_eq!(handle.ack(), Some(Reply::SomethingWentWrong));
    assert!(!engine.verifier.guard().is_in_flight(ClaimantId(JANE)));
    let records = engine.audit.for_claimant(ClaimantId(JANE));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Errored);

    engine.credentials.panic_on_grant(false);
    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), RecordingHandle::new())
        .await;
    assert_eq!(outcome, AttemptOutcome::Granted);
}

#[tokio::test(start_paused = true)]
async fn test_refused_grant_is_reported() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.credentials.refuse_grants(true);
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Errored);
    assert_eq!(handle.ack(), Some(Reply::GrantFailed));
    assert!(engine.verifier.guard().is_empty());
    assert!(engine.notifier.posts_to(WELCOME_CHANNEL).is_empty());
    assert_eq!(
        engine.audit.for_claimant(ClaimantId(JANE))[0].outcome,
        AuditOutcome::Errored
    );
}

#[tokio::test(start_paused = true)]
async fn test_throttled_grant_is_retried_once() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.credentials.throttle_grants(1);
    let handle = RecordingHandle::new();
    let started = Instant::now();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Granted);
    assert_eq!(engine.credentials.grant_calls(), 2);
    assert!(engine.credentials.holds(ClaimantId(JANE)));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(handle.final_reply(), Some(Reply::Verified));
    assert_eq!(
        engine.audit.for_claimant(ClaimantId(JANE))[0].outcome,
        AuditOutcome::Granted
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_grant_throttle_is_reported() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine.credentials.throttle_grants(2);
    let handle = RecordingHandle::new();

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), handle.clone())
        .await;

    assert_eq!(outcome, AttemptOutcome::Errored);
    assert_eq!(engine.credentials.grant_calls(), 2);
    assert!(!engine.credentials.holds(ClaimantId(JANE)));
    assert_eq!(handle.final_reply(), Some(Reply::GrantFailed));
    assert!(engine.notifier.posts_to(WELCOME_CHANNEL).is_empty());
    assert!(engine.verifier.guard().is_empty());
    let records = engine.audit.for_claimant(ClaimantId(JANE));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::Errored);
}

#[tokio::test(start_paused = true)]
async fn test_expired_handle_still_audits() {
    let mut engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));

    let outcome = engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), RecordingHandle::expired())
        .await;

    assert_eq!(outcome, AttemptOutcome::Granted);
    assert_eq!(engine.audit.records().len(), 1);

    let mut dropped = false;
    while let Ok(event) = engine.events.try_recv() {
        if matches!(event, GateEvent::DeliveryDropped { claimant, .. } if claimant == ClaimantId(JANE)) {
            dropped = true;
        }
    }
    assert!(dropped);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_reaches_reviewers_every_time() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&[]));

    for _ in 0..2 {
        let handle = RecordingHandle::new();
        assert!(engine.escalation.escalate(ClaimantId(BOB), handle.clone()).await);
        assert_eq!(handle.ack(), Some(Reply::EscalationSent));
    }

    let posts = engine.notifier.posts_to(REVIEW_CHANNEL);
    assert_eq!(posts.len(), 2);
    assert!(posts[0].starts_with(&HELPER_ROLE.mention()));
    assert!(posts[0].contains("<@1002>"));
    let records = engine.audit.for_claimant(ClaimantId(BOB));
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.outcome == AuditOutcome::Escalated));
}

#[tokio::test(start_paused = true)]
async fn test_unverify_revokes_and_audits() {
    let engine = TestEngine::new(ScriptedRoster::with_entries(&["RA_42_janedoe"]));
    engine
        .verifier
        .handle_verify(Claimant::new(JANE, "RA_42_janedoe"), RecordingHandle::new())
        .await;

    assert!(engine.verifier.unverify(ClaimantId(JANE)).await.expect("revoke"));
    assert!(!engine.credentials.holds(ClaimantId(JANE)));
    assert!(!engine.verifier.unverify(ClaimantId(JANE)).await.expect("revoke"));

    let outcomes: Vec<_> = engine
        .audit
        .for_claimant(ClaimantId(JANE))
        .iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Granted, AuditOutcome::Revoked]);
}
