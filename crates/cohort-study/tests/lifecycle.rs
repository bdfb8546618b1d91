//! End-to-end lifecycle coverage on a disk-backed store.

use std::collections::BTreeMap;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};

use cohort_core::{CohortError, StudyId};
use cohort_study::codes::CodeConstraints;
use cohort_study::run::{AccessType, RunConfig};
use cohort_study::store::StudyStore;

fn config(access_type: AccessType) -> RunConfig {
    RunConfig {
        size: None,
        access_type,
        save_incomplete_data: false,
        completion_url: None,
        cancel_url: None,
        briefing_url: None,
        debriefing_url: None,
        session_args: BTreeMap::new(),
    }
}

fn no_params() -> BTreeMap<String, String> {
    BTreeMap::new()
}

#[test]
fn sized_run_fills_and_finishes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec!["ada".into()]).unwrap();

    let mut cfg = config(AccessType::Anyone);
    cfg.size = Some(2);
    let _ = store.start_run(&id, cfg).unwrap();

    let first = store.open_session(&id, &no_params()).unwrap();
    let second = store.open_session(&id, &no_params()).unwrap();
    assert_eq!(first.as_str(), "1");
    assert_eq!(second.as_str(), "2");

    store.save_data(&id, &first, "results", "a", "CSV").unwrap();
    let _ = store.close_session(&id, &first, true).unwrap();
    assert_eq!(
        store.study_summary(&id).unwrap().remaining_sessions,
        Some(1)
    );

    store.save_data(&id, &second, "results", "b", "CSV").unwrap();
    let _ = store.close_session(&id, &second, true).unwrap();

    // Capacity reached: the run retired itself, exactly once
    let summary = store.study_summary(&id).unwrap();
    assert!(!summary.active);
    assert_matches!(
        store.open_session(&id, &no_params()),
        Err(CohortError::NotActive { .. })
    );
}

#[test]
fn uniform_condition_assignment_balances() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();

    let mut cfg = config(AccessType::Anyone);
    let _ = cfg
        .session_args
        .insert("condition".into(), "uniform(A,B)".into());
    let _ = store.start_run(&id, cfg).unwrap();

    for _ in 0..4 {
        let token = store.open_session(&id, &no_params()).unwrap();
        let _ = store.close_session(&id, &token, true).unwrap();
    }

    // Counters are part of the durable run snapshot
    let meta: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("studies/stroop/meta.json")).unwrap(),
    )
    .unwrap();
    let counts = &meta["run"]["arg_counts"]["condition"];
    assert_eq!(counts["A"], 2);
    assert_eq!(counts["B"], 2);
    assert_eq!(meta["run"]["num_sessions"], 4);
}

#[test]
fn invite_expiry_is_lazy_and_per_code() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();
    let _ = store.start_run(&id, config(AccessType::InviteOnly)).unwrap();

    let now = Utc::now();
    let expiring = CodeConstraints {
        expires_at: Some(now + Duration::hours(1)),
        session_limit: Some(1),
        unique_session: false,
    };
    let redeemed_code = store.issue_invite(&id, None, expiring.clone()).unwrap();
    let unredeemed_code = store.issue_invite(&id, None, expiring).unwrap();

    let joined = store
        .redeem_code_at(&redeemed_code, &no_params(), "c1", now)
        .unwrap();

    // Past the timeout: the never-redeemed code expires and is removed
    let later = now + Duration::hours(2);
    let err = store
        .redeem_code_at(&unredeemed_code, &no_params(), "c2", later)
        .unwrap_err();
    assert_matches!(err, CohortError::Expired { .. });
    assert_matches!(
        store
            .redeem_code_at(&unredeemed_code, &no_params(), "c2", later)
            .unwrap_err(),
        CohortError::NotFound { .. }
    );

    // The already-redeemed code's session is still closeable; the code
    // is removed by its session limit, not its timeout
    store
        .save_data(&id, &joined.token, "results", "x", "CSV")
        .unwrap();
    let _ = store.close_session(&id, &joined.token, true).unwrap();
    assert_matches!(
        store
            .redeem_code_at(&redeemed_code, &no_params(), "c3", later)
            .unwrap_err(),
        CohortError::NotFound { .. }
    );
}

#[test]
fn save_batch_skips_traversal_keys_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();
    let run_id = store.start_run(&id, config(AccessType::Anyone)).unwrap();

    let token = store.open_session(&id, &no_params()).unwrap();
    store.save_data(&id, &token, "ok", "1", "CSV").unwrap();
    store.save_data(&id, &token, "../bad", "2", "CSV").unwrap();
    let _ = store.close_session(&id, &token, true).unwrap();

    let data_dir = store.run_data_dir(&id, run_id).unwrap();
    let names: Vec<String> = std::fs::read_dir(&data_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["ok".to_string()]);
    assert!(!dir.path().join("studies/bad").exists());
}

#[test]
fn cancelled_run_closes_sessions_in_bulk() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();
    let mut cfg = config(AccessType::Anyone);
    cfg.save_incomplete_data = true;
    let run_id = store.start_run(&id, cfg).unwrap();

    let token = store.open_session(&id, &no_params()).unwrap();
    store.save_data(&id, &token, "partial", "p", "CSV").unwrap();
    let _ = store.open_session(&id, &no_params()).unwrap();

    store.cancel_run(&id).unwrap();

    let summary = store.study_summary(&id).unwrap();
    assert!(!summary.active);
    assert_eq!(summary.live_sessions, 0);

    // Incomplete data was saved because the run opted in
    let data = store.run_data_dir(&id, run_id).unwrap().join("partial");
    assert_eq!(std::fs::read_to_string(data).unwrap(), "p");
}

#[test]
fn run_finish_unbinds_sessions_cut_off_mid_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();

    let mut cfg = config(AccessType::InviteOnly);
    cfg.size = Some(1);
    let _ = store.start_run(&id, cfg).unwrap();
    let invite = store
        .issue_invite(
            &id,
            None,
            CodeConstraints {
                unique_session: true,
                ..CodeConstraints::default()
            },
        )
        .unwrap();

    // Two participants in flight; the second finishes the sized run,
    // force-closing the first mid-session
    let first = store.redeem_code(&invite, &no_params(), "caller-x").unwrap();
    let second = store.redeem_code(&invite, &no_params(), "caller-y").unwrap();
    let _ = store.close_session(&id, &second.token, true).unwrap();
    assert!(!store.study_summary(&id).unwrap().active);

    // A fresh run reuses token "1"; the cut-off caller must get a new
    // session, not a reattachment to the dead one
    let _ = store.start_run(&id, config(AccessType::InviteOnly)).unwrap();
    let rejoined = store.redeem_code(&invite, &no_params(), "caller-x").unwrap();
    assert!(!rejoined.reattached);
    assert_eq!(rejoined.token, first.token, "new run restarts tokens");
    assert!(store.save_data(&id, &rejoined.token, "k", "v", "CSV").is_ok());
}

#[test]
fn limited_invite_is_not_pinned_by_sessions_cut_off_at_finish() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();

    let mut cfg = config(AccessType::InviteOnly);
    cfg.size = Some(1);
    let _ = store.start_run(&id, cfg).unwrap();
    let invite = store
        .issue_invite(
            &id,
            None,
            CodeConstraints {
                session_limit: Some(3),
                ..CodeConstraints::default()
            },
        )
        .unwrap();

    let cut_off = store.redeem_code(&invite, &no_params(), "c1").unwrap();
    let finisher = store.redeem_code(&invite, &no_params(), "c2").unwrap();
    assert_ne!(cut_off.token, finisher.token);
    let _ = store.close_session(&id, &finisher.token, true).unwrap();

    // Both sessions are closed and credited; no phantom live session
    // keeps the code exhausted, so the third redemption goes through
    let _ = store.start_run(&id, config(AccessType::InviteOnly)).unwrap();
    let third = store.redeem_code(&invite, &no_params(), "c3").unwrap();
    assert!(!third.reattached);
    let _ = store.close_session(&id, &third.token, true).unwrap();

    // Now the limit is genuinely reached and the code is gone
    assert_matches!(
        store.redeem_code(&invite, &no_params(), "c4"),
        Err(CohortError::NotFound { .. })
    );
}

#[test]
fn revoking_invites_closes_their_sessions_but_spares_the_secret_url() {
    let dir = tempfile::tempdir().unwrap();
    let store = StudyStore::open(dir.path()).unwrap();
    let id = StudyId::from("stroop");
    store.create_study(&id, vec![]).unwrap();
    let _ = store
        .start_run(&id, config(AccessType::InviteAndUrl))
        .unwrap();

    let invite = store
        .issue_invite(&id, None, CodeConstraints::default())
        .unwrap();
    let secret = store.issue_secret_url(&id, None).unwrap();

    let via_invite = store.redeem_code(&invite, &no_params(), "c1").unwrap();
    let via_secret = store.redeem_code(&secret, &no_params(), "c2").unwrap();

    store.revoke_invites(&id).unwrap();

    // The invite's session is gone; the secret URL's lives on
    assert_matches!(
        store.save_data(&id, &via_invite.token, "k", "v", "CSV"),
        Err(CohortError::NotFound { .. })
    );
    assert!(store
        .save_data(&id, &via_secret.token, "k", "v", "CSV")
        .is_ok());
    assert_matches!(
        store.redeem_code(&invite, &no_params(), "c3"),
        Err(CohortError::NotFound { .. })
    );
    let rejoined = store.redeem_code(&secret, &no_params(), "c2").unwrap();
    assert!(rejoined.reattached);
}
