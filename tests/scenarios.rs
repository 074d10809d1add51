//! End-to-end merges of the reference scenarios against the in-memory
//! repository and metadata store.

mod common;

use std::time::Duration;

use common::*;
use reconcile::config::ReconcileConfig;
use reconcile::engine::{MergeStart, WaitPolicy};
use reconcile::error::{MergeError, MergeWarning};
use reconcile::merge_state::MergePhase;
use reconcile::model::conflict::ConflictKind;
use reconcile::model::resolution::{AuditOutcome, Confidence, DecidedBy, Decision, RecommendedSide};
use reconcile::store::MetadataStore;

fn started(fx: &Fixture) -> reconcile::MergeHandle {
    match fx.engine.start_merge(&source(), &target()).unwrap() {
        MergeStart::Started(handle) => handle,
        MergeStart::Summary(s) => panic!("expected a merge, got summary {s:?}"),
    }
}

#[test]
fn scenario_a_pure_source_wins_automatically() {
    let fx = scenario_a(ReconcileConfig::default());
    let handle = started(&fx);

    let conflicts = fx.engine.conflicts(&handle);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::SymbolAddedBoth);
    assert_eq!(conflicts[0].symbol.as_deref(), Some("calc"));

    let session = handle.session();
    let strategy = &session.strategies[&conflicts[0].id];
    assert_eq!(strategy.recommended_side, RecommendedSide::Source);
    assert_eq!(strategy.confidence, Confidence::from_percent(90));
    assert!(fx.engine.list_pending_conflicts(&handle).is_empty());

    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records.len(), 1);
    assert_eq!(entry.records[0].decided_by, DecidedBy::Auto);
    assert_eq!(entry.records[0].decision, Decision::KeepSource);
    assert_eq!(handle.phase(), MergePhase::Done);

    let merged = fx.file_on(TARGET, "calc.py").unwrap();
    assert!(merged.contains("return a + b"));
    assert!(!merged.contains("print"));
    assert_eq!(fx.file_on(TARGET, "README.md").as_deref(), Some("# calc\n"));

    // The winning row now describes the target branch too.
    let row = fx
        .store()
        .function_metadata(&target(), "calc.py", "calc")
        .unwrap()
        .unwrap();
    assert_eq!(row, pure(10));
    assert!(fx.store().is_merged(&source()).unwrap());
}

#[test]
fn scenario_b_more_passing_tests_wins() {
    let fx = calc_fixture(CALC_PURE, CALC_PURE_ALT, ReconcileConfig::default());
    fx.store().insert(&source(), "calc.py", "calc", pure(10));
    fx.store().insert(&target(), "calc.py", "calc", pure(12));

    let handle = started(&fx);
    let session = handle.session();
    assert_eq!(session.conflicts.len(), 1);
    let strategy = &session.strategies[&session.conflicts[0].id];
    assert_eq!(strategy.recommended_side, RecommendedSide::Target);
    assert_eq!(strategy.confidence, Confidence::from_percent(85));

    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records[0].decision, Decision::KeepTarget);
    let merged = fx.file_on(TARGET, "calc.py").unwrap();
    assert!(merged.contains("total = a + b"));
}

#[test]
fn scenario_c_disjoint_files_merge_without_conflicts() {
    let readme: &[u8] = b"# project\n";
    let fx = Fixture::new(
        &[("README.md", readme)],
        &[("README.md", readme), ("a.py", b"def a():\n    return 1\n")],
        &[("README.md", readme), ("b.py", b"def b():\n    return 2\n")],
        ReconcileConfig::default(),
    );
    let handle = started(&fx);
    assert!(fx.engine.conflicts(&handle).is_empty());
    assert_eq!(handle.phase(), MergePhase::Resolving);

    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert!(entry.records.is_empty());
    assert!(fx.file_on(TARGET, "a.py").is_some());
    assert!(fx.file_on(TARGET, "b.py").is_some());
    assert_eq!(fx.file_on(SOURCE, "b.py"), None);

    let commit = entry.commit().unwrap();
    assert_eq!(fx.tip(TARGET), commit);
}

#[test]
fn scenario_d_unavailable_metadata_waits_for_a_decision() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = started(&fx);

    let pending = fx.engine.list_pending_conflicts(&handle);
    assert_eq!(pending.len(), 1);
    let session = handle.session();
    let strategy = &session.strategies[&pending[0].id];
    assert_eq!(strategy.recommended_side, RecommendedSide::Manual);
    assert_eq!(strategy.confidence, Confidence::from_percent(20));
    assert!(
        handle
            .warnings()
            .iter()
            .any(|w| matches!(w, MergeWarning::MetadataUnavailable { .. }))
    );

    match fx.engine.finalize(&handle, WaitPolicy::NoWait) {
        Err(MergeError::PendingConflicts { pending: ids, .. }) => {
            assert_eq!(ids, vec![pending[0].id.clone()]);
        }
        other => panic!("expected PendingConflicts, got {other:?}"),
    }
    match fx
        .engine
        .finalize(&handle, WaitPolicy::Timeout(Duration::from_millis(50)))
    {
        Err(MergeError::MediationTimeout { pending: 1, .. }) => {}
        other => panic!("expected MediationTimeout, got {other:?}"),
    }
    // A timeout leaves the merge open.
    assert_eq!(handle.phase(), MergePhase::Resolving);

    let record = fx
        .engine
        .submit_resolution(&handle, pending[0].id.as_str(), Decision::KeepTarget)
        .unwrap();
    assert_eq!(record.decided_by, DecidedBy::User);
    assert!(record.strategy.rationale.contains("unavailable"));

    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records, vec![record]);
    assert!(fx.file_on(TARGET, "calc.py").unwrap().contains("print"));
}

#[test]
fn addition_with_unreadable_row_on_target_waits_for_a_decision() {
    let with_added: &[u8] = b"def calc(a, b):\n    return a + b\n\n\ndef added():\n    return 2\n";
    let fx = Fixture::new(
        &[("calc.py", CALC_PURE)],
        &[("calc.py", with_added)],
        &[("calc.py", CALC_PURE_ALT)],
        ReconcileConfig::default(),
    );
    fx.store().set_row_unavailable(&target(), "calc.py", "added");
    let handle = started(&fx);

    let pending = fx.engine.list_pending_conflicts(&handle);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ConflictKind::MetadataRowConflict);
    assert_eq!(pending[0].symbol.as_deref(), Some("added"));
    let strategy = handle.session().strategies[&pending[0].id].clone();
    assert_eq!(strategy.recommended_side, RecommendedSide::Manual);
    assert_eq!(strategy.confidence, Confidence::from_percent(20));
    assert!(strategy.rationale.contains("unavailable"));
    assert!(matches!(
        fx.engine.finalize(&handle, WaitPolicy::NoWait),
        Err(MergeError::PendingConflicts { .. })
    ));

    fx.engine
        .submit_resolution(&handle, pending[0].id.as_str(), Decision::KeepSource)
        .unwrap();
    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records.len(), 1);
    let merged = fx.file_on(TARGET, "calc.py").unwrap();
    assert!(merged.contains("def added()"));
    assert!(merged.contains("total = a + b"));
}

#[test]
fn converged_file_with_disagreeing_rows_is_decided() {
    let swapped: &[u8] = b"def calc(a, b):\n    return b + a\n";
    let fx = Fixture::new(
        &[("calc.py", CALC_PURE)],
        &[("calc.py", swapped)],
        &[("calc.py", swapped)],
        ReconcileConfig::default(),
    );
    fx.store().insert(&source(), "calc.py", "calc", pure(10));
    fx.store().insert(&target(), "calc.py", "calc", impure(3));
    let before = fx.file_on(TARGET, "calc.py");
    let handle = started(&fx);

    let conflicts = fx.engine.conflicts(&handle);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::MetadataRowConflict);
    assert!(conflicts[0].is_metadata_only());

    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records.len(), 1);
    assert_eq!(entry.records[0].decision, Decision::KeepSource);
    assert_eq!(entry.records[0].decided_by, DecidedBy::Auto);
    assert_eq!(fx.file_on(TARGET, "calc.py"), before);
    let row = fx
        .store()
        .function_metadata(&target(), "calc.py", "calc")
        .unwrap()
        .unwrap();
    assert_eq!(row, pure(10));
}

#[test]
fn indefinite_finalize_wakes_when_last_decision_arrives() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = started(&fx);
    let conflict_id = fx.engine.list_pending_conflicts(&handle)[0].id.clone();

    let entry = std::thread::scope(|s| {
        let waiter = s.spawn(|| fx.engine.finalize(&handle, WaitPolicy::Indefinite));
        std::thread::sleep(Duration::from_millis(100));
        fx.engine
            .submit_resolution(&handle, conflict_id.as_str(), Decision::KeepSource)
            .unwrap();
        waiter.join().unwrap()
    })
    .unwrap();
    assert_eq!(entry.records.len(), 1);
    assert_eq!(entry.records[0].decision, Decision::KeepSource);
}

#[test]
fn keep_both_renames_newer_side() {
    let fx = calc_fixture(CALC_PURE, CALC_PURE_ALT, ReconcileConfig::default());
    fx.store().insert(&source(), "calc.py", "calc", pure(10));
    fx.store().insert(&target(), "calc.py", "calc", pure(10));

    let handle = started(&fx);
    let pending = fx.engine.list_pending_conflicts(&handle);
    assert_eq!(pending.len(), 1, "keep-both needs confirmation by default");
    let session = handle.session();
    let strategy = &session.strategies[&pending[0].id];
    assert_eq!(strategy.recommended_side, RecommendedSide::Both);
    assert_eq!(strategy.confidence, Confidence::from_percent(70));

    fx.engine
        .submit_resolution(&handle, pending[0].id.as_str(), Decision::KeepBothRenamed)
        .unwrap();
    fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();

    // main's tip is newer, so its definition takes the suffix.
    let merged = fx.file_on(TARGET, "calc.py").unwrap();
    assert!(merged.contains("def calc(a, b):"));
    assert!(merged.contains("def calc_main(a, b):"));
}

#[test]
fn keep_both_applies_automatically_when_enabled() {
    let mut config = ReconcileConfig::default();
    config.merge.auto_accept_keep_both = true;
    let fx = calc_fixture(CALC_PURE, CALC_PURE_ALT, config);
    fx.store().insert(&source(), "calc.py", "calc", pure(10));
    fx.store().insert(&target(), "calc.py", "calc", pure(10));

    let handle = started(&fx);
    assert!(fx.engine.list_pending_conflicts(&handle).is_empty());
    let entry = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.records[0].decision, Decision::KeepBothRenamed);
    assert_eq!(entry.records[0].decided_by, DecidedBy::Auto);
}

#[test]
fn externally_supplied_content_replaces_definition() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = started(&fx);
    let id = fx.engine.list_pending_conflicts(&handle)[0].id.clone();
    fx.engine
        .submit_resolution(
            &handle,
            id.as_str(),
            Decision::ExternallySupplied {
                content: "def calc(a, b):\n    return b + a\n".to_owned(),
            },
        )
        .unwrap();
    fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert!(fx.file_on(TARGET, "calc.py").unwrap().contains("return b + a"));
}

#[test]
fn invalid_decisions_are_rejected() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = started(&fx);
    let id = fx.engine.list_pending_conflicts(&handle)[0].id.clone();

    assert!(matches!(
        fx.engine.submit_resolution(&handle, "c-000000000000", Decision::KeepSource),
        Err(MergeError::UnknownConflict { .. })
    ));
    fx.engine
        .submit_resolution(&handle, id.as_str(), Decision::KeepSource)
        .unwrap();
    assert!(matches!(
        fx.engine.submit_resolution(&handle, id.as_str(), Decision::KeepTarget),
        Err(MergeError::AlreadyResolved { .. })
    ));
}

#[test]
fn merging_again_finds_no_conflict_for_resolved_symbol() {
    let fx = scenario_a(ReconcileConfig::default());
    let handle = started(&fx);
    fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();

    let again = started(&fx);
    assert!(fx.engine.conflicts(&again).is_empty());
    assert_ne!(again.id(), handle.id());
}

#[test]
fn finalize_twice_returns_same_entry() {
    let fx = scenario_a(ReconcileConfig::default());
    let handle = started(&fx);
    let first = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    let tip = fx.tip(TARGET);

    let second = fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert_eq!(first, second);
    assert_eq!(fx.tip(TARGET), tip);

    let completed = fx
        .engine
        .audit_entries()
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.outcome, AuditOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(fx.store().audit_entries().unwrap(), vec![first]);
}

#[test]
fn missing_source_branch_is_rejected_and_audited() {
    let fx = scenario_a(ReconcileConfig::default());
    let err = fx
        .engine
        .start_merge(&branch("nope"), &target())
        .unwrap_err();
    let reason = err.abort_reason().expect("abort reason");
    assert_eq!(reason.phase, MergePhase::Validating);
    assert_eq!(reason.cause, reconcile::error::AbortCause::BranchNotFound);

    let entries = fx.engine.audit_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(matches!(entries[0].outcome, AuditOutcome::Aborted { .. }));
    assert!(entries[0].records.is_empty());
    assert!(fx.engine.merges().unwrap().is_empty());
}

#[test]
fn divergence_summary_mode_starts_nothing() {
    let mut config = ReconcileConfig::default();
    config.merge.divergence_ceiling = 0;
    config.merge.on_divergence = reconcile::config::DivergencePolicy::Summarize;
    let fx = scenario_a(config);

    match fx.engine.start_merge(&source(), &target()).unwrap() {
        MergeStart::Summary(summary) => {
            assert_eq!(summary.modified_both, vec!["calc.py".to_owned()]);
            assert_eq!(summary.ceiling, 0);
        }
        MergeStart::Started(_) => panic!("expected a summary"),
    }
    assert!(fx.engine.merges().unwrap().is_empty());
    // Nothing was claimed, so a merge can still start.
    let _ = started(&fx);
}

#[test]
fn divergence_warn_mode_continues_with_warning() {
    let mut config = ReconcileConfig::default();
    config.merge.divergence_ceiling = 0;
    let fx = scenario_a(config);
    let handle = started(&fx);
    assert!(
        handle
            .warnings()
            .iter()
            .any(|w| matches!(w, MergeWarning::DivergenceTooLarge { modified: 1, ceiling: 0 }))
    );
    assert_eq!(fx.engine.conflicts(&handle).len(), 1);
}
