//! Merge sessions across handles, engines and processes.

mod common;

use common::*;
use reconcile::config::ReconcileConfig;
use reconcile::engine::WaitPolicy;
use reconcile::error::MergeError;
use reconcile::merge_state::MergePhase;
use reconcile::model::resolution::Decision;
use reconcile::{MemoryMetadataStore, MemoryRepo, Reconciler};

/// A second engine over an identical repository and the same state dir,
/// standing in for another process.
fn second_engine(fx: &Fixture) -> Engine {
    let repo = MemoryRepo::new();
    fork_repo(
        &repo,
        &[("README.md", b"# calc\n")],
        &[("README.md", b"# calc\n"), ("calc.py", CALC_PURE)],
        &[("README.md", b"# calc\n"), ("calc.py", CALC_IMPURE)],
    );
    let store = MemoryMetadataStore::new();
    store.insert(&target(), "calc.py", "calc", impure(8));
    store.set_row_unavailable(&source(), "calc.py", "calc");
    Reconciler::new(repo, store, fx.root(), ReconcileConfig::default())
}

#[test]
fn second_merge_on_busy_branch_is_rejected() {
    let fx = scenario_d(ReconcileConfig::default());
    let first = fx.engine.start_merge(&source(), &target()).unwrap().handle().unwrap();

    match fx.engine.start_merge(&source(), &target()) {
        Err(MergeError::MergeInProgress { merge_id, .. }) => assert_eq!(&merge_id, first.id()),
        other => panic!("expected MergeInProgress, got {other:?}"),
    }
    // Sharing either branch is enough.
    fx.repo().set_branch("other", fx.fork.base).unwrap();
    assert!(matches!(
        fx.engine.start_merge(&branch("other"), &target()),
        Err(MergeError::MergeInProgress { .. })
    ));
}

#[test]
fn persisted_session_blocks_other_engines() {
    let fx = scenario_d(ReconcileConfig::default());
    let first = fx.engine.start_merge(&source(), &target()).unwrap().handle().unwrap();

    let other = second_engine(&fx);
    match other.start_merge(&source(), &target()) {
        Err(MergeError::MergeInProgress { merge_id, .. }) => assert_eq!(&merge_id, first.id()),
        other => panic!("expected MergeInProgress, got {other:?}"),
    }
}

#[test]
fn concurrent_starts_admit_exactly_one() {
    let fx = scenario_d(ReconcileConfig::default());
    let results: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| s.spawn(|| fx.engine.start_merge(&source(), &target())))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    let started = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(MergeError::MergeInProgress { .. })))
        .count();
    assert_eq!(started, 1);
    assert_eq!(rejected, 3);
}

#[test]
fn branches_are_free_again_after_finalize() {
    let fx = scenario_a(ReconcileConfig::default());
    let handle = fx.engine.start_merge(&source(), &target()).unwrap().handle().unwrap();
    fx.engine.finalize(&handle, WaitPolicy::NoWait).unwrap();
    assert!(fx.engine.start_merge(&source(), &target()).is_ok());
}

#[test]
fn merge_can_be_resumed_by_another_engine() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = fx.engine.start_merge(&source(), &target()).unwrap().handle().unwrap();
    let id = handle.id().to_string();
    let conflict = fx.engine.list_pending_conflicts(&handle)[0].id.clone();

    let other = second_engine(&fx);
    let resumed = other.open_merge(&id).unwrap();
    assert_eq!(resumed.phase(), MergePhase::Resolving);
    assert_eq!(other.list_pending_conflicts(&resumed).len(), 1);

    let view = other.comparison(&resumed, conflict.as_str()).unwrap();
    assert!(view.source.metadata_status.starts_with("unavailable"));
    assert_eq!(view.target.purity.as_deref(), Some("impure"));

    other
        .submit_resolution(&resumed, conflict.as_str(), Decision::KeepSource)
        .unwrap();
    let entry = other.finalize(&resumed, WaitPolicy::NoWait).unwrap();
    assert_eq!(entry.merge_id.to_string(), id);

    let sessions = other.merges().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].phase, MergePhase::Done);
}

#[test]
fn open_merge_reuses_live_handle() {
    let fx = scenario_d(ReconcileConfig::default());
    let handle = fx.engine.start_merge(&source(), &target()).unwrap().handle().unwrap();
    let again = fx.engine.open_merge(handle.id().as_str()).unwrap();
    let conflict = fx.engine.list_pending_conflicts(&handle)[0].id.clone();
    fx.engine
        .submit_resolution(&again, conflict.as_str(), Decision::KeepTarget)
        .unwrap();
    assert!(fx.engine.list_pending_conflicts(&handle).is_empty());
}

#[test]
fn unknown_merge_id_is_reported() {
    let fx = scenario_d(ReconcileConfig::default());
    assert!(matches!(
        fx.engine.open_merge("m-doesnotexist"),
        Err(MergeError::UnknownMerge { .. })
    ));
    assert!(matches!(
        fx.engine.open_merge("../etc/passwd"),
        Err(MergeError::UnknownMerge { .. })
    ));
}
