//! The reconciliation engine.
//!
//! [`Reconciler`] drives one merge per [`MergeHandle`] through the phases in
//! [`MergePhase`]:
//!
//! ```text
//! start_merge:  validating → resolving          (diff, classify, score, auto-resolve)
//! submit_resolution:         resolving          (one decision per conflict)
//! finalize:                  resolving → writing → committing → done
//! any failure or cancel:     ────────────────────────────────→ aborted
//! ```
//!
//! # Atomicity
//!
//! `writing` only stages: blobs and the merged tree go to the object store
//! unreferenced, metadata changes go into one store transaction. `committing`
//! validates the candidate tree, creates the commit, moves the target ref by
//! compare-and-swap, refreshes a checked-out working tree and finally commits
//! the store transaction together with the audit entry. A failure at any step
//! undoes the steps already taken, in reverse, and reports each one in the
//! [`AbortReason`].
//!
//! # Concurrency
//!
//! A branch takes part in at most one non-terminal merge. Claims are kept in
//! this engine's registry and checked against the persisted sessions of
//! every other process under `.reconcile/locks/registry.lock`. The target
//! branch is locked for the whole of `writing` and `committing`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use reconcile_git::{GitError, GitOid, GitRepo, GixRepo};
use tracing::instrument;

use crate::audit::AuditLog;
use crate::config::{DivergencePolicy, ReconcileConfig};
use crate::error::{AbortReason, MergeError, MergeWarning};
use crate::lock::{retry_with_backoff, FileLock, RetryPolicy};
use crate::merge::auto::{auto_resolve, AutoPolicy};
use crate::merge::classify::{classify, BranchPair, FileFilter, FileVersions};
use crate::merge::commit::commit_message;
use crate::merge::differ::{diff_branches, diff_tips, resolve_branch, DivergenceSummary, TreeDiff};
use crate::merge::mediate::{comparison_view, record_decision, ComparisonView};
use crate::merge::reconstruct::{plan_metadata, plan_tree, Decisions};
use crate::merge::score::score;
use crate::merge::validate::validate_tree;
use crate::merge_state::{MergePhase, MergeSession, MergeStateError, SessionDir};
use crate::model::conflict::Conflict;
use crate::model::resolution::{
    AuditOutcome, Decision, MergeAuditEntry, ResolutionRecord, ResolutionStrategy,
};
use crate::model::types::{BranchRef, ConflictId, MergeId};
use crate::store::json::JsonMetadataStore;
use crate::store::{MetadataStore, RowKey, StoreError, StoreTransaction};

/// Directory under the repository root holding sessions, locks and the
/// default config, store and audit files.
pub const STATE_DIR: &str = ".reconcile";

/// Longest validation stderr kept in an error, in bytes (the tail is kept).
const STDERR_LIMIT: usize = 4096;

// ---------------------------------------------------------------------------
// MergeHandle
// ---------------------------------------------------------------------------

/// Shared handle to one merge attempt.
///
/// Cloning is cheap; every clone sees the same session. Decisions submitted
/// through any clone wake a [`Reconciler::finalize`] waiting on another.
#[derive(Clone, Debug)]
pub struct MergeHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: MergeId,
    session: Mutex<MergeSession>,
    changed: Condvar,
    cancelled: AtomicBool,
}

impl MergeHandle {
    fn new(session: MergeSession) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: session.merge_id.clone(),
                session: Mutex::new(session),
                changed: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// The merge id.
    #[must_use]
    pub fn id(&self) -> &MergeId {
        &self.inner.id
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> MergePhase {
        self.lock().phase
    }

    /// A copy of the current session state.
    #[must_use]
    pub fn session(&self) -> MergeSession {
        self.lock().clone()
    }

    /// Non-fatal degradations recorded so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<MergeWarning> {
        self.lock().warnings.clone()
    }

    /// Whether [`Reconciler::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, MergeSession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.inner.changed.notify_all();
    }
}

/// What [`Reconciler::start_merge`] produced.
#[derive(Debug)]
pub enum MergeStart {
    /// Analysis is done; conflicts without an automatic decision await
    /// [`Reconciler::submit_resolution`].
    Started(MergeHandle),
    /// Divergence exceeded the ceiling and the policy is to summarise.
    /// No merge was started.
    Summary(DivergenceSummary),
}

impl MergeStart {
    /// The handle, if a merge was started.
    #[must_use]
    pub fn handle(self) -> Option<MergeHandle> {
        match self {
            Self::Started(handle) => Some(handle),
            Self::Summary(_) => None,
        }
    }
}

/// How long [`Reconciler::finalize`] waits for outstanding decisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail with [`MergeError::PendingConflicts`] right away.
    #[default]
    NoWait,
    /// Block until every conflict is decided or the merge is cancelled.
    Indefinite,
    /// Block at most this long, then fail with
    /// [`MergeError::MediationTimeout`]. The merge stays open.
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Registry {
    busy: BTreeMap<BranchRef, MergeId>,
    handles: BTreeMap<MergeId, MergeHandle>,
}

/// Everything `committing` may have to undo.
#[derive(Default)]
struct Undo<'a> {
    target_lock: Option<FileLock>,
    tree: Option<GitOid>,
    transaction: Option<Box<dyn StoreTransaction + 'a>>,
    staged_rows: usize,
    moved_ref: Option<(GitOid, GitOid)>,
    worktree: Option<GitOid>,
}

/// The branch reconciliation engine over a repository and a metadata store.
pub struct Reconciler<R, S> {
    repo: R,
    store: S,
    root: PathBuf,
    state_dir: PathBuf,
    sessions: SessionDir,
    audit: AuditLog,
    config: ReconcileConfig,
    registry: Mutex<Registry>,
}

impl Reconciler<GixRepo, JsonMetadataStore> {
    /// Open the repository at or above `path` with the configuration and
    /// JSON metadata store found under its `.reconcile/` directory.
    ///
    /// # Errors
    /// Fails if no repository is found or the config file is invalid.
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let repo = GixRepo::open(path)?;
        let root = repo
            .workdir()
            .map_or_else(|| path.to_path_buf(), Path::to_path_buf);
        let config = ReconcileConfig::load(&ReconcileConfig::default_path(&root))?;
        let store = JsonMetadataStore::new(root.join(&config.store.path));
        Ok(Self::new(repo, store, root, config))
    }
}

impl<R: GitRepo, S: MetadataStore> Reconciler<R, S> {
    /// An engine whose state lives under `root/.reconcile`.
    pub fn new(repo: R, store: S, root: impl Into<PathBuf>, config: ReconcileConfig) -> Self {
        let root = root.into();
        let state_dir = root.join(STATE_DIR);
        Self {
            sessions: SessionDir::new(&state_dir),
            audit: AuditLog::new(root.join(&config.audit.path)),
            repo,
            store,
            root,
            state_dir,
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The version-control backend.
    pub const fn repo(&self) -> &R {
        &self.repo
    }

    /// The metadata store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The loaded configuration.
    pub const fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// The repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The JSON Lines audit log.
    pub const fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // Starting
    // -----------------------------------------------------------------------

    /// Compare two branches without starting a merge.
    ///
    /// # Errors
    /// Fails if either branch is missing.
    pub fn preview(
        &self,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<DivergenceSummary, MergeError> {
        let diff = diff_branches(&self.repo, source, target)?;
        Ok(DivergenceSummary::new(
            source,
            target,
            &diff,
            self.config.merge.divergence_ceiling,
        ))
    }

    /// Start merging `source` into `target`: validate the inputs, classify
    /// and score every conflict, and apply the confident recommendations.
    ///
    /// # Errors
    /// - [`MergeError::MergeInProgress`] if either branch is already part of
    ///   a running merge.
    /// - [`MergeError::Aborted`] if validation or analysis failed; the abort
    ///   is written to the audit log.
    #[instrument(skip_all, fields(source = %source, target = %target))]
    pub fn start_merge(
        &self,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<MergeStart, MergeError> {
        let started_at = now_secs();
        let merge_id = MergeId::generate(source, target, rand::random());

        let diff = match self.validate_inputs(source, target) {
            Ok(diff) => diff,
            Err(err) => {
                let reason = self.reject(&merge_id, source, target, started_at, &err);
                return Err(MergeError::Aborted(Box::new(reason)));
            }
        };

        let mut warnings = Vec::new();
        let ceiling = self.config.merge.divergence_ceiling;
        let modified = diff.change_set.modified_both.len();
        if modified > ceiling {
            match self.config.merge.on_divergence {
                DivergencePolicy::Summarize => {
                    tracing::warn!(modified, ceiling, "divergence too large; summary only");
                    return Ok(MergeStart::Summary(DivergenceSummary::new(
                        source, target, &diff, ceiling,
                    )));
                }
                DivergencePolicy::Warn => {
                    tracing::warn!(modified, ceiling, "divergence too large; continuing");
                    warnings.push(MergeWarning::DivergenceTooLarge { modified, ceiling });
                }
            }
        }

        let registry_lock = self.claim(&merge_id, source, target)?;
        let mut session = MergeSession::new(
            merge_id,
            source.clone(),
            target.clone(),
            diff.source_tip,
            diff.target_tip,
            diff.base,
            diff.change_set.clone(),
            started_at,
        );
        session.warnings = warnings;

        let analyzed = self
            .analyze(&mut session, &diff)
            .and_then(|()| self.sessions.save(&session).map_err(MergeError::from));
        drop(registry_lock);
        if let Err(err) = analyzed {
            let reason = self.abort_session(&mut session, Vec::new(), &err);
            return Err(MergeError::Aborted(Box::new(reason)));
        }

        let handle = MergeHandle::new(session);
        self.registry()
            .handles
            .insert(handle.id().clone(), handle.clone());
        Ok(MergeStart::Started(handle))
    }

    fn validate_inputs(
        &self,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<TreeDiff, MergeError> {
        let diff = diff_branches(&self.repo, source, target)?;
        if self.target_checked_out(target)? && self.repo.is_dirty()? {
            return Err(MergeError::UncommittedChanges {
                branch: target.clone(),
            });
        }
        Ok(diff)
    }

    fn analyze(&self, session: &mut MergeSession, diff: &TreeDiff) -> Result<(), MergeError> {
        session.advance(MergePhase::Resolving, now_secs())?;
        let files = self.load_versions(diff)?;
        let branches = branch_pair(session);
        let filter = FileFilter::from_config(&self.config.merge);
        let classification = classify(&files, &branches, &self.store, &filter);

        let strategies: BTreeMap<ConflictId, ResolutionStrategy> = classification
            .conflicts
            .par_iter()
            .map(|c| (c.id.clone(), score(c)))
            .collect();
        let policy = AutoPolicy::from_config(&self.config.merge);
        let records = auto_resolve(
            &policy,
            classification
                .conflicts
                .iter()
                .filter_map(|c| Some((c, strategies.get(&c.id)?))),
            session.updated_at,
        );

        tracing::info!(
            merge_id = %session.merge_id,
            conflicts = classification.conflicts.len(),
            auto_resolved = records.len(),
            warnings = classification.warnings.len(),
            "analysis complete"
        );
        session.warnings.extend(classification.warnings);
        session.conflicts = classification.conflicts;
        session.strategies = strategies;
        session.records = records
            .into_iter()
            .map(|r| (r.conflict_id.clone(), r))
            .collect();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Mediation
    // -----------------------------------------------------------------------

    /// Conflicts still waiting for a decision.
    #[must_use]
    pub fn list_pending_conflicts(&self, handle: &MergeHandle) -> Vec<Conflict> {
        handle.lock().pending().into_iter().cloned().collect()
    }

    /// Every conflict of the merge, decided or not.
    #[must_use]
    pub fn conflicts(&self, handle: &MergeHandle) -> Vec<Conflict> {
        handle.lock().conflicts.clone()
    }

    /// Comparison views for every pending conflict.
    #[must_use]
    pub fn pending_views(&self, handle: &MergeHandle) -> Vec<ComparisonView> {
        let session = handle.lock();
        session
            .pending()
            .into_iter()
            .map(|c| view_of(&session, c))
            .collect()
    }

    /// The comparison view for one conflict.
    ///
    /// # Errors
    /// [`MergeError::UnknownConflict`] if the id is not part of this merge.
    pub fn comparison(
        &self,
        handle: &MergeHandle,
        conflict_id: &str,
    ) -> Result<ComparisonView, MergeError> {
        let session = handle.lock();
        let conflict = session
            .conflicts
            .iter()
            .find(|c| c.id.as_str() == conflict_id)
            .ok_or_else(|| MergeError::UnknownConflict {
                merge_id: session.merge_id.clone(),
                conflict_id: conflict_id.to_owned(),
            })?;
        Ok(view_of(&session, conflict))
    }

    /// Record a decision for one conflict and persist it.
    ///
    /// # Errors
    /// As for [`record_decision`], plus state persistence failures (in which
    /// case the decision is not recorded).
    pub fn submit_resolution(
        &self,
        handle: &MergeHandle,
        conflict_id: &str,
        decision: Decision,
    ) -> Result<ResolutionRecord, MergeError> {
        let mut session = handle.lock();
        let mut next = session.clone();
        let record = record_decision(&mut next, conflict_id, decision, now_secs())?;
        self.sessions.save(&next)?;
        *session = next;
        drop(session);
        handle.notify();
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Finalize
    // -----------------------------------------------------------------------

    /// Wait for every decision per `wait`, then write and commit the merge.
    ///
    /// Finalizing a merge that is already done returns its audit entry again
    /// without touching anything.
    ///
    /// # Errors
    /// - [`MergeError::PendingConflicts`] / [`MergeError::MediationTimeout`]
    ///   when decisions are missing; the merge stays open.
    /// - [`MergeError::Aborted`] when the merge was, or now is, aborted.
    #[instrument(skip(self, handle), fields(merge_id = %handle.id()))]
    pub fn finalize(
        &self,
        handle: &MergeHandle,
        wait: WaitPolicy,
    ) -> Result<MergeAuditEntry, MergeError> {
        let deadline = match wait {
            WaitPolicy::Timeout(d) => Some(Instant::now() + d),
            WaitPolicy::NoWait | WaitPolicy::Indefinite => None,
        };
        let mut session = handle.lock();
        loop {
            match session.phase {
                MergePhase::Done => return completed_entry(&session),
                MergePhase::Aborted => return Err(aborted_error(&session)),
                MergePhase::Resolving => {}
                phase => {
                    return Err(MergeError::WrongPhase {
                        merge_id: session.merge_id.clone(),
                        phase,
                        operation: "finalize",
                    });
                }
            }
            if handle.is_cancelled() {
                let err = MergeError::Cancelled {
                    merge_id: session.merge_id.clone(),
                };
                let reason = self.abort_session(&mut session, Vec::new(), &err);
                handle.notify();
                return Err(MergeError::Aborted(Box::new(reason)));
            }
            if session.is_fully_resolved() {
                break;
            }
            session = match (wait, deadline) {
                (WaitPolicy::Indefinite, _) => handle
                    .inner
                    .changed
                    .wait(session)
                    .unwrap_or_else(PoisonError::into_inner),
                (WaitPolicy::Timeout(_), Some(deadline)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(MergeError::MediationTimeout {
                            merge_id: session.merge_id.clone(),
                            pending: session.pending().len(),
                        });
                    }
                    handle
                        .inner
                        .changed
                        .wait_timeout(session, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                _ => {
                    return Err(MergeError::PendingConflicts {
                        merge_id: session.merge_id.clone(),
                        pending: session.pending().iter().map(|c| c.id.clone()).collect(),
                    });
                }
            };
        }

        let result = self.commit_merge(handle, &mut session);
        drop(session);
        handle.notify();
        result
    }

    fn commit_merge(
        &self,
        handle: &MergeHandle,
        session: &mut MergeSession,
    ) -> Result<MergeAuditEntry, MergeError> {
        let mut undo = Undo::default();
        let entry = match self.try_commit(handle, session, &mut undo) {
            Ok(entry) => entry,
            Err(err) => {
                let reason = self.roll_back(session, undo, &err);
                return Err(MergeError::Aborted(Box::new(reason)));
            }
        };
        drop(undo);

        // The merge has landed; nothing below may undo it.
        self.log_audit(&entry, session);
        session.outcome = Some(entry.clone());
        if let Err(e) = session.advance(MergePhase::Done, entry.finished_at) {
            tracing::error!(error = %e, "could not mark merge done");
        }
        if let Err(e) = self.sessions.save(session) {
            tracing::warn!(error = %e, "could not persist finished merge session");
        }
        self.release(&session.merge_id);
        Ok(entry)
    }

    fn try_commit<'a>(
        &'a self,
        handle: &MergeHandle,
        session: &mut MergeSession,
        undo: &mut Undo<'a>,
    ) -> Result<MergeAuditEntry, MergeError> {
        let target = session.target.clone();

        // --- writing ---
        session.advance(MergePhase::Writing, now_secs())?;
        self.sessions.save(session)?;
        self.check_cancelled(handle)?;

        let current = resolve_branch(&self.repo, &target)?;
        if current.commit != session.target_tip.commit {
            return Err(MergeError::TargetMoved {
                branch: target,
                expected: session.target_tip.commit,
                actual: current.commit,
            });
        }
        let checked_out = self.target_checked_out(&target)?;
        if checked_out && self.repo.is_dirty()? {
            return Err(MergeError::UncommittedChanges { branch: target });
        }
        undo.target_lock = Some(self.acquire_lock(&self.target_lock_path(&target))?);

        let diff = diff_tips(&self.repo, session.source_tip, session.target_tip)?;
        let files = self.load_versions(&diff)?;
        let branches = branch_pair(session);
        let filter = FileFilter::from_config(&self.config.merge);
        let plan = plan_tree(
            &diff,
            &files,
            &Decisions::new(&session.conflicts, &session.records),
            &branches,
            &filter,
        );
        let tree = plan.write_tree(&self.repo, session.target_tip.tree)?;
        undo.tree = Some(tree);

        let (ops, warnings) = plan_metadata(&self.store, &plan.rows, &branches);
        session.warnings.extend(warnings);
        let rows: Vec<RowKey> = ops.iter().map(|op| op.key().clone()).collect();
        let tx = undo.transaction.insert(self.begin_transaction(&rows)?);
        for op in ops {
            op.stage(tx.as_mut());
        }
        undo.staged_rows = rows.len();
        tracing::debug!(tree = %tree.short(), rows = rows.len(), "merge staged");

        // --- committing ---
        self.check_cancelled(handle)?;
        session.advance(MergePhase::Committing, now_secs())?;
        self.sessions.save(session)?;

        if let Some(result) = validate_tree(&self.repo, tree, &self.config.merge.validation)? {
            let failure = result.first_failure().cloned();
            session.validation_result = Some(result);
            if let Some(failed) = failure {
                return Err(MergeError::PostMergeValidationFailed {
                    command: failed.command,
                    exit_code: failed.exit_code,
                    stderr: tail(&failed.stderr, STDERR_LIMIT).to_owned(),
                });
            }
        }
        self.check_cancelled(handle)?;

        let records: Vec<&ResolutionRecord> = session
            .conflicts
            .iter()
            .filter_map(|c| session.records.get(&c.id))
            .collect();
        let message = commit_message(&session.source, &target, &records);
        let parents = [session.target_tip.commit, session.source_tip.commit];
        let commit = self.repo.create_commit(tree, &parents, &message)?;
        session.candidate = Some(commit);
        self.check_cancelled(handle)?;

        let expected = session.target_tip.commit;
        self.repo
            .update_ref(target.ref_name(), commit, expected)
            .map_err(|e| self.ref_update_error(&target, expected, e))?;
        undo.moved_ref = Some((commit, expected));

        if checked_out && let Some(workdir) = self.repo.workdir() {
            undo.worktree = Some(session.target_tip.tree);
            self.repo.checkout_tree(tree, workdir)?;
        }

        let entry = MergeAuditEntry {
            merge_id: session.merge_id.clone(),
            source: session.source.clone(),
            target,
            outcome: AuditOutcome::Completed { commit },
            records: session.records.values().cloned().collect(),
            warnings: session.warnings.clone(),
            started_at: session.started_at,
            finished_at: now_secs(),
        };
        if let Some(mut tx) = undo.transaction.take() {
            tx.append_audit(entry.clone());
            tx.mark_merged(&session.source);
            tx.commit()?;
        }
        Ok(entry)
    }

    fn roll_back(
        &self,
        session: &mut MergeSession,
        mut undo: Undo<'_>,
        err: &MergeError,
    ) -> AbortReason {
        let mut steps = Vec::new();
        let target = session.target.clone();

        if let Some((new, old)) = undo.moved_ref {
            match self.repo.update_ref(target.ref_name(), old, new) {
                Ok(()) => steps.push(format!(
                    "target branch '{target}' reset from {} to {}",
                    new.short(),
                    old.short()
                )),
                Err(e) => {
                    tracing::error!(error = %e, "could not reset target branch");
                    steps.push(format!(
                        "FAILED to reset target branch '{target}' to {}: {e}",
                        old.short()
                    ));
                }
            }
        }
        if let Some(tree) = undo.worktree
            && let Some(workdir) = self.repo.workdir()
        {
            match self.repo.checkout_tree(tree, workdir) {
                Ok(()) => steps.push(format!("working tree restored to {}", tree.short())),
                Err(e) => {
                    tracing::error!(error = %e, "could not restore working tree");
                    steps.push(format!("FAILED to restore working tree to {}: {e}", tree.short()));
                }
            }
        }
        if let Some(commit) = session.candidate {
            steps.push(format!("merge commit {} abandoned", commit.short()));
        }
        if let Some(tx) = undo.transaction.take() {
            tx.rollback();
            steps.push(format!(
                "metadata store transaction discarded ({} staged row change(s))",
                undo.staged_rows
            ));
        }
        if let Some(tree) = undo.tree {
            steps.push(format!("merged tree {} discarded", tree.short()));
        }
        drop(undo.target_lock.take());

        self.abort_session(session, steps, err)
    }

    // -----------------------------------------------------------------------
    // Cancel / reopen
    // -----------------------------------------------------------------------

    /// Cancel a merge. A merge in `resolving` is dropped at once; one being
    /// finalized by another thread rolls back at its next step.
    ///
    /// # Errors
    /// [`MergeError::WrongPhase`] if the merge already completed.
    pub fn cancel(&self, handle: &MergeHandle) -> Result<AbortReason, MergeError> {
        handle.inner.cancelled.store(true, Ordering::SeqCst);
        handle.notify();

        let mut session = handle.lock();
        let phase = session.phase;
        let reason = match phase {
            MergePhase::Aborted => {
                return session
                    .abort_reason
                    .clone()
                    .ok_or_else(|| aborted_error(&session));
            }
            MergePhase::Done => {
                return Err(MergeError::WrongPhase {
                    merge_id: session.merge_id.clone(),
                    phase: MergePhase::Done,
                    operation: "cancel",
                });
            }
            MergePhase::Validating | MergePhase::Resolving => {
                let err = MergeError::Cancelled {
                    merge_id: session.merge_id.clone(),
                };
                self.abort_session(&mut session, Vec::new(), &err)
            }
            MergePhase::Writing | MergePhase::Committing => {
                // Left behind by a process that stopped mid-commit.
                let steps = self.recover(&session);
                let err = MergeError::Cancelled {
                    merge_id: session.merge_id.clone(),
                };
                self.abort_session(&mut session, steps, &err)
            }
        };
        drop(session);
        handle.notify();
        Ok(reason)
    }

    fn recover(&self, session: &MergeSession) -> Vec<String> {
        let mut steps = Vec::new();
        let Some(candidate) = session.candidate else {
            return steps;
        };
        let target = &session.target;
        let moved = resolve_branch(&self.repo, target).is_ok_and(|tip| tip.commit == candidate);
        if !moved {
            return steps;
        }
        let old = session.target_tip.commit;
        match self.repo.update_ref(target.ref_name(), old, candidate) {
            Ok(()) => {
                steps.push(format!(
                    "target branch '{target}' reset from {} to {}",
                    candidate.short(),
                    old.short()
                ));
                if self.target_checked_out(target).unwrap_or(false)
                    && let Some(workdir) = self.repo.workdir()
                    && self.repo.checkout_tree(session.target_tip.tree, workdir).is_ok()
                {
                    steps.push(format!(
                        "working tree restored to {}",
                        session.target_tip.tree.short()
                    ));
                }
            }
            Err(e) => steps.push(format!(
                "FAILED to reset target branch '{target}' to {}: {e}",
                old.short()
            )),
        }
        steps
    }

    /// A handle for a merge started earlier, in this process or another.
    ///
    /// # Errors
    /// [`MergeError::UnknownMerge`] if no such session exists.
    pub fn open_merge(&self, merge_id: &str) -> Result<MergeHandle, MergeError> {
        let unknown = || MergeError::UnknownMerge {
            merge_id: merge_id.to_owned(),
        };
        let id = MergeId::new(merge_id).map_err(|_| unknown())?;
        if let Some(handle) = self.registry().handles.get(&id) {
            return Ok(handle.clone());
        }
        let session = self.sessions.load(&id).map_err(|e| match e {
            MergeStateError::NotFound(_) => unknown(),
            other => MergeError::State(other),
        })?;
        let live = !session.phase.is_terminal();
        let (source, target) = (session.source.clone(), session.target.clone());
        let handle = MergeHandle::new(session);
        if live {
            let mut registry = self.registry();
            registry.busy.insert(source, id.clone());
            registry.busy.insert(target, id.clone());
            registry.handles.insert(id, handle.clone());
        }
        Ok(handle)
    }

    /// Every persisted merge session, ordered by id.
    ///
    /// # Errors
    /// Fails if the session directory cannot be read.
    pub fn merges(&self) -> Result<Vec<MergeSession>, MergeError> {
        Ok(self.sessions.list()?)
    }

    /// Every audit entry, oldest first.
    ///
    /// # Errors
    /// Fails if the audit log cannot be read.
    pub fn audit_entries(&self) -> Result<Vec<MergeAuditEntry>, MergeError> {
        Ok(self.audit.read_all()?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(
        &self,
        merge_id: &MergeId,
        source: &BranchRef,
        target: &BranchRef,
    ) -> Result<FileLock, MergeError> {
        let lock = self.acquire_lock(&self.state_dir.join("locks").join("registry.lock"))?;
        let mut registry = self.registry();
        for branch in [source, target] {
            if let Some(holder) = registry.busy.get(branch) {
                return Err(MergeError::MergeInProgress {
                    branch: branch.clone(),
                    merge_id: holder.clone(),
                });
            }
        }
        for session in self.sessions.active()? {
            if let Some(branch) = [source, target]
                .into_iter()
                .find(|b| **b == session.source || **b == session.target)
            {
                return Err(MergeError::MergeInProgress {
                    branch: branch.clone(),
                    merge_id: session.merge_id,
                });
            }
        }
        registry.busy.insert(source.clone(), merge_id.clone());
        registry.busy.insert(target.clone(), merge_id.clone());
        Ok(lock)
    }

    fn release(&self, merge_id: &MergeId) {
        let mut registry = self.registry();
        registry.busy.retain(|_, id| id != merge_id);
        registry.handles.remove(merge_id);
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.store.lock_attempts,
            Duration::from_millis(self.config.store.lock_base_delay_ms),
        )
    }

    fn acquire_lock(&self, path: &Path) -> Result<FileLock, MergeError> {
        let resource = path.display().to_string();
        retry_with_backoff(
            self.retry_policy(),
            |e: &MergeError| matches!(e, MergeError::LockContention { .. }),
            |attempt| match FileLock::try_acquire(path)? {
                Some(lock) => Ok(lock),
                None => Err(MergeError::LockContention {
                    resource: resource.clone(),
                    attempts: attempt,
                }),
            },
        )
    }

    fn begin_transaction(
        &self,
        rows: &[RowKey],
    ) -> Result<Box<dyn StoreTransaction + '_>, MergeError> {
        let mut attempts = 0;
        retry_with_backoff(self.retry_policy(), StoreError::is_transient, |attempt| {
            attempts = attempt;
            self.store.begin(rows)
        })
        .map_err(|e| match e {
            StoreError::LockContention { resource } => {
                MergeError::LockContention { resource, attempts }
            }
            other => MergeError::Store(other),
        })
    }

    fn target_lock_path(&self, target: &BranchRef) -> PathBuf {
        self.state_dir
            .join("locks")
            .join(format!("{}.lock", target.slug()))
    }

    fn target_checked_out(&self, target: &BranchRef) -> Result<bool, MergeError> {
        if self.repo.workdir().is_none() {
            return Ok(false);
        }
        Ok(self.repo.head_branch()?.as_ref() == Some(target.ref_name()))
    }

    fn check_cancelled(&self, handle: &MergeHandle) -> Result<(), MergeError> {
        if handle.is_cancelled() {
            return Err(MergeError::Cancelled {
                merge_id: handle.id().clone(),
            });
        }
        Ok(())
    }

    fn load_versions(&self, diff: &TreeDiff) -> Result<Vec<FileVersions>, MergeError> {
        let set = &diff.change_set;
        set.modified_both
            .iter()
            .chain(&set.converged)
            .map(|path| FileVersions::load(&self.repo, diff, path).map_err(MergeError::from))
            .collect()
    }

    fn ref_update_error(&self, target: &BranchRef, expected: GitOid, err: GitError) -> MergeError {
        if matches!(err, GitError::RefConflict { .. })
            && let Ok(tip) = resolve_branch(&self.repo, target)
        {
            return MergeError::TargetMoved {
                branch: target.clone(),
                expected,
                actual: tip.commit,
            };
        }
        MergeError::Git(err)
    }

    /// Abort a request that failed before any session existed.
    fn reject(
        &self,
        merge_id: &MergeId,
        source: &BranchRef,
        target: &BranchRef,
        started_at: u64,
        err: &MergeError,
    ) -> AbortReason {
        let reason = AbortReason {
            merge_id: merge_id.clone(),
            phase: MergePhase::Validating,
            cause: err.abort_cause(),
            message: err.to_string(),
            rolled_back: Vec::new(),
        };
        let entry = MergeAuditEntry {
            merge_id: merge_id.clone(),
            source: source.clone(),
            target: target.clone(),
            outcome: AuditOutcome::Aborted {
                phase: reason.phase,
                reason: reason.message.clone(),
                rolled_back: Vec::new(),
            },
            records: Vec::new(),
            warnings: Vec::new(),
            started_at,
            finished_at: now_secs(),
        };
        if let Err(e) = self.audit.append(&entry) {
            tracing::warn!(error = %e, "could not append to audit log");
        }
        reason
    }

    fn abort_session(
        &self,
        session: &mut MergeSession,
        rolled_back: Vec<String>,
        err: &MergeError,
    ) -> AbortReason {
        let reason = AbortReason {
            merge_id: session.merge_id.clone(),
            phase: session.phase,
            cause: err.abort_cause(),
            message: err.to_string(),
            rolled_back,
        };
        let now = now_secs();
        if let Err(e) = session.abort(reason.clone(), now) {
            tracing::error!(error = %e, "could not mark merge aborted");
        }
        let entry = MergeAuditEntry {
            merge_id: session.merge_id.clone(),
            source: session.source.clone(),
            target: session.target.clone(),
            outcome: AuditOutcome::Aborted {
                phase: reason.phase,
                reason: reason.message.clone(),
                rolled_back: reason.rolled_back.clone(),
            },
            records: Vec::new(),
            warnings: session.warnings.clone(),
            started_at: session.started_at,
            finished_at: now,
        };
        self.log_audit(&entry, session);
        if let Err(e) = self.sessions.save(session) {
            tracing::warn!(error = %e, "could not persist aborted merge session");
        }
        self.release(&session.merge_id);
        reason
    }

    fn log_audit(&self, entry: &MergeAuditEntry, session: &mut MergeSession) {
        if let Err(e) = self.audit.append(entry) {
            tracing::warn!(
                error = %e,
                path = %self.audit.path().display(),
                "could not append to audit log"
            );
            session.warnings.push(MergeWarning::AuditWriteFailed {
                message: e.to_string(),
            });
        }
    }
}

fn branch_pair(session: &MergeSession) -> BranchPair {
    BranchPair {
        source: session.source.clone(),
        target: session.target.clone(),
        source_committed_at: session.source_tip.committed_at,
        target_committed_at: session.target_tip.committed_at,
    }
}

fn view_of(session: &MergeSession, conflict: &Conflict) -> ComparisonView {
    let strategy = session
        .strategies
        .get(&conflict.id)
        .cloned()
        .unwrap_or_else(|| score(conflict));
    comparison_view(session, conflict, &strategy)
}

fn completed_entry(session: &MergeSession) -> Result<MergeAuditEntry, MergeError> {
    session.outcome.clone().ok_or_else(|| {
        MergeError::State(MergeStateError::Deserialize(format!(
            "merge {} is done but has no audit entry",
            session.merge_id
        )))
    })
}

fn aborted_error(session: &MergeSession) -> MergeError {
    match &session.abort_reason {
        Some(reason) => MergeError::Aborted(Box::new(reason.clone())),
        None => MergeError::WrongPhase {
            merge_id: session.merge_id.clone(),
            phase: session.phase,
            operation: "finalize",
        },
    }
}

fn tail(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
