//! Three-way tree comparison.
//!
//! Resolves both branch tips, finds their merge base and partitions every
//! path that differs into changed-only-on-source, changed-only-on-target and
//! changed-on-both. A path counts as changed when its blob id or mode
//! differs from the base; additions and deletions are changes. Paths both
//! sides changed to the same content are kept apart as converged: their
//! text needs no merge but their metadata rows may still disagree.

use std::collections::{BTreeMap, BTreeSet};

use reconcile_git::{FileEntry, GitOid, GitRepo, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::MergeError;
use crate::model::types::BranchRef;

/// Paths partitioned by which side changed them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changed on the source branch only.
    pub only_source: BTreeSet<String>,
    /// Changed on the target branch only.
    pub only_target: BTreeSet<String>,
    /// Changed on both branches, differently.
    pub modified_both: BTreeSet<String>,
    /// Changed on both branches to identical content (still present).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub converged: BTreeSet<String>,
}

impl ChangeSet {
    /// No path needs merging.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.only_source.is_empty() && self.modified_both.is_empty()
    }
}

/// Everything the later stages need about the two trees.
#[derive(Clone, Debug)]
pub struct TreeDiff {
    /// Source branch tip.
    pub source_tip: Snapshot,
    /// Target branch tip.
    pub target_tip: Snapshot,
    /// Merge base commit, `None` for unrelated histories.
    pub base: Option<GitOid>,
    /// Files of the merge-base tree (empty without a base).
    pub base_files: BTreeMap<String, FileEntry>,
    /// Files of the source tree.
    pub source_files: BTreeMap<String, FileEntry>,
    /// Files of the target tree.
    pub target_files: BTreeMap<String, FileEntry>,
    /// The partition.
    pub change_set: ChangeSet,
}

/// Resolve `branch` or report it missing.
///
/// # Errors
/// [`MergeError::BranchNotFound`] for a missing branch, [`MergeError::Git`]
/// for other backend failures.
pub fn resolve_branch<R: GitRepo + ?Sized>(
    repo: &R,
    branch: &BranchRef,
) -> Result<Snapshot, MergeError> {
    repo.resolve(branch.ref_name()).map_err(|e| {
        if e.is_not_found() {
            MergeError::BranchNotFound {
                branch: branch.clone(),
            }
        } else {
            MergeError::Git(e)
        }
    })
}

/// Compare `source` and `target` against their merge base.
///
/// # Errors
/// Fails if either branch is missing or the repository cannot be read.
#[instrument(skip(repo), fields(source = %source, target = %target))]
pub fn diff_branches<R: GitRepo + ?Sized>(
    repo: &R,
    source: &BranchRef,
    target: &BranchRef,
) -> Result<TreeDiff, MergeError> {
    let source_tip = resolve_branch(repo, source)?;
    let target_tip = resolve_branch(repo, target)?;
    diff_tips(repo, source_tip, target_tip)
}

/// Compare two already-resolved tips against their merge base.
///
/// # Errors
/// Fails if the repository cannot be read.
pub fn diff_tips<R: GitRepo + ?Sized>(
    repo: &R,
    source_tip: Snapshot,
    target_tip: Snapshot,
) -> Result<TreeDiff, MergeError> {
    let base = repo.merge_base(source_tip.commit, target_tip.commit)?;
    let base_files = match base {
        Some(commit) => repo.list_files(repo.read_commit(commit)?.tree_oid)?,
        None => BTreeMap::new(),
    };
    let source_files = repo.list_files(source_tip.tree)?;
    let target_files = repo.list_files(target_tip.tree)?;
    let change_set = partition(&base_files, &source_files, &target_files);

    tracing::debug!(
        base = ?base.map(|b| b.short()),
        only_source = change_set.only_source.len(),
        only_target = change_set.only_target.len(),
        modified_both = change_set.modified_both.len(),
        converged = change_set.converged.len(),
        "diffed branches"
    );

    Ok(TreeDiff {
        source_tip,
        target_tip,
        base,
        base_files,
        source_files,
        target_files,
        change_set,
    })
}

/// Partition every path present in any of the three listings.
#[must_use]
pub fn partition(
    base: &BTreeMap<String, FileEntry>,
    source: &BTreeMap<String, FileEntry>,
    target: &BTreeMap<String, FileEntry>,
) -> ChangeSet {
    let mut set = ChangeSet::default();
    let paths: BTreeSet<&String> = base.keys().chain(source.keys()).chain(target.keys()).collect();
    for path in paths {
        let (b, s, t) = (base.get(path), source.get(path), target.get(path));
        if s == t {
            if s.is_some() && s != b {
                set.converged.insert(path.clone());
            }
            continue;
        }
        if s == b {
            set.only_target.insert(path.clone());
        } else if t == b {
            set.only_source.insert(path.clone());
        } else {
            set.modified_both.insert(path.clone());
        }
    }
    set
}

/// Report produced instead of a merge when divergence exceeds the ceiling
/// and the policy is to summarise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceSummary {
    /// Branch being merged in.
    pub source: BranchRef,
    /// Branch receiving the merge.
    pub target: BranchRef,
    /// Merge base, if any.
    pub base: Option<GitOid>,
    /// Count of source-only changes.
    pub only_source: usize,
    /// Count of target-only changes.
    pub only_target: usize,
    /// Paths changed on both sides.
    pub modified_both: Vec<String>,
    /// The configured ceiling.
    pub ceiling: usize,
}

impl DivergenceSummary {
    /// Summarise `diff`.
    #[must_use]
    pub fn new(source: &BranchRef, target: &BranchRef, diff: &TreeDiff, ceiling: usize) -> Self {
        Self {
            source: source.clone(),
            target: target.clone(),
            base: diff.base,
            only_source: diff.change_set.only_source.len(),
            only_target: diff.change_set.only_target.len(),
            modified_both: diff.change_set.modified_both.iter().cloned().collect(),
            ceiling,
        }
    }
}
