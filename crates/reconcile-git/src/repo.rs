//! The [`GitRepo`] trait, the single abstraction boundary between the merge
//! engine and version control.
//!
//! The engine interacts with git exclusively through this trait. The trait
//! is object-safe so callers can use `dyn GitRepo` or `Box<dyn GitRepo>`.
//!
//! | Group        | Methods                                              |
//! |--------------|------------------------------------------------------|
//! | Refs         | `resolve`, `update_ref`, `head_branch`               |
//! | Ancestry     | `merge_base`                                         |
//! | Object read  | `read_commit`, `read_blob`, `list_files`, `read_file` |
//! | Object write | `write_blob`, `edit_tree`, `create_commit`           |
//! | Worktree     | `is_dirty`, `checkout_tree`, `workdir`               |

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::GitError;
use crate::types::{CommitInfo, FileEntry, GitOid, RefName, Snapshot, TreeEdit};

/// The git abstraction trait used by the merge engine.
///
/// Implementations may be backed by gix ([`GixRepo`](crate::GixRepo)) or the
/// in-memory [`MemoryRepo`](crate::MemoryRepo).
///
/// # Object safety
///
/// This trait is object-safe: no generic methods, no `Self` in return position
/// outside of `Result`.
pub trait GitRepo {
    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Resolve a ref to its tip commit, tree and commit time.
    ///
    /// Returns [`GitError::NotFound`] if the ref does not exist.
    fn resolve(&self, name: &RefName) -> Result<Snapshot, GitError>;

    /// Move `name` from `expected_old` to `new` (compare-and-swap).
    ///
    /// Returns [`GitError::RefConflict`] if the ref's current value is not
    /// `expected_old`. Pass [`GitOid::ZERO`] to require that the ref does not
    /// exist yet.
    fn update_ref(&self, name: &RefName, new: GitOid, expected_old: GitOid)
    -> Result<(), GitError>;

    /// The branch `HEAD` points at, or `None` when detached or unborn.
    fn head_branch(&self) -> Result<Option<RefName>, GitError>;

    // -----------------------------------------------------------------------
    // Ancestry
    // -----------------------------------------------------------------------

    /// Best common ancestor of two commits, `None` for unrelated histories.
    fn merge_base(&self, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError>;

    // -----------------------------------------------------------------------
    // Object read
    // -----------------------------------------------------------------------

    /// Read a commit object's metadata.
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError>;

    /// Read the contents of a blob object.
    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError>;

    /// Recursively list every file reachable from `tree`, keyed by its
    /// slash-separated path.
    fn list_files(&self, tree: GitOid) -> Result<BTreeMap<String, FileEntry>, GitError>;

    /// Read one file from a tree, `None` if the path is absent.
    fn read_file(&self, tree: GitOid, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        match self.list_files(tree)?.get(path) {
            Some(entry) => self.read_blob(entry.oid).map(Some),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Object write
    // -----------------------------------------------------------------------

    /// Write a blob to the object store and return its OID.
    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError>;

    /// Apply a set of edits to an existing tree and return the OID of the new
    /// tree. Intermediate trees are created or updated as needed.
    fn edit_tree(&self, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError>;

    /// Create a commit object. No ref is moved.
    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError>;

    // -----------------------------------------------------------------------
    // Worktree
    // -----------------------------------------------------------------------

    /// Returns `true` if the working tree has uncommitted changes.
    fn is_dirty(&self) -> Result<bool, GitError>;

    /// Materialize `tree` into `dir`. When `dir` is the repository's working
    /// directory the index is rewritten to match and tracked files absent
    /// from `tree` are removed. Untracked files are never touched.
    fn checkout_tree(&self, tree: GitOid, dir: &Path) -> Result<(), GitError>;

    /// The repository's working directory, `None` for bare repositories.
    fn workdir(&self) -> Option<&Path>;
}
