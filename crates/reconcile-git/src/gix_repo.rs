//! The gix-backed implementation of [`GitRepo`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, FileEntry, GitOid, RefName, Snapshot, TreeEdit};

/// A [`GitRepo`] implementation backed by [gix](https://github.com/GitoxideLabs/gitoxide).
///
/// Construct via [`GixRepo::open`] or [`GixRepo::open_at`].
pub struct GixRepo {
    pub(crate) repo: gix::Repository,
    pub(crate) workdir: Option<PathBuf>,
}

impl GixRepo {
    /// Open the git repository at or above `path`.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let repo = gix::discover(path).map_err(|e| GitError::backend(e.to_string()))?;
        let workdir = repo.workdir().map(Path::to_path_buf);
        Ok(Self { repo, workdir })
    }

    /// Open a git repository at exactly `path` (no parent discovery).
    pub fn open_at(path: &Path) -> Result<Self, GitError> {
        let repo = gix::open_opts(path, gix::open::Options::isolated())
            .map_err(|e| GitError::backend(e.to_string()))?;
        let workdir = repo.workdir().map(Path::to_path_buf);
        Ok(Self { repo, workdir })
    }
}

impl GitRepo for GixRepo {
    // === Refs ===
    fn resolve(&self, name: &RefName) -> Result<Snapshot, GitError> {
        crate::refs_impl::resolve(self, name)
    }

    fn update_ref(
        &self,
        name: &RefName,
        new: GitOid,
        expected_old: GitOid,
    ) -> Result<(), GitError> {
        crate::refs_impl::update_ref(self, name, new, expected_old)
    }

    fn head_branch(&self) -> Result<Option<RefName>, GitError> {
        crate::refs_impl::head_branch(self)
    }

    // === Ancestry ===
    fn merge_base(&self, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError> {
        crate::refs_impl::merge_base(self, a, b)
    }

    // === Object read ===
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        crate::objects_impl::read_commit(self, oid)
    }

    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        crate::objects_impl::read_blob(self, oid)
    }

    fn list_files(&self, tree: GitOid) -> Result<BTreeMap<String, FileEntry>, GitError> {
        crate::objects_impl::list_files(self, tree)
    }

    // === Object write ===
    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError> {
        crate::objects_impl::write_blob(self, data)
    }

    fn edit_tree(&self, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError> {
        crate::objects_impl::edit_tree(self, base, edits)
    }

    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError> {
        crate::objects_impl::create_commit(self, tree, parents, message)
    }

    // === Worktree ===
    fn is_dirty(&self) -> Result<bool, GitError> {
        crate::status_impl::is_dirty(self)
    }

    fn checkout_tree(&self, tree: GitOid, dir: &Path) -> Result<(), GitError> {
        crate::checkout_impl::checkout_tree(self, tree, dir)
    }

    fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }
}
