//! An in-memory [`GitRepo`] for tests and dry runs.
//!
//! Objects are content-addressed with SHA-256 truncated to 20 bytes, so OIDs
//! are stable across runs but never collide with real git object ids by
//! accident in a way that matters. Trees are stored flat (path → entry).
//!
//! Individual operations can be armed to fail once with [`MemoryRepo::fail_next`],
//! which lets callers exercise rollback paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{CommitInfo, EntryMode, FileEntry, GitOid, RefName, Snapshot, TreeEdit};

const AUTHOR: &str = "Reconcile <reconcile@localhost>";

/// Seconds between consecutive commits made through the repo's clock.
const CLOCK_STEP: i64 = 60;

/// Operations that can be armed to fail with [`MemoryRepo::fail_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailOp {
    /// [`GitRepo::update_ref`]
    UpdateRef,
    /// [`GitRepo::create_commit`]
    CreateCommit,
    /// [`GitRepo::checkout_tree`]
    CheckoutTree,
    /// [`GitRepo::write_blob`]
    WriteBlob,
}

#[derive(Default)]
struct State {
    blobs: HashMap<GitOid, Vec<u8>>,
    trees: HashMap<GitOid, BTreeMap<String, FileEntry>>,
    commits: HashMap<GitOid, CommitInfo>,
    refs: BTreeMap<String, GitOid>,
    head: Option<RefName>,
    dirty: bool,
    clock: i64,
    armed: HashSet<FailOp>,
    worktree: Option<GitOid>,
}

impl State {
    fn take_failure(&mut self, op: FailOp) -> Result<(), GitError> {
        if self.armed.remove(&op) {
            return Err(GitError::backend(format!("injected failure: {op:?}")));
        }
        Ok(())
    }

    fn store_tree(&mut self, files: BTreeMap<String, FileEntry>) -> GitOid {
        let mut hasher = Sha256::new();
        hasher.update(b"tree\0");
        for (path, entry) in &files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(format!("{:?}", entry.mode).as_bytes());
            hasher.update(entry.oid.as_bytes());
        }
        let oid = digest_oid(hasher);
        self.trees.entry(oid).or_insert(files);
        oid
    }

    fn store_blob(&mut self, data: &[u8]) -> GitOid {
        let mut hasher = Sha256::new();
        hasher.update(b"blob\0");
        hasher.update(data);
        let oid = digest_oid(hasher);
        self.blobs.entry(oid).or_insert_with(|| data.to_vec());
        oid
    }

    fn store_commit(&mut self, tree: GitOid, parents: &[GitOid], message: &str) -> GitOid {
        self.clock += CLOCK_STEP;
        let info = CommitInfo {
            tree_oid: tree,
            parents: parents.to_vec(),
            message: message.to_owned(),
            author: AUTHOR.to_owned(),
            committer: AUTHOR.to_owned(),
            committed_at: self.clock,
        };
        let mut hasher = Sha256::new();
        hasher.update(b"commit\0");
        hasher.update(tree.as_bytes());
        for parent in parents {
            hasher.update(parent.as_bytes());
        }
        hasher.update(self.clock.to_be_bytes());
        hasher.update(message.as_bytes());
        let oid = digest_oid(hasher);
        self.commits.insert(oid, info);
        oid
    }

    fn commit(&self, oid: GitOid) -> Result<&CommitInfo, GitError> {
        self.commits.get(&oid).ok_or_else(|| GitError::NotFound {
            message: format!("commit {oid}"),
        })
    }

    fn tree(&self, oid: GitOid) -> Result<&BTreeMap<String, FileEntry>, GitError> {
        self.trees.get(&oid).ok_or_else(|| GitError::NotFound {
            message: format!("tree {oid}"),
        })
    }
}

fn digest_oid(hasher: Sha256) -> GitOid {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[..20]);
    GitOid::from_bytes(bytes)
}

/// An in-memory repository implementing [`GitRepo`].
pub struct MemoryRepo {
    state: Mutex<State>,
    workdir: Option<PathBuf>,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepo {
    /// An empty repository with no working directory.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State {
            clock: 1_700_000_000,
            ..State::default()
        };
        state.store_tree(BTreeMap::new());
        Self {
            state: Mutex::new(state),
            workdir: None,
        }
    }

    /// An empty repository whose checked-out files are written to `workdir`.
    #[must_use]
    pub fn with_workdir(workdir: impl Into<PathBuf>) -> Self {
        let mut repo = Self::new();
        repo.workdir = Some(workdir.into());
        repo
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Commit a full snapshot of `files` on `branch`, parented on the
    /// branch's current tip (if any), and advance the branch.
    pub fn commit_files(
        &self,
        branch: &str,
        files: &[(&str, &[u8])],
        message: &str,
    ) -> Result<GitOid, GitError> {
        let name = branch_ref(branch)?;
        let mut state = self.lock();
        let mut tree = BTreeMap::new();
        for (path, content) in files {
            let oid = state.store_blob(content);
            tree.insert(
                (*path).to_owned(),
                FileEntry {
                    mode: EntryMode::Blob,
                    oid,
                },
            );
        }
        let tree = state.store_tree(tree);
        let parents: Vec<GitOid> = state.refs.get(name.as_str()).copied().into_iter().collect();
        let commit = state.store_commit(tree, &parents, message);
        state.refs.insert(name.as_str().to_owned(), commit);
        Ok(commit)
    }

    /// Point `branch` at `commit`, creating or overwriting it.
    pub fn set_branch(&self, branch: &str, commit: GitOid) -> Result<(), GitError> {
        let name = branch_ref(branch)?;
        let mut state = self.lock();
        state.commit(commit)?;
        state.refs.insert(name.as_str().to_owned(), commit);
        Ok(())
    }

    /// Make `HEAD` a symbolic ref to `branch`.
    pub fn set_head(&self, branch: &str) -> Result<(), GitError> {
        let name = branch_ref(branch)?;
        self.lock().head = Some(name);
        Ok(())
    }

    /// Set the value [`GitRepo::is_dirty`] reports.
    pub fn set_dirty(&self, dirty: bool) {
        self.lock().dirty = dirty;
    }

    /// Arm `op` to fail the next time it is called.
    pub fn fail_next(&self, op: FailOp) {
        self.lock().armed.insert(op);
    }

    /// The tree most recently checked out into the working directory.
    #[must_use]
    pub fn checked_out_tree(&self) -> Option<GitOid> {
        self.lock().worktree
    }

    /// Read `path` at the tip of `branch`.
    pub fn file_at(&self, branch: &str, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let snapshot = self.resolve(&branch_ref(branch)?)?;
        self.read_file(snapshot.tree, path)
    }
}

fn branch_ref(branch: &str) -> Result<RefName, GitError> {
    RefName::branch(branch).map_err(|e| GitError::backend(e.to_string()))
}

impl GitRepo for MemoryRepo {
    fn resolve(&self, name: &RefName) -> Result<Snapshot, GitError> {
        let state = self.lock();
        let target = if name.as_str() == "HEAD" {
            state.head.clone().ok_or_else(|| GitError::NotFound {
                message: "HEAD is detached or unborn".to_owned(),
            })?
        } else {
            name.clone()
        };
        let commit = *state
            .refs
            .get(target.as_str())
            .ok_or_else(|| GitError::NotFound {
                message: format!("ref {name}"),
            })?;
        let info = state.commit(commit)?;
        Ok(Snapshot {
            commit,
            tree: info.tree_oid,
            committed_at: info.committed_at,
        })
    }

    fn update_ref(
        &self,
        name: &RefName,
        new: GitOid,
        expected_old: GitOid,
    ) -> Result<(), GitError> {
        let mut state = self.lock();
        state.take_failure(FailOp::UpdateRef)?;
        state.commit(new)?;
        let current = state.refs.get(name.as_str()).copied();
        let matches = match current {
            None => expected_old.is_zero(),
            Some(oid) => oid == expected_old,
        };
        if !matches {
            return Err(GitError::RefConflict {
                ref_name: name.to_string(),
                message: format!(
                    "expected {expected_old}, found {}",
                    current.map_or_else(|| "nothing".to_owned(), |o| o.to_string())
                ),
            });
        }
        state.refs.insert(name.as_str().to_owned(), new);
        Ok(())
    }

    fn head_branch(&self) -> Result<Option<RefName>, GitError> {
        Ok(self.lock().head.clone())
    }

    fn merge_base(&self, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError> {
        let state = self.lock();
        let mut ancestors_of_a = BTreeSet::new();
        let mut queue = VecDeque::from([a]);
        while let Some(oid) = queue.pop_front() {
            if ancestors_of_a.insert(oid) {
                queue.extend(state.commit(oid)?.parents.iter().copied());
            }
        }

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(oid) = queue.pop_front() {
            if ancestors_of_a.contains(&oid) {
                return Ok(Some(oid));
            }
            if seen.insert(oid) {
                queue.extend(state.commit(oid)?.parents.iter().copied());
            }
        }
        Ok(None)
    }

    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        self.lock().commit(oid).cloned()
    }

    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        self.lock()
            .blobs
            .get(&oid)
            .cloned()
            .ok_or_else(|| GitError::NotFound {
                message: format!("blob {oid}"),
            })
    }

    fn list_files(&self, tree: GitOid) -> Result<BTreeMap<String, FileEntry>, GitError> {
        self.lock().tree(tree).cloned()
    }

    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError> {
        let mut state = self.lock();
        state.take_failure(FailOp::WriteBlob)?;
        Ok(state.store_blob(data))
    }

    fn edit_tree(&self, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError> {
        let mut state = self.lock();
        let mut files = state.tree(base)?.clone();
        for edit in edits {
            match edit {
                TreeEdit::Upsert { path, mode, oid } => {
                    files.insert(
                        path.clone(),
                        FileEntry {
                            mode: *mode,
                            oid: *oid,
                        },
                    );
                }
                TreeEdit::Remove { path } => {
                    let prefix = format!("{path}/");
                    files.retain(|p, _| p != path && !p.starts_with(&prefix));
                }
            }
        }
        Ok(state.store_tree(files))
    }

    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
    ) -> Result<GitOid, GitError> {
        let mut state = self.lock();
        state.take_failure(FailOp::CreateCommit)?;
        state.tree(tree)?;
        for parent in parents {
            state.commit(*parent)?;
        }
        Ok(state.store_commit(tree, parents, message))
    }

    fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(self.lock().dirty)
    }

    fn checkout_tree(&self, tree: GitOid, dir: &Path) -> Result<(), GitError> {
        let (files, previous) = {
            let mut state = self.lock();
            state.take_failure(FailOp::CheckoutTree)?;
            let mut files = Vec::new();
            for (path, entry) in state.tree(tree)? {
                let data = state.blobs.get(&entry.oid).cloned().unwrap_or_default();
                files.push((path.clone(), data));
            }
            let is_workdir = self.workdir.as_deref() == Some(dir);
            let previous = if is_workdir {
                let prev = state.worktree.and_then(|t| state.trees.get(&t).cloned());
                state.worktree = Some(tree);
                prev.unwrap_or_default()
            } else {
                BTreeMap::new()
            };
            (files, previous)
        };

        for (path, _) in &previous {
            if !files.iter().any(|(p, _)| p == path) {
                match std::fs::remove_file(dir.join(path)) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
        }
        for (path, data) in files {
            let target = dir.join(&path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, data)?;
        }
        Ok(())
    }

    fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }
}
