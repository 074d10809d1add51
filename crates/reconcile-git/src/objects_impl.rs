//! gix-backed object read/write and tree editing operations.

use std::collections::BTreeMap;

use crate::error::GitError;
use crate::gix_repo::GixRepo;
use crate::types::{CommitInfo, EntryMode, FileEntry, GitOid, TreeEdit, TreeEntry};

/// Convert our `GitOid` to a `gix::ObjectId`.
pub(crate) const fn to_gix_oid(oid: GitOid) -> gix::ObjectId {
    gix::ObjectId::Sha1(*oid.as_bytes())
}

/// Convert a `gix::ObjectId` to our `GitOid`.
pub(crate) fn from_gix_oid(oid: gix::ObjectId) -> GitOid {
    let mut bytes = [0u8; 20];
    let src = oid.as_bytes();
    let n = src.len().min(20);
    bytes[..n].copy_from_slice(&src[..n]);
    GitOid::from_bytes(bytes)
}

fn from_gix_entry_mode(mode: gix::objs::tree::EntryMode) -> EntryMode {
    match mode.kind() {
        gix::objs::tree::EntryKind::Tree => EntryMode::Tree,
        gix::objs::tree::EntryKind::Blob => EntryMode::Blob,
        gix::objs::tree::EntryKind::BlobExecutable => EntryMode::BlobExecutable,
        gix::objs::tree::EntryKind::Link => EntryMode::Link,
        gix::objs::tree::EntryKind::Commit => EntryMode::Commit,
    }
}

const fn to_gix_entry_kind(mode: EntryMode) -> gix::objs::tree::EntryKind {
    match mode {
        EntryMode::Blob => gix::objs::tree::EntryKind::Blob,
        EntryMode::BlobExecutable => gix::objs::tree::EntryKind::BlobExecutable,
        EntryMode::Tree => gix::objs::tree::EntryKind::Tree,
        EntryMode::Link => gix::objs::tree::EntryKind::Link,
        EntryMode::Commit => gix::objs::tree::EntryKind::Commit,
    }
}

pub fn read_blob(repo: &GixRepo, oid: GitOid) -> Result<Vec<u8>, GitError> {
    let mut blob = repo
        .repo
        .find_blob(to_gix_oid(oid))
        .map_err(|e| GitError::NotFound {
            message: format!("blob {oid}: {e}"),
        })?;
    Ok(blob.take_data())
}

fn read_tree(repo: &GixRepo, oid: GitOid) -> Result<Vec<TreeEntry>, GitError> {
    let tree = repo
        .repo
        .find_tree(to_gix_oid(oid))
        .map_err(|e| GitError::NotFound {
            message: format!("tree {oid}: {e}"),
        })?;

    let mut entries = Vec::new();
    for result in tree.iter() {
        let entry = result.map_err(|e| GitError::BackendError {
            message: format!("failed to decode tree entry: {e}"),
        })?;
        entries.push(TreeEntry {
            name: entry.inner.filename.to_string(),
            mode: from_gix_entry_mode(entry.inner.mode),
            oid: from_gix_oid(entry.inner.oid.to_owned()),
        });
    }
    Ok(entries)
}

pub fn list_files(repo: &GixRepo, tree: GitOid) -> Result<BTreeMap<String, FileEntry>, GitError> {
    let mut files = BTreeMap::new();
    let mut pending = vec![(String::new(), tree)];
    while let Some((prefix, oid)) = pending.pop() {
        for entry in read_tree(repo, oid)? {
            let path = if prefix.is_empty() {
                entry.name
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode == EntryMode::Tree {
                pending.push((path, entry.oid));
            } else {
                files.insert(
                    path,
                    FileEntry {
                        mode: entry.mode,
                        oid: entry.oid,
                    },
                );
            }
        }
    }
    Ok(files)
}

pub fn read_commit(repo: &GixRepo, oid: GitOid) -> Result<CommitInfo, GitError> {
    let commit = repo
        .repo
        .find_commit(to_gix_oid(oid))
        .map_err(|e| GitError::NotFound {
            message: format!("commit {oid}: {e}"),
        })?;

    let decoded = commit.decode().map_err(|e| GitError::BackendError {
        message: format!("failed to decode commit {oid}: {e}"),
    })?;

    let author_sig = decoded.author();
    let committer_sig = decoded.committer();
    let committed_at = committer_sig
        .time()
        .map_err(|e| GitError::backend(format!("commit time of {oid}: {e}")))?
        .seconds;

    Ok(CommitInfo {
        tree_oid: from_gix_oid(decoded.tree()),
        parents: decoded.parents().map(from_gix_oid).collect(),
        message: decoded.message.to_string(),
        author: format!("{} <{}>", author_sig.name, author_sig.email),
        committer: format!("{} <{}>", committer_sig.name, committer_sig.email),
        committed_at,
    })
}

pub fn write_blob(repo: &GixRepo, data: &[u8]) -> Result<GitOid, GitError> {
    let id = repo
        .repo
        .write_blob(data)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to write blob: {e}"),
        })?;
    Ok(from_gix_oid(id.detach()))
}

pub fn create_commit(
    repo: &GixRepo,
    tree: GitOid,
    parents: &[GitOid],
    message: &str,
) -> Result<GitOid, GitError> {
    let author_sig = repo
        .repo
        .author()
        .ok_or_else(|| GitError::backend("no author identity configured"))?
        .map_err(|e| GitError::backend(format!("failed to read author identity: {e}")))?;

    let committer_sig = repo
        .repo
        .committer()
        .ok_or_else(|| GitError::backend("no committer identity configured"))?
        .map_err(|e| GitError::backend(format!("failed to read committer identity: {e}")))?;

    let commit = gix::objs::Commit {
        message: message.into(),
        tree: to_gix_oid(tree),
        author: author_sig.into(),
        committer: committer_sig.into(),
        encoding: None,
        parents: parents.iter().map(|p| to_gix_oid(*p)).collect(),
        extra_headers: Vec::new(),
    };
    let id = repo
        .repo
        .write_object(&commit)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to write commit object: {e}"),
        })?;
    Ok(from_gix_oid(id.detach()))
}

pub fn edit_tree(repo: &GixRepo, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError> {
    let tree = repo
        .repo
        .find_tree(to_gix_oid(base))
        .map_err(|e| GitError::NotFound {
            message: format!("base tree {base}: {e}"),
        })?;

    let mut editor = tree.edit().map_err(|e| GitError::BackendError {
        message: format!("failed to create tree editor: {e}"),
    })?;

    for edit in edits {
        match edit {
            TreeEdit::Upsert { path, mode, oid } => {
                editor
                    .upsert(path.as_str(), to_gix_entry_kind(*mode), to_gix_oid(*oid))
                    .map_err(|e| GitError::BackendError {
                        message: format!("tree edit upsert '{path}': {e}"),
                    })?;
            }
            TreeEdit::Remove { path } => {
                editor
                    .remove(path.as_str())
                    .map_err(|e| GitError::BackendError {
                        message: format!("tree edit remove '{path}': {e}"),
                    })?;
            }
        }
    }

    let new_id = editor.write().map_err(|e| GitError::BackendError {
        message: format!("failed to write edited tree: {e}"),
    })?;
    Ok(from_gix_oid(new_id.detach()))
}
