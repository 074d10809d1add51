//! gix-backed checkout of a tree into a directory.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use gix::bstr::ByteSlice;

use crate::error::GitError;
use crate::gix_repo::GixRepo;
use crate::objects_impl::to_gix_oid;
use crate::types::GitOid;

pub fn checkout_tree(repo: &GixRepo, tree: GitOid, dir: &Path) -> Result<(), GitError> {
    let tree_oid = to_gix_oid(tree);
    let is_workdir = repo
        .workdir
        .as_deref()
        .is_some_and(|w| same_dir(w, dir));

    // Paths tracked before the checkout. Only these may be removed afterwards;
    // untracked files (including tool state) are left alone.
    let previously_tracked: HashSet<String> = if is_workdir {
        repo.repo
            .open_index()
            .map(|index| {
                index
                    .entries()
                    .iter()
                    .filter_map(|e| e.path(&index).to_str().ok().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    } else {
        HashSet::new()
    };

    let mut index_file = repo
        .repo
        .index_from_tree(&tree_oid)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to create index from tree {tree}: {e}"),
        })?;

    let tree_paths: HashSet<String> = index_file
        .entries()
        .iter()
        .filter_map(|entry| entry.path(&index_file).to_str().ok().map(str::to_owned))
        .collect();

    let mut opts = repo
        .repo
        .checkout_options(gix::worktree::stack::state::attributes::Source::IdMapping)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to get checkout options: {e}"),
        })?;
    opts.overwrite_existing = true;
    opts.destination_is_initially_empty = false;

    let objects = repo
        .repo
        .objects
        .clone()
        .into_arc()
        .map_err(|e| GitError::BackendError {
            message: format!("failed to convert object store to Arc: {e}"),
        })?;

    let outcome = gix::worktree::state::checkout(
        &mut index_file,
        dir,
        objects,
        &gix::progress::Discard,
        &gix::progress::Discard,
        &AtomicBool::new(false),
        opts,
    )
    .map_err(|e| GitError::BackendError {
        message: format!("checkout failed: {e}"),
    })?;

    if let Some(first) = outcome.errors.first() {
        return Err(GitError::BackendError {
            message: format!(
                "checkout had {} error(s), first: {}: {}",
                outcome.errors.len(),
                first.path,
                first.error,
            ),
        });
    }

    for stale in previously_tracked.difference(&tree_paths) {
        let path = dir.join(stale);
        match std::fs::remove_file(&path) {
            Ok(()) => remove_empty_parents(dir, &path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(GitError::BackendError {
                    message: format!("failed to remove stale file '{stale}': {e}"),
                });
            }
        }
    }

    if is_workdir {
        index_file
            .write(gix::index::write::Options::default())
            .map_err(|e| GitError::BackendError {
                message: format!("failed to write index: {e}"),
            })?;
    }

    tracing::debug!(%tree, dir = %dir.display(), files = tree_paths.len(), "checked out tree");
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Remove directories left empty by a stale-file removal, stopping at `root`.
fn remove_empty_parents(root: &Path, file: &Path) {
    let mut current = file.parent();
    while let Some(dir) = current {
        if dir == root || std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
