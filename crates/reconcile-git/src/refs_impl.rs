//! gix-backed ref resolution, compare-and-swap updates, and ancestry.

use gix::refs::transaction::{Change, LogChange, PreviousValue, RefLog};
use gix::refs::{FullName, Target};

use crate::error::GitError;
use crate::gix_repo::GixRepo;
use crate::objects_impl::{from_gix_oid, to_gix_oid};
use crate::types::{GitOid, RefName, Snapshot};

pub fn resolve(repo: &GixRepo, name: &RefName) -> Result<Snapshot, GitError> {
    let reference = repo
        .repo
        .try_find_reference(name.as_str())
        .map_err(|e| GitError::backend(e.to_string()))?;
    let Some(mut reference) = reference else {
        return Err(GitError::NotFound {
            message: format!("ref {name}"),
        });
    };
    let id = reference
        .peel_to_id_in_place()
        .map_err(|e| GitError::backend(format!("peel {name}: {e}")))?;
    let commit_oid = from_gix_oid(id.detach());

    let commit = repo
        .repo
        .find_commit(id.detach())
        .map_err(|e| GitError::NotFound {
            message: format!("commit {commit_oid} for {name}: {e}"),
        })?;
    let tree_id = commit
        .tree_id()
        .map_err(|e| GitError::backend(format!("tree of {commit_oid}: {e}")))?;
    let committed_at = commit
        .time()
        .map_err(|e| GitError::backend(format!("commit time of {commit_oid}: {e}")))?
        .seconds;

    Ok(Snapshot {
        commit: commit_oid,
        tree: from_gix_oid(tree_id.detach()),
        committed_at,
    })
}

pub fn update_ref(
    repo: &GixRepo,
    name: &RefName,
    new: GitOid,
    expected_old: GitOid,
) -> Result<(), GitError> {
    let full_name: FullName = name
        .as_str()
        .try_into()
        .map_err(|e: gix::validate::reference::name::Error| GitError::backend(e.to_string()))?;

    let expected = if expected_old.is_zero() {
        PreviousValue::MustNotExist
    } else {
        PreviousValue::MustExistAndMatch(Target::Object(to_gix_oid(expected_old)))
    };

    let edit = gix::refs::transaction::RefEdit {
        change: Change::Update {
            log: LogChange {
                mode: RefLog::AndReference,
                force_create_reflog: false,
                message: "reconcile: merge".into(),
            },
            expected,
            new: Target::Object(to_gix_oid(new)),
        },
        name: full_name,
        deref: false,
    };

    repo.repo.edit_references([edit]).map_err(|e| {
        let msg = e.to_string();
        // CAS failures are only distinguishable by message.
        if msg.contains("existing object id")
            || msg.contains("MustExistAndMatch")
            || msg.contains("did not match")
            || msg.contains("must not exist")
            || msg.contains("MustNotExist")
        {
            GitError::RefConflict {
                ref_name: name.to_string(),
                message: msg,
            }
        } else {
            GitError::BackendError { message: msg }
        }
    })?;
    Ok(())
}

pub fn head_branch(repo: &GixRepo) -> Result<Option<RefName>, GitError> {
    let head = repo
        .repo
        .head_name()
        .map_err(|e| GitError::backend(e.to_string()))?;
    Ok(head.and_then(|full| RefName::new(&full.as_bstr().to_string()).ok()))
}

pub fn merge_base(repo: &GixRepo, a: GitOid, b: GitOid) -> Result<Option<GitOid>, GitError> {
    if a == b {
        return Ok(Some(a));
    }
    match repo.repo.merge_base(to_gix_oid(a), to_gix_oid(b)) {
        Ok(id) => Ok(Some(from_gix_oid(id.detach()))),
        Err(gix::repository::merge_base::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(GitError::backend(e.to_string())),
    }
}
