//! Error and warning types for the reconciliation engine.
//!
//! [`MergeError`] is the single error type returned by the engine. Messages
//! are written for agents as much as for people: each fatal variant says
//! what went wrong and what to do next. [`MergeWarning`] records non-fatal
//! degradations that narrowed the analysis without stopping it.

use std::fmt;

use reconcile_git::{GitError, GitOid};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::merge_state::{MergePhase, MergeStateError};
use crate::model::types::{BranchRef, ConflictId, MergeId, Side, ValidationError};
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// MergeWarning
// ---------------------------------------------------------------------------

/// A non-fatal degradation met during a merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum MergeWarning {
    /// More paths changed on both sides than the configured ceiling.
    DivergenceTooLarge {
        /// Paths modified on both sides.
        modified: usize,
        /// The configured ceiling.
        ceiling: usize,
    },
    /// The metadata store could not answer for a symbol or file.
    MetadataUnavailable {
        /// Branch queried.
        branch: String,
        /// File queried.
        path: String,
        /// Symbol queried, if the lookup was per symbol.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<String>,
        /// Store diagnostic.
        reason: String,
    },
    /// A file did not parse; it was compared as a whole.
    ParseFailure {
        /// The file.
        path: String,
        /// The side whose version failed.
        side: Side,
        /// Parser diagnostic.
        message: String,
    },
    /// The audit log could not be appended after a successful commit.
    AuditWriteFailed {
        /// What failed.
        message: String,
    },
}

impl fmt::Display for MergeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivergenceTooLarge { modified, ceiling } => write!(
                f,
                "divergence too large: {modified} paths modified on both sides (ceiling {ceiling})"
            ),
            Self::MetadataUnavailable {
                branch,
                path,
                symbol,
                reason,
            } => {
                write!(f, "metadata unavailable for {branch}:{path}")?;
                if let Some(symbol) = symbol {
                    write!(f, "::{symbol}")?;
                }
                write!(f, " ({reason})")
            }
            Self::ParseFailure {
                path,
                side,
                message,
            } => write!(f, "{side} version of {path} does not parse: {message}"),
            Self::AuditWriteFailed { message } => write!(f, "audit log not written: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// AbortReason
// ---------------------------------------------------------------------------

/// Category of the failure that aborted a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// The caller cancelled the merge.
    Cancelled,
    /// A branch could not be resolved.
    BranchNotFound,
    /// The target's working tree has uncommitted changes.
    UncommittedChanges,
    /// The target branch moved after the merge started.
    TargetMoved,
    /// A lock stayed contended after every retry.
    LockContention,
    /// A post-merge validation command failed.
    ValidationFailed,
    /// The version-control backend failed.
    Backend,
    /// The metadata store failed.
    Store,
    /// Anything else (state persistence, I/O).
    Internal,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cancelled => "cancelled",
            Self::BranchNotFound => "branch not found",
            Self::UncommittedChanges => "uncommitted changes",
            Self::TargetMoved => "target moved",
            Self::LockContention => "lock contention",
            Self::ValidationFailed => "validation failed",
            Self::Backend => "backend failure",
            Self::Store => "metadata store failure",
            Self::Internal => "internal failure",
        };
        f.write_str(s)
    }
}

/// Why a merge was aborted, in which phase, and what was undone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    /// The aborted merge.
    pub merge_id: MergeId,
    /// The phase that failed.
    pub phase: MergePhase,
    /// Failure category.
    pub cause: AbortCause,
    /// The underlying error message.
    pub message: String,
    /// Steps undone during rollback, in order.
    #[serde(default)]
    pub rolled_back: Vec<String>,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merge {} aborted during {} ({}): {}",
            self.merge_id, self.phase, self.cause, self.message
        )?;
        if self.rolled_back.is_empty() {
            write!(f, "\n  Nothing had been written; no rollback was needed.")
        } else {
            write!(f, "\n  Rolled back:")?;
            for step in &self.rolled_back {
                write!(f, "\n    - {step}")?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// MergeError
// ---------------------------------------------------------------------------

/// Unified error type for reconciliation operations.
#[derive(Debug)]
pub enum MergeError {
    /// A branch ref could not be resolved.
    BranchNotFound {
        /// The missing branch.
        branch: BranchRef,
    },
    /// The checked-out target branch has uncommitted changes.
    UncommittedChanges {
        /// The target branch.
        branch: BranchRef,
    },
    /// One of the branches is already part of a running merge.
    MergeInProgress {
        /// The busy branch.
        branch: BranchRef,
        /// The merge holding it.
        merge_id: MergeId,
    },
    /// The target branch moved since the merge started.
    TargetMoved {
        /// The target branch.
        branch: BranchRef,
        /// Tip frozen at start.
        expected: GitOid,
        /// Tip found now.
        actual: GitOid,
    },
    /// `finalize` was asked not to wait and conflicts remain unresolved.
    PendingConflicts {
        /// The merge.
        merge_id: MergeId,
        /// Unresolved conflicts.
        pending: Vec<ConflictId>,
    },
    /// `finalize` gave up waiting for decisions.
    MediationTimeout {
        /// The merge.
        merge_id: MergeId,
        /// Conflicts still unresolved.
        pending: usize,
    },
    /// No merge session with this id exists.
    UnknownMerge {
        /// The requested id.
        merge_id: String,
    },
    /// The conflict id does not belong to this merge.
    UnknownConflict {
        /// The merge.
        merge_id: MergeId,
        /// The requested id.
        conflict_id: String,
    },
    /// The conflict already has a resolution record.
    AlreadyResolved {
        /// The conflict.
        conflict_id: ConflictId,
    },
    /// The decision does not apply to this kind of conflict.
    InvalidDecision {
        /// The conflict.
        conflict_id: ConflictId,
        /// Why it was rejected.
        reason: String,
    },
    /// The operation is not allowed in the merge's current phase.
    WrongPhase {
        /// The merge.
        merge_id: MergeId,
        /// Its phase.
        phase: MergePhase,
        /// The operation attempted.
        operation: &'static str,
    },
    /// A post-merge validation command failed.
    PostMergeValidationFailed {
        /// The command that failed.
        command: String,
        /// Its exit code (`None` if killed or timed out).
        exit_code: Option<i32>,
        /// Captured stderr (may be truncated).
        stderr: String,
    },
    /// A lock stayed contended after every retry.
    LockContention {
        /// What was locked.
        resource: String,
        /// Attempts made.
        attempts: u32,
    },
    /// The caller cancelled the merge.
    Cancelled {
        /// The merge.
        merge_id: MergeId,
    },
    /// The merge was aborted; nothing it staged survives.
    Aborted(Box<AbortReason>),
    /// Version-control backend failure.
    Git(GitError),
    /// Metadata store failure.
    Store(StoreError),
    /// Merge state persistence failure.
    State(MergeStateError),
    /// Configuration could not be loaded.
    Config(ConfigError),
    /// An identifier failed validation.
    Invalid(ValidationError),
    /// Filesystem failure.
    Io(std::io::Error),
}

impl MergeError {
    /// The abort category this error maps to.
    #[must_use]
    pub const fn abort_cause(&self) -> AbortCause {
        match self {
            Self::BranchNotFound { .. } => AbortCause::BranchNotFound,
            Self::UncommittedChanges { .. } => AbortCause::UncommittedChanges,
            Self::TargetMoved { .. } => AbortCause::TargetMoved,
            Self::LockContention { .. } => AbortCause::LockContention,
            Self::Cancelled { .. } => AbortCause::Cancelled,
            Self::PostMergeValidationFailed { .. } => AbortCause::ValidationFailed,
            Self::Git(_) => AbortCause::Backend,
            Self::Store(_) => AbortCause::Store,
            Self::Aborted(reason) => reason.cause,
            _ => AbortCause::Internal,
        }
    }

    /// The abort reason, when this error is an abort.
    #[must_use]
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Self::Aborted(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for MergeError {
    #[allow(clippy::too_many_lines)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BranchNotFound { branch } => write!(
                f,
                "branch '{branch}' not found.\n  To fix: check the name with `git branch --list`."
            ),
            Self::UncommittedChanges { branch } => write!(
                f,
                "target branch '{branch}' has uncommitted changes.\n  To fix: commit or stash them, then retry the merge."
            ),
            Self::MergeInProgress { branch, merge_id } => write!(
                f,
                "branch '{branch}' is already part of merge {merge_id}.\n  To fix: finalize or cancel it first:\n    reconcile finalize {merge_id}\n    reconcile cancel {merge_id}"
            ),
            Self::TargetMoved {
                branch,
                expected,
                actual,
            } => write!(
                f,
                "target branch '{branch}' moved from {} to {} during the merge.\n  To fix: start a new merge against the current tip.",
                expected.short(),
                actual.short()
            ),
            Self::PendingConflicts { merge_id, pending } => {
                write!(
                    f,
                    "merge {merge_id} has {} unresolved conflict(s):",
                    pending.len()
                )?;
                for id in pending {
                    write!(f, "\n  - {id}")?;
                }
                write!(
                    f,
                    "\n  To fix: inspect them with `reconcile conflicts {merge_id}` and submit decisions."
                )
            }
            Self::MediationTimeout { merge_id, pending } => write!(
                f,
                "timed out waiting for {pending} decision(s) on merge {merge_id}.\n  The merge is still open; submit decisions and finalize again."
            ),
            Self::UnknownMerge { merge_id } => write!(
                f,
                "no merge '{merge_id}' found.\n  To fix: list past merges with `reconcile audit`."
            ),
            Self::UnknownConflict {
                merge_id,
                conflict_id,
            } => write!(
                f,
                "merge {merge_id} has no conflict '{conflict_id}'.\n  To fix: list conflicts with `reconcile conflicts {merge_id}`."
            ),
            Self::AlreadyResolved { conflict_id } => {
                write!(f, "conflict {conflict_id} is already resolved")
            }
            Self::InvalidDecision {
                conflict_id,
                reason,
            } => write!(f, "invalid decision for conflict {conflict_id}: {reason}"),
            Self::WrongPhase {
                merge_id,
                phase,
                operation,
            } => write!(f, "cannot {operation} merge {merge_id} while it is {phase}"),
            Self::PostMergeValidationFailed {
                command,
                exit_code,
                stderr,
            } => {
                match exit_code {
                    Some(code) => {
                        write!(f, "validation command failed (exit code {code}): {command}")?;
                    }
                    None => write!(f, "validation command killed or timed out: {command}")?,
                }
                if !stderr.is_empty() {
                    write!(f, "\n  stderr: {stderr}")?;
                }
                Ok(())
            }
            Self::LockContention { resource, attempts } => write!(
                f,
                "lock on {resource} still held after {attempts} attempt(s).\n  To fix: wait for the other merge to finish and retry."
            ),
            Self::Cancelled { merge_id } => write!(f, "merge {merge_id} was cancelled"),
            Self::Aborted(reason) => write!(f, "{reason}"),
            Self::Git(e) => write!(f, "git backend error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "{e}"),
            Self::Config(e) => write!(
                f,
                "configuration error: {e}\n  To fix: edit the config file and correct the issue."
            ),
            Self::Invalid(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for MergeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Git(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Invalid(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<GitError> for MergeError {
    fn from(err: GitError) -> Self {
        Self::Git(err)
    }
}

impl From<StoreError> for MergeError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<MergeStateError> for MergeError {
    fn from(err: MergeStateError) -> Self {
        Self::State(err)
    }
}

impl From<ConfigError> for MergeError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ValidationError> for MergeError {
    fn from(err: ValidationError) -> Self {
        Self::Invalid(err)
    }
}

impl From<std::io::Error> for MergeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<AbortReason> for MergeError {
    fn from(reason: AbortReason) -> Self {
        Self::Aborted(Box::new(reason))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
