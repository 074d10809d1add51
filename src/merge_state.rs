//! Merge state machine and persisted merge sessions.
//!
//! Each merge attempt is persisted to `.reconcile/merges/<merge-id>.json`
//! as human-readable JSON after every transition. Every write is atomic
//! (write-to-temp + fsync + rename) so a crash never corrupts a session.
//!
//! # Lifecycle
//!
//! ```text
//! Validating → Resolving → Writing → Committing → Done
//!      │            │          │           │
//!      └────────────┴──────────┴───────────┴→ Aborted
//! ```

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use reconcile_git::{GitOid, Snapshot};
use serde::{Deserialize, Serialize};

use crate::error::{AbortReason, MergeWarning};
use crate::merge::differ::ChangeSet;
use crate::model::conflict::Conflict;
use crate::model::resolution::{MergeAuditEntry, ResolutionRecord, ResolutionStrategy};
use crate::model::types::{BranchRef, ConflictId, MergeId};

// ---------------------------------------------------------------------------
// MergePhase
// ---------------------------------------------------------------------------

/// The current phase of a merge.
///
/// Phases progress strictly forward. `Aborted` can be entered from any
/// non-terminal phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePhase {
    /// Resolve both branches and check the target's working tree.
    Validating,
    /// Classify, score and collect decisions.
    Resolving,
    /// Build the merged tree and stage metadata changes.
    Writing,
    /// Validate, commit and move the target ref.
    Committing,
    /// The merge commit landed.
    Done,
    /// The merge was abandoned and rolled back.
    Aborted,
}

impl MergePhase {
    /// Returns `true` if this is a terminal state (`Done` or `Aborted`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// Returns the set of valid next phases from this phase.
    #[must_use]
    pub const fn valid_transitions(self) -> &'static [Self] {
        match self {
            Self::Validating => &[Self::Resolving, Self::Aborted],
            Self::Resolving => &[Self::Writing, Self::Aborted],
            Self::Writing => &[Self::Committing, Self::Aborted],
            Self::Committing => &[Self::Done, Self::Aborted],
            Self::Done | Self::Aborted => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => write!(f, "validating"),
            Self::Resolving => write!(f, "resolving"),
            Self::Writing => write!(f, "writing"),
            Self::Committing => write!(f, "committing"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

/// The result of a single validation command execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// The command string that was executed.
    pub command: String,
    /// Whether this command passed (exit code 0).
    pub passed: bool,
    /// Exit code (`None` if killed by signal/timeout).
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// The outcome of a post-merge validation run.
///
/// `passed` is true only if every command passed; the first failing command
/// (if any) is last in `command_results`, since execution stops there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether every command exited 0.
    pub passed: bool,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Per-command results, in execution order.
    #[serde(default)]
    pub command_results: Vec<CommandResult>,
}

impl ValidationResult {
    /// The first failing command, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&CommandResult> {
        self.command_results.iter().find(|r| !r.passed)
    }
}

// ---------------------------------------------------------------------------
// MergeSession
// ---------------------------------------------------------------------------

/// The persisted state of one merge attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSession {
    /// This attempt's id.
    pub merge_id: MergeId,

    /// Current phase.
    pub phase: MergePhase,

    /// Branch merged in.
    pub source: BranchRef,

    /// Branch merged into.
    pub target: BranchRef,

    /// Source tip frozen at start.
    pub source_tip: Snapshot,

    /// Target tip frozen at start. Finalize refuses to commit if the branch
    /// has moved away from it.
    pub target_tip: Snapshot,

    /// Merge base of the two tips (`None` for unrelated histories).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<GitOid>,

    /// Paths changed per side.
    pub change_set: ChangeSet,

    /// Every conflict found, sorted by (path, symbol).
    #[serde(default)]
    pub conflicts: Vec<Conflict>,

    /// Scorer output per conflict.
    #[serde(default)]
    pub strategies: BTreeMap<ConflictId, ResolutionStrategy>,

    /// Applied decisions per conflict; at most one each.
    #[serde(default)]
    pub records: BTreeMap<ConflictId, ResolutionRecord>,

    /// Non-fatal degradations met so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<MergeWarning>,

    /// The candidate merge commit, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<GitOid>,

    /// Post-merge validation outcome, once run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,

    /// The audit entry, once the merge is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<MergeAuditEntry>,

    /// Why the merge was aborted, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,

    /// Unix timestamp (seconds) when the merge started.
    pub started_at: u64,

    /// Unix timestamp (seconds) of the last state update.
    pub updated_at: u64,
}

impl MergeSession {
    /// A session in the `Validating` phase with frozen inputs.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        merge_id: MergeId,
        source: BranchRef,
        target: BranchRef,
        source_tip: Snapshot,
        target_tip: Snapshot,
        base: Option<GitOid>,
        change_set: ChangeSet,
        now: u64,
    ) -> Self {
        Self {
            merge_id,
            phase: MergePhase::Validating,
            source,
            target,
            source_tip,
            target_tip,
            base,
            change_set,
            conflicts: Vec::new(),
            strategies: BTreeMap::new(),
            records: BTreeMap::new(),
            warnings: Vec::new(),
            candidate: None,
            validation_result: None,
            outcome: None,
            abort_reason: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Advance to the next phase, updating the timestamp.
    ///
    /// # Errors
    /// Returns [`MergeStateError::InvalidTransition`] if the transition is
    /// not allowed.
    pub fn advance(&mut self, next: MergePhase, now: u64) -> Result<(), MergeStateError> {
        if !self.phase.can_transition_to(next) {
            return Err(MergeStateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.updated_at = now;
        Ok(())
    }

    /// Abort the merge, dropping every resolution record.
    ///
    /// # Errors
    /// Returns [`MergeStateError::InvalidTransition`] if the merge is
    /// already in a terminal state.
    pub fn abort(&mut self, reason: AbortReason, now: u64) -> Result<(), MergeStateError> {
        if self.phase.is_terminal() {
            return Err(MergeStateError::InvalidTransition {
                from: self.phase,
                to: MergePhase::Aborted,
            });
        }
        self.phase = MergePhase::Aborted;
        self.records.clear();
        self.candidate = None;
        self.abort_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Look up a conflict by id.
    #[must_use]
    pub fn conflict(&self, id: &ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| &c.id == id)
    }

    /// Conflicts without a resolution record, in conflict order.
    #[must_use]
    pub fn pending(&self) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| !self.records.contains_key(&c.id))
            .collect()
    }

    /// Whether every conflict has exactly one record.
    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.conflicts
            .iter()
            .all(|c| self.records.contains_key(&c.id))
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns [`MergeStateError::Serialize`] on serialization failure.
    pub fn to_json(&self) -> Result<String, MergeStateError> {
        serde_json::to_string_pretty(self).map_err(|e| MergeStateError::Serialize(e.to_string()))
    }

    /// Deserialize from a JSON string.
    ///
    /// # Errors
    /// Returns [`MergeStateError::Deserialize`] on parse failure.
    pub fn from_json(json: &str) -> Result<Self, MergeStateError> {
        serde_json::from_str(json).map_err(|e| MergeStateError::Deserialize(e.to_string()))
    }

    /// Write the session file atomically with fsync.
    pub fn write_atomic(&self, path: &Path) -> Result<(), MergeStateError> {
        let json = self.to_json()?;
        write_atomic(path, json.as_bytes())
            .map_err(|e| MergeStateError::Io(format!("write {}: {e}", path.display())))
    }

    /// Read a session file from disk.
    ///
    /// # Errors
    /// Returns [`MergeStateError::NotFound`] if the file does not exist.
    /// Returns [`MergeStateError::Deserialize`] if the file is malformed.
    pub fn read(path: &Path) -> Result<Self, MergeStateError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MergeStateError::NotFound(path.to_owned())
            } else {
                MergeStateError::Io(format!("read {}: {e}", path.display()))
            }
        })?;
        Self::from_json(&contents)
    }
}

/// Replace `path` with `bytes` atomically.
///
/// 1. Write to a temporary file in the same directory.
/// 2. fsync the temporary file.
/// 3. Rename (atomic on POSIX) over the target path.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// SessionDir
// ---------------------------------------------------------------------------

/// The directory of persisted merge sessions.
#[derive(Clone, Debug)]
pub struct SessionDir {
    dir: PathBuf,
}

impl SessionDir {
    /// Sessions kept under `state_dir/merges`.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("merges"),
        }
    }

    /// The file for one merge.
    #[must_use]
    pub fn path_for(&self, merge_id: &MergeId) -> PathBuf {
        self.dir.join(format!("{merge_id}.json"))
    }

    /// Persist a session.
    pub fn save(&self, session: &MergeSession) -> Result<(), MergeStateError> {
        session.write_atomic(&self.path_for(&session.merge_id))
    }

    /// Load a session.
    pub fn load(&self, merge_id: &MergeId) -> Result<MergeSession, MergeStateError> {
        MergeSession::read(&self.path_for(merge_id))
    }

    /// Every persisted session, ordered by merge id.
    pub fn list(&self) -> Result<Vec<MergeSession>, MergeStateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MergeStateError::Io(format!(
                    "read {}: {e}",
                    self.dir.display()
                )));
            }
        };
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| MergeStateError::Io(e.to_string()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                sessions.push(MergeSession::read(&path)?);
            }
        }
        sessions.sort_by(|a, b| a.merge_id.cmp(&b.merge_id));
        Ok(sessions)
    }

    /// Sessions that have not reached a terminal phase.
    pub fn active(&self) -> Result<Vec<MergeSession>, MergeStateError> {
        let mut sessions = self.list()?;
        sessions.retain(|s| !s.phase.is_terminal());
        Ok(sessions)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors related to merge-state operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStateError {
    /// Invalid phase transition.
    InvalidTransition {
        /// The current phase.
        from: MergePhase,
        /// The attempted target phase.
        to: MergePhase,
    },
    /// The session file was not found.
    NotFound(PathBuf),
    /// Serialization error.
    Serialize(String),
    /// Deserialization error.
    Deserialize(String),
    /// I/O error (not "not found").
    Io(String),
}

impl fmt::Display for MergeStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid merge phase transition: {from} → {to}")
            }
            Self::NotFound(path) => {
                write!(f, "merge session file not found: {}", path.display())
            }
            Self::Serialize(msg) => write!(f, "merge session serialize error: {msg}"),
            Self::Deserialize(msg) => write!(f, "merge session deserialize error: {msg}"),
            Self::Io(msg) => write!(f, "merge session I/O error: {msg}"),
        }
    }
}

impl std::error::Error for MergeStateError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::error::AbortCause;

    fn oid(byte: u8) -> GitOid {
        GitOid::from_bytes([byte; 20])
    }

    fn snapshot(byte: u8) -> Snapshot {
        Snapshot {
            commit: oid(byte),
            tree: oid(byte + 1),
            committed_at: 1_700_000_000,
        }
    }

    fn session() -> MergeSession {
        MergeSession::new(
            MergeId::new("m-0123456789ab").unwrap(),
            BranchRef::new("feature").unwrap(),
            BranchRef::new("main").unwrap(),
            snapshot(1),
            snapshot(3),
            Some(oid(5)),
            ChangeSet::default(),
            1000,
        )
    }

    #[test]
    fn phase_display() {
        assert_eq!(MergePhase::Validating.to_string(), "validating");
        assert_eq!(MergePhase::Committing.to_string(), "committing");
        assert_eq!(MergePhase::Done.to_string(), "done");
    }

    #[test]
    fn phase_valid_transitions() {
        assert!(MergePhase::Validating.can_transition_to(MergePhase::Resolving));
        assert!(MergePhase::Resolving.can_transition_to(MergePhase::Writing));
        assert!(MergePhase::Writing.can_transition_to(MergePhase::Committing));
        assert!(MergePhase::Committing.can_transition_to(MergePhase::Done));
        for phase in [
            MergePhase::Validating,
            MergePhase::Resolving,
            MergePhase::Writing,
            MergePhase::Committing,
        ] {
            assert!(phase.can_transition_to(MergePhase::Aborted));
        }
    }

    #[test]
    fn phase_invalid_transitions() {
        assert!(!MergePhase::Validating.can_transition_to(MergePhase::Writing));
        assert!(!MergePhase::Resolving.can_transition_to(MergePhase::Done));
        assert!(!MergePhase::Done.can_transition_to(MergePhase::Aborted));
        assert!(!MergePhase::Aborted.can_transition_to(MergePhase::Resolving));
    }

    #[test]
    fn advance_happy_path() {
        let mut s = session();
        s.advance(MergePhase::Resolving, 1001).unwrap();
        s.advance(MergePhase::Writing, 1002).unwrap();
        s.advance(MergePhase::Committing, 1003).unwrap();
        s.advance(MergePhase::Done, 1004).unwrap();
        assert_eq!(s.phase, MergePhase::Done);
        assert_eq!(s.updated_at, 1004);
    }

    #[test]
    fn advance_invalid_transition() {
        let mut s = session();
        let err = s.advance(MergePhase::Done, 1001).unwrap_err();
        assert_eq!(
            err,
            MergeStateError::InvalidTransition {
                from: MergePhase::Validating,
                to: MergePhase::Done,
            }
        );
        assert_eq!(s.phase, MergePhase::Validating);
    }

    #[test]
    fn abort_clears_records_and_is_terminal() {
        let mut s = session();
        s.advance(MergePhase::Resolving, 1001).unwrap();
        let reason = AbortReason {
            merge_id: s.merge_id.clone(),
            phase: MergePhase::Resolving,
            cause: AbortCause::Cancelled,
            message: "cancelled".into(),
            rolled_back: Vec::new(),
        };
        s.abort(reason.clone(), 1002).unwrap();
        assert_eq!(s.phase, MergePhase::Aborted);
        assert!(s.records.is_empty());
        assert!(s.abort(reason, 1003).is_err());
    }

    #[test]
    fn json_roundtrip_and_omits_empty_fields() {
        let s = session();
        let json = s.to_json().unwrap();
        assert!(json.contains('\n'));
        assert!(!json.contains("abort_reason"));
        assert!(!json.contains("candidate"));
        assert_eq!(MergeSession::from_json(&json).unwrap(), s);
    }

    #[test]
    fn json_deserialize_invalid() {
        assert!(matches!(
            MergeSession::from_json("{"),
            Err(MergeStateError::Deserialize(_))
        ));
    }

    #[test]
    fn session_dir_save_load_and_active() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionDir::new(dir.path());
        let mut s = session();
        sessions.save(&s).unwrap();
        assert_eq!(sessions.load(&s.merge_id).unwrap(), s);
        assert_eq!(sessions.active().unwrap().len(), 1);

        s.advance(MergePhase::Resolving, 1001).unwrap();
        s.advance(MergePhase::Writing, 1002).unwrap();
        s.advance(MergePhase::Committing, 1003).unwrap();
        s.advance(MergePhase::Done, 1004).unwrap();
        sessions.save(&s).unwrap();
        assert!(sessions.active().unwrap().is_empty());
        assert_eq!(sessions.list().unwrap().len(), 1);
    }

    #[test]
    fn session_dir_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionDir::new(&dir.path().join("nope")).list().unwrap().is_empty());
    }

    #[test]
    fn read_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = MergeSession::read(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, MergeStateError::NotFound(_)));
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn validation_result_first_failure() {
        let ok = CommandResult {
            command: "true".into(),
            passed: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        };
        let bad = CommandResult {
            command: "false".into(),
            passed: false,
            exit_code: Some(1),
            ..ok.clone()
        };
        let result = ValidationResult {
            passed: false,
            duration_ms: 2,
            command_results: vec![ok, bad],
        };
        assert_eq!(result.first_failure().unwrap().command, "false");
    }
}
