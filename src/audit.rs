//! Append-only audit log.
//!
//! Every finished merge attempt, completed or aborted, is written as one
//! JSON line. Lines are never rewritten. Appends from concurrent processes
//! are serialized with an advisory lock on the log file itself.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::model::resolution::{AuditOutcome, MergeAuditEntry};
use crate::model::types::MergeId;

/// The JSON Lines audit log.
#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// A log stored at `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Where the log lives.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and fsync.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be opened, locked or written.
    pub fn append(&self, entry: &MergeAuditEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        FileExt::lock_exclusive(&file)?;
        let written = file.write_all(&line).and_then(|()| file.sync_data());
        let _ = FileExt::unlock(&file);
        written?;

        emit(entry);
        Ok(())
    }

    /// Every entry, oldest first. A missing file is an empty log.
    ///
    /// # Errors
    /// Returns an I/O error on read failure, or `InvalidData` naming the line
    /// that does not parse.
    pub fn read_all(&self) -> io::Result<Vec<MergeAuditEntry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}:{}: {e}", self.path.display(), index + 1),
                )
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Entries for one merge attempt.
    ///
    /// # Errors
    /// As for [`read_all`](Self::read_all).
    pub fn find(&self, merge_id: &MergeId) -> io::Result<Vec<MergeAuditEntry>> {
        let mut entries = self.read_all()?;
        entries.retain(|e| &e.merge_id == merge_id);
        Ok(entries)
    }
}

/// Mirror an audit entry into the tracing stream.
pub fn emit(entry: &MergeAuditEntry) {
    match &entry.outcome {
        AuditOutcome::Completed { commit } => tracing::info!(
            merge_id = %entry.merge_id,
            source = %entry.source,
            target = %entry.target,
            commit = %commit,
            records = entry.records.len(),
            warnings = entry.warnings.len(),
            "merge completed"
        ),
        AuditOutcome::Aborted {
            phase,
            reason,
            rolled_back,
        } => tracing::warn!(
            merge_id = %entry.merge_id,
            source = %entry.source,
            target = %entry.target,
            %phase,
            reason = reason.as_str(),
            rolled_back = rolled_back.len(),
            "merge aborted"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::merge_state::MergePhase;
    use crate::model::types::BranchRef;
    use reconcile_git::GitOid;

    fn entry(id: &str, outcome: AuditOutcome) -> MergeAuditEntry {
        MergeAuditEntry {
            merge_id: MergeId::new(id).unwrap(),
            source: BranchRef::new("feature").unwrap(),
            target: BranchRef::new("main").unwrap(),
            outcome,
            records: Vec::new(),
            warnings: Vec::new(),
            started_at: 10,
            finished_at: 20,
        }
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("nested").join("audit.jsonl"));
        let done = entry(
            "m-000000000001",
            AuditOutcome::Completed {
                commit: GitOid::from_bytes([7; 20]),
            },
        );
        let aborted = entry(
            "m-000000000002",
            AuditOutcome::Aborted {
                phase: MergePhase::Committing,
                reason: "validation failed".to_owned(),
                rolled_back: vec!["target ref".to_owned()],
            },
        );
        log.append(&done).unwrap();
        log.append(&aborted).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(log.read_all().unwrap(), vec![done.clone(), aborted]);
        assert_eq!(log.find(&done.merge_id).unwrap(), vec![done]);
    }

    #[test]
    fn malformed_line_names_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "\n{not json}\n").unwrap();
        let err = AuditLog::new(&path).read_all().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains(":2:"));
    }
}
