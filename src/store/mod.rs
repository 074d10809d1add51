//! The metadata store boundary.
//!
//! The engine reads per-function metadata through [`MetadataStore`] while
//! analysing a merge and writes it back only through a
//! [`StoreTransaction`] opened by the committer. Staged changes are
//! invisible to readers until [`StoreTransaction::commit`] succeeds.
//!
//! Two implementations ship with the crate: [`JsonMetadataStore`] (one JSON
//! document on disk, guarded by an advisory lock) and
//! [`MemoryMetadataStore`] (in-process, with switches for simulating
//! outages, contention and commit failures).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::resolution::MergeAuditEntry;
use crate::model::types::{BranchRef, FunctionMetadata};

pub mod json;
pub mod memory;

pub use json::JsonMetadataStore;
pub use memory::MemoryMetadataStore;

// ---------------------------------------------------------------------------
// RowKey
// ---------------------------------------------------------------------------

/// Identity of one function-metadata row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    /// Branch the row belongs to.
    pub branch: BranchRef,
    /// Repository-relative file path.
    pub path: String,
    /// Qualified symbol key.
    pub symbol: String,
}

impl RowKey {
    /// Build a row key.
    #[must_use]
    pub fn new(branch: &BranchRef, path: &str, symbol: &str) -> Self {
        Self {
            branch: branch.clone(),
            path: path.to_owned(),
            symbol: symbol.to_owned(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}::{}", self.branch, self.path, self.symbol)
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from a metadata store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or read.
    Unavailable(String),
    /// Another writer holds a lock this operation needs.
    LockContention {
        /// What was locked.
        resource: String,
    },
    /// Writing the store failed.
    Io(String),
    /// The stored document could not be (de)serialised.
    Serialize(String),
    /// The transaction could not be committed; nothing was applied.
    CommitFailed(String),
}

impl StoreError {
    /// Whether retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "metadata store unavailable: {msg}"),
            Self::LockContention { resource } => {
                write!(f, "metadata store lock held by another writer: {resource}")
            }
            Self::Io(msg) => write!(f, "metadata store I/O error: {msg}"),
            Self::Serialize(msg) => write!(f, "metadata store document error: {msg}"),
            Self::CommitFailed(msg) => write!(f, "metadata store commit failed: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read access plus transactional writes for function metadata.
pub trait MetadataStore: Send + Sync {
    /// The record for `symbol` in `path` on `branch`, or `None` when the
    /// store holds no such row.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot answer.
    fn function_metadata(
        &self,
        branch: &BranchRef,
        path: &str,
        symbol: &str,
    ) -> Result<Option<FunctionMetadata>, StoreError>;

    /// Every row for `path` on `branch`, keyed by symbol.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot answer.
    fn functions_in(
        &self,
        branch: &BranchRef,
        path: &str,
    ) -> Result<BTreeMap<String, FunctionMetadata>, StoreError>;

    /// Every audit entry persisted so far, oldest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot answer.
    fn audit_entries(&self) -> Result<Vec<MergeAuditEntry>, StoreError>;

    /// Whether `branch` has been marked as merged.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the store cannot answer.
    fn is_merged(&self, branch: &BranchRef) -> Result<bool, StoreError>;

    /// Open a transaction that will touch `rows`, locking them against
    /// other writers until it is committed, rolled back or dropped.
    ///
    /// # Errors
    /// Returns [`StoreError::LockContention`] when another writer holds a
    /// needed lock; callers retry with backoff.
    fn begin(&self, rows: &[RowKey]) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// Staged writes against a [`MetadataStore`].
pub trait StoreTransaction {
    /// Insert or replace a row.
    fn upsert_function_metadata(&mut self, key: RowKey, metadata: FunctionMetadata);

    /// Delete a row; no-op if absent.
    fn remove_function_metadata(&mut self, key: &RowKey);

    /// Append a merge audit entry.
    fn append_audit(&mut self, entry: MergeAuditEntry);

    /// Record that `branch` has been merged.
    fn mark_merged(&mut self, branch: &BranchRef);

    /// Apply every staged change at once.
    ///
    /// # Errors
    /// Returns [`StoreError::CommitFailed`] or [`StoreError::Io`]; in that
    /// case nothing was applied.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every staged change and release locks.
    fn rollback(self: Box<Self>);
}

// ---------------------------------------------------------------------------
// StoreDocument
// ---------------------------------------------------------------------------

/// Full contents of a metadata store. Both shipped stores keep exactly this
/// shape, in memory or as JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDocument {
    /// branch → path → symbol → record.
    #[serde(default)]
    pub functions: BTreeMap<String, BTreeMap<String, BTreeMap<String, FunctionMetadata>>>,
    /// Branches marked as merged.
    #[serde(default)]
    pub merged: BTreeSet<String>,
    /// Audit history, oldest first.
    #[serde(default)]
    pub audit: Vec<MergeAuditEntry>,
}

impl StoreDocument {
    /// Look up one row.
    #[must_use]
    pub fn get(&self, branch: &BranchRef, path: &str, symbol: &str) -> Option<&FunctionMetadata> {
        self.functions
            .get(branch.as_str())
            .and_then(|paths| paths.get(path))
            .and_then(|symbols| symbols.get(symbol))
    }

    /// All rows for one file.
    #[must_use]
    pub fn rows_in(&self, branch: &BranchRef, path: &str) -> BTreeMap<String, FunctionMetadata> {
        self.functions
            .get(branch.as_str())
            .and_then(|paths| paths.get(path))
            .cloned()
            .unwrap_or_default()
    }

    /// Insert or replace one row.
    pub fn insert(&mut self, key: &RowKey, metadata: FunctionMetadata) {
        self.functions
            .entry(key.branch.as_str().to_owned())
            .or_default()
            .entry(key.path.clone())
            .or_default()
            .insert(key.symbol.clone(), metadata);
    }

    /// Remove one row, pruning empty maps.
    pub fn remove(&mut self, key: &RowKey) {
        let Some(paths) = self.functions.get_mut(key.branch.as_str()) else {
            return;
        };
        if let Some(symbols) = paths.get_mut(&key.path) {
            symbols.remove(&key.symbol);
            if symbols.is_empty() {
                paths.remove(&key.path);
            }
        }
        if paths.is_empty() {
            self.functions.remove(key.branch.as_str());
        }
    }

    fn apply(&mut self, ops: Vec<StagedOp>) {
        for op in ops {
            match op {
                StagedOp::Upsert(key, metadata) => self.insert(&key, metadata),
                StagedOp::Remove(key) => self.remove(&key),
                StagedOp::Audit(entry) => self.audit.push(*entry),
                StagedOp::MarkMerged(branch) => {
                    self.merged.insert(branch);
                }
            }
        }
    }
}

/// One staged write, replayed in order at commit.
#[derive(Clone, Debug)]
enum StagedOp {
    Upsert(RowKey, FunctionMetadata),
    Remove(RowKey),
    Audit(Box<MergeAuditEntry>),
    MarkMerged(String),
}

/// The staging buffer shared by both transaction types.
#[derive(Debug, Default)]
struct Staging {
    ops: Vec<StagedOp>,
}

impl Staging {
    fn upsert(&mut self, key: RowKey, metadata: FunctionMetadata) {
        self.ops.push(StagedOp::Upsert(key, metadata));
    }

    fn remove(&mut self, key: &RowKey) {
        self.ops.push(StagedOp::Remove(key.clone()));
    }

    fn audit(&mut self, entry: MergeAuditEntry) {
        self.ops.push(StagedOp::Audit(Box::new(entry)));
    }

    fn mark_merged(&mut self, branch: &BranchRef) {
        self.ops
            .push(StagedOp::MarkMerged(branch.as_str().to_owned()));
    }

    fn take(&mut self) -> Vec<StagedOp> {
        std::mem::take(&mut self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::Purity;

    fn key(symbol: &str) -> RowKey {
        RowKey::new(&BranchRef::new("main").unwrap(), "calc.py", symbol)
    }

    #[test]
    fn document_insert_get_remove_prunes() {
        let mut doc = StoreDocument::default();
        doc.insert(&key("calc"), FunctionMetadata::new(Purity::Pure, 1, 1));
        let main = BranchRef::new("main").unwrap();
        assert!(doc.get(&main, "calc.py", "calc").is_some());
        assert_eq!(doc.rows_in(&main, "calc.py").len(), 1);

        doc.remove(&key("calc"));
        assert!(doc.functions.is_empty());
        doc.remove(&key("absent"));
    }

    #[test]
    fn staged_ops_apply_in_order() {
        let mut staging = Staging::default();
        staging.upsert(key("calc"), FunctionMetadata::new(Purity::Pure, 1, 1));
        staging.remove(&key("calc"));
        staging.mark_merged(&BranchRef::new("feature").unwrap());

        let mut doc = StoreDocument::default();
        doc.apply(staging.take());
        assert!(doc.functions.is_empty());
        assert!(doc.merged.contains("feature"));
    }

    #[test]
    fn only_contention_is_transient() {
        assert!(StoreError::LockContention {
            resource: "x".into()
        }
        .is_transient());
        assert!(!StoreError::Unavailable("down".into()).is_transient());
    }
}
