//! In-process metadata store.
//!
//! Rows are locked individually: a transaction locks the rows it declared
//! in [`MetadataStore::begin`] and releases them on commit, rollback or
//! drop. Switches let tests and embedders simulate an unreachable store,
//! unreadable rows, contention and commit failures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{MetadataStore, RowKey, Staging, StoreDocument, StoreError, StoreTransaction};
use crate::model::resolution::MergeAuditEntry;
use crate::model::types::{BranchRef, FunctionMetadata};

#[derive(Default)]
struct Inner {
    doc: StoreDocument,
    locked: BTreeSet<RowKey>,
    unavailable: bool,
    unavailable_rows: BTreeSet<RowKey>,
    contend_next: u32,
    fail_next_commit: bool,
    begins: u32,
}

/// A metadata store held in memory.
#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: Mutex<Inner>,
}

impl MemoryMetadataStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert a row directly, bypassing transactions.
    pub fn insert(&self, branch: &BranchRef, path: &str, symbol: &str, metadata: FunctionMetadata) {
        self.lock()
            .doc
            .insert(&RowKey::new(branch, path, symbol), metadata);
    }

    /// A copy of the full contents.
    #[must_use]
    pub fn document(&self) -> StoreDocument {
        self.lock().doc.clone()
    }

    /// Make every read fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make reads of one row fail with [`StoreError::Unavailable`].
    pub fn set_row_unavailable(&self, branch: &BranchRef, path: &str, symbol: &str) {
        self.lock()
            .unavailable_rows
            .insert(RowKey::new(branch, path, symbol));
    }

    /// Make the next `n` calls to `begin` report lock contention.
    pub fn contend_next_begins(&self, n: u32) {
        self.lock().contend_next = n;
    }

    /// Make the next transaction commit fail.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }

    /// Hold locks on `rows` as another writer would.
    pub fn hold_rows(&self, rows: &[RowKey]) {
        self.lock().locked.extend(rows.iter().cloned());
    }

    /// Release locks taken with [`hold_rows`](Self::hold_rows).
    pub fn release_rows(&self, rows: &[RowKey]) {
        let mut inner = self.lock();
        for row in rows {
            inner.locked.remove(row);
        }
    }

    /// Number of `begin` calls made so far, successful or not.
    #[must_use]
    pub fn begin_calls(&self) -> u32 {
        self.lock().begins
    }

    fn check_available(inner: &Inner) -> Result<(), StoreError> {
        if inner.unavailable {
            Err(StoreError::Unavailable("store offline".to_owned()))
        } else {
            Ok(())
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn function_metadata(
        &self,
        branch: &BranchRef,
        path: &str,
        symbol: &str,
    ) -> Result<Option<FunctionMetadata>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        if inner
            .unavailable_rows
            .contains(&RowKey::new(branch, path, symbol))
        {
            return Err(StoreError::Unavailable(format!(
                "row {branch}:{path}::{symbol} unreadable"
            )));
        }
        Ok(inner.doc.get(branch, path, symbol).cloned())
    }

    fn functions_in(
        &self,
        branch: &BranchRef,
        path: &str,
    ) -> Result<BTreeMap<String, FunctionMetadata>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        let mut rows = inner.doc.rows_in(branch, path);
        rows.retain(|symbol, _| {
            !inner
                .unavailable_rows
                .contains(&RowKey::new(branch, path, symbol))
        });
        Ok(rows)
    }

    fn audit_entries(&self) -> Result<Vec<MergeAuditEntry>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.doc.audit.clone())
    }

    fn is_merged(&self, branch: &BranchRef) -> Result<bool, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.doc.merged.contains(branch.as_str()))
    }

    fn begin(&self, rows: &[RowKey]) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let mut inner = self.lock();
        inner.begins += 1;
        if inner.contend_next > 0 {
            inner.contend_next -= 1;
            return Err(StoreError::LockContention {
                resource: "simulated contention".to_owned(),
            });
        }
        if let Some(held) = rows.iter().find(|r| inner.locked.contains(*r)) {
            return Err(StoreError::LockContention {
                resource: held.to_string(),
            });
        }
        let rows: BTreeSet<RowKey> = rows.iter().cloned().collect();
        inner.locked.extend(rows.iter().cloned());
        drop(inner);
        Ok(Box::new(MemoryTransaction {
            store: self,
            rows,
            staging: Staging::default(),
        }))
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryMetadataStore,
    rows: BTreeSet<RowKey>,
    staging: Staging,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn upsert_function_metadata(&mut self, key: RowKey, metadata: FunctionMetadata) {
        self.staging.upsert(key, metadata);
    }

    fn remove_function_metadata(&mut self, key: &RowKey) {
        self.staging.remove(key);
    }

    fn append_audit(&mut self, entry: MergeAuditEntry) {
        self.staging.audit(entry);
    }

    fn mark_merged(&mut self, branch: &BranchRef) {
        self.staging.mark_merged(branch);
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let ops = self.staging.take();
        let mut inner = self.store.lock();
        if inner.fail_next_commit {
            inner.fail_next_commit = false;
            return Err(StoreError::CommitFailed("simulated commit failure".to_owned()));
        }
        MemoryMetadataStore::check_available(&inner)
            .map_err(|e| StoreError::CommitFailed(e.to_string()))?;
        inner.doc.apply(ops);
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        let mut inner = self.store.lock();
        for row in &self.rows {
            inner.locked.remove(row);
        }
    }
}
