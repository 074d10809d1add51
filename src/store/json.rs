//! Metadata store backed by a single JSON document.
//!
//! Reads parse the document on every call so that writes from other
//! processes are visible. Writers take an exclusive advisory lock on
//! `<path>.lock` for the lifetime of a transaction; the commit re-reads the
//! document under that lock, applies the staged operations and replaces the
//! file atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::instrument;

use super::{MetadataStore, RowKey, Staging, StoreDocument, StoreError, StoreTransaction};
use crate::lock::FileLock;
use crate::merge_state::write_atomic;
use crate::model::resolution::MergeAuditEntry;
use crate::model::types::{BranchRef, FunctionMetadata};

/// A metadata store kept in one JSON file.
#[derive(Clone, Debug)]
pub struct JsonMetadataStore {
    path: PathBuf,
}

impl JsonMetadataStore {
    /// A store at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Read and parse the document; a missing file is an empty store.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the file cannot be read or
    /// parsed.
    pub fn load(&self) -> Result<StoreDocument, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDocument::default());
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&contents).map_err(|e| {
            StoreError::Unavailable(format!("parse {}: {e}", self.path.display()))
        })
    }

    fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(doc).map_err(|e| StoreError::Serialize(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes())
            .map_err(|e| StoreError::Io(format!("write {}: {e}", self.path.display())))
    }
}

impl MetadataStore for JsonMetadataStore {
    fn function_metadata(
        &self,
        branch: &BranchRef,
        path: &str,
        symbol: &str,
    ) -> Result<Option<FunctionMetadata>, StoreError> {
        Ok(self.load()?.get(branch, path, symbol).cloned())
    }

    fn functions_in(
        &self,
        branch: &BranchRef,
        path: &str,
    ) -> Result<BTreeMap<String, FunctionMetadata>, StoreError> {
        Ok(self.load()?.rows_in(branch, path))
    }

    fn audit_entries(&self) -> Result<Vec<MergeAuditEntry>, StoreError> {
        Ok(self.load()?.audit)
    }

    fn is_merged(&self, branch: &BranchRef) -> Result<bool, StoreError> {
        Ok(self.load()?.merged.contains(branch.as_str()))
    }

    #[instrument(skip_all, fields(store = %self.path.display(), rows = rows.len()))]
    fn begin(&self, rows: &[RowKey]) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let lock_path = self.lock_path();
        let lock = FileLock::try_acquire(&lock_path)
            .map_err(|e| StoreError::Io(format!("lock {}: {e}", lock_path.display())))?
            .ok_or_else(|| StoreError::LockContention {
                resource: lock_path.display().to_string(),
            })?;
        Ok(Box::new(JsonTransaction {
            store: self,
            _lock: lock,
            staging: Staging::default(),
        }))
    }
}

struct JsonTransaction<'a> {
    store: &'a JsonMetadataStore,
    _lock: FileLock,
    staging: Staging,
}

impl StoreTransaction for JsonTransaction<'_> {
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
        if ops.is_empty() {
            return Ok(());
        }
        let mut doc = self
            .store
            .load()
            .map_err(|e| StoreError::CommitFailed(e.to_string()))?;
        doc.apply(ops);
        self.store.save(&doc)
    }

    fn rollback(self: Box<Self>) {}
}
