//! Conflict classification.
//!
//! Every path in `modified_both` goes through [`analyze_file`], a pure
//! three-way comparison that decides, per symbol, whether the merge is clean
//! (and which version wins) or needs a decision. [`classify`] then consults
//! the metadata store for the symbols that survive, turning metadata
//! disagreement into `metadata_row_conflict`s. A row the store cannot read
//! never makes a symbol clean: it becomes a degraded conflict for a person
//! to decide. Converged paths (same bytes on both sides) only have their
//! rows compared.
//!
//! The reconstruction stage calls [`analyze_file`] again on the same inputs,
//! so the classifier and the writer can never disagree about which symbol
//! came from where.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use reconcile_git::{FileEntry, GitError, GitRepo};
use tracing::instrument;

use super::differ::TreeDiff;
use super::symbols::{self, ExtractError, Language, ParsedFile};
use crate::config::MergeConfig;
use crate::error::MergeWarning;
use crate::model::conflict::{Conflict, ConflictKind, ConflictSide, MetadataLookup, OpaqueReason};
use crate::model::types::{BranchRef, Side, SymbolVersion};
use crate::store::MetadataStore;

/// Bytes inspected for NUL when sniffing binary content.
const BINARY_SNIFF_LEN: usize = 8000;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Which files get symbol-level analysis.
#[derive(Clone, Debug)]
pub struct FileFilter {
    languages: Vec<Language>,
    binary_patterns: Vec<glob::Pattern>,
}

impl FileFilter {
    /// A filter enabling `languages`, treating `binary_patterns` as binary.
    /// Invalid patterns are ignored; configuration loading rejects them
    /// earlier.
    #[must_use]
    pub fn new(languages: &[Language], binary_patterns: &[String]) -> Self {
        Self {
            languages: languages.to_vec(),
            binary_patterns: binary_patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .collect(),
        }
    }

    /// The filter described by `[merge]` settings.
    #[must_use]
    pub fn from_config(config: &MergeConfig) -> Self {
        Self::new(&config.languages, &config.binary_patterns)
    }

    fn is_binary(&self, path: &str, contents: &[Option<&[u8]>]) -> bool {
        self.binary_patterns.iter().any(|p| p.matches(path))
            || contents.iter().flatten().any(|bytes| {
                bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0)
            })
    }
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::new(&Language::ALL, &[])
    }
}

/// The three versions of one path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileVersions {
    /// Repository-relative path.
    pub path: String,
    /// Merge-base content, `None` if absent there.
    pub base: Option<Vec<u8>>,
    /// Source content, `None` if absent or deleted.
    pub source: Option<Vec<u8>>,
    /// Target content, `None` if absent or deleted.
    pub target: Option<Vec<u8>>,
}

impl FileVersions {
    /// Read the three versions of `path` from the trees in `diff`.
    ///
    /// # Errors
    /// Fails if a blob cannot be read.
    pub fn load<R: GitRepo + ?Sized>(
        repo: &R,
        diff: &TreeDiff,
        path: &str,
    ) -> Result<Self, GitError> {
        let read = |files: &BTreeMap<String, FileEntry>| -> Result<Option<Vec<u8>>, GitError> {
            files.get(path).map(|e| repo.read_blob(e.oid)).transpose()
        };
        Ok(Self {
            path: path.to_owned(),
            base: read(&diff.base_files)?,
            source: read(&diff.source_files)?,
            target: read(&diff.target_files)?,
        })
    }

    /// The given side's content.
    #[must_use]
    pub fn side(&self, side: Side) -> Option<&[u8]> {
        match side {
            Side::Source => self.source.as_deref(),
            Side::Target => self.target.as_deref(),
        }
    }
}

/// Branch names and tip times, for metadata lookups and recency.
#[derive(Clone, Debug)]
pub struct BranchPair {
    /// Branch being merged in.
    pub source: BranchRef,
    /// Branch receiving the merge.
    pub target: BranchRef,
    /// Source tip committer time.
    pub source_committed_at: i64,
    /// Target tip committer time.
    pub target_committed_at: i64,
}

impl BranchPair {
    /// The branch for `side`.
    #[must_use]
    pub const fn branch(&self, side: Side) -> &BranchRef {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// The side whose tip commit is newer (ties go to the source).
    #[must_use]
    pub const fn newer_side(&self) -> Side {
        if self.target_committed_at > self.source_committed_at {
            Side::Target
        } else {
            Side::Source
        }
    }

    const fn committed_at(&self, side: Side) -> i64 {
        match side {
            Side::Source => self.source_committed_at,
            Side::Target => self.target_committed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-file analysis
// ---------------------------------------------------------------------------

/// Per-symbol verdict of the three-way comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolOutcome {
    /// Identical on both sides.
    Same,
    /// Only one side changed it; that side's version wins.
    Take(Side),
    /// Added on one side only.
    AddedOn(Side),
    /// Deleted on one side, untouched on the other; it goes away.
    Drop,
    /// Needs a decision.
    Conflict(ConflictKind),
}

/// One symbol and its verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolChange {
    /// Qualified symbol key.
    pub name: String,
    /// The verdict.
    pub outcome: SymbolOutcome,
}

/// A file that can be merged symbol by symbol.
#[derive(Clone, Debug)]
pub struct SymbolAnalysis {
    /// Base version, when present and parseable.
    pub base: Option<ParsedFile>,
    /// Source version.
    pub source: ParsedFile,
    /// Target version.
    pub target: ParsedFile,
    /// Side whose non-symbol text the merged file keeps.
    pub layout_side: Side,
    /// Every symbol on either side, sorted by name.
    pub changes: Vec<SymbolChange>,
}

impl SymbolAnalysis {
    /// The parsed file for `side`.
    #[must_use]
    pub const fn file(&self, side: Side) -> &ParsedFile {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// A symbol's version on `side`.
    #[must_use]
    pub fn symbol(&self, side: Side, name: &str) -> Option<&SymbolVersion> {
        self.file(side).get(name)
    }
}

/// Result of [`analyze_file`].
#[derive(Clone, Debug)]
pub enum FileAnalysis {
    /// The file must be decided as a whole.
    Opaque {
        /// Why symbol-level analysis was impossible.
        reason: OpaqueReason,
        /// Degradations met (parse failures).
        warnings: Vec<MergeWarning>,
    },
    /// The file can be merged per symbol.
    Symbols(Box<SymbolAnalysis>),
}

/// Compare the three versions of a file changed on both sides.
#[must_use]
pub fn analyze_file(versions: &FileVersions, filter: &FileFilter) -> FileAnalysis {
    let path = versions.path.as_str();
    let (source, target) = match (&versions.source, &versions.target) {
        (Some(s), Some(t)) => (s.as_slice(), t.as_slice()),
        (None, _) => return opaque(OpaqueReason::DeletedOnOneSide { deleted: Side::Source }),
        (_, None) => return opaque(OpaqueReason::DeletedOnOneSide { deleted: Side::Target }),
    };

    if filter.is_binary(path, &[versions.base.as_deref(), Some(source), Some(target)]) {
        return opaque(OpaqueReason::Binary);
    }

    let parse = |side: Side, bytes: &[u8]| {
        symbols::extract(path, bytes, &filter.languages).map_err(|e| match e {
            ExtractError::UnsupportedLanguage { extension } => FileAnalysis::Opaque {
                reason: OpaqueReason::UnsupportedLanguage { extension },
                warnings: Vec::new(),
            },
            other => {
                let message = other.to_string();
                FileAnalysis::Opaque {
                    reason: OpaqueReason::ParseFailure {
                        side,
                        message: message.clone(),
                    },
                    warnings: vec![MergeWarning::ParseFailure {
                        path: path.to_owned(),
                        side,
                        message,
                    }],
                }
            }
        })
    };
    let source = match parse(Side::Source, source) {
        Ok(f) => f,
        Err(opaque) => return opaque,
    };
    let target = match parse(Side::Target, target) {
        Ok(f) => f,
        Err(opaque) => return opaque,
    };
    // An unparseable base only costs three-way precision.
    let base = versions.base.as_deref().and_then(|bytes| {
        symbols::extract(path, bytes, &filter.languages)
            .inspect_err(|e| tracing::debug!(path, error = %e, "merge base does not parse"))
            .ok()
    });

    let Some(layout_side) = layout_side(base.as_ref(), &source, &target) else {
        return opaque(OpaqueReason::LayoutDiverged);
    };

    let names: BTreeSet<&str> = source
        .symbols
        .iter()
        .chain(&target.symbols)
        .map(|s| s.name.as_str())
        .collect();
    let changes = names
        .into_iter()
        .map(|name| SymbolChange {
            name: name.to_owned(),
            outcome: symbol_outcome(
                base.as_ref().and_then(|b| b.get(name)),
                source.get(name),
                target.get(name),
            ),
        })
        .collect();

    FileAnalysis::Symbols(Box::new(SymbolAnalysis {
        base,
        source,
        target,
        layout_side,
        changes,
    }))
}

const fn opaque(reason: OpaqueReason) -> FileAnalysis {
    FileAnalysis::Opaque {
        reason,
        warnings: Vec::new(),
    }
}

fn layout_side(
    base: Option<&ParsedFile>,
    source: &ParsedFile,
    target: &ParsedFile,
) -> Option<Side> {
    let (ls, lt) = (source.layout(), target.layout());
    if ls == lt {
        return Some(Side::Target);
    }
    let lb = base.map(ParsedFile::layout)?;
    if lb == lt {
        Some(Side::Source)
    } else if lb == ls {
        Some(Side::Target)
    } else {
        None
    }
}

fn symbol_outcome(
    base: Option<&SymbolVersion>,
    source: Option<&SymbolVersion>,
    target: Option<&SymbolVersion>,
) -> SymbolOutcome {
    match (source, target) {
        (Some(s), Some(t)) => {
            if s.body_hash == t.body_hash {
                SymbolOutcome::Same
            } else if base.is_some_and(|b| b.body_hash == s.body_hash) {
                SymbolOutcome::Take(Side::Target)
            } else if base.is_some_and(|b| b.body_hash == t.body_hash) {
                SymbolOutcome::Take(Side::Source)
            } else if s.signature_hash == t.signature_hash {
                SymbolOutcome::Conflict(ConflictKind::SymbolAddedBoth)
            } else {
                SymbolOutcome::Conflict(ConflictKind::SymbolSignatureChanged)
            }
        }
        (Some(present), None) | (None, Some(present)) => {
            let side = if source.is_some() {
                Side::Source
            } else {
                Side::Target
            };
            match base {
                None => SymbolOutcome::AddedOn(side),
                Some(b) if b.body_hash == present.body_hash => SymbolOutcome::Drop,
                Some(_) => SymbolOutcome::Conflict(ConflictKind::SymbolSignatureChanged),
            }
        }
        (None, None) => SymbolOutcome::Drop,
    }
}

// ---------------------------------------------------------------------------
// Classification with metadata
// ---------------------------------------------------------------------------

/// Conflicts and warnings for one merge.
#[derive(Clone, Debug, Default)]
pub struct Classification {
    /// Conflicts sorted by (path, symbol).
    pub conflicts: Vec<Conflict>,
    /// Non-fatal degradations.
    pub warnings: Vec<MergeWarning>,
}

/// Look up one metadata row, folding store failures into
/// [`MetadataLookup::Unavailable`].
pub fn lookup<S: MetadataStore + ?Sized>(
    store: &S,
    branch: &BranchRef,
    path: &str,
    symbol: &str,
) -> MetadataLookup {
    match store.function_metadata(branch, path, symbol) {
        Ok(Some(metadata)) => MetadataLookup::Available { metadata },
        Ok(None) => MetadataLookup::Missing,
        Err(e) => MetadataLookup::Unavailable {
            reason: e.to_string(),
        },
    }
}

/// Classify every file in `files` (all changed on both sides).
#[instrument(
    skip_all,
    fields(source = %branches.source, target = %branches.target, files = files.len())
)]
pub fn classify<S: MetadataStore + ?Sized>(
    files: &[FileVersions],
    branches: &BranchPair,
    store: &S,
    filter: &FileFilter,
) -> Classification {
    let per_file: Vec<Classification> = files
        .par_iter()
        .map(|versions| classify_file(versions, branches, store, filter))
        .collect();

    let mut out = Classification::default();
    for file in per_file {
        out.conflicts.extend(file.conflicts);
        out.warnings.extend(file.warnings);
    }
    out.conflicts
        .sort_by(|a, b| (&a.path, &a.symbol).cmp(&(&b.path, &b.symbol)));
    tracing::debug!(
        conflicts = out.conflicts.len(),
        warnings = out.warnings.len(),
        "classified"
    );
    out
}

fn classify_file<S: MetadataStore + ?Sized>(
    versions: &FileVersions,
    branches: &BranchPair,
    store: &S,
    filter: &FileFilter,
) -> Classification {
    let path = versions.path.as_str();
    let mut out = Classification::default();

    if versions.source.is_some() && versions.source == versions.target {
        classify_converged(versions, branches, store, filter, &mut out);
        return out;
    }

    let analysis = match analyze_file(versions, filter) {
        FileAnalysis::Opaque { reason, warnings } => {
            let kind = if versions.base.is_some() || reason == OpaqueReason::Binary {
                ConflictKind::FileModifiedBoth
            } else {
                ConflictKind::FileAddedBoth
            };
            let side = |side: Side| ConflictSide {
                present: versions.side(side).is_some(),
                symbol: None,
                metadata: MetadataLookup::Missing,
                committed_at: branches.committed_at(side),
            };
            let mut conflict =
                Conflict::new(kind, path, None, side(Side::Source), side(Side::Target));
            conflict.degradations = warnings.iter().map(describe_warning).collect();
            conflict.opaque = Some(reason);
            out.conflicts.push(conflict);
            out.warnings.extend(warnings);
            return out;
        }
        FileAnalysis::Symbols(analysis) => analysis,
    };

    for change in &analysis.changes {
        let name = change.name.as_str();
        let side_of = |side: Side, metadata: MetadataLookup| ConflictSide {
            present: analysis.symbol(side, name).is_some(),
            symbol: analysis.symbol(side, name).cloned(),
            metadata,
            committed_at: branches.committed_at(side),
        };

        match &change.outcome {
            SymbolOutcome::Take(_) | SymbolOutcome::Drop => {}
            SymbolOutcome::Conflict(kind) => {
                let s = lookup(store, &branches.source, path, name);
                let t = lookup(store, &branches.target, path, name);
                let mut conflict = Conflict::new(
                    *kind,
                    path,
                    Some(name),
                    side_of(Side::Source, s),
                    side_of(Side::Target, t),
                );
                note_unavailable(&mut conflict, branches, &mut out.warnings);
                out.conflicts.push(conflict);
            }
            SymbolOutcome::Same => {
                let symbols = [
                    analysis.symbol(Side::Source, name),
                    analysis.symbol(Side::Target, name),
                ];
                let warnings = &mut out.warnings;
                if let Some(conflict) =
                    same_body_conflict(store, branches, path, name, symbols, warnings)
                {
                    out.conflicts.push(conflict);
                }
            }
            SymbolOutcome::AddedOn(side) => {
                let other = lookup(store, branches.branch(side.other()), path, name);
                // Only a confirmed miss on the other side makes the addition clean.
                if other == MetadataLookup::Missing {
                    continue;
                }
                let own = lookup(store, branches.branch(*side), path, name);
                let (s, t) = match side {
                    Side::Source => (own, other),
                    Side::Target => (other, own),
                };
                let mut conflict = Conflict::new(
                    ConflictKind::MetadataRowConflict,
                    path,
                    Some(name),
                    side_of(Side::Source, s),
                    side_of(Side::Target, t),
                );
                note_unavailable(&mut conflict, branches, &mut out.warnings);
                out.conflicts.push(conflict);
            }
        }
    }
    out
}

/// Both sides hold the same bytes; compare the rows of every symbol.
fn classify_converged<S: MetadataStore + ?Sized>(
    versions: &FileVersions,
    branches: &BranchPair,
    store: &S,
    filter: &FileFilter,
    out: &mut Classification,
) {
    let path = versions.path.as_str();
    let Some(bytes) = versions.source.as_deref() else {
        return;
    };
    if filter.is_binary(path, &[Some(bytes)]) {
        return;
    }
    let parsed = match symbols::extract(path, bytes, &filter.languages) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(path, error = %e, "converged file has no symbols to compare");
            return;
        }
    };
    for symbol in &parsed.symbols {
        let symbols = [Some(symbol), Some(symbol)];
        let warnings = &mut out.warnings;
        if let Some(conflict) =
            same_body_conflict(store, branches, path, &symbol.name, symbols, warnings)
        {
            out.conflicts.push(conflict);
        }
    }
}

/// The metadata conflict for a symbol whose body both sides share, if its
/// rows differ or either row cannot be read.
fn same_body_conflict<S: MetadataStore + ?Sized>(
    store: &S,
    branches: &BranchPair,
    path: &str,
    name: &str,
    symbols: [Option<&SymbolVersion>; 2],
    warnings: &mut Vec<MergeWarning>,
) -> Option<Conflict> {
    let s = lookup(store, &branches.source, path, name);
    let t = lookup(store, &branches.target, path, name);
    let differ = matches!((s.metadata(), t.metadata()), (Some(a), Some(b)) if a != b);
    if !differ && !s.is_unavailable() && !t.is_unavailable() {
        return None;
    }
    let [source_symbol, target_symbol] = symbols;
    let side = |side: Side, symbol: Option<&SymbolVersion>, metadata: MetadataLookup| ConflictSide {
        present: symbol.is_some(),
        symbol: symbol.cloned(),
        metadata,
        committed_at: branches.committed_at(side),
    };
    let mut conflict = Conflict::new(
        ConflictKind::MetadataRowConflict,
        path,
        Some(name),
        side(Side::Source, source_symbol, s),
        side(Side::Target, target_symbol, t),
    );
    note_unavailable(&mut conflict, branches, warnings);
    Some(conflict)
}

fn note_unavailable(
    conflict: &mut Conflict,
    branches: &BranchPair,
    warnings: &mut Vec<MergeWarning>,
) {
    let symbol = conflict.symbol.clone().unwrap_or_default();
    for side in [Side::Source, Side::Target] {
        if let MetadataLookup::Unavailable { reason } = &conflict.side(side).metadata {
            let branch = branches.branch(side);
            let warning = unavailable_warning(branch, &conflict.path, &symbol, reason);
            conflict.degradations.push(describe_warning(&warning));
            warnings.push(warning);
        }
    }
}

fn unavailable_warning(branch: &BranchRef, path: &str, symbol: &str, reason: &str) -> MergeWarning {
    MergeWarning::MetadataUnavailable {
        branch: branch.to_string(),
        path: path.to_owned(),
        symbol: Some(symbol.to_owned()),
        reason: reason.to_owned(),
    }
}

fn describe_warning(warning: &MergeWarning) -> String {
    match warning {
        MergeWarning::MetadataUnavailable { branch, reason, .. } => {
            format!("metadata unavailable on {branch}: {reason}")
        }
        MergeWarning::ParseFailure { side, message, .. } => {
            format!("{side} version does not parse: {message}")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::model::types::{FunctionMetadata, Purity};
    use crate::store::MemoryMetadataStore;

    fn branches() -> BranchPair {
        BranchPair {
            source: BranchRef::new("feature").unwrap(),
            target: BranchRef::new("main").unwrap(),
            source_committed_at: 200,
            target_committed_at: 100,
        }
    }

    fn versions(
        path: &str,
        base: Option<&str>,
        source: Option<&str>,
        target: Option<&str>,
    ) -> FileVersions {
        FileVersions {
            path: path.into(),
            base: base.map(|s| s.as_bytes().to_vec()),
            source: source.map(|s| s.as_bytes().to_vec()),
            target: target.map(|s| s.as_bytes().to_vec()),
        }
    }

    fn run(files: &[FileVersions], store: &MemoryMetadataStore) -> Classification {
        classify(files, &branches(), store, &FileFilter::default())
    }

    const BASE: &str = "def calc(a, b):\n    return a + b\n\n\ndef other():\n    return 0\n";

    #[test]
    fn divergent_bodies_same_parameters() {
        let file = versions(
            "calc.py",
            None,
            Some("def calc(a, b):\n    return a + b\n"),
            Some("def calc(a, b):\n    print(a)\n    return a + b\n"),
        );
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!(c.kind, ConflictKind::SymbolAddedBoth);
        assert_eq!(c.symbol.as_deref(), Some("calc"));
        assert!(c.source.symbol.is_some() && c.target.symbol.is_some());
    }

    #[test]
    fn divergent_parameters() {
        let file = versions(
            "calc.py",
            None,
            Some("def calc(a, b):\n    return a + b\n"),
            Some("def calc(a, b, c):\n    return a + b + c\n"),
        );
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts[0].kind, ConflictKind::SymbolSignatureChanged);
    }

    #[test]
    fn one_sided_edits_against_base_are_clean() {
        let source = BASE.replace("return 0", "return 1");
        let target = BASE.replace("a + b", "b + a");
        let file = versions("calc.py", Some(BASE), Some(&source), Some(&target));
        let FileAnalysis::Symbols(analysis) = analyze_file(&file, &FileFilter::default()) else {
            panic!("expected symbol analysis");
        };
        let outcomes: Vec<_> = analysis
            .changes
            .iter()
            .map(|c| (c.name.as_str(), c.outcome.clone()))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("calc", SymbolOutcome::Take(Side::Target)),
                ("other", SymbolOutcome::Take(Side::Source)),
            ]
        );
        assert!(run(&[file], &MemoryMetadataStore::new()).conflicts.is_empty());
    }

    #[test]
    fn deletion_against_untouched_symbol_is_clean() {
        let source = "def calc(a, b):\n    return a + b\n";
        let target = BASE.replace("a + b", "a - b");
        let file = versions("calc.py", Some(BASE), Some(source), Some(&target));
        let FileAnalysis::Symbols(analysis) = analyze_file(&file, &FileFilter::default()) else {
            panic!("expected symbol analysis");
        };
        assert!(
            analysis
                .changes
                .iter()
                .any(|c| c.name == "other" && c.outcome == SymbolOutcome::Drop)
        );
    }

    #[test]
    fn deletion_against_modified_symbol_conflicts() {
        let source = "def calc(a, b):\n    return a + b\n";
        let target = BASE.replace("return 0", "return 42");
        let file = versions("calc.py", Some(BASE), Some(source), Some(&target));
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts.len(), 1);
        assert!(out.conflicts[0].is_one_sided());
        assert_eq!(out.conflicts[0].kind, ConflictKind::SymbolSignatureChanged);
    }

    #[test]
    fn one_sided_addition_without_metadata_is_clean() {
        let file = versions(
            "calc.py",
            Some(BASE),
            Some(&format!("{BASE}\n\ndef added():\n    return 2\n")),
            Some(&BASE.replace("return 0", "return 3")),
        );
        assert!(run(&[file], &MemoryMetadataStore::new()).conflicts.is_empty());
    }

    #[test]
    fn one_sided_addition_with_row_on_other_side_conflicts() {
        let store = MemoryMetadataStore::new();
        let row = FunctionMetadata::new(Purity::Pure, 1, 1);
        store.insert(&branches().target, "calc.py", "added", row);
        let file = versions(
            "calc.py",
            Some(BASE),
            Some(&format!("{BASE}\n\ndef added():\n    return 2\n")),
            Some(&BASE.replace("return 0", "return 3")),
        );
        let out = run(&[file], &store);
        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!(c.kind, ConflictKind::MetadataRowConflict);
        assert!(c.is_one_sided());
        assert!(c.target.metadata.metadata().is_some());
    }

    #[test]
    fn identical_bodies_with_different_rows_conflict() {
        let store = MemoryMetadataStore::new();
        let b = branches();
        store.insert(&b.source, "calc.py", "calc", FunctionMetadata::new(Purity::Pure, 1, 1));
        store.insert(&b.target, "calc.py", "calc", FunctionMetadata::new(Purity::Impure, 1, 1));
        let file = versions(
            "calc.py",
            Some(BASE),
            Some(&BASE.replace("return 0", "return 1")),
            Some(&BASE.replace("return 0", "return 2")),
        );
        let out = run(&[file], &store);
        let meta: Vec<_> = out
            .conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::MetadataRowConflict)
            .collect();
        assert_eq!(meta.len(), 1);
        assert!(meta[0].is_metadata_only());
    }

    #[test]
    fn one_sided_addition_with_unreadable_row_on_other_side_conflicts() {
        let store = MemoryMetadataStore::new();
        store.set_row_unavailable(&branches().target, "calc.py", "added");
        let file = versions(
            "calc.py",
            Some(BASE),
            Some(&format!("{BASE}\n\ndef added():\n    return 2\n")),
            Some(&BASE.replace("return 0", "return 3")),
        );
        let out = run(&[file], &store);
        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!(c.kind, ConflictKind::MetadataRowConflict);
        assert_eq!(c.symbol.as_deref(), Some("added"));
        assert!(c.is_one_sided());
        assert!(c.target.metadata.is_unavailable());
        assert_eq!(c.degradations.len(), 1);
        assert!(matches!(out.warnings[0], MergeWarning::MetadataUnavailable { .. }));
    }

    #[test]
    fn identical_bodies_with_unreadable_row_conflict() {
        let store = MemoryMetadataStore::new();
        let b = branches();
        store.insert(&b.target, "calc.py", "calc", FunctionMetadata::new(Purity::Pure, 1, 1));
        store.set_row_unavailable(&b.source, "calc.py", "calc");
        let file = versions(
            "calc.py",
            Some(BASE),
            Some(&BASE.replace("return 0", "return 1")),
            Some(&BASE.replace("return 0", "return 2")),
        );
        let out = run(&[file], &store);
        let meta: Vec<_> = out
            .conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::MetadataRowConflict)
            .collect();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].symbol.as_deref(), Some("calc"));
        assert!(meta[0].is_metadata_only());
        assert!(meta[0].source.metadata.is_unavailable());
        assert_eq!(meta[0].degradations.len(), 1);
    }

    #[test]
    fn converged_file_with_different_rows_conflicts() {
        let store = MemoryMetadataStore::new();
        let b = branches();
        store.insert(&b.source, "calc.py", "calc", FunctionMetadata::new(Purity::Pure, 10, 10));
        store.insert(&b.target, "calc.py", "calc", FunctionMetadata::new(Purity::Impure, 3, 3));
        store.insert(&b.source, "calc.py", "other", FunctionMetadata::new(Purity::Pure, 1, 1));
        store.insert(&b.target, "calc.py", "other", FunctionMetadata::new(Purity::Pure, 1, 1));
        let merged = BASE.replace("a + b", "b + a");
        let out = run(&[versions("calc.py", Some(BASE), Some(&merged), Some(&merged))], &store);
        assert_eq!(out.conflicts.len(), 1);
        let c = &out.conflicts[0];
        assert_eq!(c.kind, ConflictKind::MetadataRowConflict);
        assert_eq!(c.symbol.as_deref(), Some("calc"));
        assert!(c.is_metadata_only());
    }

    #[test]
    fn converged_file_with_agreeing_rows_is_clean() {
        let store = MemoryMetadataStore::new();
        let b = branches();
        store.insert(&b.source, "calc.py", "calc", FunctionMetadata::new(Purity::Pure, 2, 2));
        store.insert(&b.target, "calc.py", "calc", FunctionMetadata::new(Purity::Pure, 2, 2));
        let merged = BASE.replace("a + b", "b + a");
        let out = run(&[versions("calc.py", Some(BASE), Some(&merged), Some(&merged))], &store);
        assert!(out.conflicts.is_empty());
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn converged_binary_file_is_clean() {
        let file = FileVersions {
            path: "logo.png".into(),
            base: Some(vec![0, 1]),
            source: Some(vec![0, 2]),
            target: Some(vec![0, 2]),
        };
        assert!(run(&[file], &MemoryMetadataStore::new()).conflicts.is_empty());
    }

    #[test]
    fn unavailable_metadata_is_recorded_as_degradation() {
        let store = MemoryMetadataStore::new();
        store.set_row_unavailable(&branches().target, "calc.py", "calc");
        let file = versions(
            "calc.py",
            None,
            Some("def calc(a, b):\n    return a + b\n"),
            Some("def calc(a, b):\n    return b + a\n"),
        );
        let out = run(&[file], &store);
        assert!(out.conflicts[0].target.metadata.is_unavailable());
        assert_eq!(out.conflicts[0].degradations.len(), 1);
        assert!(matches!(out.warnings[0], MergeWarning::MetadataUnavailable { .. }));
    }

    #[test]
    fn binary_files_are_opaque() {
        let file = FileVersions {
            path: "logo.png".into(),
            base: Some(vec![0, 1]),
            source: Some(vec![0, 2]),
            target: Some(vec![0, 3]),
        };
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts[0].kind, ConflictKind::FileModifiedBoth);
        assert_eq!(out.conflicts[0].opaque, Some(OpaqueReason::Binary));
    }

    #[test]
    fn binary_added_on_both_sides_is_modified_both() {
        let file = FileVersions {
            path: "logo.png".into(),
            base: None,
            source: Some(vec![0x89, b'P', 0, 1]),
            target: Some(vec![0x89, b'P', 0, 2]),
        };
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts[0].kind, ConflictKind::FileModifiedBoth);
        assert_eq!(out.conflicts[0].opaque, Some(OpaqueReason::Binary));
    }

    #[test]
    fn binary_patterns_force_opaque() {
        let filter = FileFilter::new(&Language::ALL, &["gen/**".to_owned()]);
        let file = versions(
            "gen/a.py",
            None,
            Some("def f():\n    return 1\n"),
            Some("def f():\n    return 2\n"),
        );
        assert!(matches!(
            analyze_file(&file, &filter),
            FileAnalysis::Opaque {
                reason: OpaqueReason::Binary,
                ..
            }
        ));
    }

    #[test]
    fn parse_failure_downgrades_to_whole_file() {
        let file = versions("calc.py", Some(BASE), Some("def calc(:\n"), Some(BASE));
        let out = run(&[file], &MemoryMetadataStore::new());
        let c = &out.conflicts[0];
        assert_eq!(c.kind, ConflictKind::FileModifiedBoth);
        assert!(matches!(c.opaque, Some(OpaqueReason::ParseFailure { side: Side::Source, .. })));
        assert!(matches!(out.warnings[0], MergeWarning::ParseFailure { .. }));
    }

    #[test]
    fn new_file_on_both_sides_that_cannot_be_split_is_added_both() {
        let file = versions("notes.txt", None, Some("a"), Some("b"));
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts[0].kind, ConflictKind::FileAddedBoth);
    }

    #[test]
    fn delete_versus_modify_is_opaque() {
        let file = versions("calc.py", Some(BASE), None, Some(&BASE.replace("a + b", "a * b")));
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(
            out.conflicts[0].opaque,
            Some(OpaqueReason::DeletedOnOneSide {
                deleted: Side::Source
            })
        );
        assert!(out.conflicts[0].is_one_sided());
    }

    #[test]
    fn layout_divergence_is_opaque() {
        let source = format!("import os\n{BASE}");
        let target = format!("import sys\n{BASE}");
        let file = versions("calc.py", Some(BASE), Some(&source), Some(&target));
        let out = run(&[file], &MemoryMetadataStore::new());
        assert_eq!(out.conflicts[0].opaque, Some(OpaqueReason::LayoutDiverged));
    }

    #[test]
    fn layout_side_follows_the_side_that_changed_it() {
        let source = format!("import os\n{}", BASE.replace("return 0", "return 9"));
        let target = BASE.replace("a + b", "b + a");
        let file = versions("calc.py", Some(BASE), Some(&source), Some(&target));
        let FileAnalysis::Symbols(analysis) = analyze_file(&file, &FileFilter::default()) else {
            panic!("expected symbol analysis");
        };
        assert_eq!(analysis.layout_side, Side::Source);
    }

    #[test]
    fn output_order_is_independent_of_input_order() {
        let a = versions(
            "a.py",
            None,
            Some("def f():\n    return 1\n"),
            Some("def f():\n    return 2\n"),
        );
        let b = versions(
            "b.py",
            None,
            Some("def g():\n    return 1\n"),
            Some("def g():\n    return 2\n"),
        );
        let store = MemoryMetadataStore::new();
        let one = run(&[a.clone(), b.clone()], &store);
        let two = run(&[b, a], &store);
        assert_eq!(one.conflicts, two.conflicts);
    }
}
