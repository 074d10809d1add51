//! Building the merged tree and the metadata changes that go with it.
//!
//! Files changed on one side only are taken verbatim. Files changed on both
//! sides are re-analysed with [`analyze_file`] and rebuilt from the layout
//! side's text: each definition is replaced by the version its verdict or
//! decision selects, definitions that only the other side has are inserted
//! next to their nearest neighbour, and omitted definitions are cut out
//! together with the blank lines that followed them.
//!
//! Whatever text lands on the target branch, the target branch's metadata
//! rows follow it: a definition taken from the source gets the source row,
//! an omitted definition loses its row, a renamed definition gets the row of
//! the side it came from. Keeping the target's side never touches its rows.

use std::collections::BTreeMap;

use reconcile_git::{EntryMode, FileEntry, GitError, GitOid, GitRepo, TreeEdit};

use super::classify::{
    analyze_file, BranchPair, FileAnalysis, FileFilter, FileVersions, SymbolAnalysis, SymbolOutcome,
};
use super::differ::TreeDiff;
use crate::error::MergeWarning;
use crate::model::conflict::Conflict;
use crate::model::resolution::{Decision, ResolutionRecord};
use crate::model::types::{BranchRef, ConflictId, FunctionMetadata, Side, SymbolVersion};
use crate::store::{MetadataStore, RowKey, StoreTransaction};

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Recorded decisions indexed by (path, symbol).
#[derive(Debug, Default)]
pub struct Decisions<'a> {
    by_location: BTreeMap<(&'a str, Option<&'a str>), &'a Decision>,
}

impl<'a> Decisions<'a> {
    /// Index the records of `conflicts`.
    #[must_use]
    pub fn new(
        conflicts: &'a [Conflict],
        records: &'a BTreeMap<ConflictId, ResolutionRecord>,
    ) -> Self {
        let by_location = conflicts
            .iter()
            .filter_map(|c| {
                let record = records.get(&c.id)?;
                Some(((c.path.as_str(), c.symbol.as_deref()), &record.decision))
            })
            .collect();
        Self { by_location }
    }

    fn get(&self, path: &str, symbol: Option<&str>) -> Option<&'a Decision> {
        self.by_location.get(&(path, symbol)).copied()
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// A change to the target branch's metadata rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RowChange {
    /// Give target's `(path, as_symbol)` the row `side` has for
    /// `(path, symbol)`; remove it when `side` has none.
    Copy {
        /// Side to read from.
        side: Side,
        /// File.
        path: String,
        /// Symbol on `side`.
        symbol: String,
        /// Symbol key on the target.
        as_symbol: String,
    },
    /// Remove target's row for `(path, symbol)`.
    Remove {
        /// File.
        path: String,
        /// Symbol.
        symbol: String,
    },
    /// Make target's rows under `to_path` equal `side`'s rows under
    /// `from_path`.
    CopyFile {
        /// Side to read from.
        side: Side,
        /// File on `side`.
        from_path: String,
        /// File on the target.
        to_path: String,
    },
}

/// New content for one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileWrite {
    /// Repository-relative path.
    pub path: String,
    /// New bytes; `None` deletes the path.
    pub content: Option<Vec<u8>>,
    /// Mode for new content.
    pub mode: EntryMode,
}

/// How the merged tree differs from the target tree.
#[derive(Clone, Debug, Default)]
pub struct TreePlan {
    /// Entries copied from the source tree (or removed).
    pub passthrough: Vec<TreeEdit>,
    /// Synthesised file contents.
    pub writes: Vec<FileWrite>,
    /// Metadata rows to bring along.
    pub rows: Vec<RowChange>,
}

impl TreePlan {
    /// Write blobs and the merged tree, starting from `base_tree`.
    ///
    /// # Errors
    /// Fails if the object store rejects a write.
    pub fn write_tree<R: GitRepo + ?Sized>(
        &self,
        repo: &R,
        base_tree: GitOid,
    ) -> Result<GitOid, GitError> {
        let mut edits = self.passthrough.clone();
        for write in &self.writes {
            edits.push(match &write.content {
                Some(bytes) => TreeEdit::Upsert {
                    path: write.path.clone(),
                    mode: write.mode,
                    oid: repo.write_blob(bytes)?,
                },
                None => TreeEdit::Remove {
                    path: write.path.clone(),
                },
            });
        }
        repo.edit_tree(base_tree, &edits)
    }
}

/// Plan the merged tree for `diff`.
///
/// `files` holds the three versions of every `modified_both` and
/// `converged` path. Converged files keep the target's bytes; only the
/// decisions on their metadata conflicts bring source rows along.
#[must_use]
pub fn plan_tree(
    diff: &TreeDiff,
    files: &[FileVersions],
    decisions: &Decisions<'_>,
    branches: &BranchPair,
    filter: &FileFilter,
) -> TreePlan {
    let mut plan = TreePlan::default();

    for path in &diff.change_set.only_source {
        plan.passthrough.push(match diff.source_files.get(path) {
            Some(FileEntry { mode, oid }) => TreeEdit::Upsert {
                path: path.clone(),
                mode: *mode,
                oid: *oid,
            },
            None => TreeEdit::Remove { path: path.clone() },
        });
        plan.rows.push(RowChange::CopyFile {
            side: Side::Source,
            from_path: path.clone(),
            to_path: path.clone(),
        });
    }

    for versions in files {
        let path = versions.path.as_str();
        let mode = diff
            .target_files
            .get(path)
            .or_else(|| diff.source_files.get(path))
            .map_or(EntryMode::Blob, |e| e.mode);
        match analyze_file(versions, filter) {
            FileAnalysis::Opaque { .. } => {
                plan_whole_file(&mut plan, versions, decisions.get(path, None), branches, mode);
            }
            FileAnalysis::Symbols(analysis) => {
                let merged = merge_symbols(&analysis, path, decisions, branches);
                plan.rows.extend(merged.rows);
                if versions.target.as_deref() != Some(merged.text.as_bytes()) {
                    plan.writes.push(FileWrite {
                        path: path.to_owned(),
                        content: Some(merged.text.into_bytes()),
                        mode,
                    });
                }
            }
        }
    }
    plan
}

fn plan_whole_file(
    plan: &mut TreePlan,
    versions: &FileVersions,
    decision: Option<&Decision>,
    branches: &BranchPair,
    mode: EntryMode,
) {
    let path = versions.path.clone();
    let copy_rows = |side: Side, to_path: &str| RowChange::CopyFile {
        side,
        from_path: path.clone(),
        to_path: to_path.to_owned(),
    };
    match decision {
        None | Some(Decision::KeepTarget) => {}
        Some(Decision::KeepSource) => {
            plan.writes.push(FileWrite {
                path: path.clone(),
                content: versions.source.clone(),
                mode,
            });
            plan.rows.push(copy_rows(Side::Source, &path));
        }
        Some(Decision::KeepBothRenamed) => {
            let newer = branches.newer_side();
            let renamed = renamed_path(&path, &branches.branch(newer).slug());
            plan.writes.push(FileWrite {
                path: renamed.clone(),
                content: versions.side(newer).map(<[u8]>::to_vec),
                mode,
            });
            plan.rows.push(copy_rows(newer, &renamed));
            if newer == Side::Target {
                plan.writes.push(FileWrite {
                    path: path.clone(),
                    content: versions.source.clone(),
                    mode,
                });
                plan.rows.push(copy_rows(Side::Source, &path));
            }
        }
        Some(Decision::ExternallySupplied { content }) => {
            plan.writes.push(FileWrite {
                path: path.clone(),
                content: Some(content.clone().into_bytes()),
                mode,
            });
        }
    }
}

/// `dir/stem.slug.ext` (or `dir/name.slug` without an extension).
#[must_use]
pub fn renamed_path(path: &str, slug: &str) -> String {
    let (dir, name) = path.rfind('/').map_or(("", path), |i| path.split_at(i + 1));
    match name.rfind('.') {
        Some(i) if i > 0 => format!("{dir}{}.{slug}{}", &name[..i], &name[i..]),
        _ => format!("{dir}{name}.{slug}"),
    }
}

// ---------------------------------------------------------------------------
// Symbol-level merge
// ---------------------------------------------------------------------------

/// What goes where a definition was.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Emit {
    Side(Side),
    Omit,
    Text(String),
    Both { older: Side, newer: Side },
}

struct MergedFile {
    text: String,
    rows: Vec<RowChange>,
}

fn emit_for(outcome: &SymbolOutcome, decision: Option<&Decision>, branches: &BranchPair) -> Emit {
    match (outcome, decision) {
        (_, Some(Decision::KeepSource)) => Emit::Side(Side::Source),
        (_, Some(Decision::KeepTarget)) => Emit::Side(Side::Target),
        (_, Some(Decision::KeepBothRenamed)) => {
            let newer = branches.newer_side();
            Emit::Both {
                older: newer.other(),
                newer,
            }
        }
        (_, Some(Decision::ExternallySupplied { content })) => Emit::Text(content.clone()),
        (SymbolOutcome::Same | SymbolOutcome::Conflict(_), None) => Emit::Side(Side::Target),
        (SymbolOutcome::Take(side) | SymbolOutcome::AddedOn(side), None) => Emit::Side(*side),
        (SymbolOutcome::Drop, None) => Emit::Omit,
    }
}

fn merge_symbols(
    analysis: &SymbolAnalysis,
    path: &str,
    decisions: &Decisions<'_>,
    branches: &BranchPair,
) -> MergedFile {
    let layout = analysis.file(analysis.layout_side);
    let other_side = analysis.layout_side.other();
    let other = analysis.file(other_side);

    let mut emits: BTreeMap<&str, Emit> = BTreeMap::new();
    let mut rows = Vec::new();
    for change in &analysis.changes {
        let name = change.name.as_str();
        let chosen = emit_for(&change.outcome, decisions.get(path, Some(name)), branches);
        let emit = match chosen {
            Emit::Side(side) if analysis.symbol(side, name).is_none() => Emit::Omit,
            ref other => other.clone(),
        };
        // Keeping the target's side leaves its rows as they are, even where
        // the target has no such definition.
        let rows_for = if chosen == Emit::Side(Side::Target) { &chosen } else { &emit };
        rows.extend(row_changes(analysis, path, name, rows_for, branches));
        emits.insert(name, emit);
    }

    // Definitions the layout side lacks, placed beside their neighbours.
    let index_in_layout: BTreeMap<&str, usize> = layout
        .symbols
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut before: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut after: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut tail: Vec<String> = Vec::new();
    for (pos, sym) in other.symbols.iter().enumerate() {
        if index_in_layout.contains_key(sym.name.as_str()) {
            continue;
        }
        let text = match emits.get(sym.name.as_str()) {
            Some(Emit::Side(side)) if *side == other_side => other.text(sym).to_owned(),
            Some(Emit::Text(content)) => content.trim_end().to_owned(),
            _ => continue,
        };
        let indent = other.indent_of(sym);
        let owner = owner_of(&sym.name);
        let same_owner = |s: &&SymbolVersion| owner_of(&s.name) == owner;
        let prev = other.symbols[..pos]
            .iter()
            .rev()
            .filter(same_owner)
            .find_map(|s| index_in_layout.get(s.name.as_str()).copied());
        let next = || {
            other.symbols[pos + 1..]
                .iter()
                .filter(same_owner)
                .find_map(|s| index_in_layout.get(s.name.as_str()).copied())
        };
        if let Some(anchor) = prev {
            after.entry(anchor).or_default().push(format!("\n\n{indent}{text}"));
        } else if let Some(anchor) = next() {
            let anchor_indent = layout.indent_of(&layout.symbols[anchor]);
            before.entry(anchor).or_default().push(format!("{text}\n\n{anchor_indent}"));
        } else {
            tail.push(format!("{indent}{text}"));
        }
    }

    let src = layout.source.as_str();
    let mut out = String::with_capacity(src.len());
    let mut cursor = 0;
    for (i, sym) in layout.symbols.iter().enumerate() {
        out.push_str(slice(src, cursor, sym.span.start_byte));
        cursor = sym.span.end_byte;
        for text in before.get(&i).into_iter().flatten() {
            out.push_str(text);
        }
        match emits.get(sym.name.as_str()).cloned().unwrap_or(Emit::Omit) {
            Emit::Omit => {
                let kept = out.trim_end_matches([' ', '\t']).len();
                out.truncate(kept);
                cursor = skip_blank_after(src, cursor);
            }
            Emit::Side(side) => {
                let file = analysis.file(side);
                if let Some(version) = file.get(&sym.name) {
                    out.push_str(file.text(version));
                }
            }
            Emit::Text(content) => out.push_str(content.trim_end()),
            Emit::Both { older, newer } => {
                let older_file = analysis.file(older);
                let newer_file = analysis.file(newer);
                if let Some(v) = older_file.get(&sym.name) {
                    out.push_str(older_file.text(v));
                }
                if let Some(v) = newer_file.get(&sym.name) {
                    let ident = renamed_identifier(v, branches.branch(newer));
                    out.push_str("\n\n");
                    out.push_str(layout.indent_of(sym));
                    out.push_str(&rename_text(newer_file.text(v), v, &ident));
                }
            }
        }
        for text in after.get(&i).into_iter().flatten() {
            out.push_str(text);
        }
    }
    out.push_str(slice(src, cursor, src.len()));
    for text in tail {
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
        }
        out.push_str(&text);
        out.push('\n');
    }
    if src.ends_with('\n') && !out.ends_with('\n') {
        out.push('\n');
    }

    MergedFile { text: out, rows }
}

fn row_changes(
    analysis: &SymbolAnalysis,
    path: &str,
    name: &str,
    emit: &Emit,
    branches: &BranchPair,
) -> Vec<RowChange> {
    let copy = |side: Side, as_symbol: String| RowChange::Copy {
        side,
        path: path.to_owned(),
        symbol: name.to_owned(),
        as_symbol,
    };
    match emit {
        Emit::Side(Side::Target) | Emit::Text(_) => Vec::new(),
        Emit::Side(Side::Source) => vec![copy(Side::Source, name.to_owned())],
        Emit::Omit => vec![RowChange::Remove {
            path: path.to_owned(),
            symbol: name.to_owned(),
        }],
        Emit::Both { older, newer } => {
            let mut changes = Vec::new();
            if let Some(v) = analysis.symbol(*newer, name) {
                let ident = renamed_identifier(v, branches.branch(*newer));
                changes.push(copy(*newer, renamed_key(name, v.identifier(), &ident)));
            }
            if *older == Side::Source {
                changes.push(copy(Side::Source, name.to_owned()));
            }
            changes
        }
    }
}

fn owner_of(name: &str) -> &str {
    let base = name.split('#').next().unwrap_or(name);
    base.rfind([':', '.']).map_or("", |i| base[..i].trim_end_matches(':'))
}

fn renamed_identifier(version: &SymbolVersion, branch: &BranchRef) -> String {
    format!("{}_{}", version.identifier(), branch.slug())
}

fn renamed_key(name: &str, identifier: &str, new_identifier: &str) -> String {
    let base = name.split('#').next().unwrap_or(name);
    let prefix = base.strip_suffix(identifier).unwrap_or("");
    format!("{prefix}{new_identifier}")
}

fn rename_text(text: &str, version: &SymbolVersion, new_identifier: &str) -> String {
    let start = version.name_span.0.saturating_sub(version.span.start_byte);
    let end = version.name_span.1.saturating_sub(version.span.start_byte);
    format!(
        "{}{new_identifier}{}",
        slice(text, 0, start),
        slice(text, end, text.len())
    )
}

fn slice(text: &str, start: usize, end: usize) -> &str {
    text.get(start..end).unwrap_or_default()
}

/// Index just past the whitespace that follows `end`, stopping after the
/// last newline so the next line keeps its indentation.
fn skip_blank_after(src: &str, end: usize) -> usize {
    let rest = slice(src, end, src.len());
    let ws = rest.len() - rest.trim_start().len();
    match rest[..ws].rfind('\n') {
        Some(i) => end + i + 1,
        None => end + ws,
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// A staged metadata operation on the target branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataOp {
    /// Insert or replace a row.
    Upsert(RowKey, FunctionMetadata),
    /// Remove a row.
    Remove(RowKey),
}

impl MetadataOp {
    /// The row this operation touches.
    #[must_use]
    pub const fn key(&self) -> &RowKey {
        match self {
            Self::Upsert(key, _) | Self::Remove(key) => key,
        }
    }

    /// Stage the operation.
    pub fn stage(self, tx: &mut dyn StoreTransaction) {
        match self {
            Self::Upsert(key, md) => tx.upsert_function_metadata(key, md),
            Self::Remove(key) => tx.remove_function_metadata(&key),
        }
    }
}

/// Resolve `changes` against the store's current rows.
///
/// Rows the store cannot read are left untouched and reported as warnings.
pub fn plan_metadata<S: MetadataStore + ?Sized>(
    store: &S,
    changes: &[RowChange],
    branches: &BranchPair,
) -> (Vec<MetadataOp>, Vec<MergeWarning>) {
    let target = &branches.target;
    let mut ops = Vec::new();
    let mut warnings = Vec::new();
    let mut unavailable = |branch: &BranchRef, path: &str, symbol: Option<&str>, reason: String| {
        warnings.push(MergeWarning::MetadataUnavailable {
            branch: branch.to_string(),
            path: path.to_owned(),
            symbol: symbol.map(str::to_owned),
            reason,
        });
    };

    for change in changes {
        match change {
            RowChange::Copy {
                side,
                path,
                symbol,
                as_symbol,
            } => {
                if *side == Side::Target && symbol == as_symbol {
                    continue;
                }
                let branch = branches.branch(*side);
                let key = RowKey::new(target, path, as_symbol);
                match store.function_metadata(branch, path, symbol) {
                    Ok(Some(md)) => ops.push(MetadataOp::Upsert(key, md)),
                    Ok(None) => ops.push(MetadataOp::Remove(key)),
                    Err(e) => unavailable(branch, path, Some(symbol), e.to_string()),
                }
            }
            RowChange::Remove { path, symbol } => {
                ops.push(MetadataOp::Remove(RowKey::new(target, path, symbol)));
            }
            RowChange::CopyFile {
                side,
                from_path,
                to_path,
            } => {
                if *side == Side::Target && from_path == to_path {
                    continue;
                }
                let branch = branches.branch(*side);
                let rows = match store.functions_in(branch, from_path) {
                    Ok(rows) => rows,
                    Err(e) => {
                        unavailable(branch, from_path, None, e.to_string());
                        continue;
                    }
                };
                let existing = match store.functions_in(target, to_path) {
                    Ok(rows) => rows,
                    Err(e) => {
                        unavailable(target, to_path, None, e.to_string());
                        continue;
                    }
                };
                for symbol in existing.keys().filter(|s| !rows.contains_key(*s)) {
                    ops.push(MetadataOp::Remove(RowKey::new(target, to_path, symbol)));
                }
                for (symbol, md) in rows {
                    if existing.get(&symbol) != Some(&md) {
                        ops.push(MetadataOp::Upsert(RowKey::new(target, to_path, &symbol), md));
                    }
                }
            }
        }
    }
    (ops, warnings)
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use crate::merge::symbols::extract;
    use crate::merge::symbols::Language;
    use crate::model::resolution::{Confidence, DecidedBy, RecommendedSide, ResolutionStrategy};
    use crate::model::types::Purity;
    use crate::store::MemoryMetadataStore;

    fn branches(source_at: i64, target_at: i64) -> BranchPair {
        BranchPair {
            source: BranchRef::new("feature").unwrap(),
            target: BranchRef::new("main").unwrap(),
            source_committed_at: source_at,
            target_committed_at: target_at,
        }
    }

    fn versions(base: Option<&str>, source: &str, target: &str) -> FileVersions {
        FileVersions {
            path: "calc.py".into(),
            base: base.map(|s| s.as_bytes().to_vec()),
            source: Some(source.as_bytes().to_vec()),
            target: Some(target.as_bytes().to_vec()),
        }
    }

    fn merge(v: &FileVersions, decisions: &Decisions<'_>, b: &BranchPair) -> MergedFile {
        let FileAnalysis::Symbols(analysis) = analyze_file(v, &FileFilter::default()) else {
            panic!("expected symbol analysis");
        };
        merge_symbols(&analysis, &v.path, decisions, b)
    }

    fn decided(
        conflict_symbol: &str,
        decision: Decision,
    ) -> (Vec<Conflict>, BTreeMap<ConflictId, ResolutionRecord>) {
        use crate::model::conflict::{ConflictKind, ConflictSide, MetadataLookup};
        let side = ConflictSide {
            present: true,
            symbol: None,
            metadata: MetadataLookup::Missing,
            committed_at: 0,
        };
        let c = Conflict::new(
            ConflictKind::SymbolAddedBoth,
            "calc.py",
            Some(conflict_symbol),
            side.clone(),
            side,
        );
        let record = ResolutionRecord {
            conflict_id: c.id.clone(),
            kind: c.kind,
            path: c.path.clone(),
            symbol: c.symbol.clone(),
            strategy: ResolutionStrategy {
                recommended_side: RecommendedSide::Manual,
                confidence: Confidence::ZERO,
                rationale: String::new(),
            },
            decision,
            decided_by: DecidedBy::User,
            applied_at: 0,
        };
        let mut records = BTreeMap::new();
        records.insert(c.id.clone(), record);
        (vec![c], records)
    }

    const BASE: &str = "import math\n\n\ndef calc(a, b):\n    return a + b\n\n\ndef other():\n    return 0\n";

    #[test]
    fn clean_edits_from_both_sides_combine() {
        let source = BASE.replace("return 0", "return 1");
        let target = BASE.replace("a + b", "b + a");
        let merged = merge(
            &versions(Some(BASE), &source, &target),
            &Decisions::default(),
            &branches(1, 2),
        );
        assert_eq!(
            merged.text,
            "import math\n\n\ndef calc(a, b):\n    return b + a\n\n\ndef other():\n    return 1\n"
        );
        assert_eq!(
            merged.rows,
            vec![RowChange::Copy {
                side: Side::Source,
                path: "calc.py".into(),
                symbol: "other".into(),
                as_symbol: "other".into(),
            }]
        );
    }

    #[test]
    fn additions_are_placed_after_their_neighbour() {
        let source = BASE.replace("def other", "def added():\n    return 5\n\n\ndef other");
        let target = BASE.replace("return 0", "return 7");
        let merged = merge(
            &versions(Some(BASE), &source, &target),
            &Decisions::default(),
            &branches(1, 2),
        );
        assert_eq!(
            merged.text,
            "import math\n\n\ndef calc(a, b):\n    return a + b\n\ndef added():\n    return 5\n\n\ndef other():\n    return 7\n"
        );
    }

    #[test]
    fn deletions_take_their_blank_lines_along() {
        let source = "import math\n\n\ndef other():\n    return 0\n";
        let target = BASE.replace("return 0", "return 7");
        let merged = merge(
            &versions(Some(BASE), source, &target),
            &Decisions::default(),
            &branches(1, 2),
        );
        assert_eq!(merged.text, "import math\n\n\ndef other():\n    return 7\n");
        assert!(merged.rows.contains(&RowChange::Remove {
            path: "calc.py".into(),
            symbol: "calc".into()
        }));
    }

    #[test]
    fn keep_source_decision_replaces_definition() {
        let source = "def calc(a, b):\n    return a + b\n";
        let target = "def calc(a, b):\n    print(a)\n    return a + b\n";
        let (conflicts, records) = decided("calc", Decision::KeepSource);
        let decisions = Decisions::new(&conflicts, &records);
        let merged = merge(&versions(None, source, target), &decisions, &branches(1, 2));
        assert_eq!(merged.text, source);
    }

    #[test]
    fn keep_target_on_one_sided_addition_keeps_target_rows() {
        let base = "def calc(a, b):\n    return a + b\n";
        let source = "def calc(a, b):\n    return a + b\n\n\ndef added():\n    return 2\n";
        let (conflicts, records) = decided("added", Decision::KeepTarget);
        let decisions = Decisions::new(&conflicts, &records);
        let merged = merge(&versions(Some(base), source, base), &decisions, &branches(1, 2));
        assert_eq!(merged.text, base);
        assert!(merged.rows.is_empty());
    }

    #[test]
    fn keep_source_on_deleted_definition_removes_target_row() {
        let base = "def calc(a, b):\n    return a + b\n\n\ndef gone():\n    return 1\n";
        let source = "def calc(a, b):\n    return a + b\n";
        let target = "def calc(a, b):\n    return a + b\n\n\ndef gone():\n    return 9\n";
        let (conflicts, records) = decided("gone", Decision::KeepSource);
        let decisions = Decisions::new(&conflicts, &records);
        let merged = merge(&versions(Some(base), source, target), &decisions, &branches(1, 2));
        assert!(!merged.text.contains("gone"));
        assert_eq!(
            merged.rows,
            vec![RowChange::Remove {
                path: "calc.py".into(),
                symbol: "gone".into(),
            }]
        );
    }

    #[test]
    fn keep_both_renames_the_newer_side() {
        let source = "def calc(a, b):\n    return a + b\n";
        let target = "def calc(a, b):\n    return b + a\n";
        let (conflicts, records) = decided("calc", Decision::KeepBothRenamed);
        let decisions = Decisions::new(&conflicts, &records);
        // target tip is newer
        let merged = merge(&versions(None, source, target), &decisions, &branches(1, 2));
        assert_eq!(
            merged.text,
            "def calc(a, b):\n    return a + b\n\ndef calc_main(a, b):\n    return b + a\n"
        );
        let parsed = extract("calc.py", merged.text.as_bytes(), &Language::ALL).unwrap();
        assert!(parsed.get("calc_main").is_some());
        assert!(merged.rows.contains(&RowChange::Copy {
            side: Side::Target,
            path: "calc.py".into(),
            symbol: "calc".into(),
            as_symbol: "calc_main".into(),
        }));
        assert!(merged.rows.contains(&RowChange::Copy {
            side: Side::Source,
            path: "calc.py".into(),
            symbol: "calc".into(),
            as_symbol: "calc".into(),
        }));
    }

    #[test]
    fn keep_both_renames_methods_with_indentation() {
        let source = "class A:\n    def m(self):\n        return 1\n";
        let target = "class A:\n    def m(self):\n        return 2\n";
        let (conflicts, records) = decided("A.m", Decision::KeepBothRenamed);
        let decisions = Decisions::new(&conflicts, &records);
        let merged = merge(&versions(None, source, target), &decisions, &branches(5, 1));
        assert_eq!(
            merged.text,
            "class A:\n    def m(self):\n        return 2\n\n    def m_feature(self):\n        return 1\n"
        );
        assert!(merged.rows.iter().any(
            |r| matches!(r, RowChange::Copy { as_symbol, .. } if as_symbol == "A.m_feature")
        ));
    }

    #[test]
    fn external_content_replaces_definition() {
        let source = "def calc(a, b):\n    return a + b\n";
        let target = "def calc(a, b):\n    return b + a\n";
        let (conflicts, records) = decided(
            "calc",
            Decision::ExternallySupplied {
                content: "def calc(a, b):\n    return sum((a, b))\n".into(),
            },
        );
        let decisions = Decisions::new(&conflicts, &records);
        let merged = merge(&versions(None, source, target), &decisions, &branches(1, 2));
        assert_eq!(merged.text, "def calc(a, b):\n    return sum((a, b))\n");
        assert!(merged.rows.is_empty());
    }

    #[test]
    fn renamed_paths_keep_extension() {
        assert_eq!(renamed_path("assets/logo.png", "feature"), "assets/logo.feature.png");
        assert_eq!(renamed_path("Makefile", "main"), "Makefile.main");
        assert_eq!(renamed_path(".env", "main"), ".env.main");
    }

    #[test]
    fn owner_of_qualified_names() {
        assert_eq!(owner_of("calc"), "");
        assert_eq!(owner_of("Point::norm"), "Point");
        assert_eq!(owner_of("Shape.area#2"), "Shape");
    }

    #[test]
    fn metadata_plan_copies_and_removes() {
        let store = MemoryMetadataStore::new();
        let b = branches(1, 2);
        store.insert(&b.source, "calc.py", "f", FunctionMetadata::new(Purity::Pure, 3, 3));
        store.insert(&b.target, "calc.py", "g", FunctionMetadata::new(Purity::Pure, 1, 1));
        store.insert(&b.target, "calc.py", "stale", FunctionMetadata::new(Purity::Pure, 1, 1));

        let (ops, warnings) = plan_metadata(
            &store,
            &[
                RowChange::Copy {
                    side: Side::Source,
                    path: "calc.py".into(),
                    symbol: "f".into(),
                    as_symbol: "f".into(),
                },
                RowChange::Copy {
                    side: Side::Source,
                    path: "calc.py".into(),
                    symbol: "g".into(),
                    as_symbol: "g".into(),
                },
                RowChange::Remove {
                    path: "calc.py".into(),
                    symbol: "stale".into(),
                },
            ],
            &b,
        );
        assert!(warnings.is_empty());
        assert_eq!(
            ops,
            vec![
                MetadataOp::Upsert(
                    RowKey::new(&b.target, "calc.py", "f"),
                    FunctionMetadata::new(Purity::Pure, 3, 3)
                ),
                MetadataOp::Remove(RowKey::new(&b.target, "calc.py", "g")),
                MetadataOp::Remove(RowKey::new(&b.target, "calc.py", "stale")),
            ]
        );
    }

    #[test]
    fn metadata_plan_skips_unreadable_rows() {
        let store = MemoryMetadataStore::new();
        let b = branches(1, 2);
        store.set_row_unavailable(&b.source, "calc.py", "f");
        let (ops, warnings) = plan_metadata(
            &store,
            &[RowChange::Copy {
                side: Side::Source,
                path: "calc.py".into(),
                symbol: "f".into(),
                as_symbol: "f".into(),
            }],
            &b,
        );
        assert!(ops.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn copy_file_replaces_target_rows() {
        let store = MemoryMetadataStore::new();
        let b = branches(1, 2);
        store.insert(&b.source, "a.py", "f", FunctionMetadata::new(Purity::Pure, 1, 1));
        store.insert(&b.target, "a.py", "old", FunctionMetadata::new(Purity::Impure, 1, 1));
        let (ops, _) = plan_metadata(
            &store,
            &[RowChange::CopyFile {
                side: Side::Source,
                from_path: "a.py".into(),
                to_path: "a.py".into(),
            }],
            &b,
        );
        assert_eq!(ops.len(), 2);
        assert!(ops.contains(&MetadataOp::Remove(RowKey::new(&b.target, "a.py", "old"))));
    }
}
