//! Conflict records produced by the classifier.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{ConflictId, FunctionMetadata, Side, SymbolVersion};

/// What kind of divergence a [`Conflict`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The path is new on both sides and cannot be compared per symbol.
    FileAddedBoth,
    /// The path changed on both sides and cannot be compared per symbol.
    FileModifiedBoth,
    /// Same symbol, different parameter lists (or modified on one side and
    /// deleted on the other).
    SymbolSignatureChanged,
    /// Same symbol and parameters, divergent implementation.
    SymbolAddedBoth,
    /// Same implementation but conflicting metadata rows, or a symbol on one
    /// side whose metadata row still exists on the other.
    MetadataRowConflict,
}

impl ConflictKind {
    /// The snake-case name used in ids, JSON and commit messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FileAddedBoth => "file_added_both",
            Self::FileModifiedBoth => "file_modified_both",
            Self::SymbolSignatureChanged => "symbol_signature_changed",
            Self::SymbolAddedBoth => "symbol_added_both",
            Self::MetadataRowConflict => "metadata_row_conflict",
        }
    }

    /// Whether this conflict covers a whole file.
    #[must_use]
    pub const fn is_whole_file(self) -> bool {
        matches!(self, Self::FileAddedBoth | Self::FileModifiedBoth)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a file could not be compared symbol by symbol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OpaqueReason {
    /// NUL bytes or a configured binary pattern.
    Binary,
    /// No grammar for this file type (or the grammar is disabled).
    UnsupportedLanguage {
        /// File extension, if any.
        extension: Option<String>,
    },
    /// The content on one side does not parse.
    ParseFailure {
        /// The side that failed.
        side: Side,
        /// Parser diagnostic.
        message: String,
    },
    /// Both sides changed the text between definitions differently.
    LayoutDiverged,
    /// One side deleted the file while the other changed it.
    DeletedOnOneSide {
        /// The side that deleted the file.
        deleted: Side,
    },
}

impl fmt::Display for OpaqueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary content"),
            Self::UnsupportedLanguage {
                extension: Some(ext),
            } => write!(f, "no symbol grammar for .{ext} files"),
            Self::UnsupportedLanguage { extension: None } => {
                write!(f, "no symbol grammar for files without an extension")
            }
            Self::ParseFailure { side, message } => {
                write!(f, "{side} version does not parse: {message}")
            }
            Self::LayoutDiverged => {
                write!(f, "both sides changed the text between definitions")
            }
            Self::DeletedOnOneSide { deleted } => {
                write!(f, "deleted on {deleted}, modified on {}", deleted.other())
            }
        }
    }
}

/// Result of looking up a symbol's metadata on one branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetadataLookup {
    /// The store returned a record.
    Available {
        /// The record.
        metadata: FunctionMetadata,
    },
    /// The store answered but holds no record for the symbol.
    Missing,
    /// The store could not be queried.
    Unavailable {
        /// Why the lookup failed.
        reason: String,
    },
}

impl MetadataLookup {
    /// The record, if one was found.
    #[must_use]
    pub const fn metadata(&self) -> Option<&FunctionMetadata> {
        match self {
            Self::Available { metadata } => Some(metadata),
            Self::Missing | Self::Unavailable { .. } => None,
        }
    }

    /// Whether the store failed to answer.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// One side of a conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSide {
    /// Whether the path (whole-file conflicts) or symbol exists on this side.
    pub present: bool,
    /// The symbol version, for symbol-level conflicts.
    pub symbol: Option<SymbolVersion>,
    /// Metadata for the symbol on this side's branch.
    pub metadata: MetadataLookup,
    /// Committer time of this side's branch tip (seconds since the epoch).
    pub committed_at: i64,
}

/// A unit of divergence needing one decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Stable id within the merge.
    pub id: ConflictId,
    /// What diverged.
    pub kind: ConflictKind,
    /// Repository-relative path.
    pub path: String,
    /// Qualified symbol key for symbol-level conflicts.
    pub symbol: Option<String>,
    /// The source branch's version.
    pub source: ConflictSide,
    /// The target branch's version.
    pub target: ConflictSide,
    /// Set when the file could not be analysed per symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueReason>,
    /// Non-fatal problems met while classifying this conflict.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
}

impl Conflict {
    /// Build a conflict, deriving its id.
    #[must_use]
    pub fn new(
        kind: ConflictKind,
        path: &str,
        symbol: Option<&str>,
        source: ConflictSide,
        target: ConflictSide,
    ) -> Self {
        Self {
            id: ConflictId::derive(kind.as_str(), path, symbol),
            kind,
            path: path.to_owned(),
            symbol: symbol.map(str::to_owned),
            source,
            target,
            opaque: None,
            degradations: Vec::new(),
        }
    }

    /// The given side.
    #[must_use]
    pub const fn side(&self, side: Side) -> &ConflictSide {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    /// `true` when only one side has the symbol (or file).
    #[must_use]
    pub const fn is_one_sided(&self) -> bool {
        self.source.present != self.target.present
    }

    /// `true` when both sides carry the same implementation and only the
    /// metadata rows disagree.
    #[must_use]
    pub fn is_metadata_only(&self) -> bool {
        self.kind == ConflictKind::MetadataRowConflict && !self.is_one_sided()
    }

    /// The side whose branch tip is newer (ties go to the source).
    #[must_use]
    pub const fn newer_side(&self) -> Side {
        if self.target.committed_at > self.source.committed_at {
            Side::Target
        } else {
            Side::Source
        }
    }

    /// `path` or `path::symbol`, for messages.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.symbol {
            Some(symbol) => format!("{}::{symbol}", self.path),
            None => self.path.clone(),
        }
    }
}
