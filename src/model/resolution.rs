//! Resolution strategies, applied decisions, and the per-merge audit entry.

use std::fmt;

use reconcile_git::GitOid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::conflict::ConflictKind;
use super::types::{BranchRef, ConflictId, MergeId};
use crate::error::MergeWarning;
use crate::merge_state::MergePhase;

// ---------------------------------------------------------------------------
// Confidence
// ---------------------------------------------------------------------------

/// Heuristic confidence in `[0, 1]`, held as a whole percentage so that
/// equality and threshold checks are exact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Confidence(u8);

impl Confidence {
    /// Zero confidence.
    pub const ZERO: Self = Self(0);

    /// A confidence of `percent`/100, clamped to 100.
    #[must_use]
    pub const fn from_percent(percent: u8) -> Self {
        if percent > 100 { Self(100) } else { Self(percent) }
    }

    /// The whole percentage.
    #[must_use]
    pub const fn percent(self) -> u8 {
        self.0
    }

    /// The value as a fraction in `[0, 1]`.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_f64())
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        if !(0.0..=1.0).contains(&value) {
            return Err(serde::de::Error::custom(format!(
                "confidence {value} outside [0, 1]"
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = (value * 100.0).round() as u8;
        Ok(Self(percent))
    }
}

// ---------------------------------------------------------------------------
// ResolutionStrategy
// ---------------------------------------------------------------------------

/// Which version the scorer recommends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedSide {
    /// Keep the source branch's version.
    Source,
    /// Keep the target branch's version.
    Target,
    /// Keep both, renaming the newer.
    Both,
    /// No safe recommendation; a person must decide.
    Manual,
}

impl fmt::Display for RecommendedSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
            Self::Both => write!(f, "both"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Output of scoring one conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStrategy {
    /// Recommended side.
    pub recommended_side: RecommendedSide,
    /// How safe it is to apply without review.
    pub confidence: Confidence,
    /// Human-readable reasoning, including any degradations.
    pub rationale: String,
}

// ---------------------------------------------------------------------------
// Decisions and records
// ---------------------------------------------------------------------------

/// A decision applied to a conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Keep the source version.
    KeepSource,
    /// Keep the target version.
    KeepTarget,
    /// Keep both; the newer side is renamed.
    KeepBothRenamed,
    /// Replace the conflicting text with supplied content.
    ExternallySupplied {
        /// The merged text (a definition, or a whole file).
        content: String,
    },
}

impl Decision {
    /// Short name used in commit messages and listings.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::KeepSource => "keep_source",
            Self::KeepTarget => "keep_target",
            Self::KeepBothRenamed => "keep_both_renamed",
            Self::ExternallySupplied { .. } => "externally_supplied",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who made a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidedBy {
    /// The auto-resolver.
    Auto,
    /// A person or external agent through the mediator.
    User,
}

impl fmt::Display for DecidedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::User => write!(f, "user"),
        }
    }
}

/// The applied decision for one conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// The conflict resolved.
    pub conflict_id: ConflictId,
    /// Its kind.
    pub kind: ConflictKind,
    /// Its path.
    pub path: String,
    /// Its symbol, for symbol-level conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// The scorer's recommendation at the time of the decision.
    pub strategy: ResolutionStrategy,
    /// What was decided.
    #[serde(flatten)]
    pub decision: Decision,
    /// Who decided.
    pub decided_by: DecidedBy,
    /// Unix seconds when the decision was recorded.
    pub applied_at: u64,
}

// ---------------------------------------------------------------------------
// MergeAuditEntry
// ---------------------------------------------------------------------------

/// How a merge attempt ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The merge commit landed on the target branch.
    Completed {
        /// The merge commit.
        commit: GitOid,
    },
    /// The attempt was abandoned.
    Aborted {
        /// The phase that failed.
        phase: MergePhase,
        /// What went wrong.
        reason: String,
        /// What was undone.
        #[serde(default)]
        rolled_back: Vec<String>,
    },
}

/// Permanent record of one merge attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeAuditEntry {
    /// The attempt.
    pub merge_id: MergeId,
    /// Branch merged in.
    pub source: BranchRef,
    /// Branch merged into.
    pub target: BranchRef,
    /// How it ended.
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    /// Every applied decision, ordered by conflict id. Empty for aborted
    /// attempts.
    #[serde(default)]
    pub records: Vec<ResolutionRecord>,
    /// Non-fatal degradations met along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<MergeWarning>,
    /// Unix seconds when the attempt started.
    pub started_at: u64,
    /// Unix seconds when it ended.
    pub finished_at: u64,
}

impl MergeAuditEntry {
    /// The merge commit, for completed attempts.
    #[must_use]
    pub const fn commit(&self) -> Option<GitOid> {
        match &self.outcome {
            AuditOutcome::Completed { commit } => Some(*commit),
            AuditOutcome::Aborted { .. } => None,
        }
    }

    /// Number of records decided by the given party.
    #[must_use]
    pub fn count_decided_by(&self, by: DecidedBy) -> usize {
        self.records.iter().filter(|r| r.decided_by == by).count()
    }
}
