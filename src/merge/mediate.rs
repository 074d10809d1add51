//! Manual mediation: comparison views and decision intake.

use serde::Serialize;

use crate::error::MergeError;
use crate::merge_state::{MergePhase, MergeSession};
use crate::model::conflict::{Conflict, ConflictKind, MetadataLookup, OpaqueReason};
use crate::model::resolution::{DecidedBy, Decision, ResolutionRecord, ResolutionStrategy};
use crate::model::types::{BranchRef, ConflictId, Side};

/// One side of a [`ComparisonView`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SideView {
    /// Branch name.
    pub branch: BranchRef,
    /// Whether the symbol (or file) exists on this side.
    pub present: bool,
    /// Declaration header, for symbol conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Lines spanned by the definition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<(usize, usize)>,
    /// `available`, `missing` or `unavailable: <reason>`.
    pub metadata_status: String,
    /// Purity, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purity: Option<String>,
    /// Declared dependencies, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    /// Tests as `passing/total`, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<String>,
}

/// Everything a reviewer needs to decide one conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ComparisonView {
    /// The conflict.
    pub conflict_id: ConflictId,
    /// Its kind.
    pub kind: ConflictKind,
    /// Its path.
    pub path: String,
    /// Its symbol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Why no symbol-level view exists, for opaque files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueReason>,
    /// Source side.
    pub source: SideView,
    /// Target side.
    pub target: SideView,
    /// The scorer's recommendation and rationale.
    pub strategy: ResolutionStrategy,
    /// Decisions accepted for this conflict.
    pub allowed: Vec<&'static str>,
}

/// Build the comparison view for `conflict`.
#[must_use]
pub fn comparison_view(
    session: &MergeSession,
    conflict: &Conflict,
    strategy: &ResolutionStrategy,
) -> ComparisonView {
    let side_view = |side: Side| {
        let s = conflict.side(side);
        let metadata = s.metadata.metadata();
        SideView {
            branch: match side {
                Side::Source => session.source.clone(),
                Side::Target => session.target.clone(),
            },
            present: s.present,
            signature: s.symbol.as_ref().map(|v| v.signature.clone()),
            lines: s.symbol.as_ref().map(|v| (v.span.start_line, v.span.end_line)),
            metadata_status: match &s.metadata {
                MetadataLookup::Available { .. } => "available".to_owned(),
                MetadataLookup::Missing => "missing".to_owned(),
                MetadataLookup::Unavailable { reason } => format!("unavailable: {reason}"),
            },
            purity: metadata.map(|m| m.purity.to_string()),
            dependencies: metadata.map(|m| m.dependencies.clone()),
            tests: metadata.map(|m| m.test_summary.to_string()),
        }
    };
    ComparisonView {
        conflict_id: conflict.id.clone(),
        kind: conflict.kind,
        path: conflict.path.clone(),
        symbol: conflict.symbol.clone(),
        opaque: conflict.opaque.clone(),
        source: side_view(Side::Source),
        target: side_view(Side::Target),
        strategy: strategy.clone(),
        allowed: allowed_decisions(conflict),
    }
}

/// Names of the decisions [`validate_decision`] accepts for `conflict`.
#[must_use]
pub fn allowed_decisions(conflict: &Conflict) -> Vec<&'static str> {
    let mut allowed = vec![Decision::KeepSource.as_str(), Decision::KeepTarget.as_str()];
    if !conflict.is_one_sided() && !conflict.is_metadata_only() {
        allowed.push(Decision::KeepBothRenamed.as_str());
    }
    if !conflict.is_metadata_only() {
        allowed.push("externally_supplied");
    }
    allowed
}

/// Check that `decision` makes sense for `conflict`.
///
/// # Errors
/// [`MergeError::InvalidDecision`] for keep-both on one-sided or
/// metadata-only conflicts, and for supplied content on metadata-only
/// conflicts.
pub fn validate_decision(conflict: &Conflict, decision: &Decision) -> Result<(), MergeError> {
    let reason = match decision {
        Decision::KeepBothRenamed if conflict.is_one_sided() => {
            Some("only one side has this symbol; there is nothing to keep twice")
        }
        Decision::KeepBothRenamed if conflict.is_metadata_only() => {
            Some("both implementations are identical; choose which metadata row to keep")
        }
        Decision::ExternallySupplied { .. } if conflict.is_metadata_only() => {
            Some("metadata conflicts take keep_source or keep_target")
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(MergeError::InvalidDecision {
            conflict_id: conflict.id.clone(),
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}

/// Record a human decision on `session`.
///
/// # Errors
/// [`MergeError::WrongPhase`] outside `resolving`,
/// [`MergeError::UnknownConflict`], [`MergeError::AlreadyResolved`] and
/// [`MergeError::InvalidDecision`].
pub fn record_decision(
    session: &mut MergeSession,
    conflict_id: &str,
    decision: Decision,
    now: u64,
) -> Result<ResolutionRecord, MergeError> {
    if session.phase != MergePhase::Resolving {
        return Err(MergeError::WrongPhase {
            merge_id: session.merge_id.clone(),
            phase: session.phase,
            operation: "resolve a conflict of",
        });
    }
    let conflict = session
        .conflicts
        .iter()
        .find(|c| c.id.as_str() == conflict_id)
        .ok_or_else(|| MergeError::UnknownConflict {
            merge_id: session.merge_id.clone(),
            conflict_id: conflict_id.to_owned(),
        })?;
    if session.records.contains_key(&conflict.id) {
        return Err(MergeError::AlreadyResolved {
            conflict_id: conflict.id.clone(),
        });
    }
    validate_decision(conflict, &decision)?;

    let strategy = session
        .strategies
        .get(&conflict.id)
        .cloned()
        .unwrap_or_else(|| super::score::score(conflict));
    let record = ResolutionRecord {
        conflict_id: conflict.id.clone(),
        kind: conflict.kind,
        path: conflict.path.clone(),
        symbol: conflict.symbol.clone(),
        strategy,
        decision,
        decided_by: DecidedBy::User,
        applied_at: now,
    };
    tracing::info!(
        merge_id = %session.merge_id,
        conflict = %record.conflict_id,
        decision = %record.decision,
        "decision recorded"
    );
    session.records.insert(record.conflict_id.clone(), record.clone());
    session.updated_at = now;
    Ok(record)
}
