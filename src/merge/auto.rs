//! Automatic application of high-confidence recommendations.

use crate::config::MergeConfig;
use crate::model::conflict::Conflict;
use crate::model::resolution::{
    Confidence, DecidedBy, Decision, RecommendedSide, ResolutionRecord, ResolutionStrategy,
};

/// Which recommendations are applied without review.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutoPolicy {
    /// Minimum confidence for keep-source / keep-target.
    pub apply_threshold: Confidence,
    /// Whether keep-both may be applied automatically at all.
    pub accept_keep_both: bool,
    /// Minimum confidence for keep-both when accepted.
    pub keep_both_threshold: Confidence,
}

impl AutoPolicy {
    /// The policy described by `[merge]` settings.
    #[must_use]
    pub const fn from_config(config: &MergeConfig) -> Self {
        Self {
            apply_threshold: Confidence::from_percent(config.auto_apply_threshold),
            accept_keep_both: config.auto_accept_keep_both,
            keep_both_threshold: Confidence::from_percent(config.keep_both_threshold),
        }
    }

    /// The decision this policy takes for `strategy`, or `None` when the
    /// conflict needs a human.
    #[must_use]
    pub fn decide(&self, strategy: &ResolutionStrategy) -> Option<Decision> {
        match strategy.recommended_side {
            RecommendedSide::Source if strategy.confidence >= self.apply_threshold => {
                Some(Decision::KeepSource)
            }
            RecommendedSide::Target if strategy.confidence >= self.apply_threshold => {
                Some(Decision::KeepTarget)
            }
            RecommendedSide::Both
                if self.accept_keep_both && strategy.confidence >= self.keep_both_threshold =>
            {
                Some(Decision::KeepBothRenamed)
            }
            _ => None,
        }
    }
}

impl Default for AutoPolicy {
    fn default() -> Self {
        Self::from_config(&MergeConfig::default())
    }
}

/// Apply `policy` to every scored conflict, returning one record per
/// conflict it decided.
#[must_use]
pub fn auto_resolve<'a, I>(policy: &AutoPolicy, scored: I, now: u64) -> Vec<ResolutionRecord>
where
    I: IntoIterator<Item = (&'a Conflict, &'a ResolutionStrategy)>,
{
    scored
        .into_iter()
        .filter_map(|(conflict, strategy)| {
            let decision = policy.decide(strategy)?;
            tracing::debug!(
                conflict = %conflict.id,
                label = %conflict.label(),
                decision = %decision,
                confidence = %strategy.confidence,
                "auto-resolved"
            );
            Some(ResolutionRecord {
                conflict_id: conflict.id.clone(),
                kind: conflict.kind,
                path: conflict.path.clone(),
                symbol: conflict.symbol.clone(),
                strategy: strategy.clone(),
                decision,
                decided_by: DecidedBy::Auto,
                applied_at: now,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::conflict::{ConflictKind, ConflictSide, MetadataLookup};

    fn strategy(side: RecommendedSide, percent: u8) -> ResolutionStrategy {
        ResolutionStrategy {
            recommended_side: side,
            confidence: Confidence::from_percent(percent),
            rationale: String::new(),
        }
    }

    fn conflict() -> Conflict {
        let side = ConflictSide {
            present: true,
            symbol: None,
            metadata: MetadataLookup::Missing,
            committed_at: 0,
        };
        Conflict::new(ConflictKind::SymbolAddedBoth, "a.py", Some("f"), side.clone(), side)
    }

    #[test]
    fn threshold_is_inclusive() {
        let policy = AutoPolicy::default();
        assert_eq!(
            policy.decide(&strategy(RecommendedSide::Source, 80)),
            Some(Decision::KeepSource)
        );
        assert_eq!(
            policy.decide(&strategy(RecommendedSide::Target, 85)),
            Some(Decision::KeepTarget)
        );
        assert_eq!(policy.decide(&strategy(RecommendedSide::Source, 79)), None);
    }

    #[test]
    fn manual_is_never_applied() {
        let policy = AutoPolicy::default();
        assert_eq!(policy.decide(&strategy(RecommendedSide::Manual, 100)), None);
    }

    #[test]
    fn keep_both_requires_opt_in() {
        let mut policy = AutoPolicy::default();
        assert_eq!(policy.decide(&strategy(RecommendedSide::Both, 70)), None);
        policy.accept_keep_both = true;
        assert_eq!(
            policy.decide(&strategy(RecommendedSide::Both, 70)),
            Some(Decision::KeepBothRenamed)
        );
        assert_eq!(policy.decide(&strategy(RecommendedSide::Both, 69)), None);
    }

    #[test]
    fn records_are_marked_auto() {
        let c = conflict();
        let s = strategy(RecommendedSide::Source, 90);
        let records = auto_resolve(&AutoPolicy::default(), [(&c, &s)], 42);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decided_by, DecidedBy::Auto);
        assert_eq!(records[0].applied_at, 42);
        assert_eq!(records[0].conflict_id, c.id);
    }
}
