//! Resolution scoring.
//!
//! A fixed decision table over the two sides' metadata. The first matching
//! row wins:
//!
//! | # | Condition                                      | Side    | Conf. |
//! |---|------------------------------------------------|---------|-------|
//! | 1 | opaque file (binary, unparseable, layout, ...) | manual  | 0.00  |
//! | 2 | metadata unavailable on either side            | manual  | 0.20  |
//! | 3 | symbol or file present on one side only        | manual  | 0.40  |
//! | 4 | no metadata record on a side                   | manual  | 0.20  |
//! | 5 | exactly one side pure                          | pure    | 0.90  |
//! | 6 | both impure                                    | manual  | 0.30  |
//! | 7 | dependency sets differ                         | manual  | 0.50  |
//! | 8 | both pure, different passing counts            | more    | 0.85  |
//! | 9 | both pure, same passing counts                 | both    | 0.70  |
//! | 10| anything else                                  | manual  | 0.40  |
//!
//! Row 9 recommends manual (still 0.70) for metadata-only conflicts, where
//! the two implementations are identical and keeping both is meaningless.
//!
//! The scorer reads nothing but the [`Conflict`] it is given.

use crate::model::conflict::{Conflict, MetadataLookup};
use crate::model::resolution::{Confidence, RecommendedSide, ResolutionStrategy};
use crate::model::types::{FunctionMetadata, Purity, Side};

/// Score one conflict.
#[must_use]
pub fn score(conflict: &Conflict) -> ResolutionStrategy {
    let (side, percent, rationale) = decide(conflict);
    let mut rationale = rationale;
    for degradation in &conflict.degradations {
        rationale.push_str("; ");
        rationale.push_str(degradation);
    }
    ResolutionStrategy {
        recommended_side: side,
        confidence: Confidence::from_percent(percent),
        rationale,
    }
}

const fn to_recommended(side: Side) -> RecommendedSide {
    match side {
        Side::Source => RecommendedSide::Source,
        Side::Target => RecommendedSide::Target,
    }
}

fn decide(conflict: &Conflict) -> (RecommendedSide, u8, String) {
    use RecommendedSide::Manual;

    if let Some(reason) = &conflict.opaque {
        return (Manual, 0, format!("no symbol-level analysis possible: {reason}"));
    }

    let (s, t) = (&conflict.source.metadata, &conflict.target.metadata);
    if s.is_unavailable() || t.is_unavailable() {
        return (Manual, 20, "metadata unavailable; insufficient data to choose a side".to_owned());
    }

    if conflict.is_one_sided() {
        let present = if conflict.source.present { Side::Source } else { Side::Target };
        let why = if conflict.kind.is_whole_file() {
            format!("file exists only on {present}")
        } else if conflict.side(present.other()).metadata.metadata().is_some() {
            format!(
                "symbol exists only on {present} but {} still has a metadata row for it",
                present.other()
            )
        } else {
            format!("symbol exists only on {present}; the other side deleted it after it changed")
        };
        return (Manual, 40, why);
    }

    let (Some(s), Some(t)) = (s.metadata(), t.metadata()) else {
        let missing = match (s, t) {
            (MetadataLookup::Missing, MetadataLookup::Missing) => "either side".to_owned(),
            (MetadataLookup::Missing, _) => "source".to_owned(),
            _ => "target".to_owned(),
        };
        return (Manual, 20, format!("no metadata record on {missing}"));
    };

    decide_metadata(conflict, s, t)
}

fn decide_metadata(
    conflict: &Conflict,
    s: &FunctionMetadata,
    t: &FunctionMetadata,
) -> (RecommendedSide, u8, String) {
    use RecommendedSide::{Both, Manual};

    match (s.purity == Purity::Pure, t.purity == Purity::Pure) {
        (true, false) => {
            return (
                RecommendedSide::Source,
                90,
                format!("source is pure, target is {}", t.purity),
            );
        }
        (false, true) => {
            return (
                RecommendedSide::Target,
                90,
                format!("target is pure, source is {}", s.purity),
            );
        }
        _ => {}
    }

    if s.purity == Purity::Impure && t.purity == Purity::Impure {
        return (Manual, 30, "both sides are impure".to_owned());
    }

    if !s.same_dependencies(t) {
        return (
            Manual,
            50,
            format!(
                "dependencies differ (source: [{}], target: [{}])",
                s.dependencies.join(", "),
                t.dependencies.join(", ")
            ),
        );
    }

    if s.purity == Purity::Pure && t.purity == Purity::Pure {
        let (sp, tp) = (s.test_summary.passing, t.test_summary.passing);
        if sp != tp {
            let (winner, won, lost) = if sp > tp {
                (Side::Source, s.test_summary, t.test_summary)
            } else {
                (Side::Target, t.test_summary, s.test_summary)
            };
            return (
                to_recommended(winner),
                85,
                format!(
                    "both pure with equal dependencies; {winner} has more passing tests ({won} vs {lost})"
                ),
            );
        }
        if conflict.is_metadata_only() {
            return (
                Manual,
                70,
                format!("identical implementations with equal purity and tests ({sp} passing); metadata rows differ otherwise"),
            );
        }
        let newer = conflict.newer_side();
        return (
            Both,
            70,
            format!("both pure with equal dependencies and tests ({sp} passing); keep both, rename the newer ({newer})"),
        );
    }

    (
        Manual,
        40,
        format!("no rule applies (source {}, target {})", s.purity, t.purity),
    )
}
