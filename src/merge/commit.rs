//! Merge commit message.

use std::fmt::Write as _;

use crate::model::resolution::{DecidedBy, ResolutionRecord};
use crate::model::types::BranchRef;

/// Build the message for the merge commit of `source` into `target`.
///
/// The subject names both branches. The body counts decisions by who made
/// them, then lists one line per record in the order given.
#[must_use]
pub fn commit_message(
    source: &BranchRef,
    target: &BranchRef,
    records: &[&ResolutionRecord],
) -> String {
    let mut msg = format!("reconcile: merge {source} into {target}");
    if records.is_empty() {
        msg.push_str("\n\nNo conflicts.\n");
        return msg;
    }

    let auto = records.iter().filter(|r| r.decided_by == DecidedBy::Auto).count();
    let manual = records.len() - auto;
    let _ = write!(
        msg,
        "\n\n{} conflict(s) resolved: {auto} auto, {manual} manual\n",
        records.len()
    );
    for record in records {
        let label = match &record.symbol {
            Some(symbol) => format!("{}::{symbol}", record.path),
            None => record.path.clone(),
        };
        let _ = write!(
            msg,
            "\n- {label}: {} ({}, {} {})",
            record.decision,
            record.decided_by,
            record.strategy.recommended_side,
            record.strategy.confidence
        );
        if !record.strategy.rationale.is_empty() {
            let _ = write!(msg, "\n    {}", record.strategy.rationale);
        }
    }
    msg.push('\n');
    msg
}
