//! The reconciliation pipeline.
//!
//! Each stage is a separate module, run in this order by the engine:
//!
//! - **differ**: classify changed paths against the merge base.
//! - **symbols**: extract callable definitions with tree-sitter.
//! - **classify**: three-way compare each path and emit conflicts.
//! - **score**: recommend a side with a confidence.
//! - **auto**: apply recommendations above the configured thresholds.
//! - **mediate**: present the rest for review and record decisions.
//! - **reconstruct**: splice the merged files and plan metadata changes.
//! - **validate**: run post-merge commands against the candidate tree.
//! - **commit**: build the merge commit message.
//!
//! # Determinism
//!
//! The same tips, base and metadata always produce the same conflicts,
//! recommendations and merged tree: paths are processed in lexicographic
//! order and parallel classification is re-sorted before use.

pub mod auto;
pub mod classify;
pub mod commit;
pub mod differ;
pub mod mediate;
pub mod reconstruct;
pub mod score;
pub mod symbols;
pub mod validate;
