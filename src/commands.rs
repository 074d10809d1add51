//! Subcommands of the `reconcile` binary.
//!
//! Every invocation is its own process: `start` persists the session under
//! `.reconcile/merges/`, and the other commands reopen it by merge id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Subcommand, ValueEnum};

use reconcile::engine::{MergeStart, Reconciler, WaitPolicy};
use reconcile::error::MergeError;
use reconcile::merge::mediate::{ComparisonView, SideView};
use reconcile::model::resolution::{AuditOutcome, Decision, MergeAuditEntry};
use reconcile::model::types::{BranchRef, MergeId};
use reconcile::{GixRepo, JsonMetadataStore};

use crate::format::OutputFormat;

type Engine = Reconciler<GixRepo, JsonMetadataStore>;

#[derive(Subcommand)]
pub enum Command {
    /// Show how far two branches have diverged, without starting a merge.
    ///
    /// Examples:
    ///   reconcile preview feature main
    #[command(verbatim_doc_comment)]
    Preview {
        /// Branch to merge in.
        source: String,
        /// Branch receiving the merge.
        target: String,
    },

    /// Start merging SOURCE into TARGET.
    ///
    /// Classifies and scores every conflict and applies the confident
    /// recommendations. Prints the merge id and any conflicts that still
    /// need a decision.
    ///
    /// Examples:
    ///   reconcile start feature main
    ///   reconcile start feature main --finalize   # commit if nothing is pending
    #[command(verbatim_doc_comment)]
    Start {
        /// Branch to merge in.
        source: String,
        /// Branch receiving the merge.
        target: String,
        /// Finalize right away when no conflict needs a decision.
        #[arg(long)]
        finalize: bool,
    },

    /// List the conflicts of a merge with both sides and the recommendation.
    Conflicts {
        /// Merge id printed by `start`.
        merge_id: String,
        /// Include conflicts that already have a decision.
        #[arg(long)]
        all: bool,
    },

    /// Decide one conflict.
    ///
    /// Examples:
    ///   reconcile resolve <merge-id> <conflict-id> keep-source
    ///   reconcile resolve <merge-id> <conflict-id> --file merged.py
    #[command(verbatim_doc_comment)]
    Resolve {
        /// Merge id printed by `start`.
        merge_id: String,
        /// Conflict id from `conflicts`.
        conflict_id: String,
        /// The decision.
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        decision: Option<DecisionArg>,
        /// File holding the merged text to use instead of either side.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Write and commit a merge whose conflicts are all decided.
    Finalize {
        /// Merge id printed by `start`.
        merge_id: String,
        /// Wait up to this many seconds for outstanding decisions.
        #[arg(long, value_name = "SECONDS")]
        wait: Option<u64>,
    },

    /// Cancel a merge, undoing anything it already did.
    Cancel {
        /// Merge id printed by `start`.
        merge_id: String,
    },

    /// List merge sessions.
    Status,

    /// Print the audit log.
    Audit {
        /// Only entries for this merge.
        #[arg(long)]
        merge: Option<String>,
    },
}

/// Decision names accepted on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DecisionArg {
    KeepSource,
    KeepTarget,
    KeepBoth,
}

pub fn run(repo: &Path, format: OutputFormat, command: Command) -> Result<()> {
    let engine = Reconciler::open(repo).context("Failed to open repository")?;
    match command {
        Command::Preview { source, target } => preview(&engine, format, &source, &target),
        Command::Start {
            source,
            target,
            finalize: then_finalize,
        } => start(&engine, format, &source, &target, then_finalize),
        Command::Conflicts { merge_id, all } => conflicts(&engine, format, &merge_id, all),
        Command::Resolve {
            merge_id,
            conflict_id,
            decision,
            file,
        } => resolve(&engine, format, &merge_id, &conflict_id, decision, file.as_deref()),
        Command::Finalize { merge_id, wait } => {
            let wait = wait.map_or(WaitPolicy::NoWait, |s| {
                WaitPolicy::Timeout(Duration::from_secs(s))
            });
            finalize(&engine, format, &merge_id, wait)
        }
        Command::Cancel { merge_id } => cancel(&engine, format, &merge_id),
        Command::Status => status(&engine, format),
        Command::Audit { merge } => audit(&engine, format, merge.as_deref()),
    }
}

fn branch(name: &str) -> Result<BranchRef> {
    BranchRef::new(name).with_context(|| format!("Invalid branch name '{name}'"))
}

// ---------------------------------------------------------------------------
// preview / start
// ---------------------------------------------------------------------------

fn preview(engine: &Engine, format: OutputFormat, source: &str, target: &str) -> Result<()> {
    let summary = engine.preview(&branch(source)?, &branch(target)?)?;
    format.print(&summary, |s| {
        println!("Merging '{}' into '{}'", s.source, s.target);
        match s.base {
            Some(base) => println!("  Base:           {}", base.short()),
            None => println!("  Base:           (none, unrelated histories)"),
        }
        println!("  Source only:    {} file(s)", s.only_source);
        println!("  Target only:    {} file(s)", s.only_target);
        println!("  Changed on both: {} file(s) (ceiling {})", s.modified_both.len(), s.ceiling);
        for path in &s.modified_both {
            println!("    {path}");
        }
    })
}

fn start(
    engine: &Engine,
    format: OutputFormat,
    source: &str,
    target: &str,
    then_finalize: bool,
) -> Result<()> {
    let handle = match engine.start_merge(&branch(source)?, &branch(target)?)? {
        MergeStart::Started(handle) => handle,
        MergeStart::Summary(summary) => {
            format.print(&summary, |s| {
                println!(
                    "{} file(s) changed on both sides (ceiling {}); not starting a merge.",
                    s.modified_both.len(),
                    s.ceiling
                );
                for path in &s.modified_both {
                    println!("  {path}");
                }
            })?;
            bail!(
                "Divergence too large. To fix: merge in smaller steps, or set merge.on_divergence = \"warn\""
            );
        }
    };

    let pending = engine.pending_views(&handle);
    if then_finalize && pending.is_empty() {
        let entry = engine.finalize(&handle, WaitPolicy::NoWait)?;
        return print_entry(format, &entry);
    }

    let session = handle.session();
    let report = serde_json::json!({
        "merge_id": session.merge_id,
        "conflicts": session.conflicts.len(),
        "auto_resolved": session.records.len(),
        "pending": pending,
        "warnings": session.warnings,
    });
    format.print(&report, |_| {
        println!("Merge {} started: {} into {}", session.merge_id, session.source, session.target);
        println!(
            "  {} conflict(s), {} resolved automatically",
            session.conflicts.len(),
            session.records.len()
        );
        for warning in &session.warnings {
            println!("  WARNING: {warning}");
        }
        if pending.is_empty() {
            println!();
            println!("Nothing to decide. Next: reconcile finalize {}", session.merge_id);
        } else {
            println!();
            for view in &pending {
                print_view(view);
            }
            println!("Next: reconcile resolve {} <conflict-id> <decision>", session.merge_id);
        }
    })
}

// ---------------------------------------------------------------------------
// conflicts / resolve
// ---------------------------------------------------------------------------

fn conflicts(engine: &Engine, format: OutputFormat, merge_id: &str, all: bool) -> Result<()> {
    let handle = engine.open_merge(merge_id)?;
    let views: Vec<ComparisonView> = if all {
        engine
            .conflicts(&handle)
            .iter()
            .map(|c| engine.comparison(&handle, c.id.as_str()))
            .collect::<Result<_, _>>()?
    } else {
        engine.pending_views(&handle)
    };
    format.print(&views, |views| {
        if views.is_empty() {
            println!("No pending conflicts.");
        }
        for view in views {
            print_view(view);
        }
    })
}

fn resolve(
    engine: &Engine,
    format: OutputFormat,
    merge_id: &str,
    conflict_id: &str,
    decision: Option<DecisionArg>,
    file: Option<&Path>,
) -> Result<()> {
    let decision = match (decision, file) {
        (Some(DecisionArg::KeepSource), _) => Decision::KeepSource,
        (Some(DecisionArg::KeepTarget), _) => Decision::KeepTarget,
        (Some(DecisionArg::KeepBoth), _) => Decision::KeepBothRenamed,
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Decision::ExternallySupplied { content }
        }
        (None, None) => bail!("Give a decision or --file <path> with the merged text"),
    };
    let handle = engine.open_merge(merge_id)?;
    let record = engine.submit_resolution(&handle, conflict_id, decision)?;
    let remaining = engine.list_pending_conflicts(&handle).len();
    format.print(&record, |r| {
        println!("{}: {}", r.conflict_id, r.decision);
        if remaining == 0 {
            println!("All conflicts decided. Next: reconcile finalize {merge_id}");
        } else {
            println!("{remaining} conflict(s) still pending.");
        }
    })
}

// ---------------------------------------------------------------------------
// finalize / cancel
// ---------------------------------------------------------------------------

fn finalize(engine: &Engine, format: OutputFormat, merge_id: &str, wait: WaitPolicy) -> Result<()> {
    let handle = engine.open_merge(merge_id)?;
    match engine.finalize(&handle, wait) {
        Ok(entry) => print_entry(format, &entry),
        Err(MergeError::PendingConflicts { pending, .. }) => {
            bail!(
                "{} conflict(s) still need a decision.\n  To see them: reconcile conflicts {merge_id}",
                pending.len()
            )
        }
        Err(e) => Err(e.into()),
    }
}

fn cancel(engine: &Engine, format: OutputFormat, merge_id: &str) -> Result<()> {
    let handle = engine.open_merge(merge_id)?;
    let reason = engine.cancel(&handle)?;
    format.print(&reason, |r| {
        println!("Merge {} cancelled during {}.", r.merge_id, r.phase);
        for step in &r.rolled_back {
            println!("  undone: {step}");
        }
    })
}

// ---------------------------------------------------------------------------
// status / audit
// ---------------------------------------------------------------------------

fn status(engine: &Engine, format: OutputFormat) -> Result<()> {
    let sessions = engine.merges()?;
    let rows: Vec<_> = sessions
        .iter()
        .map(|s| {
            serde_json::json!({
                "merge_id": s.merge_id,
                "source": s.source,
                "target": s.target,
                "phase": s.phase,
                "conflicts": s.conflicts.len(),
                "pending": s.pending().len(),
            })
        })
        .collect();
    format.print(&rows, |_| {
        if sessions.is_empty() {
            println!("No merges.");
        }
        for s in &sessions {
            println!(
                "{}  {} -> {}  {}  ({} conflict(s), {} pending)",
                s.merge_id,
                s.source,
                s.target,
                s.phase,
                s.conflicts.len(),
                s.pending().len()
            );
        }
    })
}

fn audit(engine: &Engine, format: OutputFormat, merge_id: Option<&str>) -> Result<()> {
    let entries = match merge_id {
        Some(id) => {
            let id = MergeId::new(id).with_context(|| format!("Invalid merge id '{id}'"))?;
            engine.audit_log().find(&id)?
        }
        None => engine.audit_entries()?,
    };
    format.print(&entries, |entries| {
        for entry in entries {
            print_entry_line(entry);
        }
    })
}

// ---------------------------------------------------------------------------
// Printing
// ---------------------------------------------------------------------------

fn print_entry(format: OutputFormat, entry: &MergeAuditEntry) -> Result<()> {
    format.print(entry, |e| {
        print_entry_line(e);
        for record in &e.records {
            let label = match &record.symbol {
                Some(symbol) => format!("{}::{symbol}", record.path),
                None => record.path.clone(),
            };
            println!("  {label}: {} ({})", record.decision, record.decided_by);
        }
        for warning in &e.warnings {
            println!("  WARNING: {warning}");
        }
    })
}

fn print_entry_line(entry: &MergeAuditEntry) {
    match &entry.outcome {
        AuditOutcome::Completed { commit } => println!(
            "{}  {} -> {}  completed {}  ({} decision(s))",
            entry.merge_id,
            entry.source,
            entry.target,
            commit.short(),
            entry.records.len()
        ),
        AuditOutcome::Aborted { phase, reason, .. } => println!(
            "{}  {} -> {}  aborted in {phase}: {reason}",
            entry.merge_id, entry.source, entry.target
        ),
    }
}

fn print_view(view: &ComparisonView) {
    let label = match &view.symbol {
        Some(symbol) => format!("{}::{symbol}", view.path),
        None => view.path.clone(),
    };
    println!("[{}] {} {label}", view.conflict_id, view.kind);
    if let Some(reason) = &view.opaque {
        println!("  opaque: {reason}");
    }
    print_side("source", &view.source);
    print_side("target", &view.target);
    println!(
        "  recommended: {} ({}), {}",
        view.strategy.recommended_side, view.strategy.confidence, view.strategy.rationale
    );
    println!("  allowed: {}", view.allowed.join(", "));
    println!();
}

fn print_side(name: &str, side: &SideView) {
    if !side.present {
        println!("  {name} ({}): absent", side.branch);
        return;
    }
    let lines = side
        .lines
        .map(|(start, end)| format!(" lines {start}-{end}"))
        .unwrap_or_default();
    println!("  {name} ({}){lines}", side.branch);
    if let Some(signature) = &side.signature {
        println!("    {signature}");
    }
    println!("    metadata: {}", side.metadata_status);
    if let Some(purity) = &side.purity {
        println!("    purity: {purity}");
    }
    if let Some(deps) = &side.dependencies {
        println!("    dependencies: {}", deps.join(", "));
    }
    if let Some(tests) = &side.tests {
        println!("    tests: {tests}");
    }
}
