use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod commands;
mod format;

use format::OutputFormat;

/// Symbol-aware branch reconciliation
///
/// Merges one branch into another, classifying every conflict by symbol
/// (function, class, method) rather than by line. Each conflict is scored
/// with the function metadata recorded for both branches; confident
/// recommendations are applied automatically, the rest wait for a decision.
///
/// WORKFLOW:
///
///   1. Preview:   reconcile preview feature main
///   2. Start:     reconcile start feature main
///   3. Inspect:   reconcile conflicts <merge-id>
///   4. Decide:    reconcile resolve <merge-id> <conflict-id> keep-source
///   5. Commit:    reconcile finalize <merge-id>
///
/// Everything is staged until finalize; a failure at any step leaves both
/// branches and the metadata store exactly as they were.
#[derive(Parser)]
#[command(name = "reconcile")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(verbatim_doc_comment)]
#[command(
    after_help = "See 'reconcile <command> --help' for more information on a specific command."
)]
struct Cli {
    /// Repository path (defaults to the current directory).
    #[arg(long, global = true, env = "RECONCILE_REPO")]
    repo: Option<PathBuf>,

    /// Output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, conflicts_with = "format")]
    json: bool,

    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = reconcile::telemetry::init(cli.verbose);

    let repo = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let format = if cli.json { OutputFormat::Json } else { cli.format };
    commands::run(&repo, format, cli.command)
}
