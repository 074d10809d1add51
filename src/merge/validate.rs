//! Post-merge validation.
//!
//! Materializes the candidate tree into a temporary directory and runs the
//! configured commands in it, in order, via `sh -c`. Execution stops on the
//! first failure. Each command has its own timeout; a command that overruns
//! is killed and recorded with no exit code.

use std::io::Read as _;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use reconcile_git::{GitOid, GitRepo};
use tracing::instrument;

use crate::config::ValidationConfig;
use crate::error::MergeError;
use crate::merge_state::{CommandResult, ValidationResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Check out `tree` into a fresh temporary directory and run the commands
/// from `config` there.
///
/// Returns `Ok(None)` when no command is configured.
///
/// # Errors
/// Returns an error if the temporary directory cannot be created, the tree
/// cannot be checked out, or a command cannot be spawned.
#[instrument(skip_all, fields(tree = %tree.short()))]
pub fn validate_tree<R: GitRepo + ?Sized>(
    repo: &R,
    tree: GitOid,
    config: &ValidationConfig,
) -> Result<Option<ValidationResult>, MergeError> {
    let commands = config.effective_commands();
    if commands.is_empty() {
        return Ok(None);
    }
    let checkout = tempfile::Builder::new()
        .prefix("reconcile-validate-")
        .tempdir()?;
    repo.checkout_tree(tree, checkout.path())?;
    let result = run_commands(&commands, checkout.path(), config.timeout_seconds)?;
    tracing::info!(
        passed = result.passed,
        duration_ms = result.duration_ms,
        commands = result.command_results.len(),
        "validation finished"
    );
    Ok(Some(result))
}

/// Run `commands` in sequence inside `working_dir`, stopping on the first
/// failure.
///
/// # Errors
/// Returns [`MergeError::Io`] if a command cannot be spawned or waited on.
pub fn run_commands(
    commands: &[&str],
    working_dir: &Path,
    timeout_seconds: u32,
) -> Result<ValidationResult, MergeError> {
    let mut command_results = Vec::with_capacity(commands.len());
    let mut duration_ms: u64 = 0;

    for &command in commands {
        let result = run_command(command, working_dir, timeout_seconds)?;
        duration_ms = duration_ms.saturating_add(result.duration_ms);
        let passed = result.passed;
        command_results.push(result);
        if !passed {
            break;
        }
    }

    Ok(ValidationResult {
        passed: command_results.iter().all(|r| r.passed),
        duration_ms,
        command_results,
    })
}

fn run_command(
    command: &str,
    working_dir: &Path,
    timeout_seconds: u32,
) -> Result<CommandResult, MergeError> {
    let timeout = Duration::from_secs(timeout_seconds.into());
    let start = Instant::now();
    tracing::debug!(command, "running validation command");

    let mut cmd = Command::new("sh");
    cmd.args(["-c", command])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(traceparent) = crate::telemetry::current_traceparent() {
        cmd.env("TRACEPARENT", traceparent);
    }
    let mut child = cmd.spawn()?;

    loop {
        if let Some(status) = child.try_wait()? {
            let exit_code = status.code();
            return Ok(CommandResult {
                command: command.to_owned(),
                passed: exit_code == Some(0),
                exit_code,
                stdout: drain(child.stdout.take()),
                stderr: drain(child.stderr.take()),
                duration_ms: elapsed_ms(start),
            });
        }
        if start.elapsed() >= timeout {
            kill(&mut child);
            tracing::warn!(command, timeout_seconds, "validation command timed out");
            return Ok(CommandResult {
                command: command.to_owned(),
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("killed by timeout after {timeout_seconds}s"),
                duration_ms: elapsed_ms(start),
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: std::io::Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // A read error leaves whatever was captured so far.
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
