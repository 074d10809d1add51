//! Advisory file locks and the retry loop for transient contention.
//!
//! Locks use `flock(2)`-style advisory locking via `fs4`. The OS releases a
//! lock when its process dies, so no PID tracking or stale lock detection is
//! needed. Contention is never waited out silently: callers retry a bounded
//! number of times with exponential backoff and jitter, then give up.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use rand::Rng;

/// An exclusive advisory lock, held until dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try once to take an exclusive lock on `path`, creating the file (and
    /// its parent directory) if needed.
    ///
    /// Returns `Ok(None)` when another holder has the lock.
    ///
    /// # Errors
    /// Returns I/O errors other than contention.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_owned(),
            })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The locked file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs4::lock_contended_error().raw_os_error()
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay after the first failure; doubles on each further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// A policy with the given attempt count and base delay.
    #[must_use]
    pub const fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts run out. Between attempts the thread sleeps for the
/// backoff delay plus up to one base delay of random jitter.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
/// Returns the last error from `op`.
pub fn retry_with_backoff<T, E>(
    policy: RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let attempts = policy.attempts.max(1);
    let mut rng = rand::rng();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_transient(&e) => {
                let jitter_cap = u64::try_from(policy.base_delay.as_micros()).unwrap_or(u64::MAX);
                let jitter = Duration::from_micros(rng.random_range(0..=jitter_cap));
                let delay = policy.backoff(attempt) + jitter;
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    "transient failure; retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn lock_excludes_second_holder_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks").join("main.lock");

        let first = FileLock::try_acquire(&path).unwrap().unwrap();
        assert!(path.exists());
        assert!(FileLock::try_acquire(&path).unwrap().is_none());
        drop(first);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(4), Duration::from_millis(80));
    }

    #[test]
    fn retry_stops_after_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), &str> =
            retry_with_backoff(RetryPolicy::new(3, Duration::ZERO), |_| true, |_| {
                calls.set(calls.get() + 1);
                Err("busy")
            });
        assert_eq!(result, Err("busy"));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let result: Result<u32, &str> =
            retry_with_backoff(RetryPolicy::new(5, Duration::ZERO), |_| true, |attempt| {
                if attempt < 3 { Err("busy") } else { Ok(attempt) }
            });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn retry_does_not_repeat_fatal_errors() {
        let calls = Cell::new(0);
        let result: Result<(), &str> = retry_with_backoff(
            RetryPolicy::new(5, Duration::ZERO),
            |e| *e == "busy",
            |_| {
                calls.set(calls.get() + 1);
                Err("broken")
            },
        );
        assert_eq!(result, Err("broken"));
        assert_eq!(calls.get(), 1);
    }
}
