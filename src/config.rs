//! Reconcile repository configuration (`config.toml`).
//!
//! Defines the typed configuration for `.reconcile/config.toml`: merge
//! thresholds and divergence policy, post-merge validation, the metadata
//! store and the audit log.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::merge::symbols::Language;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level reconcile configuration.
///
/// Parsed from `.reconcile/config.toml`. Missing fields use sensible
/// defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Merge settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Merge behaviour settings.
///
/// ```toml
/// [merge]
/// auto_apply_threshold = 80
/// auto_accept_keep_both = false
/// keep_both_threshold = 70
/// divergence_ceiling = 50
/// on_divergence = "warn"
/// binary_patterns = ["*.png", "assets/**"]
/// languages = ["rust", "python", "typescript", "javascript", "go"]
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Minimum confidence (percent) at which a keep-source / keep-target
    /// recommendation is applied without review.
    #[serde(default = "default_auto_apply_threshold")]
    pub auto_apply_threshold: u8,

    /// Apply keep-both recommendations automatically.
    #[serde(default)]
    pub auto_accept_keep_both: bool,

    /// Minimum confidence (percent) for automatic keep-both, when enabled.
    #[serde(default = "default_keep_both_threshold")]
    pub keep_both_threshold: u8,

    /// Number of paths modified on both sides above which the merge is
    /// considered too large for full analysis.
    #[serde(default = "default_divergence_ceiling")]
    pub divergence_ceiling: usize,

    /// What to do when the ceiling is exceeded.
    #[serde(default)]
    pub on_divergence: DivergencePolicy,

    /// Glob patterns for paths always treated as binary.
    #[serde(default)]
    pub binary_patterns: Vec<String>,

    /// Languages with symbol-level analysis.
    #[serde(default = "default_languages")]
    pub languages: Vec<Language>,

    /// Post-merge validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            auto_apply_threshold: default_auto_apply_threshold(),
            auto_accept_keep_both: false,
            keep_both_threshold: default_keep_both_threshold(),
            divergence_ceiling: default_divergence_ceiling(),
            on_divergence: DivergencePolicy::default(),
            binary_patterns: Vec::new(),
            languages: default_languages(),
            validation: ValidationConfig::default(),
        }
    }
}

const fn default_auto_apply_threshold() -> u8 {
    80
}

const fn default_keep_both_threshold() -> u8 {
    70
}

const fn default_divergence_ceiling() -> usize {
    50
}

fn default_languages() -> Vec<Language> {
    Language::ALL.to_vec()
}

/// Behaviour when the number of modified-both paths exceeds the ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivergencePolicy {
    /// Record a warning and continue with full analysis.
    #[default]
    Warn,
    /// Stop after computing a summary.
    Summarize,
}

impl fmt::Display for DivergencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => write!(f, "warn"),
            Self::Summarize => write!(f, "summarize"),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationConfig
// ---------------------------------------------------------------------------

/// Post-merge validation command settings.
///
/// Supports both a single `command` string and a `commands` array. When both
/// are specified, `command` runs first, then all entries from `commands`.
/// When neither is set, validation is skipped.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Shell command to run against the merged tree (e.g. `"cargo test"`).
    pub command: Option<String>,

    /// Multiple shell commands to run in sequence. Each runs via `sh -c`.
    /// Execution stops on first failure.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Timeout in seconds for each validation command.
    #[serde(default = "default_validation_timeout")]
    pub timeout_seconds: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: None,
            commands: Vec::new(),
            timeout_seconds: default_validation_timeout(),
        }
    }
}

impl ValidationConfig {
    /// The commands to run, in order, with empty entries dropped.
    #[must_use]
    pub fn effective_commands(&self) -> Vec<&str> {
        let mut result = Vec::new();
        if let Some(cmd) = &self.command
            && !cmd.is_empty()
        {
            result.push(cmd.as_str());
        }
        for cmd in &self.commands {
            if !cmd.is_empty() {
                result.push(cmd.as_str());
            }
        }
        result
    }

    /// Returns `true` if at least one command is configured.
    #[must_use]
    pub fn has_commands(&self) -> bool {
        !self.effective_commands().is_empty()
    }
}

const fn default_validation_timeout() -> u32 {
    60
}

// ---------------------------------------------------------------------------
// StoreConfig / AuditConfig
// ---------------------------------------------------------------------------

/// Metadata store settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// JSON document holding function metadata, relative to the repo root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Attempts made to take the store lock before giving up.
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    /// Delay before the second attempt; doubles on each retry.
    #[serde(default = "default_lock_base_delay_ms")]
    pub lock_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_attempts: default_lock_attempts(),
            lock_base_delay_ms: default_lock_base_delay_ms(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".reconcile/metadata.json")
}

const fn default_lock_attempts() -> u32 {
    5
}

const fn default_lock_base_delay_ms() -> u64 {
    20
}

/// Audit log settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// JSON Lines file receiving one entry per merge attempt, relative to
    /// the repo root.
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

fn default_audit_path() -> PathBuf {
    PathBuf::from(".reconcile/audit.jsonl")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a reconcile configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl ReconcileConfig {
    /// Default location of the config file under a repository root.
    #[must_use]
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(".reconcile").join("config.toml")
    }

    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML, unknown fields or
    ///   out-of-range values, returns a [`ConfigError`].
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields or values
    /// outside their allowed range.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let bad = |message: String| ConfigError {
            path: None,
            message,
        };
        for (name, value) in [
            ("merge.auto_apply_threshold", self.merge.auto_apply_threshold),
            ("merge.keep_both_threshold", self.merge.keep_both_threshold),
        ] {
            if value > 100 {
                return Err(bad(format!("{name} must be between 0 and 100, got {value}")));
            }
        }
        if self.store.lock_attempts == 0 {
            return Err(bad("store.lock_attempts must be at least 1".to_owned()));
        }
        for pattern in &self.merge.binary_patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(bad(format!(
                    "merge.binary_patterns: invalid glob {pattern:?}: {e}"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_all_fields() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.merge.auto_apply_threshold, 80);
        assert!(!cfg.merge.auto_accept_keep_both);
        assert_eq!(cfg.merge.keep_both_threshold, 70);
        assert_eq!(cfg.merge.divergence_ceiling, 50);
        assert_eq!(cfg.merge.on_divergence, DivergencePolicy::Warn);
        assert_eq!(cfg.merge.languages.len(), Language::ALL.len());
        assert!(!cfg.merge.validation.has_commands());
        assert_eq!(cfg.merge.validation.timeout_seconds, 60);
        assert_eq!(cfg.store.lock_attempts, 5);
        assert_eq!(cfg.audit.path, PathBuf::from(".reconcile/audit.jsonl"));
    }

    #[test]
    fn parse_empty_string() {
        let cfg = ReconcileConfig::parse("").unwrap();
        assert_eq!(cfg, ReconcileConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let cfg = ReconcileConfig::parse(
            r#"
[merge]
auto_apply_threshold = 85
auto_accept_keep_both = true
keep_both_threshold = 65
divergence_ceiling = 10
on_divergence = "summarize"
binary_patterns = ["*.png"]
languages = ["python", "ts"]

[merge.validation]
command = "make check"
commands = ["pytest -q"]
timeout_seconds = 30

[store]
path = "meta/store.json"
lock_attempts = 3
lock_base_delay_ms = 5

[audit]
path = "meta/audit.jsonl"
"#,
        )
        .unwrap();
        assert_eq!(cfg.merge.auto_apply_threshold, 85);
        assert!(cfg.merge.auto_accept_keep_both);
        assert_eq!(cfg.merge.on_divergence, DivergencePolicy::Summarize);
        assert_eq!(cfg.merge.languages, vec![Language::Python, Language::TypeScript]);
        assert_eq!(
            cfg.merge.validation.effective_commands(),
            vec!["make check", "pytest -q"]
        );
        assert_eq!(cfg.store.path, PathBuf::from("meta/store.json"));
        assert_eq!(cfg.store.lock_attempts, 3);
    }

    #[test]
    fn unknown_field_reports_line() {
        let err = ReconcileConfig::parse("[merge]\nauto_apply_threshold = 80\nbogus = 1\n")
            .unwrap_err();
        assert!(err.message.contains("line 3"), "got: {}", err.message);
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let err = ReconcileConfig::parse("[merge]\nauto_apply_threshold = 120\n").unwrap_err();
        assert!(err.message.contains("auto_apply_threshold"));
    }

    #[test]
    fn invalid_binary_glob_rejected() {
        let err = ReconcileConfig::parse("[merge]\nbinary_patterns = [\"[\"]\n").unwrap_err();
        assert!(err.message.contains("binary_patterns"));
    }

    #[test]
    fn zero_lock_attempts_rejected() {
        assert!(ReconcileConfig::parse("[store]\nlock_attempts = 0\n").is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ReconcileConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, ReconcileConfig::default());
    }

    #[test]
    fn load_error_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[merge\n").unwrap();
        let err = ReconcileConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert!(err.to_string().contains("config.toml"));
    }
}
