//! Core value types: branch and merge identifiers, symbol versions, and the
//! per-function metadata record.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use reconcile_git::RefName;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A value failed validation when constructing an identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// What kind of identifier was being built.
    pub kind: &'static str,
    /// The offending value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// BranchRef
// ---------------------------------------------------------------------------

/// A validated git branch name (without the `refs/heads/` prefix).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchRef {
    name: String,
    full: RefName,
}

impl BranchRef {
    /// Create a branch reference, validating the name with git's rules.
    ///
    /// # Errors
    /// Returns [`ValidationError`] for names git would reject.
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        let name = name.strip_prefix("refs/heads/").unwrap_or(name);
        let full = RefName::branch(name).map_err(|e| ValidationError {
            kind: "branch",
            value: name.to_owned(),
            reason: e.reason,
        })?;
        Ok(Self {
            name: name.to_owned(),
            full,
        })
    }

    /// The branch name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The full `refs/heads/<name>` ref.
    #[must_use]
    pub const fn ref_name(&self) -> &RefName {
        &self.full
    }

    /// A filesystem- and identifier-safe rendering of the name, used for
    /// renamed symbols, renamed files and lock file names.
    #[must_use]
    pub fn slug(&self) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('_') {
                slug.push('_');
            }
        }
        slug.trim_matches('_').to_owned()
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for BranchRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<BranchRef> for String {
    fn from(branch: BranchRef) -> Self {
        branch.name
    }
}

// ---------------------------------------------------------------------------
// MergeId / ConflictId
// ---------------------------------------------------------------------------

fn short_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for byte in &digest[..6] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn validate_prefixed_hex(
    kind: &'static str,
    prefix: &str,
    s: &str,
) -> Result<(), ValidationError> {
    let ok = s.strip_prefix(prefix).is_some_and(|rest| {
        rest.len() == 12
            && rest
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    });
    if ok {
        Ok(())
    } else {
        Err(ValidationError {
            kind,
            value: s.to_owned(),
            reason: format!("expected `{prefix}` followed by 12 lowercase hex characters"),
        })
    }
}

/// Identifier of one merge attempt (`m-` + 12 hex characters).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MergeId(String);

impl MergeId {
    /// Derive a merge id from the merge inputs plus a nonce.
    #[must_use]
    pub fn generate(source: &BranchRef, target: &BranchRef, nonce: u128) -> Self {
        Self(format!(
            "m-{}",
            short_hex(&[
                source.as_str().as_bytes(),
                target.as_str().as_bytes(),
                &nonce.to_be_bytes(),
            ])
        ))
    }

    /// Parse and validate a merge id.
    ///
    /// # Errors
    /// Returns [`ValidationError`] if the string is not a merge id.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        validate_prefixed_hex("merge id", "m-", s)?;
        Ok(Self(s.to_owned()))
    }

    /// The id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MergeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MergeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MergeId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<MergeId> for String {
    fn from(id: MergeId) -> Self {
        id.0
    }
}

/// Stable identifier of a conflict within a merge (`c-` + 12 hex characters).
///
/// Derived from the conflict's kind, path and symbol, so re-running the
/// classifier on the same inputs yields the same ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConflictId(String);

impl ConflictId {
    /// Derive the id for a conflict.
    #[must_use]
    pub fn derive(kind: &str, path: &str, symbol: Option<&str>) -> Self {
        Self(format!(
            "c-{}",
            short_hex(&[
                kind.as_bytes(),
                path.as_bytes(),
                symbol.unwrap_or("").as_bytes(),
            ])
        ))
    }

    /// Parse and validate a conflict id.
    ///
    /// # Errors
    /// Returns [`ValidationError`] if the string is not a conflict id.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        validate_prefixed_hex("conflict id", "c-", s)?;
        Ok(Self(s.to_owned()))
    }

    /// The id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConflictId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ConflictId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ConflictId> for String {
    fn from(id: ConflictId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// One of the two branches taking part in a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The branch being merged in.
    Source,
    /// The branch receiving the merge.
    Target,
}

impl Side {
    /// The other side.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Source => Self::Target,
            Self::Target => Self::Source,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Target => write!(f, "target"),
        }
    }
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

/// Byte and line range of a definition in its file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// First byte of the definition.
    pub start_byte: usize,
    /// One past the last byte.
    pub end_byte: usize,
    /// 1-based first line.
    pub start_line: usize,
    /// 1-based last line.
    pub end_line: usize,
}

/// Whether a callable is free-standing or nested in a type/class body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    /// A top-level function.
    Function,
    /// A method inside an impl block, class or receiver declaration.
    Method,
}

/// One callable definition as it exists on one branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolVersion {
    /// Qualified key (`calc`, `Point::norm`, `Shape.area`), unique per file.
    pub name: String,
    /// Function or method.
    pub kind: SymbolKind,
    /// Declaration header with whitespace collapsed, for display.
    pub signature: String,
    /// SHA-256 of the whitespace-normalised parameter list.
    pub signature_hash: String,
    /// SHA-256 of the full definition text.
    pub body_hash: String,
    /// Where the definition lives.
    pub span: Span,
    /// Byte range of the bare identifier, used when renaming.
    pub name_span: (usize, usize),
}

impl SymbolVersion {
    /// The unqualified identifier (`norm` for `Point::norm`), without any
    /// duplicate suffix.
    #[must_use]
    pub fn identifier(&self) -> &str {
        let base = self.name.split('#').next().unwrap_or(&self.name);
        base.rsplit([':', '.']).next().unwrap_or(base)
    }
}

// ---------------------------------------------------------------------------
// FunctionMetadata
// ---------------------------------------------------------------------------

/// Purity classification of a function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purity {
    /// No observable side effects.
    Pure,
    /// Isolated or minor effects.
    MostlyPure,
    /// Freely performs effects.
    Impure,
}

impl fmt::Display for Purity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure => write!(f, "pure"),
            Self::MostlyPure => write!(f, "mostly_pure"),
            Self::Impure => write!(f, "impure"),
        }
    }
}

/// Test outcome summary for one function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestSummary {
    /// Number of tests exercising the function.
    pub total: u32,
    /// Number of those tests passing.
    pub passing: u32,
}

impl fmt::Display for TestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.passing, self.total)
    }
}

/// Semantic record of one function on one branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMetadata {
    /// Purity classification.
    pub purity: Purity,
    /// Named side effects (e.g. `io`, `network`).
    #[serde(default)]
    pub side_effects: BTreeSet<String>,
    /// Declared dependencies, in declaration order, without duplicates.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Test outcome summary.
    #[serde(default)]
    pub test_summary: TestSummary,
}

impl FunctionMetadata {
    /// A record with the given purity and test counts, no side effects and
    /// no dependencies.
    #[must_use]
    pub const fn new(purity: Purity, passing: u32, total: u32) -> Self {
        Self {
            purity,
            side_effects: BTreeSet::new(),
            dependencies: Vec::new(),
            test_summary: TestSummary { total, passing },
        }
    }

    /// Replace the dependency list, dropping repeated entries while keeping
    /// first-seen order.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = BTreeSet::new();
        self.dependencies = deps
            .into_iter()
            .map(Into::into)
            .filter(|d| seen.insert(d.clone()))
            .collect();
        self
    }

    /// Add named side effects.
    #[must_use]
    pub fn with_side_effects<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.side_effects.extend(effects.into_iter().map(Into::into));
        self
    }

    /// Whether two records declare the same dependency set (order ignored).
    #[must_use]
    pub fn same_dependencies(&self, other: &Self) -> bool {
        let a: BTreeSet<&str> = self.dependencies.iter().map(String::as_str).collect();
        let b: BTreeSet<&str> = other.dependencies.iter().map(String::as_str).collect();
        a == b
    }
}
