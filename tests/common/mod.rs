//! Shared fixtures for reconcile integration tests.
//!
//! Every fixture lives in its own temp directory: the engine's state
//! (`.reconcile/`) goes there, the repository and metadata store are in
//! memory.

#![allow(dead_code)]

use std::path::Path;

use reconcile::config::ReconcileConfig;
use reconcile::model::types::{BranchRef, FunctionMetadata, Purity};
use reconcile::{MemoryMetadataStore, MemoryRepo, Reconciler};
use reconcile_git::GitOid;
use tempfile::TempDir;

pub type Engine = Reconciler<MemoryRepo, MemoryMetadataStore>;

pub const SOURCE: &str = "feature";
pub const TARGET: &str = "main";

pub const CALC_PURE: &[u8] = b"def calc(a, b):\n    return a + b\n";
pub const CALC_IMPURE: &[u8] = b"def calc(a, b):\n    print(a, b)\n    return a + b\n";
pub const CALC_PURE_ALT: &[u8] = b"def calc(a, b):\n    total = a + b\n    return total\n";

pub fn branch(name: &str) -> BranchRef {
    BranchRef::new(name).unwrap()
}

pub fn source() -> BranchRef {
    branch(SOURCE)
}

pub fn target() -> BranchRef {
    branch(TARGET)
}

pub fn pure(passing: u32) -> FunctionMetadata {
    FunctionMetadata::new(Purity::Pure, passing, passing)
}

pub fn impure(passing: u32) -> FunctionMetadata {
    FunctionMetadata::new(Purity::Impure, passing, passing)
}

/// Tips of the three commits a fork fixture makes.
#[derive(Clone, Copy, Debug)]
pub struct Fork {
    pub base: GitOid,
    pub source: GitOid,
    pub target: GitOid,
}

/// Commit `base` on `main`, branch `feature` from it, then commit `source`
/// on `feature` and `target` on `main` (so the target tip is newer).
///
/// Commits are content-addressed with a fixed clock, so two repositories
/// built from the same arguments are identical.
pub fn fork_repo(
    repo: &MemoryRepo,
    base: &[(&str, &[u8])],
    source: &[(&str, &[u8])],
    target: &[(&str, &[u8])],
) -> Fork {
    let base = repo.commit_files(TARGET, base, "base").unwrap();
    repo.set_branch(SOURCE, base).unwrap();
    let source = repo.commit_files(SOURCE, source, "source work").unwrap();
    let target = repo.commit_files(TARGET, target, "target work").unwrap();
    Fork {
        base,
        source,
        target,
    }
}

/// A temp directory holding the engine's state.
pub struct Fixture {
    pub dir: TempDir,
    pub engine: Engine,
    pub fork: Fork,
}

impl Fixture {
    pub fn new(
        base: &[(&str, &[u8])],
        source: &[(&str, &[u8])],
        target: &[(&str, &[u8])],
        config: ReconcileConfig,
    ) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo = MemoryRepo::new();
        let fork = fork_repo(&repo, base, source, target);
        let engine = Reconciler::new(repo, MemoryMetadataStore::new(), dir.path(), config);
        Self { dir, engine, fork }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo(&self) -> &MemoryRepo {
        self.engine.repo()
    }

    pub fn store(&self) -> &MemoryMetadataStore {
        self.engine.store()
    }

    pub fn file_on(&self, branch: &str, path: &str) -> Option<String> {
        self.repo()
            .file_at(branch, path)
            .unwrap()
            .map(|b| String::from_utf8(b).unwrap())
    }

    pub fn tip(&self, branch: &str) -> GitOid {
        use reconcile_git::{GitRepo, RefName};
        self.repo()
            .resolve(&RefName::branch(branch).unwrap())
            .unwrap()
            .commit
    }
}

/// Both branches add `calc.py` with different bodies of `calc(a, b)`.
pub fn calc_fixture(source_body: &[u8], target_body: &[u8], config: ReconcileConfig) -> Fixture {
    let readme: &[u8] = b"# calc\n";
    Fixture::new(
        &[("README.md", readme)],
        &[("README.md", readme), ("calc.py", source_body)],
        &[("README.md", readme), ("calc.py", target_body)],
        config,
    )
}

/// Scenario A: pure source with 10/10 tests against impure target with 8/8.
pub fn scenario_a(config: ReconcileConfig) -> Fixture {
    let fx = calc_fixture(CALC_PURE, CALC_IMPURE, config);
    fx.store().insert(&source(), "calc.py", "calc", pure(10));
    fx.store().insert(&target(), "calc.py", "calc", impure(8));
    fx
}

/// Scenario D: the source row for `calc` cannot be read.
pub fn scenario_d(config: ReconcileConfig) -> Fixture {
    let fx = calc_fixture(CALC_PURE, CALC_IMPURE, config);
    fx.store().insert(&target(), "calc.py", "calc", impure(8));
    fx.store().set_row_unavailable(&source(), "calc.py", "calc");
    fx
}
