//! Git abstraction layer for reconcile.
//!
//! This crate defines the [`GitRepo`] trait, the single interface through
//! which the merge engine reads branches and writes merge commits. The engine
//! never imports gix directly; it programs against the trait.
//!
//! # Crate layout
//!
//! - [`repo`]: the [`GitRepo`] trait definition.
//! - [`types`]: value types used in trait signatures ([`GitOid`], [`RefName`],
//!   [`FileEntry`], [`TreeEdit`], etc.).
//! - [`error`]: the [`GitError`] enum returned by all trait methods.
//! - [`memory`]: [`MemoryRepo`], an in-memory backend for tests.

pub mod error;
pub mod memory;
pub mod repo;
pub mod types;

// gix-backed implementation modules
mod checkout_impl;
mod gix_repo;
mod objects_impl;
mod refs_impl;
mod status_impl;

pub use gix_repo::GixRepo;
pub use memory::{FailOp, MemoryRepo};

pub use error::GitError;
pub use repo::GitRepo;
pub use types::{
    CommitInfo, EntryMode, FileEntry, GitOid, OidParseError, RefName, RefNameError, Snapshot,
    TreeEdit, TreeEntry,
};
