//! reconcile library crate.
//!
//! The `reconcile` binary is a thin CLI over [`engine::Reconciler`]. The
//! modules are public so integration tests and embedding tools can drive
//! the engine with their own [`GitRepo`] and [`store::MetadataStore`].

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod merge;
pub mod merge_state;
pub mod model;
pub mod store;
pub mod telemetry;

pub use engine::{MergeHandle, MergeStart, Reconciler, WaitPolicy};
pub use error::{AbortReason, MergeError, MergeWarning};
pub use reconcile_git::{GitRepo, GixRepo, MemoryRepo};
pub use store::json::JsonMetadataStore;
pub use store::memory::MemoryMetadataStore;
