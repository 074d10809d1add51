//! Core data model: identifiers, conflicts and resolutions.

pub mod conflict;
pub mod resolution;
pub mod types;
