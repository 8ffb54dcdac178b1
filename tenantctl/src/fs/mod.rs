//! Filesystem helpers: tree walking, metadata preservation and mirroring.

pub mod metadata;
pub mod mirror;
pub mod walker;
