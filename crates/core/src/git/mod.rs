//! Git operations for the primary and shadow repositories.

pub mod client;
pub mod lock;

pub use client::{GitClient, GitCommitInfo, NOTES_REF};
pub use lock::{ShadowWriter, WriterGuard};
