//! shadowsync core library.
//!
//! Keeps a shadow git repository content-identical to a primary working
//! tree, maps shadow commits to primary commits, folds each agent session
//! into a single annotated shadow commit, and detects and resolves conflicts
//! between human and agent edits.

pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod errors;
pub mod file_policy;
pub mod fsutil;
pub mod git;
pub mod hasher;
pub mod mapper;
pub mod models;
pub mod session;
pub mod synchronizer;
pub mod transcript;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use engine::{ApplyReport, EngineStatus, RevertReport, ShadowEngine, ShadowMatch, SyncReport};
pub use errors::CoreError;
pub use mapper::CommitMapper;
pub use synchronizer::DualTreeSynchronizer;
