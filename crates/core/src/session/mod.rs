//! Agent sessions: registry, accumulation and the single session commit.

pub mod accumulator;
pub mod commit_format;
pub mod registry;

pub use accumulator::{CommitIdentity, SessionAccumulator, SESSION_BRANCH_PREFIX};
pub use registry::SessionRegistry;
