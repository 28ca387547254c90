//! Conflict detection, three-way merging, and AI-assisted resolution.
//!
//! 1. **Detection** classifies how human and agent change sets collide.
//! 2. **Merging** attempts line-level three-way merges, human side first.
//! 3. **Resolution** delegates overlapping conflicts to an external agent
//!    under a deadline and stages validated proposals for human review.

pub mod agent;
pub mod detector;
pub mod merger;
pub mod resolver;
pub mod syntax;

pub use agent::{AgentRequest, CliAgent, ReasoningAgent};
pub use detector::{ConflictDetector, ConflictRecord, Severity, Strategy};
pub use merger::{MergeResult, Merger};
pub use resolver::{ConflictResolver, ResolutionAttempt, ResolutionRequest};
