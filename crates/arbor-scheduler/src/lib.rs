//! Arbor Scheduler - Depth-first-and-up resource matching
//!
//! This crate provides:
//! - The DFU traverser (select and update phases)
//! - Match policies with pluggable visit hooks (high/low id first)
//! - Score aggregation and best-k candidate selection
//! - Allocate and allocate-or-else-reserve operations

pub mod error;
pub mod policy;
pub mod score;
pub mod traverser;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SchedulerError};
pub use policy::{
    default_policy, policy_by_name, HighIdFirst, LowIdFirst, MatchPolicy, MatcherData,
    ANY_RELATION,
};
pub use score::{EvalEdge, EvalGroup, ScoreAggregator, MATCH_MET, MATCH_UNMET};
pub use traverser::DfuTraverser;
pub use types::{
    JobMeta, MatchOp, MatchResult, MatchStatus, MatchedResource, Selection, TraverserConfig,
    Verdict, DEFAULT_DURATION,
};
