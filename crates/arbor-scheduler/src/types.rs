use crate::{Result, SchedulerError};
use arbor_core::Jobspec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job duration used when the jobspec does not set one (12 hours)
pub const DEFAULT_DURATION: u64 = 43200;

/// Traverser settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraverserConfig {
    /// Duration applied to jobspecs without `attributes.system.duration`
    pub default_duration: u64,
    /// Record the commit trace in each match result
    pub emit_trace: bool,
}

impl Default for TraverserConfig {
    fn default() -> Self {
        Self {
            default_duration: DEFAULT_DURATION,
            emit_trace: true,
        }
    }
}

/// What to do when the request does not fit at the requested time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    /// Allocate at the requested time or fail
    #[default]
    Allocate,
    /// Fall back to a reservation at the earliest later time
    AllocateOrElseReserve,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchOp::Allocate => write!(f, "allocate"),
            MatchOp::AllocateOrElseReserve => write!(f, "allocate-orelse-reserve"),
        }
    }
}

impl FromStr for MatchOp {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allocate" => Ok(MatchOp::Allocate),
            "allocate-orelse-reserve" | "allocate_orelse_reserve" => {
                Ok(MatchOp::AllocateOrElseReserve)
            }
            other => Err(SchedulerError::invalid_argument(
                format!("unknown match operation {}", other),
                "Use allocate or allocate-orelse-reserve",
            )),
        }
    }
}

/// Per-attempt job metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    /// Allocate (tagging vertices) rather than reserve
    pub allocate: bool,
    pub jobid: u64,
    pub at: i64,
    pub duration: u64,
}

impl JobMeta {
    /// Build allocation metadata, taking the duration from the jobspec when present
    pub fn build(jobspec: &Jobspec, jobid: u64, at: i64, config: &TraverserConfig) -> Self {
        Self {
            allocate: true,
            jobid,
            at,
            duration: jobspec.duration().unwrap_or(config.default_duration),
        }
    }
}

/// Outcome of a match hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the vertex may participate
    pub accepted: bool,
    /// Reason for rejection (if any)
    pub reason: Option<String>,
}

impl Verdict {
    /// Create an accepting verdict
    pub fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    /// Create a rejecting verdict
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Committed amount of one top-level request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub count: u64,
    pub exclusive: bool,
}

/// Result of a successful select phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Overall score of the root
    pub score: i64,
    /// Count needed at the root vertex itself
    pub needs: u64,
    pub exclusive: bool,
    /// Chosen amount per top-level request
    pub resources: Vec<MatchedResource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Allocated,
    Reserved,
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStatus::Allocated => write!(f, "ALLOCATED"),
            MatchStatus::Reserved => write!(f, "RESERVED"),
        }
    }
}

/// Outcome of a committed match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub status: MatchStatus,
    pub jobid: u64,
    pub at: i64,
    pub duration: u64,
    pub needs: u64,
    pub exclusive: bool,
    pub resources: Vec<MatchedResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}
