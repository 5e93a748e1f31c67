// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Matching session error type
#[derive(Error, Debug, Diagnostic)]
pub enum SchedulerError {
    /// The request cannot be embedded at the requested time
    #[error("No resources available for job {jobid}: {reason}")]
    #[diagnostic(
        code(scheduler::infeasible),
        help("Retry later, shrink the request or allow reservation with allocate-orelse-reserve")
    )]
    Infeasible {
        #[allow(unused)]
        jobid: u64,
        #[allow(unused)]
        reason: String,
    },

    /// Reservation fallback ran out of candidate start times
    #[error("No feasible start time found for job {jobid} after {at}")]
    #[diagnostic(
        code(scheduler::no_feasible_time),
        help("The request exceeds what the inventory can ever provide within the planning horizon")
    )]
    NoFeasibleTime {
        #[allow(unused)]
        jobid: u64,
        #[allow(unused)]
        at: i64,
    },

    /// Traversal invariant violated
    #[error("Internal range error: {message}")]
    #[diagnostic(
        code(scheduler::range_error),
        help("The traverser was not initialized or a score lookup went out of bounds")
    )]
    RangeError {
        #[allow(unused)]
        message: String,
    },

    /// The update phase found nothing to commit
    #[error("Commit for job {jobid} touched no resources")]
    #[diagnostic(
        code(scheduler::commit_failed),
        help("The selection belongs to an earlier generation; select again before updating")
    )]
    CommitFailed {
        #[allow(unused)]
        jobid: u64,
    },

    /// Bad traverser or policy setup
    #[error("Invalid argument: {message}")]
    #[diagnostic(
        code(scheduler::invalid_argument),
        help("{suggestion}")
    )]
    InvalidArgument {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Planner error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Planner(#[from] arbor_planner::PlannerError),

    /// Graph error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] arbor_graph::GraphError),

    /// Core error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] arbor_core::CoreError),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Create an Infeasible error
    pub fn infeasible(jobid: u64, reason: impl Into<String>) -> Self {
        Self::Infeasible {
            jobid,
            reason: reason.into(),
        }
    }

    /// Create a NoFeasibleTime error
    pub fn no_feasible_time(jobid: u64, at: i64) -> Self {
        Self::NoFeasibleTime { jobid, at }
    }

    /// Create a RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Self::RangeError {
            message: message.into(),
        }
    }

    /// Create a CommitFailed error
    pub fn commit_failed(jobid: u64) -> Self {
        Self::CommitFailed { jobid }
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: SchedulerError = arbor_planner::PlannerError::span_not_found(3).into();
        assert!(matches!(err, SchedulerError::Planner(_)));
        assert!(err.to_string().contains("Span 3"));

        let err = SchedulerError::no_feasible_time(7, 0);
        assert!(err.to_string().contains("job 7"));
    }
}
