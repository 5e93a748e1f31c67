// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the interval tracker
#[derive(Error, Debug, Diagnostic)]
pub enum PlannerError {
    /// Bad construction or query argument
    #[error("Invalid planner argument: {reason}")]
    #[diagnostic(
        code(arbor::planner::invalid_argument),
        help("Check the resource types, totals and count vector length")
    )]
    InvalidArgument {
        #[allow(unused)]
        reason: String,
    },

    /// Window outside the planner horizon
    #[error("Window [{at}, {at}+{duration}) is outside the planner horizon")]
    #[diagnostic(
        code(arbor::planner::out_of_range),
        help("Spans must start at or after the base time and end within the horizon")
    )]
    OutOfRange {
        #[allow(unused)]
        at: i64,
        #[allow(unused)]
        duration: u64,
    },

    /// Not enough capacity for a span
    #[error("Insufficient {resource_type} at {at}: requested {requested}, available {available}")]
    #[diagnostic(
        code(arbor::planner::insufficient_resources),
        help("Query availability before adding a span or pick another window")
    )]
    InsufficientResources {
        #[allow(unused)]
        resource_type: String,
        #[allow(unused)]
        requested: u64,
        #[allow(unused)]
        available: u64,
        #[allow(unused)]
        at: i64,
    },

    /// Unknown span id
    #[error("Span {span_id} not found")]
    #[diagnostic(
        code(arbor::planner::span_not_found),
        help("The span may already have been removed")
    )]
    SpanNotFound {
        #[allow(unused)]
        span_id: u64,
    },
}

/// Result type alias for planner operations
pub type Result<T> = std::result::Result<T, PlannerError>;

impl PlannerError {
    /// Create an InvalidArgument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an OutOfRange error
    pub fn out_of_range(at: i64, duration: u64) -> Self {
        Self::OutOfRange { at, duration }
    }

    /// Create an InsufficientResources error
    pub fn insufficient_resources(
        resource_type: impl Into<String>,
        requested: u64,
        available: u64,
        at: i64,
    ) -> Self {
        Self::InsufficientResources {
            resource_type: resource_type.into(),
            requested,
            available,
            at,
        }
    }

    /// Create a SpanNotFound error
    pub fn span_not_found(span_id: u64) -> Self {
        Self::SpanNotFound { span_id }
    }
}
