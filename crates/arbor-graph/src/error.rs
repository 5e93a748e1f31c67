// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use arbor_planner::PlannerError;
use miette::Diagnostic;
use thiserror::Error;

/// Resource graph errors
#[derive(Error, Debug, Diagnostic)]
pub enum GraphError {
    /// Vertex handle does not belong to this graph
    #[error("Vertex {id} not found")]
    #[diagnostic(
        code(arbor::graph::vertex_not_found),
        help("Use a vertex id returned by add_vertex on the same graph")
    )]
    VertexNotFound {
        #[allow(unused)]
        id: usize,
    },

    /// No root registered for a subsystem
    #[error("Subsystem {subsystem} has no root")]
    #[diagnostic(
        code(arbor::graph::subsystem_not_found),
        help("Register the subsystem root with set_root before matching")
    )]
    SubsystemNotFound {
        #[allow(unused)]
        subsystem: String,
    },

    /// Bad inventory shape
    #[error("Invalid shape: {reason}")]
    #[diagnostic(
        code(arbor::graph::invalid_shape),
        help("Every level of the shape needs a count of at least one")
    )]
    InvalidShape {
        #[allow(unused)]
        reason: String,
    },

    /// Planner failure while building or releasing schedules
    #[error(transparent)]
    #[diagnostic(transparent)]
    Planner(#[from] PlannerError),
}

/// Result type alias for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    /// Create a VertexNotFound error
    pub fn vertex_not_found(id: usize) -> Self {
        Self::VertexNotFound { id }
    }

    /// Create a SubsystemNotFound error
    pub fn subsystem_not_found(subsystem: impl Into<String>) -> Self {
        Self::SubsystemNotFound {
            subsystem: subsystem.into(),
        }
    }

    /// Create an InvalidShape error
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape {
            reason: reason.into(),
        }
    }
}
