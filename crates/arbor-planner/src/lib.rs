//! Arbor Planner - Interval-based resource availability tracking
//!
//! This crate provides:
//! - A multi-resource planner tracking reserved capacity over time
//! - Feasible start time enumeration for reservation fallback
//! - Error types with miette diagnostics

pub mod error;
pub mod planner;

// Re-export commonly used types
pub use error::{PlannerError, Result};
pub use planner::{Planner, PlannerResource, Span, SpanId};
