//! Arbor Graph - Multi-subsystem resource graph store
//!
//! This crate provides:
//! - An arena-indexed graph of resource pools and relations
//! - Per-subsystem traversal coloring with O(1) epoch reset
//! - Job release across vertex and subtree planners
//! - Generated cluster inventories for tests and demos

pub mod color;
pub mod error;
pub mod graph;
pub mod shape;

// Re-export commonly used types
pub use color::{Color, ColorEpoch, COLOR_STRIDE};
pub use error::{GraphError, Result};
pub use graph::{
    EdgeId, PoolInfra, RelationInfra, ResourceGraph, ResourcePool, ResourceRelation, Schedule,
    VertexId,
};
pub use shape::{ClusterShape, CONTAINMENT, POWER};
