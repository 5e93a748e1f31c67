use crate::color::{Color, ColorEpoch};
use crate::{GraphError, Result};
use arbor_planner::{Planner, SpanId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Index, IndexMut};
use tracing::debug;
use uuid::Uuid;

/// Stable handle of a resource pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub usize);

/// Stable handle of a resource relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub usize);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Per-vertex scheduling state
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Jobs holding this vertex exclusively
    pub tags: BTreeSet<u64>,
    /// Job id to span in `plans` for allocations
    pub allocations: BTreeMap<u64, SpanId>,
    /// Job id to span in `plans` for reservations
    pub reservations: BTreeMap<u64, SpanId>,
    /// Tracker for the vertex's own capacity
    pub plans: Planner,
}

/// Traversal bookkeeping of a vertex
#[derive(Debug, Clone, Default)]
pub struct PoolInfra {
    /// Job id to (subsystem, span) in the subtree planner
    pub job2span: BTreeMap<u64, (String, SpanId)>,
    /// Per-subsystem tracker over descendant resource types
    pub subplans: BTreeMap<String, Planner>,
    /// Per-subsystem stored color value
    pub colors: BTreeMap<String, u64>,
}

/// A schedulable resource pool
#[derive(Debug, Clone)]
pub struct ResourcePool {
    pub resource_type: String,
    pub basename: String,
    pub name: String,
    pub id: i64,
    pub uuid: Uuid,
    pub size: u64,
    pub unit: String,
    /// Per-subsystem path of the vertex
    pub paths: BTreeMap<String, String>,
    pub properties: BTreeMap<String, String>,
    pub schedule: Schedule,
    pub idata: PoolInfra,
}

impl ResourcePool {
    /// Create a pool of `size` units whose own planner spans `[base_time, base_time + horizon)`
    pub fn new(
        resource_type: impl Into<String>,
        basename: impl Into<String>,
        id: i64,
        size: u64,
        base_time: i64,
        horizon: u64,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        let basename = basename.into();
        let plans = Planner::new(base_time, horizon, &[(resource_type.as_str(), size)])?;

        Ok(Self {
            name: format!("{}{}", basename, id),
            resource_type,
            basename,
            id,
            uuid: Uuid::new_v4(),
            size,
            unit: String::new(),
            paths: BTreeMap::new(),
            properties: BTreeMap::new(),
            schedule: Schedule {
                tags: BTreeSet::new(),
                allocations: BTreeMap::new(),
                reservations: BTreeMap::new(),
                plans,
            },
            idata: PoolInfra::default(),
        })
    }

    /// Whether the vertex takes part in `subsystem`
    pub fn in_subsystem(&self, subsystem: &str) -> bool {
        self.paths.contains_key(subsystem)
    }
}

/// Per-generation decision written onto an edge by the select phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationInfra {
    pub needs: u64,
    pub exclusive: bool,
    /// Generation the decision belongs to
    pub stamp: u64,
}

/// A directed relation between two pools
#[derive(Debug, Clone)]
pub struct ResourceRelation {
    pub source: VertexId,
    pub target: VertexId,
    /// Subsystem to relation name (e.g. containment → contains)
    pub member_of: BTreeMap<String, String>,
    pub idata: RelationInfra,
}

impl ResourceRelation {
    /// Relation name of this edge in `subsystem`
    pub fn relation(&self, subsystem: &str) -> Option<&str> {
        self.member_of.get(subsystem).map(String::as_str)
    }
}

/// Arena-backed multi-subsystem resource graph
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    vertices: Vec<ResourcePool>,
    edges: Vec<ResourceRelation>,
    out_edges: Vec<Vec<EdgeId>>,
    roots: BTreeMap<String, VertexId>,
    base_time: i64,
    horizon: u64,
}

impl ResourceGraph {
    /// Create an empty graph whose planners span `[base_time, base_time + horizon)`
    pub fn new(base_time: i64, horizon: u64) -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            out_edges: Vec::new(),
            roots: BTreeMap::new(),
            base_time,
            horizon,
        }
    }

    pub fn base_time(&self) -> i64 {
        self.base_time
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Add a pool of `size` units of `resource_type`
    pub fn add_vertex(
        &mut self,
        resource_type: &str,
        basename: &str,
        id: i64,
        size: u64,
    ) -> Result<VertexId> {
        let pool = ResourcePool::new(
            resource_type,
            basename,
            id,
            size,
            self.base_time,
            self.horizon,
        )?;
        let v = VertexId(self.vertices.len());
        self.vertices.push(pool);
        self.out_edges.push(Vec::new());
        Ok(v)
    }

    /// Relate `source` to `target` in `subsystem`.
    ///
    /// An existing `source → target` edge gains the membership instead of a
    /// parallel edge being created. Both endpoints join the subsystem; the
    /// target's path extends the source's.
    pub fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        subsystem: &str,
        relation: &str,
    ) -> Result<EdgeId> {
        self.check_vertex(source)?;
        self.check_vertex(target)?;

        let existing = self.out_edges[source.0]
            .iter()
            .copied()
            .find(|e| self.edges[e.0].target == target);
        let e = match existing {
            Some(e) => e,
            None => {
                let e = EdgeId(self.edges.len());
                self.edges.push(ResourceRelation {
                    source,
                    target,
                    member_of: BTreeMap::new(),
                    idata: RelationInfra::default(),
                });
                self.out_edges[source.0].push(e);
                e
            }
        };
        self.edges[e.0]
            .member_of
            .insert(subsystem.to_string(), relation.to_string());

        let source_pool = &mut self.vertices[source.0];
        let source_name = source_pool.name.clone();
        let source_path = source_pool
            .paths
            .entry(subsystem.to_string())
            .or_insert_with(|| format!("/{}", source_name))
            .clone();
        let target_pool = &mut self.vertices[target.0];
        let target_name = target_pool.name.clone();
        target_pool
            .paths
            .entry(subsystem.to_string())
            .or_insert_with(|| format!("{}/{}", source_path, target_name));
        Ok(e)
    }

    /// Register the root of a subsystem
    pub fn set_root(&mut self, subsystem: &str, v: VertexId) -> Result<()> {
        self.check_vertex(v)?;
        let pool = &mut self.vertices[v.0];
        let path = format!("/{}", pool.name);
        pool.paths.insert(subsystem.to_string(), path);
        self.roots.insert(subsystem.to_string(), v);
        Ok(())
    }

    pub fn root(&self, subsystem: &str) -> Option<VertexId> {
        self.roots.get(subsystem).copied()
    }

    /// Subsystems that have a registered root
    pub fn subsystems(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    fn check_vertex(&self, v: VertexId) -> Result<()> {
        if v.0 < self.vertices.len() {
            Ok(())
        } else {
            Err(GraphError::vertex_not_found(v.0))
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn vertex(&self, v: VertexId) -> Option<&ResourcePool> {
        self.vertices.get(v.0)
    }

    pub fn vertex_mut(&mut self, v: VertexId) -> Option<&mut ResourcePool> {
        self.vertices.get_mut(v.0)
    }

    pub fn edge(&self, e: EdgeId) -> Option<&ResourceRelation> {
        self.edges.get(e.0)
    }

    pub fn edge_mut(&mut self, e: EdgeId) -> Option<&mut ResourceRelation> {
        self.edges.get_mut(e.0)
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> {
        (0..self.vertices.len()).map(VertexId)
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> {
        (0..self.edges.len()).map(EdgeId)
    }

    /// Out-edges of `v` in declared order
    pub fn out_edges(&self, v: VertexId) -> &[EdgeId] {
        self.out_edges.get(v.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First vertex with the given name
    pub fn find(&self, name: &str) -> Option<VertexId> {
        self.vertices
            .iter()
            .position(|p| p.name == name)
            .map(VertexId)
    }

    /// Total size per resource type across all pools
    pub fn type_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for pool in &self.vertices {
            *totals.entry(pool.resource_type.clone()).or_insert(0) += pool.size;
        }
        totals
    }

    /// Set the color of `v` in `subsystem` for the given epoch
    pub fn mark(&mut self, v: VertexId, subsystem: &str, epoch: &ColorEpoch, color: Color) {
        if let Some(pool) = self.vertices.get_mut(v.0) {
            pool.idata
                .colors
                .insert(subsystem.to_string(), epoch.value(color));
        }
    }

    /// Whether `v` has `color` in `subsystem` for the given epoch
    pub fn is(&self, v: VertexId, subsystem: &str, epoch: &ColorEpoch, color: Color) -> bool {
        let stored = self
            .vertices
            .get(v.0)
            .and_then(|p| p.idata.colors.get(subsystem).copied())
            .unwrap_or(0);
        epoch.classify(stored) == color
    }

    /// Highest generation stamp recorded on any edge
    pub fn max_stamp(&self) -> u64 {
        self.edges.iter().map(|e| e.idata.stamp).max().unwrap_or(0)
    }

    /// Highest color value stored on any vertex
    pub fn max_color(&self) -> u64 {
        self.vertices
            .iter()
            .flat_map(|p| p.idata.colors.values().copied())
            .max()
            .unwrap_or(0)
    }

    /// Release everything `jobid` holds; returns the number of spans removed
    pub fn remove_job(&mut self, jobid: u64) -> Result<usize> {
        let mut released = 0;
        for pool in &mut self.vertices {
            let schedule = &mut pool.schedule;
            schedule.tags.remove(&jobid);
            if let Some(span) = schedule.allocations.remove(&jobid) {
                schedule.plans.remove_span(span)?;
                released += 1;
            }
            if let Some(span) = schedule.reservations.remove(&jobid) {
                schedule.plans.remove_span(span)?;
                released += 1;
            }
            if let Some((subsystem, span)) = pool.idata.job2span.remove(&jobid) {
                if let Some(subplan) = pool.idata.subplans.get_mut(&subsystem) {
                    subplan.remove_span(span)?;
                    released += 1;
                }
            }
        }
        debug!("Released {} spans held by job {}", released, jobid);
        Ok(released)
    }
}

impl Index<VertexId> for ResourceGraph {
    type Output = ResourcePool;

    fn index(&self, v: VertexId) -> &ResourcePool {
        &self.vertices[v.0]
    }
}

impl IndexMut<VertexId> for ResourceGraph {
    fn index_mut(&mut self, v: VertexId) -> &mut ResourcePool {
        &mut self.vertices[v.0]
    }
}

impl Index<EdgeId> for ResourceGraph {
    type Output = ResourceRelation;

    fn index(&self, e: EdgeId) -> &ResourceRelation {
        &self.edges[e.0]
    }
}

impl IndexMut<EdgeId> for ResourceGraph {
    fn index_mut(&mut self, e: EdgeId) -> &mut ResourceRelation {
        &mut self.edges[e.0]
    }
}
