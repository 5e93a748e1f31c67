use crate::graph::{ResourceGraph, VertexId};
use crate::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Containment subsystem name
pub const CONTAINMENT: &str = "containment";
/// Power distribution subsystem name
pub const POWER: &str = "power";

/// Regular cluster layout used to generate an inventory.
///
/// Builds `cluster → rack → node → socket → {core, memory}` under
/// [`CONTAINMENT`]. With `power` set, each node also draws from its rack's
/// pdu and every pdu from a single panel under [`POWER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterShape {
    pub racks: u64,
    pub nodes_per_rack: u64,
    pub sockets_per_node: u64,
    pub cores_per_socket: u64,
    /// Memory pool size per socket; zero omits memory vertices
    pub memory_per_socket: u64,
    pub power: bool,
}

impl Default for ClusterShape {
    fn default() -> Self {
        Self {
            racks: 1,
            nodes_per_rack: 2,
            sockets_per_node: 2,
            cores_per_socket: 4,
            memory_per_socket: 16,
            power: false,
        }
    }
}

#[derive(Default)]
struct Numbering(BTreeMap<&'static str, i64>);

impl Numbering {
    fn next(&mut self, resource_type: &'static str) -> i64 {
        let n = self.0.entry(resource_type).or_insert(0);
        let id = *n;
        *n += 1;
        id
    }
}

impl ClusterShape {
    pub fn validate(&self) -> Result<()> {
        for (level, count) in [
            ("racks", self.racks),
            ("nodes_per_rack", self.nodes_per_rack),
            ("sockets_per_node", self.sockets_per_node),
            ("cores_per_socket", self.cores_per_socket),
        ] {
            if count == 0 {
                return Err(GraphError::invalid_shape(format!(
                    "{} must be at least 1",
                    level
                )));
            }
        }
        Ok(())
    }

    fn add(
        graph: &mut ResourceGraph,
        ids: &mut Numbering,
        parent: VertexId,
        resource_type: &'static str,
        size: u64,
    ) -> Result<VertexId> {
        let v = graph.add_vertex(resource_type, resource_type, ids.next(resource_type), size)?;
        graph.add_edge(parent, v, CONTAINMENT, "contains")?;
        Ok(v)
    }

    /// Generate the inventory with planners spanning `[base_time, base_time + horizon)`
    pub fn build(&self, base_time: i64, horizon: u64) -> Result<ResourceGraph> {
        self.validate()?;

        let mut graph = ResourceGraph::new(base_time, horizon);
        let mut ids = Numbering::default();

        let cluster = graph.add_vertex("cluster", "cluster", ids.next("cluster"), 1)?;
        graph.set_root(CONTAINMENT, cluster)?;

        let panel = if self.power {
            let panel = graph.add_vertex("panel", "panel", ids.next("panel"), 1)?;
            graph.set_root(POWER, panel)?;
            Some(panel)
        } else {
            None
        };

        for _ in 0..self.racks {
            let rack = Self::add(&mut graph, &mut ids, cluster, "rack", 1)?;
            let pdu = match panel {
                Some(panel) => {
                    let pdu = graph.add_vertex("pdu", "pdu", ids.next("pdu"), 1)?;
                    graph.add_edge(pdu, panel, POWER, "draws_from")?;
                    Some(pdu)
                }
                None => None,
            };

            for _ in 0..self.nodes_per_rack {
                let node = Self::add(&mut graph, &mut ids, rack, "node", 1)?;
                if let Some(pdu) = pdu {
                    graph.add_edge(node, pdu, POWER, "draws_from")?;
                }
                for _ in 0..self.sockets_per_node {
                    let socket = Self::add(&mut graph, &mut ids, node, "socket", 1)?;
                    for _ in 0..self.cores_per_socket {
                        Self::add(&mut graph, &mut ids, socket, "core", 1)?;
                    }
                    if self.memory_per_socket > 0 {
                        Self::add(&mut graph, &mut ids, socket, "memory", self.memory_per_socket)?;
                    }
                }
            }
        }

        info!(
            "Built inventory with {} vertices and {} edges",
            graph.vertex_count(),
            graph.edge_count()
        );
        Ok(graph)
    }
}
