use crate::score::{ScoreAggregator, MATCH_MET, MATCH_UNMET};
use crate::types::Verdict;
use crate::{Result, SchedulerError};
use arbor_core::{CountOperator, ResourceRequest};
use arbor_graph::{ResourceGraph, VertexId, CONTAINMENT, POWER};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Relation filter admitting every relation of a subsystem
pub const ANY_RELATION: &str = "*";

/// Subsystem selection and demand filtering shared by all policies
#[derive(Debug, Clone, Default)]
pub struct MatcherData {
    name: String,
    subsystems: Vec<String>,
    relations: BTreeMap<String, BTreeSet<String>>,
    /// Resource types whose demand is aggregated per subsystem
    pub sdau_resource_types: BTreeMap<String, BTreeSet<String>>,
}

impl MatcherData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Containment-only selection aggregating the usual compute types
    pub fn containment(name: impl Into<String>) -> Self {
        let mut data = Self::new(name);
        data.add_subsystem(CONTAINMENT, ANY_RELATION);
        data.set_sdau_resource_types(
            CONTAINMENT,
            ["cluster", "rack", "node", "socket", "core", "gpu", "memory"],
        );
        data
    }

    /// Add the power subsystem as an auxiliary walked along `draws_from`
    pub fn with_power(mut self) -> Self {
        self.add_subsystem(POWER, "draws_from");
        self.set_sdau_resource_types(POWER, ["pdu", "panel"]);
        self
    }

    /// Select a subsystem; the first one added is dominant. Returns false if
    /// the subsystem was already selected.
    pub fn add_subsystem(&mut self, subsystem: &str, relation: &str) -> bool {
        if self.relations.contains_key(subsystem) {
            return false;
        }
        self.subsystems.push(subsystem.to_string());
        self.relations
            .entry(subsystem.to_string())
            .or_default()
            .insert(relation.to_string());
        true
    }

    pub fn set_sdau_resource_types<I, S>(&mut self, subsystem: &str, types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sdau_resource_types
            .insert(subsystem.to_string(), types.into_iter().map(Into::into).collect());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Selected subsystems, dominant first
    pub fn subsystems(&self) -> &[String] {
        &self.subsystems
    }

    pub fn dom_subsystem(&self) -> Option<&str> {
        self.subsystems.first().map(String::as_str)
    }

    /// Whether an edge of `relation` takes part in `subsystem`
    pub fn admits(&self, subsystem: &str, relation: &str) -> bool {
        self.relations
            .get(subsystem)
            .is_some_and(|r| r.contains(ANY_RELATION) || r.contains(relation))
    }

    /// Whether demand for `resource_type` is aggregated in `subsystem`
    pub fn is_sdau(&self, subsystem: &str, resource_type: &str) -> bool {
        self.sdau_resource_types
            .get(subsystem)
            .is_some_and(|types| types.contains(resource_type))
    }

    /// Concrete count to allocate given `qc` qualified units, or 0 if infeasible
    pub fn select_count(&self, request: &ResourceRequest, qc: u64) -> u64 {
        let requested = &request.count;
        let mut count = requested.max;
        if count < requested.min || requested.min > qc {
            return 0;
        }
        while count > qc {
            count = match requested.operator {
                CountOperator::Add if requested.operand > 0 => {
                    count.saturating_sub(requested.operand)
                }
                CountOperator::Add => return 0,
                CountOperator::Mul if requested.operand > 1 => count / requested.operand,
                CountOperator::Mul => return 0,
                CountOperator::Pow => prev_pwr(requested.min, count, requested.operand),
            };
        }
        if count >= requested.min {
            count
        } else {
            0
        }
    }
}

// Largest value below `count` reachable from `min` by squaring `operand` times per step
fn prev_pwr(min: u64, count: u64, operand: u64) -> u64 {
    let mut i = min;
    let mut sol = 0;
    while i < count {
        sol = i;
        for _ in 0..operand {
            i = i.saturating_mul(i);
        }
        if i <= sol {
            break;
        }
    }
    sol
}

/// Callbacks invoked by the traverser at fixed points of a walk.
///
/// Every hook defaults to accepting without touching the scores. A rejecting
/// verdict prunes the vertex (or fails the whole request for
/// `dom_finish_graph`), it never aborts the session.
pub trait MatchPolicy: Send + Sync {
    /// Subsystem selection of this policy
    fn data(&self) -> &MatcherData;

    /// Name of the policy
    fn name(&self) -> &str {
        self.data().name()
    }

    fn select_count(&self, request: &ResourceRequest, qc: u64) -> u64 {
        self.data().select_count(request, qc)
    }

    /// Pre-order visit on the dominant subsystem
    fn dom_discover_vtx(
        &self,
        _u: VertexId,
        _subsystem: &str,
        _resources: &[ResourceRequest],
        _graph: &ResourceGraph,
    ) -> Verdict {
        Verdict::accept()
    }

    /// Post-order visit on the dominant subsystem with the subtree's scores
    fn dom_finish_vtx(
        &self,
        _u: VertexId,
        _subsystem: &str,
        _resources: &[ResourceRequest],
        _graph: &ResourceGraph,
        _dfu: &mut ScoreAggregator,
    ) -> Verdict {
        Verdict::accept()
    }

    /// Pre-visit of the up-walk on an auxiliary subsystem
    fn aux_discover_vtx(
        &self,
        _u: VertexId,
        _subsystem: &str,
        _resources: &[ResourceRequest],
        _graph: &ResourceGraph,
    ) -> Verdict {
        Verdict::accept()
    }

    /// Post-visit of the up-walk on an auxiliary subsystem
    fn aux_finish_vtx(
        &self,
        _u: VertexId,
        _subsystem: &str,
        _resources: &[ResourceRequest],
        _graph: &ResourceGraph,
        _dfu: &mut ScoreAggregator,
    ) -> Verdict {
        Verdict::accept()
    }

    /// Called once the candidates of a slot pattern are scored
    fn dom_finish_slot(&self, _subsystem: &str, _dfu: &mut ScoreAggregator) -> Verdict {
        Verdict::accept()
    }

    /// Called once after the whole dominant walk with the root's scores
    fn dom_finish_graph(
        &self,
        _subsystem: &str,
        _resources: &[ResourceRequest],
        _graph: &ResourceGraph,
        _dfu: &mut ScoreAggregator,
    ) -> Verdict {
        Verdict::accept()
    }
}

/// Narrow the children of the request matching `u` to their selected counts
fn finish_vtx(
    data: &MatcherData,
    u: VertexId,
    subsystem: &str,
    resources: &[ResourceRequest],
    graph: &ResourceGraph,
    dfu: &mut ScoreAggregator,
) -> Verdict {
    let vertex_type = &graph[u].resource_type;
    for resource in resources.iter().filter(|r| &r.resource_type == vertex_type) {
        for child in &resource.with {
            let qc = dfu.qualified_count(subsystem, &child.resource_type);
            let count = data.select_count(child, qc);
            if count == 0 {
                return Verdict::reject(format!(
                    "{} offers {} {}, not enough",
                    graph[u].name, qc, child.resource_type
                ));
            }
            dfu.choose_accum_best_k(subsystem, &child.resource_type, count);
        }
    }
    Verdict::accept()
}

fn finish_slot(data: &MatcherData, dfu: &mut ScoreAggregator) -> Verdict {
    for subsystem in data.subsystems() {
        for resource_type in dfu.resource_types(subsystem) {
            dfu.choose_accum_all(subsystem, &resource_type);
        }
    }
    Verdict::accept()
}

fn finish_graph(
    data: &MatcherData,
    subsystem: &str,
    resources: &[ResourceRequest],
    dfu: &mut ScoreAggregator,
) -> Verdict {
    for resource in resources {
        let qc = dfu.qualified_count(subsystem, &resource.resource_type);
        let count = data.select_count(resource, qc);
        if count == 0 {
            dfu.set_overall_score(MATCH_UNMET);
            return Verdict::reject(format!(
                "only {} {} qualified",
                qc, resource.resource_type
            ));
        }
        dfu.choose_accum_best_k(subsystem, &resource.resource_type, count);
    }
    dfu.set_overall_score(MATCH_MET);
    Verdict::accept()
}

/// Prefers vertices with higher ids among equally qualified candidates
#[derive(Debug, Clone)]
pub struct HighIdFirst {
    data: MatcherData,
}

impl HighIdFirst {
    pub fn new() -> Self {
        Self::with_data(MatcherData::containment("high"))
    }

    pub fn with_data(data: MatcherData) -> Self {
        Self { data }
    }
}

impl Default for HighIdFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchPolicy for HighIdFirst {
    fn data(&self) -> &MatcherData {
        &self.data
    }

    fn dom_finish_vtx(
        &self,
        u: VertexId,
        subsystem: &str,
        resources: &[ResourceRequest],
        graph: &ResourceGraph,
        dfu: &mut ScoreAggregator,
    ) -> Verdict {
        let verdict = finish_vtx(&self.data, u, subsystem, resources, graph, dfu);
        if verdict.accepted {
            dfu.set_overall_score(MATCH_MET.saturating_add(graph[u].id).saturating_add(1));
        } else {
            dfu.set_overall_score(MATCH_UNMET);
        }
        verdict
    }

    fn dom_finish_slot(&self, _subsystem: &str, dfu: &mut ScoreAggregator) -> Verdict {
        finish_slot(&self.data, dfu)
    }

    fn dom_finish_graph(
        &self,
        subsystem: &str,
        resources: &[ResourceRequest],
        _graph: &ResourceGraph,
        dfu: &mut ScoreAggregator,
    ) -> Verdict {
        finish_graph(&self.data, subsystem, resources, dfu)
    }
}

/// Prefers vertices with lower ids among equally qualified candidates
#[derive(Debug, Clone)]
pub struct LowIdFirst {
    data: MatcherData,
}

impl LowIdFirst {
    pub fn new() -> Self {
        Self::with_data(MatcherData::containment("low"))
    }

    pub fn with_data(data: MatcherData) -> Self {
        Self { data }
    }
}

impl Default for LowIdFirst {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchPolicy for LowIdFirst {
    fn data(&self) -> &MatcherData {
        &self.data
    }

    fn dom_finish_vtx(
        &self,
        u: VertexId,
        subsystem: &str,
        resources: &[ResourceRequest],
        graph: &ResourceGraph,
        dfu: &mut ScoreAggregator,
    ) -> Verdict {
        let verdict = finish_vtx(&self.data, u, subsystem, resources, graph, dfu);
        if verdict.accepted {
            let rank = (i64::from(i32::MAX) - graph[u].id).max(0);
            dfu.set_overall_score(MATCH_MET.saturating_add(1).saturating_add(rank));
        } else {
            dfu.set_overall_score(MATCH_UNMET);
        }
        verdict
    }

    fn dom_finish_slot(&self, _subsystem: &str, dfu: &mut ScoreAggregator) -> Verdict {
        finish_slot(&self.data, dfu)
    }

    fn dom_finish_graph(
        &self,
        subsystem: &str,
        resources: &[ResourceRequest],
        _graph: &ResourceGraph,
        dfu: &mut ScoreAggregator,
    ) -> Verdict {
        finish_graph(&self.data, subsystem, resources, dfu)
    }
}

/// Look up a policy by name, using `data` for its subsystem selection
pub fn policy_by_name(name: &str, data: MatcherData) -> Result<Box<dyn MatchPolicy>> {
    debug!("Selecting match policy {}", name);
    match name {
        "high" | "high_id_first" => Ok(Box::new(HighIdFirst::with_data(data))),
        "low" | "low_id_first" => Ok(Box::new(LowIdFirst::with_data(data))),
        other => Err(SchedulerError::invalid_argument(
            format!("unknown match policy {}", other),
            "Use one of: high, low",
        )),
    }
}

/// The policy used when none is configured
pub fn default_policy() -> Box<dyn MatchPolicy> {
    Box::new(HighIdFirst::new())
}
