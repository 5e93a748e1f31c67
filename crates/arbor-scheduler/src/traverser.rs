use crate::policy::MatchPolicy;
use crate::score::{EvalEdge, EvalGroup, ScoreAggregator, MATCH_MET};
use crate::types::{
    JobMeta, MatchOp, MatchResult, MatchStatus, MatchedResource, Selection, TraverserConfig,
};
use crate::{Result, SchedulerError};
use arbor_core::{Jobspec, ResourceRequest, SLOT_TYPE};
use arbor_graph::{
    Color, ColorEpoch, EdgeId, GraphError, RelationInfra, ResourceGraph, VertexId,
};
use arbor_planner::Planner;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// How the request relates to the visited vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    /// A slot pattern fits directly below the vertex
    Slot,
    /// The vertex has the type of one of the requests
    Resource,
    /// No request applies here; children see the same requests
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Depth-first down the dominant subsystem
    Down,
    /// Up an auxiliary subsystem towards its root
    Up,
}

/// What a matched vertex hands to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Found {
    score: i64,
    avail: u64,
    exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pruned,
    Matched(Found),
}

/// Depth-first-and-up matcher over a resource graph.
///
/// The traverser holds the graph mutably for its whole lifetime, so at most
/// one matching session runs against a graph at a time. Its generation and
/// color base continue from the highest values already recorded in the graph.
pub struct DfuTraverser<'a> {
    graph: &'a mut ResourceGraph,
    policy: &'a dyn MatchPolicy,
    config: TraverserConfig,
    generation: u64,
    epoch: ColorEpoch,
    level: usize,
    primed: bool,
    trace: Vec<String>,
}

impl<'a> DfuTraverser<'a> {
    /// Create a traverser; the policy's dominant subsystem must have a root
    pub fn new(
        graph: &'a mut ResourceGraph,
        policy: &'a dyn MatchPolicy,
        config: TraverserConfig,
    ) -> Result<Self> {
        let dom = policy.data().dom_subsystem().ok_or_else(|| {
            SchedulerError::invalid_argument(
                format!("policy {} selects no subsystem", policy.name()),
                "Add a dominant subsystem to the policy's matcher data",
            )
        })?;
        if graph.root(dom).is_none() {
            return Err(GraphError::subsystem_not_found(dom).into());
        }

        let generation = graph.max_stamp();
        let epoch = ColorEpoch::new(graph.max_color());
        Ok(Self {
            graph,
            policy,
            config,
            generation,
            epoch,
            level: 0,
            primed: false,
            trace: Vec::new(),
        })
    }

    pub fn graph(&self) -> &ResourceGraph {
        self.graph
    }

    /// Current match generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Commit trace of the last update phase
    pub fn trace(&self) -> &[String] {
        &self.trace
    }

    fn dom(&self) -> &'a str {
        let policy: &'a dyn MatchPolicy = self.policy;
        policy.data().dom_subsystem().unwrap_or_default()
    }

    fn subsystems(&self) -> &'a [String] {
        let policy: &'a dyn MatchPolicy = self.policy;
        policy.data().subsystems()
    }

    fn root_of(&self, subsystem: &str) -> Result<VertexId> {
        self.graph
            .root(subsystem)
            .ok_or_else(|| GraphError::subsystem_not_found(subsystem).into())
    }

    /// Start a new match generation with fresh colors
    pub fn tick(&mut self) {
        self.generation += 1;
        self.epoch.reset();
    }

    fn tick_color_base(&mut self) {
        self.epoch.reset();
    }

    fn accum_if(
        &self,
        subsystem: &str,
        resource_type: &str,
        count: u64,
        accum: &mut BTreeMap<String, u64>,
    ) {
        if self.policy.data().is_sdau(subsystem, resource_type) {
            *accum.entry(resource_type.to_string()).or_insert(0) += count;
        }
    }

    fn in_subsystem(&self, e: EdgeId, subsystem: &str) -> bool {
        self.graph[e]
            .relation(subsystem)
            .is_some_and(|relation| self.policy.data().admits(subsystem, relation))
    }

    fn stop_explore(&self, e: EdgeId, subsystem: &str) -> bool {
        let target = self.graph[e].target;
        !self.graph.is(target, subsystem, &self.epoch, Color::White)
    }

    /// Out-edges of `u` taking part in `subsystem`
    fn subsystem_edges(&self, u: VertexId, subsystem: &str) -> Vec<EdgeId> {
        self.graph
            .out_edges(u)
            .iter()
            .copied()
            .filter(|&e| self.in_subsystem(e, subsystem))
            .collect()
    }

    /// Build every subsystem's subtree planners. Subsystems whose root
    /// already carries one keep their existing planners and spans.
    pub fn initialize(&mut self) -> Result<()> {
        for subsystem in self.subsystems() {
            let root = self.root_of(subsystem)?;
            if self.graph[root].idata.subplans.contains_key(subsystem) {
                debug!("Subsystem {} already primed", subsystem);
                continue;
            }
            self.tick_color_base();
            let mut to_parent = BTreeMap::new();
            self.prime_vertex(subsystem, root, &mut to_parent)?;
            info!("Primed subsystem {} with {:?}", subsystem, to_parent);
        }
        self.primed = true;
        Ok(())
    }

    fn prime_vertex(
        &mut self,
        subsystem: &str,
        u: VertexId,
        to_parent: &mut BTreeMap<String, u64>,
    ) -> Result<()> {
        self.graph.mark(u, subsystem, &self.epoch, Color::Gray);
        let (resource_type, size) = {
            let pool = &self.graph[u];
            (pool.resource_type.clone(), pool.size)
        };
        self.accum_if(subsystem, &resource_type, size, to_parent);

        let mut dfv = BTreeMap::new();
        for e in self.subsystem_edges(u, subsystem) {
            if self.stop_explore(e, subsystem) {
                continue;
            }
            let target = self.graph[e].target;
            self.prime_vertex(subsystem, target, &mut dfv)?;
        }

        for (t, c) in &dfv {
            self.accum_if(subsystem, t, *c, to_parent);
        }
        if !dfv.is_empty() {
            let totals: Vec<(&str, u64)> = dfv.iter().map(|(t, c)| (t.as_str(), *c)).collect();
            let plans = &self.graph[u].schedule.plans;
            let subplan = Planner::new(plans.base_time(), plans.horizon(), &totals)?;
            self.graph[u]
                .idata
                .subplans
                .insert(subsystem.to_string(), subplan);
        }
        self.graph.mark(u, subsystem, &self.epoch, Color::Black);
        Ok(())
    }

    fn prime_requests(&self, resources: &mut [ResourceRequest], to_parent: &mut BTreeMap<String, u64>) {
        let dom = self.dom();
        for resource in resources {
            // demand counts the minimum, so subtrees meeting it are never pruned
            self.accum_if(dom, &resource.resource_type, resource.count.min, to_parent);
            let mut aggregate = BTreeMap::new();
            self.prime_requests(&mut resource.with, &mut aggregate);
            for (t, c) in &aggregate {
                self.accum_if(dom, t, c.saturating_mul(resource.count.min), to_parent);
            }
            resource.aggregate = aggregate;
        }
    }

    /// Fill in each request node's descendant demand; returns the whole
    /// request's demand
    pub fn prime(&self, jobspec: &mut Jobspec) -> BTreeMap<String, u64> {
        let mut total = BTreeMap::new();
        self.prime_requests(&mut jobspec.resources, &mut total);
        total
    }

    fn exclusivity(&self, resources: &[ResourceRequest], u: VertexId) -> bool {
        let vertex_type = &self.graph[u].resource_type;
        resources
            .iter()
            .any(|r| &r.resource_type == vertex_type && r.exclusive)
    }

    fn own_avail(&self, meta: &JobMeta, u: VertexId) -> Result<u64> {
        Ok(self.graph[u]
            .schedule
            .plans
            .avail_resources_during(meta.at, meta.duration, 0)?)
    }

    fn prune(
        &self,
        meta: &JobMeta,
        exclusive: bool,
        subsystem: &str,
        u: VertexId,
        resources: &[ResourceRequest],
    ) -> Result<bool> {
        let pool = &self.graph[u];
        if self.own_avail(meta, u)? == 0 {
            debug!("Pruned {}: not available at {}", pool.name, meta.at);
            return Ok(true);
        }

        for resource in resources
            .iter()
            .filter(|r| r.resource_type == pool.resource_type)
        {
            if meta.allocate && exclusive && !pool.schedule.tags.is_empty() {
                debug!("Pruned {}: held by another job", pool.name);
                return Ok(true);
            }
            if resource.aggregate.is_empty() {
                continue;
            }
            let Some(subplan) = pool.idata.subplans.get(subsystem) else {
                debug!("Pruned {}: nothing of the requested types below", pool.name);
                return Ok(true);
            };
            let counts = subplan.counts_for(&resource.aggregate);
            if !subplan.avail_during(meta.at, meta.duration, &counts)? {
                debug!("Pruned {}: subtree cannot supply {:?}", pool.name, resource.aggregate);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn find_match<'r>(
        &self,
        u: VertexId,
        resources: &'r [ResourceRequest],
    ) -> (Option<&'r ResourceRequest>, Option<&'r ResourceRequest>) {
        let vertex_type = &self.graph[u].resource_type;
        for resource in resources {
            if &resource.resource_type == vertex_type {
                let slot = resource.with.iter().find(|c| c.is_slot());
                return (slot, Some(resource));
            } else if resource.is_slot() {
                return (Some(resource), None);
            }
        }
        (None, None)
    }

    /// Whether every element of the slot pattern has a vertex of its type right below `u`
    fn slot_match(&self, u: VertexId, slot: &ResourceRequest) -> bool {
        let dom = self.dom();
        slot.with.iter().all(|element| {
            self.graph.out_edges(u).iter().any(|&e| {
                self.in_subsystem(e, dom)
                    && self.graph[self.graph[e].target].resource_type == element.resource_type
            })
        })
    }

    fn test<'r>(
        &self,
        u: VertexId,
        resources: &'r [ResourceRequest],
    ) -> (MatchKind, &'r [ResourceRequest]) {
        match self.find_match(u, resources) {
            (Some(slot), _) if self.slot_match(u, slot) => (MatchKind::Slot, slot.with.as_slice()),
            (_, Some(resource)) => (MatchKind::Resource, resource.with.as_slice()),
            _ => (MatchKind::None, resources),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn explore(
        &mut self,
        meta: &JobMeta,
        u: VertexId,
        subsystem: &str,
        resources: &[ResourceRequest],
        exclusive: bool,
        direction: Direction,
        dfu: &mut ScoreAggregator,
    ) -> Result<()> {
        for e in self.subsystem_edges(u, subsystem) {
            if self.stop_explore(e, subsystem) {
                continue;
            }
            let target = self.graph[e].target;
            let visit = match direction {
                Direction::Down => self.dom_dfv(meta, target, resources, exclusive, dfu)?,
                Direction::Up => self.aux_upv(meta, target, subsystem, resources, exclusive, dfu)?,
            };
            if let Visit::Matched(found) = visit {
                let target_type = self.graph[target].resource_type.clone();
                dfu.add(
                    subsystem,
                    &target_type,
                    EvalGroup::singleton(found.score, found.avail, found.exclusive, Some(e)),
                );
            }
        }
        Ok(())
    }

    fn aux_upv(
        &mut self,
        meta: &JobMeta,
        u: VertexId,
        aux: &str,
        resources: &[ResourceRequest],
        exclusive: bool,
        to_parent: &mut ScoreAggregator,
    ) -> Result<Visit> {
        if self.prune(meta, exclusive, aux, u, resources)? {
            return Ok(Visit::Pruned);
        }
        let verdict = self.policy.aux_discover_vtx(u, aux, resources, self.graph);
        if !verdict.accepted {
            debug!("Policy rejected {} on {}: {:?}", self.graph[u].name, aux, verdict.reason);
            return Ok(Visit::Pruned);
        }

        let mut upv = ScoreAggregator::new();
        self.graph.mark(u, aux, &self.epoch, Color::Gray);
        if self.graph.root(aux) != Some(u) {
            for e in self.subsystem_edges(u, aux) {
                if self.stop_explore(e, aux) {
                    continue;
                }
                let target = self.graph[e].target;
                if self.aux_upv(meta, target, aux, resources, exclusive, &mut upv)? == Visit::Pruned {
                    self.graph.mark(u, aux, &self.epoch, Color::Black);
                    return Ok(Visit::Pruned);
                }
            }
        }
        self.graph.mark(u, aux, &self.epoch, Color::Black);

        let avail = self.own_avail(meta, u)?;
        if avail == 0 {
            return Ok(Visit::Pruned);
        }
        let verdict = self
            .policy
            .aux_finish_vtx(u, aux, resources, self.graph, &mut upv);
        if !verdict.accepted {
            debug!("Policy rejected {} on {}: {:?}", self.graph[u].name, aux, verdict.reason);
            return Ok(Visit::Pruned);
        }

        let score = upv.overall_score();
        self.resolve(upv, to_parent)?;
        Ok(Visit::Matched(Found {
            score,
            avail,
            exclusive,
        }))
    }

    fn dom_exp(
        &mut self,
        meta: &JobMeta,
        u: VertexId,
        resources: &[ResourceRequest],
        exclusive: bool,
        dfu: &mut ScoreAggregator,
    ) -> Result<()> {
        let dom = self.dom();
        for subsystem in self.subsystems() {
            let direction = if subsystem == dom {
                Direction::Down
            } else {
                Direction::Up
            };
            self.explore(meta, u, subsystem, resources, exclusive, direction, dfu)?;
        }
        Ok(())
    }

    /// Score whole instances of a slot pattern below `u` into `dfu`.
    /// Returns false when not even one instance fits.
    fn dom_slot(
        &mut self,
        meta: &JobMeta,
        u: VertexId,
        slot_shape: &[ResourceRequest],
        dfu: &mut ScoreAggregator,
    ) -> Result<bool> {
        let dom = self.dom();
        let mut dfu_slot = ScoreAggregator::new();
        self.explore(meta, u, dom, slot_shape, true, Direction::Down, &mut dfu_slot)?;
        let verdict = self.policy.dom_finish_slot(dom, &mut dfu_slot);
        if !verdict.accepted {
            debug!("Policy rejected slot at {}: {:?}", self.graph[u].name, verdict.reason);
            return Ok(false);
        }

        let qual_num_slots = slot_shape
            .iter()
            .map(|element| {
                let qc = dfu_slot.qualified_count(dom, &element.resource_type);
                qc.checked_div(element.count.max).unwrap_or(0)
            })
            .min()
            .unwrap_or(0);

        for element in slot_shape {
            dfu_slot.rewind(dom, &element.resource_type);
        }
        // units already handed out from the candidate under each cursor
        let mut used: BTreeMap<&str, u64> = BTreeMap::new();
        for _ in 0..qual_num_slots {
            let mut group = EvalGroup::new(MATCH_MET, 1, true);
            for element in slot_shape {
                let resource_type = element.resource_type.as_str();
                let mut taken = 0;
                while taken < element.count.max {
                    let (score, count, edge) = {
                        let member = dfu_slot.current(dom, resource_type).ok_or_else(|| {
                            SchedulerError::range_error(format!(
                                "slot at {} ran out of {}",
                                self.graph[u].name, resource_type
                            ))
                        })?;
                        let edge = member.edges.first().ok_or_else(|| {
                            SchedulerError::range_error("slot member without an edge")
                        })?;
                        (member.score, edge.count, edge.edge)
                    };
                    let capacity = count.max(1);
                    let offset = used.entry(resource_type).or_insert(0);
                    let take = (capacity - *offset).min(element.count.max - taken);
                    group.edges.push(EvalEdge::new(count, take, true, edge));
                    group.score = group.score.saturating_add(score);
                    taken += take;
                    *offset += take;
                    if *offset >= capacity {
                        *offset = 0;
                        dfu_slot.advance(dom, resource_type);
                    }
                }
            }
            dfu.add(dom, SLOT_TYPE, group);
        }
        debug!("{} holds {} slots", self.graph[u].name, qual_num_slots);
        Ok(qual_num_slots > 0)
    }

    fn dom_dfv(
        &mut self,
        meta: &JobMeta,
        u: VertexId,
        resources: &[ResourceRequest],
        exclusive: bool,
        to_parent: &mut ScoreAggregator,
    ) -> Result<Visit> {
        let dom = self.dom();
        let x_in = exclusive || self.exclusivity(resources, u);
        let (kind, next) = self.test(u, resources);
        if self.prune(meta, x_in, dom, u, resources)? {
            return Ok(Visit::Pruned);
        }
        let verdict = self.policy.dom_discover_vtx(u, dom, resources, self.graph);
        if !verdict.accepted {
            debug!("Policy rejected {}: {:?}", self.graph[u].name, verdict.reason);
            return Ok(Visit::Pruned);
        }

        let mut dfu = ScoreAggregator::new();
        self.graph.mark(u, dom, &self.epoch, Color::Gray);
        let explored = match kind {
            MatchKind::Slot => self.dom_slot(meta, u, next, &mut dfu)?,
            MatchKind::Resource | MatchKind::None => {
                self.dom_exp(meta, u, next, x_in, &mut dfu)?;
                true
            }
        };
        self.graph.mark(u, dom, &self.epoch, Color::Black);
        if !explored {
            return Ok(Visit::Pruned);
        }

        let avail = self.own_avail(meta, u)?;
        if avail == 0 {
            return Ok(Visit::Pruned);
        }
        let verdict = self
            .policy
            .dom_finish_vtx(u, dom, resources, self.graph, &mut dfu);
        if !verdict.accepted {
            debug!("Policy rejected {}: {:?}", self.graph[u].name, verdict.reason);
            return Ok(Visit::Pruned);
        }

        let score = dfu.overall_score();
        self.resolve(dfu, to_parent)?;
        Ok(Visit::Matched(Found {
            score,
            avail,
            exclusive: x_in,
        }))
    }

    fn resolve(&mut self, mut dfu: ScoreAggregator, to_parent: &mut ScoreAggregator) -> Result<()> {
        if dfu.overall_score() > 0 {
            if dfu.hier_constrain_now() {
                for subsystem in self.subsystems() {
                    choose_undecided(&mut dfu, subsystem);
                    self.enforce(subsystem, &dfu)?;
                }
            } else {
                to_parent.merge(dfu);
            }
        }
        Ok(())
    }

    /// Write the accepted candidates of `subsystem` onto their edges
    fn enforce(&mut self, subsystem: &str, dfu: &ScoreAggregator) -> Result<()> {
        for resource_type in dfu.resource_types(subsystem) {
            for i in 0..dfu.best_i(subsystem, &resource_type) {
                let group = dfu.at(subsystem, &resource_type, i)?;
                if group.root {
                    continue;
                }
                for eval in &group.edges {
                    if let Some(e) = eval.edge {
                        let infra = self.graph[e].idata;
                        // a pool shared by several slots collects every share
                        let needs = if infra.stamp == self.generation {
                            infra.needs.saturating_add(eval.needs)
                        } else {
                            eval.needs
                        };
                        self.graph[e].idata = RelationInfra {
                            needs,
                            exclusive: eval.exclusive,
                            stamp: self.generation,
                        };
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_graph(
        &mut self,
        root: VertexId,
        resources: &[ResourceRequest],
        dfu: &mut ScoreAggregator,
    ) -> Result<Option<(u64, Vec<MatchedResource>)>> {
        let dom = self.dom();
        let verdict = self.policy.dom_finish_graph(dom, resources, self.graph, dfu);
        if !verdict.accepted {
            debug!("Request rejected: {:?}", verdict.reason);
            return Ok(None);
        }

        let mut needs = 0;
        let root_type = &self.graph[root].resource_type;
        for resource in resources.iter().filter(|r| &r.resource_type == root_type) {
            needs = self.policy.select_count(resource, dfu.avail());
            if needs == 0 {
                return Ok(None);
            }
        }

        for subsystem in self.subsystems() {
            for resource_type in dfu.resource_types(subsystem) {
                if dfu.qualified_count(subsystem, &resource_type) == 0 {
                    debug!("No qualified {} in {}", resource_type, subsystem);
                    return Ok(None);
                }
            }
            choose_undecided(dfu, subsystem);
        }
        for subsystem in self.subsystems() {
            self.enforce(subsystem, dfu)?;
        }

        let matched = resources
            .iter()
            .map(|r| {
                let chosen = dfu.chosen(dom, &r.resource_type);
                MatchedResource {
                    resource_type: r.resource_type.clone(),
                    count: chosen.iter().map(|g| g.needs).sum(),
                    exclusive: !chosen.is_empty() && chosen.iter().all(|g| g.exclusive),
                }
            })
            .collect();
        Ok(Some((needs, matched)))
    }

    /// Select phase: find the best embedding of the primed `jobspec` at
    /// `meta.at` and stamp its edges with a new generation. Nothing is
    /// committed to any planner.
    pub fn select(
        &mut self,
        jobspec: &Jobspec,
        meta: &JobMeta,
        exclusive: bool,
    ) -> Result<Option<Selection>> {
        if !self.primed {
            return Err(SchedulerError::range_error(
                "traverser used before initialize",
            ));
        }
        let dom = self.dom();
        let root = self.root_of(dom)?;
        self.tick();

        let mut dfu = ScoreAggregator::new();
        let found = match self.dom_dfv(meta, root, &jobspec.resources, exclusive, &mut dfu)? {
            Visit::Pruned => return Ok(None),
            Visit::Matched(found) => found,
        };
        dfu.set_avail(found.avail);
        dfu.set_overall_score(found.score);

        let root_type = self.graph[root].resource_type.clone();
        let mut singleton = EvalGroup::singleton(found.score, found.avail, exclusive, None);
        singleton.root = true;
        dfu.add(dom, &root_type, singleton);

        Ok(self
            .resolve_graph(root, &jobspec.resources, &mut dfu)?
            .map(|(needs, resources)| Selection {
                score: found.score,
                needs,
                exclusive,
                resources,
            }))
    }

    fn emit_vertex(&mut self, u: VertexId, needs: u64, exclusive: bool) {
        let line = format!(
            "      {}{}[{}:{}]",
            "---".repeat(self.level),
            self.graph[u].name,
            needs,
            if exclusive { "x" } else { "s" }
        );
        debug!("{}", line);
        if self.config.emit_trace {
            self.trace.push(line);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn updcore(
        &mut self,
        u: VertexId,
        needs: u64,
        exclusive: bool,
        mut n: u64,
        meta: &JobMeta,
        dfu: &BTreeMap<String, u64>,
        to_parent: &mut BTreeMap<String, u64>,
    ) -> Result<u64> {
        let dom = self.dom();
        let mut span = None;
        if exclusive {
            n += 1;
            span = Some(
                self.graph[u]
                    .schedule
                    .plans
                    .add_span(meta.at, meta.duration, &[needs])?,
            );
            let resource_type = self.graph[u].resource_type.clone();
            self.accum_if(dom, &resource_type, needs, to_parent);
        }

        if n > 0 {
            let pool = &mut self.graph[u];
            if meta.allocate {
                pool.schedule.tags.insert(meta.jobid);
            }
            if let Some(span) = span {
                if meta.allocate {
                    pool.schedule.allocations.insert(meta.jobid, span);
                } else {
                    pool.schedule.reservations.insert(meta.jobid, span);
                }
            }
            if !dfu.is_empty() {
                if let Some(subplan) = pool.idata.subplans.get_mut(dom) {
                    let counts = subplan.counts_for(dfu);
                    let span = subplan.add_span(meta.at, meta.duration, &counts)?;
                    pool.idata.job2span.insert(meta.jobid, (dom.to_string(), span));
                }
            }
            for (t, c) in dfu {
                self.accum_if(dom, t, *c, to_parent);
            }
            self.emit_vertex(u, needs, exclusive);
        }
        self.level -= 1;
        Ok(n)
    }

    fn upd_dfv(
        &mut self,
        u: VertexId,
        needs: u64,
        exclusive: bool,
        meta: &JobMeta,
        to_parent: &mut BTreeMap<String, u64>,
    ) -> Result<u64> {
        let dom = self.dom();
        self.level += 1;
        self.graph.mark(u, dom, &self.epoch, Color::Gray);

        let mut n = 0;
        let mut dfu = BTreeMap::new();
        // auxiliary subsystems are only stamped, never committed
        for e in self.subsystem_edges(u, dom) {
            let infra = self.graph[e].idata;
            if infra.stamp != self.generation || self.stop_explore(e, dom) {
                continue;
            }
            let target = self.graph[e].target;
            n += self.upd_dfv(target, infra.needs, infra.exclusive, meta, &mut dfu)?;
        }
        self.graph.mark(u, dom, &self.epoch, Color::Black);
        self.updcore(u, needs, exclusive, n, meta, &dfu, to_parent)
    }

    /// Update phase: commit the edges stamped with the current generation
    /// into the vertex and subtree planners. Returns the number of vertices
    /// committed.
    pub fn update(&mut self, meta: &JobMeta, needs: u64, exclusive: bool) -> Result<u64> {
        let root = self.root_of(self.dom())?;
        self.tick_color_base();
        self.level = 0;
        self.trace.clear();

        let mut to_parent = BTreeMap::new();
        let n = self.upd_dfv(root, needs, exclusive, meta, &mut to_parent)?;
        if n == 0 {
            return Err(SchedulerError::commit_failed(meta.jobid));
        }
        Ok(n)
    }

    /// Match `jobspec` for `jobid` at `at` and commit the result, falling
    /// back to the earliest later start when `op` allows reservations.
    pub fn run(
        &mut self,
        jobspec: &mut Jobspec,
        op: MatchOp,
        jobid: u64,
        at: i64,
    ) -> Result<MatchResult> {
        jobspec.validate()?;
        let mut meta = JobMeta::build(jobspec, jobid, at, &self.config);
        let aggregate = self.prime(jobspec);
        info!("Matching job {} at {} for {}", jobid, at, meta.duration);

        let mut selection = self.select(jobspec, &meta, false)?;
        if selection.is_none() && op == MatchOp::AllocateOrElseReserve {
            meta.allocate = false;
            let dom = self.dom();
            let root = self.root_of(dom)?;

            let mut next = {
                let subplan = self.graph[root].idata.subplans.get_mut(dom).ok_or_else(|| {
                    SchedulerError::range_error(format!("root of {} has no subtree planner", dom))
                })?;
                let counts = subplan.counts_for(&aggregate);
                subplan.avail_time_first(at.saturating_add(1), meta.duration, &counts)?
            };
            while let Some(t) = next {
                meta.at = t;
                debug!("Trying job {} at {}", jobid, t);
                selection = self.select(jobspec, &meta, false)?;
                if selection.is_some() {
                    break;
                }
                next = self.graph[root]
                    .idata
                    .subplans
                    .get_mut(dom)
                    .and_then(Planner::avail_time_next);
            }
            if selection.is_none() {
                return Err(SchedulerError::no_feasible_time(jobid, at));
            }
        }

        let Some(selection) = selection else {
            return Err(SchedulerError::infeasible(
                jobid,
                format!("request does not fit at {}", at),
            ));
        };
        self.update(&meta, selection.needs, selection.exclusive)?;

        let status = if meta.allocate {
            MatchStatus::Allocated
        } else {
            MatchStatus::Reserved
        };
        info!("Job {} {} at {}", jobid, status, meta.at);
        Ok(MatchResult {
            status,
            jobid,
            at: meta.at,
            duration: meta.duration,
            needs: selection.needs,
            exclusive: selection.exclusive,
            resources: selection.resources,
            trace: std::mem::take(&mut self.trace),
        })
    }
}

/// Accept every candidate of the pairs no policy narrowed to a top-k
fn choose_undecided(dfu: &mut ScoreAggregator, subsystem: &str) {
    for resource_type in dfu.resource_types(subsystem) {
        if !dfu.best_k(subsystem, &resource_type) {
            dfu.choose_accum_all(subsystem, &resource_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{HighIdFirst, LowIdFirst, MatcherData};
    use crate::types::Verdict;
    use arbor_core::{Count, CountOperator};
    use arbor_graph::{ClusterShape, CONTAINMENT};
    use std::sync::Mutex;

    const HORIZON: u64 = 100_000;

    /// cluster0 → node0, node1 → four cores each
    fn create_test_graph() -> ResourceGraph {
        let mut graph = ResourceGraph::new(0, HORIZON);
        let cluster = graph.add_vertex("cluster", "cluster", 0, 1).unwrap();
        graph.set_root(CONTAINMENT, cluster).unwrap();
        for n in 0..2 {
            let node = graph.add_vertex("node", "node", n, 1).unwrap();
            graph
                .add_edge(cluster, node, CONTAINMENT, "contains")
                .unwrap();
            for c in 0..4 {
                let core = graph.add_vertex("core", "core", n * 4 + c, 1).unwrap();
                graph.add_edge(node, core, CONTAINMENT, "contains").unwrap();
            }
        }
        graph
    }

    fn create_test_jobspec() -> Jobspec {
        Jobspec::new(vec![ResourceRequest::new("node", 1)
            .exclusive()
            .with_child(ResourceRequest::new("core", 4))])
        .with_duration(10)
    }

    fn create_test_policy() -> HighIdFirst {
        let mut data = MatcherData::new("high");
        data.add_subsystem(CONTAINMENT, "contains");
        data.set_sdau_resource_types(CONTAINMENT, ["node", "core"]);
        HighIdFirst::with_data(data)
    }

    fn held(graph: &ResourceGraph, resource_type: &str, jobid: u64) -> Vec<String> {
        graph
            .vertex_ids()
            .filter(|&v| graph[v].resource_type == resource_type)
            .filter(|&v| graph[v].schedule.allocations.contains_key(&jobid))
            .map(|v| graph[v].name.clone())
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();

        let first = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();
        assert_eq!(first.status, MatchStatus::Allocated);
        assert_eq!(first.resources.len(), 1);
        assert_eq!(first.resources[0].count, 1);
        assert!(first.resources[0].exclusive);
        assert_eq!(held(traverser.graph(), "node", 1), vec!["node1"]);

        let graph_ref = traverser.graph();
        let node1 = graph_ref.find("node1").unwrap();
        assert_eq!(graph_ref[node1].schedule.plans.span_count(), 1);
        let root = graph_ref.root(CONTAINMENT).unwrap();
        let root_plan = &graph_ref[root].idata.subplans[CONTAINMENT];
        assert_eq!(root_plan.span_count(), 1);
        let span = root_plan.spans().next().unwrap();
        let lookup: BTreeMap<String, u64> =
            [("node".to_string(), 1), ("core".to_string(), 4)].into();
        assert_eq!(span.counts, root_plan.counts_for(&lookup));

        let second = traverser
            .run(&mut jobspec, MatchOp::Allocate, 2, 0)
            .unwrap();
        assert_eq!(second.status, MatchStatus::Allocated);
        assert_eq!(held(traverser.graph(), "node", 2), vec!["node0"]);

        let third = traverser.run(&mut jobspec, MatchOp::Allocate, 3, 0);
        assert!(matches!(third, Err(SchedulerError::Infeasible { jobid: 3, .. })));

        let reserved = traverser
            .run(&mut jobspec, MatchOp::AllocateOrElseReserve, 3, 0)
            .unwrap();
        assert_eq!(reserved.status, MatchStatus::Reserved);
        assert_eq!(reserved.at, 10);

        let graph_ref = traverser.graph();
        let node1 = graph_ref.find("node1").unwrap();
        assert!(graph_ref[node1].schedule.reservations.contains_key(&3));
        assert!(!graph_ref[node1].schedule.tags.contains(&3));
    }

    #[test]
    fn test_exclusivity_inheritance() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();
        traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();

        let generation = traverser.generation();
        let graph_ref = traverser.graph();
        let node1 = graph_ref.find("node1").unwrap();
        for &e in graph_ref.out_edges(node1) {
            let edge = &graph_ref[e];
            assert_eq!(edge.idata.stamp, generation);
            assert_eq!(edge.idata.needs, 1);
            assert!(edge.idata.exclusive);
            assert!(graph_ref[edge.target].schedule.allocations.contains_key(&1));
        }
    }

    #[test]
    fn test_trace() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let result = traverser
            .run(&mut create_test_jobspec(), MatchOp::Allocate, 1, 0)
            .unwrap();

        assert_eq!(result.trace.len(), 6);
        assert_eq!(result.trace[0], "      ---------core4[1:x]");
        assert_eq!(result.trace[4], "      ------node1[1:x]");
        assert_eq!(result.trace[5], "      ---cluster0[0:s]");
    }

    #[test]
    fn test_select_is_repeatable() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();
        traverser.prime(&mut jobspec);
        let meta = JobMeta::build(&jobspec, 1, 0, &TraverserConfig::default());

        let first = traverser.select(&jobspec, &meta, false).unwrap().unwrap();
        for _ in 0..5 {
            let again = traverser.select(&jobspec, &meta, false).unwrap().unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_stale_stamp_commits_nothing() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();
        traverser.prime(&mut jobspec);
        let meta = JobMeta::build(&jobspec, 1, 0, &TraverserConfig::default());

        let selection = traverser.select(&jobspec, &meta, false).unwrap().unwrap();
        traverser.tick();
        let err = traverser
            .update(&meta, selection.needs, selection.exclusive)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CommitFailed { jobid: 1 }));

        let graph_ref = traverser.graph();
        assert!(graph_ref
            .vertex_ids()
            .all(|v| graph_ref[v].schedule.plans.span_count() == 0));
    }

    #[test]
    fn test_update_counts_exclusive_commits() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();
        traverser.prime(&mut jobspec);
        let meta = JobMeta::build(&jobspec, 1, 0, &TraverserConfig::default());

        let selection = traverser.select(&jobspec, &meta, false).unwrap().unwrap();
        // the node and its four cores are held exclusively
        assert_eq!(traverser.update(&meta, selection.needs, selection.exclusive).unwrap(), 5);
    }

    #[test]
    fn test_low_id_first() {
        let mut graph = create_test_graph();
        let mut data = MatcherData::new("low");
        data.add_subsystem(CONTAINMENT, "contains");
        data.set_sdau_resource_types(CONTAINMENT, ["node", "core"]);
        let policy = LowIdFirst::with_data(data);
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        traverser
            .run(&mut create_test_jobspec(), MatchOp::Allocate, 1, 0)
            .unwrap();
        assert_eq!(held(traverser.graph(), "node", 1), vec!["node0"]);
    }

    #[test]
    fn test_uninitialized_is_range_error() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();

        let err = traverser
            .run(&mut create_test_jobspec(), MatchOp::Allocate, 1, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::RangeError { .. }));
    }

    #[test]
    fn test_missing_root() {
        let mut graph = ResourceGraph::new(0, HORIZON);
        let policy = create_test_policy();
        assert!(matches!(
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()),
            Err(SchedulerError::Graph(_))
        ));
    }

    #[test]
    fn test_no_feasible_time() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 3).exclusive()])
            .with_duration(10);
        let err = traverser
            .run(&mut jobspec, MatchOp::AllocateOrElseReserve, 1, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoFeasibleTime { jobid: 1, .. }));
    }

    #[test]
    fn test_count_range_shrinks() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1)
            .with_count(Count::range(1, 4, CountOperator::Add, 1))
            .exclusive()])
        .with_duration(10);
        let result = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();
        assert_eq!(result.resources[0].count, 2);
    }

    #[test]
    fn test_release_and_rematch() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        {
            let mut traverser =
                DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
            traverser.initialize().unwrap();
            traverser
                .run(&mut create_test_jobspec(), MatchOp::Allocate, 1, 0)
                .unwrap();
        }
        // node, four cores and the two subtree spans of node1 and cluster0
        assert_eq!(graph.remove_job(1).unwrap(), 7);

        let stamp = graph.max_stamp();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        assert_eq!(traverser.generation(), stamp);
        traverser.initialize().unwrap();
        traverser
            .run(&mut create_test_jobspec(), MatchOp::Allocate, 2, 0)
            .unwrap();
        assert_eq!(held(traverser.graph(), "node", 2), vec!["node1"]);
    }

    /// node0 → six "a" and two "b" vertices
    fn create_slot_graph() -> ResourceGraph {
        let mut graph = ResourceGraph::new(0, HORIZON);
        let cluster = graph.add_vertex("cluster", "cluster", 0, 1).unwrap();
        graph.set_root(CONTAINMENT, cluster).unwrap();
        let node = graph.add_vertex("node", "node", 0, 1).unwrap();
        graph
            .add_edge(cluster, node, CONTAINMENT, "contains")
            .unwrap();
        for i in 0..6 {
            let a = graph.add_vertex("a", "a", i, 1).unwrap();
            graph.add_edge(node, a, CONTAINMENT, "contains").unwrap();
        }
        for i in 0..2 {
            let b = graph.add_vertex("b", "b", i, 1).unwrap();
            graph.add_edge(node, b, CONTAINMENT, "contains").unwrap();
        }
        graph
    }

    fn create_slot_jobspec(slots: u64) -> Jobspec {
        Jobspec::new(vec![ResourceRequest::new("node", 1).with_child(
            ResourceRequest::slot(slots)
                .with_child(ResourceRequest::new("a", 2))
                .with_child(ResourceRequest::new("b", 1)),
        )])
        .with_duration(10)
    }

    fn create_slot_policy() -> HighIdFirst {
        let mut data = MatcherData::new("high");
        data.add_subsystem(CONTAINMENT, "contains");
        data.set_sdau_resource_types(CONTAINMENT, ["node", "a", "b"]);
        HighIdFirst::with_data(data)
    }

    #[test]
    fn test_slot_arithmetic() {
        let mut graph = create_slot_graph();
        let policy = create_slot_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        // 6 a / 2 per slot and 2 b / 1 per slot leave room for two slots only
        let err = traverser
            .run(&mut create_slot_jobspec(3), MatchOp::Allocate, 1, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Infeasible { .. }));

        traverser
            .run(&mut create_slot_jobspec(2), MatchOp::Allocate, 2, 0)
            .unwrap();
        let graph_ref = traverser.graph();
        assert_eq!(held(graph_ref, "a", 2).len(), 4);
        assert_eq!(held(graph_ref, "b", 2).len(), 2);
    }

    /// Forwards to HighIdFirst and records the auxiliary walk
    struct RecordingPolicy {
        inner: HighIdFirst,
        aux_seen: Mutex<Vec<String>>,
    }

    impl MatchPolicy for RecordingPolicy {
        fn data(&self) -> &MatcherData {
            self.inner.data()
        }

        fn aux_discover_vtx(
            &self,
            u: VertexId,
            _subsystem: &str,
            _resources: &[ResourceRequest],
            graph: &ResourceGraph,
        ) -> Verdict {
            self.aux_seen.lock().unwrap().push(graph[u].name.clone());
            Verdict::accept()
        }

        fn dom_finish_vtx(
            &self,
            u: VertexId,
            subsystem: &str,
            resources: &[ResourceRequest],
            graph: &ResourceGraph,
            dfu: &mut ScoreAggregator,
        ) -> Verdict {
            self.inner.dom_finish_vtx(u, subsystem, resources, graph, dfu)
        }

        fn dom_finish_slot(&self, subsystem: &str, dfu: &mut ScoreAggregator) -> Verdict {
            self.inner.dom_finish_slot(subsystem, dfu)
        }

        fn dom_finish_graph(
            &self,
            subsystem: &str,
            resources: &[ResourceRequest],
            graph: &ResourceGraph,
            dfu: &mut ScoreAggregator,
        ) -> Verdict {
            self.inner.dom_finish_graph(subsystem, resources, graph, dfu)
        }
    }

    #[test]
    fn test_aux_walk_reaches_power_root() {
        let shape = ClusterShape {
            racks: 1,
            nodes_per_rack: 2,
            sockets_per_node: 1,
            cores_per_socket: 2,
            memory_per_socket: 0,
            power: true,
        };
        let mut graph = shape.build(0, HORIZON).unwrap();
        let policy = RecordingPolicy {
            inner: HighIdFirst::with_data(MatcherData::containment("high").with_power()),
            aux_seen: Mutex::new(Vec::new()),
        };
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1)
            .exclusive()
            .with_child(ResourceRequest::new("core", 2))])
        .with_duration(10);
        traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();

        let seen = policy.aux_seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["pdu0".to_string(), "panel0".to_string()]);

        let generation = traverser.generation();
        let graph_ref = traverser.graph();
        let pdu = graph_ref.find("pdu0").unwrap();
        assert!(graph_ref
            .edge_ids()
            .any(|e| graph_ref[e].target == pdu && graph_ref[e].idata.stamp == generation));
        // auxiliary vertices are stamped, not committed
        assert_eq!(graph_ref[pdu].schedule.plans.span_count(), 0);
    }

    #[test]
    fn test_slots_share_pooled_memory() {
        let mut graph = ClusterShape::default().build(0, HORIZON).unwrap();
        let policy = HighIdFirst::new();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        // each socket has 4 cores and a single memory pool of 16
        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1).with_child(
            ResourceRequest::slot(2)
                .with_child(ResourceRequest::new("core", 2))
                .with_child(ResourceRequest::new("memory", 4)),
        )])
        .with_duration(10);
        let result = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();
        assert_eq!(result.status, MatchStatus::Allocated);

        let graph_ref = traverser.graph();
        assert_eq!(held(graph_ref, "core", 1).len(), 4);
        let memory: u64 = graph_ref
            .vertex_ids()
            .filter(|&v| graph_ref[v].resource_type == "memory")
            .filter_map(|v| {
                let schedule = &graph_ref[v].schedule;
                let span = schedule.allocations.get(&1)?;
                schedule.plans.span(*span).map(|s| s.counts[0])
            })
            .sum();
        assert_eq!(memory, 8);
    }

    #[test]
    fn test_zero_operand_is_rejected() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1)
            .with_count(Count::range(1, 4, CountOperator::Add, 0))
            .exclusive()])
        .with_duration(10);
        let err = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Core(_)));
        assert!(held(traverser.graph(), "node", 1).is_empty());
    }

    /// HighIdFirst that writes its decisions onto edges at every node
    struct NodeNowPolicy {
        inner: HighIdFirst,
    }

    impl MatchPolicy for NodeNowPolicy {
        fn data(&self) -> &MatcherData {
            self.inner.data()
        }

        fn dom_finish_vtx(
            &self,
            u: VertexId,
            subsystem: &str,
            resources: &[ResourceRequest],
            graph: &ResourceGraph,
            dfu: &mut ScoreAggregator,
        ) -> Verdict {
            let verdict = self.inner.dom_finish_vtx(u, subsystem, resources, graph, dfu);
            if graph[u].resource_type == "node" {
                dfu.set_hier_constrain_now(true);
            }
            verdict
        }

        fn dom_finish_slot(&self, subsystem: &str, dfu: &mut ScoreAggregator) -> Verdict {
            self.inner.dom_finish_slot(subsystem, dfu)
        }

        fn dom_finish_graph(
            &self,
            subsystem: &str,
            resources: &[ResourceRequest],
            graph: &ResourceGraph,
            dfu: &mut ScoreAggregator,
        ) -> Verdict {
            self.inner.dom_finish_graph(subsystem, resources, graph, dfu)
        }
    }

    #[test]
    fn test_constrain_now_commits_descendants() {
        let mut graph = ClusterShape::default().build(0, HORIZON).unwrap();
        let policy = NodeNowPolicy {
            inner: HighIdFirst::new(),
        };
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        let mut jobspec = Jobspec::new(vec![ResourceRequest::new("node", 1)
            .exclusive()
            .with_child(ResourceRequest::new("core", 2))])
        .with_duration(10);
        let result = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();

        assert_eq!(held(traverser.graph(), "node", 1), vec!["node1"]);
        assert_eq!(held(traverser.graph(), "core", 1).len(), 2);
        assert_eq!(result.trace.iter().filter(|l| l.contains("core")).count(), 2);
        assert!(result.trace.iter().any(|l| l.ends_with("node1[1:x]")));
        assert_eq!(held(traverser.graph(), "core", 1), vec!["core14", "core15"]);
    }

    fn span_counts(graph: &ResourceGraph) -> Vec<usize> {
        graph
            .vertex_ids()
            .flat_map(|v| {
                std::iter::once(graph[v].schedule.plans.span_count())
                    .chain(graph[v].idata.subplans.values().map(Planner::span_count))
            })
            .collect()
    }

    #[test]
    fn test_stale_update_after_commit() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();
        let mut jobspec = create_test_jobspec();
        let result = traverser
            .run(&mut jobspec, MatchOp::Allocate, 1, 0)
            .unwrap();
        let before = span_counts(traverser.graph());

        traverser.tick();
        let meta = JobMeta::build(&jobspec, 1, 0, &TraverserConfig::default());
        let err = traverser
            .update(&meta, result.needs, result.exclusive)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::CommitFailed { jobid: 1 }));
        assert_eq!(span_counts(traverser.graph()), before);
    }

    fn create_core_jobspec(cores: u64, duration: u64) -> Jobspec {
        Jobspec::new(vec![ResourceRequest::new("node", 1)
            .with_child(ResourceRequest::new("core", cores).exclusive())])
        .with_duration(duration)
    }

    #[test]
    fn test_reserve_skips_fragmented_start() {
        let mut graph = create_test_graph();
        let policy = create_test_policy();
        let mut traverser =
            DfuTraverser::new(&mut graph, &policy, TraverserConfig::default()).unwrap();
        traverser.initialize().unwrap();

        // 2 cores of node1 until 10, 3 cores of node0 until 20
        traverser
            .run(&mut create_core_jobspec(2, 10), MatchOp::Allocate, 1, 0)
            .unwrap();
        traverser
            .run(&mut create_core_jobspec(3, 20), MatchOp::Allocate, 2, 0)
            .unwrap();
        assert_eq!(held(traverser.graph(), "core", 1), vec!["core6", "core7"]);
        assert_eq!(held(traverser.graph(), "core", 2), vec!["core1", "core2", "core3"]);

        // the root counts 3 free cores from 1 on, but split over two nodes
        let mut jobspec = create_core_jobspec(3, 10);
        let aggregate = traverser.prime(&mut jobspec);
        let graph_ref = traverser.graph();
        let root = graph_ref.root(CONTAINMENT).unwrap();
        let mut root_plan = graph_ref[root].idata.subplans[CONTAINMENT].clone();
        let counts = root_plan.counts_for(&aggregate);
        assert_eq!(root_plan.avail_time_first(1, 10, &counts).unwrap(), Some(1));

        let reserved = traverser
            .run(&mut jobspec, MatchOp::AllocateOrElseReserve, 3, 0)
            .unwrap();
        assert_eq!(reserved.status, MatchStatus::Reserved);
        assert_eq!(reserved.at, 10);

        let graph_ref = traverser.graph();
        let cores: Vec<String> = graph_ref
            .vertex_ids()
            .filter(|&v| graph_ref[v].schedule.reservations.contains_key(&3))
            .map(|v| graph_ref[v].name.clone())
            .collect();
        assert_eq!(cores, vec!["core5", "core6", "core7"]);
    }
}
