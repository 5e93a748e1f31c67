use crate::{Result, SchedulerError};
use arbor_graph::EdgeId;
use std::collections::BTreeMap;

/// Score of a candidate that does not satisfy its request
pub const MATCH_UNMET: i64 = 0;
/// Minimum score of a qualified candidate
pub const MATCH_MET: i64 = 1;

/// One edge of an evaluation group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalEdge {
    /// Amount offered below the edge
    pub count: u64,
    /// Amount to commit below the edge
    pub needs: u64,
    pub exclusive: bool,
    /// `None` for the synthetic root entry
    pub edge: Option<EdgeId>,
}

impl EvalEdge {
    pub fn new(count: u64, needs: u64, exclusive: bool, edge: Option<EdgeId>) -> Self {
        Self {
            count,
            needs,
            exclusive,
            edge,
        }
    }
}

/// A scored candidate for one (subsystem, type) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalGroup {
    pub score: i64,
    pub count: u64,
    pub needs: u64,
    pub exclusive: bool,
    /// Marks the root's own entry, which is never written to an edge
    pub root: bool,
    pub edges: Vec<EvalEdge>,
}

impl EvalGroup {
    pub fn new(score: i64, count: u64, exclusive: bool) -> Self {
        Self {
            score,
            count,
            needs: count,
            exclusive,
            root: false,
            edges: Vec::new(),
        }
    }

    /// Group holding a single edge offering `count`
    pub fn singleton(score: i64, count: u64, exclusive: bool, edge: Option<EdgeId>) -> Self {
        Self::new(score, count, exclusive).with_edge(EvalEdge::new(count, count, exclusive, edge))
    }

    pub fn with_edge(mut self, edge: EvalEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn qualified(&self) -> bool {
        self.score >= MATCH_MET
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Choice {
    #[default]
    Undecided,
    BestK,
    All,
}

#[derive(Debug, Clone, Default)]
struct TypeEvals {
    groups: Vec<EvalGroup>,
    qual_count: u64,
    total_count: u64,
    choice: Choice,
    best_i: usize,
    cursor: usize,
}

impl TypeEvals {
    fn add(&mut self, group: EvalGroup) {
        self.total_count += group.count;
        if group.qualified() {
            self.qual_count += group.count;
        }
        self.groups.push(group);
    }

    // Stable, so equal scores keep discovery order
    fn sort(&mut self) {
        self.groups.sort_by(|a, b| b.score.cmp(&a.score));
    }
}

/// Collects scored candidates per (subsystem, resource type) during a
/// traversal and decides which of them get committed.
#[derive(Debug, Clone, Default)]
pub struct ScoreAggregator {
    evals: BTreeMap<String, BTreeMap<String, TypeEvals>>,
    overall: Option<i64>,
    avail: u64,
    hier_constrain: bool,
}

impl ScoreAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.evals.values().all(|types| types.is_empty())
    }

    /// Append a candidate; order of addition is kept for tie-breaking
    pub fn add(&mut self, subsystem: &str, resource_type: &str, group: EvalGroup) {
        self.evals
            .entry(subsystem.to_string())
            .or_default()
            .entry(resource_type.to_string())
            .or_default()
            .add(group);
    }

    fn get(&self, subsystem: &str, resource_type: &str) -> Option<&TypeEvals> {
        self.evals.get(subsystem)?.get(resource_type)
    }

    fn get_mut(&mut self, subsystem: &str, resource_type: &str) -> Option<&mut TypeEvals> {
        self.evals.get_mut(subsystem)?.get_mut(resource_type)
    }

    pub fn subsystems(&self) -> Vec<String> {
        self.evals.keys().cloned().collect()
    }

    /// Resource types with candidates in `subsystem`
    pub fn resource_types(&self, subsystem: &str) -> Vec<String> {
        self.evals
            .get(subsystem)
            .map(|types| types.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sum of counts over qualified candidates
    pub fn qualified_count(&self, subsystem: &str, resource_type: &str) -> u64 {
        self.get(subsystem, resource_type)
            .map_or(0, |e| e.qual_count)
    }

    /// Sum of counts over all candidates
    pub fn total_count(&self, subsystem: &str, resource_type: &str) -> u64 {
        self.get(subsystem, resource_type)
            .map_or(0, |e| e.total_count)
    }

    /// Whether a top-k subset has been chosen for the pair
    pub fn best_k(&self, subsystem: &str, resource_type: &str) -> bool {
        self.get(subsystem, resource_type)
            .is_some_and(|e| e.choice == Choice::BestK)
    }

    /// Number of leading candidates to commit
    pub fn best_i(&self, subsystem: &str, resource_type: &str) -> usize {
        self.get(subsystem, resource_type).map_or(0, |e| e.best_i)
    }

    /// Rank candidates by score and accept them until `k` units are covered.
    /// Returns the number of units covered.
    pub fn choose_accum_best_k(&mut self, subsystem: &str, resource_type: &str, k: u64) -> u64 {
        let Some(evals) = self.get_mut(subsystem, resource_type) else {
            return 0;
        };
        evals.sort();
        evals.choice = Choice::BestK;
        evals.best_i = 0;

        let mut remaining = k;
        for (i, group) in evals.groups.iter_mut().enumerate() {
            if remaining == 0 || !group.qualified() {
                break;
            }
            let take = group.count.min(remaining);
            group.needs = take;
            if let [edge] = group.edges.as_mut_slice() {
                edge.needs = take;
            }
            remaining -= take;
            evals.best_i = i + 1;
        }
        k - remaining
    }

    /// Accept every qualified candidate. Returns the qualified count.
    pub fn choose_accum_all(&mut self, subsystem: &str, resource_type: &str) -> u64 {
        let Some(evals) = self.get_mut(subsystem, resource_type) else {
            return 0;
        };
        evals.sort();
        evals.choice = Choice::All;
        evals.best_i = evals.groups.iter().take_while(|g| g.qualified()).count();
        evals.qual_count
    }

    /// The i-th candidate of the pair
    pub fn at(&self, subsystem: &str, resource_type: &str, i: usize) -> Result<&EvalGroup> {
        self.get(subsystem, resource_type)
            .and_then(|e| e.groups.get(i))
            .ok_or_else(|| {
                SchedulerError::range_error(format!(
                    "no evaluation group {} for {}/{}",
                    i, subsystem, resource_type
                ))
            })
    }

    /// Accepted candidates of the pair, in commit order
    pub fn chosen(&self, subsystem: &str, resource_type: &str) -> &[EvalGroup] {
        self.get(subsystem, resource_type)
            .map(|e| &e.groups[..e.best_i.min(e.groups.len())])
            .unwrap_or(&[])
    }

    /// Fold a child's findings into this aggregator. Pairs narrowed to a
    /// top-k only contribute their accepted prefix.
    pub fn merge(&mut self, other: ScoreAggregator) {
        for (subsystem, types) in other.evals {
            for (resource_type, evals) in types {
                let keep = match evals.choice {
                    Choice::BestK => evals.best_i,
                    _ => evals.groups.len(),
                };
                for group in evals.groups.into_iter().take(keep) {
                    self.add(&subsystem, &resource_type, group);
                }
            }
        }
    }

    /// Explicit score if set, else the best qualified score (at least MATCH_MET)
    pub fn overall_score(&self) -> i64 {
        self.overall.unwrap_or_else(|| {
            self.evals
                .values()
                .flat_map(|types| types.values())
                .flat_map(|e| e.groups.iter())
                .filter(|g| g.qualified())
                .map(|g| g.score)
                .fold(MATCH_MET, i64::max)
        })
    }

    pub fn set_overall_score(&mut self, score: i64) {
        self.overall = Some(score);
    }

    pub fn avail(&self) -> u64 {
        self.avail
    }

    pub fn set_avail(&mut self, avail: u64) {
        self.avail = avail;
    }

    /// Whether decisions must be written to edges at this vertex instead of
    /// deferring them to the parent
    pub fn hier_constrain_now(&self) -> bool {
        self.hier_constrain
    }

    pub fn set_hier_constrain_now(&mut self, now: bool) {
        self.hier_constrain = now;
    }

    /// Reset the iteration cursor of the pair
    pub fn rewind(&mut self, subsystem: &str, resource_type: &str) {
        if let Some(evals) = self.get_mut(subsystem, resource_type) {
            evals.cursor = 0;
        }
    }

    /// Candidate under the cursor
    pub fn current(&self, subsystem: &str, resource_type: &str) -> Option<&EvalGroup> {
        self.get(subsystem, resource_type)
            .and_then(|e| e.groups.get(e.cursor))
    }

    /// Move the cursor forward; false once past the end
    pub fn advance(&mut self, subsystem: &str, resource_type: &str) -> bool {
        match self.get_mut(subsystem, resource_type) {
            Some(evals) if evals.cursor < evals.groups.len() => {
                evals.cursor += 1;
                evals.cursor < evals.groups.len()
            }
            _ => false,
        }
    }
}
