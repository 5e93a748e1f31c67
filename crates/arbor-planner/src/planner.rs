use crate::{PlannerError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Opaque span handle returned by [`Planner::add_span`]
pub type SpanId = u64;

/// One resource type tracked by a planner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannerResource {
    pub resource_type: String,
    pub total: u64,
}

/// A committed reservation over `[start, start + duration)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub id: SpanId,
    pub start: i64,
    pub duration: u64,
    /// Reserved amount per planner resource, in planner order
    pub counts: Vec<u64>,
}

impl Span {
    /// Exclusive end of the span
    pub fn end(&self) -> i64 {
        self.start.saturating_add(as_offset(self.duration))
    }

    fn covers(&self, t: i64) -> bool {
        self.start <= t && t < self.end()
    }
}

/// Enumeration state for `avail_time_first` / `avail_time_next`
#[derive(Debug, Clone)]
struct TimeCursor {
    last: i64,
    duration: u64,
    counts: Vec<u64>,
}

/// Tracks how much of each resource type is reserved over time.
///
/// Usage is a step function that only changes at span boundaries, so every
/// query scans the span table and evaluates the window at its start and at
/// each span start falling inside it.
#[derive(Debug, Clone)]
pub struct Planner {
    base_time: i64,
    horizon: u64,
    resources: Vec<PlannerResource>,
    spans: BTreeMap<SpanId, Span>,
    next_span: SpanId,
    cursor: Option<TimeCursor>,
}

fn as_offset(duration: u64) -> i64 {
    i64::try_from(duration).unwrap_or(i64::MAX)
}

impl Planner {
    /// Create a planner over `[base_time, base_time + horizon)` for the given totals
    pub fn new(base_time: i64, horizon: u64, totals: &[(&str, u64)]) -> Result<Self> {
        if horizon == 0 {
            return Err(PlannerError::invalid_argument("horizon must be positive"));
        }
        if totals.is_empty() {
            return Err(PlannerError::invalid_argument(
                "at least one resource type is required",
            ));
        }

        let mut resources = Vec::with_capacity(totals.len());
        for (resource_type, total) in totals {
            if resources
                .iter()
                .any(|r: &PlannerResource| r.resource_type == *resource_type)
            {
                return Err(PlannerError::invalid_argument(format!(
                    "duplicate resource type {}",
                    resource_type
                )));
            }
            resources.push(PlannerResource {
                resource_type: resource_type.to_string(),
                total: *total,
            });
        }

        Ok(Self {
            base_time,
            horizon,
            resources,
            spans: BTreeMap::new(),
            next_span: 1,
            cursor: None,
        })
    }

    pub fn base_time(&self) -> i64 {
        self.base_time
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Exclusive end of the planning horizon
    pub fn end_time(&self) -> i64 {
        self.base_time.saturating_add(as_offset(self.horizon))
    }

    pub fn resources(&self) -> &[PlannerResource] {
        &self.resources
    }

    /// Resource types in planner order
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|r| r.resource_type.as_str())
    }

    /// Index of a resource type in planner order
    pub fn resource_index(&self, resource_type: &str) -> Option<usize> {
        self.resources
            .iter()
            .position(|r| r.resource_type == resource_type)
    }

    /// Build the planner-ordered count vector for a type → count map;
    /// types the planner does not track are ignored, missing ones are zero.
    pub fn counts_for(&self, lookup: &BTreeMap<String, u64>) -> Vec<u64> {
        self.resources
            .iter()
            .map(|r| lookup.get(&r.resource_type).copied().unwrap_or(0))
            .collect()
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    pub fn span(&self, span_id: SpanId) -> Option<&Span> {
        self.spans.get(&span_id)
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.values()
    }

    fn in_horizon(&self, at: i64, duration: u64) -> bool {
        duration > 0
            && at >= self.base_time
            && at
                .checked_add(as_offset(duration))
                .is_some_and(|end| end <= self.end_time())
    }

    fn check_counts(&self, counts: &[u64]) -> Result<()> {
        if counts.len() != self.resources.len() {
            return Err(PlannerError::invalid_argument(format!(
                "expected {} counts, got {}",
                self.resources.len(),
                counts.len()
            )));
        }
        Ok(())
    }

    fn used_at(&self, t: i64, index: usize) -> u64 {
        self.spans
            .values()
            .filter(|s| s.covers(t))
            .map(|s| s.counts[index])
            .sum()
    }

    fn residual_during(&self, at: i64, duration: u64, index: usize) -> u64 {
        let end = at.saturating_add(as_offset(duration));
        let total = self.resources[index].total;
        std::iter::once(at)
            .chain(
                self.spans
                    .values()
                    .map(|s| s.start)
                    .filter(|&start| start > at && start < end),
            )
            .map(|t| total.saturating_sub(self.used_at(t, index)))
            .min()
            .unwrap_or(total)
    }

    /// Capacity of one resource type left free throughout the window.
    /// A window outside the horizon has no capacity.
    pub fn avail_resources_during(&self, at: i64, duration: u64, index: usize) -> Result<u64> {
        if index >= self.resources.len() {
            return Err(PlannerError::invalid_argument(format!(
                "resource index {} out of bounds",
                index
            )));
        }
        if !self.in_horizon(at, duration) {
            return Ok(0);
        }
        Ok(self.residual_during(at, duration, index))
    }

    /// Capacity of one resource type free at instant `at`
    pub fn avail_resources_at(&self, at: i64, index: usize) -> Result<u64> {
        self.avail_resources_during(at, 1, index)
    }

    /// Whether every listed count fits throughout the window
    pub fn avail_during(&self, at: i64, duration: u64, counts: &[u64]) -> Result<bool> {
        self.check_counts(counts)?;
        if !self.in_horizon(at, duration) {
            return Ok(false);
        }
        Ok(counts
            .iter()
            .enumerate()
            .all(|(i, &c)| c == 0 || self.residual_during(at, duration, i) >= c))
    }

    /// Reserve `counts` over `[at, at + duration)`
    pub fn add_span(&mut self, at: i64, duration: u64, counts: &[u64]) -> Result<SpanId> {
        self.check_counts(counts)?;
        if !self.in_horizon(at, duration) {
            return Err(PlannerError::out_of_range(at, duration));
        }
        for (i, &requested) in counts.iter().enumerate() {
            let available = self.residual_during(at, duration, i);
            if requested > available {
                return Err(PlannerError::insufficient_resources(
                    &self.resources[i].resource_type,
                    requested,
                    available,
                    at,
                ));
            }
        }

        let id = self.next_span;
        self.next_span += 1;
        self.spans.insert(
            id,
            Span {
                id,
                start: at,
                duration,
                counts: counts.to_vec(),
            },
        );
        debug!("Added span {} at {} for {}", id, at, duration);
        Ok(id)
    }

    /// Release a previously added span
    pub fn remove_span(&mut self, span_id: SpanId) -> Result<()> {
        self.spans
            .remove(&span_id)
            .map(|_| debug!("Removed span {}", span_id))
            .ok_or_else(|| PlannerError::span_not_found(span_id))
    }

    fn next_fit_after(&self, floor: i64, inclusive: bool, cursor: &TimeCursor) -> Option<i64> {
        let candidates: BTreeSet<i64> = std::iter::once(floor.max(self.base_time))
            .chain(self.spans.values().map(Span::end))
            .filter(|&t| if inclusive { t >= floor } else { t > floor })
            .collect();

        candidates.into_iter().find(|&t| {
            self.in_horizon(t, cursor.duration)
                && cursor
                    .counts
                    .iter()
                    .enumerate()
                    .all(|(i, &c)| c == 0 || self.residual_during(t, cursor.duration, i) >= c)
        })
    }

    /// Earliest start at or after `on_or_after` where `counts` fit for `duration`.
    /// Starts an enumeration continued by [`Planner::avail_time_next`].
    pub fn avail_time_first(
        &mut self,
        on_or_after: i64,
        duration: u64,
        counts: &[u64],
    ) -> Result<Option<i64>> {
        self.check_counts(counts)?;
        let mut cursor = TimeCursor {
            last: on_or_after,
            duration,
            counts: counts.to_vec(),
        };
        let found = self.next_fit_after(on_or_after, true, &cursor);
        if let Some(t) = found {
            cursor.last = t;
            self.cursor = Some(cursor);
        } else {
            self.cursor = None;
        }
        Ok(found)
    }

    /// Next feasible start after the one last returned; `None` when exhausted
    pub fn avail_time_next(&mut self) -> Option<i64> {
        let mut cursor = self.cursor.take()?;
        let found = self.next_fit_after(cursor.last, false, &cursor);
        if let Some(t) = found {
            cursor.last = t;
            self.cursor = Some(cursor);
        }
        found
    }
}
