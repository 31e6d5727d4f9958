//! The three-stage selection pipeline.
//!
//! Given one request and one snapshot of nodes, the selector:
//! 1. Drops nodes in another pool, non-dedicated nodes for dedicated
//!    requests, and nodes with no free VM slot
//! 2. Drops nodes whose floored spare CPU or memory is below the request
//! 3. Ranks the rest by score descending, then by name ascending
//!
//! The result depends only on its inputs, so identical input always
//! selects the same node.

use std::cmp::Ordering;

use tracing::debug;

use virtflow_core::{Node, SchedulingRequest};

use crate::scorer::ScoringStrategy;

/// A candidate that survived both filters, with its score.
#[derive(Debug, Clone, Copy)]
pub struct NodeScore<'a> {
    pub node: &'a Node,
    pub score: f64,
}

/// Stage 1: pool, dedicated, and slot constraints.
pub fn is_eligible(req: &SchedulingRequest, node: &Node) -> bool {
    node.pool == req.requested_pool && (!req.dedicated || node.dedicated) && node.has_free_slot()
}

/// Stage 2: floored spare CPU and memory cover the request.
pub fn has_capacity(req: &SchedulingRequest, node: &Node) -> bool {
    node.available_cpu() >= u64::from(req.requested_cpu)
        && node.available_memory() >= req.requested_memory
}

pub fn prefilter<'a>(req: &SchedulingRequest, nodes: &'a [Node]) -> Vec<&'a Node> {
    nodes.iter().filter(|n| is_eligible(req, n)).collect()
}

pub fn capacity_filter<'a>(req: &SchedulingRequest, candidates: Vec<&'a Node>) -> Vec<&'a Node> {
    candidates
        .into_iter()
        .filter(|n| has_capacity(req, n))
        .collect()
}

/// Scores closer than this compare equal.
const SCORE_RESOLUTION: f64 = 1e-9;

/// Score quantized to [`SCORE_RESOLUTION`] so that rounding noise in the
/// float sums (0.9 + 0.8 versus 0.7 + 1.0) still counts as a tie.
fn score_key(score: f64) -> i64 {
    (score / SCORE_RESOLUTION).round() as i64
}

/// Best-first ordering: higher score, then lexicographically smaller name.
fn best_first(a: &NodeScore<'_>, b: &NodeScore<'_>) -> Ordering {
    score_key(b.score)
        .cmp(&score_key(a.score))
        .then_with(|| a.node.name.cmp(&b.node.name))
}

/// Deterministic node selector bound to one scoring strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selector {
    strategy: ScoringStrategy,
}

impl Selector {
    pub fn new(strategy: ScoringStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ScoringStrategy {
        self.strategy
    }

    /// Every node passing both filters, best first.
    pub fn rank<'a>(&self, req: &SchedulingRequest, nodes: &'a [Node]) -> Vec<NodeScore<'a>> {
        let eligible = prefilter(req, nodes);
        let eligible_count = eligible.len();
        let fitting = capacity_filter(req, eligible);

        let mut scores: Vec<NodeScore<'a>> = fitting
            .into_iter()
            .map(|node| NodeScore {
                node,
                score: self.strategy.score(node),
            })
            .collect();
        scores.sort_by(best_first);

        debug!(
            strategy = self.strategy.name(),
            total = nodes.len(),
            eligible = eligible_count,
            candidates = scores.len(),
            "ranked nodes"
        );
        scores
    }

    /// The best node for the request, or `None` when no node is eligible.
    pub fn select<'a>(&self, req: &SchedulingRequest, nodes: &'a [Node]) -> Option<&'a Node> {
        self.rank(req, nodes).first().map(|s| s.node)
    }
}
