//! Node scoring for placement decisions.
//!
//! Every strategy scores spare capacity: higher is better. Scores are only
//! compared between nodes that already passed eligibility and capacity.

use virtflow_core::Node;
use virtflow_core::config::{PlacementConfig, StrategyKind};

/// Weights for the `Weighted` strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub cpu: f64,
    pub memory: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
        }
    }
}

/// How eligible nodes are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScoringStrategy {
    /// `(1 - usage_cpu) + (1 - usage_mem)`.
    #[default]
    CombinedSpare,
    /// `1 - usage_cpu`: the least CPU-loaded node wins.
    CpuSpare,
    /// `1 - usage_mem`: the least memory-loaded node wins.
    MemorySpare,
    /// `cpu * (1 - usage_cpu) + memory * (1 - usage_mem)`.
    Weighted(ScoringWeights),
}

impl ScoringStrategy {
    pub fn from_config(config: &PlacementConfig) -> Self {
        match config.strategy {
            StrategyKind::CombinedSpare => ScoringStrategy::CombinedSpare,
            StrategyKind::CpuSpare => ScoringStrategy::CpuSpare,
            StrategyKind::MemorySpare => ScoringStrategy::MemorySpare,
            StrategyKind::Weighted => ScoringStrategy::Weighted(ScoringWeights {
                cpu: config.cpu_weight,
                memory: config.memory_weight,
            }),
        }
    }

    /// Score a node; higher is better.
    pub fn score(&self, node: &Node) -> f64 {
        let spare_cpu = 1.0 - node.usage_cpu;
        let spare_mem = 1.0 - node.usage_mem;
        match self {
            ScoringStrategy::CombinedSpare => spare_cpu + spare_mem,
            ScoringStrategy::CpuSpare => spare_cpu,
            ScoringStrategy::MemorySpare => spare_mem,
            ScoringStrategy::Weighted(w) => w.cpu * spare_cpu + w.memory * spare_mem,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScoringStrategy::CombinedSpare => "combined_spare",
            ScoringStrategy::CpuSpare => "cpu_spare",
            ScoringStrategy::MemorySpare => "memory_spare",
            ScoringStrategy::Weighted(_) => "weighted",
        }
    }
}
