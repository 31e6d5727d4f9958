//! virtflow-placement — choose a bare-metal node for a VM request.
//!
//! Selection is a pure function of one request and one inventory snapshot:
//!
//! 1. **Eligibility** — pool match, dedicated compatibility, free VM slot
//! 2. **Capacity** — floored spare CPU and memory cover the request
//! 3. **Scoring** — rank by the configured [`ScoringStrategy`], ties by name
//!
//! Stages 1 and 2 are hard constraints; a node failing either is never
//! ranked, whatever its score would be.
//!
//! # Components
//!
//! - **`scorer`** — Scoring strategies (combined spare, CPU, memory, weighted)
//! - **`selector`** — The filter/score pipeline

pub mod scorer;
pub mod selector;

pub use scorer::{ScoringStrategy, ScoringWeights};
pub use selector::{NodeScore, Selector, capacity_filter, has_capacity, is_eligible, prefilter};
