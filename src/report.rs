use crate::recommend::{Advice, RecommendationRow, WorkloadRecommendation};
use serde::Serialize;

/// Rows of every processed workload, in processing order, with the running totals.
///
/// Totals are savings in cores and bytes: negative when the recommendations
/// increase the reserved capacity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    rows: Vec<RecommendationRow>,
    cpu_delta: f64,
    memory_delta: f64,
}

impl Report {
    pub fn push(&mut self, recommendation: WorkloadRecommendation) {
        self.cpu_delta += recommendation.cpu_delta;
        self.memory_delta += recommendation.memory_delta;
        self.rows.extend(recommendation.rows);
    }

    pub fn rows(&self) -> &[RecommendationRow] {
        &self.rows
    }

    pub fn cpu_delta(&self) -> f64 {
        self.cpu_delta
    }

    pub fn memory_delta(&self) -> f64 {
        self.memory_delta
    }

    /// Number of (container, resource) pairs without recommendation.
    pub fn undetermined(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|r| [&r.request_cpu, &r.limit_cpu, &r.request_memory, &r.limit_memory])
            .filter(|e| e.advice == Advice::Unknown)
            .count()
    }
}
