use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

use super::ExecutionResult;

/// Execution statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub total_execution_time_ms: f64,
    pub avg_execution_time_ms: f64,
    pub max_execution_time_ms: f64,
    /// Zero until the first query is recorded
    pub min_execution_time_ms: f64,
    /// Failure count per error category name
    pub error_counts: IndexMap<String, u64>,
}

impl ExecutionMetrics {
    pub fn update(&mut self, result: &ExecutionResult) {
        self.total_queries += 1;
        if result.success {
            self.successful_queries += 1;
        } else {
            self.failed_queries += 1;
            let key = result
                .error_type
                .map(|c| c.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *self.error_counts.entry(key).or_insert(0) += 1;
        }

        let elapsed = result.execution_time_ms;
        self.total_execution_time_ms += elapsed;
        self.avg_execution_time_ms = self.total_execution_time_ms / self.total_queries as f64;
        self.max_execution_time_ms = self.max_execution_time_ms.max(elapsed);
        self.min_execution_time_ms = if self.total_queries == 1 {
            elapsed
        } else {
            self.min_execution_time_ms.min(elapsed)
        };
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.successful_queries as f64 / self.total_queries as f64
        }
    }
}

impl fmt::Display for ExecutionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Metrics: {} queries, {:.1}% success, avg {:.1}ms",
            self.total_queries,
            self.success_rate() * 100.0,
            self.avg_execution_time_ms
        )
    }
}
