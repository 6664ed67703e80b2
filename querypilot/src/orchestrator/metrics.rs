//! Aggregate correction metrics
//!
//! First-attempt and corrected successes are tracked separately so that
//! correction does not hide weak first-pass generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::CorrectionResult;

/// Process-lifetime counters, shared across concurrent runs.
#[derive(Debug, Default)]
pub struct CorrectionMetrics {
    pub total_queries: AtomicU64,
    /// Succeeded on attempt 1
    pub first_attempt_success: AtomicU64,
    /// Succeeded after at least one retry
    pub corrected_success: AtomicU64,
    pub final_failures: AtomicU64,
    pub total_attempts: AtomicU64,
}

impl CorrectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one completed run into exactly one bucket.
    pub fn record(&self, result: &CorrectionResult) {
        self.record_outcome(result.success, result.attempts);
    }

    pub fn record_outcome(&self, success: bool, attempts: u32) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.total_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
        match (success, attempts) {
            (true, 1) => self.first_attempt_success.fetch_add(1, Ordering::Relaxed),
            (true, _) => self.corrected_success.fetch_add(1, Ordering::Relaxed),
            (false, _) => self.final_failures.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_queries,
            &self.first_attempt_success,
            &self.corrected_success,
            &self.final_failures,
            &self.total_attempts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn get_summary(&self) -> CorrectionMetricsSummary {
        CorrectionMetricsSummary {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            first_attempt_success: self.first_attempt_success.load(Ordering::Relaxed),
            corrected_success: self.corrected_success.load(Ordering::Relaxed),
            final_failures: self.final_failures.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`CorrectionMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionMetricsSummary {
    pub total_queries: u64,
    pub first_attempt_success: u64,
    pub corrected_success: u64,
    pub final_failures: u64,
    pub total_attempts: u64,
}

impl CorrectionMetricsSummary {
    /// How good generation is without any correction
    pub fn first_attempt_rate(&self) -> f64 {
        ratio(self.first_attempt_success, self.total_queries)
    }

    /// Share of initially failing questions that correction rescued.
    /// 1.0 when nothing failed initially.
    pub fn correction_effectiveness(&self) -> f64 {
        let failed_initially = self.total_queries - self.first_attempt_success;
        if failed_initially == 0 {
            1.0
        } else {
            self.corrected_success as f64 / failed_initially as f64
        }
    }

    pub fn overall_success_rate(&self) -> f64 {
        ratio(
            self.first_attempt_success + self.corrected_success,
            self.total_queries,
        )
    }

    pub fn avg_attempts(&self) -> f64 {
        ratio(self.total_attempts, self.total_queries)
    }

    /// Counters plus derived rates, for machine-readable reports
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_queries": self.total_queries,
            "first_attempt_success": self.first_attempt_success,
            "corrected_success": self.corrected_success,
            "final_failures": self.final_failures,
            "total_attempts": self.total_attempts,
            "first_attempt_rate": self.first_attempt_rate(),
            "correction_effectiveness": self.correction_effectiveness(),
            "overall_success_rate": self.overall_success_rate(),
            "avg_attempts": self.avg_attempts(),
        })
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl fmt::Display for CorrectionMetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total queries:            {}", self.total_queries)?;
        writeln!(
            f,
            "First attempt success:    {} ({:.1}%)",
            self.first_attempt_success,
            self.first_attempt_rate() * 100.0
        )?;
        writeln!(f, "Corrected success:        {}", self.corrected_success)?;
        writeln!(f, "Final failures:           {}", self.final_failures)?;
        writeln!(
            f,
            "Correction effectiveness: {:.1}%",
            self.correction_effectiveness() * 100.0
        )?;
        writeln!(
            f,
            "Overall success rate:     {:.1}%",
            self.overall_success_rate() * 100.0
        )?;
        write!(f, "Average attempts:         {:.2}", self.avg_attempts())
    }
}
