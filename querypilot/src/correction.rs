//! Correction strategies
//!
//! Maps a failure to a short regeneration instruction for the generator.
//! Instructions aim to stay under roughly 100 words; the generator already
//! receives the schema separately.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::executor::ErrorCategory;

/// Word budget a correction instruction should stay under
pub const PROMPT_WORD_BUDGET: usize = 100;

static MISSING_COLUMN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)column ['"](\w+)['"]"#).unwrap());

/// Produces a regeneration instruction for one error category.
pub trait CorrectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate_prompt(&self, error_feedback: &str, failed_sql: &str, question: &str) -> String;
}

/// Column names: forbid the offending name and ask for a schema column.
pub struct ColumnNotFoundStrategy;

impl CorrectionStrategy for ColumnNotFoundStrategy {
    fn name(&self) -> &'static str {
        "ColumnNotFoundStrategy"
    }

    fn generate_prompt(&self, error_feedback: &str, failed_sql: &str, question: &str) -> String {
        let missing = MISSING_COLUMN_RE
            .captures(error_feedback)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .unwrap_or("unknown");
        info!("[ColumnStrategy] Extracted missing column: '{}'", missing);

        format!(
            "Failed SQL:\n{sql}\n\nError: Column '{col}' does not exist.\n\
             DO NOT use column '{col}' again.\n\
             Replace it using correct schema columns.\n\
             Return corrected SQL only for: {q}",
            sql = failed_sql,
            col = missing,
            q = question
        )
    }
}

/// GROUP BY fixes only. Joins and aggregates must stay as they are, or
/// successive corrections flip-flop between adding and dropping aggregates.
pub struct AggregationErrorStrategy;

impl CorrectionStrategy for AggregationErrorStrategy {
    fn name(&self) -> &'static str {
        "AggregationErrorStrategy"
    }

    fn generate_prompt(&self, _error_feedback: &str, failed_sql: &str, question: &str) -> String {
        info!("[AggregationStrategy] Fixing GROUP BY clause");
        format!(
            "Failed SQL:\n{}\n\nError: Missing GROUP BY clause.\n\
             Do NOT change joins or aggregations.\n\
             Only add required columns to GROUP BY.\n\
             Return corrected SQL for: {}",
            failed_sql, question
        )
    }
}

/// Simplification hints for slow queries
pub struct TimeoutStrategy {
    timeout_seconds: u64,
}

impl TimeoutStrategy {
    pub fn new(timeout_seconds: u64) -> Self {
        Self { timeout_seconds }
    }
}

impl CorrectionStrategy for TimeoutStrategy {
    fn name(&self) -> &'static str {
        "TimeoutStrategy"
    }

    fn generate_prompt(&self, _error_feedback: &str, failed_sql: &str, question: &str) -> String {
        info!("[TimeoutStrategy] Simplifying query to avoid timeout");
        let mut hints = Vec::new();
        if !crate::sql_text::has_limit(failed_sql) {
            hints.push("Add LIMIT 100 if missing");
        }
        hints.push("Remove unnecessary JOINs");
        hints.push("Simplify complex aggregations");
        let hints_text = hints
            .iter()
            .map(|h| format!("- {}", h))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Failed SQL (timed out after {} seconds):\n{}\n\nError: Query timeout.\n\
             Simplify the query:\n{}\n\nRegenerate simpler SQL for: {}",
            self.timeout_seconds, failed_sql, hints_text, question
        )
    }
}

/// Everything else: pass the executor feedback through verbatim.
pub struct GenericStrategy;

impl CorrectionStrategy for GenericStrategy {
    fn name(&self) -> &'static str {
        "GenericStrategy"
    }

    fn generate_prompt(&self, error_feedback: &str, failed_sql: &str, question: &str) -> String {
        info!("[GenericStrategy] Using generic correction");
        format!(
            "Failed SQL:\n{}\n\nError:\n{}\n\nDo NOT repeat the same mistake.\n\
             Return corrected SQL only for: {}",
            failed_sql, error_feedback, question
        )
    }
}

/// Routes an error category to its correction strategy.
pub struct CorrectionStrategyRouter {
    strategies: HashMap<ErrorCategory, Box<dyn CorrectionStrategy>>,
    default: Box<dyn CorrectionStrategy>,
}

impl Default for CorrectionStrategyRouter {
    fn default() -> Self {
        Self::new(30)
    }
}

impl CorrectionStrategyRouter {
    pub fn new(timeout_seconds: u64) -> Self {
        let mut strategies: HashMap<ErrorCategory, Box<dyn CorrectionStrategy>> = HashMap::new();
        strategies.insert(ErrorCategory::ColumnNotFound, Box::new(ColumnNotFoundStrategy));
        strategies.insert(ErrorCategory::AggregationError, Box::new(AggregationErrorStrategy));
        strategies.insert(
            ErrorCategory::Timeout,
            Box::new(TimeoutStrategy::new(timeout_seconds)),
        );
        Self {
            strategies,
            default: Box::new(GenericStrategy),
        }
    }

    pub fn get_strategy(&self, category: ErrorCategory) -> &dyn CorrectionStrategy {
        self.strategies
            .get(&category)
            .map(|s| s.as_ref())
            .unwrap_or(self.default.as_ref())
    }

    pub fn generate_prompt(
        &self,
        category: ErrorCategory,
        error_feedback: &str,
        failed_sql: &str,
        question: &str,
    ) -> String {
        let strategy = self.get_strategy(category);
        info!("[CorrectionRouter] Routing {} → {}", category, strategy.name());

        let prompt = strategy.generate_prompt(error_feedback, failed_sql, question);
        log_prompt_size("CorrectionRouter", &prompt);
        prompt
    }
}

/// Instruction used when the validator blocked SQL before execution, so
/// there is no execution error to route on.
pub fn build_validator_correction_prompt(
    failed_sql: &str,
    issues: &[String],
    question: &str,
) -> String {
    info!("[ValidatorCorrection] Building prompt for {} issues", issues.len());
    let issues_text = issues
        .iter()
        .map(|issue| format!("- {}", issue))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Failed SQL:\n{}\n\nValidation Issues:\n{}\n\nFix and regenerate for: {}",
        failed_sql, issues_text, question
    );
    log_prompt_size("ValidatorCorrection", &prompt);
    prompt
}

fn log_prompt_size(component: &str, prompt: &str) {
    let words = prompt.split_whitespace().count();
    info!("[{}] Generated prompt ({} words)", component, words);
    if words > PROMPT_WORD_BUDGET {
        warn!("[{}] Prompt exceeds {} words: {}", component, PROMPT_WORD_BUDGET, words);
    }
}
