//! Per-run state and routing decisions

use serde::Serialize;
use std::fmt;

use crate::executor::{ErrorCategory, ExecutionResult};
use crate::schema::SchemaContext;
use crate::sql_text::normalize_sql;
use crate::validator::ValidationResult;

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "category", rename_all = "snake_case")]
pub enum TerminationReason {
    Success,
    /// Last attempt was blocked by the validator
    ValidationExhausted,
    /// Last attempt failed at execution
    ExecutionExhausted,
    /// Execution failed with a category that retrying cannot fix
    NonRetryable(ErrorCategory),
    /// The two latest attempts produced the same normalized SQL
    RetryGuard,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminationReason::Success)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Success => write!(f, "success"),
            TerminationReason::ValidationExhausted => {
                write!(f, "max attempts reached (blocked by validator)")
            }
            TerminationReason::ExecutionExhausted => {
                write!(f, "max attempts reached (execution failed)")
            }
            TerminationReason::NonRetryable(category) => {
                write!(f, "non-retryable error: {}", category)
            }
            TerminationReason::RetryGuard => write!(f, "SQL unchanged (retry guard triggered)"),
        }
    }
}

/// Orchestrator phases. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SchemaLink,
    Generate,
    Validate,
    Execute,
    Retry,
    Done(TerminationReason),
}

/// State owned by a single run.
#[derive(Debug, Clone)]
pub struct CorrectionState {
    pub question: String,
    /// Fetched once in `SchemaLink` and reused by every attempt
    pub schema: SchemaContext,
    pub generated_sql: String,
    pub validation: Option<ValidationResult>,
    pub execution: Option<ExecutionResult>,
    /// 1-based; counts completed Generate steps
    pub attempt: u32,
    pub max_attempts: u32,
    /// One entry per attempt; the last is replaced when validation repairs it.
    pub previous_sqls: Vec<String>,
    pub used_repair: bool,
    pub final_success: bool,
}

impl CorrectionState {
    pub fn new(question: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            question: question.into(),
            schema: SchemaContext::new(),
            generated_sql: String::new(),
            validation: None,
            execution: None,
            attempt: 1,
            max_attempts,
            previous_sqls: Vec::new(),
            used_repair: false,
            final_success: false,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record freshly generated SQL for this attempt.
    pub fn record_sql(&mut self, sql: String) {
        self.previous_sqls.push(sql.clone());
        self.generated_sql = sql;
        self.validation = None;
        self.execution = None;
    }

    /// True when the two most recent attempts normalize to the same SQL.
    pub fn sql_unchanged(&self) -> bool {
        match self.previous_sqls.as_slice() {
            [.., previous, current] => normalize_sql(previous) == normalize_sql(current),
            _ => false,
        }
    }

    /// Whether the last blocking signal came from the validator rather than
    /// from execution.
    pub fn blocked_by_validator(&self) -> bool {
        self.validation.as_ref().map_or(false, |v| !v.is_valid)
    }

    pub fn route_after_validate(&self) -> Phase {
        let Some(validation) = &self.validation else {
            return Phase::Validate;
        };
        if validation.is_valid {
            Phase::Execute
        } else if self.attempts_exhausted() {
            Phase::Done(TerminationReason::ValidationExhausted)
        } else {
            Phase::Retry
        }
    }

    /// Checked in order: success, exhausted, non-retryable, retry guard.
    pub fn route_after_execute(&self) -> Phase {
        let Some(execution) = &self.execution else {
            return Phase::Execute;
        };
        if execution.success {
            return Phase::Done(TerminationReason::Success);
        }
        if self.attempts_exhausted() {
            return Phase::Done(TerminationReason::ExecutionExhausted);
        }
        let category = execution.error_type.unwrap_or(ErrorCategory::Unknown);
        if !category.is_retryable() {
            return Phase::Done(TerminationReason::NonRetryable(category));
        }
        if self.sql_unchanged() {
            return Phase::Done(TerminationReason::RetryGuard);
        }
        Phase::Retry
    }

    /// Move to the next attempt. A run that already succeeded stays put.
    pub fn advance_attempt(&mut self) {
        if !self.final_success {
            self.attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{LayerResults, ValidationResult};

    fn verdict(is_valid: bool) -> ValidationResult {
        ValidationResult {
            confidence: if is_valid { 1.0 } else { 0.6 },
            is_valid,
            issues: Vec::new(),
            layer_results: LayerResults::default(),
        }
    }

    fn failure(category: ErrorCategory) -> ExecutionResult {
        ExecutionResult {
            success: false,
            error_type: Some(category),
            ..Default::default()
        }
    }

    #[test]
    fn validation_routes() {
        let mut state = CorrectionState::new("q", 3);
        state.record_sql("SELECT 1".to_string());
        assert_eq!(state.route_after_validate(), Phase::Validate);

        state.validation = Some(verdict(true));
        assert_eq!(state.route_after_validate(), Phase::Execute);

        state.validation = Some(verdict(false));
        assert_eq!(state.route_after_validate(), Phase::Retry);

        state.attempt = 3;
        assert_eq!(
            state.route_after_validate(),
            Phase::Done(TerminationReason::ValidationExhausted)
        );
    }

    #[test]
    fn success_wins_over_everything() {
        let mut state = CorrectionState::new("q", 1);
        state.record_sql("SELECT 1".to_string());
        state.record_sql("SELECT 1".to_string());
        state.execution = Some(ExecutionResult {
            success: true,
            ..Default::default()
        });
        assert_eq!(state.route_after_execute(), Phase::Done(TerminationReason::Success));
    }

    #[test]
    fn execution_route_order() {
        let mut state = CorrectionState::new("q", 3);
        state.record_sql("SELECT id FROM t".to_string());
        state.execution = Some(failure(ErrorCategory::PermissionDenied));
        assert_eq!(
            state.route_after_execute(),
            Phase::Done(TerminationReason::NonRetryable(ErrorCategory::PermissionDenied))
        );

        state.execution = Some(failure(ErrorCategory::Timeout));
        assert_eq!(state.route_after_execute(), Phase::Retry);

        state.record_sql("select  id\nFROM t -- again".to_string());
        state.execution = Some(failure(ErrorCategory::ColumnNotFound));
        assert!(state.sql_unchanged());
        assert_eq!(state.route_after_execute(), Phase::Done(TerminationReason::RetryGuard));

        // Exhaustion is checked before the category
        state.attempt = 3;
        state.execution = Some(failure(ErrorCategory::ConnectionError));
        assert_eq!(
            state.route_after_execute(),
            Phase::Done(TerminationReason::ExecutionExhausted)
        );
    }

    #[test]
    fn advance_is_frozen_after_success() {
        let mut state = CorrectionState::new("q", 3);
        state.advance_attempt();
        assert_eq!(state.attempt, 2);
        state.final_success = true;
        state.advance_attempt();
        assert_eq!(state.attempt, 2);
    }

    #[test]
    fn termination_serializes_with_category() {
        let reason = TerminationReason::NonRetryable(ErrorCategory::ConnectionError);
        let json = serde_json::to_value(reason).unwrap();
        assert_eq!(json["reason"], "non_retryable");
        assert_eq!(json["category"], "connection_error");
        assert_eq!(
            serde_json::to_value(TerminationReason::RetryGuard).unwrap()["reason"],
            "retry_guard"
        );
    }
}
