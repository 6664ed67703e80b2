//! Bounded self-correction loop
//!
//! ```text
//! SchemaLink (once)
//!     ↓
//! Generate ←──────────────┐
//!     ↓                   │
//! Validate                │
//!     ├─ valid → Execute  │
//!     │            ├─ success → Done
//!     │            └─ retryable failure → Retry ─┘
//!     └─ invalid → Retry ─┘
//! ```
//!
//! Generation is attempt-indexed: attempt 1 asks the generator, attempt 2
//! runs the deterministic column fixer on the previous SQL without a model
//! call, and later attempts ask the generator again with a correction
//! prompt built from the validator issues or the execution feedback.

pub mod metrics;
pub mod state;

pub use metrics::{CorrectionMetrics, CorrectionMetricsSummary};
pub use state::{CorrectionState, Phase, TerminationReason};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::QueryPilotConfig;
use crate::correction::{build_validator_correction_prompt, CorrectionStrategyRouter};
use crate::error::CorrectionError;
use crate::executor::{
    ErrorCategory, ErrorClassifier, ExecutionMetrics, ExecutionResult, ExecutionService, Executor,
};
use crate::generation::{GenerationError, SqlGenerator};
use crate::schema::SchemaProvider;
use crate::sql_text::{normalize_sql, sql_diff, strip_code_fences};
use crate::validator::{ValidationResult, Validator};

const VALIDATOR_PROMPT_PREFIX: &str =
    "IMPORTANT: Previous SQL was incorrect. You MUST fix the error.";
const EXECUTION_PROMPT_PREFIX: &str =
    "IMPORTANT: Previous SQL was incorrect.\n\
     You MUST fix the listed issues.\n\
     Do NOT repeat the same SQL.";

/// Outcome of one question
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionResult {
    pub run_id: String,
    pub question: String,
    /// SQL of the last attempt
    pub final_sql: String,
    pub success: bool,
    pub attempts: u32,
    pub termination: TerminationReason,
    /// Whether the column fixer changed any SQL during the run
    pub used_repair: bool,
    /// Validator verdict for the last attempt
    pub validation: Option<ValidationResult>,
    /// Execution of the last attempt; `None` when the validator blocked it
    pub execution: Option<ExecutionResult>,
    /// Final SQL of each attempt, in order. An entry holds the repaired
    /// text when the validator's column fixer rewrote the generated SQL.
    pub sql_history: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
}

impl CorrectionResult {
    /// Succeeded, but only after at least one retry
    pub fn was_corrected(&self) -> bool {
        self.success && self.attempts > 1
    }

    /// Latest failure description: execution feedback, else validator issues.
    pub fn failure_summary(&self) -> Option<String> {
        if self.success {
            return None;
        }
        if let Some(execution) = &self.execution {
            return execution
                .error_feedback
                .clone()
                .or_else(|| execution.error_message.clone());
        }
        self.validation
            .as_ref()
            .map(|validation| validation.issues.join("; "))
    }
}

impl fmt::Display for CorrectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(
                f,
                "✓ SUCCESS after {} attempt(s): {}",
                self.attempts, self.final_sql
            )
        } else {
            write!(
                f,
                "✗ FAILED after {} attempt(s) ({}): {}",
                self.attempts, self.termination, self.final_sql
            )
        }
    }
}

/// Assembles an [`Orchestrator`] from configuration and collaborators.
pub struct OrchestratorBuilder {
    config: QueryPilotConfig,
    schema_provider: Option<Arc<dyn SchemaProvider>>,
    generator: Option<Arc<dyn SqlGenerator>>,
    execution_service: Option<Arc<dyn ExecutionService>>,
    classifier: Option<ErrorClassifier>,
    metrics: Option<Arc<CorrectionMetrics>>,
}

impl OrchestratorBuilder {
    pub fn schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema_provider = Some(provider);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn SqlGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn execution_service(mut self, service: Arc<dyn ExecutionService>) -> Self {
        self.execution_service = Some(service);
        self
    }

    /// Override the classifier derived from `[executor] dialect`.
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Share an aggregate across several orchestrators.
    pub fn metrics(mut self, metrics: Arc<CorrectionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Orchestrator, CorrectionError> {
        self.config.validate()?;

        let schema_provider = self
            .schema_provider
            .ok_or(CorrectionError::MissingComponent("schema provider"))?;
        let generator = self
            .generator
            .ok_or(CorrectionError::MissingComponent("SQL generator"))?;
        let service = self
            .execution_service
            .ok_or(CorrectionError::MissingComponent("execution service"))?;

        let mut executor = Executor::new(service, &self.config);
        if let Some(classifier) = self.classifier {
            executor = executor.with_classifier(classifier);
        }

        Ok(Orchestrator {
            validator: Validator::from_config(&self.config),
            router: CorrectionStrategyRouter::new(self.config.executor.timeout_seconds),
            metrics: self.metrics.unwrap_or_default(),
            schema_provider,
            generator,
            executor,
            config: self.config,
        })
    }
}

/// Runs questions through the bounded correction loop.
///
/// Runs share nothing but the metrics aggregate, so one orchestrator can
/// serve concurrent questions.
pub struct Orchestrator {
    config: QueryPilotConfig,
    schema_provider: Arc<dyn SchemaProvider>,
    generator: Arc<dyn SqlGenerator>,
    validator: Validator,
    executor: Executor,
    router: CorrectionStrategyRouter,
    metrics: Arc<CorrectionMetrics>,
}

impl Orchestrator {
    pub fn builder(config: QueryPilotConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            schema_provider: None,
            generator: None,
            execution_service: None,
            classifier: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &QueryPilotConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<CorrectionMetrics> {
        &self.metrics
    }

    pub fn executor_metrics(&self) -> ExecutionMetrics {
        self.executor.get_metrics()
    }

    /// Resolve one question. Failed SQL is reported in the result; only
    /// unreachable collaborators produce `Err`.
    pub async fn run(&self, question: &str) -> Result<CorrectionResult, CorrectionError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("correction_run", run_id = %run_id);
        self.run_inner(run_id, question).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: String,
        question: &str,
    ) -> Result<CorrectionResult, CorrectionError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = CorrectionState::new(question, self.config.correction.max_attempts);
        let mut phase = Phase::SchemaLink;

        let termination = loop {
            phase = match phase {
                Phase::SchemaLink => {
                    info!("[SchemaLink] Question: {}", question);
                    state.schema = self.schema_provider.get_schema(question).await?;
                    info!(
                        "[SchemaLink] Cached {} tables for all attempts",
                        state.schema.len()
                    );
                    Phase::Generate
                }
                Phase::Generate => {
                    info!(
                        "[Generate] Attempt {}/{}",
                        state.attempt, state.max_attempts
                    );
                    let sql = self.generate(&mut state).await?;
                    log_generated(&state, &sql);
                    state.record_sql(sql);
                    Phase::Validate
                }
                Phase::Validate => {
                    self.validate(&mut state);
                    state.route_after_validate()
                }
                Phase::Execute => {
                    let result = self
                        .executor
                        .execute(&state.generated_sql, &state.schema)
                        .await?;
                    if result.success {
                        state.final_success = true;
                    }
                    state.execution = Some(result);
                    state.route_after_execute()
                }
                Phase::Retry => {
                    state.advance_attempt();
                    info!(
                        "[Retry] Incrementing to attempt {}/{}",
                        state.attempt, state.max_attempts
                    );
                    Phase::Generate
                }
                Phase::Done(reason) => break reason,
            };
            if let Phase::Done(reason) = phase {
                log_termination(&state, reason);
            }
        };

        let result = CorrectionResult {
            run_id,
            question: state.question,
            final_sql: state.generated_sql,
            success: state.final_success,
            attempts: state.attempt,
            termination,
            used_repair: state.used_repair,
            validation: state.validation,
            execution: state.execution,
            sql_history: state.previous_sqls,
            started_at,
            duration_ms: clock.elapsed().as_secs_f64() * 1000.0,
        };
        self.metrics.record(&result);
        Ok(result)
    }

    async fn generate(&self, state: &mut CorrectionState) -> Result<String, CorrectionError> {
        match state.attempt {
            1 => {
                info!("[Generate] First attempt - generating SQL");
                self.bounded(self.generator.generate(&state.question, &state.schema))
                    .await
            }
            2 => {
                info!("[Generate] Attempt 2 - auto column repair");
                let previous = state.previous_sqls.last().cloned().unwrap_or_default();
                let repair = self.validator.repair().repair(&previous, &state.schema);
                if repair.is_repaired() {
                    state.used_repair = true;
                    info!("[Generate] Column repair applied");
                } else {
                    info!("[Generate] Column repair found nothing to fix");
                }
                Ok(repair.sql_or(&previous).to_string())
            }
            _ => {
                info!("[Generate] Attempt {} - correction with feedback", state.attempt);
                let correction_prompt = self.correction_prompt(state);
                self.bounded(self.generator.generate_with_correction(
                    &state.question,
                    &state.schema,
                    &correction_prompt,
                ))
                .await
            }
        }
    }

    /// Bound a generator call by the configured timeout and strip fences.
    async fn bounded<F>(&self, call: F) -> Result<String, CorrectionError>
    where
        F: Future<Output = Result<String, GenerationError>>,
    {
        let raw = match self.config.generation_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(raw) => raw,
                Err(_) => {
                    warn!("[Generate] Generator timed out after {}s", limit.as_secs());
                    return Err(CorrectionError::GenerationTimeout(limit.as_secs()));
                }
            },
            None => call.await,
        };
        Ok(strip_code_fences(&raw?))
    }

    /// Correction prompt from the previous attempt's blocking signal.
    fn correction_prompt(&self, state: &CorrectionState) -> String {
        let failed_sql = &state.generated_sql;

        if let Some(validation) = state.validation.as_ref().filter(|v| !v.is_valid) {
            info!("[CorrectionPrompt] Using validator feedback");
            let prompt =
                build_validator_correction_prompt(failed_sql, &validation.issues, &state.question);
            return format!("{}\n\n{}", VALIDATOR_PROMPT_PREFIX, prompt);
        }

        let (category, feedback) = match &state.execution {
            Some(execution) => (
                execution.error_type.unwrap_or(ErrorCategory::Unknown),
                execution
                    .error_feedback
                    .clone()
                    .or_else(|| execution.error_message.clone())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            None => (ErrorCategory::Unknown, "Unknown error".to_string()),
        };
        info!("[CorrectionPrompt] Using {} strategy", category);
        let prompt = self
            .router
            .generate_prompt(category, &feedback, failed_sql, &state.question);
        format!("{}\n\n{}", EXECUTION_PROMPT_PREFIX, prompt)
    }

    /// Validate, applying the column fixer once when an identifier is missing.
    fn validate(&self, state: &mut CorrectionState) {
        let outcome = self.validator.validate_with_repair(
            &state.generated_sql,
            &state.schema,
            &state.question,
        );

        if outcome.repaired()
            && normalize_sql(&outcome.sql) != normalize_sql(&state.generated_sql)
        {
            state.used_repair = true;
            if let Some(last) = state.previous_sqls.last_mut() {
                *last = outcome.sql.clone();
            }
            state.generated_sql = outcome.sql;
        }
        state.validation = Some(outcome.result);
    }
}

fn log_generated(state: &CorrectionState, sql: &str) {
    let preview: String = sql.chars().take(100).collect();
    let ellipsis = if sql.chars().count() > 100 { "..." } else { "" };
    info!("[Generate] SQL: {}{}", preview, ellipsis);
    if let Some(previous) = state.previous_sqls.last() {
        info!("[Diff] {}", sql_diff(previous, sql));
    }
}

fn log_termination(state: &CorrectionState, reason: TerminationReason) {
    if reason.is_success() {
        info!("[End] ✓ SUCCESS on attempt {}", state.attempt);
    } else {
        warn!(
            "[End] ✗ Stopped on attempt {}/{}: {}",
            state.attempt, state.max_attempts, reason
        );
        if reason == TerminationReason::RetryGuard {
            warn!("[End] SQL: {}", state.generated_sql);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::StubSqlGenerator;
    use crate::schema::{SchemaContext, StaticSchemaProvider};

    #[test]
    fn build_requires_every_collaborator() {
        let err = Orchestrator::builder(QueryPilotConfig::default())
            .generator(Arc::new(StubSqlGenerator::new(vec!["SELECT 1"])))
            .build()
            .err();
        assert!(matches!(
            err,
            Some(CorrectionError::MissingComponent("schema provider"))
        ));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = QueryPilotConfig::default();
        config.correction.max_attempts = 0;
        let err = Orchestrator::builder(config)
            .schema_provider(Arc::new(StaticSchemaProvider::new(SchemaContext::new())))
            .build()
            .err();
        assert!(matches!(err, Some(CorrectionError::Config(_))));
    }

    #[test]
    fn failure_summary_prefers_execution_feedback() {
        let result = CorrectionResult {
            run_id: "r".to_string(),
            question: "q".to_string(),
            final_sql: "SELECT 1".to_string(),
            success: false,
            attempts: 3,
            termination: TerminationReason::ExecutionExhausted,
            used_repair: false,
            validation: None,
            execution: Some(ExecutionResult {
                error_message: Some("raw".to_string()),
                error_feedback: Some("friendly".to_string()),
                ..Default::default()
            }),
            sql_history: vec![],
            started_at: Utc::now(),
            duration_ms: 0.0,
        };
        assert_eq!(result.failure_summary().as_deref(), Some("friendly"));
        assert!(!result.was_corrected());
        assert!(result
            .to_string()
            .starts_with("✗ FAILED after 3 attempt(s) (max attempts reached"));
    }
}
