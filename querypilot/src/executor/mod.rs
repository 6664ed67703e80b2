//! Bounded SQL execution with error classification
//!
//! The [`Executor`] wraps an [`ExecutionService`] with:
//! - defensive `LIMIT` injection (substring check, not an AST rewrite, so
//!   nested subqueries and CTEs may not get an outer limit)
//! - a statement timeout and a hard row cap
//! - priority-ordered error classification and schema-aware feedback
//! - running execution metrics

pub mod classifier;
pub mod metrics;
pub mod service;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use classifier::{ErrorCategory, ErrorClass, ErrorClassifier, ErrorDetails, ErrorPatterns};
pub use metrics::ExecutionMetrics;
pub use service::{ExecutionError, ExecutionService, QueryRows};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutionService;

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::QueryPilotConfig;
use crate::schema::SchemaContext;

/// Message used when the outer guard fires before the backend reports
const GUARD_TIMEOUT_MESSAGE: &str = "canceling statement due to statement timeout";

/// Outcome of one execution
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    /// Returned rows, capped at the row limit; `None` on failure
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
    pub error_type: Option<ErrorCategory>,
    /// Raw provider error text
    pub error_message: Option<String>,
    pub error_feedback: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub execution_time_ms: f64,
    pub row_count: usize,
    /// The exact SQL sent to the backend, including any injected LIMIT
    pub sql_executed: String,
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            write!(
                f,
                "✓ SUCCESS: {} rows in {:.1}ms",
                self.row_count, self.execution_time_ms
            )
        } else {
            write!(
                f,
                "✗ FAILED: {} - {}",
                self.error_type.unwrap_or(ErrorCategory::Unknown),
                self.error_message.as_deref().unwrap_or("")
            )
        }
    }
}

/// Append ` LIMIT n` when no limiting clause is textually present.
pub fn add_row_limit(sql: &str, limit: usize) -> String {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if crate::sql_text::has_limit(trimmed) {
        trimmed.to_string()
    } else {
        format!("{} LIMIT {}", trimmed, limit)
    }
}

fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

/// Safe SQL execution with classification and metrics.
pub struct Executor {
    service: Arc<dyn ExecutionService>,
    classifier: ErrorClassifier,
    timeout: Duration,
    row_limit: usize,
    metrics: Mutex<ExecutionMetrics>,
}

impl Executor {
    pub fn new(service: Arc<dyn ExecutionService>, config: &QueryPilotConfig) -> Self {
        let classifier = ErrorClassifier::new(
            ErrorPatterns::for_dialect(config.executor.dialect),
            config.feedback.clone(),
            config.executor.timeout_seconds,
        );
        Self {
            service,
            classifier,
            timeout: config.executor.timeout(),
            row_limit: config.executor.row_limit,
            metrics: Mutex::new(ExecutionMetrics::default()),
        }
    }

    /// Replace the classifier, e.g. to retarget error wording.
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Execute `sql` under the configured timeout and row cap.
    ///
    /// Query failures come back as data. Only a backend that is unreachable
    /// in a way the classifier cannot categorize is returned as an error.
    pub async fn execute(
        &self,
        sql: &str,
        schema: &SchemaContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        let limited = add_row_limit(sql, self.row_limit);
        let preview: String = limited.chars().take(80).collect();
        info!("[Executor] Executing SQL: {}...", preview);

        let start = Instant::now();
        let outcome = match tokio::time::timeout(
            self.timeout + Duration::from_secs(1),
            self.service.execute(&limited, self.timeout, self.row_limit),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutionError::Query(GUARD_TIMEOUT_MESSAGE.to_string())),
        };
        let elapsed_ms = round_ms(start.elapsed());

        let result = match outcome {
            Ok(mut data) => {
                data.rows.truncate(self.row_limit);
                let row_count = data.rows.len();
                info!(
                    "[Executor] Execution successful: {} rows in {:.1}ms",
                    row_count, elapsed_ms
                );
                ExecutionResult {
                    success: true,
                    columns: data.columns,
                    rows: Some(data.rows),
                    execution_time_ms: elapsed_ms,
                    row_count,
                    sql_executed: limited,
                    ..Default::default()
                }
            }
            Err(err) => {
                let message = err.message().to_string();
                let category = self.classifier.classify(&message);
                if matches!(err, ExecutionError::Unavailable(_))
                    && category == ErrorCategory::Unknown
                {
                    error!("[Executor] Backend unavailable: {}", message);
                    return Err(err);
                }

                let details = self.classifier.extract_details(&message, category);
                let feedback = self.classifier.generate_feedback(category, &details, schema);
                error!("[Executor] Execution failed: {}", message);
                error!("[Executor] Error classified as: {}", category);
                error!("[Executor] Feedback: {}", feedback);
                ExecutionResult {
                    success: false,
                    error_type: Some(category),
                    error_message: Some(message),
                    error_feedback: Some(feedback),
                    error_details: Some(details),
                    execution_time_ms: elapsed_ms,
                    row_count: 0,
                    sql_executed: limited,
                    ..Default::default()
                }
            }
        };

        self.lock_metrics().update(&result);
        Ok(result)
    }

    /// Snapshot of the running metrics
    pub fn get_metrics(&self) -> ExecutionMetrics {
        self.lock_metrics().clone()
    }

    pub fn reset_metrics(&self) {
        *self.lock_metrics() = ExecutionMetrics::default();
        info!("[Executor] Metrics reset");
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, ExecutionMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Returns a fixed outcome and records the SQL it was given
    struct ScriptedService {
        reply: Result<usize, &'static str>,
        unavailable: bool,
        delay: Option<Duration>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn rows(n: usize) -> Self {
            Self {
                reply: Ok(n),
                unavailable: false,
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                reply: Err(message),
                ..Self::rows(0)
            }
        }
    }

    #[async_trait]
    impl ExecutionService for ScriptedService {
        async fn execute(
            &self,
            sql: &str,
            _timeout: Duration,
            _row_cap: usize,
        ) -> Result<QueryRows, ExecutionError> {
            self.seen.lock().unwrap().push(sql.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.reply {
                Ok(n) => Ok(QueryRows {
                    columns: vec!["n".into()],
                    rows: (0..n).map(|i| vec![serde_json::json!(i)]).collect(),
                }),
                Err(msg) if self.unavailable => Err(ExecutionError::Unavailable(msg.into())),
                Err(msg) => Err(ExecutionError::Query(msg.into())),
            }
        }
    }

    fn schema() -> SchemaContext {
        SchemaContext::from_tables([(
            "products",
            TableSchema::new([("product_id", "INTEGER"), ("name", "VARCHAR")]),
        )])
    }

    fn config(row_limit: usize) -> QueryPilotConfig {
        let mut config = QueryPilotConfig::default();
        config.executor.row_limit = row_limit;
        config.executor.timeout_seconds = 1;
        config
    }

    #[test]
    fn limit_injection() {
        assert_eq!(add_row_limit("SELECT a FROM t;", 1000), "SELECT a FROM t LIMIT 1000");
        assert_eq!(add_row_limit("SELECT a FROM t LIMIT 5", 1000), "SELECT a FROM t LIMIT 5");
        // Only a substring check: an inner LIMIT suppresses the outer one
        assert_eq!(
            add_row_limit("SELECT * FROM (SELECT a FROM t LIMIT 50) s", 10),
            "SELECT * FROM (SELECT a FROM t LIMIT 50) s"
        );
    }

    #[tokio::test]
    async fn success_records_limited_sql_and_caps_rows() {
        let service = Arc::new(ScriptedService::rows(10));
        let executor = Executor::new(service.clone(), &config(4));
        let result = executor.execute("SELECT name FROM products", &schema()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.row_count, 4);
        assert_eq!(result.sql_executed, "SELECT name FROM products LIMIT 4");
        assert_eq!(service.seen.lock().unwrap()[0], "SELECT name FROM products LIMIT 4");
    }

    #[tokio::test]
    async fn failure_is_classified_with_feedback() {
        let executor = Executor::new(
            Arc::new(ScriptedService::failing(r#"column "nme" does not exist"#)),
            &config(100),
        );
        let result = executor.execute("SELECT nme FROM products", &schema()).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error_type, Some(ErrorCategory::ColumnNotFound));
        assert_eq!(result.sql_executed, "SELECT nme FROM products LIMIT 100");
        assert!(result.error_feedback.unwrap().contains("Did you mean: name?"));
        assert_eq!(
            result.error_details.unwrap().missing_column.as_deref(),
            Some("nme")
        );
    }

    #[tokio::test]
    async fn unclassifiable_outage_propagates() {
        let mut service = ScriptedService::failing("socket exploded");
        service.unavailable = true;
        let executor = Executor::new(Arc::new(service), &config(10));
        let err = executor.execute("SELECT 1", &schema()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Unavailable(_)));
        assert_eq!(executor.get_metrics().total_queries, 0);
    }

    #[tokio::test]
    async fn classified_outage_is_data() {
        let mut service = ScriptedService::failing("could not connect to server");
        service.unavailable = true;
        let executor = Executor::new(Arc::new(service), &config(10));
        let result = executor.execute("SELECT 1", &schema()).await.unwrap();
        assert_eq!(result.error_type, Some(ErrorCategory::ConnectionError));
    }

    #[tokio::test]
    async fn guard_timeout_is_reported_as_timeout() {
        let mut service = ScriptedService::rows(1);
        service.delay = Some(Duration::from_secs(5));
        let executor = Executor::new(Arc::new(service), &config(10));
        let result = executor.execute("SELECT 1", &schema()).await.unwrap();
        assert_eq!(result.error_type, Some(ErrorCategory::Timeout));
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let ok = Executor::new(Arc::new(ScriptedService::rows(1)), &config(10));
        ok.execute("SELECT 1", &schema()).await.unwrap();
        ok.execute("SELECT 2", &schema()).await.unwrap();
        let metrics = ok.get_metrics();
        assert_eq!(metrics.total_queries, 2);
        assert_eq!(metrics.successful_queries, 2);
        assert!(metrics.min_execution_time_ms <= metrics.max_execution_time_ms);
        assert!(metrics.to_string().starts_with("Metrics: 2 queries, 100.0% success"));

        let service = ScriptedService::failing("permission denied for table t");
        let bad = Executor::new(Arc::new(service), &config(10));
        bad.execute("SELECT 1", &schema()).await.unwrap();
        assert_eq!(bad.get_metrics().error_counts.get("permission_denied"), Some(&1));

        bad.reset_metrics();
        assert_eq!(bad.get_metrics(), ExecutionMetrics::default());
    }
}
