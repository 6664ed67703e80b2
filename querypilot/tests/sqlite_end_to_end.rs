#![cfg(feature = "sqlite")]

use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;

use querypilot::config::{QueryPilotConfig, SqlDialect};
use querypilot::executor::{ErrorCategory, SqliteExecutionService};
use querypilot::generation::StubSqlGenerator;
use querypilot::orchestrator::{Orchestrator, TerminationReason};
use querypilot::schema::StaticSchemaProvider;

const SCHEMA_JSON: &str = r#"{
  "products": {
    "columns": {"product_id": "INTEGER", "name": "TEXT", "price": "REAL"},
    "primary_keys": ["product_id"]
  },
  "orders": {
    "columns": {"order_id": "INTEGER", "product_id": "INTEGER", "quantity": "INTEGER"},
    "primary_keys": ["order_id"],
    "foreign_keys": {"product_id": "products.product_id"}
  }
}"#;

fn database() -> SqliteExecutionService {
    let service = SqliteExecutionService::open_in_memory().unwrap();
    service
        .execute_batch(
            "CREATE TABLE products (product_id INTEGER PRIMARY KEY, name TEXT, price REAL);
             CREATE TABLE orders (
                 order_id INTEGER PRIMARY KEY, product_id INTEGER, quantity INTEGER
             );
             INSERT INTO products (name, price) VALUES ('pen', 1.5), ('book', 12.0), ('lamp', 30.0);
             INSERT INTO orders (product_id, quantity) VALUES (1, 3), (2, 1), (1, 2);",
        )
        .unwrap();
    service
}

fn sqlite_config() -> QueryPilotConfig {
    let mut config = QueryPilotConfig::default();
    config.executor.dialect = SqlDialect::Sqlite;
    config
}

fn build(config: QueryPilotConfig, responses: Vec<&str>) -> Orchestrator {
    let mut schema_file = tempfile::NamedTempFile::new().unwrap();
    schema_file.write_all(SCHEMA_JSON.as_bytes()).unwrap();

    Orchestrator::builder(config)
        .schema_provider(Arc::new(
            StaticSchemaProvider::from_json_file(schema_file.path())
                .unwrap()
                .with_lexical_linking(true),
        ))
        .generator(Arc::new(StubSqlGenerator::new(responses)))
        .execution_service(Arc::new(database()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn repaired_query_returns_rows() {
    let orchestrator = build(
        sqlite_config(),
        vec!["SELECT id, name FROM products ORDER BY product_id"],
    );

    let result = orchestrator.run("List every product").await.unwrap();

    assert!(result.success, "{}", result);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.final_sql, "SELECT product_id, name FROM products ORDER BY product_id");
    let execution = result.execution.unwrap();
    assert_eq!(execution.columns, vec!["product_id", "name"]);
    assert_eq!(execution.row_count, 3);
    assert_eq!(execution.rows.unwrap()[0], vec![serde_json::json!(1), serde_json::json!("pen")]);
}

#[tokio::test]
async fn join_with_aggregation_runs_first_time() {
    let sql = "SELECT p.name, SUM(o.quantity) AS units FROM orders o \
               JOIN products p ON p.product_id = o.product_id GROUP BY p.name ORDER BY units DESC";
    let orchestrator = build(sqlite_config(), vec![sql]);

    let result = orchestrator.run("Units sold per product").await.unwrap();

    assert!(result.success, "{}", result);
    assert_eq!(result.attempts, 1);
    let rows = result.execution.unwrap().rows.unwrap();
    assert_eq!(rows[0], vec![serde_json::json!("pen"), serde_json::json!(5)]);
}

#[tokio::test]
async fn provider_errors_are_classified_with_sqlite_wording() {
    let mut config = sqlite_config();
    // Let the misspelled column through the validator so SQLite reports it
    config.validator.confidence_threshold = 0.5;
    let orchestrator = build(config, vec!["SELECT quantty FROM orders"]);

    let result = orchestrator.run("How many units per order?").await.unwrap();

    assert!(result.success, "{}", result);
    assert_eq!(result.attempts, 2);
    assert!(result.used_repair);
    assert_eq!(result.final_sql, "SELECT quantity FROM orders");
    let metrics = orchestrator.executor_metrics();
    assert_eq!(metrics.failed_queries, 1);
    assert_eq!(
        metrics.error_counts.get(ErrorCategory::ColumnNotFound.as_str()),
        Some(&1)
    );
}

#[tokio::test]
async fn unfixable_provider_error_hits_the_retry_guard() {
    let mut config = sqlite_config();
    config.validator.confidence_threshold = 0.5;
    let orchestrator = build(config, vec!["SELECT qty FROM orders"]);

    let result = orchestrator.run("How many units per order?").await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.termination, TerminationReason::RetryGuard);
    let execution = result.execution.unwrap();
    assert_eq!(execution.error_type, Some(ErrorCategory::ColumnNotFound));
    assert!(execution.error_message.unwrap().contains("no such column: qty"));
}

#[tokio::test]
async fn writes_are_refused_even_if_validation_is_bypassed() {
    let mut config = sqlite_config();
    config.validator.confidence_threshold = 0.0;
    let orchestrator = build(config, vec!["SELECT name FROM products; DELETE FROM orders"]);

    let result = orchestrator.run("Clean up orders").await.unwrap();

    // The safety layer zeroes confidence, which is never valid
    assert!(!result.success);
    assert_eq!(result.termination, TerminationReason::ValidationExhausted);
    assert!(result.execution.is_none());
}
