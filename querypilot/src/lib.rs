//! QueryPilot
//!
//! Turns a natural-language question into an executed, read-only SQL query,
//! treating the language model as an untrusted SQL producer.
//!
//! ## Architecture
//!
//! The crate is organised leaf-first:
//!
//! 1. **Auto-Repair** (`repair`): deterministic fuzzy column-name fixer
//! 2. **Validator** (`validator`): four-layer confidence scorer run before execution
//! 3. **Executor** (`executor`): bounded execution plus error classification and feedback
//! 4. **Correction Router** (`correction`): category-specific regeneration instructions
//! 5. **Orchestrator** (`orchestrator`): the bounded-retry state machine tying it together
//!
//! The schema provider, SQL generator and execution service are collaborators
//! behind async traits so that they can be swapped for tests or other backends.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use querypilot::config::QueryPilotConfig;
//! use querypilot::executor::SqliteExecutionService;
//! use querypilot::generation::StubSqlGenerator;
//! use querypilot::orchestrator::Orchestrator;
//! use querypilot::schema::{SchemaContext, StaticSchemaProvider};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = SchemaContext::from_json_str(
//!     r#"{"products": {"columns": {"product_id": "INTEGER", "name": "TEXT"}}}"#,
//! )?;
//! let orchestrator = Orchestrator::builder(QueryPilotConfig::default())
//!     .schema_provider(Arc::new(StaticSchemaProvider::new(schema)))
//!     .generator(Arc::new(StubSqlGenerator::new(vec!["SELECT name FROM products"])))
//!     .execution_service(Arc::new(SqliteExecutionService::open_in_memory()?))
//!     .build()?;
//!
//! let result = orchestrator.run("What products do we have?").await?;
//! println!("{} after {} attempt(s)", result.final_sql, result.attempts);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correction;
pub mod error;
pub mod executor;
pub mod generation;
pub mod orchestrator;
pub mod repair;
pub mod schema;
pub mod similarity;
pub mod sql_text;
pub mod validator;

// Re-export main types for easy access
pub use crate::config::QueryPilotConfig;
pub use crate::correction::CorrectionStrategyRouter;
pub use crate::error::CorrectionError;
pub use crate::executor::{ErrorCategory, ExecutionResult, Executor};
pub use crate::orchestrator::{CorrectionMetrics, CorrectionResult, Orchestrator};
pub use crate::repair::AutoRepair;
pub use crate::schema::{SchemaContext, SchemaProvider, TableSchema};
pub use crate::validator::{ValidationResult, Validator};
