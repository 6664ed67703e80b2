//! Error types for the correction pipeline

use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::ExecutionError;
use crate::generation::GenerationError;
use crate::schema::SchemaError;

/// Failures that abort a run before it can produce a [`CorrectionResult`].
///
/// Failed SQL is never an error: validation and execution failures are
/// reported as data inside the result. Only collaborators that cannot be
/// reached end up here.
///
/// [`CorrectionResult`]: crate::orchestrator::CorrectionResult
#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("Schema provider failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("SQL generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("SQL generation timed out after {0}s")]
    GenerationTimeout(u64),

    #[error("Execution service failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator is missing a collaborator: {0}")]
    MissingComponent(&'static str),
}
