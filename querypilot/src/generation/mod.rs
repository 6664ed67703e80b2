//! SQL generation collaborator
//!
//! The generator is treated as a non-deterministic black box: the core only
//! relies on it returning text, which may carry markdown decoration that the
//! orchestrator strips before use.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::schema::SchemaContext;

pub use crate::sql_text::strip_code_fences;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiSqlGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Invalid generation input: {0}")]
    InvalidInput(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("LLM API request failed (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("Generator misconfigured: {0}")]
    Config(String),

    #[error("Scripted generator has no responses")]
    Exhausted,
}

/// Turns a question plus schema context into SQL text.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        schema: &SchemaContext,
    ) -> Result<String, GenerationError>;

    /// Regenerate with a correction instruction describing what went wrong.
    async fn generate_with_correction(
        &self,
        question: &str,
        schema: &SchemaContext,
        correction_prompt: &str,
    ) -> Result<String, GenerationError>;
}

const GENERATION_TEMPLATE: &str = "You are a PostgreSQL SQL expert. Generate accurate SQL queries based on the provided database schema.

DATABASE SCHEMA:
{schema}

POSTGRESQL SYNTAX REMINDERS:
- Use :: for type casting (e.g., column_name::INTEGER)
- Date functions: DATE_TRUNC('month', date_column), CURRENT_DATE
- Limit results: ORDER BY column LIMIT N
- String matching: ILIKE for case-insensitive search

SAFETY RULES:
- Use ONLY the tables and columns listed in the schema above
- Do NOT reference tables or columns not explicitly provided
- Always add LIMIT 1000 to SELECT queries unless a different limit is specified
- Never use DROP, DELETE, ALTER, TRUNCATE, or other destructive operations
- When multiple tables are required, use explicit JOIN conditions based on foreign keys
- Avoid SELECT *; select only necessary columns
- When using aggregation, ensure correct GROUP BY clauses

USER QUESTION:
{question}

OUTPUT:
Return ONLY the SQL query starting with SELECT or WITH. No explanations or markdown.";

/// Reject inputs no generator can work with.
pub fn check_input(question: &str, schema: &SchemaContext) -> Result<(), GenerationError> {
    if question.trim().is_empty() {
        return Err(GenerationError::InvalidInput("Question cannot be empty".to_string()));
    }
    if schema.is_empty() {
        return Err(GenerationError::InvalidInput(
            "Filtered schema cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// First-attempt prompt: schema text, dialect reminders, safety rules.
pub fn build_generation_prompt(question: &str, schema: &SchemaContext) -> String {
    GENERATION_TEMPLATE
        .replace("{schema}", &schema.render_for_prompt())
        .replace("{question}", question.trim())
}

/// Base prompt followed by the correction instruction.
pub fn build_correction_generation_prompt(
    question: &str,
    schema: &SchemaContext,
    correction_prompt: &str,
) -> String {
    format!(
        "{}\n\nCORRECTION:\n{}",
        build_generation_prompt(question, schema),
        correction_prompt.trim()
    )
}

/// Replays scripted responses in order, repeating the last one once the
/// script runs out. Records every correction prompt it receives.
pub struct StubSqlGenerator {
    script: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    corrections: Mutex<Vec<String>>,
}

impl StubSqlGenerator {
    pub fn new<S: Into<String>>(responses: Vec<S>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            corrections: Mutex::new(Vec::new()),
        }
    }

    /// Correction prompts passed to `generate_with_correction`, in order.
    pub fn correction_prompts(&self) -> Vec<String> {
        match self.corrections.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_response(&self) -> Result<String, GenerationError> {
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(next) = script.pop_front() {
            *last = Some(next.clone());
            return Ok(next);
        }
        last.clone().ok_or(GenerationError::Exhausted)
    }
}

#[async_trait]
impl SqlGenerator for StubSqlGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &SchemaContext,
    ) -> Result<String, GenerationError> {
        check_input(question, schema)?;
        let sql = self.next_response()?;
        debug!("[StubGenerator] generate → {}", sql);
        Ok(sql)
    }

    async fn generate_with_correction(
        &self,
        question: &str,
        schema: &SchemaContext,
        correction_prompt: &str,
    ) -> Result<String, GenerationError> {
        check_input(question, schema)?;
        self.corrections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(correction_prompt.to_string());
        let sql = self.next_response()?;
        debug!("[StubGenerator] generate_with_correction → {}", sql);
        Ok(sql)
    }
}
