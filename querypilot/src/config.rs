//! Runtime configuration
//!
//! Loaded from TOML (or JSON, chosen by file extension), then overridden by
//! `QUERYPILOT_*` environment variables, then range-checked.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueryPilotConfig {
    #[validate(nested)]
    pub correction: CorrectionConfig,
    #[validate(nested)]
    pub validator: ValidatorConfig,
    #[validate(nested)]
    pub executor: ExecutorConfig,
    #[validate(nested)]
    pub repair: RepairConfig,
    #[validate(nested)]
    pub feedback: FeedbackConfig,
    #[validate(nested)]
    pub llm: LlmConfig,
    pub schema: SchemaSourceConfig,
    pub database: DatabaseConfig,
}

/// Retry loop bounds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Maximum Generate cycles per question
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    /// Upper bound on a single generation call, 0 for none
    #[validate(range(max = 600))]
    pub generation_timeout_seconds: u64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            generation_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Minimum confidence for SQL to be considered valid
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
        }
    }
}

/// Which provider wording the error classifier expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    Sqlite,
}

impl std::str::FromStr for SqlDialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
            "sqlite" => Ok(SqlDialect::Sqlite),
            other => Err(ConfigError::Invalid(format!("Unknown SQL dialect: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Statement timeout
    #[validate(range(min = 1, max = 3600))]
    pub timeout_seconds: u64,
    /// Hard cap on materialized rows, also the injected LIMIT
    #[validate(range(min = 1))]
    pub row_limit: usize,
    pub dialect: SqlDialect,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            row_limit: 1000,
            dialect: SqlDialect::Postgres,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Similarity cutoffs for the column fixer
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RepairConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub qualified_cutoff: f64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub bare_cutoff: f64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            qualified_cutoff: 0.6,
            bare_cutoff: 0.7,
        }
    }
}

/// Suggestion settings for executor feedback text
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FeedbackConfig {
    #[validate(range(min = 0.0, max = 1.0))]
    pub suggestion_cutoff: f64,
    #[validate(range(min = 1, max = 20))]
    pub max_suggestions: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            suggestion_cutoff: 0.6,
            max_suggestions: 3,
        }
    }
}

/// Generation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LlmProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[default]
    #[serde(rename = "stub")]
    Stub,
}

impl std::str::FromStr for LlmProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProviderKind::OpenAi),
            "stub" => Ok(LlmProviderKind::Stub),
            other => Err(ConfigError::Invalid(format!("Unknown LLM provider: {}", other))),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProviderKind,
    /// Model name/identifier
    pub model: String,
    /// API key (can be loaded from env)
    pub api_key: Option<String>,
    /// Base URL for API (optional, for custom endpoints)
    pub base_url: Option<String>,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    /// HTTP timeout in seconds
    #[validate(range(min = 1, max = 600))]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::Stub,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.0,
            max_tokens: Some(512),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSourceConfig {
    /// JSON schema document path
    pub path: Option<String>,
    /// Narrow the schema to tables the question mentions
    pub lexical_linking: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file, opened read-only
    pub path: Option<String>,
}

impl QueryPilotConfig {
    /// Load from a TOML file, or JSON when the path ends in `.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            toml::from_str(&content)?
        };
        Ok(config)
    }

    /// Apply `QUERYPILOT_*` environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUERYPILOT_MAX_ATTEMPTS") {
            self.correction.max_attempts = parse_var("QUERYPILOT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("QUERYPILOT_CONFIDENCE_THRESHOLD") {
            self.validator.confidence_threshold = parse_var("QUERYPILOT_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("QUERYPILOT_QUERY_TIMEOUT") {
            self.executor.timeout_seconds = parse_var("QUERYPILOT_QUERY_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("QUERYPILOT_LLM_PROVIDER") {
            self.llm.provider = v.parse()?;
        }
        if let Some(v) = lookup("QUERYPILOT_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("QUERYPILOT_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = lookup("QUERYPILOT_LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        Ok(())
    }

    /// Range-check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// `None` when generation calls are unbounded.
    pub fn generation_timeout(&self) -> Option<Duration> {
        match self.correction.generation_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = QueryPilotConfig::default();
        assert_eq!(config.correction.max_attempts, 3);
        assert_eq!(config.validator.confidence_threshold, 0.7);
        assert_eq!(config.executor.row_limit, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[correction]\nmax_attempts = 5\n\n[executor]\ndialect = \"sqlite\"\n\n\
             [llm]\nprovider = \"openai\"\nmodel = \"gpt-4o\""
        )
        .unwrap();

        let config = QueryPilotConfig::from_file(file.path()).unwrap();
        assert_eq!(config.correction.max_attempts, 5);
        assert_eq!(config.correction.generation_timeout_seconds, 60);
        assert_eq!(config.executor.dialect, SqlDialect::Sqlite);
        assert_eq!(config.llm.provider, LlmProviderKind::OpenAi);
        assert_eq!(config.repair.bare_cutoff, 0.7);
    }

    #[test]
    fn loads_json_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"validator": {{"confidence_threshold": 0.5}}}}"#).unwrap();
        let config = QueryPilotConfig::from_file(file.path()).unwrap();
        assert_eq!(config.validator.confidence_threshold, 0.5);
    }

    #[test]
    fn overrides_apply_and_reject_garbage() {
        let vars: HashMap<&str, &str> = [
            ("QUERYPILOT_MAX_ATTEMPTS", "4"),
            ("QUERYPILOT_LLM_PROVIDER", "openai"),
            ("QUERYPILOT_LLM_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();
        let mut config = QueryPilotConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.correction.max_attempts, 4);
        assert_eq!(config.llm.provider, LlmProviderKind::OpenAi);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));

        let err = config
            .apply_overrides(|k| (k == "QUERYPILOT_QUERY_TIMEOUT").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let mut config = QueryPilotConfig::default();
        config.correction.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = QueryPilotConfig::default();
        config.validator.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_generation_timeout_means_unbounded() {
        let mut config = QueryPilotConfig::default();
        assert_eq!(config.generation_timeout(), Some(Duration::from_secs(60)));

        config.correction.generation_timeout_seconds = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.generation_timeout(), None);

        config.correction.generation_timeout_seconds = 601;
        assert!(config.validate().is_err());
    }
}
