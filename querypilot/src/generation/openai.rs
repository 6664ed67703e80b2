//! OpenAI-compatible chat-completions generator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{
    build_correction_generation_prompt, build_generation_prompt, check_input, GenerationError,
    SqlGenerator,
};
use crate::config::LlmConfig;
use crate::schema::SchemaContext;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const SYSTEM_PROMPT: &str = "You translate questions into a single read-only SQL query.";

/// Response bodies longer than this are truncated in error messages
const ERROR_PREVIEW_CHARS: usize = 1000;

pub struct OpenAiSqlGenerator {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiSqlGenerator {
    pub fn new(config: LlmConfig) -> Result<Self, GenerationError> {
        if config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(GenerationError::Config(
                "API key required for OpenAI provider".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GenerationError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    async fn complete(&self, prompt: String) -> Result<String, GenerationError> {
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: Some(self.config.temperature),
        };

        let start = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::Http(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| GenerationError::Parse(format!("{} in {}", e, preview(&body))))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        info!(
            "[OpenAiGenerator] {} responded in {}ms",
            self.config.model,
            start.elapsed().as_millis()
        );
        debug!("[OpenAiGenerator] Raw response: {}", content);
        Ok(content)
    }
}

fn preview(body: &str) -> String {
    if body.chars().count() > ERROR_PREVIEW_CHARS {
        let head: String = body.chars().take(ERROR_PREVIEW_CHARS).collect();
        format!("{}...[truncated, total length: {} chars]", head, body.chars().count())
    } else {
        body.to_string()
    }
}

#[async_trait]
impl SqlGenerator for OpenAiSqlGenerator {
    async fn generate(
        &self,
        question: &str,
        schema: &SchemaContext,
    ) -> Result<String, GenerationError> {
        check_input(question, schema)?;
        self.complete(build_generation_prompt(question, schema)).await
    }

    async fn generate_with_correction(
        &self,
        question: &str,
        schema: &SchemaContext,
        correction_prompt: &str,
    ) -> Result<String, GenerationError> {
        check_input(question, schema)?;
        self.complete(build_correction_generation_prompt(
            question,
            schema,
            correction_prompt,
        ))
        .await
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let err = OpenAiSqlGenerator::new(LlmConfig::default()).err();
        assert!(matches!(err, Some(GenerationError::Config(_))));
    }

    #[test]
    fn endpoint_honours_base_url() {
        let config = LlmConfig {
            api_key: Some("sk-test".to_string()),
            base_url: Some("http://localhost:8080/v1/".to_string()),
            ..LlmConfig::default()
        };
        let generator = OpenAiSqlGenerator::new(config).unwrap();
        assert_eq!(generator.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(ERROR_PREVIEW_CHARS + 5);
        assert!(preview(&body).ends_with("[truncated, total length: 1005 chars]"));
        assert_eq!(preview("short"), "short");
    }
}
