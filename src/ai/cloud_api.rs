use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::ai::prompt::{PromptMessage, Role};
use crate::config::AiSettings;
use crate::error::{Error, Result, UpstreamError};

/// Turns a prompt into one SQL candidate. No retries at this layer.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn generate_sql(&self, messages: &[PromptMessage]) -> Result<String>;
}

/// OpenAI-compatible chat completions endpoint.
pub struct OpenAiGateway {
    settings: AiSettings,
    http_client: reqwest::Client,
}

impl OpenAiGateway {
    pub fn new(settings: AiSettings) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        if settings.effective_model() != settings.model {
            warn!(
                configured = %settings.model,
                using = settings.effective_model(),
                "model not in allow-list, falling back"
            );
        }

        Ok(Self {
            settings,
            http_client,
        })
    }

    fn request_body(&self, messages: &[PromptMessage]) -> Value {
        serde_json::json!({
            "model": self.settings.effective_model(),
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": self.settings.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiGateway {
    async fn generate_sql(&self, messages: &[PromptMessage]) -> Result<String> {
        if self.settings.api_key.trim().is_empty() {
            return Err(Error::Configuration(
                "OpenAI API key not configured. Set ai.api_key or OPENAI_API_KEY.".into(),
            ));
        }

        let system_prompt_length = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.len())
            .unwrap_or(0);
        info!(
            model = self.settings.effective_model(),
            message_count = messages.len(),
            system_prompt_length,
            "sending completion request"
        );

        let resp = self
            .http_client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&self.request_body(messages))
            .send()
            .await
            .inspect_err(|e| error!(error = %e, "completion request failed"))?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %text, "completion service error");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let json: Value = match serde_json::from_str(&text) {
            Ok(json) => json,
            Err(_) => return Err(UpstreamError::Malformed { body: text }.into()),
        };
        let Some(content) = json["choices"][0]["message"]["content"].as_str() else {
            error!(body = %text, "completion response has no content");
            return Err(UpstreamError::Malformed { body: text }.into());
        };

        let sql = strip_code_fences(content);
        info!(
            sql_length = sql.len(),
            tokens_used = json["usage"]["total_tokens"].as_u64().unwrap_or(0),
            "SQL generated"
        );
        Ok(sql)
    }
}

/// Strip markdown code fences from model output (```sql ... ``` or ``` ... ```).
pub fn strip_code_fences(s: &str) -> String {
    let mut sql = s.trim();
    if let Some(rest) = sql.strip_prefix("```") {
        sql = match rest.get(..3) {
            Some(tag) if tag.eq_ignore_ascii_case("sql") => &rest[3..],
            _ => rest,
        };
    }
    if let Some(rest) = sql.trim_end().strip_suffix("```") {
        sql = rest;
    }
    sql.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences() {
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("```SQL SELECT 1```"), "SELECT 1");
        assert_eq!(strip_code_fences("```\nSELECT 1\n```\n"), "SELECT 1");
        assert_eq!(strip_code_fences("SELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("  SELECT 1  "), "SELECT 1");
    }

    #[test]
    fn request_body_is_deterministic_and_bounded() {
        let gateway = OpenAiGateway::new(AiSettings {
            model: "not-allowed".into(),
            ..AiSettings::default()
        })
        .unwrap();
        let body = gateway.request_body(&[PromptMessage::user("hi")]);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn missing_api_key_is_a_configuration_error() {
        let gateway = OpenAiGateway::new(AiSettings::default()).unwrap();
        let err = gateway
            .generate_sql(&[PromptMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(err.status_code(), 500);
    }
}
