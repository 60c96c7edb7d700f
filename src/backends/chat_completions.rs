//! Alternate hosted backend speaking the OpenAI chat-completions protocol
//! (Venice by default).

use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::backends::{Backend, send_json};
use crate::error::BackendError;
use crate::worker::cancel::CancellationContext;

pub const DEFAULT_URL: &str = "https://api.venice.ai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "venice-uncensored";

#[derive(Debug, Clone)]
pub struct ChatCompletionsConfig {
    pub api_key: SecretString,
    pub model: String,
    pub url: String,
    /// Mode label shown on replies.
    pub label: String,
}

impl ChatCompletionsConfig {
    pub fn venice(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            url: DEFAULT_URL.to_string(),
            label: "Venice.ai".to_string(),
        }
    }
}

pub struct ChatCompletionsBackend {
    config: ChatCompletionsConfig,
    client: reqwest::Client,
}

impl ChatCompletionsBackend {
    pub fn new(config: ChatCompletionsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn fallback_text(&self) -> String {
        format!("No response from {}.", self.config.label)
    }
}

fn extract_content(body: &serde_json::Value) -> Option<&str> {
    body.pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

#[async_trait]
impl Backend for ChatCompletionsBackend {
    fn label(&self) -> &str {
        &self.config.label
    }

    async fn generate(
        &self,
        prompt: &str,
        _workdir: Option<&Path>,
        ctx: &CancellationContext,
    ) -> Result<Option<String>, BackendError> {
        if ctx.is_cancelled() {
            return Ok(None);
        }

        let request = self
            .client
            .post(&self.config.url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&serde_json::json!({
                "model": self.config.model,
                "messages": [{ "role": "user", "content": prompt }]
            }));

        let Some(body) = send_json(&self.config.label, request, ctx).await? else {
            return Ok(None);
        };

        if ctx.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(
            extract_content(&body)
                .map(str::to_string)
                .unwrap_or_else(|| self.fallback_text()),
        ))
    }
}
