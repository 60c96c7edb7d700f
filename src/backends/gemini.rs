//! Primary hosted backend: Gemini `generateContent`.

use std::path::Path;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::backends::{Backend, send_json};
use crate::error::BackendError;
use crate::worker::cancel::CancellationContext;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-latest";

const FALLBACK_TEXT: &str = "No response from Gemini API.";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

pub struct GeminiBackend {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

/// Pull the first candidate's text out of a `generateContent` response.
fn extract_text(body: &serde_json::Value) -> String {
    body.pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(FALLBACK_TEXT)
        .to_string()
}

#[async_trait]
impl Backend for GeminiBackend {
    fn label(&self) -> &str {
        "Gemini API"
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
            .post(self.endpoint())
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&serde_json::json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }));

        let Some(body) = send_json("gemini", request, ctx).await? else {
            return Ok(None);
        };

        if ctx.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(extract_text(&body)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{Json, Router, routing::post};
    use uuid::Uuid;

    use super::*;
    use crate::roles::AuthorityTier;
    use crate::worker::cancel::CancelReason;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn backend(base_url: String) -> GeminiBackend {
        GeminiBackend::new(GeminiConfig {
            api_key: SecretString::from("test-key".to_string()),
            model: "test-model".into(),
            base_url,
        })
    }

    fn ctx() -> CancellationContext {
        CancellationContext::new(Uuid::new_v4(), AuthorityTier::Standard)
    }

    #[test]
    fn extract_text_reads_first_candidate() {
        let body = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "hi" }, { "text": "ignored" }] } }]
        });
        assert_eq!(extract_text(&body), "hi");
    }

    #[test]
    fn extract_text_falls_back() {
        assert_eq!(extract_text(&serde_json::json!({})), FALLBACK_TEXT);
        let empty = serde_json::json!({ "candidates": [{ "content": { "parts": [{ "text": "" }] } }] });
        assert_eq!(extract_text(&empty), FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn generate_posts_prompt_and_parses_reply() {
        let router = Router::new().route(
            "/models/test-model:generateContent",
            post(|Json(body): Json<serde_json::Value>| async move {
                let prompt = body["contents"][0]["parts"][0]["text"]
                    .as_str()
                    .unwrap_or_default()
                    .to_uppercase();
                Json(serde_json::json!({
                    "candidates": [{ "content": { "parts": [{ "text": prompt }] } }]
                }))
            }),
        );
        let base = serve(router).await;

        let text = backend(base).generate("hello", None, &ctx()).await.unwrap();
        assert_eq!(text.as_deref(), Some("HELLO"));
    }

    #[tokio::test]
    async fn http_error_is_reported() {
        let router = Router::new().route(
            "/models/test-model:generateContent",
            post(|| async { (axum::http::StatusCode::TOO_MANY_REQUESTS, "quota exceeded") }),
        );
        let base = serve(router).await;

        let err = backend(base).generate("hello", None, &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::HttpStatus { status: 429, .. }));
    }

    #[tokio::test]
    async fn cancellation_abandons_slow_request() {
        let router = Router::new().route(
            "/models/test-model:generateContent",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Json(serde_json::json!({}))
            }),
        );
        let base = serve(router).await;
        let backend = backend(base);
        let ctx = ctx();

        let call = backend.generate("hello", None, &ctx);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.cancel(CancelReason::Owner);
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(call, cancel)
        })
        .await
        .expect("cancelled request did not return");

        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn already_cancelled_skips_request() {
        let ctx = ctx();
        ctx.cancel(CancelReason::StopAll);
        // Unroutable base URL: any request attempt would fail.
        let result = backend("http://127.0.0.1:1".into())
            .generate("hello", None, &ctx)
            .await;
        assert_eq!(result.unwrap(), None);
    }
}
