//! Text-generation backends.
//!
//! Each backend turns a prompt into text and honours the job's
//! [`CancellationContext`]: hosted backends race their HTTP call against
//! cancellation, process backends register a kill handle. Every backend
//! returns `None` instead of content once the job is cancelled.

pub mod chat_completions;
pub mod dispatcher;
pub mod gemini;
pub mod sandbox;

pub use chat_completions::{ChatCompletionsBackend, ChatCompletionsConfig};
pub use dispatcher::{Dispatcher, Route, RouteDenied, RouteTarget, RoutingPolicy};
pub use gemini::{GeminiBackend, GeminiConfig};
pub use sandbox::{SandboxBackend, SandboxConfig};

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BackendError;
use crate::worker::cancel::CancellationContext;

/// Title shown on every reply.
pub const REPLY_TITLE: &str = "AI Relay";

/// Formatted result of a job, ready for a channel to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub title: String,
    pub body: String,
    /// Which backend produced the text (shown as a footer).
    pub backend_label: String,
}

impl Reply {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        backend_label: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            backend_label: backend_label.into(),
        }
    }

    /// Plain-text rendering: title, body, then a mode footer.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.title.is_empty() {
            out.push_str(&format!("*{}*\n\n", self.title));
        }
        out.push_str(self.body.trim());
        if !self.backend_label.is_empty() {
            out.push_str(&format!("\n\n_Mode: {}_", self.backend_label));
        }
        out
    }
}

/// A text-generation strategy.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable mode label, e.g. "Gemini API".
    fn label(&self) -> &str;

    /// Generate text for `prompt`.
    ///
    /// `workdir` is the requester's session directory, used by backends
    /// that run a local process. Returns `Ok(None)` if the job was
    /// cancelled before a result was produced.
    async fn generate(
        &self,
        prompt: &str,
        workdir: Option<&Path>,
        ctx: &CancellationContext,
    ) -> Result<Option<String>, BackendError>;
}

/// Maximum error body kept from a failed HTTP response.
const MAX_ERROR_BODY: usize = 512;

/// Send a JSON request, racing it against cancellation.
///
/// Returns `Ok(None)` when the job is cancelled before the response body
/// has been read.
pub(crate) async fn send_json(
    backend: &str,
    request: reqwest::RequestBuilder,
    ctx: &CancellationContext,
) -> Result<Option<serde_json::Value>, BackendError> {
    let call = async {
        let resp = request
            .send()
            .await
            .map_err(|e| BackendError::RequestFailed {
                backend: backend.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::HttpStatus {
                backend: backend.to_string(),
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| BackendError::InvalidResponse {
                backend: backend.to_string(),
                reason: e.to_string(),
            })
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            tracing::debug!(backend, job_id = %ctx.job_id(), "Request abandoned after cancellation");
            Ok(None)
        }
        result = call => result.map(Some),
    }
}
