//! Telegram channel. Long-polls the Bot API for updates.
//!
//! Replies are sent to the chat the request came from. When a status chat
//! is configured, scheduler status is shown there as a single message that
//! is sent once and then edited in place.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
use crate::error::ChannelError;
use crate::status::render_summary;
use crate::worker::job::Requester;
use crate::worker::scheduler::SchedulerStatus;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Wait before polling again after a failed `getUpdates`.
const POLL_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// The status message currently shown in the status chat.
#[derive(Debug, Default)]
struct StatusPanel {
    message_id: Option<i64>,
    last_text: String,
}

/// Telegram Bot API channel.
pub struct TelegramChannel {
    bot_token: SecretString,
    allowed_users: Vec<String>,
    status_chat_id: Option<String>,
    api_base: String,
    client: reqwest::Client,
    panel: Mutex<StatusPanel>,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_users,
            status_chat_id: None,
            api_base: DEFAULT_API_BASE.to_string(),
            client: reqwest::Client::new(),
            panel: Mutex::new(StatusPanel::default()),
        }
    }

    /// Publish scheduler status to this chat.
    pub fn with_status_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.status_chat_id = Some(chat_id.into());
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn send_failed(reason: impl Into<String>) -> ChannelError {
        ChannelError::SendFailed {
            name: "telegram".into(),
            reason: reason.into(),
        }
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Send a single message chunk, Markdown-first with fallback. Returns the
    /// new message id when Telegram reports one.
    async fn send_message_chunk(
        &self,
        chat_id: &str,
        text: &str,
    ) -> Result<Option<i64>, ChannelError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(message_id(markdown_resp).await);
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(Self::send_failed(format!(
                "sendMessage failed (markdown: {}, plain: {})",
                markdown_status, plain_err
            )));
        }

        Ok(message_id(plain_resp).await)
    }

    /// Replace the text of an existing message.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
    ) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url("editMessageText"))
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if body.contains("message is not modified") {
            return Ok(());
        }
        Err(Self::send_failed(format!("editMessageText failed: {body}")))
    }
}

async fn message_id(resp: reqwest::Response) -> Option<i64> {
    let data: serde_json::Value = resp.json().await.ok()?;
    data.pointer("/result/message_id")
        .and_then(serde_json::Value::as_i64)
}

/// Turn one `getUpdates` entry into an inbound message, if it is a text
/// message from an allowed user.
fn parse_update(update: &serde_json::Value, allowed_users: &[String]) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(serde_json::Value::as_str)?;

    let from = message.get("from");
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(serde_json::Value::as_str);
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string());

    let identities = user_id.as_deref().into_iter().chain(username);
    if !check_user_allowed(allowed_users, identities) {
        tracing::warn!(
            "Telegram: ignoring message from unauthorized user: \
             username={}, user_id={}",
            username.unwrap_or("unknown"),
            user_id.as_deref().unwrap_or("unknown")
        );
        return None;
    }

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();

    let first_name = from
        .and_then(|f| f.get("first_name"))
        .and_then(serde_json::Value::as_str);

    let mut incoming = IncomingMessage::new(
        "telegram",
        user_id.as_deref().or(username).unwrap_or("unknown"),
        text,
    )
    .with_metadata(serde_json::json!({
        "chat_id": chat_id,
        "first_name": first_name,
    }));
    if let Some(name) = username {
        incoming = incoming.with_user_name(name);
    }
    Some(incoming)
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let allowed_users = self.allowed_users.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(POLL_RETRY_DELAY).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(serde_json::Value::as_array)
                else {
                    let description = data
                        .get("description")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("no result in response");
                    tracing::warn!("Telegram getUpdates failed: {description}");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update, &allowed_users) else {
                        continue;
                    };
                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(
        &self,
        requester: &Requester,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let chat_id = requester
            .metadata
            .get("chat_id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Self::send_failed("No chat_id in requester metadata"))?;

        self.send_message(chat_id, &response.content).await
    }

    async fn publish_status(&self, status: &SchedulerStatus) -> Result<(), ChannelError> {
        let Some(ref chat_id) = self.status_chat_id else {
            return Ok(());
        };

        let text = render_summary(status);
        let mut panel = self.panel.lock().await;
        if panel.message_id.is_some() && panel.last_text == text {
            return Ok(());
        }

        if let Some(id) = panel.message_id {
            match self.edit_message(chat_id, id, &text).await {
                Ok(()) => {
                    panel.last_text = text;
                    return Ok(());
                }
                Err(e) => {
                    // The panel was probably deleted; post a new one.
                    tracing::debug!("Status panel edit failed, reposting: {e}");
                    panel.message_id = None;
                }
            }
        }

        let id = self.send_message_chunk(chat_id, &text).await?;
        panel.message_id = id;
        panel.last_text = text;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|_| ChannelError::HealthCheckFailed {
                name: "telegram".into(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::HealthCheckFailed {
                name: "telegram".into(),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts at a char
/// boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while cut > 0 && !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(cut);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { cut.max(1) } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
