//! Channel trait and message types.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use uuid::Uuid;

use crate::backends::Reply;
use crate::error::ChannelError;
use crate::worker::job::Requester;
use crate::worker::scheduler::SchedulerStatus;

/// A message received from a chat platform.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Channel name the message arrived on.
    pub channel: String,
    /// Stable platform user id.
    pub user_id: String,
    /// Platform handle, used for role lookup alongside the id.
    pub user_name: Option<String>,
    pub content: String,
    /// Channel-specific routing data (e.g. `chat_id`).
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            user_id: user_id.into(),
            user_name: None,
            content: content.into(),
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The requester behind this message, carrying the reply routing data.
    pub fn requester(&self) -> Requester {
        let requester = Requester::new(&self.channel, &self.user_id)
            .with_metadata(self.metadata.clone());
        match self.user_name {
            Some(ref name) => requester.with_name(name),
            None => requester,
        }
    }
}

/// A message to send back to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub content: String,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl From<&Reply> for OutgoingResponse {
    fn from(reply: &Reply) -> Self {
        Self::text(reply.render())
    }
}

/// Stream of inbound messages from a channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat platform the relay talks on.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening. Messages arrive on the returned stream until the
    /// channel stops.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Send a response to the requester on this channel.
    async fn respond(
        &self,
        requester: &Requester,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError>;

    /// Show the scheduler status somewhere on this channel. Silent by default.
    async fn publish_status(&self, _status: &SchedulerStatus) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requester_carries_identity_and_metadata() {
        let msg = IncomingMessage::new("telegram", "42", "hi")
            .with_user_name("alice")
            .with_metadata(serde_json::json!({ "chat_id": "99" }));

        let requester = msg.requester();
        assert_eq!(requester.channel, "telegram");
        assert_eq!(requester.id, "42");
        assert_eq!(requester.name.as_deref(), Some("alice"));
        assert_eq!(requester.metadata["chat_id"], "99");
    }

    #[test]
    fn response_from_reply_uses_rendering() {
        let reply = Reply::new("T", "body", "Mode");
        assert_eq!(OutgoingResponse::from(&reply).content, reply.render());
    }
}
