//! Owns every active channel, merges their inbound streams and routes
//! outbound messages by channel name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream;
use tokio::sync::RwLock;

use crate::channels::{Channel, MessageStream, OutgoingResponse};
use crate::error::ChannelError;
use crate::worker::job::Requester;
use crate::worker::scheduler::SchedulerStatus;

#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. A channel with the same name is replaced.
    pub async fn add(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        tracing::info!("Registered channel: {name}");
        self.channels.write().await.insert(name, channel);
    }

    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every channel and merge their streams. Channels that fail to
    /// start are logged and skipped; it is an error only if none start.
    pub async fn start_all(&self) -> Result<MessageStream, ChannelError> {
        let channels = self.channels.read().await;
        let mut streams = Vec::with_capacity(channels.len());

        for (name, channel) in channels.iter() {
            match channel.start().await {
                Ok(s) => {
                    tracing::info!("Channel {name} started");
                    streams.push(s);
                }
                Err(e) => tracing::error!("Channel {name} failed to start: {e}"),
            }
        }

        if streams.is_empty() {
            return Err(ChannelError::StartupFailed {
                name: "all".into(),
                reason: "no channel could be started".into(),
            });
        }

        Ok(Box::pin(stream::select_all(streams)))
    }

    async fn get(&self, name: &str) -> Result<Arc<dyn Channel>, ChannelError> {
        self.channels
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownChannel {
                name: name.to_string(),
            })
    }

    /// Send a response on the channel the requester wrote from.
    pub async fn respond(
        &self,
        requester: &Requester,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        let channel = self.get(&requester.channel).await?;
        channel.respond(requester, response).await
    }

    /// Publish scheduler status on every channel. Failures are logged.
    pub async fn publish_status(&self, status: &SchedulerStatus) {
        let channels: Vec<Arc<dyn Channel>> =
            self.channels.read().await.values().cloned().collect();
        for channel in channels {
            if let Err(e) = channel.publish_status(status).await {
                tracing::debug!("Status publish on {} failed: {e}", channel.name());
            }
        }
    }

    pub async fn health_check_all(&self) -> HashMap<String, Result<(), ChannelError>> {
        let channels: Vec<Arc<dyn Channel>> =
            self.channels.read().await.values().cloned().collect();
        let mut results = HashMap::new();
        for channel in channels {
            results.insert(channel.name().to_string(), channel.health_check().await);
        }
        results
    }

    pub async fn shutdown_all(&self) {
        let channels: Vec<Arc<dyn Channel>> =
            self.channels.read().await.values().cloned().collect();
        for channel in channels {
            if let Err(e) = channel.shutdown().await {
                tracing::warn!("Channel {} shutdown failed: {e}", channel.name());
            }
        }
    }
}
