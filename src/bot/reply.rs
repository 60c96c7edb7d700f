//! Delivers scheduler results through the channel manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backends::Reply;
use crate::channels::{ChannelManager, OutgoingResponse};
use crate::worker::job::Requester;
use crate::worker::scheduler::ReplySink;

pub struct ChannelReplySink {
    channels: Arc<ChannelManager>,
}

impl ChannelReplySink {
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl ReplySink for ChannelReplySink {
    async fn deliver(&self, requester: &Requester, reply: Reply) {
        if let Err(e) = self
            .channels
            .respond(requester, OutgoingResponse::from(&reply))
            .await
        {
            tracing::error!(
                requester = %requester.display_name(),
                channel = %requester.channel,
                "Failed to deliver reply: {e}"
            );
        }
    }

    async fn deliver_failure(&self, requester: &Requester, notice: &str) {
        if let Err(e) = self
            .channels
            .respond(requester, OutgoingResponse::text(notice))
            .await
        {
            tracing::error!(
                requester = %requester.display_name(),
                channel = %requester.channel,
                "Failed to deliver failure notice: {e}"
            );
        }
    }
}
