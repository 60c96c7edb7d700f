//! Main bot loop.
//!
//! Reads messages from every channel, answers control commands directly and
//! submits requests to the scheduler. Replies to requests arrive later
//! through the scheduler's reply sink.

use std::sync::Arc;

use futures::StreamExt;

use crate::backends::RoutingPolicy;
use crate::bot::command::{Command, CommandParser};
use crate::channels::{ChannelManager, IncomingMessage, OutgoingResponse};
use crate::config::BotConfig;
use crate::error::{Error, JobError};
use crate::roles::AuthorityTier;
use crate::sessions::SessionStore;
use crate::status::render_summary;
use crate::worker::job::Requester;
use crate::worker::scheduler::{CancelOutcome, CancelScope, Scheduler};

/// Shared components the bot talks to.
pub struct BotDeps {
    pub scheduler: Arc<Scheduler>,
    pub channels: Arc<ChannelManager>,
    pub sessions: Arc<SessionStore>,
    /// Same rules the dispatcher applies, used to reject requests before
    /// they are queued.
    pub routing: RoutingPolicy,
}

pub struct Bot {
    config: BotConfig,
    deps: BotDeps,
}

impl Bot {
    pub fn new(config: BotConfig, deps: BotDeps) -> Self {
        Self { config, deps }
    }

    /// Run until Ctrl+C or until every channel stream ends.
    pub async fn run(self) -> Result<(), Error> {
        let mut message_stream = self.deps.channels.start_all().await?;

        tracing::info!("{} ready and listening", self.config.name);

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                    break;
                }
                msg = message_stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("All channel streams ended, shutting down...");
                            break;
                        }
                    }
                }
            };

            let requester = message.requester();
            match self.handle_message(&message).await {
                Ok(Some(response)) => self.answer(&requester, response).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Error handling message: {}", e);
                    self.answer(&requester, format!("Error: {}", e)).await;
                }
            }
        }

        tracing::info!("{} shutting down...", self.config.name);
        let dropped = self.deps.scheduler.shutdown();
        if dropped > 0 {
            tracing::info!(dropped, "Dropped pending jobs");
        }
        self.deps.channels.shutdown_all().await;

        Ok(())
    }

    /// Handle one message. Returns the text to answer with immediately, if
    /// any.
    pub async fn handle_message(&self, message: &IncomingMessage) -> Result<Option<String>, Error> {
        let Some(content) = self.strip_trigger(&message.content) else {
            return Ok(None);
        };

        let requester = message.requester();
        tracing::debug!(
            "Received message from {} on {} ({} chars)",
            requester.display_name(),
            requester.channel,
            content.len()
        );

        let response = match CommandParser::parse(content) {
            Command::Ask { text } => self.submit(requester, text),
            Command::Stop { all } => Some(self.stop(&requester, all)),
            Command::NewSession => {
                self.deps.sessions.new_session(&requester).await?;
                Some("Started a new session.".to_string())
            }
            Command::Status => Some(render_summary(&self.deps.scheduler.snapshot())),
            Command::ReloadRoles => Some(self.reload_roles(&requester).await?),
            Command::Help => Some(self.help_text()),
        };
        Ok(response)
    }

    /// Send an immediate answer. Delivery failures are logged.
    async fn answer(&self, requester: &Requester, text: String) {
        if let Err(e) = self
            .deps
            .channels
            .respond(requester, OutgoingResponse::text(text))
            .await
        {
            tracing::warn!("Failed to answer {}: {e}", requester.display_name());
        }
    }

    /// Apply the optional trigger word. `None` means the message is not for
    /// the bot.
    fn strip_trigger<'a>(&self, content: &'a str) -> Option<&'a str> {
        let Some(ref trigger) = self.config.trigger else {
            return Some(content);
        };
        let content = content.trim_start();
        let head = content.get(..trigger.len())?;
        let rest = &content[trigger.len()..];
        let at_boundary = rest.is_empty() || rest.starts_with(char::is_whitespace);
        (at_boundary && head.eq_ignore_ascii_case(trigger)).then(|| rest.trim())
    }

    fn submit(&self, requester: Requester, text: String) -> Option<String> {
        if text.is_empty() {
            return Some("Please include a request.".to_string());
        }

        let tier = self.deps.scheduler.tier_of(&requester);
        if let Err(denied) = self.deps.routing.route(&text, tier) {
            tracing::info!(
                requester = %requester.display_name(),
                tier = %tier,
                "Request rejected: {denied}"
            );
            return Some(denied.to_string());
        }

        match self.deps.scheduler.submit(requester, text) {
            Ok(ticket) if ticket.dispatched => None,
            // A preempting job outranks everything queued, so it runs next.
            Ok(ticket) if ticket.preempted => {
                Some("Interrupting the current request; yours is next.".to_string())
            }
            Ok(ticket) => Some(format!(
                "Your request is queued ({} ahead of you).",
                ticket.queued_ahead + 1
            )),
            Err(JobError::QueueFull { .. }) => {
                Some("The queue is full right now. Please try again later.".to_string())
            }
            Err(JobError::ShuttingDown) => {
                Some("Shutting down, not accepting new requests.".to_string())
            }
        }
    }

    fn stop(&self, requester: &Requester, all: bool) -> String {
        let scope = if all { CancelScope::All } else { CancelScope::Own };
        let outcome = self.deps.scheduler.request_cancel(requester, scope);
        match (outcome, all) {
            (CancelOutcome::Stopped, false) => "Stopping your request.".to_string(),
            (CancelOutcome::Stopped, true) => "Stopping the running request.".to_string(),
            (CancelOutcome::NoActiveJob, false) => "You have no running request.".to_string(),
            (CancelOutcome::NoActiveJob, true) => "Nothing is running.".to_string(),
            (CancelOutcome::Forbidden, false) => {
                format!("{} cannot stop this request.", requester.display_name())
            }
            (CancelOutcome::Forbidden, true) => {
                format!("{} cannot stop active processes.", requester.display_name())
            }
        }
    }

    async fn reload_roles(&self, requester: &Requester) -> Result<String, Error> {
        let roles = self.deps.scheduler.roles();
        if roles.resolve_any(requester.identities()) != AuthorityTier::TOP {
            return Ok("Only the privileged user can reload roles.".to_string());
        }
        roles.reload().await?;
        Ok("Role table reloaded.".to_string())
    }

    fn help_text(&self) -> String {
        let routing = &self.deps.routing;
        format!(
            "Send any message to get a reply.\n\
             {alt} <prompt>: use the alternate backend\n\
             {local} <prompt>: run in your sandbox session (elevated users)\n\
             /stop: stop your running request\n\
             /stop all: stop whatever is running (privileged user)\n\
             /new: start a new sandbox session\n\
             /status: show the queue\n\
             /reload: reload the role table (privileged user)",
            alt = routing.alternate_prefix,
            local = routing.sandbox_prefix,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Dispatcher, SandboxBackend, SandboxConfig};
    use crate::bot::reply::ChannelReplySink;
    use crate::roles::{RoleResolver, RoleTable};
    use crate::worker::scheduler::SchedulerConfig;

    fn bot(trigger: Option<&str>) -> Bot {
        let channels = Arc::new(ChannelManager::new());
        let sessions = Arc::new(SessionStore::new(std::env::temp_dir().join("ai-relay-bot-test")));
        let dispatcher = Dispatcher::new(
            RoutingPolicy::default(),
            Arc::new(SandboxBackend::new(SandboxConfig::default())),
            Arc::clone(&sessions),
        );
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(RoleResolver::new(RoleTable::default())),
            Arc::new(dispatcher),
            Arc::new(ChannelReplySink::new(Arc::clone(&channels))),
        );
        Bot::new(
            BotConfig {
                name: "test".into(),
                trigger: trigger.map(String::from),
            },
            BotDeps {
                scheduler,
                channels,
                sessions,
                routing: RoutingPolicy::default(),
            },
        )
    }

    #[test]
    fn without_trigger_everything_is_handled() {
        let b = bot(None);
        assert_eq!(b.strip_trigger("hello"), Some("hello"));
    }

    #[test]
    fn trigger_is_required_and_stripped() {
        let b = bot(Some("/ask"));
        assert_eq!(b.strip_trigger("  /ask  what time is it"), Some("what time is it"));
        assert_eq!(b.strip_trigger("/ASK /stop"), Some("/stop"));
        assert_eq!(b.strip_trigger("what time is it"), None);
        assert_eq!(b.strip_trigger("/as"), None);
        assert_eq!(b.strip_trigger("/asking for help"), None);
        assert_eq!(b.strip_trigger("/ask"), Some(""));
    }

    #[tokio::test]
    async fn answer_to_unknown_channel_is_logged_not_raised() {
        let b = bot(None);
        b.answer(&Requester::new("gone", "u1"), "hello".to_string())
            .await;
    }

    #[test]
    fn help_mentions_configured_prefixes() {
        let text = bot(None).help_text();
        assert!(text.contains("alt <prompt>"));
        assert!(text.contains("local <prompt>"));
    }
}
