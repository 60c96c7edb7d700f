//! Chat commands understood by the relay.

/// Parses message text into a [`Command`].
pub struct CommandParser;

impl CommandParser {
    /// Parse message content. Anything that is not a known command is a
    /// request for a backend.
    pub fn parse(content: &str) -> Command {
        let trimmed = content.trim();
        let lower = trimmed.to_lowercase();
        let normalized = lower.split_whitespace().collect::<Vec<_>>().join(" ");

        match normalized.as_str() {
            "/stop" | "/cancel" => Command::Stop { all: false },
            "/stop all" | "/stopall" => Command::Stop { all: true },
            "/new" | "/newsession" | "/reset" => Command::NewSession,
            "/status" => Command::Status,
            "/reload" | "/reload roles" => Command::ReloadRoles,
            "/help" | "/?" | "/start" => Command::Help,
            _ => Command::Ask {
                text: trimmed.to_string(),
            },
        }
    }
}

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A request for a text-generation backend.
    Ask { text: String },
    /// Stop the caller's running job, or any running job with `all`.
    Stop { all: bool },
    /// Start a fresh session directory.
    NewSession,
    /// Show scheduler status.
    Status,
    /// Reload the role table from disk (top tier only).
    ReloadRoles,
    Help,
}
