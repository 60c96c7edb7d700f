//! Configuration types.
//!
//! Everything is read from environment variables once at startup.
//! [`Config::from_lookup`] takes any key lookup so tests never touch the
//! process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::backends::{ChatCompletionsConfig, GeminiConfig, RoutingPolicy, SandboxConfig};
use crate::error::ConfigError;
use crate::roles::{AuthorityTier, RoleTable};
use crate::worker::scheduler::SchedulerConfig;

/// Bot front-end configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Bot name for identification.
    pub name: String,
    /// When set, only messages starting with this word are handled and the
    /// word is stripped (e.g. "/ask").
    pub trigger: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "ai-relay".to_string(),
            trigger: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub allowed_users: Vec<String>,
    /// Chat that shows the live status panel.
    pub status_chat_id: Option<String>,
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot: BotConfig,
    pub telegram: Option<TelegramConfig>,
    pub cli_enabled: bool,
    pub cli_user: String,
    pub gemini: Option<GeminiConfig>,
    pub alternate: Option<ChatCompletionsConfig>,
    pub sandbox: SandboxConfig,
    pub routing: RoutingPolicy,
    pub roles_path: PathBuf,
    /// Written to `roles_path` if the file does not exist yet.
    pub default_roles: RoleTable,
    pub sessions_dir: PathBuf,
    pub scheduler: SchedulerConfig,
    /// Status publish interval (`None` = disabled).
    pub status_interval: Option<Duration>,
    /// Port for the status REST endpoints (`None` = disabled).
    pub status_port: Option<u16>,
    /// Directory for a daily rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot = BotConfig {
            name: get("AI_RELAY_NAME").unwrap_or_else(|| BotConfig::default().name),
            trigger: get("AI_RELAY_TRIGGER"),
        };

        let telegram = get("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            bot_token: SecretString::from(token),
            allowed_users: parse_list(get("TELEGRAM_ALLOWED_USERS")),
            status_chat_id: get("TELEGRAM_STATUS_CHAT_ID"),
        });

        let cli_enabled = match get("AI_RELAY_CLI") {
            Some(v) => parse_bool("AI_RELAY_CLI", &v)?,
            None => telegram.is_none(),
        };

        let gemini = get("GEMINI_API_KEY").map(|key| {
            let mut config = GeminiConfig::new(SecretString::from(key));
            if let Some(model) = get("AI_RELAY_GEMINI_MODEL") {
                config.model = model;
            }
            if let Some(url) = get("AI_RELAY_GEMINI_URL") {
                config.base_url = url;
            }
            config
        });

        let alternate = get("VENICE_API_KEY").map(|key| {
            let mut config = ChatCompletionsConfig::venice(SecretString::from(key));
            if let Some(model) = get("AI_RELAY_ALT_MODEL") {
                config.model = model;
            }
            if let Some(url) = get("AI_RELAY_ALT_URL") {
                config.url = url;
            }
            if let Some(label) = get("AI_RELAY_ALT_LABEL") {
                config.label = label;
            }
            config
        });

        let mut sandbox = SandboxConfig::default();
        if let Some(program) = get("AI_RELAY_SANDBOX_PROGRAM") {
            sandbox.program = program;
        }
        if let Some(args) = get("AI_RELAY_SANDBOX_ARGS") {
            sandbox.args = args.split_whitespace().map(String::from).collect();
        }

        let mut routing = RoutingPolicy::default();
        if let Some(v) = get("AI_RELAY_HOSTED_AVAILABLE") {
            routing.hosted_available = parse_bool("AI_RELAY_HOSTED_AVAILABLE", &v)?;
        }
        if let Some(prefix) = get("AI_RELAY_ALT_PREFIX") {
            routing.alternate_prefix = prefix;
        }
        if let Some(prefix) = get("AI_RELAY_SANDBOX_PREFIX") {
            routing.sandbox_prefix = prefix;
        }
        if let Some(v) = get("AI_RELAY_ALT_MIN_TIER") {
            routing.alternate_min_tier = parse_value("AI_RELAY_ALT_MIN_TIER", &v)?;
        }

        let default_roles = RoleTable {
            privileged: get("AI_RELAY_PRIVILEGED_USER"),
            elevated: parse_list(get("AI_RELAY_ELEVATED_USERS")),
        };

        let mut scheduler = SchedulerConfig::default();
        if let Some(v) = get("AI_RELAY_MAX_QUEUE") {
            scheduler.max_queue_depth = parse_value("AI_RELAY_MAX_QUEUE", &v)?;
        }
        if let Some(v) = get("AI_RELAY_JOB_TIMEOUT_SECS") {
            scheduler.job_timeout = seconds(parse_value("AI_RELAY_JOB_TIMEOUT_SECS", &v)?);
        }

        let status_interval = match get("AI_RELAY_STATUS_INTERVAL_SECS") {
            Some(v) => seconds(parse_value("AI_RELAY_STATUS_INTERVAL_SECS", &v)?),
            None => Some(Duration::from_secs(3)),
        };

        let status_port = get("AI_RELAY_STATUS_PORT")
            .map(|v| parse_value::<u16>("AI_RELAY_STATUS_PORT", &v))
            .transpose()?;

        Ok(Self {
            bot,
            telegram,
            cli_enabled,
            cli_user: get("AI_RELAY_CLI_USER").unwrap_or_else(|| "local-user".to_string()),
            gemini,
            alternate,
            sandbox,
            routing,
            roles_path: get("AI_RELAY_ROLES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/roles.json")),
            default_roles,
            sessions_dir: get("AI_RELAY_SESSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/sessions")),
            scheduler,
            status_interval,
            status_port,
            log_dir: get("AI_RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Zero seconds means "disabled".
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{value}'"),
        }),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
