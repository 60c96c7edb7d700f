use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use ai_relay::backends::{ChatCompletionsBackend, Dispatcher, GeminiBackend, SandboxBackend};
use ai_relay::bot::{Bot, BotDeps, ChannelReplySink};
use ai_relay::channels::{ChannelManager, CliChannel, TelegramChannel};
use ai_relay::config::Config;
use ai_relay::roles::RoleResolver;
use ai_relay::sessions::SessionStore;
use ai_relay::status::{spawn_status_ticker, status_routes};
use ai_relay::worker::Scheduler;

/// Log to stderr, plus a daily rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ai-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("🤖 AI Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Primary: {}",
        if config.gemini.is_some() { "Gemini API" } else { "sandbox only" }
    );
    eprintln!(
        "   Hosted backends: {}",
        if config.routing.hosted_available { "available" } else { "unavailable" }
    );
    eprintln!("   Sandbox: {} {}", config.sandbox.program, config.sandbox.args.join(" "));

    // ── Roles & sessions ─────────────────────────────────────────────────
    let roles = Arc::new(
        RoleResolver::load(&config.roles_path, config.default_roles.clone())
            .await
            .with_context(|| format!("loading roles from {}", config.roles_path.display()))?,
    );
    eprintln!("   Roles: {}", config.roles_path.display());

    let sessions = Arc::new(SessionStore::new(&config.sessions_dir));
    eprintln!("   Sessions: {}", config.sessions_dir.display());

    // ── Channels ─────────────────────────────────────────────────────────
    let channels = Arc::new(ChannelManager::new());

    if config.cli_enabled {
        channels
            .add(Arc::new(CliChannel::new(config.cli_user.clone())))
            .await;
        eprintln!("   CLI: enabled (user: {})", config.cli_user);
    }

    if let Some(ref tg) = config.telegram {
        let mut telegram = TelegramChannel::new(tg.bot_token.clone(), tg.allowed_users.clone());
        if let Some(ref chat_id) = tg.status_chat_id {
            telegram = telegram.with_status_chat(chat_id);
        }
        channels.add(Arc::new(telegram)).await;
        eprintln!(
            "   Telegram: enabled (allowed: {})",
            if tg.allowed_users.is_empty() {
                "nobody".to_string()
            } else {
                tg.allowed_users.join(", ")
            }
        );
    }

    // ── Backends & scheduler ─────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(
        config.routing.clone(),
        Arc::new(SandboxBackend::new(config.sandbox.clone())),
        Arc::clone(&sessions),
    );
    if let Some(ref gemini) = config.gemini {
        dispatcher = dispatcher.with_primary(Arc::new(GeminiBackend::new(gemini.clone())));
    }
    if let Some(ref alternate) = config.alternate {
        dispatcher =
            dispatcher.with_alternate(Arc::new(ChatCompletionsBackend::new(alternate.clone())));
    }

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&roles),
        Arc::new(dispatcher),
        Arc::new(ChannelReplySink::new(Arc::clone(&channels))),
    );

    // ── Status ───────────────────────────────────────────────────────────
    let ticker = config.status_interval.map(|every| {
        spawn_status_ticker(Arc::clone(&scheduler), Arc::clone(&channels), every)
    });

    if let Some(port) = config.status_port {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding status port {port}"))?;
        let app = status_routes(Arc::clone(&scheduler));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Status server stopped: {e}");
            }
        });
        eprintln!("   Status API: http://0.0.0.0:{port}/api/status");
    }

    eprintln!();

    let bot = Bot::new(
        config.bot.clone(),
        BotDeps {
            scheduler,
            channels,
            sessions,
            routing: config.routing.clone(),
        },
    );
    bot.run().await?;

    if let Some(handle) = ticker {
        handle.abort();
    }
    Ok(())
}
