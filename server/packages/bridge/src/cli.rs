use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::chat::ChatError;
use crate::discord::DiscordClient;
use crate::discord::DiscordPoller;
use crate::event_router::EventRouter;
use crate::reply_queue::ReplyQueue;
use crate::router::{build_router, AppState, AuthConfig};
use crate::session::BridgeSession;
use crate::telemetry::init_logging;

const MIN_AUTH_TOKEN_LEN: usize = 8;
const CHAT_INBOUND_CAPACITY: usize = 128;

#[derive(Parser, Debug, Clone)]
#[command(name = "codex-opencode-bridge")]
#[command(about = "Relay Codex and OpenCode notifications into Discord threads", version)]
pub struct Cli {
    /// Bot token used for the Discord REST API.
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true, value_parser = non_empty)]
    pub discord_token: String,

    /// Guild text channel that new threads are started in.
    #[arg(long, env = "DISCORD_CHANNEL_ID", value_parser = non_empty)]
    pub discord_channel_id: String,

    /// Bearer token every API call except /health must present.
    #[arg(long, env = "BRIDGE_AUTH_TOKEN", hide_env_values = true, value_parser = auth_token)]
    pub auth_token: String,

    #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "BRIDGE_PORT", default_value_t = 8787)]
    pub port: u16,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// How often active threads are checked for human replies.
    #[arg(
        long = "poll-interval-ms",
        env = "DISCORD_POLL_INTERVAL_MS",
        default_value_t = 3000,
        value_parser = clap::value_parser!(u64).range(250..)
    )]
    pub poll_interval_ms: u64,

    #[arg(long, env = "DISCORD_API_BASE")]
    pub discord_api_base: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("discord authentication failed: {0}")]
    ChatAuth(ChatError),
    #[error("chat client error: {0}")]
    Chat(#[from] ChatError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

fn non_empty(value: &str) -> Result<String, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    Ok(value.to_string())
}

fn auth_token(value: &str) -> Result<String, String> {
    let value = non_empty(value)?;
    if value.chars().count() < MIN_AUTH_TOKEN_LEN {
        return Err(format!("must be at least {MIN_AUTH_TOKEN_LEN} characters"));
    }
    Ok(value)
}

pub fn run_bridge() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(cli))
}

async fn serve(cli: Cli) -> Result<(), CliError> {
    let discord = Arc::new(DiscordClient::new(
        cli.discord_token.clone(),
        cli.discord_api_base.as_deref(),
    )?);
    let bot = discord.current_user().await.map_err(CliError::ChatAuth)?;
    tracing::info!(bot_user = %bot.username, bot_user_id = %bot.id, "authenticated with discord");

    let router = Arc::new(EventRouter::new());
    let replies = Arc::new(ReplyQueue::new(router.clone()));
    let session = Arc::new(BridgeSession::new(discord.clone(), replies.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (chat_tx, chat_rx) = mpsc::channel(CHAT_INBOUND_CAPACITY);

    let mut tasks = vec![
        tokio::spawn(
            session
                .clone()
                .serve_events(router.subscribe_events(), shutdown_rx.clone()),
        ),
        tokio::spawn(session.clone().serve_chat(chat_rx, shutdown_rx.clone())),
    ];

    match discord.resolve_text_channel(&cli.discord_channel_id).await {
        Ok(channel) => {
            tracing::info!(channel_id = %channel.id, guild_id = %channel.guild_id, "discord channel ready");
            session.set_channel(channel.id.clone()).await;
            let poller = DiscordPoller::new(discord.clone(), channel, bot.id.clone());
            tasks.push(tokio::spawn(poller.run(
                Duration::from_millis(cli.poll_interval_ms),
                chat_tx,
                shutdown_rx.clone(),
            )));
        }
        Err(err) => {
            tracing::error!(
                channel_id = %cli.discord_channel_id,
                error = %err,
                "failed to resolve discord channel; events will be dropped"
            );
        }
    }

    let state = AppState::new(
        AuthConfig::with_token(cli.auth_token.clone()),
        router.clone(),
        replies,
    );
    let app = build_router(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| CliError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(addr = %addr, "http server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| CliError::Server(err.to_string()));

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task failed");
        }
    }
    served
}

/// Resolves on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
