use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use codex_opencode_bridge::cli::shutdown_signal;
use codex_opencode_bridge::telemetry::init_logging;
use thiserror::Error;
use tokio::sync::watch;

use crate::client::{BridgeClient, ClientError};
use crate::codex::{event_from_notification, parse_notification};
use crate::opencode::{run_relay, OpenCodeClient, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "bridge-notify")]
#[command(about = "Forward Codex and OpenCode activity to the Discord bridge", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, env = "LOG_LEVEL", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Post one Codex notify payload; Codex appends the JSON as the last argument.
    Codex(CodexArgs),
    /// Follow an OpenCode server's events and feed replies back into its sessions.
    #[command(name = "opencode-relay")]
    OpencodeRelay(RelayArgs),
}

#[derive(Args, Debug)]
pub struct CodexArgs {
    pub bridge_url: String,
    pub auth_token: String,
    pub notification: String,
}

#[derive(Args, Debug)]
pub struct RelayArgs {
    #[arg(long, env = "DISCORD_BRIDGE_URL")]
    pub bridge_url: String,

    #[arg(long, env = "DISCORD_BRIDGE_TOKEN", hide_env_values = true)]
    pub bridge_token: String,

    #[arg(
        long = "poll-interval-ms",
        env = "DISCORD_BRIDGE_POLL_INTERVAL",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(100..)
    )]
    pub poll_interval_ms: u64,

    #[arg(long, env = "OPENCODE_URL", default_value = "http://127.0.0.1:4096")]
    pub opencode_url: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
}

pub fn run_notify() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.command {
        Command::Codex(args) => runtime.block_on(notify_codex(args)),
        Command::OpencodeRelay(args) => runtime.block_on(relay_opencode(args, shutdown_signal())),
    }
}

async fn notify_codex(args: CodexArgs) -> Result<(), CliError> {
    let payload = parse_notification(&args.notification)?;
    let client = BridgeClient::new(&args.bridge_url, args.auth_token)?;
    let event = event_from_notification(&payload, Utc::now());
    client.post_event(&event).await?;
    tracing::info!(event_id = %event.id, "codex notification forwarded");
    Ok(())
}

async fn relay_opencode(
    args: RelayArgs,
    stop: impl Future<Output = ()>,
) -> Result<(), CliError> {
    let config = RelayConfig {
        bridge: BridgeClient::new(&args.bridge_url, args.bridge_token)?,
        opencode: OpenCodeClient::new(&args.opencode_url)?,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
    };
    tracing::info!(
        bridge = %config.bridge.base_url(),
        poll_interval_ms = args.poll_interval_ms,
        "starting opencode relay"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(run_relay(config, shutdown_rx));
    stop.await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = relay.await {
        tracing::warn!(error = %err, "relay task failed");
    }
    Ok(())
}
