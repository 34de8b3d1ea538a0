//! Backwatch CLI entry point
//!
//! Thin operational front-end over backwatch-core: follow the operation
//! event feed, tail an operation's logs, or issue one-shot API calls.

mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use backwatch_core::api::endpoints;
use backwatch_core::stream::{
    EphemeralStreamSession, HttpStreamTransport, ReconnectPolicy, SharedStreamSession,
    EPHEMERAL_RECONNECT_INTERVAL_MS, SHARED_RECONNECT_INTERVAL_MS,
};
use backwatch_core::{QueryClient, ServerConfig};
use output::ConsoleSink;

#[derive(Parser)]
#[command(name = "backwatch", version, about = "Client for a Backrest backup server")]
struct Cli {
    /// Path to a TOML config file (default: ~/.config/backwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server base URL, e.g. http://localhost:9898
    #[arg(long, global = true)]
    url: Option<String>,

    /// Basic Auth username
    #[arg(long, global = true)]
    username: Option<String>,

    /// Basic Auth password
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Follow the live operation-event feed
    Watch {
        /// Reopen the feed automatically after failures
        #[arg(long)]
        reconnect: bool,

        /// Delay between reconnect attempts in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Maximum reconnect attempts, 0 = unlimited
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Tail the logs of one operation
    Logs {
        /// Operation reference to follow
        #[arg(value_name = "REF")]
        operation_ref: String,
    },

    /// Issue a one-shot API call and print the response
    Call {
        /// Full endpoint path, e.g. /v1.Backrest/GetOperations
        endpoint: String,

        /// JSON request body (defaults to an empty object)
        body: Option<String>,
    },

    /// List the known API endpoints
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Watch {
            reconnect,
            interval_ms,
            max_attempts,
        } => watch(&cli, *reconnect, *interval_ms, *max_attempts).await,
        Command::Logs { operation_ref } => logs(&cli, operation_ref).await,
        Command::Call { endpoint, body } => call(&cli, endpoint, body.as_deref()).await,
        Command::Endpoints => {
            list_endpoints();
            Ok(())
        }
    }
}

async fn watch(
    cli: &Cli,
    reconnect: bool,
    interval_ms: Option<u64>,
    max_attempts: Option<u32>,
) -> Result<()> {
    let config = load_config(cli)?;
    let transport = Arc::new(HttpStreamTransport::from_config(&config)?);
    let policy = ReconnectPolicy::new(
        reconnect || config.auto_reconnect,
        Duration::from_millis(
            interval_ms
                .or(config.reconnect_interval_ms)
                .unwrap_or(SHARED_RECONNECT_INTERVAL_MS),
        ),
        max_attempts.unwrap_or(config.max_reconnect_attempts),
    );
    let session = SharedStreamSession::operation_events(transport, config.auth_metadata(), policy);

    let (sink, mut terminated) = ConsoleSink::new();
    session.subscribe("backwatch-cli", Arc::new(sink)).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("Interrupted; unsubscribing"),
        _ = terminated.recv() => {}
    }
    session.unsubscribe("backwatch-cli").await;
    Ok(())
}

async fn logs(cli: &Cli, operation_ref: &str) -> Result<()> {
    let config = load_config(cli)?;
    let transport = Arc::new(HttpStreamTransport::from_config(&config)?);
    let (sink, mut terminated) = ConsoleSink::new();
    let session = if config.auto_reconnect {
        // Log tails normally end with their operation; reconnect only when
        // the config opts in explicitly
        let policy = ReconnectPolicy::new(
            true,
            Duration::from_millis(
                config
                    .reconnect_interval_ms
                    .unwrap_or(EPHEMERAL_RECONNECT_INTERVAL_MS),
            ),
            config.max_reconnect_attempts,
        );
        EphemeralStreamSession::with_policy(
            transport,
            backwatch_core::stream::GET_LOGS_METHOD,
            config.auth_metadata(),
            policy,
            Arc::new(sink),
        )
    } else {
        EphemeralStreamSession::log_tail(transport, config.auth_metadata(), Arc::new(sink))
    };

    session.start(json!({ "ref": operation_ref })).await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("Interrupted; stopping stream"),
        _ = terminated.recv() => {}
    }
    session.stop().await;
    Ok(())
}

async fn call(cli: &Cli, endpoint: &str, body: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let payload: Value = match body {
        Some(raw) => serde_json::from_str(raw).context("request body is not valid JSON")?,
        None => Value::Object(Default::default()),
    };

    let client = QueryClient::new(&config)?;
    let response = client.call(endpoint, payload).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn list_endpoints() {
    for descriptor in endpoints() {
        let kind = if descriptor.is_streaming() { "stream" } else { "call" };
        println!("{:<42} [{}] {}", descriptor.path, kind, descriptor.description);
    }
}

fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let path = cli.config.clone().or_else(default_config_path);
    let mut config = match path {
        Some(path) if path.exists() => ServerConfig::load(&path)?,
        _ => ServerConfig::new(""),
    };
    config.apply_env_overrides();
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }
    if let Some(username) = &cli.username {
        config.username = username.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
    config
        .validate()
        .context("no server configured; pass --url or create a config file")?;
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("backwatch").join("config.toml"))
}
