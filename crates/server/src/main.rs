//! svakla server
//!
//! TLS-terminated chat server: an HTTP port serving the chat page and a
//! WebSocket port carrying chat turns, with history kept in a local store.

mod acceptor;
mod config;
mod engine;
mod error;
mod http_session;
mod logging;
mod paths;
mod server;
mod session_id;
mod store;
mod tls;
mod ws_session;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::config::{ConfigOverrides, ServerConfig};
use crate::server::Server;
use crate::store::ChatStore;

#[derive(Parser, Debug)]
#[command(
    name = "svakla",
    version,
    about = "TLS chat server with persistent history",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// Data directory (default: ~/svakla)
    #[arg(long, global = true, env = "SVAKLA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data-dir>/config/server.toml)
    #[arg(long, global = true, env = "SVAKLA_CONFIG")]
    config: Option<PathBuf>,

    /// Flags for the default `serve` command.
    #[command(flatten)]
    serve: ServeArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server until Ctrl-C or SIGTERM (default).
    Serve(ServeArgs),
    /// Print stored messages whose id starts with PREFIX, one JSON object per line.
    History {
        prefix: String,
    },
    /// Print one stored message by id.
    Show {
        id: String,
    },
    /// Remove stored messages.
    Clear {
        /// Keep everything; only report success.
        #[arg(long)]
        keep_logs: bool,
    },
    /// Rewrite the store into a defragmented copy.
    Compact,
    /// Show data directory, store size, and configured ports.
    Status(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address all listeners bind to.
    #[arg(long, env = "SVAKLA_BIND_ADDR")]
    bind: Option<IpAddr>,

    #[arg(long, env = "SVAKLA_HTTP_PORT")]
    http_port: Option<u16>,

    #[arg(long, env = "SVAKLA_WS_PORT")]
    ws_port: Option<u16>,

    #[arg(long, env = "SVAKLA_API_PORT")]
    api_port: Option<u16>,

    /// PEM certificate chain.
    #[arg(long, env = "SVAKLA_TLS_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key.
    #[arg(long, env = "SVAKLA_TLS_KEY")]
    key: Option<PathBuf>,

    /// External program used as the AI engine (text on stdin, reply on stdout).
    #[arg(long, env = "SVAKLA_ENGINE_COMMAND")]
    engine_command: Option<String>,
}

impl From<ServeArgs> for ConfigOverrides {
    fn from(args: ServeArgs) -> Self {
        ConfigOverrides {
            bind_addr: args.bind,
            http_port: args.http_port,
            ws_port: args.ws_port,
            api_port: args.api_port,
            cert_path: args.cert,
            key_path: args.key,
            engine_command: args.engine_command,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    match cli.command.unwrap_or(Command::Serve(cli.serve)) {
        Command::Serve(args) => serve(cli.config, args).await,
        Command::History { prefix } => history(&prefix),
        Command::Show { id } => show(&id),
        Command::Clear { keep_logs } => clear(keep_logs),
        Command::Compact => compact(),
        Command::Status(args) => status(cli.config, args),
    }
}

fn load_config(path: Option<PathBuf>, overrides: ConfigOverrides) -> anyhow::Result<ServerConfig> {
    let config = ServerConfig::load(path.as_deref())?.apply(overrides);
    config.validate()?;
    Ok(config)
}

fn open_store() -> anyhow::Result<ChatStore> {
    let dir = paths::chat_dir();
    ChatStore::open(&dir).with_context(|| format!("failed to open chat store at {}", dir.display()))
}

async fn serve(config_path: Option<PathBuf>, args: ServeArgs) -> anyhow::Result<()> {
    let logging = logging::init_logging(&paths::log_dir())?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths::data_dir().display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting svakla"
    );

    let config = load_config(config_path, args.into())?;
    let store = Arc::new(open_store()?);
    let engine = engine::from_config(&config.engine);
    info!(
        component = "server",
        event = "server.engine.selected",
        engine = engine.name(),
    );

    let running = Server::start(&config, Arc::clone(&store), engine).await?;

    let signal = shutdown_signal().await?;
    info!(
        component = "server",
        event = "server.shutdown_requested",
        signal,
        "Shutdown requested"
    );

    running.shutdown().await;
    store.close();
    drop(logging);
    Ok(())
}

/// Resolves with the name of whichever stop signal arrived first.
#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    Ok("ctrl-c")
}

fn history(prefix: &str) -> anyhow::Result<()> {
    let store = open_store()?;
    for message in store.scan(prefix)? {
        println!("{}", serde_json::to_string(&message)?);
    }
    store.close();
    Ok(())
}

fn show(id: &str) -> anyhow::Result<()> {
    let store = open_store()?;
    let found = store.get(id)?;
    store.close();
    match found {
        Some(message) => println!("{}", serde_json::to_string_pretty(&message)?),
        None => anyhow::bail!("no message with id {id}"),
    }
    Ok(())
}

fn clear(keep_logs: bool) -> anyhow::Result<()> {
    let store = open_store()?;
    store.clear(keep_logs)?;
    store.close();
    if keep_logs {
        println!("History kept.");
    } else {
        println!("History cleared.");
    }
    Ok(())
}

fn compact() -> anyhow::Result<()> {
    let store = open_store()?;
    let before = store.disk_usage();
    store.compact()?;
    let after = store.disk_usage();
    store.close();
    println!("Compacted chat store: {before} -> {after} bytes");
    Ok(())
}

fn status(config_path: Option<PathBuf>, args: ServeArgs) -> anyhow::Result<()> {
    let config = load_config(config_path, args.into())?;
    let store = open_store()?;
    let count = store.count()?;
    let usage = store.disk_usage();
    store.close();

    println!("data dir:     {}", paths::data_dir().display());
    println!("store:        {} ({count} messages, {usage} bytes)", store.dir().display());
    println!("http:         {}", config.http_addr());
    println!("websocket:    {}", config.ws_addr());
    println!("api:          {} (not served)", config.api_port);
    println!("certificate:  {}", config.cert_path.display());
    println!("private key:  {}", config.key_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "http_port = 9000\nws_port = 9001\n").unwrap();

        let cli = Cli::try_parse_from([
            "svakla",
            "status",
            "--ws-port",
            "7001",
            "--bind",
            "127.0.0.1",
        ])
        .unwrap();
        let Some(Command::Status(args)) = cli.command else {
            panic!("expected status command");
        };

        let config = load_config(Some(path), args.into()).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.ws_port, 7001);
        assert_eq!(config.ws_addr().to_string(), "127.0.0.1:7001");
    }

    #[test]
    fn bare_flags_select_the_serve_command() {
        let cli = Cli::try_parse_from(["svakla", "--http-port", "8443"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.http_port, Some(8443));
    }
}
