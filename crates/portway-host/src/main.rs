//! portway host entry point.

mod args;
mod daemon;
mod dispatch;
mod external;
mod paths;
mod rdp;
mod server;
mod sessions;
mod settings;
mod spawn;
mod terminal;

use std::sync::Arc;

use clap::Parser;
use portway_core::protocol::{HostCommand, Request, Response};
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use crate::args::{Cli, Commands};
use crate::daemon::{DaemonKind, DaemonManager};
use crate::dispatch::Dispatcher;
use crate::rdp::RdpManager;
use crate::server::HostServer;
use crate::sessions::SessionManager;
use crate::settings::SettingsStore;
use crate::terminal::TerminalManager;

/// Buffer depth for the push-event fan-out.
const EVENT_CHANNEL_DEPTH: usize = 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => runtime.block_on(run_server()),
        Commands::TerminalWorker => runtime.block_on(terminal::worker::run()),
        Commands::Call(call) => runtime.block_on(run_call(call)),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Wire the managers together and serve until a signal or a forced
/// window close.
async fn run_server() -> anyhow::Result<()> {
    paths::ensure_socket_dir()?;

    // The CLI may be missing; operations that need it fail individually
    // and `cliExists` reports the situation to the UI.
    let cli = paths::cli_path().unwrap_or_else(|| paths::CLI_BINARY.into());

    let settings = Arc::new(SettingsStore::load(paths::settings_path()));
    let sessions = Arc::new(SessionManager::new(cli.clone()));
    sessions.spawn_cleaner();

    let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
    let dispatcher = Arc::new(Dispatcher::new(
        settings.clone(),
        sessions,
        Arc::new(DaemonManager::new(DaemonKind::Cache, cli.clone())),
        Arc::new(DaemonManager::new(DaemonKind::ClientAgent, cli)),
        TerminalManager::new()?,
        Arc::new(RdpManager::new(settings)),
        events,
    ));

    let server = HostServer::bind(dispatcher.clone()).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            dispatcher.shutdown().await;
        }
        _ = sigterm() => {
            info!("received SIGTERM, shutting down");
            dispatcher.shutdown().await;
        }
    }
    // Dropping the server removes the socket and PID files.
    Ok(())
}

/// One-shot debugging client: send a command to a running host and
/// print the matching response.
async fn run_call(call: args::CallArgs) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let command: HostCommand = serde_json::from_str(&call.command)
        .map_err(|e| anyhow::anyhow!("invalid command JSON: {}", e))?;
    let request = Request {
        id: Uuid::new_v4().to_string(),
        command,
    };

    let stream = tokio::net::UnixStream::connect(paths::host_socket_path()).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    // Push events may interleave with the response; skip until our id
    // comes back.
    let mut response_line = String::new();
    loop {
        response_line.clear();
        if reader.read_line(&mut response_line).await? == 0 {
            anyhow::bail!("host closed the connection without responding");
        }
        if let Ok(response) = serde_json::from_str::<Response>(response_line.trim()) {
            if response.id != request.id {
                continue;
            }
            if response.ok {
                if let Some(data) = response.data {
                    println!("{}", serde_json::to_string_pretty(&data)?);
                }
                return Ok(());
            }
            if let Some(err) = response.error {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
            return Ok(());
        }
    }
}

/// Wait for SIGTERM (Unix only); falls back to a never-completing
/// future when registration fails.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
