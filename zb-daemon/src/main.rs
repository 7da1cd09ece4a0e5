// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Daemon entry point: newline-delimited JSON requests over a Unix
//! socket, dispatched to the store handler.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zb_daemon::config::Config;
use zb_daemon::error::{IoContext, ServerError};
use zb_daemon::server::Server;
use zb_daemon::server::handler::Handler;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let config = match std::env::var("ZB_DAEMON_CONFIG") {
        Ok(path) => Config::from_file(&PathBuf::from(path))?,
        Err(_) => Config::default(),
    };

    let filter = EnvFilter::try_from_env("ZB_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting zb-daemon");
    info!("store directory: {}", config.store_dir.display());
    info!("database: {}", config.db_path.display());
    info!("socket: {}", config.socket_path.display());

    let server = Server::new(&config)?;
    let handler = Handler::new(server.clone());

    let _ = std::fs::remove_file(&config.socket_path);
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .io_context(|| format!("failed to create {}", parent.display()))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .io_context(|| format!("failed to bind {}", config.socket_path.display()))?;

    let shutdown = CancellationToken::new();
    let accept_shutdown = shutdown.clone();
    let accept = tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        let ctx = accept_shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(handler, stream, ctx).await {
                                error!("connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                        break;
                    }
                },
                _ = accept_shutdown.cancelled() => break,
            }
        }
    });

    shutdown_signal().await;
    info!("received shutdown signal; draining");
    server.drain();
    shutdown.cancel();
    let _ = accept.await;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .io_context(|| format!("failed to remove {}", config.socket_path.display()))?;
    }
    info!("zb-daemon stopped");
    Ok(())
}

/// One request per line: `{"method": "...", "params": {...}}`; one JSON
/// response per line.
async fn serve_connection(
    handler: Handler,
    stream: UnixStream,
    ctx: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<serde_json::Value>(&line) {
            Err(e) => error_response(&ServerError::InvalidParams(e.to_string())),
            Ok(request) => {
                let method = request
                    .get("method")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_owned();
                let params = request
                    .get("params")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                match handler.handle(&ctx, &method, params).await {
                    Ok(result) => serde_json::json!({ "result": result }),
                    Err(e) => error_response(&e),
                }
            }
        };
        let mut out = response.to_string();
        out.push('\n');
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

fn error_response(err: &ServerError) -> serde_json::Value {
    serde_json::json!({ "error": { "message": err.to_string() } })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
