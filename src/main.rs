//! TCP server for the exchange.
//!
//! Newline-delimited JSON over a stream socket. Connections are handled
//! concurrently, but every parsed request is funneled through a single
//! dispatcher task that owns the coordinator, so commands run strictly one
//! at a time. A state snapshot is loaded on boot and rewritten after every
//! mutating command, always between commands and never mid-command.

use screentime_core::config::ServerConfig;
use screentime_core::coordinator::{Command, Coordinator, CoordinatorError, Response};
use screentime_core::protocol::{Reply, Request};
use screentime_core::snapshot::Snapshot;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

struct Job {
    command: Command,
    reply: oneshot::Sender<Result<Response, CoordinatorError>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();
    let coordinator = boot_coordinator(&config)?;

    let (tx, rx) = mpsc::channel::<Job>(256);
    let snapshot_path = config.snapshot_path.clone();
    tokio::spawn(dispatcher(coordinator, rx, snapshot_path));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "exchange listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "client connected");
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, tx).await {
                tracing::warn!(%peer, error = %err, "connection error");
            }
            tracing::info!(%peer, "client disconnected");
        });
    }
}

fn boot_coordinator(config: &ServerConfig) -> anyhow::Result<Coordinator> {
    let Some(path) = &config.snapshot_path else {
        return Ok(Coordinator::new(config.audit));
    };
    match std::fs::read_to_string(path) {
        Ok(json) => {
            let snapshot = Snapshot::from_json(&json)?;
            let coordinator = Coordinator::from_snapshot(&snapshot, config.audit)?;
            tracing::info!(path = %path.display(), "state restored from snapshot");
            Ok(coordinator)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no snapshot found, starting fresh");
            Ok(Coordinator::new(config.audit))
        }
        Err(err) => Err(err.into()),
    }
}

/// Owns the coordinator. Commands run to completion one at a time; the
/// snapshot is written only after a successful mutation.
async fn dispatcher(mut coordinator: Coordinator, mut rx: mpsc::Receiver<Job>, snapshot_path: Option<PathBuf>) {
    while let Some(job) = rx.recv().await {
        let mutating = job.command.is_mutation();
        let result = coordinator.execute(job.command);

        if mutating && result.is_ok() {
            if let Some(path) = &snapshot_path {
                match coordinator.dump_state().to_json() {
                    Ok(json) => {
                        if let Err(err) = tokio::fs::write(path, json).await {
                            tracing::error!(path = %path.display(), error = %err, "snapshot write failed");
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "snapshot serialization failed");
                    }
                }
            }
        }

        // the client may have gone away; that is not our problem
        let _ = job.reply.send(result);
    }
}

async fn handle_client(stream: TcpStream, tx: mpsc::Sender<Job>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(line) {
            Err(err) => Reply::malformed(format!("bad request: {err}")),
            Ok(request) => match request.into_command() {
                Err(err) => Reply::from_error(&err),
                Ok(command) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    tx.send(Job {
                        command,
                        reply: reply_tx,
                    })
                    .await
                    .map_err(|_| anyhow::anyhow!("dispatcher is gone"))?;
                    let result = reply_rx
                        .await
                        .map_err(|_| anyhow::anyhow!("dispatcher dropped the reply"))?;
                    Reply::from_result(result)
                }
            },
        };

        let mut payload = serde_json::to_string(&reply)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }

    Ok(())
}
