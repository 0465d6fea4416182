//! Terminal worker process entry point.
//!
//! The host re-invokes its own binary with the `terminal-worker`
//! subcommand and drives it over stdio: one [`WorkerRequest`] JSON
//! object per stdin line, one [`WorkerEvent`] JSON object per stdout
//! line. All terminals of a host instance live in this single process,
//! so a crashed shell never takes the host down with it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use portway_core::protocol::{WorkerEvent, WorkerRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::pty::{PtyHandle, TermSize};

/// Run the worker loop until stdin closes.
pub async fn run() -> Result<()> {
    let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(256);
    let writer = tokio::spawn(write_events(event_rx));

    let terminals: Arc<Mutex<HashMap<String, Arc<PtyHandle>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("worker stdin read")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("ignoring malformed worker request: {}", e);
                continue;
            }
        };
        handle_request(request, &terminals, &event_tx).await;
    }

    // Host went away; tear every shell down before exiting.
    debug!("worker stdin closed, shutting down terminals");
    let remaining: Vec<_> = terminals.lock().await.drain().collect();
    for (_, handle) in remaining {
        handle.shutdown().await;
    }

    drop(event_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_request(
    request: WorkerRequest,
    terminals: &Arc<Mutex<HashMap<String, Arc<PtyHandle>>>>,
    event_tx: &mpsc::Sender<WorkerEvent>,
) {
    match request {
        WorkerRequest::Create {
            id,
            cols,
            rows,
            shell,
        } => {
            if terminals.lock().await.contains_key(&id) {
                report_error(event_tx, &id, "terminal id already in use").await;
                return;
            }
            match PtyHandle::spawn(&shell, TermSize { cols, rows }) {
                Ok(handle) => {
                    let handle = Arc::new(handle);
                    terminals.lock().await.insert(id.clone(), handle.clone());
                    tokio::spawn(pump_output(
                        id,
                        handle,
                        terminals.clone(),
                        event_tx.clone(),
                    ));
                }
                Err(e) => report_error(event_tx, &id, &e.to_string()).await,
            }
        }
        WorkerRequest::Write { id, data } => {
            let handle = terminals.lock().await.get(&id).cloned();
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.write(data).await {
                        report_error(event_tx, &id, &e.to_string()).await;
                    }
                }
                None => report_error(event_tx, &id, "unknown terminal id").await,
            }
        }
        WorkerRequest::Resize { id, cols, rows } => {
            let handle = terminals.lock().await.get(&id).cloned();
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.resize(TermSize { cols, rows }) {
                        report_error(event_tx, &id, &e.to_string()).await;
                    }
                }
                None => report_error(event_tx, &id, "unknown terminal id").await,
            }
        }
        WorkerRequest::Remove { id } => {
            let handle = terminals.lock().await.remove(&id);
            if let Some(handle) = handle {
                // The pump observes the closed channel and emits Exit.
                handle.shutdown().await;
            }
        }
    }
}

/// Forward shell output for one terminal until its PTY closes.
async fn pump_output(
    id: String,
    handle: Arc<PtyHandle>,
    terminals: Arc<Mutex<HashMap<String, Arc<PtyHandle>>>>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    while let Some(payload) = handle.read().await {
        let event = WorkerEvent::Data {
            id: id.clone(),
            payload,
        };
        if event_tx.send(event).await.is_err() {
            return;
        }
    }

    terminals.lock().await.remove(&id);
    let _ = event_tx.send(WorkerEvent::Exit { id }).await;
}

async fn report_error(event_tx: &mpsc::Sender<WorkerEvent>, id: &str, error: &str) {
    let event = WorkerEvent::Error {
        id: id.to_string(),
        error: error.to_string(),
    };
    let _ = event_tx.send(event).await;
}

/// Single writer task; serializing here keeps stdout lines whole even
/// when several terminals produce output at once.
async fn write_events(mut event_rx: mpsc::Receiver<WorkerEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = event_rx.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!("unserializable worker event: {}", e);
                continue;
            }
        };
        line.push(b'\n');
        if stdout.write_all(&line).await.is_err() {
            return;
        }
        let _ = stdout.flush().await;
    }
}
