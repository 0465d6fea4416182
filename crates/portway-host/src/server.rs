//! Unix socket server exposing the dispatcher to the UI process.
//!
//! Newline-delimited JSON both ways: one [`Request`] per inbound line,
//! one [`Response`] per outbound line, with [`HostEvent`] push lines
//! (terminal output, window actions) interleaved on the same stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use portway_core::error::ErrorPayload;
use portway_core::protocol::{HostEvent, Request, Response, WindowAction};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::paths;

/// Connection cap; the UI opens a handful at most, so this is purely a
/// guard against runaway clients.
const MAX_CONNECTIONS: usize = 32;

/// How long to wait for in-flight connections during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum request line size.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

pub struct HostServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    connection_semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl HostServer {
    /// Bind to the default socket location.
    pub async fn bind(dispatcher: Arc<Dispatcher>) -> Result<Self> {
        Self::bind_to(
            paths::host_socket_path(),
            paths::host_pid_path(),
            dispatcher,
        )
        .await
    }

    /// Bind to a specific socket path.
    ///
    /// Bind-first to avoid a TOCTOU race: try the bind, and only when
    /// the address is in use consult the PID file. A dead previous
    /// instance leaves a stale socket file behind, which is removed
    /// (after checking it really is a non-symlink socket) and the bind
    /// retried.
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket dir for {:?}", socket_path))?;
        }

        // Written immediately after a successful bind so another
        // instance never sees our socket without a valid PID file.
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("writing PID file {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_host_alive(&pid_path) {
                    anyhow::bail!(
                        "host already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }

                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("stat of socket path {:?}", socket_path))?;
                if metadata.file_type().is_symlink() {
                    anyhow::bail!("socket path {:?} is a symlink, refusing to delete", socket_path);
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::FileTypeExt;
                    if !metadata.file_type().is_socket() {
                        anyhow::bail!(
                            "path {:?} exists but is not a socket file",
                            socket_path
                        );
                    }
                }

                info!("removing stale socket from dead host instance");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("removing stale socket {:?}", socket_path))?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("binding socket {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e).with_context(|| format!("binding socket {:?}", socket_path));
            }
        };

        info!("host listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            dispatcher,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Handle for external shutdown triggers (signal handlers).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown is signaled, then drain
    /// in-flight connections with a bounded grace period.
    pub async fn run(&self) -> Result<()> {
        self.spawn_close_watcher();

        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!("connection limit ({}) reached, rejecting", MAX_CONNECTIONS);
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("accepted UI connection");
                            let dispatcher = self.dispatcher.clone();
                            let events = self.dispatcher.subscribe_events();
                            connection_tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, dispatcher, events).await {
                                    error!("connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("shutdown signaled, draining connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "graceful drain timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        self.dispatcher.shutdown().await;
        Ok(())
    }

    /// A forced `closeWindow` must also bring the server down, not just
    /// the managers.
    fn spawn_close_watcher(&self) {
        let mut events = self.dispatcher.subscribe_events();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::Window {
                        action: WindowAction::Close,
                    }) => {
                        // Let the close response flush first.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        shutdown.notify_waiters();
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Drop for HostServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("failed to remove PID file on shutdown");
        }
    }
}

/// Liveness check via PID file: valid PID and `kill(pid, 0)` succeeds.
fn is_host_alive(pid_path: &Path) -> bool {
    let pid: i32 = match std::fs::read_to_string(pid_path) {
        Ok(s) => match s.trim().parse() {
            Ok(p) => p,
            Err(_) => return false,
        },
        Err(_) => return false,
    };

    #[cfg(unix)]
    {
        // SAFETY: signal 0 is the POSIX existence probe; no signal is
        // delivered.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Read one line with a size cap so a misbehaving client cannot balloon
/// memory.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader.fill_buf().await.context("reading from client")?;
        if available.is_empty() {
            if !bytes.is_empty() {
                let line = std::str::from_utf8(&bytes).context("invalid UTF-8 in request")?;
                buf.push_str(line);
            }
            return Ok(total);
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + to_consume > max_size {
            anyhow::bail!("request exceeded {} byte limit", max_size);
        }

        bytes.extend_from_slice(&available[..to_consume]);
        total += to_consume;
        reader.consume(to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Serve one UI connection: requests in, responses and push events out.
///
/// A single writer task serializes output so event lines never tear a
/// response line apart.
async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    mut events: broadcast::Receiver<HostEvent>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let event_out = out_tx.clone();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = match serde_json::to_string(&event) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("unserializable event: {}", e);
                            continue;
                        }
                    };
                    if event_out.send(line).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow UI connection dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("UI disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) => Response::error(
                "unknown",
                ErrorPayload {
                    message: format!("invalid JSON request: {}", e),
                    status: None,
                },
            ),
        };

        let response_json = serde_json::to_string(&response).context("serializing response")?;
        if out_tx.send(response_json).await.is_err() {
            break;
        }
    }

    event_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_lines(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<String>,
) {
    while let Some(line) = out_rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if writer.write_all(b"\n").await.is_err() {
            return;
        }
        let _ = writer.flush().await;
    }
}
