//! Terminal multiplexing over a single worker process.
//!
//! Shells do not run inside the host process. The host re-invokes its
//! own binary as `portway terminal-worker` and multiplexes every
//! terminal through that one child over newline-delimited JSON on
//! stdin/stdout. If the worker dies, all terminal bookkeeping is
//! cleared and the next create respawns it transparently.

pub mod pty;
pub mod worker;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use portway_core::error::HostError;
use portway_core::keys::encode_key;
use portway_core::protocol::{TerminalInput, WorkerEvent, WorkerRequest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long stop_all waits for the worker to wind down after stdin
/// closes before killing it.
const WORKER_STOP_WAIT: Duration = Duration::from_secs(2);

/// Per-terminal output channel. Dropping the sender tells the consumer
/// the terminal is gone.
pub type TerminalSink = mpsc::Sender<Vec<u8>>;

struct WorkerLink {
    child: Child,
    stdin: ChildStdin,
    generation: u64,
}

struct Inner {
    worker_cmd: (PathBuf, Vec<String>),
    worker: Mutex<Option<WorkerLink>>,
    terminals: RwLock<HashMap<String, TerminalSink>>,
    active: std::sync::Mutex<Option<String>>,
    generation: std::sync::atomic::AtomicU64,
}

/// Owns the worker process and routes terminal traffic to per-terminal
/// sinks.
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

impl TerminalManager {
    pub fn new() -> Result<Self, HostError> {
        let exe = std::env::current_exe()
            .map_err(|e| HostError::spawn(format!("cannot locate own binary: {}", e)))?;
        Ok(Self::with_worker_command(exe, vec!["terminal-worker".to_string()]))
    }

    /// Build a manager that launches an arbitrary worker command.
    pub fn with_worker_command(program: PathBuf, args: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker_cmd: (program, args),
                worker: Mutex::new(None),
                terminals: RwLock::new(HashMap::new()),
                active: std::sync::Mutex::new(None),
                generation: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    /// Create a terminal running the platform default shell. Output
    /// chunks land in `sink`; the sink closing signals terminal exit.
    pub async fn create_terminal(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        sink: TerminalSink,
    ) -> Result<(), HostError> {
        if id.is_empty() {
            return Err(HostError::validation("terminal id must not be empty"));
        }

        // Check-and-insert under one lock acquisition, so two racing
        // creates of the same id cannot both pass the duplicate check.
        {
            let mut terminals = self.inner.terminals.write().await;
            match terminals.entry(id.to_string()) {
                Entry::Occupied(_) => {
                    return Err(HostError::validation(format!(
                        "terminal '{}' already exists",
                        id
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(sink);
                }
            }
        }

        if let Err(e) = self.ensure_worker().await {
            self.inner.terminals.write().await.remove(id);
            return Err(e);
        }

        let request = WorkerRequest::Create {
            id: id.to_string(),
            cols,
            rows,
            shell: default_shell(),
        };
        if let Err(e) = self.send(request).await {
            self.inner.terminals.write().await.remove(id);
            return Err(e);
        }

        *self.inner.active.lock().unwrap_or_else(|p| p.into_inner()) = Some(id.to_string());
        Ok(())
    }

    /// Forward input to a terminal. Raw text goes through verbatim; key
    /// events are translated to control sequences, and unmapped keys
    /// are dropped without error.
    pub async fn write_to_terminal(
        &self,
        id: &str,
        input: &TerminalInput,
    ) -> Result<(), HostError> {
        if !self.inner.terminals.read().await.contains_key(id) {
            return Err(HostError::not_found(format!("terminal '{}'", id)));
        }

        let data = match input {
            TerminalInput::Raw { data } => data.clone().into_bytes(),
            TerminalInput::Key(event) => match encode_key(event) {
                Some(bytes) => bytes,
                None => return Ok(()),
            },
        };

        self.send(WorkerRequest::Write {
            id: id.to_string(),
            data,
        })
        .await
    }

    pub async fn resize_terminal(&self, id: &str, cols: u16, rows: u16) -> Result<(), HostError> {
        if !self.inner.terminals.read().await.contains_key(id) {
            return Err(HostError::not_found(format!("terminal '{}'", id)));
        }
        self.send(WorkerRequest::Resize {
            id: id.to_string(),
            cols,
            rows,
        })
        .await
    }

    /// Tear a terminal down. Unknown ids are a no-op so repeated
    /// removal from a racing UI is harmless.
    pub async fn remove_terminal(&self, id: &str) -> Result<(), HostError> {
        let existed = self.inner.terminals.write().await.remove(id).is_some();
        self.clear_active_if(id);
        if !existed {
            return Ok(());
        }
        self.send(WorkerRequest::Remove { id: id.to_string() })
            .await
    }

    /// Terminal that most recently gained focus via create.
    pub fn active_terminal(&self) -> Option<String> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Drop every terminal and stop the worker process.
    pub async fn stop_all(&self) {
        self.inner.terminals.write().await.clear();
        *self.inner.active.lock().unwrap_or_else(|p| p.into_inner()) = None;

        let link = self.inner.worker.lock().await.take();
        if let Some(mut link) = link {
            // Closing stdin lets the worker shut its shells down; kill
            // only if it lingers.
            drop(link.stdin);
            if timeout(WORKER_STOP_WAIT, link.child.wait()).await.is_err() {
                warn!("terminal worker did not exit, killing");
                let _ = link.child.start_kill();
            }
        }
    }

    async fn ensure_worker(&self) -> Result<(), HostError> {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return Ok(());
        }

        let (program, args) = &self.inner.worker_cmd;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::spawn(format!("terminal worker: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::spawn("terminal worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::spawn("terminal worker stdout unavailable"))?;

        let generation = self
            .inner
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;

        debug!(pid = child.id(), "terminal worker started");
        *worker = Some(WorkerLink {
            child,
            stdin,
            generation,
        });
        drop(worker);

        tokio::spawn(read_events(self.inner.clone(), stdout, generation));
        Ok(())
    }

    async fn send(&self, request: WorkerRequest) -> Result<(), HostError> {
        let mut worker = self.inner.worker.lock().await;
        let link = worker
            .as_mut()
            .ok_or_else(|| HostError::spawn("terminal worker is not running"))?;

        let mut line = serde_json::to_vec(&request)
            .map_err(|e| HostError::validation(format!("unserializable worker request: {}", e)))?;
        line.push(b'\n');

        if let Err(e) = link.stdin.write_all(&line).await {
            // Broken pipe means the worker is gone; the reader task
            // clears the rest of the state.
            *worker = None;
            return Err(HostError::spawn(format!("terminal worker write: {}", e)));
        }
        Ok(())
    }

    fn clear_active_if(&self, id: &str) {
        let mut active = self.inner.active.lock().unwrap_or_else(|p| p.into_inner());
        if active.as_deref() == Some(id) {
            *active = None;
        }
    }
}

/// Route worker stdout events until the worker exits, then clear all
/// terminal state so the next create respawns.
async fn read_events(inner: Arc<Inner>, stdout: tokio::process::ChildStdout, generation: u64) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("terminal worker stdout: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: WorkerEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed worker event: {}", e);
                continue;
            }
        };

        match event {
            WorkerEvent::Data { id, payload } => {
                let sink = inner.terminals.read().await.get(&id).cloned();
                if let Some(sink) = sink {
                    // A full or closed sink means the consumer stopped
                    // listening; output for it is dropped.
                    let _ = sink.try_send(payload);
                }
            }
            WorkerEvent::Exit { id } => {
                inner.terminals.write().await.remove(&id);
                let mut active = inner.active.lock().unwrap_or_else(|p| p.into_inner());
                if active.as_deref() == Some(id.as_str()) {
                    *active = None;
                }
            }
            WorkerEvent::Error { id, error } => {
                warn!(id, "terminal worker reported: {}", error);
                inner.terminals.write().await.remove(&id);
            }
        }
    }

    debug!("terminal worker stream closed");
    inner.terminals.write().await.clear();
    *inner.active.lock().unwrap_or_else(|p| p.into_inner()) = None;

    // Only forget the worker if a newer one has not replaced it.
    let mut worker = inner.worker.lock().await;
    if worker.as_ref().map(|w| w.generation) == Some(generation) {
        *worker = None;
    }
}

/// Platform default shell for new terminals.
fn default_shell() -> String {
    if cfg!(windows) {
        return "cmd.exe".to_string();
    }
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "/bin/sh".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;

    use portway_core::keys::KeyEvent;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the worker.
    fn fake_worker(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn manager_with(script: PathBuf) -> TerminalManager {
        TerminalManager::with_worker_command(script, Vec::new())
    }

    /// Worker that logs every request line and answers creates with one
    /// data chunk.
    fn echoing_worker(dir: &TempDir) -> (TerminalManager, PathBuf) {
        let log = dir.path().join("requests.log");
        let body = format!(
            r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> {log}
  case "$line" in
    *'"action":"create"'*) printf '{{"type":"data","id":"t1","payload":[104,105]}}\n' ;;
  esac
done"#,
            log = log.display()
        );
        (manager_with(fake_worker(dir, &body)), log)
    }

    async fn wait_for_log(log: &PathBuf, needle: &str) -> String {
        for _ in 0..50 {
            if let Ok(content) = std::fs::read_to_string(log) {
                if content.contains(needle) {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        std::fs::read_to_string(log).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_routes_output_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _log) = echoing_worker(&dir);

        let (tx, mut rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("sink closed");
        assert_eq!(chunk, b"hi");
        assert_eq!(manager.active_terminal().as_deref(), Some("t1"));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _log) = echoing_worker(&dir);

        let (tx, _rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        let (tx2, _rx2) = mpsc::channel(16);
        let err = manager.create_terminal("t1", 80, 24, tx2).await.unwrap_err();
        assert!(matches!(err, HostError::Validation(_)));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_write_unknown_terminal_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _log) = echoing_worker(&dir);

        let input = TerminalInput::Raw {
            data: "ls\n".to_string(),
        };
        let err = manager.write_to_terminal("ghost", &input).await.unwrap_err();
        assert!(matches!(err, HostError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_key_event_translated_before_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, log) = echoing_worker(&dir);

        let (tx, _rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        let input = TerminalInput::Key(KeyEvent {
            key: "Enter".to_string(),
            ctrl: false,
        });
        manager.write_to_terminal("t1", &input).await.unwrap();

        // Enter encodes as carriage return (13).
        let content = wait_for_log(&log, "\"action\":\"write\"").await;
        assert!(content.contains("\"data\":[13]"), "log was: {}", content);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_unmapped_key_silently_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, log) = echoing_worker(&dir);

        let (tx, _rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        let input = TerminalInput::Key(KeyEvent {
            key: "F13".to_string(),
            ctrl: false,
        });
        manager.write_to_terminal("t1", &input).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let content = std::fs::read_to_string(&log).unwrap_or_default();
        assert!(!content.contains("\"action\":\"write\""), "log was: {}", content);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_remove_clears_active_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, log) = echoing_worker(&dir);

        let (tx, _rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();
        assert_eq!(manager.active_terminal().as_deref(), Some("t1"));

        manager.remove_terminal("t1").await.unwrap();
        assert_eq!(manager.active_terminal(), None);
        wait_for_log(&log, "\"action\":\"remove\"").await;

        // Second removal is a quiet no-op.
        manager.remove_terminal("t1").await.unwrap();

        manager.stop_all().await;
    }

    /// Worker that answers every create with the given event line.
    fn replying_worker(dir: &TempDir, reply: &str) -> TerminalManager {
        let body = format!(
            r#"while IFS= read -r line; do
  case "$line" in
    *'"action":"create"'*) printf '{}\n' ;;
  esac
done"#,
            reply
        );
        manager_with(fake_worker(dir, &body))
    }

    #[tokio::test]
    async fn test_exit_event_frees_id_for_recreation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = replying_worker(&dir, r#"{"type":"exit","id":"t1"}"#);

        let (tx, mut rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        // The exit event drops the bookkeeping, which closes the sink.
        let gone = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(gone.expect("timed out"), None);
        assert!(matches!(
            manager
                .write_to_terminal(
                    "t1",
                    &TerminalInput::Raw {
                        data: "ls\n".to_string()
                    }
                )
                .await,
            Err(HostError::NotFound(_))
        ));

        // The id is immediately reusable, same worker.
        let (tx2, _rx2) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx2).await.unwrap();

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_error_event_forces_removal() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            replying_worker(&dir, r#"{"type":"error","id":"t1","error":"shell failed"}"#);

        let (tx, mut rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        let gone = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(gone.expect("timed out"), None);

        let (tx2, _rx2) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx2).await.unwrap();

        manager.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_racing_creates_accept_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _log) = echoing_worker(&dir);

        let (tx_a, _rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let (a, b) = tokio::join!(
            manager.create_terminal("t1", 80, 24, tx_a),
            manager.create_terminal("t1", 80, 24, tx_b),
        );

        assert_eq!(
            a.is_ok() as u8 + b.is_ok() as u8,
            1,
            "exactly one create may win: {:?} / {:?}",
            a,
            b
        );
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(HostError::Validation(_))));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn test_worker_death_clears_state_and_respawns() {
        let dir = tempfile::tempdir().unwrap();
        // Worker that dies after the first request.
        let script = fake_worker(&dir, "IFS= read -r line\nexit 0");
        let manager = manager_with(script);

        let (tx, mut rx) = mpsc::channel(16);
        manager.create_terminal("t1", 80, 24, tx).await.unwrap();

        // Worker exit closes the sink once bookkeeping is cleared.
        let gone = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(gone.expect("timed out"), None);

        // Next create respawns the worker transparently.
        for _ in 0..50 {
            let (tx2, _rx2) = mpsc::channel(16);
            if manager.create_terminal("t2", 80, 24, tx2).await.is_ok() {
                manager.stop_all().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("worker never respawned");
    }
}
