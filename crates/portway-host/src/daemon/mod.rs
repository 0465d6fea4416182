//! Daemon managers for the local background services.
//!
//! Two instances exist: one for the cache daemon, one for the
//! client-agent daemon. Both follow the same pattern: start/stop/status
//! via CLI subcommands, queries over the daemon's Unix domain socket.
//! The socket path is discovered by `status()` and cached until the next
//! manual refresh.

pub mod socket;

use std::path::PathBuf;
use std::time::Duration;

use portway_core::error::HostError;
use portway_core::protocol::DaemonStatusPayload;
use portway_core::sanitize::{validate_query, validate_token, CommandLine};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::sessions::{SESSION_TOKEN_ENV, TOKEN_ENV_REF};
use crate::spawn::{self, ChildHandle, CommandOutput, TERMINATE_GRACE};
use self::socket::SocketClient;

/// Bound for status/pause/resume so dispatcher-facing calls cannot hang
/// on an unresponsive daemon.
const SUBCOMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `start` waits for the launcher process to detach before
/// concluding that the spawned process itself is the daemon.
const START_DETACH_WAIT: Duration = Duration::from_secs(2);

/// Marker the CLI prints on stderr when the daemon was already up.
const ALREADY_RUNNING_MARKER: &str = "already running";

/// Which local background service a manager instance controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    Cache,
    ClientAgent,
}

impl DaemonKind {
    fn word(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::ClientAgent => "client-agent",
        }
    }
}

#[derive(Default)]
struct DaemonState {
    socket_path: Option<PathBuf>,
    /// Whether this manager instance started the daemon and is therefore
    /// responsible for stopping it.
    owns_lifecycle: bool,
    /// Launcher process that stayed alive, i.e. the daemon itself.
    child: Option<ChildHandle>,
}

/// Start/stop/status/query for one local background daemon.
pub struct DaemonManager {
    kind: DaemonKind,
    cli: PathBuf,
    bound: Duration,
    state: Mutex<DaemonState>,
}

impl DaemonManager {
    pub fn new(kind: DaemonKind, cli: PathBuf) -> Self {
        Self {
            kind,
            cli,
            bound: SUBCOMMAND_TIMEOUT,
            state: Mutex::new(DaemonState::default()),
        }
    }

    #[cfg(test)]
    fn with_bound(kind: DaemonKind, cli: PathBuf, bound: Duration) -> Self {
        Self {
            kind,
            cli,
            bound,
            state: Mutex::new(DaemonState::default()),
        }
    }

    fn argv(&self, op: &'static str) -> CommandLine {
        CommandLine::subcommand(&[self.kind.word(), op])
    }

    /// Query daemon status and (re)discover its socket path.
    pub async fn status(&self) -> Result<DaemonStatusPayload, HostError> {
        let cmd = self.argv("status").literal("-format=json");
        let output = spawn::run_with_timeout(&self.cli, &cmd, &[], self.bound).await?;
        if !output.success() {
            return Err(protocol_error(&output));
        }

        let payload: DaemonStatusPayload =
            serde_json::from_str(output.stdout.trim()).map_err(|e| HostError::Protocol {
                status: 0,
                message: format!("unparsable status payload: {}", e),
            })?;

        if let Some(path) = &payload.socket_path {
            self.state.lock().await.socket_path = Some(PathBuf::from(path));
        }
        Ok(payload)
    }

    /// Start the daemon.
    ///
    /// Idempotent from the caller's perspective: the daemon deduplicates
    /// through its own lock, so two starts still yield one live socket.
    /// Ownership is taken only when the daemon was not already running,
    /// which is what authorizes a later `stop()`.
    pub async fn start(&self) -> Result<DaemonStatusPayload, HostError> {
        let cmd = self.argv("start");
        let mut handle = spawn::spawn_piped(&self.cli, &cmd, &[])?;

        let stderr = handle.take_stderr();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_string(&mut buf).await;
            }
            buf
        });

        match timeout(START_DETACH_WAIT, handle.wait()).await {
            Ok(_) => {
                let stderr = stderr_task.await.unwrap_or_default();
                if stderr.contains(ALREADY_RUNNING_MARKER) {
                    debug!(daemon = self.kind.word(), "daemon was already running");
                } else {
                    info!(daemon = self.kind.word(), "daemon started, taking lifecycle ownership");
                    self.state.lock().await.owns_lifecycle = true;
                }
            }
            Err(_) => {
                // The launcher did not detach: the spawned process is the
                // daemon. Track it so stop() can force-terminate.
                info!(daemon = self.kind.word(), "daemon running as tracked child");
                let mut state = self.state.lock().await;
                state.owns_lifecycle = true;
                state.child = Some(handle);
            }
        }

        // Always re-discover the socket path afterwards.
        self.status().await
    }

    /// Stop the daemon, but only if this instance owns its lifecycle.
    ///
    /// A tracked child process is force-terminated as well, whether or
    /// not the `stop` subcommand succeeded.
    pub async fn stop(&self) -> Result<(), HostError> {
        let (owns, child) = {
            let mut state = self.state.lock().await;
            (state.owns_lifecycle, state.child.take())
        };

        let result = if owns {
            let cmd = self.argv("stop");
            match spawn::run_with_timeout(&self.cli, &cmd, &[], self.bound).await {
                Ok(output) if !output.success() => Err(protocol_error(&output)),
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            debug!(daemon = self.kind.word(), "not lifecycle owner, skipping stop");
            Ok(())
        };

        if let Some(mut child) = child {
            child.terminate(TERMINATE_GRACE).await;
        }

        if owns {
            self.state.lock().await.owns_lifecycle = false;
        }
        result
    }

    /// Propagate a freshly acquired credential to the daemon.
    ///
    /// The cache daemon learns tokens indirectly: one authenticated read
    /// subcommand makes the CLI register the token as a side effect. The
    /// client-agent takes a direct POST over its socket.
    pub async fn add_token(&self, token: &str, token_id: &str) -> Result<(), HostError> {
        let token = validate_token(token)?;
        let token_id = validate_token(token_id)?;

        match self.kind {
            DaemonKind::Cache => {
                let cmd = CommandLine::subcommand(&["auth-tokens", "read"])
                    .flag_token("id", &token_id)
                    .flag_literal("token", TOKEN_ENV_REF)
                    .literal("-format=json");
                let envs = [(SESSION_TOKEN_ENV, token.as_str().to_string())];
                let output = spawn::run_with_timeout(&self.cli, &cmd, &envs, self.bound).await?;
                if !output.success() {
                    return Err(protocol_error(&output));
                }
                Ok(())
            }
            DaemonKind::ClientAgent => {
                let client = self.socket_client().await?;
                let body = serde_json::json!({
                    "auth_token_id": token_id.as_str(),
                    "auth_token": token.as_str(),
                });
                client.post("/v1/tokens", &body).await?;
                Ok(())
            }
        }
    }

    /// Search the daemon with the query encoded as URL parameters.
    #[cfg(unix)]
    pub async fn search(&self, query: &str) -> Result<Value, HostError> {
        let query = validate_query(query)?;
        let client = self.socket_client().await?;
        client
            .get(&format!("/v1/search?q={}", urlencoding::encode(query.as_str())))
            .await
    }

    /// Fallback for platforms without domain-socket support: the
    /// synchronous `search` subcommand, parsed equivalently.
    #[cfg(not(unix))]
    pub async fn search(&self, query: &str) -> Result<Value, HostError> {
        let query = validate_query(query)?;
        let cmd = CommandLine::subcommand(&["search"])
            .flag_query("query", &query)
            .literal("-format=json");
        let output = spawn::run_to_completion(&self.cli, &cmd, &[]).await?;
        if !output.success() {
            return Err(protocol_error(&output));
        }
        serde_json::from_str(output.stdout.trim()).map_err(|e| HostError::Protocol {
            status: 0,
            message: format!("unparsable search output: {}", e),
        })
    }

    /// Pause the daemon. Bounded like `status()`.
    pub async fn pause(&self) -> Result<Value, HostError> {
        self.bounded_subcommand("pause").await
    }

    /// Resume the daemon. Bounded like `status()`.
    pub async fn resume(&self) -> Result<Value, HostError> {
        self.bounded_subcommand("resume").await
    }

    /// List the daemon's sessions.
    pub async fn sessions(&self) -> Result<Value, HostError> {
        self.bounded_subcommand("sessions").await
    }

    async fn bounded_subcommand(&self, op: &'static str) -> Result<Value, HostError> {
        let cmd = self.argv(op).literal("-format=json");
        let output = spawn::run_with_timeout(&self.cli, &cmd, &[], self.bound).await?;
        if !output.success() {
            return Err(protocol_error(&output));
        }
        let trimmed = output.stdout.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(trimmed).map_err(|e| HostError::Protocol {
            status: 0,
            message: format!("unparsable {} output: {}", op, e),
        })
    }

    /// Socket client for the cached socket path, discovering it through
    /// `status()` when not yet known.
    async fn socket_client(&self) -> Result<SocketClient, HostError> {
        if let Some(path) = self.state.lock().await.socket_path.clone() {
            return Ok(SocketClient::new(path));
        }
        self.status().await?;
        let path = self
            .state
            .lock()
            .await
            .socket_path
            .clone()
            .ok_or_else(|| HostError::Protocol {
                status: 0,
                message: format!("{} daemon reported no socket path", self.kind.word()),
            })?;
        Ok(SocketClient::new(path))
    }

    /// The currently cached socket path, if discovered.
    pub async fn socket_path(&self) -> Option<PathBuf> {
        self.state.lock().await.socket_path.clone()
    }
}

/// Build a `ProtocolError` from a failed subcommand, preferring the
/// structured error body on stderr.
fn protocol_error(output: &CommandOutput) -> HostError {
    let status = output.exit_code.unwrap_or(-1).max(0) as u16;
    let body = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };

    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "daemon command failed".to_string()
            } else {
                body.to_string()
            }
        });

    HostError::Protocol { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    /// Fake CLI that logs its argv to `args.log` and dispatches canned
    /// behavior per subcommand.
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("portctl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "echo \"$@\" >> {}/args.log", dir.display()).unwrap();
        writeln!(file, "{}", body).unwrap();
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn logged_args(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("args.log")).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_status_records_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"[ "$1 $2" = "cache status" ] && echo '{"socket_path":"/run/user/1/cache.sock","uptime":5}'"#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli);

        let payload = manager.status().await.unwrap();
        assert_eq!(payload.socket_path.as_deref(), Some("/run/user/1/cache.sock"));
        assert_eq!(
            manager.socket_path().await,
            Some(PathBuf::from("/run/user/1/cache.sock"))
        );
        assert!(logged_args(dir.path()).contains("cache status -format=json"));
    }

    #[tokio::test]
    async fn test_status_failure_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"echo '{"error":{"message":"daemon unreachable"}}' 1>&2; exit 1"#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli);

        let err = manager.status().await.unwrap_err();
        match err {
            HostError::Protocol { status, message } => {
                assert_eq!(status, 1);
                assert_eq!(message, "daemon unreachable");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_timeout_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let manager =
            DaemonManager::with_bound(DaemonKind::Cache, cli, Duration::from_millis(200));

        let err = manager.status().await.unwrap_err();
        assert!(matches!(err, HostError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_start_takes_ownership_and_stop_issues_stop() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"[ "$1 $2" = "cache status" ] && echo '{"socket_path":"/tmp/c.sock"}'; exit 0"#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli);

        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        let log = logged_args(dir.path());
        assert!(log.contains("cache start"));
        assert!(log.contains("cache stop"));
    }

    #[tokio::test]
    async fn test_start_on_running_daemon_does_not_take_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"
case "$1 $2" in
  "cache start") echo 'cache daemon already running' 1>&2 ;;
  "cache status") echo '{"socket_path":"/tmp/c.sock"}' ;;
esac"#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli);

        manager.start().await.unwrap();
        manager.stop().await.unwrap();

        let log = logged_args(dir.path());
        assert!(log.contains("cache start"));
        assert!(
            !log.contains("cache stop"),
            "must never stop a daemon it did not start"
        );
    }

    #[tokio::test]
    async fn test_double_start_records_one_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"
case "$1 $2" in
  "cache start") [ -f "$0.started" ] && echo 'cache daemon already running' 1>&2 || touch "$0.started" ;;
  "cache status") echo '{"socket_path":"/tmp/one.sock"}' ;;
esac"#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli);

        manager.start().await.unwrap();
        manager.start().await.unwrap();

        assert_eq!(manager.socket_path().await, Some(PathBuf::from("/tmp/one.sock")));
    }

    #[tokio::test]
    async fn test_add_token_cache_runs_authenticated_read() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"printf %s "$PORTWAY_SESSION_TOKEN" > "$0.token""#,
        );
        let manager = DaemonManager::new(DaemonKind::Cache, cli.clone());

        manager.add_token("tok_abc", "at_1").await.unwrap();

        let log = logged_args(dir.path());
        assert!(log.contains("auth-tokens read -id=at_1 -token=env://PORTWAY_SESSION_TOKEN"));
        // The credential reached the child through the environment only.
        assert_eq!(
            std::fs::read_to_string(format!("{}.token", cli.display())).unwrap(),
            "tok_abc"
        );
        assert!(!log.contains("tok_abc"));
    }

    #[tokio::test]
    async fn test_add_token_rejects_malformed_token() {
        let manager =
            DaemonManager::new(DaemonKind::Cache, PathBuf::from("/nonexistent/portctl"));
        let err = manager.add_token("tok abc", "at_1").await.unwrap_err();
        assert!(matches!(err, HostError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_search_goes_over_the_socket() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\n\r\n{\"results\":[]}")
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let cli = fake_cli(
            dir.path(),
            &format!(
                r#"[ "$1 $2" = "client-agent status" ] && echo '{{"socket_path":"{}"}}'"#,
                sock.display()
            ),
        );
        let manager = DaemonManager::new(DaemonKind::ClientAgent, cli);

        let value = manager.search("db server 1").await.unwrap();
        assert_eq!(value["results"], serde_json::json!([]));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v1/search?q=db%20server%201 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_search_rejects_control_characters() {
        let manager =
            DaemonManager::new(DaemonKind::ClientAgent, PathBuf::from("/nonexistent/portctl"));
        let err = manager.search("bad\nquery").await.unwrap_err();
        assert!(matches!(err, HostError::Validation(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "sleep 30");
        let manager =
            DaemonManager::with_bound(DaemonKind::ClientAgent, cli, Duration::from_millis(200));

        assert!(matches!(
            manager.pause().await.unwrap_err(),
            HostError::Timeout(_)
        ));
        assert!(matches!(
            manager.resume().await.unwrap_err(),
            HostError::Timeout(_)
        ));
    }
}
