//! Child-process invocation primitives.
//!
//! All argv construction goes through [`CommandLine`], so every value
//! reaching the OS has passed sanitizer validation. Credentials travel
//! in environment variables, never in argv.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use portway_core::error::HostError;
use portway_core::sanitize::CommandLine;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

/// Grace period between a termination signal and a hard kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Captured output of a completed process.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A tracked long-lived child process.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the piped stderr stream, if not already taken.
    pub fn take_stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Check whether the process is still running, without blocking.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<Option<i32>, HostError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| HostError::spawn(e.to_string()))?;
        Ok(status.code())
    }

    /// Send a termination signal and wait for exit, escalating to a hard
    /// kill when the grace period elapses. A hung child cannot stall
    /// teardown indefinitely.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: pid refers to our own child; SIGTERM is async-safe.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        if timeout(grace, self.child.wait()).await.is_err() {
            debug!("child did not exit within {:?}, killing", grace);
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }

    /// Hard-kill without the grace period. Idempotent.
    pub async fn kill_now(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn build_command(program: &Path, cmd: &CommandLine, envs: &[(&str, String)]) -> Command {
    let mut command = Command::new(program);
    command
        .args(cmd.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }
    command
}

/// Spawn a process with piped stdio and hand the caller the raw handle.
pub fn spawn_piped(
    program: &Path,
    cmd: &CommandLine,
    envs: &[(&str, String)],
) -> Result<ChildHandle, HostError> {
    let child = build_command(program, cmd, envs)
        .spawn()
        .map_err(|e| HostError::spawn(format!("{}: {}", program.display(), e)))?;
    debug!(program = %program.display(), args = %cmd, "spawned");
    Ok(ChildHandle { child })
}

/// Spawn a long-lived process and resolve on its first JSON stdout
/// payload.
///
/// Stdout is accumulated and re-parsed after each chunk; on the first
/// successful parse the process keeps running and the remaining streams
/// are drained in the background. Stderr is watched concurrently: a JSON
/// object carrying an `error` field fails the call with
/// [`HostError::ProcessReported`].
pub async fn run_until_json(
    program: &Path,
    cmd: &CommandLine,
    envs: &[(&str, String)],
) -> Result<(ChildHandle, Value), HostError> {
    let mut handle = spawn_piped(program, cmd, envs)?;
    // Both streams were piped in build_command.
    let (stdout, stderr) = match (handle.child.stdout.take(), handle.child.stderr.take()) {
        (Some(out), Some(err)) => (out, err),
        _ => {
            handle.kill_now().await;
            return Err(HostError::spawn("child stdio was not piped"));
        }
    };

    let mut out_rx = watch_stream(stdout);
    let mut err_rx = watch_stream(stderr);

    let mut out_buf = String::new();
    let mut err_buf = String::new();
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            chunk = out_rx.recv(), if out_open => match chunk {
                Some(text) => {
                    out_buf.push_str(&text);
                    if let Ok(value) = serde_json::from_str::<Value>(out_buf.trim()) {
                        // Dropping the receivers flips the reader tasks
                        // into drain mode, so the child never blocks on
                        // a full pipe after we stop watching.
                        return Ok((handle, value));
                    }
                }
                None => out_open = false,
            },
            chunk = err_rx.recv(), if err_open => match chunk {
                Some(text) => {
                    err_buf.push_str(&text);
                    if let Some(err) = parse_reported_error(&err_buf) {
                        handle.kill_now().await;
                        return Err(err);
                    }
                }
                None => err_open = false,
            },
        }
    }

    // Both streams closed without a JSON payload: the process exited
    // before reporting.
    let exit_code = handle.wait().await?;
    let message = if err_buf.trim().is_empty() {
        "process exited before producing output".to_string()
    } else {
        err_buf.trim().to_string()
    };
    Err(HostError::ProcessReported {
        message,
        status: exit_code.map(i64::from),
    })
}

/// Pump a child stream into a channel from a background task.
///
/// When the receiver is dropped the task keeps reading and discards the
/// data, draining the pipe until EOF.
fn watch_stream(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) -> tokio::sync::mpsc::Receiver<String> {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = tx
                        .send(String::from_utf8_lossy(&chunk[..n]).into_owned())
                        .await;
                }
            }
        }
    });
    rx
}

/// Interpret accumulated stderr as a structured error report.
fn parse_reported_error(stderr: &str) -> Option<HostError> {
    let value: Value = serde_json::from_str(stderr.trim()).ok()?;
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_else(|| stderr.trim())
        .to_string();
    let status = error.get("status").and_then(Value::as_i64);
    Some(HostError::ProcessReported { message, status })
}

/// Spawn a process and wait for it to exit, capturing stdout/stderr.
pub async fn run_to_completion(
    program: &Path,
    cmd: &CommandLine,
    envs: &[(&str, String)],
) -> Result<CommandOutput, HostError> {
    let child = build_command(program, cmd, envs)
        .spawn()
        .map_err(|e| HostError::spawn(format!("{}: {}", program.display(), e)))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| HostError::spawn(e.to_string()))?;
    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// As [`run_to_completion`], but kill the process and fail with
/// [`HostError::Timeout`] when it has not exited within the bound.
pub async fn run_with_timeout(
    program: &Path,
    cmd: &CommandLine,
    envs: &[(&str, String)],
    bound: Duration,
) -> Result<CommandOutput, HostError> {
    let child = build_command(program, cmd, envs)
        .spawn()
        .map_err(|e| HostError::spawn(format!("{}: {}", program.display(), e)))?;

    // kill_on_drop reaps the child when the timeout drops the future.
    match timeout(bound, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(HostError::spawn(e.to_string())),
        Err(_) => Err(HostError::timeout(format!(
            "'{}' did not exit within {:?}",
            cmd, bound
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(body: &'static str) -> CommandLine {
        CommandLine::subcommand(&["-c"]).literal(body)
    }

    #[tokio::test]
    async fn test_run_until_json_resolves_while_process_lives() {
        let (mut handle, value) = run_until_json(
            &sh(),
            &script(r#"echo '{"session_id":"s_1","address":"127.0.0.1","port":"54321"}'; sleep 10"#),
            &[],
        )
        .await
        .expect("should resolve on first JSON");

        assert_eq!(value["session_id"], "s_1");
        assert!(handle.is_running(), "process must keep running");
        handle.kill_now().await;
    }

    #[tokio::test]
    async fn test_run_until_json_ignores_benign_stderr() {
        // Non-JSON stderr chatter must not reject the call.
        let (mut handle, value) = run_until_json(
            &sh(),
            &script(
                r#"echo 'connecting...' 1>&2; echo '{"address":"[::1]","port":"9000","session_id":"s_9"}'; sleep 10"#,
            ),
            &[],
        )
        .await
        .expect("should resolve");
        assert_eq!(value["port"], "9000");
        handle.kill_now().await;
    }

    #[tokio::test]
    async fn test_run_until_json_stderr_error_rejects() {
        let err = run_until_json(
            &sh(),
            &script(r#"echo '{"error":{"message":"target not authorized","status":403}}' 1>&2; sleep 10"#),
            &[],
        )
        .await
        .expect_err("stderr error must reject");

        match err {
            HostError::ProcessReported { message, status } => {
                assert_eq!(message, "target not authorized");
                assert_eq!(status, Some(403));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_until_json_exit_without_output() {
        let err = run_until_json(&sh(), &script("exit 3"), &[])
            .await
            .expect_err("silent exit must reject");
        match err {
            HostError::ProcessReported { status, .. } => assert_eq!(status, Some(3)),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_spawn_error() {
        let err = run_until_json(
            &PathBuf::from("/nonexistent/portway-test-binary"),
            &script("true"),
            &[],
        )
        .await
        .expect_err("missing binary must fail");
        assert!(matches!(err, HostError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_run_to_completion_captures_output() {
        let output = run_to_completion(&sh(), &script("echo out; echo err 1>&2"), &[])
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_to_completion_env_passthrough() {
        let output = run_to_completion(
            &sh(),
            &script("printf %s \"$PORTWAY_TEST_TOKEN\""),
            &[("PORTWAY_TEST_TOKEN", "tok_abc".to_string())],
        )
        .await
        .unwrap();
        assert_eq!(output.stdout, "tok_abc");
    }

    #[tokio::test]
    async fn test_run_with_timeout_kills_slow_process() {
        let err = run_with_timeout(&sh(), &script("sleep 10"), &[], Duration::from_millis(100))
            .await
            .expect_err("slow process must time out");
        assert!(matches!(err, HostError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_terminate_escalates_after_grace() {
        // Trap TERM so only the escalation kill can end the process.
        let mut handle = spawn_piped(&sh(), &script("trap '' TERM; sleep 30"), &[]).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.terminate(Duration::from_millis(200)).await;
        assert!(!handle.is_running());
    }
}
