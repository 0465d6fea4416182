//! Session manager for user-initiated proxy sessions.
//!
//! Each session is backed by one long-lived `connect` child process. The
//! session identity is assigned only once the process reports it in its
//! first JSON payload. Stopped sessions stay visible in a bounded
//! recent-history window instead of growing without limit.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portway_core::error::HostError;
use portway_core::protocol::{ProxyDetails, SessionSummary};
use portway_core::sanitize::{validate_origin, validate_token, CommandLine, Origin, Token};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::spawn::{self, ChildHandle, TERMINATE_GRACE};

/// Environment variable carrying the session credential. The argv only
/// ever contains a reference to it, so the token never shows up in
/// process listings.
pub const SESSION_TOKEN_ENV: &str = "PORTWAY_SESSION_TOKEN";

/// Argv spelling of the environment-variable reference.
pub const TOKEN_ENV_REF: &str = "env://PORTWAY_SESSION_TOKEN";

/// How many stopped sessions to retain for history before eviction.
const MAX_STOPPED_SESSIONS: usize = 64;

/// How often the cleaner checks for sessions whose process exited.
const CLEANUP_INTERVAL: Duration = Duration::from_millis(500);

/// A tracked proxy session.
struct Session {
    details: ProxyDetails,
    target_id: String,
    host_id: Option<String>,
    created_at: DateTime<Utc>,
    running: bool,
    /// Taken out while a stop is in flight.
    handle: Option<ChildHandle>,
}

impl Session {
    /// A session is active iff its process has not been terminated. With
    /// the handle checked out by an in-flight stop, the session counts
    /// as active until that stop resolves and flips `running`.
    fn is_active(&mut self) -> bool {
        self.running
            && match self.handle.as_mut() {
                Some(handle) => handle.is_running(),
                None => true,
            }
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Session>,
    stopped_order: VecDeque<String>,
}

impl Registry {
    /// Record a session as stopped and evict the oldest stopped entries
    /// beyond the history window. Active sessions are never evicted.
    fn note_stopped(&mut self, id: &str) {
        self.stopped_order.push_back(id.to_string());
        while self.stopped_order.len() > MAX_STOPPED_SESSIONS {
            if let Some(oldest) = self.stopped_order.pop_front() {
                if self
                    .sessions
                    .get(&oldest)
                    .is_some_and(|s| !s.running)
                {
                    self.sessions.remove(&oldest);
                }
            }
        }
    }
}

/// Tracks user-initiated proxy sessions, each backed by one spawned
/// process.
pub struct SessionManager {
    cli: PathBuf,
    registry: Mutex<Registry>,
}

impl SessionManager {
    pub fn new(cli: PathBuf) -> Self {
        Self {
            cli,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Start a proxy session to a target.
    ///
    /// All inputs pass the sanitizer before any process exists. The
    /// credential travels by environment-variable reference. Resolves
    /// with the proxy endpoint once the child reports it; the child
    /// keeps running for the life of the session.
    pub async fn start(
        &self,
        origin: &str,
        target_id: &str,
        token: &str,
        host_id: Option<&str>,
    ) -> Result<ProxyDetails, HostError> {
        let origin = validate_origin(origin)?;
        let target = validate_token(target_id)?;
        let token = validate_token(token)?;
        let host = host_id.map(validate_token).transpose()?;

        let cmd = build_connect_args(&origin, &target, host.as_ref());
        let envs = [(SESSION_TOKEN_ENV, token.as_str().to_string())];

        let (handle, value) = spawn::run_until_json(&self.cli, &cmd, &envs).await?;

        let details: ProxyDetails = serde_json::from_value(value).map_err(|e| {
            HostError::ProcessReported {
                message: format!("connect reported malformed proxy details: {}", e),
                status: None,
            }
        })?;

        info!(session_id = %details.session_id, target = %target, "session started");

        let session = Session {
            details: details.clone(),
            target_id: target.as_str().to_string(),
            host_id: host.map(|h| h.as_str().to_string()),
            created_at: Utc::now(),
            running: true,
            handle: Some(handle),
        };
        self.registry
            .lock()
            .await
            .sessions
            .insert(details.session_id.clone(), session);

        Ok(details)
    }

    /// Stop a session by id.
    ///
    /// Unknown or already-inactive ids resolve immediately as a no-op.
    /// Otherwise the child gets a termination signal and the call
    /// resolves once its exit is observed (bounded by the kill
    /// escalation grace period).
    pub async fn stop_by_id(&self, id: &str) -> Result<(), HostError> {
        let handle = {
            let mut registry = self.registry.lock().await;
            match registry.sessions.get_mut(id) {
                None => return Ok(()),
                Some(session) if !session.running => return Ok(()),
                Some(session) => session.handle.take(),
            }
        };

        if let Some(mut handle) = handle {
            handle.terminate(TERMINATE_GRACE).await;
        }

        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.sessions.get_mut(id) {
            session.running = false;
        }
        registry.note_stopped(id);
        debug!(session_id = id, "session stopped");
        Ok(())
    }

    /// True iff any tracked session is active. Gates application
    /// shutdown.
    pub async fn has_running_sessions(&self) -> bool {
        let mut registry = self.registry.lock().await;
        registry.sessions.values_mut().any(Session::is_active)
    }

    /// Summaries of all tracked sessions, stopped history included.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .values()
            .map(|s| SessionSummary {
                session_id: s.details.session_id.clone(),
                target_id: s.target_id.clone(),
                host_id: s.host_id.clone(),
                address: s.details.address.clone(),
                port: s.details.port.clone(),
                running: s.running,
                created_at: s.created_at.to_rfc3339(),
            })
            .collect()
    }

    /// Stop every active session. Used during host teardown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .iter()
                .filter(|(_, s)| s.running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            let _ = self.stop_by_id(&id).await;
        }
    }

    /// Spawn a background task that flips sessions whose process exited
    /// on its own to inactive. Runs until the manager is dropped.
    pub fn spawn_cleaner(self: &Arc<Self>) {
        let weak_self = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;

                let Some(manager) = weak_self.upgrade() else {
                    debug!("SessionManager dropped, cleaner exiting");
                    break;
                };

                let mut registry = manager.registry.lock().await;
                let dead: Vec<String> = registry
                    .sessions
                    .iter_mut()
                    .filter_map(|(id, session)| {
                        let exited = session.running
                            && session
                                .handle
                                .as_mut()
                                .is_some_and(|h| !h.is_running());
                        exited.then(|| id.clone())
                    })
                    .collect();

                for id in dead {
                    if let Some(session) = registry.sessions.get_mut(&id) {
                        session.running = false;
                        info!(session_id = %id, "session process exited");
                    }
                    registry.note_stopped(&id);
                }
            }
        });
    }
}

/// Build the `connect` argv. The credential is referenced by environment
/// variable, never inlined.
fn build_connect_args(origin: &Origin, target: &Token, host: Option<&Token>) -> CommandLine {
    let mut cmd = CommandLine::subcommand(&["connect"])
        .flag_token("target-id", target)
        .flag_literal("token", TOKEN_ENV_REF)
        .flag_origin("addr", origin);
    if let Some(host) = host {
        cmd = cmd.flag_token("host-id", host);
    }
    cmd.literal("-format=json")
}
