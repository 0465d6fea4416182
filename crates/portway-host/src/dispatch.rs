//! The command dispatcher: the single boundary the UI process talks to.
//!
//! Every operation funnels through [`Dispatcher::dispatch`], which maps
//! a [`HostCommand`] to the owning manager and normalizes any failure
//! into the one [`ErrorPayload`] shape. The transport layer never
//! observes a raw error, and the UI only ever branches on one error
//! format regardless of which manager failed.

use std::sync::Arc;

use portway_core::error::{ErrorPayload, HostError};
use portway_core::protocol::{HostCommand, HostEvent, Request, Response, WindowAction};
use portway_core::sanitize::{validate_external_url, validate_origin};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::daemon::DaemonManager;
use crate::external::open_with_os;
use crate::rdp::RdpManager;
use crate::sessions::SessionManager;
use crate::settings::SettingsStore;
use crate::terminal::TerminalManager;
use crate::paths;

/// Origin used until the user points the client elsewhere.
pub const DEFAULT_ORIGIN: &str = "https://app.portway.io";

/// Buffered output chunks per terminal bridge.
const TERMINAL_SINK_DEPTH: usize = 256;

pub struct Dispatcher {
    settings: Arc<SettingsStore>,
    sessions: Arc<SessionManager>,
    cache: Arc<DaemonManager>,
    agent: Arc<DaemonManager>,
    terminals: TerminalManager,
    rdp: Arc<RdpManager>,
    events: broadcast::Sender<HostEvent>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<SettingsStore>,
        sessions: Arc<SessionManager>,
        cache: Arc<DaemonManager>,
        agent: Arc<DaemonManager>,
        terminals: TerminalManager,
        rdp: Arc<RdpManager>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            settings,
            sessions,
            cache,
            agent,
            terminals,
            rdp,
            events,
        }
    }

    /// Subscribe to push events (terminal output, window actions).
    pub fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Handle one request, always producing a response with the same id.
    pub async fn dispatch(&self, request: Request) -> Response {
        let name = request.command.name();
        match self.handle(request.command).await {
            Ok(data) => {
                debug!(command = name, "dispatched");
                Response::ok(request.id, data)
            }
            Err(err) => {
                debug!(command = name, error = %err, "dispatch failed");
                Response::error(request.id, ErrorPayload::from(err))
            }
        }
    }

    async fn handle(&self, command: HostCommand) -> Result<Value, HostError> {
        match command {
            HostCommand::GetOrigin => Ok(json!({ "origin": self.current_origin() })),
            HostCommand::SetOrigin { origin } => {
                let normalized = validate_origin(&origin)?;
                self.persist(|s| s.set_origin(Some(normalized.as_str().to_string())))?;
                Ok(json!({ "origin": normalized.as_str() }))
            }
            HostCommand::ResetOrigin => {
                self.persist(|s| s.set_origin(None))?;
                Ok(json!({ "origin": DEFAULT_ORIGIN }))
            }
            HostCommand::OpenExternal { href } => {
                let href = validate_external_url(&href)?;
                open_with_os(&href)?;
                Ok(Value::Null)
            }
            HostCommand::CliExists => Ok(json!({ "exists": paths::cli_path().is_some() })),

            HostCommand::Connect {
                target_id,
                token,
                host_id,
            } => {
                let origin = self.current_origin();
                let details = self
                    .sessions
                    .start(&origin, &target_id, &token, host_id.as_deref())
                    .await?;
                serde_json::to_value(details)
                    .map_err(|e| HostError::validation(format!("unserializable details: {}", e)))
            }
            HostCommand::Stop { session_id } => {
                self.sessions.stop_by_id(&session_id).await?;
                Ok(Value::Null)
            }

            HostCommand::IsWindowsOs => Ok(Value::Bool(cfg!(windows))),
            HostCommand::MinimizeWindow => self.window(WindowAction::Minimize),
            HostCommand::ToggleFullscreenWindow => self.window(WindowAction::ToggleFullscreen),
            HostCommand::CloseWindow { force } => self.close_window(force).await,

            HostCommand::CreateTerminal { id, cols, rows } => {
                let (sink, rx) = mpsc::channel(TERMINAL_SINK_DEPTH);
                self.terminals.create_terminal(&id, cols, rows, sink).await?;
                tokio::spawn(bridge_terminal(id, rx, self.events.clone()));
                Ok(Value::Null)
            }
            HostCommand::WriteTerminal { id, input } => {
                self.terminals.write_to_terminal(&id, &input).await?;
                Ok(Value::Null)
            }
            HostCommand::ResizeTerminal { id, cols, rows } => {
                self.terminals.resize_terminal(&id, cols, rows).await?;
                Ok(Value::Null)
            }
            HostCommand::RemoveTerminal { id } => {
                self.terminals.remove_terminal(&id).await?;
                Ok(Value::Null)
            }

            HostCommand::AddToken { token, token_id } => {
                self.cache.add_token(&token, &token_id).await?;
                self.agent.add_token(&token, &token_id).await?;
                Ok(Value::Null)
            }
            HostCommand::CacheStatus => {
                let status = self.cache.status().await?;
                serde_json::to_value(status)
                    .map_err(|e| HostError::validation(format!("unserializable status: {}", e)))
            }
            HostCommand::CacheStart => {
                let status = self.cache.start().await?;
                serde_json::to_value(status)
                    .map_err(|e| HostError::validation(format!("unserializable status: {}", e)))
            }
            HostCommand::CacheStop => {
                self.cache.stop().await?;
                Ok(Value::Null)
            }
            HostCommand::Search { query } => self.cache.search(&query).await,

            HostCommand::AgentStatus => {
                let status = self.agent.status().await?;
                serde_json::to_value(status)
                    .map_err(|e| HostError::validation(format!("unserializable status: {}", e)))
            }
            HostCommand::AgentPause => self.agent.pause().await,
            HostCommand::AgentResume => self.agent.resume().await,
            HostCommand::AgentSessions => self.agent.sessions().await,

            HostCommand::GetRdpClients => Ok(json!({ "clients": self.rdp.available_clients() })),
            HostCommand::GetPreferredRdpClient => {
                Ok(json!({ "client": self.rdp.preferred_client() }))
            }
            HostCommand::SetPreferredRdpClient { client } => {
                self.rdp.set_preferred_client(&client)?;
                Ok(json!({ "client": client }))
            }
            HostCommand::LaunchRdp { address, port } => {
                self.rdp.launch(&address, port).await?;
                Ok(Value::Null)
            }
        }
    }

    fn current_origin(&self) -> String {
        self.settings
            .origin()
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string())
    }

    fn persist(&self, write: impl FnOnce(&SettingsStore) -> anyhow::Result<()>) -> Result<(), HostError> {
        write(&self.settings).map_err(|e| HostError::spawn(format!("settings: {}", e)))
    }

    fn window(&self, action: WindowAction) -> Result<Value, HostError> {
        let _ = self.events.send(HostEvent::Window { action });
        Ok(Value::Null)
    }

    /// Quit-confirmation contract: while sessions are running a plain
    /// close only reports back so the UI can confirm; a forced close
    /// tears everything down.
    async fn close_window(&self, force: bool) -> Result<Value, HostError> {
        if !force && self.sessions.has_running_sessions().await {
            return Ok(json!({ "closed": false, "runningSessions": true }));
        }

        self.shutdown().await;
        let _ = self.events.send(HostEvent::Window {
            action: WindowAction::Close,
        });
        Ok(json!({ "closed": true }))
    }

    /// Tear down in order: sessions, daemons, RDP viewers, terminal
    /// worker.
    pub async fn shutdown(&self) {
        self.sessions.stop_all().await;
        if let Err(e) = self.cache.stop().await {
            warn!("cache daemon stop: {}", e);
        }
        if let Err(e) = self.agent.stop().await {
            warn!("client agent stop: {}", e);
        }
        self.rdp.stop_all().await;
        self.terminals.stop_all().await;
    }
}

/// Forward one terminal's output into the push-event stream; the sink
/// closing means the terminal is gone.
async fn bridge_terminal(
    id: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    events: broadcast::Sender<HostEvent>,
) {
    while let Some(payload) = rx.recv().await {
        let _ = events.send(HostEvent::TerminalData {
            id: id.clone(),
            payload,
        });
    }
    let _ = events.send(HostEvent::TerminalExit { id });
}
