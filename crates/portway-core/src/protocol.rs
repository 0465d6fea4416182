//! Wire protocol for UI-host communication and the terminal worker pipe.
//!
//! The dispatcher boundary speaks newline-delimited JSON: one
//! [`Request`] per line in, one [`Response`] per line out. The terminal
//! worker speaks [`WorkerRequest`]/[`WorkerEvent`] over its stdio in the
//! same framing.

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::keys::KeyEvent;

/// A request from the UI process to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub command: HostCommand,
}

/// The command surface exposed to the UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "camelCase")]
pub enum HostCommand {
    GetOrigin,
    SetOrigin {
        origin: String,
    },
    ResetOrigin,
    OpenExternal {
        href: String,
    },
    CliExists,
    Connect {
        target_id: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_id: Option<String>,
    },
    Stop {
        session_id: String,
    },
    #[serde(rename = "isWindowsOS")]
    IsWindowsOs,
    MinimizeWindow,
    ToggleFullscreenWindow,
    CloseWindow {
        #[serde(default)]
        force: bool,
    },
    CreateTerminal {
        id: String,
        cols: u16,
        rows: u16,
    },
    WriteTerminal {
        id: String,
        input: TerminalInput,
    },
    ResizeTerminal {
        id: String,
        cols: u16,
        rows: u16,
    },
    RemoveTerminal {
        id: String,
    },
    AddToken {
        token: String,
        token_id: String,
    },
    CacheStatus,
    CacheStart,
    CacheStop,
    Search {
        query: String,
    },
    AgentStatus,
    AgentPause,
    AgentResume,
    AgentSessions,
    GetRdpClients,
    GetPreferredRdpClient,
    SetPreferredRdpClient {
        client: String,
    },
    LaunchRdp {
        address: String,
        port: u16,
    },
}

impl HostCommand {
    /// Stable command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetOrigin => "getOrigin",
            Self::SetOrigin { .. } => "setOrigin",
            Self::ResetOrigin => "resetOrigin",
            Self::OpenExternal { .. } => "openExternal",
            Self::CliExists => "cliExists",
            Self::Connect { .. } => "connect",
            Self::Stop { .. } => "stop",
            Self::IsWindowsOs => "isWindowsOS",
            Self::MinimizeWindow => "minimizeWindow",
            Self::ToggleFullscreenWindow => "toggleFullscreenWindow",
            Self::CloseWindow { .. } => "closeWindow",
            Self::AddToken { .. } => "addToken",
            Self::CreateTerminal { .. } => "createTerminal",
            Self::WriteTerminal { .. } => "writeTerminal",
            Self::ResizeTerminal { .. } => "resizeTerminal",
            Self::RemoveTerminal { .. } => "removeTerminal",
            Self::CacheStatus => "cacheStatus",
            Self::CacheStart => "cacheStart",
            Self::CacheStop => "cacheStop",
            Self::Search { .. } => "search",
            Self::AgentStatus => "agentStatus",
            Self::AgentPause => "agentPause",
            Self::AgentResume => "agentResume",
            Self::AgentSessions => "agentSessions",
            Self::GetRdpClients => "getRdpClients",
            Self::GetPreferredRdpClient => "getPreferredRdpClient",
            Self::SetPreferredRdpClient { .. } => "setPreferredRdpClient",
            Self::LaunchRdp { .. } => "launchRdp",
        }
    }
}

/// Input to a terminal: raw bytes forwarded verbatim, or a structured
/// key event translated through the encoding table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalInput {
    Raw { data: String },
    Key(KeyEvent),
}

/// A response from the host to the UI process.
///
/// Exactly one of `data`/`error` is set. Handlers' resolved values pass
/// through unchanged; failures of any shape are normalized into
/// [`ErrorPayload`] before they reach this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn ok(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            id: id.into(),
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

/// The proxy endpoint reported by a freshly started session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDetails {
    pub session_id: String,
    pub address: String,
    /// The client binary reports the port as a string.
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// Status payload reported by a daemon's `status -format=json`.
///
/// Only the socket path is interpreted by the host; the rest of the
/// payload is carried through to the UI untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatusPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Summary of a tracked session, for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub address: String,
    pub port: String,
    pub running: bool,
    pub created_at: String,
}

/// Host-to-worker terminal messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerRequest {
    Create {
        id: String,
        cols: u16,
        rows: u16,
        shell: String,
    },
    Write {
        id: String,
        data: Vec<u8>,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Remove {
        id: String,
    },
}

/// Window-control actions forwarded to the embedding shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAction {
    Minimize,
    ToggleFullscreen,
    Close,
}

/// Push events emitted by the host outside the request/response cycle.
///
/// Terminal output and window-control actions cannot wait for a reply
/// slot; the server fans these out to connected clients as their own
/// JSON lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent {
    TerminalData { id: String, payload: Vec<u8> },
    TerminalExit { id: String },
    Window { action: WindowAction },
}

/// Worker-to-host terminal messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Data { id: String, payload: Vec<u8> },
    Exit { id: String },
    Error { id: String, error: String },
}
