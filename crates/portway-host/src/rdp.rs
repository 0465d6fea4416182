//! RDP viewer discovery and launch.
//!
//! A static capability table pairs each known client with a probe; the
//! probes only look at PATH or the filesystem, nothing heavier. Native
//! viewers are spawned and tracked for cleanup; the URI fallback goes
//! through the OS opener and leaves no handle behind.

use std::sync::Arc;

use portway_core::error::HostError;
use portway_core::sanitize::{validate_address, Address};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::external::open_with_os;
use crate::settings::SettingsStore;

/// Identifier for the "no specific client" fallback.
pub const CLIENT_NONE: &str = "none";

struct Capability {
    id: &'static str,
    probe: fn() -> bool,
}

/// Known clients, probed lazily. Order matters: the first available
/// non-fallback entry wins when no preference is persisted.
const CAPABILITIES: &[Capability] = &[
    Capability {
        id: "xfreerdp",
        probe: || cfg!(unix) && which::which("xfreerdp").is_ok(),
    },
    Capability {
        id: "remmina",
        probe: || cfg!(unix) && which::which("remmina").is_ok(),
    },
    Capability {
        id: "microsoft-remote-desktop",
        probe: || {
            cfg!(target_os = "macos")
                && (std::path::Path::new("/Applications/Windows App.app").exists()
                    || std::path::Path::new("/Applications/Microsoft Remote Desktop.app").exists())
        },
    },
    Capability {
        id: CLIENT_NONE,
        probe: || true,
    },
];

pub struct RdpManager {
    settings: Arc<SettingsStore>,
    launched: Mutex<Vec<Child>>,
}

impl RdpManager {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Clients whose probe passes on this machine. Always contains at
    /// least the fallback.
    pub fn available_clients(&self) -> Vec<&'static str> {
        CAPABILITIES
            .iter()
            .filter(|c| (c.probe)())
            .map(|c| c.id)
            .collect()
    }

    /// The client `launch` will use: the persisted preference when it
    /// is still available, else the first available real viewer, else
    /// the fallback.
    pub fn preferred_client(&self) -> &'static str {
        let available = self.available_clients();
        resolve_preferred(self.settings.preferred_rdp_client().as_deref(), &available)
    }

    /// Persist a preference. Only known client ids are accepted.
    pub fn set_preferred_client(&self, client: &str) -> Result<(), HostError> {
        if !CAPABILITIES.iter().any(|c| c.id == client) {
            return Err(HostError::validation(format!(
                "unknown RDP client '{}'",
                client
            )));
        }
        self.settings
            .set_preferred_rdp_client(Some(client.to_string()))
            .map_err(|e| HostError::spawn(format!("persisting RDP preference: {}", e)))
    }

    /// Open a connection to `address:port` with the preferred client.
    pub async fn launch(&self, address: &str, port: u16) -> Result<(), HostError> {
        let address = validate_address(address)?;

        match self.preferred_client() {
            "xfreerdp" => {
                let child = self.spawn_viewer(
                    "xfreerdp",
                    &[format!("/v:{}:{}", address, port), "/cert:tofu".to_string()],
                )?;
                self.launched.lock().await.push(child);
            }
            "remmina" => {
                let child = self.spawn_viewer(
                    "remmina",
                    &["-c".to_string(), format!("rdp://{}:{}", address, port)],
                )?;
                self.launched.lock().await.push(child);
            }
            _ => {
                // URI handoff covers the macOS client and the fallback.
                open_with_os(&connection_uri(&address, port))?;
            }
        }
        Ok(())
    }

    fn spawn_viewer(&self, program: &str, args: &[String]) -> Result<Child, HostError> {
        debug!(program, ?args, "launching RDP viewer");
        Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::spawn(format!("RDP viewer '{}': {}", program, e)))
    }

    /// Kill every viewer this manager launched. Already-exited handles
    /// are reaped quietly, so calling this repeatedly is harmless.
    pub async fn stop_all(&self) {
        let mut launched = self.launched.lock().await;
        for child in launched.iter_mut() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill RDP viewer: {}", e);
                    }
                }
            }
        }
        launched.clear();
    }
}

/// The `rdp:` URI consumed by URI-capable clients. "full address" is the
/// standard .rdp property name, percent-encoded for the URI form.
fn connection_uri(address: &Address, port: u16) -> String {
    format!("rdp://full%20address=s:{}:{}", address, port)
}

fn resolve_preferred<'a>(persisted: Option<&str>, available: &[&'a str]) -> &'a str {
    if let Some(pref) = persisted {
        if let Some(found) = available.iter().find(|c| **c == pref) {
            return found;
        }
    }
    available
        .iter()
        .find(|c| **c != CLIENT_NONE)
        .copied()
        .unwrap_or(CLIENT_NONE)
}
