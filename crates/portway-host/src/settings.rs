//! Persisted host settings.
//!
//! A single JSON file under the platform config dir holds the active
//! origin override and the preferred RDP client. Writes go through a
//! temp-file-then-rename so a crash mid-write never leaves a truncated
//! settings file behind. A watch channel notifies collaborators (the
//! CSP generator consumes origin changes this way).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

/// The persisted settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_rdp_client: Option<String>,
}

pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<Settings>,
    tx: watch::Sender<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`. A missing file yields defaults; an
    /// unreadable file is treated as empty rather than blocking startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), "unreadable settings file, starting fresh: {}", e);
                Settings::default()
            }),
            Err(_) => Settings::default(),
        };

        let (tx, _) = watch::channel(settings.clone());
        Self {
            path,
            state: Mutex::new(settings),
            tx,
        }
    }

    pub fn origin(&self) -> Option<String> {
        self.lock().origin.clone()
    }

    pub fn set_origin(&self, origin: Option<String>) -> Result<()> {
        self.update(|s| s.origin = origin)
    }

    pub fn preferred_rdp_client(&self) -> Option<String> {
        self.lock().preferred_rdp_client.clone()
    }

    pub fn set_preferred_rdp_client(&self, client: Option<String>) -> Result<()> {
        self.update(|s| s.preferred_rdp_client = client)
    }

    /// Subscribe to settings changes. The receiver always starts with
    /// the current value.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update(&self, mutate: impl FnOnce(&mut Settings)) -> Result<()> {
        let snapshot = {
            let mut state = self.lock();
            mutate(&mut state);
            state.clone()
        };
        persist(&self.path, &snapshot)?;
        let _ = self.tx.send(snapshot);
        Ok(())
    }
}

/// Write the document atomically: temp file in the same directory, then
/// rename over the target.
fn persist(path: &Path, settings: &Settings) -> Result<()> {
    let parent = path
        .parent()
        .context("settings path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating settings dir {}", parent.display()))?;

    let raw = serde_json::to_vec_pretty(settings).context("serializing settings")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &raw).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
