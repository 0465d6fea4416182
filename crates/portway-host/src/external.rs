//! Opening URLs through the platform's external-open facility.

use std::process::Stdio;

use portway_core::error::HostError;
use tokio::process::Command;
use tracing::debug;

/// Hand a URL (or URI) to the OS default handler. Fire and forget: the
/// opener detaches, so there is no handle to track.
pub fn open_with_os(target: &str) -> Result<(), HostError> {
    let (program, args): (&str, &[&str]) = if cfg!(target_os = "macos") {
        ("open", &[])
    } else if cfg!(windows) {
        ("cmd", &["/C", "start", ""])
    } else {
        ("xdg-open", &[])
    };

    debug!(target, program, "opening via OS handler");
    Command::new(program)
        .args(args)
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| HostError::spawn(format!("OS opener '{}': {}", program, e)))?;
    Ok(())
}
