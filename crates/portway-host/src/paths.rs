//! Socket, PID file, and external CLI path resolution.
//!
//! Priority for the socket directory:
//! 1. `PORTWAY_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/portway` (Linux standard)
//! 3. `~/.portway` (home directory fallback)
//! 4. System temp dir (last resort)

use std::env;
use std::path::PathBuf;

/// Name of the external client binary driven by the host.
pub const CLI_BINARY: &str = "portctl";

/// Get socket directory with priority fallback.
pub fn socket_dir() -> PathBuf {
    // 1. Explicit override (ignore empty)
    if let Ok(dir) = env::var("PORTWAY_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    // 2. XDG_RUNTIME_DIR (Linux standard, ignore empty)
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("portway");
        }
    }

    // 3. Home directory fallback
    if let Some(home) = dirs::home_dir() {
        return home.join(".portway");
    }

    // 4. Last resort: temp dir
    env::temp_dir().join("portway")
}

/// Socket path the host server listens on.
pub fn host_socket_path() -> PathBuf {
    socket_dir().join("host.sock")
}

/// PID file path for the host server.
pub fn host_pid_path() -> PathBuf {
    socket_dir().join("host.pid")
}

/// Resolve the external client binary.
///
/// `PORTWAY_CLI` overrides; otherwise the binary is looked up on PATH.
/// Returns `None` when the CLI is not installed (`cliExists` reports
/// this to the UI instead of failing hard).
pub fn cli_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("PORTWAY_CLI") {
        if !path.is_empty() {
            let path = PathBuf::from(path);
            return path.is_file().then_some(path);
        }
    }
    which::which(CLI_BINARY).ok()
}

/// Ensure the socket directory exists with secure permissions (0700 on
/// Unix).
pub fn ensure_socket_dir() -> std::io::Result<()> {
    let dir = socket_dir();
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Default settings file location under the platform config dir.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(env::temp_dir)
        .join("portway")
        .join("settings.json")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Env var manipulation is inherently non-thread-safe, so tests that
    // touch the environment must run serially.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap();
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: We hold ENV_MUTEX, so no other test thread is
                // modifying env vars.
                unsafe {
                    match value {
                        Some(v) => std::env::set_var(name, v),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_socket_dir_explicit_override() {
        let _guard = EnvGuard::new(&["PORTWAY_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe {
            std::env::set_var("PORTWAY_SOCKET_DIR", "/custom/socket/path");
            std::env::remove_var("XDG_RUNTIME_DIR");
        }

        assert_eq!(socket_dir(), PathBuf::from("/custom/socket/path"));
        assert_eq!(
            host_socket_path(),
            PathBuf::from("/custom/socket/path/host.sock")
        );
    }

    #[test]
    fn test_socket_dir_ignores_empty_override() {
        let _guard = EnvGuard::new(&["PORTWAY_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe {
            std::env::set_var("PORTWAY_SOCKET_DIR", "");
            std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        }

        assert_eq!(socket_dir(), PathBuf::from("/run/user/1000/portway"));
    }

    #[test]
    fn test_socket_dir_home_fallback() {
        let _guard = EnvGuard::new(&["PORTWAY_SOCKET_DIR", "XDG_RUNTIME_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe {
            std::env::remove_var("PORTWAY_SOCKET_DIR");
            std::env::remove_var("XDG_RUNTIME_DIR");
        }

        assert!(socket_dir().to_string_lossy().ends_with(".portway"));
    }

    #[test]
    fn test_cli_path_env_override_requires_existing_file() {
        let _guard = EnvGuard::new(&["PORTWAY_CLI"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var("PORTWAY_CLI", "/nonexistent/portctl") };

        assert_eq!(cli_path(), None);
    }

    #[test]
    fn test_cli_path_env_override_accepts_existing_file() {
        let _guard = EnvGuard::new(&["PORTWAY_CLI"]);
        let file = tempfile::NamedTempFile::new().unwrap();
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var("PORTWAY_CLI", file.path()) };

        assert_eq!(cli_path(), Some(file.path().to_path_buf()));
    }
}
