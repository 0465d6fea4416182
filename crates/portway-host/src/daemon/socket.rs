//! Minimal HTTP/1.1 client over a Unix domain socket.
//!
//! The daemons speak plain HTTP framed over a socket file, with a fixed
//! internal virtual host. One request per connection (`Connection:
//! close`), JSON bodies both ways. Status codes 200-399 are success;
//! anything else is rejected with the parsed error body.

use std::path::{Path, PathBuf};
use std::time::Duration;

use portway_core::error::HostError;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

/// Fixed virtual host for daemon requests; the daemon ignores the value
/// but HTTP/1.1 requires the header.
const VIRTUAL_HOST: &str = "portway.internal";

/// Default per-request bound so an unresponsive daemon cannot freeze
/// dispatcher-facing calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one daemon's Unix domain socket.
#[derive(Debug, Clone)]
pub struct SocketClient {
    path: PathBuf,
    bound: Duration,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bound: REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(path: impl Into<PathBuf>, bound: Duration) -> Self {
        Self {
            path: path.into(),
            bound,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// GET a path (with query already encoded) and parse the JSON body.
    pub async fn get(&self, path_and_query: &str) -> Result<Value, HostError> {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n",
            path_and_query, VIRTUAL_HOST
        );
        self.round_trip(path_and_query, request.into_bytes()).await
    }

    /// POST a JSON body to a path and parse the JSON response body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, HostError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| HostError::validation(format!("unserializable body: {}", e)))?;
        let mut request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            VIRTUAL_HOST,
            payload.len()
        )
        .into_bytes();
        request.extend_from_slice(&payload);
        self.round_trip(path, request).await
    }

    async fn round_trip(&self, what: &str, request: Vec<u8>) -> Result<Value, HostError> {
        timeout(self.bound, self.exchange(request))
            .await
            .map_err(|_| HostError::timeout(format!("daemon socket request '{}'", what)))?
    }

    async fn exchange(&self, request: Vec<u8>) -> Result<Value, HostError> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
            HostError::Protocol {
                status: 0,
                message: format!("cannot reach daemon socket {:?}: {}", self.path, e),
            }
        })?;

        stream
            .write_all(&request)
            .await
            .map_err(|e| HostError::Protocol {
                status: 0,
                message: format!("socket write failed: {}", e),
            })?;

        // Connection: close means the response is everything until EOF.
        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| HostError::Protocol {
                status: 0,
                message: format!("socket read failed: {}", e),
            })?;

        let (status, body) = parse_response(&raw)?;
        debug!(status, path = ?self.path, "daemon socket response");

        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body.trim()).map_err(|e| HostError::Protocol {
                status,
                message: format!("unparsable response body: {}", e),
            })?
        };

        if (200..400).contains(&status) {
            Ok(value)
        } else {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.trim().to_string());
            Err(HostError::Protocol { status, message })
        }
    }
}

/// Split a raw HTTP/1.1 response into status code and body.
fn parse_response(raw: &[u8]) -> Result<(u16, &str), HostError> {
    let text = std::str::from_utf8(raw).map_err(|_| HostError::Protocol {
        status: 0,
        message: "response is not valid UTF-8".to_string(),
    })?;

    let malformed = || HostError::Protocol {
        status: 0,
        message: "malformed HTTP response".to_string(),
    };

    // Status line: HTTP/1.1 200 OK
    let status_line = text.lines().next().ok_or_else(malformed)?;
    let mut parts = status_line.split_whitespace();
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/1.") {
        return Err(malformed());
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;

    let body = match text.split_once("\r\n\r\n") {
        Some((_, body)) => body,
        None => "",
    };
    Ok((status, body))
}
