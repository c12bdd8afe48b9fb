// src/snapd/client.rs

//! snapd REST client
//!
//! Speaks HTTP/1.1 over the daemon's Unix socket, one connection per
//! request with `Connection: close`. Responses use the snapd envelope:
//!
//! ```text
//! {"type": "sync" | "async" | "error", "status-code": 200, "result": ..., "change": "42"}
//! ```
//!
//! Install and remove are asynchronous changes: the client polls
//! `/v2/changes/{id}` until the change is ready, mirroring task progress
//! into the caller's [`Progress`]. Cancelling the token aborts the change.

use super::{FindMode, PackageSource, SnapSummary};
use crate::cancel::cancellable;
use crate::config::{DEFAULT_SNAPD_SOCKET, StoreConfig};
use crate::error::{Error, Result};
use crate::progress::Progress;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error kind snapd reports when a find matched nothing
const SNAP_NOT_FOUND: &str = "snap-not-found";

/// Client for the snapd REST API
pub struct SnapdClient {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Per-request timeout
    timeout: Duration,
    /// Delay between polls of an in-flight change
    poll_interval: Duration,
}

/// Raw HTTP response from the daemon
struct HttpResponse {
    status_code: u16,
    body: Vec<u8>,
}

/// Response envelope shared by every snapd endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "status-code", default)]
    status_code: u16,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    change: Option<String>,
}

/// `result` member of an error envelope
#[derive(Debug, Default, Deserialize)]
struct ErrorResult {
    #[serde(default)]
    message: String,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    status: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    tasks: Vec<ChangeTask>,
}

#[derive(Debug, Deserialize)]
struct ChangeTask {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: TaskProgress,
}

#[derive(Debug, Default, Deserialize)]
struct TaskProgress {
    #[serde(default)]
    label: String,
    #[serde(default)]
    done: i64,
    #[serde(default)]
    total: i64,
}

impl SnapdClient {
    /// Create a client for the default socket
    pub fn new() -> Self {
        Self::with_socket_path(DEFAULT_SNAPD_SOCKET)
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Create a client from store configuration
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::with_socket_path(&config.snapd_socket_path)
            .with_timeout(config.http_timeout())
            .with_poll_interval(config.change_poll_interval())
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the delay between change polls
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Issue a request and return the `result` of a sync or async envelope
    async fn call(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Envelope> {
        let response = cancellable(cancel, self.request(method, path, body)).await?;
        let envelope: Envelope = serde_json::from_slice(&response.body).map_err(|e| {
            Error::protocol(format!(
                "invalid snapd response to {method} {path} (HTTP {}): {e}",
                response.status_code
            ))
        })?;

        if envelope.kind == "error" {
            let detail: ErrorResult = serde_json::from_value(envelope.result).unwrap_or_default();
            let status = if envelope.status_code != 0 {
                envelope.status_code
            } else {
                response.status_code
            };
            return Err(Error::Daemon {
                status,
                kind: detail.kind,
                message: detail.message,
            });
        }

        Ok(envelope)
    }

    /// GET a sync endpoint and deserialize its result
    async fn get_result<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let envelope = self.call("GET", path, None, cancel).await?;
        serde_json::from_value(envelope.result)
            .map_err(|e| Error::protocol(format!("unexpected result from {path}: {e}")))
    }

    /// Run `/v2/find` with the given query parameters
    async fn find_with(
        &self,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        match self.get_result(&format!("/v2/find?{query}"), cancel).await {
            Err(Error::Daemon { kind: Some(kind), .. }) if kind == SNAP_NOT_FOUND => Ok(Vec::new()),
            other => other,
        }
    }

    /// Start a change and wait for it to finish
    async fn run_change(
        &self,
        path: &str,
        body: &Value,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let envelope = self.call("POST", path, Some(body), cancel).await?;
        let Some(id) = envelope.change else {
            // Nothing to wait for
            return Ok(());
        };
        debug!("snapd change {} started for {}", id, path);

        let result = self.poll_change(&id, progress, cancel).await;
        if matches!(result, Err(Error::Cancelled)) {
            self.abort_change(&id).await;
        }
        result
    }

    async fn poll_change(
        &self,
        id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = format!("/v2/changes/{id}");
        loop {
            let change: Change = self.get_result(&path, cancel).await?;
            mirror_progress(&change, progress);

            if change.ready {
                return match change.status.as_str() {
                    "Done" => Ok(()),
                    status => Err(Error::Daemon {
                        status: 200,
                        kind: Some(status.to_lowercase()),
                        message: change.err.unwrap_or_else(|| {
                            format!("change {id} finished with status {status}")
                        }),
                    }),
                };
            }

            cancellable(cancel, async {
                tokio::time::sleep(self.poll_interval).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Ask the daemon to abort a change; best effort
    async fn abort_change(&self, id: &str) {
        let body = json!({"action": "abort"});
        if let Err(e) = self.request("POST", &format!("/v2/changes/{id}"), Some(&body)).await {
            warn!("Failed to abort snapd change {}: {}", id, e);
        }
    }

    /// Make an HTTP request to the daemon
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                Error::transport(format!(
                    "cannot connect to snapd at {}: {e}",
                    self.socket_path.display()
                ))
            })?;

            let body = body.map(Value::to_string).unwrap_or_default();
            let request = format!(
                "{method} {path} HTTP/1.1\r\n\
                 Host: localhost\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\
                 Connection: close\r\n\
                 \r\n\
                 {body}",
                body.len()
            );
            stream.write_all(request.as_bytes()).await?;

            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await?;
            parse_http_response(&raw)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::transport(format!("snapd request {method} {path} timed out")))?
    }
}

impl Default for SnapdClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageSource for SnapdClient {
    async fn list_sections(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        self.get_result("/v2/sections", cancel).await
    }

    async fn find_section(
        &self,
        section: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>> {
        self.find_with(&[("section", section), ("scope", "wide")], cancel)
            .await
    }

    async fn find(
        &self,
        query: &str,
        mode: FindMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>> {
        match mode {
            FindMode::Text => self.find_with(&[("q", query), ("scope", "wide")], cancel).await,
            FindMode::Name => self.find_with(&[("name", query)], cancel).await,
        }
    }

    async fn list_installed(&self, cancel: &CancellationToken) -> Result<Vec<SnapSummary>> {
        self.get_result("/v2/snaps", cancel).await
    }

    async fn install(
        &self,
        name: &str,
        channel: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut body = json!({"action": "install"});
        if let Some(channel) = channel {
            body["channel"] = json!(channel);
        }
        self.run_change(&format!("/v2/snaps/{name}"), &body, progress, cancel)
            .await
    }

    async fn remove(
        &self,
        name: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = json!({"action": "remove"});
        self.run_change(&format!("/v2/snaps/{name}"), &body, progress, cancel)
            .await
    }

    fn name(&self) -> &str {
        "snapd"
    }
}

/// Copy the state of a change into the caller's progress
fn mirror_progress(change: &Change, progress: &Progress) {
    let done = change.tasks.iter().map(|t| t.progress.done).sum();
    let total = change.tasks.iter().map(|t| t.progress.total).sum();
    let label = change
        .tasks
        .iter()
        .find(|t| t.status == "Doing")
        .map(|t| {
            if t.progress.label.is_empty() {
                t.summary.as_str()
            } else {
                t.progress.label.as_str()
            }
        })
        .unwrap_or_default();
    progress.update(done, total, label);
}

/// Parse a raw HTTP/1.1 response, decoding a chunked body
fn parse_http_response(raw: &[u8]) -> Result<HttpResponse> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| Error::protocol("truncated response from snapd"))?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.lines();

    let status_line = lines
        .next()
        .ok_or_else(|| Error::protocol("empty response from snapd"))?;
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::protocol(format!("bad status line from snapd: {status_line}")))?;

    let chunked = lines.any(|line| {
        line.split_once(':').is_some_and(|(key, value)| {
            key.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.trim().eq_ignore_ascii_case("chunked")
        })
    });

    let body = &raw[split + 4..];
    let body = if chunked {
        decode_chunked(body)?
    } else {
        body.to_vec()
    };

    Ok(HttpResponse { status_code, body })
}

fn decode_chunked(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::protocol("truncated chunk header"))?;
        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| Error::protocol(format!("bad chunk size: {size_hex}")))?;
        data = &data[line_end + 2..];

        if size == 0 {
            return Ok(out);
        }
        if data.len() < size {
            return Err(Error::protocol("truncated chunk"));
        }
        out.extend_from_slice(&data[..size]);
        data = &data[size..];
        data = data.strip_prefix(b"\r\n").unwrap_or(data);
    }
}
