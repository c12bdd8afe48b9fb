// tests/common/mod.rs

//! Shared test utilities for integration tests: in-process package and
//! review sources, canned HTTP servers and image fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::Mutex;
use snapstore::snapd::{SnapMedia, SnapSummary};
use snapstore::{
    CacheStore, CancellationToken, Error, FindMode, ImagePipeline, ModelEvent, PackageSource,
    Progress, RatingHistogram, Result, Review, ReviewBatch, ReviewPage, ReviewSource, StoreModel,
};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;

/// How the fake daemon answers install and remove
#[derive(Debug, Clone)]
pub enum OpBehavior {
    Succeed,
    Fail(String),
    /// Report some progress, then wait until the token fires
    WaitForCancel,
}

/// In-process stand-in for snapd
pub struct MockPackages {
    pub sections: Mutex<Option<Vec<String>>>,
    pub section_snaps: Mutex<HashMap<String, Vec<SnapSummary>>>,
    pub failing_sections: Mutex<HashSet<String>>,
    pub search_results: Mutex<HashMap<String, Vec<SnapSummary>>>,
    pub installed: Mutex<Vec<SnapSummary>>,
    pub behavior: Mutex<OpBehavior>,
    pub operations: Mutex<Vec<String>>,
}

impl MockPackages {
    pub fn new() -> Self {
        Self {
            sections: Mutex::new(Some(Vec::new())),
            section_snaps: Mutex::new(HashMap::new()),
            failing_sections: Mutex::new(HashSet::new()),
            search_results: Mutex::new(HashMap::new()),
            installed: Mutex::new(Vec::new()),
            behavior: Mutex::new(OpBehavior::Succeed),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Sections listing; `None` makes the listing fail
    pub fn set_sections(&self, sections: Option<&[&str]>) {
        *self.sections.lock() = sections.map(|s| s.iter().map(|n| n.to_string()).collect());
    }

    pub fn set_section(&self, section: &str, names: &[&str]) {
        self.section_snaps
            .lock()
            .insert(section.to_string(), names.iter().map(|n| snap(n)).collect());
    }

    pub fn fail_section(&self, section: &str) {
        self.failing_sections.lock().insert(section.to_string());
    }

    pub fn set_search(&self, query: &str, snaps: Vec<SnapSummary>) {
        self.search_results.lock().insert(query.to_string(), snaps);
    }

    pub fn set_installed(&self, names: &[&str]) {
        *self.installed.lock() = names.iter().map(|n| snap(n)).collect();
    }

    pub fn set_behavior(&self, behavior: OpBehavior) {
        *self.behavior.lock() = behavior;
    }

    async fn run_operation(
        &self,
        label: String,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.operations.lock().push(label);
        let behavior = self.behavior.lock().clone();
        match behavior {
            OpBehavior::Succeed => {
                progress.update(4, 4, "Done");
                Ok(())
            }
            OpBehavior::Fail(message) => Err(Error::Daemon {
                status: 400,
                kind: Some("snap-change-conflict".to_string()),
                message,
            }),
            OpBehavior::WaitForCancel => {
                progress.update(1, 4, "Downloading");
                cancel.cancelled().await;
                Err(Error::Cancelled)
            }
        }
    }
}

#[async_trait]
impl PackageSource for MockPackages {
    async fn list_sections(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        snapstore::cancel::check(cancel)?;
        self.sections
            .lock()
            .clone()
            .ok_or_else(|| Error::transport("snapd unreachable"))
    }

    async fn find_section(
        &self,
        section: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>> {
        snapstore::cancel::check(cancel)?;
        if self.failing_sections.lock().contains(section) {
            return Err(Error::transport(format!("section {section} failed")));
        }
        Ok(self.section_snaps.lock().get(section).cloned().unwrap_or_default())
    }

    async fn find(
        &self,
        query: &str,
        _mode: FindMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<SnapSummary>> {
        snapstore::cancel::check(cancel)?;
        Ok(self.search_results.lock().get(query).cloned().unwrap_or_default())
    }

    async fn list_installed(&self, cancel: &CancellationToken) -> Result<Vec<SnapSummary>> {
        snapstore::cancel::check(cancel)?;
        Ok(self.installed.lock().clone())
    }

    async fn install(
        &self,
        name: &str,
        channel: Option<&str>,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let label = format!("install {name} {}", channel.unwrap_or("default"));
        self.run_operation(label, progress, cancel).await
    }

    async fn remove(
        &self,
        name: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_operation(format!("remove {name}"), progress, cancel).await
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// In-process stand-in for the review service
#[derive(Default)]
pub struct MockReviews {
    pub ratings: Mutex<HashMap<String, RatingHistogram>>,
    pub pending_ratings: Mutex<HashMap<String, RatingHistogram>>,
    pub reviews: Mutex<Vec<Review>>,
    pub session_key: Mutex<Option<String>>,
    pub fetches: AtomicUsize,
}

impl MockReviews {
    /// Ratings that become visible after the next `update_ratings`
    pub fn stage_ratings(&self, appstream_id: &str, counts: [i64; 5]) {
        self.pending_ratings
            .lock()
            .insert(appstream_id.to_string(), RatingHistogram(counts));
    }
}

#[async_trait]
impl ReviewSource for MockReviews {
    fn rating_histogram(&self, appstream_id: &str) -> Option<RatingHistogram> {
        self.ratings.lock().get(appstream_id).copied()
    }

    async fn update_ratings(&self, cancel: &CancellationToken) -> Result<()> {
        snapstore::cancel::check(cancel)?;
        let staged = self.pending_ratings.lock().clone();
        self.ratings.lock().extend(staged);
        Ok(())
    }

    async fn fetch_reviews(
        &self,
        _appstream_id: &str,
        page: &ReviewPage,
        cancel: &CancellationToken,
    ) -> Result<ReviewBatch> {
        snapstore::cancel::check(cancel)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let reviews = self.reviews.lock().iter().take(page.limit as usize).cloned().collect();
        Ok(ReviewBatch {
            reviews,
            session_key: self.session_key.lock().clone(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// A model over in-memory cache and the given fakes
pub fn model_with(
    packages: Arc<MockPackages>,
    reviews: Arc<MockReviews>,
) -> (StoreModel, CacheStore) {
    let cache = CacheStore::open_in_memory().unwrap();
    let model = model_on(cache.clone(), packages, reviews);
    (model, cache)
}

/// A model over an existing cache
pub fn model_on(
    cache: CacheStore,
    packages: Arc<MockPackages>,
    reviews: Arc<MockReviews>,
) -> StoreModel {
    let images = ImagePipeline::new(reqwest::Client::new(), cache.clone());
    StoreModel::new(cache, packages, reviews, images)
}

/// Minimal daemon result for `name`
pub fn snap(name: &str) -> SnapSummary {
    let mut snap = SnapSummary::new(name);
    snap.title = Some(title_case(name));
    snap.summary = Some(format!("Summary of {name}"));
    snap.common_ids = vec![format!("io.example.{}", title_case(name))];
    snap.media = vec![SnapMedia::new("icon", format!("https://example.com/{name}.png"))];
    snap
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Collect every event received so far
pub fn drain(events: &mut broadcast::Receiver<ModelEvent>) -> Vec<ModelEvent> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

/// PNG fixture of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(width, height))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// A request as seen by a canned server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

type Handler = Arc<dyn Fn(&RecordedRequest) -> Vec<u8> + Send + Sync>;

/// Requests served so far by a canned server
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<RecordedRequest>>>);

impl RequestLog {
    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn all(&self) -> Vec<RecordedRequest> {
        self.0.lock().clone()
    }

    pub fn matching(&self, method: &str, path_prefix: &str) -> Vec<RecordedRequest> {
        self.0
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }
}

/// Serve canned HTTP responses on a loopback TCP port
pub async fn serve_http<F>(handler: F) -> (SocketAddr, RequestLog)
where
    F: Fn(&RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
{
    serve_http_delayed(Duration::ZERO, handler).await
}

/// Like [`serve_http`], holding each response back for `delay`
pub async fn serve_http_delayed<F>(delay: Duration, handler: F) -> (SocketAddr, RequestLog)
where
    F: Fn(&RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = RequestLog::default();
    let handler: Handler = Arc::new(handler);

    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(handle_connection(stream, handler, server_log.clone(), delay));
        }
    });
    (addr, log)
}

/// Serve canned HTTP responses on a Unix socket
pub async fn serve_unix<F>(path: &Path, handler: F) -> RequestLog
where
    F: Fn(&RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = UnixListener::bind(path).unwrap();
    let log = RequestLog::default();
    let handler: Handler = Arc::new(handler);

    let server_log = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(handle_connection(stream, handler, server_log.clone(), Duration::ZERO));
        }
    });
    log
}

async fn handle_connection<S>(mut stream: S, handler: Handler, log: RequestLog, delay: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = raw[head_end + 4..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&buf[..n]),
        }
    }

    let request = RecordedRequest {
        method,
        path,
        headers,
        body,
    };
    let response = handler(&request);
    log.0.lock().push(request);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}

/// A complete response with a Content-Length body
pub fn http_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// A response whose body is sent with chunked transfer encoding
pub fn chunked_response(
    status: u16,
    headers: &[(&str, &str)],
    body: &[u8],
    chunk_size: usize,
) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
    let mut bytes = out.into_bytes();
    for chunk in body.chunks(chunk_size.max(1)) {
        bytes.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        bytes.extend_from_slice(chunk);
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(b"0\r\n\r\n");
    bytes
}

/// A snapd JSON envelope response
pub fn snapd_response(status: u16, envelope: serde_json::Value) -> Vec<u8> {
    http_response(
        status,
        &[("Content-Type", "application/json")],
        envelope.to_string().as_bytes(),
    )
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
