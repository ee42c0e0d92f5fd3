//! Shared helpers for the engine integration tests.
//!
//! `FileServer` is a small HTTP/1.1 server on a raw TCP socket. wiremock
//! always answers with a `Content-Length`, so the tests that need ranged
//! replies, chunked or unframed bodies, throttled bodies or a connection cut
//! mid-body use this instead.

#![allow(dead_code)]

use parking_lot::Mutex;
use rdm_core::{ConnectivityMonitor, DownloadObserver, RdmCore, SqliteTaskStore, TaskStore};
use rdm_types::{CoreEvent, Settings, TaskId, TaskStatus};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// How the body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength,
    Chunked,
    /// Neither header; the body ends when the connection closes
    Unframed,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub framing: Framing,
    /// Answer `Range: bytes=N-` with 206
    pub ranges: bool,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    /// Close the connection after this many body bytes
    pub truncate_after: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            etag: Some("\"v1\"".to_string()),
            content_type: Some("application/octet-stream".to_string()),
            framing: Framing::ContentLength,
            ranges: true,
            chunk_size: 8192,
            chunk_delay: Duration::ZERO,
            truncate_after: None,
        }
    }
}

impl ServerOptions {
    /// Body trickles out in 1 KiB pieces, leaving time to pause or cancel
    pub fn slow() -> Self {
        Self {
            chunk_size: 1024,
            chunk_delay: Duration::from_millis(40),
            ..Self::default()
        }
    }
}

/// Headers of one request as the server saw them
#[derive(Debug, Clone, Default)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
    pub if_match: Option<String>,
    pub user_agent: Option<String>,
}

pub struct FileServer {
    base: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FileServer {
    pub fn start(body: Vec<u8>, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let base = format!("http://{}", listener.local_addr().expect("local addr"));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let body = Arc::new(body);
        let log = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let body = body.clone();
                let options = options.clone();
                let log = log.clone();
                thread::spawn(move || {
                    let _ = serve(stream, &body, &options, &log);
                });
            }
        });

        Self { base, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

fn serve(
    mut stream: TcpStream,
    body: &[u8],
    options: &ServerOptions,
    log: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        raw.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&raw);
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let mut request = RecordedRequest {
        path,
        ..Default::default()
    };
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "range" => request.range = Some(value),
            "if-match" => request.if_match = Some(value),
            "user-agent" => request.user_agent = Some(value),
            _ => {}
        }
    }
    log.lock().push(request.clone());

    let tag_matches = match (&request.if_match, &options.etag) {
        (Some(sent), Some(etag)) => sent == etag,
        (Some(_), None) => false,
        (None, _) => true,
    };
    if !tag_matches {
        stream.write_all(
            b"HTTP/1.1 412 Precondition Failed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )?;
        return Ok(());
    }

    let start = request
        .range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok())
        .filter(|_| options.ranges);

    let (status, slice) = match start {
        Some(start) => ("206 Partial Content", &body[start.min(body.len())..]),
        None => ("200 OK", body),
    };

    let mut head = format!("HTTP/1.1 {}\r\nConnection: close\r\n", status);
    if let Some(etag) = &options.etag {
        head.push_str(&format!("ETag: {}\r\n", etag));
    }
    if let Some(content_type) = &options.content_type {
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
    }
    if let Some(start) = start {
        head.push_str(&format!(
            "Content-Range: bytes {}-{}/{}\r\n",
            start,
            body.len().saturating_sub(1),
            body.len()
        ));
    }
    match options.framing {
        Framing::ContentLength => head.push_str(&format!("Content-Length: {}\r\n", slice.len())),
        Framing::Chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
        Framing::Unframed => {}
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;

    let limit = options
        .truncate_after
        .map_or(slice.len(), |n| n.min(slice.len()));
    for chunk in slice[..limit].chunks(options.chunk_size.max(1)) {
        if options.framing == Framing::Chunked {
            stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())?;
            stream.write_all(chunk)?;
            stream.write_all(b"\r\n")?;
        } else {
            stream.write_all(chunk)?;
        }
        stream.flush()?;
        if !options.chunk_delay.is_zero() {
            thread::sleep(options.chunk_delay);
        }
    }

    if options.framing == Framing::Chunked && options.truncate_after.is_none() {
        stream.write_all(b"0\r\n\r\n")?;
    }
    stream.flush()
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Settings tuned for tests: every chunk reports progress, timeouts stay short
pub fn test_settings() -> Settings {
    Settings {
        min_progress_time_ms: 0,
        connect_timeout_secs: 5,
        read_timeout_secs: 5,
        ..Settings::default()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An engine over a SQLite store in a temp dir, with a controllable network
pub struct Harness {
    pub core: RdmCore,
    pub store: SqliteTaskStore,
    pub network: Arc<ConnectivityMonitor>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: Settings) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteTaskStore::new(dir.path().join("tasks.db"))
            .await
            .expect("open store");
        let network = Arc::new(ConnectivityMonitor::new());
        let core = RdmCore::with_store(Arc::new(store.clone()), settings, network.clone())
            .expect("build engine");

        Self {
            core,
            store,
            network,
            dir,
        }
    }

    pub fn downloads(&self) -> &Path {
        self.dir.path()
    }

    pub async fn create(&self, url: &str, file_name: &str) -> TaskId {
        let id = self.core.create_task(url, file_name, self.downloads(), None).await;
        assert!(id > 0, "create_task failed");
        id
    }

    /// Start the task and wait for its run to end
    pub async fn run(&self, id: TaskId) -> rdm_core::RunReport {
        assert_eq!(self.core.start_task(id).await, 0);
        tokio::time::timeout(Duration::from_secs(20), self.core.wait_task(id))
            .await
            .expect("run timed out")
            .expect("no run report")
    }

    pub async fn status(&self, id: TaskId) -> TaskStatus {
        self.store
            .get_by_id(id)
            .await
            .expect("load task")
            .expect("task exists")
            .status
    }
}

/// Wait until the task has reported some progress
pub async fn wait_for_progress(rx: &mut tokio::sync::broadcast::Receiver<CoreEvent>, id: TaskId) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(CoreEvent::Progress {
                    id: event_id,
                    bytes_so_far,
                    ..
                }) if event_id == id && bytes_so_far > 0 => return,
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("no progress reported");
}

/// Records every callback for later assertions
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<(TaskId, u64, Option<u64>)>>,
    pub statuses: Mutex<Vec<(TaskId, TaskStatus)>>,
    pub created: Mutex<Vec<TaskId>>,
    pub deleted: Mutex<Vec<TaskId>>,
}

impl DownloadObserver for RecordingObserver {
    fn on_created(&self, id: TaskId) {
        self.created.lock().push(id);
    }

    fn on_deleted(&self, id: TaskId) {
        self.deleted.lock().push(id);
    }

    fn on_status_changed(&self, id: TaskId, status: TaskStatus) {
        self.statuses.lock().push((id, status));
    }

    fn on_progress_changed(&self, id: TaskId, current: u64, total: Option<u64>) {
        self.progress.lock().push((id, current, total));
    }
}
