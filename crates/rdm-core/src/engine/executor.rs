//! Transfer executor - drives one task from "about to run" to a final status
//!
//! A run is a single pass over:
//! 1. resume setup (decide between a fresh download and a continuation)
//! 2. connectivity check, request construction and send
//! 3. response classification (503, redirects, unexpected codes)
//! 4. header processing (skipped when continuing)
//! 5. the streamed read/write loop, which polls the control flag every buffer
//!
//! Redirects restart the pass from step 1 inside the same run. Everything
//! else ends the run with a final status. Cleanup and the final status event
//! happen on every path, including a panic inside the run.

use crate::engine::connectivity::Connectivity;
use crate::engine::disk;
use crate::engine::events::EventSender;
use crate::engine::response::{
    classify_unexpected_status, compute_retry_after, is_permanent_redirect, is_redirect,
    resolve_location, sanitize_mime_type,
};
use crate::error::RdmError;
use futures::{FutureExt, StreamExt};
use rdm_types::{ControlFlag, CoreEvent, Settings, TaskId, TaskRecord, TaskStatus};
use reqwest::header::{
    HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MATCH, LOCATION, RANGE, RETRY_AFTER,
    TRANSFER_ENCODING, USER_AGENT,
};
use reqwest::{redirect, Client, RequestBuilder, Response};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

/// Build the HTTP client shared by all workers.
///
/// Redirects are never followed by the client; the executor handles them so
/// it can count them and persist permanent moves.
pub fn http_client(settings: &Settings) -> Result<Client, RdmError> {
    Client::builder()
        .user_agent(settings.user_agent.as_str())
        .redirect(redirect::Policy::none())
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .read_timeout(Duration::from_secs(settings.read_timeout_secs))
        .build()
        .map_err(RdmError::from)
}

/// Stored once the worker has committed to its final status
const SEALED: u8 = u8::MAX;

/// Shared control flag of one task.
///
/// The worker seals the handle when its run can no longer change course.
/// Requests against a sealed handle fail, so a caller never mistakes a run
/// that is already wrapping up for one that will honor its signal.
#[derive(Debug, Clone)]
pub struct ControlHandle(Arc<AtomicU8>);

impl ControlHandle {
    pub fn new(flag: ControlFlag) -> Self {
        Self(Arc::new(AtomicU8::new(flag.code())))
    }

    /// Store `flag` unless the handle is sealed. Returns whether it was stored.
    pub fn request(&self, flag: ControlFlag) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SEALED).then_some(flag.code())
            })
            .is_ok()
    }

    /// Take a pending pause or cancel, sealing the handle in the same step
    pub fn take_stop(&self) -> Option<ControlFlag> {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ControlFlag::from_code(current) {
                    Some(ControlFlag::Paused | ControlFlag::Cancel) => Some(SEALED),
                    _ => None,
                }
            })
            .ok()?;
        ControlFlag::from_code(previous)
    }

    pub fn seal(&self) {
        self.0.store(SEALED, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.0.load(Ordering::Acquire) == SEALED
    }
}

/// Outcome of one worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Advisory delay before the next attempt, set for 503 responses
    pub retry_after: Option<Duration>,
}

/// Ends the run with a final status.
///
/// The message is logged, so it must never contain the URI, request headers
/// or the destination file name.
#[derive(Debug)]
struct StopRequest {
    status: TaskStatus,
    message: String,
    retry_after: Option<Duration>,
}

#[derive(Debug)]
enum Interrupt {
    /// Restart the pass with the updated source URI
    Retry,
    Stop(StopRequest),
}

impl Interrupt {
    fn stop(status: TaskStatus, message: impl Into<String>) -> Self {
        Interrupt::Stop(StopRequest {
            status,
            message: message.into(),
            retry_after: None,
        })
    }
}

impl From<io::Error> for Interrupt {
    fn from(err: io::Error) -> Self {
        Interrupt::stop(TaskStatus::UnknownError, format!("unexpected I/O error: {}", err.kind()))
    }
}

/// Clears the active flag when the run ends or its future is dropped
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything a worker needs besides its record
#[derive(Clone)]
pub struct WorkerContext {
    pub client: Client,
    pub settings: Arc<Settings>,
    pub events: EventSender,
    pub connectivity: Arc<dyn Connectivity>,
}

/// Runs the HTTP transfer of a single task
pub struct TransferExecutor {
    record: TaskRecord,
    ctx: WorkerContext,
    control: ControlHandle,
    active: Arc<AtomicBool>,
    /// Open destination, `None` until headers are processed
    file: Option<File>,
    redirect_count: u32,
    /// Resuming a validly resumable partial file
    continuing: bool,
    /// Length the body must have, when known
    expected_length: Option<u64>,
    last_progress: Option<Instant>,
    reported_bytes: Option<u64>,
}

impl TransferExecutor {
    /// Create an executor for `record`. The caller marks `active` before
    /// spawning; the run clears it on exit.
    pub fn new(
        record: TaskRecord,
        ctx: WorkerContext,
        control: ControlHandle,
        active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            record,
            ctx,
            control,
            active,
            file: None,
            redirect_count: 0,
            continuing: false,
            expected_length: None,
            last_progress: None,
            reported_bytes: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.record.id
    }

    /// Run the transfer to its final status
    pub async fn run(mut self) -> RunReport {
        let id = self.record.id;
        let _active = ActiveGuard(self.active.clone());

        info!(task_id = id, "Starting transfer");
        self.emit(CoreEvent::StatusChanged {
            id,
            status: TaskStatus::Running,
        });

        let outcome = AssertUnwindSafe(self.execute()).catch_unwind().await;
        // Signals arriving from here on can't change the outcome
        self.control.seal();
        let (status, retry_after) = match outcome {
            Ok(Ok(())) => {
                info!(task_id = id, bytes = self.record.bytes_so_far, "Transfer complete");
                (TaskStatus::Success, None)
            }
            Ok(Err(stop)) => {
                if stop.status.is_error() {
                    error!(task_id = id, status = %stop.status, "Transfer stopped: {}", stop.message);
                } else {
                    info!(task_id = id, status = %stop.status, "Transfer stopped: {}", stop.message);
                }
                (stop.status, stop.retry_after)
            }
            Err(_) => {
                error!(task_id = id, "Transfer worker panicked");
                (TaskStatus::UnknownError, None)
            }
        };

        self.cleanup(status).await;

        RunReport {
            id,
            status,
            retry_after,
        }
    }

    async fn execute(&mut self) -> Result<(), StopRequest> {
        loop {
            match self.execute_download().await {
                Ok(()) => break,
                Err(Interrupt::Retry) => {
                    debug!(task_id = self.record.id, redirects = self.redirect_count, "Restarting after redirect");
                }
                Err(Interrupt::Stop(stop)) => return Err(stop),
            }
        }

        self.finalize_destination().await;
        Ok(())
    }

    /// One pass: setup, request, response handling and transfer
    async fn execute_download(&mut self) -> Result<(), Interrupt> {
        self.file = None;
        self.continuing = false;
        self.expected_length = None;
        self.record.bytes_so_far = 0;

        self.setup_destination().await?;
        let request = self.build_request();

        // Check just before sending so an unusable connection is never tried
        self.check_connectivity()?;

        let response = self.send_request(request).await?;
        self.handle_exceptional_status(&response)?;
        self.process_response_headers(&response).await?;
        self.transfer_data(response).await
    }

    // ========================================================================
    // Setup and request
    // ========================================================================

    /// Decide between a fresh download and a continuation of a partial file
    async fn setup_destination(&mut self) -> Result<(), Interrupt> {
        let path = &self.record.destination_path;

        let length = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Interrupt::stop(
                    TaskStatus::FileError,
                    format!("while checking destination file: {}", e.kind()),
                ))
            }
        };

        if length == 0 {
            // Nothing was written yet, start over
            let _ = tokio::fs::remove_file(path).await;
            return Ok(());
        }

        if self.record.resumption_tag.is_none() {
            return Err(Interrupt::stop(
                TaskStatus::CannotResume,
                "trying to resume a download that can't be resumed",
            ));
        }

        if self.record.total_bytes.is_some_and(|total| length > total) {
            return Err(Interrupt::stop(
                TaskStatus::CannotResume,
                "partial file is larger than the announced size",
            ));
        }

        self.record.bytes_so_far = length;
        self.expected_length = self.record.total_bytes;
        self.continuing = true;
        debug!(task_id = self.record.id, offset = length, "Resuming partial file");
        Ok(())
    }

    fn build_request(&self) -> RequestBuilder {
        let user_agent = self
            .record
            .user_agent
            .as_deref()
            .unwrap_or(self.ctx.settings.user_agent.as_str());

        let mut request = self
            .ctx
            .client
            .get(self.record.source_uri.as_str())
            .header(USER_AGENT, user_agent);

        for (name, value) in &self.record.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if self.continuing {
            if let Some(tag) = &self.record.resumption_tag {
                request = request.header(IF_MATCH, tag.as_str());
            }
            request = request.header(RANGE, format!("bytes={}-", self.record.bytes_so_far));
        }

        request
    }

    fn check_connectivity(&self) -> Result<(), Interrupt> {
        if self.ctx.connectivity.is_network_available() {
            Ok(())
        } else {
            Err(Interrupt::stop(TaskStatus::WaitingForNetwork, "no network usable"))
        }
    }

    async fn send_request(&self, request: RequestBuilder) -> Result<Response, Interrupt> {
        match request.send().await {
            Ok(response) => Ok(response),
            Err(e) if e.is_builder() => Err(Interrupt::stop(
                TaskStatus::HttpDataError,
                format!("while trying to build request: {}", e.without_url()),
            )),
            Err(e) => Err(Interrupt::stop(
                self.final_status_for_http_error(),
                format!("while trying to execute request: {}", e.without_url()),
            )),
        }
    }

    // ========================================================================
    // Response handling
    // ========================================================================

    /// Handle anything other than the expected 200/206
    fn handle_exceptional_status(&mut self, response: &Response) -> Result<(), Interrupt> {
        let code = response.status().as_u16();

        if code == 503 {
            return Err(self.service_unavailable(response.headers()));
        }

        if is_redirect(code) {
            self.handle_redirect(response.headers(), code)?;
        }

        let expected = if self.continuing { 206 } else { 200 };
        if code != expected {
            return Err(Interrupt::stop(
                classify_unexpected_status(code, self.continuing),
                format!("http error {}", code),
            ));
        }

        Ok(())
    }

    fn service_unavailable(&self, headers: &HeaderMap) -> Interrupt {
        if self.record.failure_count >= self.ctx.settings.max_retries {
            return Interrupt::stop(
                TaskStatus::HttpDataError,
                "got 503 Service Unavailable, retry budget exhausted",
            );
        }

        let retry_after = compute_retry_after(
            header_str(headers, RETRY_AFTER.as_str()),
            &self.ctx.settings,
            &mut rand::thread_rng(),
        );

        Interrupt::Stop(StopRequest {
            status: TaskStatus::WaitingToRetry,
            message: format!(
                "got 503 Service Unavailable, will retry in {}s",
                retry_after.as_secs()
            ),
            retry_after: Some(retry_after),
        })
    }

    /// Follow a redirect within the same run.
    ///
    /// Returns `Ok` only when there is no `Location` header, leaving the
    /// response to the unexpected status classification.
    fn handle_redirect(&mut self, headers: &HeaderMap, code: u16) -> Result<(), Interrupt> {
        if self.redirect_count >= self.ctx.settings.max_redirects {
            return Err(Interrupt::stop(TaskStatus::TooManyRedirects, "too many redirects"));
        }

        let Some(location) = header_str(headers, LOCATION.as_str()) else {
            return Ok(());
        };

        let Some(target) = resolve_location(&self.record.source_uri, location) else {
            return Err(Interrupt::stop(
                TaskStatus::HttpDataError,
                "couldn't resolve redirect URI",
            ));
        };

        self.redirect_count += 1;
        debug!(task_id = self.record.id, code, "Redirected to {}", target);
        self.record.source_uri = target;

        if is_permanent_redirect(code) {
            // Future retries and resumes should go straight to the new location
            self.emit(CoreEvent::UriChanged {
                id: self.record.id,
                uri: self.record.source_uri.clone(),
            });
        }

        Err(Interrupt::Retry)
    }

    /// Capture metadata and open the destination.
    ///
    /// Resumed requests trust the metadata from the earlier run.
    async fn process_response_headers(&mut self, response: &Response) -> Result<(), Interrupt> {
        if self.continuing {
            let opened = OpenOptions::new()
                .append(true)
                .open(&self.record.destination_path)
                .await;
            self.file = Some(opened.map_err(|e| self.classify_write_error(&e, 0))?);
            return Ok(());
        }

        let headers = response.headers();

        if self.record.mime_type.is_none() {
            self.record.mime_type =
                header_str(headers, CONTENT_TYPE.as_str()).and_then(sanitize_mime_type);
        }

        self.record.resumption_tag = header_str(headers, ETAG.as_str()).map(str::to_string);

        // Content-Length is meaningless alongside Transfer-Encoding
        let transfer_encoding = header_str(headers, TRANSFER_ENCODING.as_str());
        if transfer_encoding.is_none() {
            if let Some(value) = header_str(headers, CONTENT_LENGTH.as_str()) {
                let length = value.trim().parse::<u64>().map_err(|_| {
                    Interrupt::stop(TaskStatus::HttpDataError, "invalid Content-Length header")
                })?;
                self.expected_length = Some(length);
            }
        }
        self.record.total_bytes = self.expected_length;

        debug!(
            task_id = self.record.id,
            content_length = ?self.expected_length,
            transfer_encoding = ?transfer_encoding,
            mime_type = ?self.record.mime_type,
            has_etag = self.record.resumption_tag.is_some(),
            "Read response headers"
        );

        let chunked = transfer_encoding.is_some_and(|te| {
            te.split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        });
        if self.expected_length.is_none() && !chunked {
            return Err(Interrupt::stop(
                TaskStatus::HttpDataError,
                "can't know size of download, giving up",
            ));
        }

        let opened = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.record.destination_path)
            .await;
        self.file = Some(opened.map_err(|e| self.classify_write_error(&e, 0))?);

        self.emit(CoreEvent::NetworkMetadataChanged {
            id: self.record.id,
            resumption_tag: self.record.resumption_tag.clone(),
            mime_type: self.record.mime_type.clone(),
        });
        self.report_progress(true);

        // Check again now that the size is known
        self.check_connectivity()
    }

    // ========================================================================
    // Transfer loop
    // ========================================================================

    async fn transfer_data(&mut self, response: Response) -> Result<(), Interrupt> {
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::other(e.without_url())));
        let reader = StreamReader::new(body);
        tokio::pin!(reader);

        let mut buffer = vec![0u8; self.ctx.settings.buffer_size.max(1)];

        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => return Err(self.read_failure(&e)),
            };

            if read == 0 {
                return self.finish_stream().await;
            }

            if let Some(total) = self.record.total_bytes {
                if self.record.bytes_so_far + read as u64 > total {
                    return Err(Interrupt::stop(
                        TaskStatus::HttpDataError,
                        "server sent more data than announced",
                    ));
                }
            }

            self.write_to_destination(&buffer[..read]).await?;
            self.record.bytes_so_far += read as u64;

            self.report_progress(false);
            self.check_paused_or_canceled()?;
        }
    }

    /// End of body reached; make sure it was all of it
    async fn finish_stream(&mut self) -> Result<(), Interrupt> {
        if let Some(expected) = self.expected_length {
            if self.record.bytes_so_far != expected {
                return Err(if self.cannot_resume() {
                    Interrupt::stop(TaskStatus::CannotResume, "mismatched content length")
                } else {
                    Interrupt::stop(
                        self.final_status_for_http_error(),
                        "closed socket before end of file",
                    )
                });
            }
        }

        let flushed = match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        };
        flushed.map_err(|e| self.classify_write_error(&e, 0))
    }

    fn read_failure(&self, err: &io::Error) -> Interrupt {
        if self.cannot_resume() {
            Interrupt::stop(
                TaskStatus::CannotResume,
                format!("while reading response: {}, can't resume without ETag", err),
            )
        } else {
            Interrupt::stop(
                self.final_status_for_http_error(),
                format!("while reading response: {}", err),
            )
        }
    }

    async fn write_to_destination(&mut self, data: &[u8]) -> Result<(), Interrupt> {
        if self.file.is_none() {
            let opened = OpenOptions::new()
                .append(true)
                .open(&self.record.destination_path)
                .await;
            self.file = Some(opened.map_err(|e| self.classify_write_error(&e, data.len() as u64))?);
        }

        let written = match self.file.as_mut() {
            Some(file) => file.write_all(data).await,
            None => Ok(()),
        };
        written.map_err(|e| self.classify_write_error(&e, data.len() as u64))
    }

    /// Classify a failed destination write by its cause
    fn classify_write_error(&self, err: &io::Error, needed: u64) -> Interrupt {
        let path = &self.record.destination_path;

        if !disk::storage_available(path) {
            return Interrupt::stop(
                TaskStatus::DeviceNotFound,
                "destination storage unavailable while writing destination file",
            );
        }

        let out_of_space = disk::is_out_of_space(err)
            || disk::available_bytes(path).is_some_and(|available| available < needed);
        if out_of_space {
            return Interrupt::stop(
                TaskStatus::InsufficientSpace,
                "insufficient space while writing destination file",
            );
        }

        Interrupt::stop(
            TaskStatus::FileError,
            format!("while writing destination file: {}", err.kind()),
        )
    }

    fn check_paused_or_canceled(&self) -> Result<(), Interrupt> {
        match self.control.take_stop() {
            None | Some(ControlFlag::Run) => Ok(()),
            Some(ControlFlag::Paused) => Err(Interrupt::stop(TaskStatus::Paused, "download paused by owner")),
            Some(ControlFlag::Cancel) => Err(Interrupt::stop(TaskStatus::Canceled, "download canceled")),
        }
    }

    /// A partial file without a tag can't be validated on resume
    fn cannot_resume(&self) -> bool {
        self.record.bytes_so_far > 0 && self.record.resumption_tag.is_none()
    }

    fn final_status_for_http_error(&self) -> TaskStatus {
        if !self.ctx.connectivity.is_network_available() {
            TaskStatus::WaitingForNetwork
        } else if self.record.failure_count < self.ctx.settings.max_retries {
            TaskStatus::WaitingToRetry
        } else {
            warn!(task_id = self.record.id, "Reached max retries");
            TaskStatus::HttpDataError
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Make the file readable and push it to storage. Failures are logged only.
    async fn finalize_destination(&mut self) {
        let id = self.record.id;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o644);
            if let Err(e) =
                tokio::fs::set_permissions(&self.record.destination_path, permissions).await
            {
                warn!(task_id = id, "Failed to set file permissions: {}", e.kind());
            }
        }

        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all().await {
                warn!(task_id = id, "Failed to sync destination file: {}", e.kind());
            }
        }
    }

    /// Runs on every exit path
    async fn cleanup(&mut self, status: TaskStatus) {
        let id = self.record.id;

        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(task_id = id, "Failed to flush destination file: {}", e.kind());
            }
        }

        if status.is_error() {
            match tokio::fs::remove_file(&self.record.destination_path).await {
                Ok(()) => debug!(task_id = id, "Removed partial file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = id, "Failed to remove partial file: {}", e.kind()),
            }
        }

        if self.reported_bytes != Some(self.record.bytes_so_far) {
            self.report_progress(true);
        }

        let failure_count = match status {
            TaskStatus::WaitingToRetry => Some(self.record.failure_count.saturating_add(1)),
            TaskStatus::Success if self.record.failure_count != 0 => Some(0),
            _ => None,
        };
        if let Some(failure_count) = failure_count {
            self.record.failure_count = failure_count;
            self.emit(CoreEvent::FailureCountChanged { id, failure_count });
        }

        self.record.status = status;
        self.emit(CoreEvent::StatusChanged { id, status });
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Throttled progress report; `force` bypasses the throttle
    fn report_progress(&mut self, force: bool) {
        let now = Instant::now();
        let interval = Duration::from_millis(self.ctx.settings.min_progress_time_ms);
        let due = self
            .last_progress
            .map_or(true, |last| now.duration_since(last) >= interval);

        if force || due {
            self.emit(CoreEvent::Progress {
                id: self.record.id,
                bytes_so_far: self.record.bytes_so_far,
                total_bytes: self.record.total_bytes,
            });
            self.last_progress = Some(now);
            self.reported_bytes = Some(self.record.bytes_so_far);
        }
    }

    fn emit(&self, event: CoreEvent) {
        if !self.ctx.events.emit(event) {
            debug!(task_id = self.record.id, "Event channel closed, dropping event");
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
