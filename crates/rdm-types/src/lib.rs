//! Shared types for RDM
//!
//! This crate contains the data structures shared between the engine,
//! the CLI and anything else that observes download tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifier of a download task
pub type TaskId = i64;

/// Bitmask value meaning "every network type is allowed"
pub const ALL_NETWORK_TYPES: u32 = !0;

// ============================================================================
// Status Types
// ============================================================================

/// Status of a download task.
///
/// Every status has a stable integer code. Codes in `[400, 600)` are errors;
/// codes in `[200, 300)` or `[400, 600)` are completed. Any HTTP error code
/// without a dedicated variant is carried verbatim in [`TaskStatus::Http`],
/// use [`TaskStatus::from_code`] to build one so named codes stay named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum TaskStatus {
    StartPending,
    CancelPending,
    DeletePending,
    PausePending,
    Running,
    /// Paused by the user
    Paused,
    /// Stopped by the owner, i.e. never started
    Stopped,
    WaitingToRetry,
    WaitingForNetwork,
    QueuedForNetworkType,
    Success,
    NotAcceptable,
    FileAlreadyExists,
    /// Some possibly transient error occurred, but the download can't be resumed
    CannotResume,
    Canceled,
    UnknownError,
    FileError,
    UnhandledRedirect,
    UnhandledHttpCode,
    HttpDataError,
    TooManyRedirects,
    InsufficientSpace,
    DeviceNotFound,
    /// An HTTP error status returned by the server
    Http(u16),
}

impl TaskStatus {
    /// Integer code of this status
    pub fn code(self) -> u16 {
        match self {
            TaskStatus::StartPending => 190,
            TaskStatus::CancelPending => 191,
            TaskStatus::DeletePending => 192,
            TaskStatus::PausePending => 193,
            TaskStatus::Running => 194,
            TaskStatus::Paused => 195,
            TaskStatus::Stopped => 196,
            TaskStatus::WaitingToRetry => 197,
            TaskStatus::WaitingForNetwork => 198,
            TaskStatus::QueuedForNetworkType => 199,
            TaskStatus::Success => 200,
            TaskStatus::NotAcceptable => 406,
            TaskStatus::FileAlreadyExists => 488,
            TaskStatus::CannotResume => 489,
            TaskStatus::Canceled => 490,
            TaskStatus::UnknownError => 491,
            TaskStatus::FileError => 492,
            TaskStatus::UnhandledRedirect => 493,
            TaskStatus::UnhandledHttpCode => 494,
            TaskStatus::HttpDataError => 495,
            TaskStatus::TooManyRedirects => 497,
            TaskStatus::InsufficientSpace => 498,
            TaskStatus::DeviceNotFound => 499,
            TaskStatus::Http(code) => code,
        }
    }

    /// Map an integer code back to a status.
    ///
    /// Returns `None` for codes that are neither a known status nor an HTTP error.
    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            190 => TaskStatus::StartPending,
            191 => TaskStatus::CancelPending,
            192 => TaskStatus::DeletePending,
            193 => TaskStatus::PausePending,
            194 => TaskStatus::Running,
            195 => TaskStatus::Paused,
            196 => TaskStatus::Stopped,
            197 => TaskStatus::WaitingToRetry,
            198 => TaskStatus::WaitingForNetwork,
            199 => TaskStatus::QueuedForNetworkType,
            200 => TaskStatus::Success,
            406 => TaskStatus::NotAcceptable,
            488 => TaskStatus::FileAlreadyExists,
            489 => TaskStatus::CannotResume,
            490 => TaskStatus::Canceled,
            491 => TaskStatus::UnknownError,
            492 => TaskStatus::FileError,
            493 => TaskStatus::UnhandledRedirect,
            494 => TaskStatus::UnhandledHttpCode,
            495 => TaskStatus::HttpDataError,
            497 => TaskStatus::TooManyRedirects,
            498 => TaskStatus::InsufficientSpace,
            499 => TaskStatus::DeviceNotFound,
            400..=599 => TaskStatus::Http(code),
            _ => return None,
        };
        Some(status)
    }

    /// Whether the status is an error (4xx or 5xx)
    pub fn is_error(self) -> bool {
        (400..600).contains(&self.code())
    }

    /// Whether the task has completed, either with success or with an error
    pub fn is_completed(self) -> bool {
        let code = self.code();
        (200..300).contains(&code) || (400..600).contains(&code)
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Transitional marker written before a control signal takes effect
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            TaskStatus::StartPending
                | TaskStatus::PausePending
                | TaskStatus::CancelPending
                | TaskStatus::DeletePending
        )
    }

    /// Waiting for an external scheduler to start the task again
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            TaskStatus::WaitingToRetry
                | TaskStatus::WaitingForNetwork
                | TaskStatus::QueuedForNetworkType
        )
    }

    /// Whether a worker run can end with this status
    pub fn ends_run(self) -> bool {
        self.is_completed() || self.is_waiting() || self == TaskStatus::Paused
    }
}

impl From<TaskStatus> for u16 {
    fn from(status: TaskStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for TaskStatus {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        TaskStatus::from_code(code).ok_or_else(|| format!("Invalid task status code: {}", code))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::StartPending => "start pending",
            TaskStatus::CancelPending => "cancel pending",
            TaskStatus::DeletePending => "delete pending",
            TaskStatus::PausePending => "pause pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
            TaskStatus::WaitingToRetry => "waiting to retry",
            TaskStatus::WaitingForNetwork => "waiting for network",
            TaskStatus::QueuedForNetworkType => "queued for network type",
            TaskStatus::Success => "success",
            TaskStatus::NotAcceptable => "not acceptable",
            TaskStatus::FileAlreadyExists => "file already exists",
            TaskStatus::CannotResume => "cannot resume",
            TaskStatus::Canceled => "canceled",
            TaskStatus::UnknownError => "unknown error",
            TaskStatus::FileError => "file error",
            TaskStatus::UnhandledRedirect => "unhandled redirect",
            TaskStatus::UnhandledHttpCode => "unhandled http code",
            TaskStatus::HttpDataError => "http data error",
            TaskStatus::TooManyRedirects => "too many redirects",
            TaskStatus::InsufficientSpace => "insufficient space",
            TaskStatus::DeviceNotFound => "device not found",
            TaskStatus::Http(code) => return write!(f, "http {}", code),
        };
        f.write_str(name)
    }
}

/// Signal an external actor sets to steer a running worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ControlFlag {
    /// The task is allowed to run
    #[default]
    Run,
    /// The task must pause at the first opportunity
    Paused,
    /// The task must stop and discard its partial file at the first opportunity
    Cancel,
}

impl ControlFlag {
    pub fn code(self) -> u8 {
        match self {
            ControlFlag::Run => 0,
            ControlFlag::Paused => 1,
            ControlFlag::Cancel => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControlFlag::Run),
            1 => Some(ControlFlag::Paused),
            2 => Some(ControlFlag::Cancel),
            _ => None,
        }
    }
}

impl From<ControlFlag> for u8 {
    fn from(flag: ControlFlag) -> Self {
        flag.code()
    }
}

impl TryFrom<u8> for ControlFlag {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        ControlFlag::from_code(code).ok_or_else(|| format!("Invalid control flag: {}", code))
    }
}

// ============================================================================
// Task Types
// ============================================================================

/// Persisted description of one download task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Where the content is fetched from; follows permanent redirects
    pub source_uri: String,
    pub file_name: String,
    /// Full path of the output file
    pub destination_path: PathBuf,
    /// Lowercase MIME type without parameters
    pub mime_type: Option<String>,
    /// Server validator (ETag) required to resume a partial file
    pub resumption_tag: Option<String>,
    /// Total size, `None` until response headers have been read
    pub total_bytes: Option<u64>,
    pub bytes_so_far: u64,
    pub status: TaskStatus,
    pub control: ControlFlag,
    /// Consecutive retryable failures
    pub failure_count: u32,
    /// Overrides the configured user agent
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Extra headers sent with every request for this task
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
    /// Reserved: not enforced by the engine
    #[serde(default = "default_network_types")]
    pub allowed_network_types: u32,
    /// Reserved: not enforced by the engine
    #[serde(default)]
    pub bypass_recommended_size_limit: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

fn default_network_types() -> u32 {
    ALL_NETWORK_TYPES
}

impl TaskRecord {
    /// Build a fresh, never started record
    pub fn new(id: TaskId, task: NewTask) -> Self {
        let now = Utc::now();
        let destination_path = task.save_path.join(&task.file_name);
        let mime_type = task.mime_type.filter(|m| !m.trim().is_empty());

        Self {
            id,
            source_uri: task.url,
            file_name: task.file_name,
            destination_path,
            mime_type,
            resumption_tag: None,
            total_bytes: None,
            bytes_so_far: 0,
            status: TaskStatus::Stopped,
            control: ControlFlag::Run,
            failure_count: 0,
            user_agent: task.user_agent,
            request_headers: task.request_headers,
            allowed_network_types: ALL_NETWORK_TYPES,
            bypass_recommended_size_limit: false,
            created_at: now,
            last_modified: now,
        }
    }

    /// Progress in percent, 0 when the size is unknown
    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.bytes_so_far as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Input for creating a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    pub file_name: String,
    /// Directory the file is written into
    pub save_path: PathBuf,
    pub mime_type: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
}

impl NewTask {
    pub fn new(url: impl Into<String>, file_name: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            file_name: file_name.into(),
            save_path: save_path.into(),
            ..Default::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }
}

/// Partial update of a task record. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub source_uri: Option<String>,
    pub mime_type: Option<String>,
    /// `Some(None)` clears a stale tag
    pub resumption_tag: Option<Option<String>>,
    pub total_bytes: Option<Option<u64>>,
    pub bytes_so_far: Option<u64>,
    pub status: Option<TaskStatus>,
    pub control: Option<ControlFlag>,
    pub failure_count: Option<u32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(bytes_so_far: u64, total_bytes: Option<u64>) -> Self {
        Self {
            bytes_so_far: Some(bytes_so_far),
            total_bytes: Some(total_bytes),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }

    /// Apply the set fields to `record`
    pub fn apply_to(&self, record: &mut TaskRecord) {
        if let Some(uri) = &self.source_uri {
            record.source_uri = uri.clone();
        }
        if let Some(mime_type) = &self.mime_type {
            record.mime_type = Some(mime_type.clone());
        }
        if let Some(tag) = &self.resumption_tag {
            record.resumption_tag = tag.clone();
        }
        if let Some(total) = self.total_bytes {
            record.total_bytes = total;
        }
        if let Some(bytes) = self.bytes_so_far {
            record.bytes_so_far = bytes;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(control) = self.control {
            record.control = control;
        }
        if let Some(count) = self.failure_count {
            record.failure_count = count;
        }
        record.last_modified = Utc::now();
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub default_save_path: PathBuf,
    /// Retry budget for 503 responses and interrupted transfers
    pub max_retries: u32,
    /// Lower bound for a server supplied Retry-After, in seconds
    pub min_retry_after_secs: u64,
    /// Upper bound for a server supplied Retry-After, in seconds
    pub max_retry_after_secs: u64,
    /// Redirects followed within one run (never more than 7)
    pub max_redirects: u32,
    /// Size of the read buffer used to stream the response body
    pub buffer_size: usize,
    /// Minimum time between two progress notifications, in milliseconds
    pub min_progress_time_ms: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

/// Hard ceiling for [`Settings::max_redirects`]
pub const REDIRECT_CEILING: u32 = 7;

impl Settings {
    /// Clamp values to their allowed ranges
    pub fn validated(mut self) -> Self {
        self.max_redirects = self.max_redirects.min(REDIRECT_CEILING);
        self.buffer_size = self.buffer_size.max(1);
        if self.max_retry_after_secs < self.min_retry_after_secs {
            self.max_retry_after_secs = self.min_retry_after_secs;
        }
        self
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_save_path: dirs::download_dir()
                .map(|p| p.join("RDM"))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_retries: 5,
            min_retry_after_secs: 30,
            max_retry_after_secs: 24 * 60 * 60,
            max_redirects: 5,
            buffer_size: 4096,
            min_progress_time_ms: 1000,
            user_agent: concat!("rdm/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events flowing from workers to the store and then to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TaskCreated {
        id: TaskId,
    },
    Progress {
        id: TaskId,
        bytes_so_far: u64,
        total_bytes: Option<u64>,
    },
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
    },
    UriChanged {
        id: TaskId,
        uri: String,
    },
    NetworkMetadataChanged {
        id: TaskId,
        resumption_tag: Option<String>,
        mime_type: Option<String>,
    },
    FailureCountChanged {
        id: TaskId,
        failure_count: u32,
    },
    ControlChanged {
        id: TaskId,
        control: ControlFlag,
    },
    TaskRemoved {
        id: TaskId,
    },
}

impl CoreEvent {
    /// Task this event belongs to
    pub fn task_id(&self) -> TaskId {
        match self {
            CoreEvent::TaskCreated { id }
            | CoreEvent::Progress { id, .. }
            | CoreEvent::StatusChanged { id, .. }
            | CoreEvent::UriChanged { id, .. }
            | CoreEvent::NetworkMetadataChanged { id, .. }
            | CoreEvent::FailureCountChanged { id, .. }
            | CoreEvent::ControlChanged { id, .. }
            | CoreEvent::TaskRemoved { id } => *id,
        }
    }

    /// Field update this event implies for the persisted record
    pub fn to_update(&self) -> Option<TaskUpdate> {
        let update = match self {
            CoreEvent::Progress {
                bytes_so_far,
                total_bytes,
                ..
            } => TaskUpdate::progress(*bytes_so_far, *total_bytes),
            CoreEvent::StatusChanged { status, .. } => TaskUpdate::status(*status),
            CoreEvent::UriChanged { uri, .. } => TaskUpdate {
                source_uri: Some(uri.clone()),
                ..Default::default()
            },
            CoreEvent::NetworkMetadataChanged {
                resumption_tag,
                mime_type,
                ..
            } => TaskUpdate {
                resumption_tag: Some(resumption_tag.clone()),
                mime_type: mime_type.clone(),
                ..Default::default()
            },
            CoreEvent::FailureCountChanged { failure_count, .. } => TaskUpdate {
                failure_count: Some(*failure_count),
                ..Default::default()
            },
            CoreEvent::ControlChanged { control, .. } => TaskUpdate {
                control: Some(*control),
                ..Default::default()
            },
            CoreEvent::TaskCreated { .. } | CoreEvent::TaskRemoved { .. } => return None,
        };
        Some(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip_named_variants() {
        for code in [190u16, 191, 192, 193, 194, 195, 196, 197, 198, 199, 200, 406, 488, 489, 490, 491, 492, 493, 494, 495, 497, 498, 499] {
            let status = TaskStatus::from_code(code).unwrap();
            assert!(!matches!(status, TaskStatus::Http(_)), "{} should be named", code);
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_unnamed_http_errors_are_carried_verbatim() {
        assert_eq!(TaskStatus::from_code(404), Some(TaskStatus::Http(404)));
        assert_eq!(TaskStatus::from_code(503), Some(TaskStatus::Http(503)));
        assert_eq!(TaskStatus::from_code(406), Some(TaskStatus::NotAcceptable));
        assert_eq!(TaskStatus::from_code(302), None);
        assert_eq!(TaskStatus::from_code(600), None);
    }

    #[test]
    fn test_status_classes() {
        assert!(TaskStatus::Success.is_completed());
        assert!(!TaskStatus::Success.is_error());
        assert!(TaskStatus::Canceled.is_error());
        assert!(TaskStatus::Http(500).is_completed());
        assert!(!TaskStatus::Paused.is_error());
        assert!(!TaskStatus::Paused.is_completed());
        assert!(!TaskStatus::WaitingToRetry.is_completed());
        assert!(TaskStatus::WaitingToRetry.ends_run());
        assert!(TaskStatus::Paused.ends_run());
        assert!(!TaskStatus::Running.ends_run());
        assert!(!TaskStatus::StartPending.ends_run());
        assert!(TaskStatus::DeletePending.is_pending());
        assert_ne!(TaskStatus::StartPending.code(), TaskStatus::Running.code());
    }

    #[test]
    fn test_status_serializes_as_code() {
        let json = serde_json::to_string(&TaskStatus::CannotResume).unwrap();
        assert_eq!(json, "489");
        let status: TaskStatus = serde_json::from_str("404").unwrap();
        assert_eq!(status, TaskStatus::Http(404));
        assert!(serde_json::from_str::<TaskStatus>("42").is_err());
    }

    #[test]
    fn test_new_record_is_stopped_with_unknown_size() {
        let record = TaskRecord::new(
            7,
            NewTask::new("http://example.com/a.bin", "a.bin", "/tmp/dl").with_mime_type(""),
        );
        assert_eq!(record.status, TaskStatus::Stopped);
        assert_eq!(record.total_bytes, None);
        assert_eq!(record.mime_type, None);
        assert_eq!(record.destination_path, PathBuf::from("/tmp/dl/a.bin"));
        assert_eq!(record.allowed_network_types, ALL_NETWORK_TYPES);
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut record = TaskRecord::new(1, NewTask::new("http://example.com/", "f", "/tmp"));
        let update = TaskUpdate {
            resumption_tag: Some(Some("\"abc\"".to_string())),
            total_bytes: Some(Some(10)),
            ..Default::default()
        };
        update.apply_to(&mut record);
        assert_eq!(record.resumption_tag.as_deref(), Some("\"abc\""));
        assert_eq!(record.total_bytes, Some(10));
        assert_eq!(record.source_uri, "http://example.com/");
        assert_eq!(record.status, TaskStatus::Stopped);
    }

    #[test]
    fn test_settings_clamp_redirects() {
        let settings = Settings {
            max_redirects: 12,
            ..Default::default()
        }
        .validated();
        assert_eq!(settings.max_redirects, REDIRECT_CEILING);
    }

    #[test]
    fn test_event_update_mapping() {
        let event = CoreEvent::UriChanged {
            id: 3,
            uri: "http://b/".to_string(),
        };
        assert_eq!(event.task_id(), 3);
        assert_eq!(event.to_update().unwrap().source_uri.as_deref(), Some("http://b/"));
        assert!(CoreEvent::TaskRemoved { id: 3 }.to_update().is_none());
    }
}
