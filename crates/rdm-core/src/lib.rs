//! RDM Core - Resumable Download Engine
//!
//! This crate provides the download engine behind RDM. It runs any number of
//! independent HTTP downloads, each resumable across restarts, and exposes
//! them through the [`RdmCore`] facade.
//!
//! Facade operations never fail loudly: dispatch failures are reported with
//! a `-1` sentinel and the details land in the task's persisted status and in
//! the event stream.

pub mod engine;
mod error;
mod id;
mod storage;

pub use engine::{
    ConnectivityMonitor, Connectivity, DownloadObserver, MemoryTaskStore, ObserverId, RunReport,
    SqliteTaskStore, TaskStore,
};
pub use error::*;
pub use id::IdGenerator;
pub use storage::*;

use engine::{event_channel, http_client, EventSender, ObserverRegistry, TaskRegistry, WorkerContext};
use parking_lot::Mutex;
use rdm_types::{CoreEvent, NewTask, Settings, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Returned by facade operations that could not be dispatched
pub const DISPATCH_FAILED: i64 = -1;

/// The main RDM engine instance
pub struct RdmCore {
    store: Arc<dyn TaskStore>,
    settings: Arc<Settings>,
    registry: TaskRegistry,
    events: EventSender,
    observers: Arc<ObserverRegistry>,
    /// Post-persistence event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    ids: IdGenerator,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RdmCore {
    /// Open the engine rooted at `data_dir`: settings from `settings.json`,
    /// tasks from `tasks.db`.
    ///
    /// Tasks a previous process left running or pending are marked paused.
    pub async fn new(data_dir: PathBuf) -> Result<Self, RdmError> {
        let storage = Storage::new(data_dir).await?;
        let settings = storage.load_settings().await?;
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(storage.database_path()).await?);

        let recovered = recover_interrupted(store.as_ref()).await?;
        if recovered > 0 {
            info!("Marked {} interrupted task(s) as paused", recovered);
        }

        Self::with_store(store, settings, Arc::new(ConnectivityMonitor::new()))
    }

    /// Compose an engine from explicit parts. Must be called inside a Tokio runtime.
    pub fn with_store(
        store: Arc<dyn TaskStore>,
        settings: Settings,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self, RdmError> {
        let settings = Arc::new(settings.validated());
        let client = http_client(&settings)?;

        let observers = Arc::new(ObserverRegistry::new());
        let (event_tx, _) = broadcast::channel(1000);
        let (events, dispatcher) = event_channel(store.clone(), observers.clone(), event_tx.clone());
        let dispatcher = dispatcher.spawn();

        let registry = TaskRegistry::new(
            WorkerContext {
                client,
                settings: settings.clone(),
                events: events.clone(),
                connectivity,
            },
            store.clone(),
        );

        Ok(Self {
            store,
            settings,
            registry,
            events,
            observers,
            event_tx,
            ids: IdGenerator::new(),
            dispatcher: Mutex::new(Some(dispatcher)),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn is_available(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire) && !self.events.is_closed()
    }

    // ========================================================================
    // Task Operations
    // ========================================================================

    /// Create a stopped task and return its id, or `-1`
    pub async fn create_task(
        &self,
        url: &str,
        file_name: &str,
        save_path: impl AsRef<Path>,
        mime_type: Option<&str>,
    ) -> TaskId {
        let mut task = NewTask::new(url, file_name, save_path.as_ref());
        task.mime_type = mime_type.map(str::to_string);
        self.create_task_with(task).await
    }

    /// Create a stopped task from a full description and return its id, or `-1`
    pub async fn create_task_with(&self, mut task: NewTask) -> TaskId {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }

        task.mime_type = task.mime_type.as_deref().and_then(engine::sanitize_mime_type);
        let record = TaskRecord::new(self.ids.next_id(), task);
        let id = record.id;

        if let Err(e) = self.store.insert(&record).await {
            warn!(task_id = id, "Failed to create task: {}", e);
            return DISPATCH_FAILED;
        }

        self.events.emit(CoreEvent::TaskCreated { id });
        self.events.emit(CoreEvent::StatusChanged {
            id,
            status: TaskStatus::Stopped,
        });
        info!(task_id = id, "Created task");
        id
    }

    /// Start (or resume) a task. Returns `0` on dispatch, `-1` otherwise.
    pub async fn start_task(&self, id: TaskId) -> i64 {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }

        self.events.emit(CoreEvent::StatusChanged {
            id,
            status: TaskStatus::StartPending,
        });
        // The snapshot handed to the worker must include every earlier event
        if self.events.sync().await.is_err() {
            return DISPATCH_FAILED;
        }

        match self.registry.start(id).await {
            Ok(()) => 0,
            Err(RdmError::NotFound(_)) => {
                debug!(task_id = id, "Cannot start unknown or deleted task");
                DISPATCH_FAILED
            }
            Err(e) => {
                warn!(task_id = id, "Failed to start task: {}", e);
                DISPATCH_FAILED
            }
        }
    }

    /// Ask a running task to pause. Returns `0` on dispatch, `-1` otherwise.
    pub async fn pause_task(&self, id: TaskId) -> i64 {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }
        sentinel(id, "pause", self.registry.pause(id).await)
    }

    /// Ask a running task to cancel. Returns `0` on dispatch, `-1` otherwise.
    pub async fn cancel_task(&self, id: TaskId) -> i64 {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }
        sentinel(id, "cancel", self.registry.cancel(id).await)
    }

    /// Stop a task's worker at once and remove the task, optionally with its
    /// file. Returns `0` on dispatch, `-1` when no worker was ever bound.
    pub async fn delete_task(&self, id: TaskId, delete_file: bool) -> i64 {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }

        let path = if delete_file {
            self.destination_of(id).await
        } else {
            None
        };

        let result = self.registry.delete(id, path.as_deref()).await;
        if result.is_ok() {
            self.events.emit(CoreEvent::TaskRemoved { id });
            if self.events.sync().await.is_err() {
                return DISPATCH_FAILED;
            }
        }
        sentinel(id, "delete", result)
    }

    /// Remove a task that has no live worker, optionally with its file.
    /// Returns `0` on success, `-1` when the task is unknown or running.
    pub async fn remove_task(&self, id: TaskId, delete_file: bool) -> i64 {
        if !self.is_available() {
            return DISPATCH_FAILED;
        }

        if !self.registry.retire(id).await {
            debug!(task_id = id, "Refusing to remove a running task");
            return DISPATCH_FAILED;
        }

        let Some(record) = self.get_task(id).await else {
            return DISPATCH_FAILED;
        };

        if delete_file {
            match tokio::fs::remove_file(&record.destination_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = id, "Failed to delete file: {}", e.kind()),
            }
        }

        self.events.emit(CoreEvent::TaskRemoved { id });
        if self.events.sync().await.is_err() {
            return DISPATCH_FAILED;
        }
        info!(task_id = id, "Removed task");
        0
    }

    async fn destination_of(&self, id: TaskId) -> Option<PathBuf> {
        self.get_task(id).await.map(|record| record.destination_path)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_task(&self, id: TaskId) -> Option<TaskRecord> {
        match self.store.get_by_id(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(task_id = id, "Failed to load task: {}", e);
                None
            }
        }
    }

    pub async fn list_tasks(&self) -> Vec<TaskRecord> {
        match self.store.list_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to list tasks: {}", e);
                Vec::new()
            }
        }
    }

    /// Wait for the task's current worker to finish and its events to land.
    ///
    /// Returns `None` when no worker is bound or it was aborted.
    pub async fn wait_task(&self, id: TaskId) -> Option<RunReport> {
        let report = self.registry.wait(id).await.ok()?;
        self.events.sync().await.ok()?;
        Some(report)
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register an observer; registering the same one again is a no-op
    pub fn add_observer(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Subscribe to core events, delivered after they are persisted
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Pause every worker, wait for them, then stop the event dispatcher.
    ///
    /// Every facade call made afterwards returns `-1`.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down engine");
        self.registry.pause_all_and_drain().await;

        let _ = self.events.sync().await;
        self.events.shutdown();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!("Event dispatcher failed: {}", e);
            }
        }
    }
}

fn sentinel(id: TaskId, action: &str, result: Result<(), RdmError>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!(task_id = id, "Cannot {} task: {}", action, e);
            DISPATCH_FAILED
        }
    }
}

/// Mark records left running or pending by a previous process as paused
async fn recover_interrupted(store: &dyn TaskStore) -> Result<usize, RdmError> {
    let mut recovered = 0;
    for record in store.list_all().await? {
        if record.status == TaskStatus::Running || record.status.is_pending() {
            store
                .update_fields(record.id, &TaskUpdate::status(TaskStatus::Paused))
                .await?;
            recovered += 1;
        }
    }
    Ok(recovered)
}
