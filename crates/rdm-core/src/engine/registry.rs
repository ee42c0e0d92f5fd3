//! Task registry - which worker, if any, is bound to each task
//!
//! The map is the only structure shared between workers and the facade. All
//! changes to a task's binding happen under the write lock, so two concurrent
//! `start` calls for the same id can never spawn two live workers. Deleted
//! ids keep a tombstone for the life of the engine; ids are never reused, so
//! a `start` racing a delete finds the tombstone and refuses.

use crate::engine::executor::{ControlHandle, RunReport, TransferExecutor, WorkerContext};
use crate::engine::persistence::TaskStore;
use crate::error::RdmError;
use rdm_types::{ControlFlag, CoreEvent, TaskId, TaskStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a spawned worker
struct WorkerBinding {
    handle: JoinHandle<RunReport>,
    control: ControlHandle,
    /// Set before spawning, cleared when the run ends or is aborted
    active: Arc<AtomicBool>,
    report: watch::Receiver<Option<RunReport>>,
}

impl WorkerBinding {
    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.handle.is_finished()
    }

    /// Wait for the run to end. `None` if the worker died without a report.
    async fn finished(&self) -> Option<RunReport> {
        let mut report = self.report.clone();
        let done = report.wait_for(Option::is_some).await.ok()?;
        done.clone()
    }
}

enum Slot {
    Bound(WorkerBinding),
    /// Deleted or removed; never bound again
    Retired,
}

/// Binds tasks to workers and routes control signals to them
pub struct TaskRegistry {
    bindings: RwLock<HashMap<TaskId, Slot>>,
    store: Arc<dyn TaskStore>,
    ctx: WorkerContext,
}

impl TaskRegistry {
    pub fn new(ctx: WorkerContext, store: Arc<dyn TaskStore>) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            store,
            ctx,
        }
    }

    /// Start a worker for task `id`, or let a live one continue.
    ///
    /// The record is loaded under the write lock, after any previous run of
    /// the task has delivered its final events.
    pub async fn start(&self, id: TaskId) -> Result<(), RdmError> {
        let mut bindings = self.bindings.write().await;

        match bindings.get(&id) {
            Some(Slot::Retired) => return Err(RdmError::NotFound(id)),
            Some(Slot::Bound(binding)) => {
                if binding.control.request(ControlFlag::Run) {
                    self.emit(CoreEvent::ControlChanged {
                        id,
                        control: ControlFlag::Run,
                    });
                    self.emit(CoreEvent::StatusChanged {
                        id,
                        status: TaskStatus::Running,
                    });
                    info!(task_id = id, "Worker already running, cleared its control flag");
                    return Ok(());
                }

                // The run is wrapping up; start over once its final status is stored
                binding.finished().await;
                self.ctx.events.sync().await?;
            }
            None => {}
        }

        let record = self.store.get_by_id(id).await?.ok_or(RdmError::NotFound(id))?;
        if record.control != ControlFlag::Run {
            self.emit(CoreEvent::ControlChanged {
                id,
                control: ControlFlag::Run,
            });
        }

        let control = ControlHandle::new(ControlFlag::Run);
        let active = Arc::new(AtomicBool::new(true));
        let (report_tx, report_rx) = watch::channel(None);

        let executor = TransferExecutor::new(record, self.ctx.clone(), control.clone(), active.clone());
        let handle = tokio::spawn(async move {
            let report = executor.run().await;
            let _ = report_tx.send(Some(report.clone()));
            report
        });

        info!(task_id = id, "Spawned worker");
        bindings.insert(
            id,
            Slot::Bound(WorkerBinding {
                handle,
                control,
                active,
                report: report_rx,
            }),
        );

        Ok(())
    }

    /// Ask the bound worker to pause at its next checkpoint
    pub async fn pause(&self, id: TaskId) -> Result<(), RdmError> {
        self.signal(id, TaskStatus::PausePending, ControlFlag::Paused).await
    }

    /// Ask the bound worker to cancel at its next checkpoint
    pub async fn cancel(&self, id: TaskId) -> Result<(), RdmError> {
        self.signal(id, TaskStatus::CancelPending, ControlFlag::Cancel).await
    }

    async fn signal(&self, id: TaskId, pending: TaskStatus, flag: ControlFlag) -> Result<(), RdmError> {
        let bindings = self.bindings.read().await;
        let Some(Slot::Bound(binding)) = bindings.get(&id) else {
            return Err(RdmError::NotFound(id));
        };

        if !binding.is_live() {
            debug!(task_id = id, "Worker already finished, ignoring {:?}", flag);
            return Ok(());
        }

        self.emit(CoreEvent::StatusChanged { id, status: pending });
        if binding.control.request(flag) {
            self.emit(CoreEvent::ControlChanged { id, control: flag });
            info!(task_id = id, "Signaled {:?}", flag);
            return Ok(());
        }

        // Too late for this run; put its final status back over the pending one
        if let Some(report) = binding.finished().await {
            self.emit(CoreEvent::StatusChanged {
                id,
                status: report.status,
            });
        }
        debug!(task_id = id, "Worker already finishing, ignoring {:?}", flag);
        Ok(())
    }

    /// Stop the bound worker at once and retire its id.
    ///
    /// With `file` set, the destination is removed as well (best-effort).
    pub async fn delete(&self, id: TaskId, file: Option<&Path>) -> Result<(), RdmError> {
        let binding = {
            let mut bindings = self.bindings.write().await;
            let Some(Slot::Bound(_)) = bindings.get(&id) else {
                return Err(RdmError::NotFound(id));
            };
            match bindings.insert(id, Slot::Retired) {
                Some(Slot::Bound(binding)) => binding,
                _ => return Err(RdmError::NotFound(id)),
            }
        };

        self.emit(CoreEvent::StatusChanged {
            id,
            status: TaskStatus::DeletePending,
        });
        binding.control.request(ControlFlag::Cancel);

        // Don't wait for the next checkpoint
        binding.handle.abort();
        match binding.handle.await {
            Ok(report) => debug!(task_id = id, status = %report.status, "Worker finished before abort"),
            Err(e) if e.is_cancelled() => debug!(task_id = id, "Worker aborted"),
            Err(e) => warn!(task_id = id, "Worker failed: {}", e),
        }

        if let Some(path) = file {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id = id, "Failed to delete file: {}", e.kind()),
            }
        }

        info!(task_id = id, "Deleted worker binding");
        Ok(())
    }

    /// Wait for the bound worker's run to end
    pub async fn wait(&self, id: TaskId) -> Result<RunReport, RdmError> {
        let mut report = {
            let bindings = self.bindings.read().await;
            match bindings.get(&id) {
                Some(Slot::Bound(binding)) => binding.report.clone(),
                _ => return Err(RdmError::NotFound(id)),
            }
        };

        let result = report
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RdmError::Unavailable)?
            .clone();
        result.ok_or(RdmError::Unavailable)
    }

    pub async fn is_live(&self, id: TaskId) -> bool {
        matches!(
            self.bindings.read().await.get(&id),
            Some(Slot::Bound(binding)) if binding.is_live()
        )
    }

    /// Retire an id with no live worker so it can never be bound again.
    /// Returns `false` if the worker is still live.
    pub async fn retire(&self, id: TaskId) -> bool {
        let mut bindings = self.bindings.write().await;
        if let Some(Slot::Bound(binding)) = bindings.get(&id) {
            if binding.is_live() {
                return false;
            }
        }
        bindings.insert(id, Slot::Retired);
        true
    }

    pub async fn live_count(&self) -> usize {
        self.bindings
            .read()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Bound(binding) if binding.is_live()))
            .count()
    }

    /// Pause every live worker and wait for all of them to exit
    pub async fn pause_all_and_drain(&self) {
        let handles: Vec<_> = {
            let mut bindings = self.bindings.write().await;
            bindings
                .drain()
                .filter_map(|(id, slot)| match slot {
                    Slot::Bound(binding) => {
                        binding.control.request(ControlFlag::Paused);
                        Some((id, binding.handle))
                    }
                    Slot::Retired => None,
                })
                .collect()
        };

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(task_id = id, "Worker failed during shutdown: {}", e);
            }
        }
    }

    fn emit(&self, event: CoreEvent) {
        if !self.ctx.events.emit(event) {
            debug!("Event channel closed, dropping registry event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connectivity::ConnectivityMonitor;
    use crate::engine::events::{event_channel, EventSender};
    use crate::engine::executor::http_client;
    use crate::engine::observer::ObserverRegistry;
    use crate::engine::persistence::{MemoryTaskStore, TaskStore};
    use rdm_types::{NewTask, Settings, TaskRecord};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (Arc<MemoryTaskStore>, EventSender, WorkerContext) {
        let store = Arc::new(MemoryTaskStore::new());
        let (broadcast_tx, _) = broadcast::channel(64);
        let (events, dispatcher) =
            event_channel(store.clone(), Arc::new(ObserverRegistry::new()), broadcast_tx);
        dispatcher.spawn();

        let settings = Settings::default();
        let ctx = WorkerContext {
            client: http_client(&settings).unwrap(),
            settings: Arc::new(settings),
            events: events.clone(),
            connectivity: Arc::new(ConnectivityMonitor::new()),
        };
        (store, events, ctx)
    }

    /// A binding whose worker has sealed its control handle and is still
    /// running cleanup, finished by sending on the returned channel.
    async fn bind_finishing_worker(
        registry: &TaskRegistry,
        id: TaskId,
    ) -> watch::Sender<Option<RunReport>> {
        let control = ControlHandle::new(ControlFlag::Paused);
        assert_eq!(control.take_stop(), Some(ControlFlag::Paused));

        let (report_tx, report_rx) = watch::channel(None);
        let mut finished = report_rx.clone();
        let handle = tokio::spawn(async move {
            let done = finished.wait_for(Option::is_some).await.unwrap();
            done.clone().unwrap()
        });

        registry.bindings.write().await.insert(
            id,
            Slot::Bound(WorkerBinding {
                handle,
                control,
                active: Arc::new(AtomicBool::new(true)),
                report: report_rx,
            }),
        );
        report_tx
    }

    async fn mount_slow_file(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![7u8; 64])
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_start_binds_one_worker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![7u8; 64])
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (store, events, ctx) = setup().await;
        let record = TaskRecord::new(
            1,
            NewTask::new(format!("{}/slow.bin", server.uri()), "slow.bin", dir.path()),
        );
        store.insert(&record).await.unwrap();

        let registry = TaskRegistry::new(ctx, store.clone());
        let (a, b) = tokio::join!(registry.start(1), registry.start(1));
        a.unwrap();
        b.unwrap();
        assert_eq!(registry.live_count().await, 1);

        let report = registry.wait(1).await.unwrap();
        assert_eq!(report.status, TaskStatus::Success);
        events.sync().await.unwrap();
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_signals_without_binding_are_not_found() {
        let (store, _events, ctx) = setup().await;
        let registry = TaskRegistry::new(ctx, store.clone());

        assert!(matches!(registry.start(9).await, Err(RdmError::NotFound(9))));
        assert!(matches!(registry.pause(9).await, Err(RdmError::NotFound(9))));
        assert!(matches!(registry.cancel(9).await, Err(RdmError::NotFound(9))));
        assert!(matches!(registry.delete(9, None).await, Err(RdmError::NotFound(9))));
        assert!(matches!(registry.wait(9).await, Err(RdmError::NotFound(9))));
    }

    #[tokio::test]
    async fn test_deleted_task_is_never_started_again() {
        let server = MockServer::start().await;
        mount_slow_file(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let (store, _events, ctx) = setup().await;
        let record = TaskRecord::new(
            1,
            NewTask::new(format!("{}/slow.bin", server.uri()), "slow.bin", dir.path()),
        );
        store.insert(&record).await.unwrap();

        let registry = TaskRegistry::new(ctx, store.clone());
        registry.start(1).await.unwrap();
        registry.delete(1, None).await.unwrap();

        // The record is still in this store; the tombstone alone refuses
        assert!(matches!(registry.start(1).await, Err(RdmError::NotFound(1))));
        assert!(matches!(registry.delete(1, None).await, Err(RdmError::NotFound(1))));
        assert!(matches!(registry.pause(1).await, Err(RdmError::NotFound(1))));
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delete_racing_start_leaves_no_worker() {
        let server = MockServer::start().await;
        mount_slow_file(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let (store, _events, ctx) = setup().await;
        let registry = TaskRegistry::new(ctx, store.clone());

        for id in 1..=10 {
            let record = TaskRecord::new(
                id,
                NewTask::new(format!("{}/slow.bin", server.uri()), format!("slow-{}.bin", id), dir.path()),
            );
            store.insert(&record).await.unwrap();
            registry.start(id).await.unwrap();

            let (deleted, _started) = tokio::join!(registry.delete(id, None), registry.start(id));
            deleted.unwrap();
            assert!(!registry.is_live(id).await);
            assert!(matches!(registry.start(id).await, Err(RdmError::NotFound(_))));
        }
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_retire_refuses_live_worker() {
        let server = MockServer::start().await;
        mount_slow_file(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let (store, _events, ctx) = setup().await;
        let record = TaskRecord::new(
            1,
            NewTask::new(format!("{}/slow.bin", server.uri()), "slow.bin", dir.path()),
        );
        store.insert(&record).await.unwrap();

        let registry = TaskRegistry::new(ctx, store.clone());
        registry.start(1).await.unwrap();
        assert!(!registry.retire(1).await);

        registry.wait(1).await.unwrap();
        assert!(registry.retire(1).await);
        assert!(matches!(registry.start(1).await, Err(RdmError::NotFound(1))));
    }

    #[tokio::test]
    async fn test_pause_on_finishing_worker_keeps_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let (store, events, ctx) = setup().await;
        let record = TaskRecord::new(1, NewTask::new("http://localhost/a.bin", "a.bin", dir.path()));
        store.insert(&record).await.unwrap();

        let registry = Arc::new(TaskRegistry::new(ctx, store.clone()));
        let report_tx = bind_finishing_worker(&registry, 1).await;

        let pausing = tokio::spawn({
            let registry = registry.clone();
            async move { registry.pause(1).await }
        });
        // The pending status must land before the run reports
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                events.sync().await.unwrap();
                let stored = store.get_by_id(1).await.unwrap().unwrap();
                if stored.status == TaskStatus::PausePending {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        report_tx
            .send(Some(RunReport {
                id: 1,
                status: TaskStatus::Success,
                retry_after: None,
            }))
            .unwrap();

        pausing.await.unwrap().unwrap();
        events.sync().await.unwrap();
        let stored = store.get_by_id(1).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.control, ControlFlag::Run);
    }

    #[tokio::test]
    async fn test_start_on_finishing_worker_spawns_new_run() {
        let server = MockServer::start().await;
        mount_slow_file(&server).await;

        let dir = tempfile::tempdir().unwrap();
        let (store, events, ctx) = setup().await;
        let record = TaskRecord::new(
            1,
            NewTask::new(format!("{}/slow.bin", server.uri()), "slow.bin", dir.path()),
        );
        store.insert(&record).await.unwrap();

        let registry = Arc::new(TaskRegistry::new(ctx, store.clone()));
        let report_tx = bind_finishing_worker(&registry, 1).await;

        let starting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.start(1).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        events.emit(CoreEvent::StatusChanged {
            id: 1,
            status: TaskStatus::Paused,
        });
        report_tx
            .send(Some(RunReport {
                id: 1,
                status: TaskStatus::Paused,
                retry_after: None,
            }))
            .unwrap();

        starting.await.unwrap().unwrap();
        let report = registry.wait(1).await.unwrap();
        assert_eq!(report.status, TaskStatus::Success);
        events.sync().await.unwrap();
        assert_eq!(store.get_by_id(1).await.unwrap().unwrap().status, TaskStatus::Success);
    }
}
