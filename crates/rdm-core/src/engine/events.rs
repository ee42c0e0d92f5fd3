//! Event channel between workers, the task store and observers
//!
//! Workers never touch the store directly. They emit [`CoreEvent`]s into an
//! unbounded queue drained by a single [`EventDispatcher`] task, which:
//! 1. applies the implied field update to the store
//! 2. only if that write succeeded, notifies observers and broadcast subscribers
//!
//! A single consumer keeps per-task ordering: a status never lands before the
//! progress or metadata emitted ahead of it.

use crate::engine::observer::ObserverRegistry;
use crate::engine::persistence::TaskStore;
use crate::error::RdmError;
use rdm_types::CoreEvent;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Envelope {
    Event(CoreEvent),
    /// Answered once every envelope queued before it has been handled
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

/// Producer side of the event channel
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    /// Queue an event. Returns `false` once the dispatcher has stopped.
    pub fn emit(&self, event: CoreEvent) -> bool {
        self.tx.send(Envelope::Event(event)).is_ok()
    }

    /// Wait until every event queued so far has been persisted and fanned out
    pub async fn sync(&self) -> Result<(), RdmError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Envelope::Barrier(done_tx))
            .map_err(|_| RdmError::Unavailable)?;
        done_rx.await.map_err(|_| RdmError::Unavailable)
    }

    /// Ask the dispatcher to stop after the events already queued
    pub fn shutdown(&self) {
        let _ = self.tx.send(Envelope::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the event channel
pub struct EventDispatcher {
    rx: mpsc::UnboundedReceiver<Envelope>,
    store: Arc<dyn TaskStore>,
    observers: Arc<ObserverRegistry>,
    broadcast_tx: broadcast::Sender<CoreEvent>,
}

/// Create a connected sender/dispatcher pair
pub fn event_channel(
    store: Arc<dyn TaskStore>,
    observers: Arc<ObserverRegistry>,
    broadcast_tx: broadcast::Sender<CoreEvent>,
) -> (EventSender, EventDispatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender { tx },
        EventDispatcher {
            rx,
            store,
            observers,
            broadcast_tx,
        },
    )
}

impl EventDispatcher {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Event(event) => self.dispatch(event).await,
                Envelope::Barrier(done) => {
                    let _ = done.send(());
                }
                Envelope::Shutdown => break,
            }
        }

        // Drain whatever raced with the shutdown request
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            match envelope {
                Envelope::Event(event) => self.dispatch(event).await,
                Envelope::Barrier(done) => {
                    let _ = done.send(());
                }
                Envelope::Shutdown => {}
            }
        }
        debug!("Event dispatcher stopped");
    }

    async fn dispatch(&self, event: CoreEvent) {
        let id = event.task_id();

        let persisted = match &event {
            // The record is inserted by the facade before the event is emitted
            CoreEvent::TaskCreated { .. } => Ok(true),
            CoreEvent::TaskRemoved { .. } => self.store.delete(id).await,
            other => match other.to_update() {
                Some(update) => self.store.update_fields(id, &update).await,
                None => Ok(true),
            },
        };

        match persisted {
            Ok(true) => self.fan_out(event),
            Ok(false) => debug!(task_id = id, "Dropping event for unknown task"),
            Err(e) => warn!(task_id = id, "Failed to persist event: {}", e),
        }
    }

    fn fan_out(&self, event: CoreEvent) {
        self.observers.for_each(|observer| {
            let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| match &event {
                CoreEvent::TaskCreated { id } => observer.on_created(*id),
                CoreEvent::TaskRemoved { id } => observer.on_deleted(*id),
                CoreEvent::StatusChanged { id, status } => observer.on_status_changed(*id, *status),
                CoreEvent::Progress {
                    id,
                    bytes_so_far,
                    total_bytes,
                } => observer.on_progress_changed(*id, *bytes_so_far, *total_bytes),
                _ => {}
            }));
            if delivered.is_err() {
                warn!(task_id = event.task_id(), "Observer panicked while handling an event");
            }
        });

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::observer::DownloadObserver;
    use crate::engine::persistence::MemoryTaskStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rdm_types::{NewTask, TaskId, TaskRecord, TaskStatus, TaskUpdate};

    /// Records what the store held at the time each callback fired
    struct StoreWatcher {
        store: Arc<MemoryTaskStore>,
        seen: Mutex<Vec<(TaskStatus, u64)>>,
    }

    impl DownloadObserver for StoreWatcher {
        fn on_status_changed(&self, id: TaskId, status: TaskStatus) {
            let record = futures::executor::block_on(self.store.get_by_id(id)).unwrap().unwrap();
            assert_eq!(record.status, status);
            self.seen.lock().push((status, record.bytes_so_far));
        }
    }

    struct FailingStore;

    #[async_trait]
    impl TaskStore for FailingStore {
        async fn insert(&self, _record: &TaskRecord) -> Result<(), RdmError> {
            Err(RdmError::Unknown("read-only".into()))
        }
        async fn update_fields(&self, _id: TaskId, _update: &TaskUpdate) -> Result<bool, RdmError> {
            Err(RdmError::Unknown("read-only".into()))
        }
        async fn get_by_id(&self, _id: TaskId) -> Result<Option<TaskRecord>, RdmError> {
            Ok(None)
        }
        async fn list_all(&self) -> Result<Vec<TaskRecord>, RdmError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _id: TaskId) -> Result<bool, RdmError> {
            Err(RdmError::Unknown("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_events_are_persisted_before_fan_out_in_order() {
        let store = Arc::new(MemoryTaskStore::new());
        store
            .insert(&TaskRecord::new(1, NewTask::new("http://a/", "a", "/tmp")))
            .await
            .unwrap();

        let observers = Arc::new(ObserverRegistry::new());
        let watcher = Arc::new(StoreWatcher {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        observers.add(watcher.clone());

        let (broadcast_tx, mut broadcast_rx) = broadcast::channel(16);
        let (sender, dispatcher) = event_channel(store.clone(), observers, broadcast_tx);
        let handle = dispatcher.spawn();

        sender.emit(CoreEvent::StatusChanged { id: 1, status: TaskStatus::Running });
        sender.emit(CoreEvent::Progress { id: 1, bytes_so_far: 10, total_bytes: Some(20) });
        sender.emit(CoreEvent::StatusChanged { id: 1, status: TaskStatus::Paused });
        sender.sync().await.unwrap();

        assert_eq!(
            *watcher.seen.lock(),
            vec![(TaskStatus::Running, 0), (TaskStatus::Paused, 10)]
        );
        assert!(matches!(broadcast_rx.recv().await.unwrap(), CoreEvent::StatusChanged { .. }));
        assert!(matches!(broadcast_rx.recv().await.unwrap(), CoreEvent::Progress { .. }));

        sender.shutdown();
        handle.await.unwrap();
        assert!(!sender.emit(CoreEvent::TaskCreated { id: 1 }));
    }

    #[tokio::test]
    async fn test_failed_write_is_not_fanned_out() {
        let observers = Arc::new(ObserverRegistry::new());
        let (broadcast_tx, mut broadcast_rx) = broadcast::channel(16);
        let (sender, dispatcher) = event_channel(Arc::new(FailingStore), observers, broadcast_tx);
        dispatcher.spawn();

        sender.emit(CoreEvent::Progress { id: 1, bytes_so_far: 10, total_bytes: None });
        sender.sync().await.unwrap();

        assert!(matches!(
            broadcast_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_task_removed_deletes_record() {
        let store = Arc::new(MemoryTaskStore::new());
        store
            .insert(&TaskRecord::new(4, NewTask::new("http://a/", "a", "/tmp")))
            .await
            .unwrap();
        let (broadcast_tx, _rx) = broadcast::channel(16);
        let (sender, dispatcher) =
            event_channel(store.clone(), Arc::new(ObserverRegistry::new()), broadcast_tx);
        dispatcher.spawn();

        sender.emit(CoreEvent::TaskRemoved { id: 4 });
        sender.sync().await.unwrap();
        assert!(store.get_by_id(4).await.unwrap().is_none());
    }
}
