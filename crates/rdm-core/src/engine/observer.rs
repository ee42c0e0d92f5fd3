//! Download observers
//!
//! Observers are notified after an event has been written to the task store,
//! so they never see progress the store does not also have.

use parking_lot::RwLock;
use rdm_types::{TaskId, TaskStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Listener for task changes. Every method has an empty default.
pub trait DownloadObserver: Send + Sync {
    fn on_created(&self, _id: TaskId) {}

    fn on_deleted(&self, _id: TaskId) {}

    fn on_status_changed(&self, _id: TaskId, _status: TaskStatus) {}

    /// `total` is `None` while the size is unknown
    fn on_progress_changed(&self, _id: TaskId, _current: u64, _total: Option<u64>) {}
}

/// Handle returned on registration, used to remove the observer again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Set of registered observers
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<(ObserverId, Arc<dyn DownloadObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Registering the same observer twice returns the
    /// existing handle.
    pub fn add(&self, observer: Arc<dyn DownloadObserver>) -> ObserverId {
        let mut observers = self.observers.write();
        if let Some((id, _)) = observers.iter().find(|(_, o)| Arc::ptr_eq(o, &observer)) {
            return *id;
        }

        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        observers.push((id, observer));
        id
    }

    /// Returns whether an observer was removed
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every observer. The list is snapshotted so callbacks may
    /// register or remove observers.
    pub fn for_each(&self, f: impl Fn(&dyn DownloadObserver)) {
        let snapshot: Vec<_> = self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in snapshot {
            f(observer.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        statuses: AtomicUsize,
    }

    impl DownloadObserver for Counter {
        fn on_status_changed(&self, _id: TaskId, _status: TaskStatus) {
            self.statuses.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_same_observer_is_registered_once() {
        let registry = ObserverRegistry::new();
        let counter = Arc::new(Counter::default());

        let a = registry.add(counter.clone());
        let b = registry.add(counter.clone());
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        registry.for_each(|o| o.on_status_changed(1, TaskStatus::Running));
        assert_eq!(counter.statuses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_by_handle() {
        let registry = ObserverRegistry::new();
        let first = registry.add(Arc::new(Counter::default()));
        let second = registry.add(Arc::new(Counter::default()));
        assert_ne!(first, second);

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(registry.len(), 1);
    }
}
