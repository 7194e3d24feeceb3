//! Job-completion notifications.
//!
//! The task protocol calls `notify` whenever a running job finishes; every
//! registered observer is invoked once, in registration order. Observers must
//! not block: anything slow is spawned.

use std::sync::Arc;

use tokio::sync::Mutex;

pub trait Observer: Send + Sync {
    fn on_notify(&self);
}

/// Handle returned by `register`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn Observer>)>,
}

#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let mut reg = self.inner.lock().await;
        let id = ObserverId(reg.next_id);
        reg.next_id += 1;
        reg.observers.push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub async fn deregister(&self, id: ObserverId) -> bool {
        let mut reg = self.inner.lock().await;
        let before = reg.observers.len();
        reg.observers.retain(|(oid, _)| *oid != id);
        reg.observers.len() != before
    }

    /// Invoke every observer. The list is snapshotted first so an observer
    /// may register or deregister from inside `on_notify`'s spawned work.
    pub async fn notify(&self) {
        let snapshot: Vec<Arc<dyn Observer>> = self
            .inner
            .lock()
            .await
            .observers
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        tracing::debug!(observers = snapshot.len(), "notifying observers");
        for observer in snapshot {
            observer.on_notify();
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.observers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        name: &'static str,
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl Observer for Recorder {
        fn on_notify(&self) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[tokio::test]
    async fn fans_out_in_registration_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let reg = ObserverRegistry::new();
        for name in ["first", "second", "third"] {
            reg.register(Arc::new(Recorder {
                name,
                log: log.clone(),
            }))
            .await;
        }

        reg.notify().await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn deregistered_observer_is_not_called() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let reg = ObserverRegistry::new();
        let a = reg
            .register(Arc::new(Recorder {
                name: "a",
                log: log.clone(),
            }))
            .await;
        reg.register(Arc::new(Recorder {
            name: "b",
            log: log.clone(),
        }))
        .await;

        assert!(reg.deregister(a).await);
        assert!(!reg.deregister(a).await);
        reg.notify().await;
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
        assert_eq!(reg.len().await, 1);
    }
}
