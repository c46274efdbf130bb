//! Worker registry.
//!
//! Ordered by registration so score ties go to the older worker.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::net::{ConnectionId, Protocol};
use crate::worker::Worker;

#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<Arc<dyn Worker>>>,
    changed: Notify,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, worker: Arc<dyn Worker>) {
        self.workers.lock().expect("registry mutex poisoned").push(worker);
        self.notify();
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<dyn Worker>> {
        let removed = {
            let mut workers = self.workers.lock().expect("registry mutex poisoned");
            let index = workers.iter().position(|w| w.id() == id)?;
            workers.remove(index)
        };
        self.notify();
        Some(removed)
    }

    /// Drop closed workers and close idle ones past their life end.
    pub fn prune(&self) -> usize {
        let mut retired = Vec::new();
        let removed = {
            let mut workers = self.workers.lock().expect("registry mutex poisoned");
            let before = workers.len();
            workers.retain(|w| {
                if w.is_closed() {
                    return false;
                }
                if w.life_end() && w.is_idle() {
                    retired.push(Arc::clone(w));
                    return false;
                }
                true
            });
            before - workers.len()
        };
        for worker in retired {
            worker.close("life_end");
        }
        if removed > 0 {
            self.notify();
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.lock().expect("registry mutex poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, protocol: Protocol) -> usize {
        self.workers
            .lock()
            .expect("registry mutex poisoned")
            .iter()
            .filter(|w| w.protocol() == protocol)
            .count()
    }

    /// Wake everyone waiting for a worker.
    pub fn notify(&self) {
        self.changed.notify_waiters();
    }

    pub fn changed(&self) -> &Notify {
        &self.changed
    }
}
