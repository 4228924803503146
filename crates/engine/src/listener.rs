//! Node-level progress listeners.
//!
//! The registry is copy-on-write: registration and removal swap in a new
//! list, and notification iterates a snapshot taken up front. A listener that
//! returns an error or panics is logged and skipped; it never reaches the
//! caller of the operation that triggered the notification, and the remaining
//! listeners are still called.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

/// Callbacks for node progress within an instance.
pub trait WorkflowEventListener: Send + Sync {
    fn on_node_start(&self, _instance_id: &str, _node_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_node_success(&self, _instance_id: &str, _node_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_node_failure(&self, _instance_id: &str, _node_id: &str, _error: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

type ListenerList = Arc<Vec<Arc<dyn WorkflowEventListener>>>;

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<ListenerList>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener unless the same instance is already registered.
    /// Returns `true` if it was added.
    pub fn register(&self, listener: Arc<dyn WorkflowEventListener>) -> bool {
        let mut guard = self.listeners.write();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Remove a previously registered listener. Returns `true` if found.
    pub fn remove(&self, listener: &Arc<dyn WorkflowEventListener>) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(*l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current list; later registrations do not affect it.
    pub fn snapshot(&self) -> ListenerList {
        Arc::clone(&self.listeners.read())
    }

    pub fn notify_node_start(&self, instance_id: &str, node_id: &str) {
        self.notify("on_node_start", instance_id, node_id, |l| {
            l.on_node_start(instance_id, node_id)
        });
    }

    pub fn notify_node_success(&self, instance_id: &str, node_id: &str) {
        self.notify("on_node_success", instance_id, node_id, |l| {
            l.on_node_success(instance_id, node_id)
        });
    }

    pub fn notify_node_failure(&self, instance_id: &str, node_id: &str, error: &str) {
        self.notify("on_node_failure", instance_id, node_id, |l| {
            l.on_node_failure(instance_id, node_id, error)
        });
    }

    fn notify<F>(&self, event: &str, instance_id: &str, node_id: &str, call: F)
    where
        F: Fn(&dyn WorkflowEventListener) -> anyhow::Result<()>,
    {
        for listener in self.snapshot().iter() {
            match catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(
                    instance_id,
                    node_id, "listener {} failed: {:#}", event, err
                ),
                Err(_) => error!(instance_id, node_id, "listener {} panicked", event),
            }
        }
    }
}
