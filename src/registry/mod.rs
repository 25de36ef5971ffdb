use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A registered change listener. Listeners carry no payload; they are
/// "something changed" signals, never row data.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Per-table set of change listeners, owned by the database handle.
///
/// `notify` runs the listeners registered for a table synchronously, in
/// registration order. The registry never references table data.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a table. The listener stays registered until
    /// the returned handle's `unsubscribe` is called.
    pub fn subscribe(&self, table: &str, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners
            .entry(table.to_string())
            .or_default()
            .push((id, listener));

        Subscription {
            registry: self.clone(),
            table: table.to_string(),
            id,
        }
    }

    /// Invoke every listener currently registered for `table`.
    pub fn notify(&self, table: &str) {
        let snapshot: Vec<Listener> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .get(table)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        if !snapshot.is_empty() {
            log::debug!("notifying {} listener(s) for \"{table}\"", snapshot.len());
        }
        for listener in snapshot {
            listener();
        }
    }

    /// Number of listeners currently registered for `table`.
    pub fn listener_count(&self, table: &str) -> usize {
        let listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.get(table).map_or(0, Vec::len)
    }

    fn remove(&self, table: &str, id: u64) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = listeners.get_mut(table) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(table);
            }
        }
    }
}

/// Handle to one registered listener. Dropping the handle without calling
/// `unsubscribe` leaves the listener registered.
pub struct Subscription {
    registry: SubscriptionRegistry,
    table: String,
    id: u64,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Remove the listener. Future notifications for the table no longer
    /// reach it; a notification already in flight may still complete.
    pub fn unsubscribe(self) {
        self.registry.remove(&self.table, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn notify_runs_listeners_in_registration_order() {
        let registry = SubscriptionRegistry::new();
        let calls = Arc::new(StdMutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            registry.subscribe("users", Arc::new(move || calls.lock().unwrap().push(label)));
        }

        registry.notify("users");
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn notify_is_scoped_to_one_table() {
        let registry = SubscriptionRegistry::new();
        let calls = Arc::new(StdMutex::new(Vec::new()));

        let recorder = {
            let calls = Arc::clone(&calls);
            Arc::new(move || calls.lock().unwrap().push("users"))
        };
        registry.subscribe("users", recorder);

        registry.notify("orders");
        assert!(calls.lock().unwrap().is_empty());

        registry.notify("users");
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_listener() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe("users", Arc::new(|| {}));
        let _second = registry.subscribe("users", Arc::new(|| {}));

        assert_eq!(registry.listener_count("users"), 2);
        first.unsubscribe();
        assert_eq!(registry.listener_count("users"), 1);
    }

    #[test]
    fn notify_without_listeners_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        registry.notify("users");
        assert_eq!(registry.listener_count("users"), 0);
    }
}
