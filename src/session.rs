use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::protocol::Message;

/// Session lifecycle status. Transitions are monotonic within one send cycle:
/// ready -> submitted -> streaming -> ready.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ready,
    Submitted,
    Streaming,
}

/// Render-ready view of one session. Every mutation replaces the snapshot
/// wholesale; observers never see a partially updated value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub input: String,
    pub status: Status,
    pub initializing: bool,
    pub stream_url: Option<String>,
    pub sandbox_id: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            input: String::new(),
            status: Status::Ready,
            initializing: true,
            stream_url: None,
            sandbox_id: None,
        }
    }
}

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Observable single-writer snapshot holder. All transcript and status
/// mutation funnels through [`SessionStore::update`], which swaps the live
/// snapshot and synchronously notifies subscribers in registration order.
pub struct SessionStore {
    snapshot: Mutex<Arc<Snapshot>>,
    registry: Mutex<Registry>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(Arc::new(Snapshot::default())),
            registry: Mutex::new(Registry::default()),
        })
    }

    /// The current snapshot. The returned handle stays valid (and identical)
    /// until the next mutation.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.lock().expect("snapshot lock").clone()
    }

    /// Register a listener. It is invoked once per update, after the new
    /// snapshot is in place. Dropping the returned [`Subscription`]
    /// unregisters it; doing so from inside a listener is safe.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = self.registry.lock().expect("registry lock");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription { store: Arc::downgrade(self), id }
    }

    /// Apply a mutation to a copy of the current snapshot, publish the copy,
    /// and notify subscribers. Fields the mutator does not touch carry over
    /// unchanged.
    pub fn update(&self, mutate: impl FnOnce(&mut Snapshot)) {
        let published = {
            let mut slot = self.snapshot.lock().expect("snapshot lock");
            let mut next = (**slot).clone();
            mutate(&mut next);
            let next = Arc::new(next);
            *slot = next.clone();
            next
        };
        // Listeners are invoked while neither lock is held; they may read
        // the snapshot or unsubscribe from inside the callback.
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().expect("registry lock");
            registry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener(&published);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut registry = self.registry.lock().expect("registry lock");
        registry.listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Subscription guard returned by [`SessionStore::subscribe`].
pub struct Subscription {
    store: Weak<SessionStore>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}
