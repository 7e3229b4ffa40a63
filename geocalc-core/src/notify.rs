//! State Change Notifications
//!
//! Hosts observe item state changes (invalidated, data ready, failed, ...)
//! by registering sinks: either a C callback with a client handle, for the
//! foreign API, or a Rust closure.
//!
//! # How It Works
//!
//! Sinks are registered globally (every node) or per node. Notifying clones
//! the matching sink list, releases all locks and then calls each sink
//! synchronously on the notifying thread.
//!
//! # Thread Safety
//!
//! Sinks may be called from worker threads. They must return quickly and
//! must not call back into the engine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::graph::{Node, NodeId};

/// Opaque value handed back to a client callback.
pub type ClientHandle = usize;

/// Callback signature for hosts: `(client, node, code)`.
pub type StateChangeFn = extern "C" fn(ClientHandle, *const Node, u32);

type ClosureSink = Arc<dyn Fn(&Node, NotificationCode) + Send + Sync>;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NotificationCode {
    Invalidated = 0,
    MetaReady = 1,
    DataReady = 2,
    Validated = 3,
    Committed = 4,
    Failed = 5,
}

impl NotificationCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => NotificationCode::Invalidated,
            1 => NotificationCode::MetaReady,
            2 => NotificationCode::DataReady,
            3 => NotificationCode::Validated,
            4 => NotificationCode::Committed,
            5 => NotificationCode::Failed,
            _ => return None,
        })
    }
}

/// Display name of a notification code.
pub fn update_state_name(code: NotificationCode) -> &'static str {
    match code {
        NotificationCode::Invalidated => "Invalidated",
        NotificationCode::MetaReady => "MetaInfoReady",
        NotificationCode::DataReady => "DataReady",
        NotificationCode::Validated => "Validated",
        NotificationCode::Committed => "Committed",
        NotificationCode::Failed => "Failed",
    }
}

impl fmt::Display for NotificationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(update_state_name(*self))
    }
}

#[derive(Clone)]
enum SinkKind {
    Client {
        func: StateChangeFn,
        client: ClientHandle,
    },
    Closure(ClosureSink),
}

#[derive(Clone)]
struct Sink {
    id: u64,
    kind: SinkKind,
}

impl Sink {
    fn is_client(&self, func: StateChangeFn, client: ClientHandle) -> bool {
        match &self.kind {
            SinkKind::Client {
                func: registered,
                client: registered_client,
            } => *registered as usize == func as usize && *registered_client == client,
            SinkKind::Closure(_) => false,
        }
    }

    fn call(&self, node: &Node, code: NotificationCode) {
        match &self.kind {
            SinkKind::Client { func, client } => func(*client, node as *const Node, code as u32),
            SinkKind::Closure(f) => f(node, code),
        }
    }
}

/// Registry of notification sinks for one engine.
#[derive(Default)]
pub struct NotificationHub {
    next_id: AtomicU64,
    global: RwLock<Vec<Sink>>,
    per_node: DashMap<NodeId, Vec<Sink>>,
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHub")
            .field("global", &self.global.read().len())
            .field("nodes", &self.per_node.len())
            .finish()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a callback for every node.
    pub fn register_global(&self, func: StateChangeFn, client: ClientHandle) {
        let sink = Sink {
            id: self.next_id(),
            kind: SinkKind::Client { func, client },
        };
        self.global.write().push(sink);
    }

    /// Remove a callback registered with [`register_global`](Self::register_global).
    pub fn release_global(&self, func: StateChangeFn, client: ClientHandle) -> bool {
        let mut global = self.global.write();
        let before = global.len();
        global.retain(|sink| !sink.is_client(func, client));
        global.len() != before
    }

    /// Register a callback for one node.
    pub fn register_node(&self, node: NodeId, func: StateChangeFn, client: ClientHandle) {
        let sink = Sink {
            id: self.next_id(),
            kind: SinkKind::Client { func, client },
        };
        self.per_node.entry(node).or_default().push(sink);
    }

    pub fn release_node(&self, node: NodeId, func: StateChangeFn, client: ClientHandle) -> bool {
        let released = match self.per_node.get_mut(&node) {
            Some(mut sinks) => {
                let before = sinks.len();
                sinks.retain(|sink| !sink.is_client(func, client));
                sinks.len() != before
            }
            None => false,
        };
        self.per_node.remove_if(&node, |_, sinks| sinks.is_empty());
        released
    }

    /// Register a closure for one node, or for all nodes when `node` is
    /// `None`. The closure is removed when the returned handle is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, node: Option<NodeId>, f: F) -> Subscription
    where
        F: Fn(&Node, NotificationCode) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let sink = Sink {
            id,
            kind: SinkKind::Closure(Arc::new(f)),
        };
        match node {
            Some(node) => self.per_node.entry(node).or_default().push(sink),
            None => self.global.write().push(sink),
        }
        Subscription {
            hub: Arc::downgrade(self),
            node,
            id,
        }
    }

    fn unsubscribe(&self, node: Option<NodeId>, id: u64) {
        match node {
            Some(node) => {
                if let Some(mut sinks) = self.per_node.get_mut(&node) {
                    sinks.retain(|sink| sink.id != id);
                }
                self.per_node.remove_if(&node, |_, sinks| sinks.is_empty());
            }
            None => self.global.write().retain(|sink| sink.id != id),
        }
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.global.read().len() + self.per_node.iter().map(|e| e.value().len()).sum::<usize>()
    }

    /// Deliver `code` for `node` to every matching sink.
    pub fn notify(&self, node: &Node, code: NotificationCode) {
        let mut sinks: Vec<Sink> = self.global.read().clone();
        if let Some(node_sinks) = self.per_node.get(&node.id()) {
            sinks.extend(node_sinks.iter().cloned());
        }
        if sinks.is_empty() {
            return;
        }
        tracing::trace!(node = %node.name(), %code, sinks = sinks.len(), "notify");
        for sink in &sinks {
            sink.call(node, code);
        }
    }
}

/// Handle to a closure subscription.
///
/// Dropping this handle removes the subscription.
#[must_use = "the subscription ends when the handle is dropped"]
pub struct Subscription {
    hub: Weak<NotificationHub>,
    node: Option<NodeId>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.node, self.id);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueClass;
    use std::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static LAST_CODE: AtomicUsize = AtomicUsize::new(usize::MAX);

    extern "C" fn count_calls(client: ClientHandle, _node: *const Node, code: u32) {
        CALLS.fetch_add(client, Ordering::SeqCst);
        LAST_CODE.store(code as usize, Ordering::SeqCst);
    }

    #[test]
    fn client_callbacks_receive_codes() {
        let hub = NotificationHub::new();
        let node = Node::new_cache_item("n", ValueClass::Int32);

        hub.register_node(node.id(), count_calls, 10);
        hub.notify(&node, NotificationCode::DataReady);
        assert_eq!(CALLS.load(Ordering::SeqCst), 10);
        assert_eq!(LAST_CODE.load(Ordering::SeqCst), NotificationCode::DataReady as usize);

        assert!(hub.release_node(node.id(), count_calls, 10));
        assert!(!hub.release_node(node.id(), count_calls, 10));
        hub.notify(&node, NotificationCode::Failed);
        assert_eq!(CALLS.load(Ordering::SeqCst), 10);
        assert_eq!(hub.sink_count(), 0);
    }

    #[test]
    fn subscription_ends_on_drop() {
        let hub = Arc::new(NotificationHub::new());
        let node = Node::new_cache_item("n", ValueClass::Int32);
        let seen = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let seen = seen.clone();
            hub.subscribe(None, move |_, code| {
                if code == NotificationCode::Invalidated {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        hub.notify(&node, NotificationCode::Invalidated);
        hub.notify(&node, NotificationCode::DataReady);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(subscription);
        hub.notify(&node, NotificationCode::Invalidated);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.sink_count(), 0);
    }

    #[test]
    fn codes_have_stable_names() {
        assert_eq!(update_state_name(NotificationCode::MetaReady), "MetaInfoReady");
        assert_eq!(NotificationCode::from_u32(5), Some(NotificationCode::Failed));
        assert_eq!(NotificationCode::from_u32(9), None);
    }
}
