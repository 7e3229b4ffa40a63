//! Item Locks
//!
//! Per-node production locks. A node's lock count is `0` when free, `N > 0`
//! while N readers hold it and `-1` while one writer produces it. The writer
//! may register its [`Scheduler`] as the node's *producer*, so late readers
//! join that scheduler (observable, cancellable) instead of blocking blindly.
//!
//! # How It Works
//!
//! Every counter mutation happens inside one critical section owned by the
//! [`LockTable`]. Waiters park on a single condition variable that is
//! notified whenever a count returns towards zero.
//!
//! Cache items inherit read permission from their parent: before reading a
//! child of a cache item the reader must hold a read lock on that parent,
//! so [`ItemReadLock`] walks up the chain of cache-item parents first.
//!
//! # Thread Safety
//!
//! Joining a producer always happens outside the critical section.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::node::Node;
use crate::scheduler::Scheduler;

/// The single critical section guarding all node lock counts.
#[derive(Debug, Default)]
pub struct LockTable {
    section: Mutex<()>,
    changed: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a shared lock, joining the producer of an active write lock.
    pub fn lock_shared(&self, node: &Node) {
        let mut guard = self.section.lock();
        loop {
            let count = node.lock_count();
            if count >= 0 {
                node.set_lock_count(count + 1);
                tracing::trace!(node = %node.name(), readers = count + 1, "lock_shared");
                return;
            }
            match node.producer() {
                Some(producer) => {
                    MutexGuard::unlocked(&mut guard, || {
                        producer.join();
                    });
                    // After the join the producer has released its lock;
                    // a new writer may have come in, so re-check. Without
                    // a producer left we wait on the condition instead.
                    if node.lock_count() < 0 && node.producer().is_none() {
                        self.changed.wait(&mut guard);
                    }
                }
                None => self.changed.wait(&mut guard),
            }
        }
    }

    pub fn try_lock_shared(&self, node: &Node) -> bool {
        let _guard = self.section.lock();
        let count = node.lock_count();
        if count < 0 {
            return false;
        }
        node.set_lock_count(count + 1);
        true
    }

    /// Acquire the write lock, optionally registering its producer.
    pub fn lock_unique(&self, node: &Node, producer: Option<&Arc<Scheduler>>) {
        let mut guard = self.section.lock();
        while node.lock_count() != 0 {
            self.changed.wait(&mut guard);
        }
        node.set_lock_count(-1);
        node.set_producer(producer);
        tracing::trace!(node = %node.name(), "lock_unique");
    }

    pub fn try_lock_unique(&self, node: &Node, producer: Option<&Arc<Scheduler>>) -> bool {
        let _guard = self.section.lock();
        if node.lock_count() != 0 {
            return false;
        }
        node.set_lock_count(-1);
        node.set_producer(producer);
        true
    }

    pub fn unlock_shared(&self, node: &Node) {
        let _guard = self.section.lock();
        let count = node.lock_count();
        debug_assert!(count > 0, "unlock_shared on {} with count {count}", node.name());
        node.set_lock_count((count - 1).max(0));
        self.changed.notify_all();
    }

    pub fn unlock_unique(&self, node: &Node) {
        let _guard = self.section.lock();
        debug_assert_eq!(node.lock_count(), -1, "unlock_unique on {}", node.name());
        node.set_lock_count(0);
        node.set_producer(None);
        tracing::trace!(node = %node.name(), "unlock_unique");
        self.changed.notify_all();
    }
}

/// Shared access to a node and, for cache items, to its cache-item parents.
///
/// Released when dropped.
#[must_use = "the read lock is released when the guard is dropped"]
pub struct ItemReadLock {
    table: Arc<LockTable>,
    /// Outermost first; released in reverse.
    held: Vec<Arc<Node>>,
}

impl ItemReadLock {
    pub fn new(table: &Arc<LockTable>, node: &Arc<Node>) -> Self {
        let chain = read_access_chain(node);
        for item in &chain {
            table.lock_shared(item);
        }
        Self {
            table: table.clone(),
            held: chain,
        }
    }

    /// Non-blocking variant; `None` if any lock in the chain is contended.
    pub fn try_new(table: &Arc<LockTable>, node: &Arc<Node>) -> Option<Self> {
        let chain = read_access_chain(node);
        let mut lock = Self {
            table: table.clone(),
            held: Vec::with_capacity(chain.len()),
        };
        for item in chain {
            if !table.try_lock_shared(&item) {
                return None;
            }
            lock.held.push(item);
        }
        Some(lock)
    }

    pub fn node(&self) -> Option<&Arc<Node>> {
        self.held.last()
    }
}

impl Drop for ItemReadLock {
    fn drop(&mut self) {
        for item in self.held.iter().rev() {
            self.table.unlock_shared(item);
        }
    }
}

/// The cache-item parents of `node` (outermost first) followed by `node`.
fn read_access_chain(node: &Arc<Node>) -> Vec<Arc<Node>> {
    let mut chain = vec![node.clone()];
    let mut current = node.clone();
    while current.is_cache_item() {
        match current.parent() {
            Some(parent) if parent.is_cache_item() => {
                chain.push(parent.clone());
                current = parent;
            }
            _ => break,
        }
    }
    chain.reverse();
    chain
}

/// Exclusive access to a node for producing its data.
#[must_use = "the write lock is released when the guard is dropped"]
pub struct ItemWriteLock {
    table: Arc<LockTable>,
    node: Arc<Node>,
}

impl ItemWriteLock {
    pub fn new(table: &Arc<LockTable>, node: &Arc<Node>, producer: Option<&Arc<Scheduler>>) -> Self {
        table.lock_unique(node, producer);
        Self {
            table: table.clone(),
            node: node.clone(),
        }
    }

    pub fn try_new(
        table: &Arc<LockTable>,
        node: &Arc<Node>,
        producer: Option<&Arc<Scheduler>>,
    ) -> Option<Self> {
        table.try_lock_unique(node, producer).then(|| Self {
            table: table.clone(),
            node: node.clone(),
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for ItemWriteLock {
    fn drop(&mut self) {
        self.table.unlock_unique(&self.node);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
