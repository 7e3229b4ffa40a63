//! Graph Nodes
//!
//! A [`Node`] is a vertex of the item tree: a configured unit or attribute,
//! or a cache item produced by a calculation.
//!
//! # Overview
//!
//! Besides its identity a node carries:
//!
//! - an **interest count**, distinct from the `Arc` reference count, that
//!   decides whether the node's data is kept materialized,
//! - a **lock count** (see [`LockTable`](super::LockTable)): positive for N
//!   readers, negative for one writer, zero when free, plus the producer
//!   that holds the write lock,
//! - a progress state, a sticky fail state and the timestamp of its last
//!   change.
//!
//! Children are owned by their parent; a child only keeps a weak back
//! reference, so the tree never forms an ownership cycle.
//!
//! # Thread Safety
//!
//! Data and fail state sit behind a mutex. The lock count is atomic for
//! cheap observation but is only ever modified inside the lock table's
//! critical section.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::{TimeStamp, TS_BERESHIT};
use crate::error::{EngineError, FailType, Failure, Result};
use crate::scheduler::Scheduler;
use crate::storage::StorageBinding;
use crate::value::{Value, ValueClass};

/// Identity of a node, used to key per-node subscriptions.
///
/// Issued when the node is built, in creation order, and never reused, so a
/// subscription can not outlive its node and then match a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(NonZeroU64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    fn issue() -> Self {
        let raw = NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How far a node has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProgressState {
    None,
    /// Shape and class are known.
    MetaInfo,
    /// Data is present.
    Validated,
    /// Data is present and written to its storage.
    Committed,
}

#[derive(Debug)]
struct NodeState {
    progress: ProgressState,
    fail: Option<Failure>,
    last_change: TimeStamp,
    tiles: Vec<Option<Value>>,
}

/// A vertex of the item tree.
pub struct Node {
    id: NodeId,
    name: Arc<str>,
    class: ValueClass,
    parent: Option<Weak<Node>>,
    is_cache_item: bool,
    keep_data: bool,
    storage: Option<StorageBinding>,
    children: RwLock<IndexMap<Arc<str>, Arc<Node>>>,
    interest: AtomicU32,
    lock_count: AtomicI32,
    producer: Mutex<Option<Weak<Scheduler>>>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("interest", &self.interest_count())
            .field("lock_count", &self.lock_count())
            .field("progress", &self.progress())
            .finish()
    }
}

/// Options for creating a node.
#[derive(Default)]
pub struct NodeSpec {
    pub is_cache_item: bool,
    pub keep_data: bool,
    pub storage: Option<StorageBinding>,
    pub tile_count: usize,
}

impl Node {
    fn build(
        name: Arc<str>,
        class: ValueClass,
        parent: Option<&Arc<Node>>,
        spec: NodeSpec,
    ) -> Self {
        let tile_count = spec
            .storage
            .as_ref()
            .map(|binding| binding.meta.tile_count)
            .unwrap_or(spec.tile_count)
            .max(1);
        Self {
            id: NodeId::issue(),
            name,
            class,
            parent: parent.map(Arc::downgrade),
            is_cache_item: spec.is_cache_item,
            keep_data: spec.keep_data,
            storage: spec.storage,
            children: RwLock::new(IndexMap::new()),
            interest: AtomicU32::new(0),
            lock_count: AtomicI32::new(0),
            producer: Mutex::new(None),
            state: Mutex::new(NodeState {
                progress: ProgressState::MetaInfo,
                fail: None,
                last_change: TS_BERESHIT,
                tiles: vec![None; tile_count],
            }),
        }
    }

    /// Create the root of an item tree.
    pub fn new_root(name: &str) -> Arc<Node> {
        Arc::new(Self::build(name.into(), ValueClass::Any, None, NodeSpec::default()))
    }

    /// Create a node under `parent`, replacing any child with the same name.
    pub fn new_child(
        parent: &Arc<Node>,
        name: &str,
        class: ValueClass,
        spec: NodeSpec,
    ) -> Arc<Node> {
        let node = Arc::new(Self::build(name.into(), class, Some(parent), spec));
        parent
            .children
            .write()
            .insert(node.name.clone(), node.clone());
        node
    }

    /// Create a free-standing cache item that will receive a computed result.
    pub fn new_cache_item(name: &str, class: ValueClass) -> Arc<Node> {
        Arc::new(Self::build(
            name.into(),
            class,
            None,
            NodeSpec {
                is_cache_item: true,
                ..NodeSpec::default()
            },
        ))
    }

    /// Create a constant node whose data is ready from the start.
    pub fn new_constant(name: &str, value: Value) -> Arc<Node> {
        let node = Self::build(
            name.into(),
            value.class(),
            None,
            NodeSpec {
                is_cache_item: true,
                keep_data: true,
                ..NodeSpec::default()
            },
        );
        {
            let mut state = node.state.lock();
            state.tiles[0] = Some(value);
            state.progress = ProgressState::Validated;
        }
        Arc::new(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> ValueClass {
        self.class
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_cache_item(&self) -> bool {
        self.is_cache_item
    }

    pub fn keeps_data(&self) -> bool {
        self.keep_data
    }

    pub fn storage(&self) -> Option<&StorageBinding> {
        self.storage.as_ref()
    }

    /// Slash-separated path from the root, e.g. `/region/population`.
    pub fn full_name(&self) -> String {
        match self.parent() {
            None => String::new(),
            Some(parent) => format!("{}/{}", parent.full_name(), self.name),
        }
    }

    // ------------------------------------------------------------------------
    // Tree
    // ------------------------------------------------------------------------

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.read().get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().values().cloned().collect()
    }

    /// Resolve a path relative to this node. A leading `/` is ignored.
    pub fn find_item(&self, path: &str) -> Option<Arc<Node>> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let first = segments.next()?;
        let mut current = self.child(first)?;
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }

    // ------------------------------------------------------------------------
    // Interest
    // ------------------------------------------------------------------------

    pub fn interest_count(&self) -> u32 {
        self.interest.load(Ordering::SeqCst)
    }

    pub fn start_interest(&self) -> u32 {
        self.interest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one unit of interest and return the remaining count.
    ///
    /// The count saturates at zero. When it reaches zero a cache item that
    /// is not locked releases its data.
    pub fn stop_interest(&self) -> u32 {
        let previous = self
            .interest
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                if self.is_cache_item && !self.keep_data && self.lock_count() == 0 {
                    self.drop_data();
                }
                0
            }
            Ok(n) => n - 1,
            Err(_) => {
                tracing::warn!(node = %self.name, "stop_interest without matching start_interest");
                0
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lock state (mutated by the lock table only)
    // ------------------------------------------------------------------------

    pub fn lock_count(&self) -> i32 {
        self.lock_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_lock_count(&self, count: i32) {
        self.lock_count.store(count, Ordering::SeqCst);
    }

    /// The scheduler currently producing this node, if still alive.
    pub fn producer(&self) -> Option<Arc<Scheduler>> {
        self.producer.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_producer(&self, producer: Option<&Arc<Scheduler>>) {
        *self.producer.lock() = producer.map(Arc::downgrade);
    }

    // ------------------------------------------------------------------------
    // Progress, failure and data
    // ------------------------------------------------------------------------

    pub fn progress(&self) -> ProgressState {
        self.state.lock().progress
    }

    pub fn last_change(&self) -> TimeStamp {
        self.state.lock().last_change
    }

    pub(crate) fn stamp(&self, ts: TimeStamp) {
        let mut state = self.state.lock();
        state.last_change = state.last_change.max(ts);
    }

    /// Data is present, not failed and no writer holds the node.
    pub fn is_data_ready(&self) -> bool {
        if self.lock_count() < 0 {
            return false;
        }
        let state = self.state.lock();
        state.progress >= ProgressState::Validated && state.fail.is_none()
    }

    pub fn fail_state(&self) -> Option<Failure> {
        self.state.lock().fail.clone()
    }

    pub fn was_failed(&self, phase: FailType) -> bool {
        self.state
            .lock()
            .fail
            .as_ref()
            .is_some_and(|fail| fail.blocks(phase))
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().fail.is_some()
    }

    /// Record a failure. The first failure wins.
    pub fn fail(&self, failure: Failure) {
        let mut state = self.state.lock();
        if state.fail.is_none() {
            tracing::debug!(node = %self.name, %failure, "node failed");
            state.fail = Some(failure);
        }
    }

    /// Re-raise the recorded failure, if any.
    pub fn throw_fail_reason(&self) -> Result<()> {
        match self.fail_state() {
            Some(failure) => Err(EngineError::Failed(failure)),
            None => Ok(()),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.state.lock().tiles.len()
    }

    pub fn has_tile(&self, tile: usize) -> bool {
        self.state
            .lock()
            .tiles
            .get(tile)
            .is_some_and(Option::is_some)
    }

    /// Store one tile. Used by storage managers while the node is
    /// write-locked.
    pub fn store_tile(&self, tile: usize, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        let tile_count = state.tiles.len();
        let slot = state.tiles.get_mut(tile).ok_or_else(|| {
            EngineError::Failed(Failure::data(format!(
                "tile {tile} out of range for '{}' ({tile_count} tiles)",
                self.name
            )))
        })?;
        *slot = Some(value);
        Ok(())
    }

    /// Mark all tiles present as validated data changed at `ts`.
    pub(crate) fn validate(&self, ts: TimeStamp) {
        let mut state = self.state.lock();
        state.progress = state.progress.max(ProgressState::Validated);
        state.last_change = state.last_change.max(ts);
    }

    /// Replace the data with a single value, clearing any failure.
    pub(crate) fn assign(&self, value: Value, ts: TimeStamp) {
        let mut state = self.state.lock();
        for tile in state.tiles.iter_mut() {
            *tile = None;
        }
        state.tiles[0] = Some(value);
        state.fail = None;
        state.progress = ProgressState::Validated;
        state.last_change = state.last_change.max(ts);
    }

    pub(crate) fn set_committed(&self) {
        let mut state = self.state.lock();
        if state.progress >= ProgressState::Validated {
            state.progress = ProgressState::Committed;
        }
    }

    /// Forget data and failure, back to MetaInfo.
    pub(crate) fn drop_data(&self) {
        let mut state = self.state.lock();
        for tile in state.tiles.iter_mut() {
            *tile = None;
        }
        state.fail = None;
        state.progress = state.progress.min(ProgressState::MetaInfo);
    }

    /// The value of tile 0.
    pub fn value(&self) -> Result<Value> {
        self.tile(0)
    }

    pub fn tile(&self, tile: usize) -> Result<Value> {
        let state = self.state.lock();
        if let Some(failure) = &state.fail {
            return Err(EngineError::Failed(failure.clone()));
        }
        state.tiles.get(tile).cloned().flatten().ok_or_else(|| {
            EngineError::Failed(Failure::data(format!(
                "data of '{}' is not available",
                self.name
            )))
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_follow_creation_order() {
        let a = Node::new_cache_item("a", ValueClass::Int32);
        let b = Node::new_constant("b", Value::Int32(1));
        assert!(a.id() < b.id());
        assert_eq!(b.id().to_string(), format!("#{}", b.id().as_u64()));
    }

    #[test]
    fn tree_lookup_by_full_name() {
        let root = Node::new_root("root");
        let region = Node::new_child(&root, "region", ValueClass::Any, NodeSpec::default());
        let pop = Node::new_child(&region, "pop", ValueClass::Int32, NodeSpec::default());

        assert_eq!(pop.full_name(), "/region/pop");
        assert_eq!(root.find_item("/region/pop").unwrap().id(), pop.id());
        assert!(root.find_item("/region/area").is_none());
        assert_eq!(pop.parent().unwrap().id(), region.id());
    }

    #[test]
    fn interest_never_goes_negative() {
        let node = Node::new_cache_item("n", ValueClass::Float64);
        assert_eq!(node.stop_interest(), 0);
        assert_eq!(node.start_interest(), 1);
        assert_eq!(node.start_interest(), 2);
        assert_eq!(node.stop_interest(), 1);
        assert_eq!(node.stop_interest(), 0);
        assert_eq!(node.interest_count(), 0);
    }

    #[test]
    fn losing_interest_drops_cache_data() {
        let node = Node::new_cache_item("n", ValueClass::Float64);
        node.start_interest();
        node.assign(Value::Float64(1.0), 2);
        assert!(node.is_data_ready());

        node.stop_interest();
        assert!(!node.is_data_ready());
        assert_eq!(node.progress(), ProgressState::MetaInfo);
    }

    #[test]
    fn constants_keep_their_data() {
        let node = Node::new_constant("1", Value::Float64(1.0));
        node.start_interest();
        node.stop_interest();
        assert_eq!(node.value().unwrap(), Value::Float64(1.0));
    }

    #[test]
    fn writer_lock_hides_readiness() {
        let node = Node::new_constant("c", Value::Int32(3));
        assert!(node.is_data_ready());
        node.set_lock_count(-1);
        assert!(!node.is_data_ready());
        node.set_lock_count(0);
        assert!(node.is_data_ready());
    }

    #[test]
    fn first_failure_is_sticky() {
        let node = Node::new_cache_item("n", ValueClass::Float64);
        node.fail(Failure::data("first"));
        node.fail(Failure::data("second"));
        let err = node.throw_fail_reason().unwrap_err();
        assert_eq!(err.to_string(), "Data failure: first");
        assert!(node.was_failed(FailType::Data));
        assert!(!node.was_failed(FailType::MetaInfo));
    }
}
