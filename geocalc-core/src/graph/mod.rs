//! Item Graph
//!
//! This module implements the item tree the engine computes over, together
//! with the per-node locks that coordinate producers and readers.
//!
//! # Overview
//!
//! - [`Node`]: a configured item or a cache item holding a computed result.
//!   Nodes carry an interest count, a lock count, a progress state and a
//!   sticky fail state.
//! - [`LockTable`], [`ItemReadLock`], [`ItemWriteLock`]: the lock protocol.
//!   A writer registers the scheduler producing the node so that readers can
//!   join it.
//! - [`prepare_data`] and [`RunTaskQueue`]: make a storage-backed node's
//!   data present, inline or on background workers. [`prepare_tile`] reads
//!   a single tile from backends with random tile access.
//!
//! # Design Decisions
//!
//! 1. Nodes are shared `Arc` handles. Parents own their children, children
//!    point back weakly, and cache items are owned by their controller.
//!
//! 2. Interest and `Arc` reference counts are separate: an item may be
//!    referenced without anybody wanting its data.
//!
//! 3. All lock counts change inside a single critical section, which keeps
//!    the protocol easy to reason about at the cost of some contention.

mod lock;
mod node;
mod run_task;

pub use lock::{ItemReadLock, ItemWriteLock, LockTable};
pub use node::{Node, NodeId, NodeSpec, ProgressState};
pub use run_task::{prepare_data, prepare_tile, RunTaskQueue};
