//! Data preparation for storage-backed nodes.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::lock::ItemWriteLock;
use super::node::{Node, ProgressState};
use crate::engine::EngineContext;
use crate::error::{EngineError, Failure, Result};
use crate::notify::NotificationCode;
use crate::scheduler::CancelableFrame;
use crate::storage::{StorageBinding, TileId};

/// Make the data of `node` present.
///
/// Computed nodes are produced by their scheduler; for those this only
/// reports readiness. Storage-backed nodes are read tile by tile under the
/// node's write lock, each missing tile exactly once. A backend that
/// delivers nothing (or errors) leaves a Data failure naming the storage and
/// the item.
///
/// Interest is checked before every tile. Once nobody wants the node the
/// read stops and `Ok(false)` is returned; tiles read so far are kept and
/// the node stays neither ready nor failed.
pub fn prepare_data(ctx: &Arc<EngineContext>, node: &Arc<Node>) -> Result<bool> {
    if node.is_data_ready() {
        return Ok(true);
    }
    node.throw_fail_reason()?;
    let Some(binding) = node.storage().cloned() else {
        return Ok(node.is_data_ready());
    };

    let _write = ItemWriteLock::new(ctx.locks(), node, None);
    if node.progress() >= ProgressState::Validated && !node.is_failed() {
        return Ok(true);
    }
    node.throw_fail_reason()?;

    let _frame = CancelableFrame::enter_node(node);
    for tile in 0..node.tile_count() {
        if node.has_tile(tile) {
            continue;
        }
        if CancelableFrame::cancel_if_out_of_interest() {
            tracing::debug!(node = %node.full_name(), tile, "storage read abandoned");
            return Ok(false);
        }
        read_stored_tile(ctx, &binding, node, tile)?;
    }

    node.validate(node.last_change());
    tracing::debug!(node = %node.full_name(), tiles = node.tile_count(), "data read");
    ctx.notifications().notify(node, NotificationCode::Validated);
    Ok(true)
}

/// Make one tile of `node` present.
///
/// Backends that allow random tile access get asked for just that tile;
/// the node validates once its last tile arrived. Other backends read the
/// whole node through [`prepare_data`].
pub fn prepare_tile(ctx: &Arc<EngineContext>, node: &Arc<Node>, tile: TileId) -> Result<bool> {
    if tile >= node.tile_count() {
        return Err(EngineError::InvalidArgument(format!(
            "tile {tile} out of range for {} ({} tiles)",
            node.full_name(),
            node.tile_count()
        )));
    }
    node.throw_fail_reason()?;
    let Some(binding) = node.storage().cloned() else {
        return Ok(node.has_tile(tile));
    };
    if !binding.manager.allow_random_tile_access() {
        return prepare_data(ctx, node);
    }

    let _write = ItemWriteLock::new(ctx.locks(), node, None);
    if node.has_tile(tile) {
        return Ok(true);
    }
    node.throw_fail_reason()?;
    read_stored_tile(ctx, &binding, node, tile)?;

    if (0..node.tile_count()).all(|t| node.has_tile(t)) {
        node.validate(node.last_change());
        ctx.notifications().notify(node, NotificationCode::Validated);
    }
    Ok(true)
}

/// Read one tile from the backend; a miss fails the node.
fn read_stored_tile(
    ctx: &EngineContext,
    binding: &StorageBinding,
    node: &Node,
    tile: TileId,
) -> Result<()> {
    let failure = match binding.manager.read_item(&binding.meta, node, tile) {
        Ok(true) => return Ok(()),
        Ok(false) => Failure::data(format!(
            "Cannot read {} from storage {}",
            node.full_name(),
            binding.meta.storage_name
        )),
        Err(err) => Failure::data(format!(
            "reading {} from storage {}: {}",
            node.full_name(),
            binding.meta.storage_name,
            err
        )),
    };
    tracing::warn!(node = %node.full_name(), tile, %failure, "storage read failed");
    node.fail(failure.clone());
    ctx.notifications().notify(node, NotificationCode::Failed);
    Err(EngineError::Failed(failure))
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Weak<Node>>,
    workers: usize,
}

/// Background preparation of nodes somebody is interested in.
#[derive(Debug, Default)]
pub struct RunTaskQueue {
    state: Mutex<QueueState>,
}

impl RunTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().workers
    }

    /// Get `node`'s data prepared. Runs inline in single-threaded mode,
    /// otherwise queues the node for a background worker.
    pub fn run_task(&self, ctx: &Arc<EngineContext>, node: &Arc<Node>) -> Result<()> {
        if node.is_data_ready() {
            return Ok(());
        }
        let max_workers = ctx.config().run_task_workers;
        if !ctx.config().multi_threading || max_workers == 0 {
            return prepare_data(ctx, node).map(|_| ());
        }

        let start_worker = {
            let mut state = self.state.lock();
            state.pending.push_back(Arc::downgrade(node));
            if state.workers < max_workers {
                state.workers += 1;
                true
            } else {
                false
            }
        };
        if start_worker {
            let weak = Arc::downgrade(ctx);
            if !ctx.spawn(move || run_task_worker(weak)) {
                self.state.lock().workers -= 1;
                return prepare_data(ctx, node).map(|_| ());
            }
        }
        Ok(())
    }
}

fn run_task_worker(ctx: Weak<EngineContext>) {
    loop {
        let Some(ctx) = ctx.upgrade() else {
            return;
        };
        let next = {
            let mut state = ctx.run_tasks().state.lock();
            match state.pending.pop_front() {
                Some(next) => next,
                None => {
                    state.workers -= 1;
                    return;
                }
            }
        };
        let Some(node) = next.upgrade() else {
            continue;
        };
        if node.interest_count() == 0 {
            tracing::trace!(node = %node.name(), "skipping node without interest");
            continue;
        }
        if let Err(err) = prepare_data(&ctx, &node) {
            tracing::debug!(node = %node.full_name(), %err, "background preparation failed");
        }
    }
}
