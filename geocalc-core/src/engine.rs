//! Engine Context
//!
//! [`EngineContext`] owns every shared component of one calculation
//! session: the change clock, operator registry, result cache, lock table,
//! scheduler hub, run-task queue, cancellation signal, notification hub and
//! the root of the item tree. Components reach each other through it
//! instead of through process globals.
//!
//! # Lifecycle
//!
//! 1. `EngineContext::new(config)` validates the configuration and, when
//!    multi-threading is enabled, starts the worker runtime.
//! 2. The host builds its item tree (`create_item`, `create_stored_item`),
//!    registers operators and requests values.
//! 3. `shutdown` (or dropping the last handle) cancels in-flight work and
//!    stops the workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use geocalc_core::{EngineConfig, EngineContext, FnOperator, Value, ValueClass};
//!
//! let engine = EngineContext::new(EngineConfig::default())?;
//! engine.registry().register(
//!     "add",
//!     FnOperator::new(&[ValueClass::Float64, ValueClass::Float64], ValueClass::Float64, |v| {
//!         Ok(Value::Float64(v[0].as_f64()? + v[1].as_f64()?))
//!     })
//!     .into_arc(),
//! );
//! let a = engine.create_item("a", ValueClass::Float64)?;
//! engine.set_value(&a, Value::Float64(2.0))?;
//! assert_eq!(engine.evaluate("(add a 3)")?, Value::Float64(5.0));
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

use crate::cache::{Controller, Expr, ResultCache};
use crate::clock::TimeClock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{prepare_tile, ItemReadLock, ItemWriteLock, LockTable, Node, NodeSpec, RunTaskQueue};
use crate::notify::{NotificationCode, NotificationHub};
use crate::operator::OperatorRegistry;
use crate::scheduler::{CancellationSignal, SchedulerHub};
use crate::storage::{StorageBinding, SyncMode, TileId};
use crate::value::{Value, ValueClass};

/// One calculation session.
pub struct EngineContext {
    config: EngineConfig,
    clock: TimeClock,
    locks: Arc<LockTable>,
    registry: OperatorRegistry,
    cache: ResultCache,
    hub: SchedulerHub,
    run_tasks: RunTaskQueue,
    signal: CancellationSignal,
    notifications: Arc<NotificationHub>,
    root: Arc<Node>,
    runtime: Mutex<Option<Runtime>>,
    handle: Option<Handle>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("cache_entries", &self.cache.len())
            .field("running", &self.hub.running_count())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let runtime = if config.multi_threading {
            let runtime = Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(config.max_threads + config.run_task_workers.max(1))
                .thread_name(config.thread_name.clone())
                .enable_all()
                .build()
                .map_err(|e| EngineError::Config(format!("cannot start worker runtime: {e}")))?;
            Some(runtime)
        } else {
            None
        };
        let handle = runtime.as_ref().map(|rt| rt.handle().clone());

        tracing::debug!(
            multi_threading = config.multi_threading,
            max_threads = config.max_threads,
            run_task_workers = config.run_task_workers,
            "engine created"
        );

        Ok(Arc::new(Self {
            config,
            clock: TimeClock::new(),
            locks: Arc::new(LockTable::new()),
            registry: OperatorRegistry::new(),
            cache: ResultCache::new(),
            hub: SchedulerHub::new(),
            run_tasks: RunTaskQueue::new(),
            signal: CancellationSignal::new(),
            notifications: Arc::new(NotificationHub::new()),
            root: Node::new_root("root"),
            runtime: Mutex::new(runtime),
            handle,
            shut_down: AtomicBool::new(false),
        }))
    }

    // ------------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &TimeClock {
        &self.clock
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn hub(&self) -> &SchedulerHub {
        &self.hub
    }

    pub fn run_tasks(&self) -> &RunTaskQueue {
        &self.run_tasks
    }

    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `job` on the worker pool. Returns false when no pool is
    /// available (single-threaded or shut down).
    pub(crate) fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.handle {
            Some(handle) if !self.is_shut_down() => {
                handle.spawn_blocking(job);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Item tree
    // ------------------------------------------------------------------------

    /// Create (or replace) the item at `path`, creating missing parents.
    pub fn create_item(&self, path: &str, class: ValueClass) -> Result<Arc<Node>> {
        self.create_node(path, class, NodeSpec::default())
    }

    /// Create an item whose data is read from `binding` on demand.
    pub fn create_stored_item(
        &self,
        path: &str,
        class: ValueClass,
        binding: StorageBinding,
    ) -> Result<Arc<Node>> {
        self.create_node(
            path,
            class,
            NodeSpec {
                storage: Some(binding),
                ..NodeSpec::default()
            },
        )
    }

    fn create_node(&self, path: &str, class: ValueClass, spec: NodeSpec) -> Result<Arc<Node>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((name, parents)) = segments.split_last() else {
            return Err(EngineError::ItemNotFound(path.to_string()));
        };
        let mut parent = self.root.clone();
        for segment in parents {
            parent = match parent.child(segment) {
                Some(existing) => existing,
                None => Node::new_child(&parent, segment, ValueClass::Any, NodeSpec::default()),
            };
        }
        let node = Node::new_child(&parent, name, class, spec);
        node.stamp(self.clock.active_ts());
        tracing::debug!(item = %node.full_name(), %class, "item created");
        Ok(node)
    }

    pub fn find_item(&self, path: &str) -> Result<Arc<Node>> {
        self.root
            .find_item(path)
            .ok_or_else(|| EngineError::ItemNotFound(path.to_string()))
    }

    /// Replace the data of a configuration item. Results derived from it
    /// become stale.
    pub fn set_value(&self, node: &Arc<Node>, value: Value) -> Result<()> {
        if !value.class().is_derived_from(node.class()) {
            return Err(EngineError::TypeMismatch {
                expected: node.class().to_string(),
                found: value.class().to_string(),
            });
        }
        {
            let _write = ItemWriteLock::new(&self.locks, node, None);
            node.assign(value, self.clock.active_ts());
        }
        self.notifications.notify(node, NotificationCode::DataReady);
        Ok(())
    }

    pub fn set_item_value(&self, path: &str, value: Value) -> Result<()> {
        let node = self.find_item(path)?;
        self.set_value(&node, value)
    }

    /// Mark an item changed. Storage-backed data is dropped and read again
    /// on the next demand.
    pub fn invalidate_item(&self, node: &Arc<Node>) {
        {
            let _write = ItemWriteLock::new(&self.locks, node, None);
            if node.storage().is_some() {
                node.drop_data();
            }
            node.stamp(self.clock.active_ts());
        }
        tracing::debug!(item = %node.full_name(), "item invalidated");
        self.notifications.notify(node, NotificationCode::Invalidated);
    }

    // ------------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------------

    /// One tile of `node`, read from its storage when missing.
    pub fn read_tile(self: &Arc<Self>, node: &Arc<Node>, tile: TileId) -> Result<Value> {
        if !node.has_tile(tile) && !prepare_tile(self, node, tile)? {
            return Err(EngineError::Cancelled(node.full_name()));
        }
        node.tile(tile)
    }

    /// Write a stored item's data back to its storage and mark it committed.
    pub fn commit_item(&self, node: &Arc<Node>) -> Result<()> {
        let binding = Self::binding_of(node)?;
        let storage_error = |message: String| EngineError::Storage {
            storage: binding.meta.storage_name.clone(),
            message,
        };
        if !binding.manager.can_write_tiles() {
            return Err(storage_error(format!("{} is read-only", node.full_name())));
        }
        {
            let _read = ItemReadLock::new(&self.locks, node);
            node.throw_fail_reason()?;
            if !node.is_data_ready() {
                return Err(storage_error(format!("no data to write for {}", node.full_name())));
            }
            match binding.manager.write_item(&binding.meta, node) {
                Ok(true) => node.set_committed(),
                Ok(false) => {
                    return Err(storage_error(format!("Cannot write {}", node.full_name())));
                }
                Err(err) => {
                    tracing::warn!(item = %node.full_name(), %err, "storage write failed");
                    return Err(storage_error(format!("writing {}: {err}", node.full_name())));
                }
            }
        }
        tracing::debug!(item = %node.full_name(), storage = %binding.meta.storage_name, "committed");
        self.notifications.notify(node, NotificationCode::Committed);
        Ok(())
    }

    /// Let the storage behind `holder` create or update the items that
    /// mirror it.
    pub fn sync_storage(&self, holder: &Arc<Node>, mode: SyncMode) -> Result<()> {
        let binding = Self::binding_of(holder)?;
        {
            let _write = ItemWriteLock::new(&self.locks, holder, None);
            binding
                .manager
                .sync_tree(holder, mode)
                .map_err(|err| EngineError::Storage {
                    storage: binding.meta.storage_name.clone(),
                    message: err.to_string(),
                })?;
            holder.stamp(self.clock.active_ts());
        }
        tracing::debug!(item = %holder.full_name(), ?mode, children = holder.children().len(), "storage synced");
        self.notifications.notify(holder, NotificationCode::MetaReady);
        Ok(())
    }

    fn binding_of(node: &Node) -> Result<StorageBinding> {
        node.storage().cloned().ok_or_else(|| {
            EngineError::InvalidArgument(format!("{} has no storage", node.full_name()))
        })
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    /// The controller for `expr`, created when missing.
    pub fn controller(self: &Arc<Self>, expr: &Expr) -> Result<Arc<Controller>> {
        self.cache.get_or_create(self, expr)
    }

    /// Parse, resolve and calculate an expression, blocking until done.
    ///
    /// Interest is held only for the duration of the call.
    pub fn evaluate(self: &Arc<Self>, text: &str) -> Result<Value> {
        let expr = Expr::parse(text)?;
        self.evaluate_expr(&expr)
    }

    pub fn evaluate_expr(self: &Arc<Self>, expr: &Expr) -> Result<Value> {
        let controller = self.controller(expr)?;
        let _interest = controller.hold_interest();
        controller.calc_result(None)?.value()
    }

    // ------------------------------------------------------------------------
    // Suspension and cancellation
    // ------------------------------------------------------------------------

    /// Ask running calculations to yield at their next safe point.
    pub fn request_suspend(&self) {
        self.signal.request_suspend();
    }

    /// Lift a suspension request and re-drive suspended calculations.
    pub fn resume(self: &Arc<Self>) {
        self.signal.clear_suspend();
        self.hub.run_operation_contexts(self);
    }

    /// Cancel all work regardless of interest. Stays in effect until
    /// [`reset_cancel_all`](Self::reset_cancel_all).
    pub fn cancel_all(self: &Arc<Self>) {
        self.signal.cancel_all();
        let cancelled = self.hub.cancel_queued(self);
        tracing::debug!(cancelled, "cancelled all work");
    }

    pub fn reset_cancel_all(&self) {
        self.signal.reset_cancel_all();
    }

    /// Cancel everything and stop the worker runtime.
    pub fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_all();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::debug!("engine shut down");
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
