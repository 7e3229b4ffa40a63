//! Operation contexts: one scheduled evaluation of a cache entry.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::hub::HubState;
use super::{CalcContext, CancelableFrame, TaskOutcome, TaskStatus};
use crate::cache::Controller;
use crate::clock::{ChangeSourceLock, TimeStamp, TS_BERESHIT};
use crate::engine::EngineContext;
use crate::error::{EngineError, Failure, Result};
use crate::graph::{prepare_data, ItemReadLock, ItemWriteLock, Node};
use crate::notify::NotificationCode;
use crate::operator::Operator;
use crate::value::Value;

/// What a controller hands over when it schedules a calculation.
pub(crate) struct ScheduledWork {
    pub result: Arc<Node>,
    pub operator: Arc<dyn Operator>,
    pub args: Vec<Arc<Node>>,
    /// Per argument: whether its data must be present before the run.
    pub calc_args: Vec<bool>,
    pub suppliers: Vec<Arc<Scheduler>>,
}

#[derive(Default)]
struct Work {
    result: Option<Arc<Node>>,
    operator: Option<Arc<dyn Operator>>,
    args: Vec<Arc<Node>>,
    calc_args: Vec<bool>,
    read_locks: Vec<ItemReadLock>,
    write_lock: Option<ItemWriteLock>,
    /// Latest change among the arguments, the stamp of the result.
    source_ts: TimeStamp,
}

#[derive(Default)]
struct Links {
    suppliers: Vec<Arc<Scheduler>>,
    waiters: Vec<Weak<Scheduler>>,
}

/// One in-flight evaluation of a cache entry.
pub struct Scheduler {
    id: u64,
    key: Arc<str>,
    ctx: Weak<EngineContext>,
    controller: Weak<Controller>,
    status: AtomicU8,
    cancel_requested: AtomicBool,
    work: Mutex<Work>,
    links: Mutex<Links>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub(crate) fn new(ctx: &Arc<EngineContext>, controller: &Arc<Controller>) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            key: controller.key().to_string().into(),
            ctx: Arc::downgrade(ctx),
            controller: Arc::downgrade(controller),
            status: AtomicU8::new(TaskStatus::None as u8),
            cancel_requested: AtomicBool::new(false),
            work: Mutex::new(Work::default()),
            links: Mutex::new(Links::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The expression this scheduler evaluates.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// The node being produced, once scheduled.
    pub fn result(&self) -> Option<Arc<Node>> {
        self.work.lock().result.clone()
    }

    /// Suppliers not finished yet.
    pub fn supplier_count(&self) -> usize {
        self.links.lock().suppliers.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.links.lock().waiters.len()
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Take the write lock on the result, link the suppliers and queue the
    /// scheduler once none of them is pending.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        job: ScheduledWork,
    ) -> Result<TaskStatus> {
        if self.status() != TaskStatus::None {
            return Err(EngineError::AlreadyScheduled(self.key.to_string()));
        }
        // Blocking in lock_unique must happen before taking the hub lock.
        let write_lock = ItemWriteLock::new(ctx.locks(), &job.result, Some(self));
        {
            let mut state = ctx.hub().lock();
            if self.status() != TaskStatus::None {
                drop(state);
                drop(write_lock);
                return Err(EngineError::AlreadyScheduled(self.key.to_string()));
            }
            {
                let mut work = self.work.lock();
                work.result = Some(job.result);
                work.operator = Some(job.operator);
                work.args = job.args;
                work.calc_args = job.calc_args;
                work.write_lock = Some(write_lock);
            }
            self.set_status(TaskStatus::Scheduled);
            tracing::debug!(key = %self.key, suppliers = job.suppliers.len(), "scheduled");

            for supplier in &job.suppliers {
                self.connect(ctx, &mut state, supplier);
                if self.status().is_terminal() {
                    break;
                }
            }
            if self.status() == TaskStatus::Scheduled && self.links.lock().suppliers.is_empty() {
                state.scheduled.push_back(self.clone());
            }
        }
        ctx.hub().run_operation_contexts(ctx);
        Ok(self.status())
    }

    fn connect(self: &Arc<Self>, ctx: &Arc<EngineContext>, state: &mut HubState, supplier: &Arc<Scheduler>) {
        match supplier.status() {
            TaskStatus::Done => {}
            TaskStatus::Exception => {
                self.handle_fail(supplier);
                self.separate_resources(ctx, state, TaskStatus::Exception);
            }
            TaskStatus::Cancelled => self.separate_resources(ctx, state, TaskStatus::Cancelled),
            _ => {
                self.links.lock().suppliers.push(supplier.clone());
                supplier.links.lock().waiters.push(Arc::downgrade(self));
            }
        }
    }

    /// A supplier reached a terminal state.
    fn disconnect_supplier(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        state: &mut HubState,
        supplier: &Arc<Scheduler>,
        status: TaskStatus,
    ) {
        self.links
            .lock()
            .suppliers
            .retain(|s| !Arc::ptr_eq(s, supplier));
        if self.status().is_terminal() {
            return;
        }
        match status {
            TaskStatus::Done => {
                if self.status() == TaskStatus::Scheduled && self.links.lock().suppliers.is_empty() {
                    state.scheduled.push_back(self.clone());
                }
            }
            TaskStatus::Exception => {
                self.handle_fail(supplier);
                self.separate_resources(ctx, state, TaskStatus::Exception);
            }
            _ => self.separate_resources(ctx, state, TaskStatus::Cancelled),
        }
    }

    /// Propagate a supplier's failure to our result and controller.
    fn handle_fail(&self, supplier: &Scheduler) {
        let cause = supplier
            .result()
            .and_then(|node| node.fail_state())
            .map(|failure| failure.reason)
            .unwrap_or_else(|| "calculation failed".into());
        let failure = Failure::data(format!("{}: {}", supplier.key, cause));
        if let Some(result) = self.result() {
            result.fail(failure.clone());
        }
        if let Some(controller) = self.controller.upgrade() {
            controller.fail(failure);
        }
    }

    /// Move to a terminal state: release locks, leave the run queue and
    /// forward the outcome to every waiter.
    pub(crate) fn separate_resources(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        state: &mut HubState,
        status: TaskStatus,
    ) {
        let previous = self.status();
        if previous.is_terminal() {
            return;
        }
        debug_assert!(status.is_terminal());
        {
            let mut work = self.work.lock();
            work.read_locks.clear();
            work.write_lock = None;
            work.args.clear();
            work.operator = None;
        }
        if previous.is_running() {
            state.running = state.running.saturating_sub(1);
        }
        self.set_status(status);
        state.scheduled.retain(|s| !Arc::ptr_eq(s, self));

        if let Some(controller) = self.controller.upgrade() {
            controller.on_scheduler_finished(self, status);
        }

        let suppliers = std::mem::take(&mut self.links.lock().suppliers);
        for supplier in suppliers {
            supplier
                .links
                .lock()
                .waiters
                .retain(|w| !std::ptr::eq(w.as_ptr(), Arc::as_ptr(self)));
        }
        let waiters = std::mem::take(&mut self.links.lock().waiters);
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.disconnect_supplier(ctx, state, self, status);
        }

        tracing::debug!(key = %self.key, ?status, "scheduler finished");
        ctx.hub().notify_completed();
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Claim the right to run. Only one caller ever gets it per activation.
    pub(crate) fn get_unique_license_to_run(&self, state: &mut HubState) -> bool {
        if !self.status().is_runnable() {
            return false;
        }
        self.set_status(TaskStatus::Activated);
        state.running += 1;
        true
    }

    /// Execute an activated scheduler on the current thread.
    pub(crate) fn run(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        let _frame = CancelableFrame::enter_scheduler(self);
        {
            let _state = ctx.hub().lock();
            if self.status() != TaskStatus::Activated {
                return;
            }
            self.set_status(TaskStatus::Running);
        }

        let outcome = if self.cancel_if_no_interest_or_forced(false) {
            Ok(TaskOutcome::Cancelled)
        } else if ctx.signal().must_suspend() {
            Ok(TaskOutcome::Suspended)
        } else {
            self.safe_run(ctx)
        };
        self.finish(ctx, outcome);
    }

    fn safe_run(self: &Arc<Self>, ctx: &Arc<EngineContext>) -> Result<TaskOutcome<Value>, Failure> {
        let (operator, args, calc_args) = {
            let work = self.work.lock();
            (work.operator.clone(), work.args.clone(), work.calc_args.clone())
        };
        let Some(operator) = operator else {
            return Err(Failure::data(format!("no operator bound to '{}'", self.key)));
        };

        for (index, arg) in args.iter().enumerate() {
            if !calc_args.get(index).copied().unwrap_or(false) {
                continue;
            }
            match prepare_data(ctx, arg) {
                Ok(true) => {}
                Ok(false) => return Ok(TaskOutcome::Cancelled),
                Err(err) => return Err(arg_failure(index, arg, &err.to_failure())),
            }
            let lock = ItemReadLock::new(ctx.locks(), arg);
            if let Some(failure) = arg.fail_state() {
                return Err(arg_failure(index, arg, &failure));
            }
            if !arg.is_data_ready() {
                return Err(arg_failure(index, arg, &Failure::data("data not available")));
            }
            self.work.lock().read_locks.push(lock);
        }

        let source_ts = args
            .iter()
            .map(|arg| arg.last_change())
            .max()
            .unwrap_or(TS_BERESHIT);
        self.work.lock().source_ts = source_ts;
        // Changes made by the operator belong to the frame of its inputs.
        let _source = ChangeSourceLock::new(source_ts);

        let cx = CalcContext::new(self, ctx.signal());
        match panic::catch_unwind(AssertUnwindSafe(|| operator.calc_result(&args, &cx))) {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(EngineError::Failed(failure))) => Err(Failure::data(failure.reason)),
            Ok(Err(err)) => Err(Failure::data(err.to_string())),
            Err(payload) => Err(Failure::data(format!(
                "operator panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn finish(self: &Arc<Self>, ctx: &Arc<EngineContext>, outcome: Result<TaskOutcome<Value>, Failure>) {
        if matches!(outcome, Ok(TaskOutcome::Suspended)) {
            self.suspend(ctx);
            return;
        }
        let notice = {
            // Cancel check, publication and the terminal transition share
            // one hub critical section.
            let mut state = ctx.hub().lock();
            let (status, notice) = match outcome {
                Ok(TaskOutcome::Done(value)) => {
                    if self.is_cancel_requested() || ctx.signal().is_cancel_all() {
                        (TaskStatus::Cancelled, None)
                    } else {
                        let published = self.publish(value);
                        (TaskStatus::Done, published.map(|node| (node, NotificationCode::DataReady)))
                    }
                }
                Ok(TaskOutcome::Suspended) | Ok(TaskOutcome::Cancelled) => (TaskStatus::Cancelled, None),
                Err(failure) => {
                    tracing::warn!(key = %self.key, %failure, "calculation failed");
                    let result = self.result();
                    if let Some(result) = &result {
                        result.fail(failure.clone());
                    }
                    if let Some(controller) = self.controller.upgrade() {
                        controller.fail(failure);
                    }
                    (TaskStatus::Exception, result.map(|node| (node, NotificationCode::Failed)))
                }
            };
            self.separate_resources(ctx, &mut state, status);
            notice
        };
        if let Some((node, code)) = notice {
            ctx.notifications().notify(&node, code);
        }
        ctx.hub().run_operation_contexts(ctx);
    }

    /// Store the value on the (still write-locked) result.
    fn publish(&self, value: Value) -> Option<Arc<Node>> {
        let work = self.work.lock();
        let result = work.result.clone()?;
        result.assign(value, work.source_ts.max(TS_BERESHIT));
        Some(result)
    }

    /// Yield: give back the run license and the read locks, keep the write
    /// lock, and queue up to be re-driven.
    fn suspend(self: &Arc<Self>, ctx: &Arc<EngineContext>) {
        {
            let mut state = ctx.hub().lock();
            if self.status().is_terminal() {
                return;
            }
            self.work.lock().read_locks.clear();
            if self.status().is_running() {
                state.running = state.running.saturating_sub(1);
            }
            if self.is_cancel_requested() {
                self.separate_resources(ctx, &mut state, TaskStatus::Cancelled);
                return;
            }
            self.set_status(TaskStatus::Suspended);
            state.scheduled.push_back(self.clone());
            tracing::debug!(key = %self.key, "suspended");
        }
        ctx.hub().notify_completed();
    }

    // ------------------------------------------------------------------------
    // Waiting and cancelling
    // ------------------------------------------------------------------------

    /// Block until this scheduler reaches a terminal state.
    ///
    /// A runnable scheduler without pending suppliers is run inline on the
    /// joining thread unless a suspension is requested. Otherwise the
    /// joiner polls; every `wake_cycles` polls without progress it logs a
    /// warning and re-drives the run queue.
    pub fn join(self: &Arc<Self>) -> TaskStatus {
        let Some(ctx) = self.ctx.upgrade() else {
            return self.status();
        };
        let poll = ctx.config().join_poll();
        let wake_cycles = ctx.config().wake_cycles.max(1);
        let mut idle_polls = 0u32;
        loop {
            let mut state = ctx.hub().lock();
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            if status.is_runnable()
                && !ctx.signal().is_suspend_requested()
                && self.links.lock().suppliers.is_empty()
                && self.get_unique_license_to_run(&mut state)
            {
                state.scheduled.retain(|s| !Arc::ptr_eq(s, self));
                drop(state);
                tracing::trace!(key = %self.key, "running joined scheduler inline");
                self.run(&ctx);
                state = ctx.hub().lock();
                if self.status().is_terminal() {
                    continue;
                }
            }
            let timed_out = ctx.hub().wait_completed(&mut state, poll);
            drop(state);
            if timed_out {
                idle_polls += 1;
                if idle_polls % wake_cycles == 0 {
                    tracing::warn!(key = %self.key, polls = idle_polls, "join made no progress, re-driving");
                    ctx.hub().run_operation_contexts(&ctx);
                }
            }
        }
    }

    /// Cancel when nobody is interested in the result any more, or when
    /// `forced`. Returns true when the scheduler is (or will be) cancelled.
    ///
    /// A running scheduler only gets a cancel request; it stops at its next
    /// safe point and never publishes its result.
    pub fn cancel_if_no_interest_or_forced(self: &Arc<Self>, forced: bool) -> bool {
        let Some(ctx) = self.ctx.upgrade() else {
            self.cancel_requested.store(true, Ordering::SeqCst);
            return true;
        };
        let forced = forced || ctx.signal().is_cancel_all();
        let interest = self
            .controller
            .upgrade()
            .map_or(0, |controller| controller.interest_count());
        if interest > 0 && !forced {
            return false;
        }

        let mut state = ctx.hub().lock();
        let status = self.status();
        if status.is_terminal() {
            return status == TaskStatus::Cancelled;
        }
        if status.is_running() {
            self.cancel_requested.store(true, Ordering::SeqCst);
            return true;
        }
        self.separate_resources(&ctx, &mut state, TaskStatus::Cancelled);
        true
    }
}

fn arg_failure(index: usize, arg: &Node, cause: &Failure) -> Failure {
    Failure::data(format!("argument {} ({}): {}", index + 1, arg.name(), cause.reason))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
