//! Cache controllers
//!
//! A [`Controller`] owns the lazily computed result of one expression key.
//! Its kind decides how the result is obtained: a symbol resolves to an
//! item of the configuration tree, a literal to a constant node, and a
//! function call to a cache item computed by an operator from the results
//! of its argument controllers.
//!
//! # Phases
//!
//! - [`Controller::make_result`] resolves the result node with its class
//!   (MetaInfo) without computing any data.
//! - [`Controller::calc_result`] additionally starts (or attaches to) the
//!   calculation and returns a [`FutureNode`].
//!
//! # Locking
//!
//! Interest changes take the controller's state lock and then the state
//! locks of argument controllers (parent before child). Schedulers are
//! never cancelled or scheduled while a state lock is held.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::explain::ExplainContext;
use super::expr::Expr;
use crate::clock::{DetermineChangeLock, TimeStamp, TS_BERESHIT, TS_UNDEFINED};
use crate::engine::EngineContext;
use crate::error::{EngineError, FailType, Failure, Result};
use crate::graph::{prepare_data, Node};
use crate::notify::NotificationCode;
use crate::operator::{must_calc_arg, Operator, OperatorGroup};
use crate::scheduler::{ScheduledWork, Scheduler, TaskStatus};
use crate::value::{Value, ValueClass};

/// How a controller obtains its result.
#[derive(Debug)]
pub enum ControllerKind {
    /// An item of the configuration tree, by full name.
    Symbol { name: Arc<str> },
    /// A constant.
    Literal(Value),
    /// An operator applied to the results of other controllers.
    Call {
        group: Arc<OperatorGroup>,
        args: Vec<Arc<Controller>>,
    },
}

#[derive(Default)]
struct ControllerState {
    result: Option<Arc<Node>>,
    operator: Option<Arc<dyn Operator>>,
    scheduler: Option<Arc<Scheduler>>,
    calc_started: bool,
    /// Clock value observed when the result was resolved.
    supplier_ts: TimeStamp,
    fail: Option<Failure>,
    /// Whether this controller holds one unit of interest on `result`.
    holds_node_interest: bool,
    /// Interest on `CalcAlways` arguments, held while the result is resolved.
    pinned: Vec<InterestGuard>,
}

enum InterestDrop {
    Remaining(u32),
    /// The last unit was dropped; carries the scheduler still in flight.
    Released(Option<Arc<Scheduler>>),
}

/// Cache entry owning the result of one expression key.
pub struct Controller {
    key: Expr,
    kind: ControllerKind,
    ctx: Weak<EngineContext>,
    shared: bool,
    interest: AtomicU32,
    state: Mutex<ControllerState>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("key", &self.key.to_string())
            .field("shared", &self.shared)
            .field("interest", &self.interest_count())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Build the controller for `key`, resolving argument controllers
    /// through the cache. Not yet published in the cache map.
    pub(crate) fn build(ctx: &Arc<EngineContext>, key: &Expr) -> Result<Arc<Self>> {
        let (kind, shared) = match key {
            Expr::Symbol(name) => (ControllerKind::Symbol { name: name.clone() }, true),
            Expr::Number(n) => (ControllerKind::Literal(Value::Float64(n.get())), true),
            Expr::UInt64(n) => (ControllerKind::Literal(Value::UInt64(*n)), true),
            Expr::String(s) => (ControllerKind::Literal(Value::String(s.clone())), true),
            Expr::Call { op, args } => {
                let group = ctx.registry().find_or_create_common_group(op);
                let args = args
                    .iter()
                    .map(|arg| ctx.cache().get_or_create(ctx, arg))
                    .collect::<Result<Vec<_>>>()?;
                let shared = group.must_cache_result();
                (ControllerKind::Call { group, args }, shared)
            }
        };
        Ok(Arc::new(Self {
            key: key.clone(),
            kind,
            ctx: Arc::downgrade(ctx),
            shared,
            interest: AtomicU32::new(0),
            state: Mutex::new(ControllerState::default()),
        }))
    }

    pub fn key(&self) -> &Expr {
        &self.key
    }

    pub fn kind(&self) -> &ControllerKind {
        &self.kind
    }

    /// Whether this controller is the published cache entry for its key.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn interest_count(&self) -> u32 {
        self.interest.load(Ordering::SeqCst)
    }

    /// The resolved result node, if any.
    pub fn result(&self) -> Option<Arc<Node>> {
        self.state.lock().result.clone()
    }

    /// The scheduler computing the result, while one is attached.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.state.lock().scheduler.clone()
    }

    pub fn fail_state(&self) -> Option<Failure> {
        self.state.lock().fail.clone()
    }

    pub fn is_calc_started(&self) -> bool {
        self.state.lock().calc_started
    }

    fn context(&self) -> Result<Arc<EngineContext>> {
        self.ctx.upgrade().ok_or(EngineError::ContextDropped)
    }

    /// Record a failure. The first one is kept until invalidation.
    pub(crate) fn fail(&self, failure: Failure) {
        let mut state = self.state.lock();
        if state.fail.is_none() {
            tracing::debug!(key = %self.key, %failure, "controller failed");
            state.fail = Some(failure);
        }
    }

    fn fail_meta(&self, reason: impl Into<Arc<str>>, supplier_ts: TimeStamp) -> EngineError {
        let failure = Failure::meta_info(reason);
        let mut state = self.state.lock();
        state.supplier_ts = supplier_ts;
        let recorded = state.fail.get_or_insert(failure).clone();
        EngineError::Failed(recorded)
    }

    // ------------------------------------------------------------------------
    // Interest
    // ------------------------------------------------------------------------

    /// Hold interest until the returned guard is dropped.
    pub fn hold_interest(self: &Arc<Self>) -> InterestGuard {
        self.start_interest();
        InterestGuard {
            controller: self.clone(),
        }
    }

    pub fn start_interest(&self) -> u32 {
        let mut state = self.state.lock();
        let count = self.interest.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            if let Some(node) = state.result.clone() {
                node.start_interest();
                state.holds_node_interest = true;
            }
            if let ControllerKind::Call { args, .. } = &self.kind {
                for arg in args {
                    arg.start_interest();
                }
            }
        }
        count
    }

    /// Drop one unit of interest. At zero the result's data is released,
    /// argument interest is dropped and a pending calculation is cancelled
    /// unless interest came back in the meantime.
    pub fn stop_interest(&self) -> u32 {
        match self.release_interest() {
            InterestDrop::Remaining(count) => count,
            InterestDrop::Released(in_flight) => {
                self.after_release(in_flight);
                0
            }
        }
    }

    /// The part of `stop_interest` done under the state lock.
    ///
    /// A scheduler in flight stays attached; it detaches itself once it
    /// reaches a terminal state.
    fn release_interest(&self) -> InterestDrop {
        let mut state = self.state.lock();
        let count = self.interest.load(Ordering::SeqCst);
        if count == 0 {
            tracing::warn!(key = %self.key, "stop_interest without matching start_interest");
            return InterestDrop::Remaining(0);
        }
        self.interest.store(count - 1, Ordering::SeqCst);
        if count > 1 {
            return InterestDrop::Remaining(count - 1);
        }
        if state.holds_node_interest {
            if let Some(node) = &state.result {
                node.stop_interest();
            }
            state.holds_node_interest = false;
        }
        let in_flight = state
            .scheduler
            .as_ref()
            .filter(|s| s.status() != TaskStatus::None && !s.status().is_terminal())
            .cloned();
        if in_flight.is_none() {
            state.calc_started = false;
        }
        InterestDrop::Released(in_flight)
    }

    fn after_release(&self, in_flight: Option<Arc<Scheduler>>) {
        if let ControllerKind::Call { args, .. } = &self.kind {
            for arg in args {
                arg.stop_interest();
            }
        }
        match in_flight {
            Some(scheduler) => {
                scheduler.cancel_if_no_interest_or_forced(false);
            }
            None if self.is_transient() => self.forget_transient_result(),
            None => {}
        }
    }

    /// Transient results are not kept once nobody is interested, not even
    /// their meta info.
    fn forget_transient_result(&self) {
        let pinned = {
            let mut state = self.state.lock();
            if self.interest_count() > 0 || state.calc_started {
                return;
            }
            tracing::trace!(key = %self.key, "dropping transient result");
            state.result = None;
            state.operator = None;
            state.fail = None;
            state.supplier_ts = TS_UNDEFINED;
            std::mem::take(&mut state.pinned)
        };
        drop(pinned);
    }

    fn is_transient(&self) -> bool {
        matches!(&self.kind, ControllerKind::Call { group, .. } if group.policy().is_transient)
    }

    // ------------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------------

    /// Forget the result, failure and calculation state. A running
    /// calculation is cancelled; the next demand recomputes.
    pub fn invalidate(&self) {
        let (scheduler, node, pinned) = {
            let mut state = self.state.lock();
            let node = state.result.take();
            if state.holds_node_interest {
                if let Some(node) = &node {
                    node.stop_interest();
                }
                state.holds_node_interest = false;
            }
            state.fail = None;
            state.operator = None;
            state.calc_started = false;
            state.supplier_ts = TS_UNDEFINED;
            (state.scheduler.take(), node, std::mem::take(&mut state.pinned))
        };
        drop(pinned);
        if let Some(scheduler) = scheduler {
            scheduler.cancel_if_no_interest_or_forced(true);
        }
        tracing::debug!(key = %self.key, "invalidated");
        if let (Some(node), Some(ctx)) = (node, self.ctx.upgrade()) {
            ctx.notifications().notify(&node, NotificationCode::Invalidated);
        }
    }

    /// Latest change among the items this controller derives from.
    pub fn last_change_ts(&self, ctx: &EngineContext) -> TimeStamp {
        match &self.kind {
            ControllerKind::Literal(_) => TS_BERESHIT,
            ControllerKind::Symbol { name } => ctx
                .root()
                .find_item(name)
                .map_or(TS_UNDEFINED, |item| item.last_change()),
            ControllerKind::Call { args, .. } => args
                .iter()
                .map(|arg| arg.last_change_ts(ctx))
                .max()
                .unwrap_or(TS_BERESHIT),
        }
    }

    /// Invalidate when a supplier changed after the result was resolved.
    fn revalidate(&self, ctx: &EngineContext) {
        let determine = DetermineChangeLock::new();
        let stale = match &self.kind {
            ControllerKind::Literal(_) => false,
            ControllerKind::Symbol { name } => {
                let (result, failed) = {
                    let state = self.state.lock();
                    (state.result.clone(), state.fail.is_some())
                };
                match (result, ctx.root().find_item(name)) {
                    (Some(current), Some(found)) => !Arc::ptr_eq(&current, &found),
                    (Some(_), None) => true,
                    (None, Some(_)) => failed,
                    (None, None) => false,
                }
            }
            ControllerKind::Call { args, .. } => {
                let (resolved, supplier_ts) = {
                    let state = self.state.lock();
                    (state.result.is_some() || state.fail.is_some(), state.supplier_ts)
                };
                resolved
                    && args
                        .iter()
                        .map(|arg| arg.last_change_ts(ctx))
                        .max()
                        .is_some_and(|latest| latest > supplier_ts)
            }
        };
        drop(determine);
        if stale {
            tracing::debug!(key = %self.key, "supplier changed");
            self.invalidate();
        }
    }

    // ------------------------------------------------------------------------
    // MetaInfo
    // ------------------------------------------------------------------------

    /// Resolve the result node and its class without computing data.
    ///
    /// For calls this resolves every argument first. An argument that fails
    /// to resolve makes this controller fail at MetaInfo level too.
    pub fn make_result(self: &Arc<Self>) -> Result<Arc<Node>> {
        let ctx = self.context()?;
        self.revalidate(&ctx);
        {
            let state = self.state.lock();
            if let Some(node) = &state.result {
                return Ok(node.clone());
            }
            if let Some(failure) = &state.fail {
                if failure.kind == FailType::MetaInfo {
                    return Err(EngineError::Failed(failure.clone()));
                }
            }
        }

        let supplier_ts = ctx.clock().last_ts();
        let mut pinned = Vec::new();
        let (node, operator) = match &self.kind {
            ControllerKind::Literal(value) => {
                (Node::new_constant(&self.key.to_string(), value.clone()), None)
            }
            ControllerKind::Symbol { name } => match ctx.root().find_item(name) {
                Some(item) => (item, None),
                None => {
                    let err = EngineError::ItemNotFound(name.to_string());
                    return Err(self.fail_meta(err.to_string(), supplier_ts));
                }
            },
            ControllerKind::Call { group, args } => {
                let mut classes: SmallVec<[ValueClass; 4]> = SmallVec::new();
                for (index, arg) in args.iter().enumerate() {
                    match arg.make_result() {
                        Ok(arg_node) => classes.push(arg_node.class()),
                        Err(err) => {
                            let reason = format!(
                                "argument {} ({}): {}",
                                index + 1,
                                arg.key(),
                                err.to_failure().reason
                            );
                            return Err(self.fail_meta(reason, supplier_ts));
                        }
                    }
                }
                for (index, arg) in args.iter().enumerate() {
                    if !must_calc_arg(group.arg_policy(index, None), false) {
                        continue;
                    }
                    // Needed even for meta info; kept while the result lives.
                    let guard = arg.hold_interest();
                    if let Err(err) = arg.calc_result(None).and_then(|future| future.wait()) {
                        let reason = format!(
                            "argument {} ({}): {}",
                            index + 1,
                            arg.key(),
                            err.to_failure().reason
                        );
                        drop(guard);
                        return Err(self.fail_meta(reason, supplier_ts));
                    }
                    pinned.push(guard);
                }
                let operator = group
                    .find_oper(&classes)
                    .map_err(|err| self.fail_meta(err.to_string(), supplier_ts))?;
                let class = operator
                    .result_class(&classes)
                    .map_err(|err| self.fail_meta(err.to_string(), supplier_ts))?;
                (
                    Node::new_cache_item(&self.key.to_string(), class),
                    Some(operator),
                )
            }
        };

        let node = {
            let mut state = self.state.lock();
            if let Some(existing) = state.result.clone() {
                drop(state);
                drop(pinned);
                return Ok(existing);
            }
            state.result = Some(node.clone());
            state.supplier_ts = supplier_ts;
            state.operator = operator;
            state.pinned = pinned;
            if state.scheduler.is_none() && matches!(self.kind, ControllerKind::Call { .. }) {
                state.scheduler = Some(Scheduler::new(&ctx, self));
            }
            if self.interest_count() > 0 && !state.holds_node_interest {
                node.start_interest();
                state.holds_node_interest = true;
            }
            node
        };
        tracing::debug!(key = %self.key, class = %node.class(), "resolved");
        ctx.notifications().notify(&node, NotificationCode::MetaReady);
        Ok(node)
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Start or attach to the calculation of the result.
    ///
    /// Requires interest. A call schedules its calculation at most once
    /// per lifetime of its result; later requests share the same
    /// scheduler. Argument failures become Data failures of this result
    /// naming the argument.
    pub fn calc_result(
        self: &Arc<Self>,
        explain: Option<&mut ExplainContext>,
    ) -> Result<FutureNode> {
        if self.interest_count() == 0 {
            return Err(EngineError::NoInterest(self.key.to_string()));
        }
        let ctx = self.context()?;
        let node = self.make_result()?;

        match &self.kind {
            ControllerKind::Literal(_) => Ok(FutureNode::new(node, None, &ctx)),
            ControllerKind::Symbol { .. } => {
                if !node.is_data_ready() {
                    node.throw_fail_reason()?;
                    ctx.run_tasks().run_task(&ctx, &node)?;
                }
                Ok(FutureNode::new(node, None, &ctx))
            }
            ControllerKind::Call { group, args } => {
                self.calc_call(&ctx, node, group, args, explain)
            }
        }
    }

    fn calc_call(
        self: &Arc<Self>,
        ctx: &Arc<EngineContext>,
        node: Arc<Node>,
        group: &Arc<OperatorGroup>,
        args: &[Arc<Controller>],
        mut explain: Option<&mut ExplainContext>,
    ) -> Result<FutureNode> {
        node.throw_fail_reason()?;
        if let Some(failure) = self.fail_state() {
            return Err(EngineError::Failed(failure));
        }
        if let Some(explain) = explain.as_deref_mut() {
            if group.policy().can_explain_value {
                explain.record(&self.key, node.is_data_ready());
            }
        }
        if node.is_data_ready() {
            return Ok(FutureNode::new(node, None, ctx));
        }

        let (scheduler, operator) = {
            let mut state = self.state.lock();
            if state.calc_started && state.scheduler.is_some() {
                return Ok(FutureNode::new(node, state.scheduler.clone(), ctx));
            }
            let unscheduled = state
                .scheduler
                .as_ref()
                .filter(|existing| existing.status() == TaskStatus::None)
                .cloned();
            let scheduler = match unscheduled {
                Some(existing) => existing,
                None => {
                    let fresh = Scheduler::new(ctx, self);
                    state.scheduler = Some(fresh.clone());
                    fresh
                }
            };
            state.calc_started = true;
            (scheduler, state.operator.clone())
        };
        let Some(operator) = operator else {
            scheduler.cancel_if_no_interest_or_forced(true);
            return Err(EngineError::Failed(Failure::meta_info(format!(
                "no operator resolved for '{}'",
                self.key
            ))));
        };

        let first_value = if group.policy().dynamic_argument_policies {
            args.first()
                .and_then(|first| first.make_result().ok())
                .and_then(|first| {
                    prepare_data(ctx, &first).ok()?;
                    first.value().ok()
                })
        } else {
            None
        };

        let mut arg_nodes = Vec::with_capacity(args.len());
        let mut calc_args = Vec::with_capacity(args.len());
        let mut suppliers = Vec::new();
        if let Some(explain) = explain.as_deref_mut() {
            explain.enter();
        }
        let mut failed = None;
        for (index, arg) in args.iter().enumerate() {
            let policy = group.arg_policy(index, first_value.as_ref());
            let calc = must_calc_arg(policy, true);
            let arg_node = if calc {
                match arg.calc_result(explain.as_deref_mut()) {
                    Ok(future) => {
                        if let Some(supplier) = future.scheduler() {
                            suppliers.push(supplier.clone());
                        }
                        future.node().clone()
                    }
                    Err(err) => {
                        failed = Some(self.fail_data_arg(ctx, &node, index, arg, &err));
                        break;
                    }
                }
            } else {
                match arg.make_result() {
                    Ok(arg_node) => arg_node,
                    Err(err) => {
                        failed = Some(err);
                        break;
                    }
                }
            };
            arg_nodes.push(arg_node);
            calc_args.push(calc);
        }
        if let Some(explain) = explain.as_deref_mut() {
            explain.leave();
        }
        if let Some(err) = failed {
            scheduler.cancel_if_no_interest_or_forced(true);
            return Err(err);
        }

        let job = ScheduledWork {
            result: node.clone(),
            operator,
            args: arg_nodes,
            calc_args,
            suppliers,
        };
        scheduler.schedule(ctx, job)?;
        Ok(FutureNode::new(node, Some(scheduler), ctx))
    }

    fn fail_data_arg(
        &self,
        ctx: &EngineContext,
        node: &Node,
        index: usize,
        arg: &Controller,
        err: &EngineError,
    ) -> EngineError {
        let failure = Failure::data(format!(
            "argument {} ({}): {}",
            index + 1,
            arg.key(),
            err.to_failure().reason
        ));
        node.fail(failure.clone());
        self.fail(failure.clone());
        ctx.notifications().notify(node, NotificationCode::Failed);
        EngineError::Failed(failure)
    }

    /// Called by the scheduler when it reaches a terminal state.
    pub(crate) fn on_scheduler_finished(&self, scheduler: &Arc<Scheduler>, status: TaskStatus) {
        let mut state = self.state.lock();
        let current = state
            .scheduler
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(s, scheduler));
        if !current {
            return;
        }
        state.scheduler = None;
        if status == TaskStatus::Cancelled {
            state.calc_started = false;
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.shared {
            return;
        }
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.cache().remove_entry(&self.key, self as *const Controller);
        }
    }
}

/// Interest held on a controller; released on drop.
#[must_use = "interest is released when the guard is dropped"]
pub struct InterestGuard {
    controller: Arc<Controller>,
}

impl InterestGuard {
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        self.controller.stop_interest();
    }
}

/// A result node whose data may still be in production.
pub struct FutureNode {
    node: Arc<Node>,
    scheduler: Option<Arc<Scheduler>>,
    ctx: Weak<EngineContext>,
}

impl fmt::Debug for FutureNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureNode")
            .field("node", &self.node.name())
            .field("scheduler", &self.scheduler.as_ref().map(|s| s.status()))
            .finish()
    }
}

impl FutureNode {
    fn new(node: Arc<Node>, scheduler: Option<Arc<Scheduler>>, ctx: &Arc<EngineContext>) -> Self {
        Self {
            node,
            scheduler,
            ctx: Arc::downgrade(ctx),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.node.is_data_ready()
    }

    /// Block until the data is present, re-raising the node's failure.
    ///
    /// Returns [`EngineError::Cancelled`] when the calculation was cancelled
    /// before it produced anything.
    pub fn wait(&self) -> Result<Arc<Node>> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.join();
        }
        if !self.node.is_data_ready() {
            self.node.throw_fail_reason()?;
            let ctx = self.ctx.upgrade().ok_or(EngineError::ContextDropped)?;
            prepare_data(&ctx, &self.node)?;
        }
        self.node.throw_fail_reason()?;
        if !self.node.is_data_ready() {
            return Err(EngineError::Cancelled(self.node.name().to_string()));
        }
        Ok(self.node.clone())
    }

    /// Wait and return the value of tile 0.
    pub fn value(&self) -> Result<Value> {
        self.wait()?.value()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::operator::FnOperator;

    fn engine_with_neg() -> Arc<EngineContext> {
        let engine = EngineContext::new(EngineConfig::single_threaded()).unwrap();
        engine.registry().register(
            "neg",
            FnOperator::new(&[ValueClass::Numeric], ValueClass::Float64, |v| {
                Ok(Value::Float64(-v[0].as_f64()?))
            })
            .into_arc(),
        );
        engine
    }

    #[test]
    fn interest_regained_before_cancel_keeps_the_calculation() {
        let engine = engine_with_neg();
        let controller = engine.controller(&Expr::parse("(neg 1)").unwrap()).unwrap();
        controller.start_interest();

        engine.request_suspend();
        let future = controller.calc_result(None).unwrap();
        let scheduler = future.scheduler().cloned().unwrap();
        assert_eq!(scheduler.status(), TaskStatus::Scheduled);

        // Interest comes back between releasing it and cancelling.
        let InterestDrop::Released(in_flight) = controller.release_interest() else {
            panic!("last unit of interest was not released");
        };
        controller.start_interest();
        controller.after_release(in_flight);

        assert_eq!(scheduler.status(), TaskStatus::Scheduled);
        assert!(Arc::ptr_eq(&controller.scheduler().unwrap(), &scheduler));

        engine.resume();
        assert_eq!(scheduler.status(), TaskStatus::Done);
        let value = controller.calc_result(None).unwrap().value().unwrap();
        assert_eq!(value, Value::Float64(-1.0));
        controller.stop_interest();
    }

    #[test]
    fn finished_calculation_restarts_after_losing_data() {
        let engine = engine_with_neg();
        let controller = engine.controller(&Expr::parse("(neg 2)").unwrap()).unwrap();
        let interest = controller.hold_interest();
        assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(-2.0));
        drop(interest);
        assert!(!controller.is_calc_started());

        let _interest = controller.hold_interest();
        assert_eq!(controller.calc_result(None).unwrap().value().unwrap(), Value::Float64(-2.0));
    }
}
