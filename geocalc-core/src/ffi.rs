//! C Host API
//!
//! `extern "C"` entry points for hosts that embed the engine: create an
//! engine, build items, register client operators backed by callbacks,
//! evaluate expressions and observe state changes.
//!
//! # Conventions
//!
//! - Engines are opaque [`EngineHandle`] pointers owned by the host until
//!   `geocalc_engine_destroy`.
//! - Item pointers are borrowed from the engine's item tree and stay valid
//!   while the item is part of it.
//! - Functions report failure through their return value (`false`, null,
//!   zero); the message is available from `geocalc_last_error` on the same
//!   thread.
//! - No panic crosses the boundary.

use std::cell::RefCell;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::EngineContext;
use crate::error::{EngineError, FailType, Failure, Result};
use crate::graph::{Node, ProgressState};
use crate::notify::{ClientHandle, StateChangeFn};
use crate::operator::Operator;
use crate::scheduler::{CalcContext, TaskOutcome};
use crate::value::{Value, ValueClass};

/// Asked once when a client operator is created; returning false rejects it.
pub type CreateOperatorFn = extern "C" fn(client: ClientHandle, nr_args: u32) -> bool;

/// Computes a client operator: reads `nr_args` values, writes one result.
pub type ApplyOperatorFn =
    extern "C" fn(client: ClientHandle, args: *const f64, nr_args: u32, result: *mut f64) -> bool;

/// Opaque engine handle.
pub struct EngineHandle {
    engine: Arc<EngineContext>,
}

/// Opaque handle of a registered client operator.
pub struct ClientOperatorHandle {
    group: String,
    operator: Arc<dyn Operator>,
}

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|last| *last.borrow_mut() = message);
}

/// Run `f`, converting errors and panics into `fallback` plus a last error.
fn guarded<T>(fallback: T, f: impl FnOnce() -> Result<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            set_last_error(err.to_string());
            fallback
        }
        Err(_) => {
            set_last_error("internal panic".to_string());
            fallback
        }
    }
}

unsafe fn read_str<'a>(ptr: *const c_char) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(EngineError::InvalidArgument("null string".into()));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| EngineError::InvalidArgument("string is not valid UTF-8".into()))
}

unsafe fn engine<'a>(handle: *const EngineHandle) -> Result<&'a Arc<EngineContext>> {
    handle
        .as_ref()
        .map(|h| &h.engine)
        .ok_or_else(|| EngineError::InvalidArgument("null engine handle".into()))
}

unsafe fn node<'a>(ptr: *const Node) -> Result<&'a Node> {
    ptr.as_ref()
        .ok_or_else(|| EngineError::InvalidArgument("null item".into()))
}

/// Copy `text` into `buf` (NUL terminated, truncated to `len`) and return
/// the full length in bytes.
unsafe fn write_str(text: &str, buf: *mut c_char, len: usize) -> usize {
    if !buf.is_null() && len > 0 {
        let n = text.len().min(len - 1);
        std::ptr::copy_nonoverlapping(text.as_ptr().cast::<c_char>(), buf, n);
        *buf.add(n) = 0;
    }
    text.len()
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Create an engine. `config_json` may be null for the default config.
///
/// # Safety
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn geocalc_engine_create(config_json: *const c_char) -> *mut EngineHandle {
    guarded(std::ptr::null_mut(), || {
        let config = if config_json.is_null() {
            EngineConfig::default()
        } else {
            EngineConfig::from_json(read_str(config_json)?)?
        };
        let engine = EngineContext::new(config)?;
        Ok(Box::into_raw(Box::new(EngineHandle { engine })))
    })
}

/// Shut down and free an engine.
///
/// # Safety
/// `handle` must come from `geocalc_engine_create` and not be used again.
#[no_mangle]
pub unsafe extern "C" fn geocalc_engine_destroy(handle: *mut EngineHandle) {
    if handle.is_null() {
        return;
    }
    let handle = Box::from_raw(handle);
    guarded((), || {
        handle.engine.shutdown();
        Ok(())
    });
}

/// Copy the last error of this thread into `buf`; returns its full length.
///
/// # Safety
/// `buf` must be null or point to at least `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn geocalc_last_error(buf: *mut c_char, len: usize) -> usize {
    LAST_ERROR.with(|last| write_str(&last.borrow(), buf, len))
}

// ----------------------------------------------------------------------------
// Items
// ----------------------------------------------------------------------------

/// Create a numeric item at `path` holding `value`.
///
/// # Safety
/// `handle` and `path` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_create(
    handle: *const EngineHandle,
    path: *const c_char,
    value: f64,
) -> *const Node {
    guarded(std::ptr::null(), || {
        let engine = engine(handle)?;
        let item = engine.create_item(read_str(path)?, ValueClass::Float64)?;
        engine.set_value(&item, Value::Float64(value))?;
        Ok(Arc::as_ptr(&item))
    })
}

/// Look up an item by full name; null when missing.
///
/// # Safety
/// `handle` and `path` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_find(
    handle: *const EngineHandle,
    path: *const c_char,
) -> *const Node {
    guarded(std::ptr::null(), || {
        let item = engine(handle)?.find_item(read_str(path)?)?;
        Ok(Arc::as_ptr(&item))
    })
}

/// # Safety
/// `handle` and `path` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_set_value(
    handle: *const EngineHandle,
    path: *const c_char,
    value: f64,
) -> bool {
    guarded(false, || {
        engine(handle)?.set_item_value(read_str(path)?, Value::Float64(value))?;
        Ok(true)
    })
}

/// Progress of an item: 0 none, 1 meta info, 2 validated, 3 committed.
///
/// # Safety
/// `item` must be a live item pointer.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_progress(item: *const Node) -> i32 {
    guarded(-1, || {
        Ok(match node(item)?.progress() {
            ProgressState::None => 0,
            ProgressState::MetaInfo => 1,
            ProgressState::Validated => 2,
            ProgressState::Committed => 3,
        })
    })
}

/// # Safety
/// `item` must be a live item pointer.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_is_failed(item: *const Node) -> bool {
    guarded(false, || Ok(node(item)?.is_failed()))
}

/// # Safety
/// `item` must be a live item pointer.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_is_data_failed(item: *const Node) -> bool {
    guarded(false, || Ok(node(item)?.was_failed(FailType::Data)))
}

/// # Safety
/// `item` must be a live item pointer.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_is_meta_failed(item: *const Node) -> bool {
    guarded(false, || Ok(node(item)?.was_failed(FailType::MetaInfo)))
}

/// Copy the item's fail reason into `buf`; returns its full length, 0 when
/// the item did not fail.
///
/// # Safety
/// `item` must be a live item pointer; `buf` null or `len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn geocalc_item_fail_reason(
    item: *const Node,
    buf: *mut c_char,
    len: usize,
) -> usize {
    guarded(0, || {
        Ok(match node(item)?.fail_state() {
            Some(failure) => write_str(&failure.reason, buf, len),
            None => 0,
        })
    })
}

// ----------------------------------------------------------------------------
// Evaluation
// ----------------------------------------------------------------------------

/// Evaluate `expr` and store its numeric value in `out`.
///
/// # Safety
/// `handle` and `expr` must be valid, `out` writable.
#[no_mangle]
pub unsafe extern "C" fn geocalc_evaluate_f64(
    handle: *const EngineHandle,
    expr: *const c_char,
    out: *mut f64,
) -> bool {
    guarded(false, || {
        if out.is_null() {
            return Err(EngineError::InvalidArgument("null result pointer".into()));
        }
        let value = engine(handle)?.evaluate(read_str(expr)?)?;
        *out = value.as_f64()?;
        Ok(true)
    })
}

// ----------------------------------------------------------------------------
// Client operators
// ----------------------------------------------------------------------------

struct ClientOperator {
    name: String,
    client: ClientHandle,
    apply: ApplyOperatorFn,
    arg_classes: Vec<ValueClass>,
}

impl Operator for ClientOperator {
    fn arg_classes(&self) -> &[ValueClass] {
        &self.arg_classes
    }

    fn result_class(&self, _args: &[ValueClass]) -> Result<ValueClass> {
        Ok(ValueClass::Float64)
    }

    fn calc_result(&self, args: &[Arc<Node>], cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>> {
        if cx.cancel_if_out_of_interest() {
            return Ok(TaskOutcome::Cancelled);
        }
        let values = args
            .iter()
            .map(|arg| arg.value()?.as_f64())
            .collect::<Result<Vec<f64>>>()?;
        let mut result = 0.0;
        if !(self.apply)(self.client, values.as_ptr(), values.len() as u32, &mut result) {
            return Err(Failure::data(format!("client operator '{}' failed", self.name)).into());
        }
        Ok(TaskOutcome::Done(Value::Float64(result)))
    }
}

/// Register a client operator taking `nr_args` numbers under `name`.
///
/// `create` is asked first and may reject the operator. Returns null on
/// failure.
///
/// # Safety
/// `handle` and `name` must be valid; the callbacks must stay callable
/// until the operator is released.
#[no_mangle]
pub unsafe extern "C" fn geocalc_client_operator_create(
    handle: *const EngineHandle,
    name: *const c_char,
    nr_args: u32,
    client: ClientHandle,
    create: CreateOperatorFn,
    apply: ApplyOperatorFn,
) -> *mut ClientOperatorHandle {
    guarded(std::ptr::null_mut(), || {
        let engine = engine(handle)?;
        let name = read_str(name)?;
        if !create(client, nr_args) {
            return Err(EngineError::InvalidArgument(format!(
                "client rejected operator '{name}'"
            )));
        }
        let operator: Arc<dyn Operator> = Arc::new(ClientOperator {
            name: name.to_string(),
            client,
            apply,
            arg_classes: vec![ValueClass::Numeric; nr_args as usize],
        });
        engine.registry().register(name, operator.clone());
        Ok(Box::into_raw(Box::new(ClientOperatorHandle {
            group: name.to_string(),
            operator,
        })))
    })
}

/// Unregister and free a client operator.
///
/// # Safety
/// `operator` must come from `geocalc_client_operator_create` on the same
/// engine and not be used again.
#[no_mangle]
pub unsafe extern "C" fn geocalc_client_operator_release(
    handle: *const EngineHandle,
    operator: *mut ClientOperatorHandle,
) -> bool {
    if operator.is_null() {
        return false;
    }
    let operator = Box::from_raw(operator);
    guarded(false, || {
        Ok(engine(handle)?
            .registry()
            .unregister(&operator.group, &operator.operator))
    })
}

// ----------------------------------------------------------------------------
// Operator group metadata
// ----------------------------------------------------------------------------

/// # Safety
/// `handle` and `name` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_group_exists(handle: *const EngineHandle, name: *const c_char) -> bool {
    guarded(false, || {
        Ok(engine(handle)?
            .registry()
            .find_group_by_name(read_str(name)?)
            .is_some())
    })
}

/// # Safety
/// `handle` and `name` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_group_member_count(
    handle: *const EngineHandle,
    name: *const c_char,
) -> u32 {
    guarded(0, || {
        let name = read_str(name)?;
        let group = engine(handle)?
            .registry()
            .find_group_by_name(name)
            .ok_or_else(|| EngineError::UnknownOperatorGroup(name.to_string()))?;
        Ok(group.member_count() as u32)
    })
}

/// Group policy flags as a bit set.
///
/// # Safety
/// `handle` and `name` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_group_flags(handle: *const EngineHandle, name: *const c_char) -> u32 {
    guarded(0, || {
        let name = read_str(name)?;
        let group = engine(handle)?
            .registry()
            .find_group_by_name(name)
            .ok_or_else(|| EngineError::UnknownOperatorGroup(name.to_string()))?;
        Ok(group.policy().bits())
    })
}

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

/// # Safety
/// `handle` must be valid; `func` must stay callable until released.
#[no_mangle]
pub unsafe extern "C" fn geocalc_register_global_notification(
    handle: *const EngineHandle,
    func: StateChangeFn,
    client: ClientHandle,
) -> bool {
    guarded(false, || {
        engine(handle)?.notifications().register_global(func, client);
        Ok(true)
    })
}

/// # Safety
/// `handle` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_release_global_notification(
    handle: *const EngineHandle,
    func: StateChangeFn,
    client: ClientHandle,
) -> bool {
    guarded(false, || {
        Ok(engine(handle)?.notifications().release_global(func, client))
    })
}

/// # Safety
/// `handle` and `item` must be valid; `func` must stay callable until
/// released.
#[no_mangle]
pub unsafe extern "C" fn geocalc_register_item_notification(
    handle: *const EngineHandle,
    item: *const Node,
    func: StateChangeFn,
    client: ClientHandle,
) -> bool {
    guarded(false, || {
        let id = node(item)?.id();
        engine(handle)?.notifications().register_node(id, func, client);
        Ok(true)
    })
}

/// # Safety
/// `handle` and `item` must be valid.
#[no_mangle]
pub unsafe extern "C" fn geocalc_release_item_notification(
    handle: *const EngineHandle,
    item: *const Node,
    func: StateChangeFn,
    client: ClientHandle,
) -> bool {
    guarded(false, || {
        let id = node(item)?.id();
        Ok(engine(handle)?.notifications().release_node(id, func, client))
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
