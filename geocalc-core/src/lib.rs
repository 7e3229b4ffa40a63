//! GeoCalc Core
//!
//! This crate provides the calculation kernel of a demand-driven,
//! incremental expression engine. It implements:
//!
//! - A global change clock and per-item fail/progress state
//! - Shared/unique item locks with producer-scheduler handoff
//! - An expression-keyed result cache with one controller per key
//! - Operator groups with overload dispatch and argument policies
//! - Schedulers with supplier/waiter links, suspension and cancellation
//! - A pluggable storage contract and state-change notifications
//!
//! The crate is designed to be used both as a native Rust library and as a
//! C shared library through the functions in [`ffi`].
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `clock`: change timestamps and the frames that stamp them
//! - `graph`: items, item locks and the RunTask queue
//! - `cache`: expression keys, controllers and the result cache
//! - `operator`: operators, groups and the registry
//! - `scheduler`: schedulers, the hub and cancellation
//! - `engine`: the context tying all of the above together
//!
//! # Example
//!
//! ```rust,ignore
//! use geocalc_core::{EngineConfig, EngineContext, FnOperator, Value, ValueClass};
//!
//! let engine = EngineContext::new(EngineConfig::default())?;
//! engine.registry().register(
//!     "mul",
//!     FnOperator::new(&[ValueClass::Numeric, ValueClass::Numeric], ValueClass::Float64, |v| {
//!         Ok(Value::Float64(v[0].as_f64()? * v[1].as_f64()?))
//!     })
//!     .into_arc(),
//! );
//!
//! let area = engine.create_item("area", ValueClass::Float64)?;
//! engine.set_value(&area, Value::Float64(12.5))?;
//!
//! // Sub-expressions are cached and shared between requests
//! assert_eq!(engine.evaluate("(mul area 2)")?, Value::Float64(25.0));
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod graph;
pub mod logging;
pub mod notify;
pub mod operator;
pub mod scheduler;
pub mod storage;
pub mod value;

pub use cache::{Controller, ExplainContext, Expr, FutureNode, ResultCache};
pub use clock::{TimeClock, TimeStamp};
pub use config::EngineConfig;
pub use engine::EngineContext;
pub use error::{EngineError, FailType, Failure, Result};
pub use graph::{ItemReadLock, ItemWriteLock, Node, ProgressState};
pub use notify::{NotificationCode, NotificationHub};
pub use operator::{ArgPolicy, FnOperator, GroupPolicy, Operator, OperatorGroup, OperatorRegistry};
pub use scheduler::{CalcContext, Scheduler, TaskOutcome, TaskStatus};
pub use storage::{StorageBinding, StorageManager, StorageMetaInfo, SyncMode, TileId};
pub use value::{Value, ValueClass};
