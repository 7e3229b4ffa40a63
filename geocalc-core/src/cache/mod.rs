//! Result Cache
//!
//! The expression-keyed cache of computed results.
//!
//! # Overview
//!
//! - [`Expr`]: canonical expression keys, `(op arg ...)` terms over
//!   symbols and literals.
//! - [`ResultCache`]: the map from key to its single live [`Controller`].
//! - [`Controller`]: owns the result node of one key, resolves it
//!   (MetaInfo) and drives its calculation (Data).
//! - [`FutureNode`]: a result whose data may still be in production.
//! - [`ExplainContext`]: optional trace of a calculation.
//!
//! # How It Works
//!
//! Looking up `(add a (mul b 2))` creates (or finds) controllers for `a`,
//! `b`, `2` and `(mul b 2)` first, so every sub-expression is shared with
//! every other expression that mentions it. Holding interest on a
//! controller keeps its result materialized; once the last interest goes
//! the data is dropped and a pending calculation is cancelled.

mod controller;
mod explain;
mod expr;
mod result_cache;

pub use controller::{Controller, ControllerKind, FutureNode, InterestGuard};
pub use explain::{ExplainContext, ExplainEntry};
pub use expr::{Expr, Number};
pub use result_cache::ResultCache;
