//! Operator Dispatch
//!
//! Operators are grouped by name. A group carries the policies shared by
//! all its overloads; its members are the concrete [`Operator`]s, selected
//! by the result classes of the supplied arguments.
//!
//! # Overview
//!
//! - [`OperatorRegistry`]: name to group, a lazily sorted vector.
//! - [`OperatorGroup`]: policies plus the ordered overload list.
//! - [`Operator`]: one overload; resolves its result class (MetaInfo phase)
//!   and computes the value (Data phase).

mod group;
mod policy;
mod registry;

pub use group::{DynamicArgPolicy, OperatorGroup};
pub use policy::{must_calc_arg, ArgPolicy, GroupPolicy};
pub use registry::OperatorRegistry;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::Node;
use crate::scheduler::{CalcContext, TaskOutcome};
use crate::value::{Value, ValueClass};

/// One overload of an operator group.
pub trait Operator: Send + Sync {
    /// Required classes of the arguments, in order.
    fn arg_classes(&self) -> &[ValueClass];

    /// How many trailing arguments may be left out.
    fn nr_optional_args(&self) -> usize {
        0
    }

    /// Class of the result for the given argument classes.
    fn result_class(&self, args: &[ValueClass]) -> Result<ValueClass>;

    /// Compute the result.
    ///
    /// `args` holds the result nodes of all arguments; those whose policy
    /// requires calculation are data-ready and read-locked for the duration
    /// of the call.
    fn calc_result(&self, args: &[Arc<Node>], cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>>;

    /// Human readable signature, used in dispatch errors.
    fn signature(&self) -> String {
        let classes: Vec<&str> = self.arg_classes().iter().map(|c| c.name()).collect();
        format!("({})", classes.join(", "))
    }
}

type CalcFn = dyn Fn(&[Value]) -> Result<Value> + Send + Sync;

/// An operator built from a closure over argument values.
///
/// Every argument is read as a value, so the group's policies should
/// calculate all of them.
pub struct FnOperator {
    arg_classes: Vec<ValueClass>,
    nr_optional: usize,
    result: ValueClass,
    calc: Box<CalcFn>,
}

impl FnOperator {
    pub fn new<F>(arg_classes: &[ValueClass], result: ValueClass, calc: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            arg_classes: arg_classes.to_vec(),
            nr_optional: 0,
            result,
            calc: Box::new(calc),
        }
    }

    pub fn with_optional_args(mut self, nr_optional: usize) -> Self {
        self.nr_optional = nr_optional.min(self.arg_classes.len());
        self
    }

    pub fn into_arc(self) -> Arc<dyn Operator> {
        Arc::new(self)
    }
}

impl fmt::Debug for FnOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperator")
            .field("arg_classes", &self.arg_classes)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

impl Operator for FnOperator {
    fn arg_classes(&self) -> &[ValueClass] {
        &self.arg_classes
    }

    fn nr_optional_args(&self) -> usize {
        self.nr_optional
    }

    fn result_class(&self, _args: &[ValueClass]) -> Result<ValueClass> {
        Ok(self.result)
    }

    fn calc_result(&self, args: &[Arc<Node>], cx: &CalcContext<'_>) -> Result<TaskOutcome<Value>> {
        if cx.cancel_if_out_of_interest() {
            return Ok(TaskOutcome::Cancelled);
        }
        let values = args
            .iter()
            .map(|node| node.value())
            .collect::<Result<Vec<_>>>()?;
        (self.calc)(&values).map(TaskOutcome::Done)
    }
}
