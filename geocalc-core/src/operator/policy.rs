//! Argument and group policies.

use serde::{Deserialize, Serialize};

/// How an operator wants one of its arguments supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgPolicy {
    /// Only the argument's meta info is used; its data is never computed.
    CalcNever,
    /// Data is computed when the result itself is calculated.
    #[default]
    CalcAsResult,
    /// Like `CalcAsResult`, applied to the root of a sub-item tree.
    CalcSubitemRoot,
    /// Data is always computed, even for meta-info-only requests.
    CalcAlways,
    /// The argument is a template; it is instantiated, not evaluated.
    IsTempl,
    /// The argument is replaced by its sub-items before evaluation.
    SubstWithSubitems,
    /// Data is computed per sub-item by the operator itself.
    CalcAtSubitem,
}

/// Whether an argument with `policy` must be calculated when the caller
/// requests data (`do_calc`) or only meta info.
pub fn must_calc_arg(policy: ArgPolicy, do_calc: bool) -> bool {
    match policy {
        ArgPolicy::CalcAsResult | ArgPolicy::CalcSubitemRoot => do_calc,
        ArgPolicy::CalcAlways => true,
        ArgPolicy::CalcNever
        | ArgPolicy::IsTempl
        | ArgPolicy::SubstWithSubitems
        | ArgPolicy::CalcAtSubitem => false,
    }
}

/// Behavioural flags of an operator group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    /// Each request gets a private controller instead of a shared cache entry.
    pub dont_cache_result: bool,
    /// Results, meta info included, are forgotten once nobody is interested.
    pub is_transient: bool,
    /// Arguments without an explicit policy are templates.
    pub is_template_call: bool,
    /// More arguments than the longest signature are accepted unchecked.
    pub allow_extra_args: bool,
    pub can_explain_value: bool,
    /// Argument policies depend on the value of the first argument.
    pub dynamic_argument_policies: bool,
    /// Group created at runtime; removed once its last operator goes.
    pub is_dynamic_group: bool,
    /// Still usable; a warning is logged the first time it is resolved.
    pub deprecated: bool,
}

impl GroupPolicy {
    /// Flags packed into a bit set, in declaration order.
    pub fn bits(&self) -> u32 {
        [
            self.dont_cache_result,
            self.is_transient,
            self.is_template_call,
            self.allow_extra_args,
            self.can_explain_value,
            self.dynamic_argument_policies,
            self.is_dynamic_group,
            self.deprecated,
        ]
        .iter()
        .enumerate()
        .fold(0, |bits, (i, &set)| bits | ((set as u32) << i))
    }
}
