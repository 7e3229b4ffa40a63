//! Operator groups and overload resolution.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::policy::{ArgPolicy, GroupPolicy};
use super::Operator;
use crate::error::{EngineError, Result};
use crate::value::{Value, ValueClass};

/// Argument policy as a pure function of (argument index, first argument
/// value). Only consulted for groups with dynamic argument policies.
pub type DynamicArgPolicy = Arc<dyn Fn(usize, Option<&Value>) -> ArgPolicy + Send + Sync>;

/// All overloads sharing one operator name.
pub struct OperatorGroup {
    name: Arc<str>,
    policy: GroupPolicy,
    arg_policies: Vec<ArgPolicy>,
    dynamic_policy: Option<DynamicArgPolicy>,
    /// Scanned front to back; newer registrations come first.
    members: RwLock<Vec<Arc<dyn Operator>>>,
    deprecation_reported: AtomicBool,
}

impl fmt::Debug for OperatorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorGroup")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("members", &self.members.read().len())
            .finish()
    }
}

impl OperatorGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            policy: GroupPolicy::default(),
            arg_policies: Vec::new(),
            dynamic_policy: None,
            members: RwLock::new(Vec::new()),
            deprecation_reported: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: GroupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Per-argument policies; arguments beyond the table use `CalcAsResult`.
    pub fn with_arg_policies(mut self, policies: &[ArgPolicy]) -> Self {
        self.arg_policies = policies.to_vec();
        self
    }

    pub fn with_dynamic_policy(mut self, policy: DynamicArgPolicy) -> Self {
        self.policy.dynamic_argument_policies = true;
        self.dynamic_policy = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> GroupPolicy {
        self.policy
    }

    pub fn must_cache_result(&self) -> bool {
        !self.policy.dont_cache_result
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Whether resolving this deprecated group has been warned about.
    pub fn deprecation_reported(&self) -> bool {
        self.deprecation_reported.load(Ordering::SeqCst)
    }

    /// Policy for argument `index`, given the first argument's value when
    /// it is already known.
    ///
    /// Arguments of a template call default to `IsTempl`: they are handed
    /// over unevaluated.
    pub fn arg_policy(&self, index: usize, first_value: Option<&Value>) -> ArgPolicy {
        if self.policy.dynamic_argument_policies {
            if let Some(policy) = &self.dynamic_policy {
                return policy(index, first_value);
            }
        }
        match self.arg_policies.get(index) {
            Some(policy) => *policy,
            None if self.policy.is_template_call => ArgPolicy::IsTempl,
            None => ArgPolicy::default(),
        }
    }

    pub(crate) fn add_member(&self, operator: Arc<dyn Operator>) {
        self.members.write().insert(0, operator);
    }

    pub(crate) fn remove_member(&self, operator: &Arc<dyn Operator>) -> bool {
        let mut members = self.members.write();
        let before = members.len();
        members.retain(|member| !Arc::ptr_eq(member, operator));
        members.len() != before
    }

    /// Select the first overload accepting arguments of the given classes.
    ///
    /// The argument count must fall in the overload's window (required
    /// minus optional up to required, or beyond for groups that allow extra
    /// arguments) and every argument must derive from the required class.
    pub fn find_oper(&self, args: &[ValueClass]) -> Result<Arc<dyn Operator>> {
        let members = self.members.read();
        if members.is_empty() {
            return Err(EngineError::NoImplementedOperator(self.name.to_string()));
        }
        if self.policy.deprecated && !self.deprecation_reported.swap(true, Ordering::SeqCst) {
            tracing::warn!(group = %self.name, "operator group is deprecated");
        }

        let mut best: Option<(usize, &Arc<dyn Operator>)> = None;
        for member in members.iter() {
            let required = member.arg_classes();
            let minimum = required.len() - member.nr_optional_args().min(required.len());
            let too_many = args.len() > required.len() && !self.policy.allow_extra_args;
            if args.len() < minimum || too_many {
                continue;
            }

            let checked = args.len().min(required.len());
            let matched = args
                .iter()
                .zip(required)
                .take_while(|(given, wanted)| given.is_derived_from(**wanted))
                .count();
            if matched == checked {
                return Ok(member.clone());
            }
            if best.map_or(true, |(best_matched, _)| matched > best_matched) {
                best = Some((matched, member));
            }
        }

        Err(self.no_match_error(args, best))
    }

    fn no_match_error(
        &self,
        args: &[ValueClass],
        best: Option<(usize, &Arc<dyn Operator>)>,
    ) -> EngineError {
        let mut message = String::from("Cannot find operator for these arguments:");
        for (i, class) in args.iter().enumerate() {
            let _ = write!(message, "\n arg{} of type {}", i + 1, class);
        }
        match best {
            Some((matched, member)) => {
                let _ = write!(
                    message,
                    "\nBest match: {}{} fails at arg{}",
                    self.name,
                    member.signature(),
                    matched + 1
                );
            }
            None => {
                let _ = write!(
                    message,
                    "\nNo overload of {} takes {} argument(s)",
                    self.name,
                    args.len()
                );
            }
        }
        EngineError::NoMatchingOperator {
            group: self.name.to_string(),
            message,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
