//! Operator Registry
//!
//! Maps operator names to groups. Registrations are rare and lookups
//! frequent, so groups live in a plain vector that is re-sorted by name
//! (stable sort) on the first lookup after a change.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use super::group::OperatorGroup;
use super::policy::GroupPolicy;
use super::Operator;
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct RegistryState {
    groups: Vec<Arc<OperatorGroup>>,
    dirty: bool,
}

impl RegistryState {
    fn position(&self, name: &str) -> Option<usize> {
        debug_assert!(!self.dirty);
        self.groups
            .binary_search_by(|group| group.name().cmp(name))
            .ok()
    }
}

/// Name to operator group lookup.
#[derive(Debug, Default)]
pub struct OperatorRegistry {
    state: RwLock<RegistryState>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a group. Fails when a group with the same name exists.
    pub fn register_group(&self, group: OperatorGroup) -> Result<Arc<OperatorGroup>> {
        if self.find_group_by_name(group.name()).is_some() {
            return Err(EngineError::DuplicateGroup(group.name().to_string()));
        }
        let group = Arc::new(group);
        let mut state = self.state.write();
        // Re-check under the write lock.
        if state.groups.iter().any(|g| g.name() == group.name()) {
            return Err(EngineError::DuplicateGroup(group.name().to_string()));
        }
        state.groups.push(group.clone());
        state.dirty = true;
        tracing::debug!(group = %group.name(), "registered operator group");
        Ok(group)
    }

    pub fn find_group_by_name(&self, name: &str) -> Option<Arc<OperatorGroup>> {
        let state = self.state.upgradable_read();
        if state.dirty {
            let mut state = RwLockUpgradableReadGuard::upgrade(state);
            state.groups.sort_by(|a, b| a.name().cmp(b.name()));
            state.dirty = false;
            return state.position(name).map(|i| state.groups[i].clone());
        }
        state.position(name).map(|i| state.groups[i].clone())
    }

    /// The group named `name`, created with default policies if missing.
    pub fn find_or_create_common_group(&self, name: &str) -> Arc<OperatorGroup> {
        if let Some(group) = self.find_group_by_name(name) {
            return group;
        }
        let mut state = self.state.write();
        if let Some(group) = state.groups.iter().find(|g| g.name() == name) {
            return group.clone();
        }
        let group = Arc::new(OperatorGroup::new(name));
        state.groups.push(group.clone());
        state.dirty = true;
        group
    }

    /// Add an operator to the group named `group`.
    ///
    /// Unknown names create a dynamic group, removed again once its last
    /// operator is unregistered.
    pub fn register(&self, group: &str, operator: Arc<dyn Operator>) -> Arc<OperatorGroup> {
        let group = match self.find_group_by_name(group) {
            Some(existing) => existing,
            None => {
                let mut state = self.state.write();
                match state.groups.iter().find(|g| g.name() == group) {
                    Some(existing) => existing.clone(),
                    None => {
                        let created = Arc::new(OperatorGroup::new(group).with_policy(GroupPolicy {
                            is_dynamic_group: true,
                            ..GroupPolicy::default()
                        }));
                        state.groups.push(created.clone());
                        state.dirty = true;
                        created
                    }
                }
            }
        };
        group.add_member(operator);
        tracing::debug!(group = %group.name(), members = group.member_count(), "registered operator");
        group
    }

    /// Remove an operator from its group.
    ///
    /// Returns false when the operator was not registered there.
    pub fn unregister(&self, group: &str, operator: &Arc<dyn Operator>) -> bool {
        let Some(found) = self.find_group_by_name(group) else {
            return false;
        };
        if !found.remove_member(operator) {
            return false;
        }
        if found.policy().is_dynamic_group && found.is_empty() {
            let mut state = self.state.write();
            state.groups.retain(|g| !Arc::ptr_eq(g, &found));
            tracing::debug!(group = %found.name(), "removed empty dynamic group");
        }
        true
    }

    /// All groups, sorted by name.
    pub fn groups(&self) -> Vec<Arc<OperatorGroup>> {
        let mut state = self.state.write();
        if state.dirty {
            state.groups.sort_by(|a, b| a.name().cmp(b.name()));
            state.dirty = false;
        }
        state.groups.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
