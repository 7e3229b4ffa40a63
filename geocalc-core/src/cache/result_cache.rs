//! Expression-keyed controller map.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use super::controller::Controller;
use super::expr::Expr;
use crate::engine::EngineContext;
use crate::error::Result;

/// Map from expression key to the single live controller for that key.
///
/// The map only holds weak references; controllers live as long as
/// somebody (a caller, a parent controller) holds them. A dying controller
/// removes its own entry and wakes lookups that found it mid-destruction.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<BTreeMap<Expr, Weak<Controller>>>,
    destroyed: Condvar,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live controller for `key`, if any.
    pub fn get_existing(&self, key: &Expr) -> Option<Arc<Controller>> {
        let mut entries = self.entries.lock();
        loop {
            match entries.get(key).map(Weak::upgrade) {
                None => return None,
                Some(Some(controller)) => return Some(controller),
                Some(None) => self.destroyed.wait(&mut entries),
            }
        }
    }

    /// The controller for `key`, created when missing.
    ///
    /// Argument controllers are created first. Groups that do not cache
    /// their results get a private controller that is never published.
    pub fn get_or_create(&self, ctx: &Arc<EngineContext>, key: &Expr) -> Result<Arc<Controller>> {
        if let Some(existing) = self.get_existing(key) {
            return Ok(existing);
        }

        let candidate = Controller::build(ctx, key)?;
        if !candidate.is_shared() {
            return Ok(candidate);
        }

        let mut entries = self.entries.lock();
        loop {
            match entries.get(key).map(Weak::upgrade) {
                Some(Some(existing)) => {
                    drop(entries);
                    drop(candidate);
                    return Ok(existing);
                }
                Some(None) => self.destroyed.wait(&mut entries),
                None => {
                    entries.insert(key.clone(), Arc::downgrade(&candidate));
                    tracing::debug!(key = %key, entries = entries.len(), "controller created");
                    return Ok(candidate);
                }
            }
        }
    }

    /// Remove the entry of a dying controller. Entries re-populated by a
    /// newer controller for the same key are left alone.
    pub(crate) fn remove_entry(&self, key: &Expr, controller: *const Controller) {
        let mut entries = self.entries.lock();
        if entries
            .get(key)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), controller))
        {
            entries.remove(key);
            tracing::trace!(key = %key, "controller removed");
        }
        drop(entries);
        self.destroyed.notify_all();
    }

    /// Number of entries, including ones mid-destruction.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate every live controller. Returns how many were invalidated.
    pub fn invalidate_all(&self) -> usize {
        let live: Vec<Arc<Controller>> = self
            .entries
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for controller in &live {
            controller.invalidate();
        }
        live.len()
    }
}
