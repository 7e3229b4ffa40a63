//! Cooperative Cancellation
//!
//! Long running work (operator bodies, storage reads) is never preempted.
//! It polls at safe points instead:
//!
//! - [`CancellationSignal`]: engine-wide requests to suspend (yield and be
//!   re-driven later) or to cancel everything (session shutdown).
//! - [`CancelableFrame`]: marks the unit of work running on the current
//!   thread, so code deep inside it can ask whether anybody still wants
//!   the result.
//!
//! # Implementation
//!
//! Frames live on a thread-local stack, pushed on entry and popped by the
//! guard's `Drop`, so nested frames (a storage read inside a calculation)
//! resolve to the innermost unit.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::Scheduler;
use crate::graph::Node;

thread_local! {
    static FRAME_STACK: RefCell<Vec<FrameEntry>> = const { RefCell::new(Vec::new()) };
    static DID_SUSPEND: Cell<bool> = const { Cell::new(false) };
}

/// Engine-wide suspension and cancellation requests.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    suspend_requested: AtomicBool,
    cancel_all: AtomicBool,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask running work to yield at its next safe point.
    pub fn request_suspend(&self) {
        self.suspend_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_suspend(&self) {
        self.suspend_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::SeqCst)
    }

    /// Checkpoint: true when the caller should yield now.
    ///
    /// Records the suspension for [`did_suspend`](Self::did_suspend) on
    /// this thread.
    pub fn must_suspend(&self) -> bool {
        let suspend = self.is_suspend_requested();
        if suspend {
            DID_SUSPEND.with(|did| did.set(true));
        }
        suspend
    }

    /// Whether this thread yielded since the last reset.
    pub fn did_suspend() -> bool {
        DID_SUSPEND.with(Cell::get)
    }

    pub fn reset_did_suspend() {
        DID_SUSPEND.with(|did| did.set(false));
    }

    /// Force cancellation of all work, regardless of interest.
    pub fn cancel_all(&self) {
        self.cancel_all.store(true, Ordering::SeqCst);
    }

    pub fn reset_cancel_all(&self) {
        self.cancel_all.store(false, Ordering::SeqCst);
    }

    pub fn is_cancel_all(&self) -> bool {
        self.cancel_all.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
enum FrameEntry {
    Scheduler(Weak<Scheduler>),
    Node(Weak<Node>),
}

/// Guard marking the cancellable unit running on this thread.
#[must_use = "the frame is left when the guard is dropped"]
pub struct CancelableFrame {
    depth: usize,
}

impl CancelableFrame {
    /// Enter the frame of a scheduler's run.
    pub fn enter_scheduler(scheduler: &Arc<Scheduler>) -> Self {
        Self::push(FrameEntry::Scheduler(Arc::downgrade(scheduler)))
    }

    /// Enter the frame of a node being prepared outside a scheduler.
    pub fn enter_node(node: &Arc<Node>) -> Self {
        Self::push(FrameEntry::Node(Arc::downgrade(node)))
    }

    fn push(entry: FrameEntry) -> Self {
        let depth = FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(entry);
            stack.len()
        });
        Self { depth }
    }

    pub fn is_active() -> bool {
        FRAME_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The scheduler of the innermost scheduler frame, if any.
    pub fn current_scheduler() -> Option<Arc<Scheduler>> {
        FRAME_STACK.with(|stack| {
            stack.borrow().iter().rev().find_map(|entry| match entry {
                FrameEntry::Scheduler(s) => s.upgrade(),
                FrameEntry::Node(_) => None,
            })
        })
    }

    /// True when the innermost unit lost all interest and should stop.
    ///
    /// For a scheduler frame this also marks the scheduler cancelled.
    /// Outside any frame it always returns false.
    pub fn cancel_if_out_of_interest() -> bool {
        let innermost = FRAME_STACK.with(|stack| stack.borrow().last().cloned());
        match innermost {
            Some(FrameEntry::Scheduler(scheduler)) => scheduler
                .upgrade()
                .is_some_and(|s| s.cancel_if_no_interest_or_forced(false)),
            Some(FrameEntry::Node(node)) => node
                .upgrade()
                .map_or(true, |n| n.interest_count() == 0 && !n.keeps_data()),
            None => false,
        }
    }
}

impl Drop for CancelableFrame {
    fn drop(&mut self) {
        FRAME_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "CancelableFrame mismatch: expected depth {}, got {}",
                self.depth,
                stack.len()
            );
            stack.pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueClass;

    #[test]
    fn suspension_is_recorded_per_thread() {
        let signal = CancellationSignal::new();
        CancellationSignal::reset_did_suspend();
        assert!(!signal.must_suspend());
        assert!(!CancellationSignal::did_suspend());

        signal.request_suspend();
        assert!(signal.must_suspend());
        assert!(CancellationSignal::did_suspend());

        signal.clear_suspend();
        CancellationSignal::reset_did_suspend();
        assert!(!CancellationSignal::did_suspend());
    }

    #[test]
    fn node_frames_follow_interest() {
        let node = Node::new_cache_item("n", ValueClass::Int32);
        assert!(!CancelableFrame::is_active());
        assert!(!CancelableFrame::cancel_if_out_of_interest());

        node.start_interest();
        {
            let _frame = CancelableFrame::enter_node(&node);
            assert!(CancelableFrame::is_active());
            assert!(!CancelableFrame::cancel_if_out_of_interest());
            node.stop_interest();
            assert!(CancelableFrame::cancel_if_out_of_interest());
        }
        assert!(!CancelableFrame::is_active());
        assert!(CancelableFrame::current_scheduler().is_none());
    }
}
