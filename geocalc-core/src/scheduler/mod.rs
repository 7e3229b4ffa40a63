//! Schedulers
//!
//! A [`Scheduler`] is one in-flight evaluation of a cache entry: it owns
//! the write lock on the node being produced, knows the schedulers it waits
//! for (suppliers) and the ones waiting for it (waiters), and can be joined
//! or cancelled.
//!
//! # State Machine
//!
//! ```text
//! None -> Scheduled -> Activated -> Running -> Done
//!                                           -> Suspended -> (re-driven) Activated
//!                                           -> Cancelled
//!                                           -> Exception
//! ```
//!
//! `Suspended` is a cooperative yield, not an error. `Cancelled` means the
//! result lost all interest (or the session is shutting down) and nothing
//! was published. `Exception` records a Data failure on the result.
//!
//! # Thread Safety
//!
//! Status changes and supplier/waiter links are guarded by the
//! [`SchedulerHub`] mutex. Code holding a controller's state lock never
//! takes the hub lock.

mod cancel;
mod context;
mod hub;

pub use cancel::{CancelableFrame, CancellationSignal};
pub use context::Scheduler;
pub(crate) use context::ScheduledWork;
pub use hub::SchedulerHub;

use std::sync::Arc;

/// Life cycle of a scheduler. The order is significant: everything from
/// `Cancelled` on is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    None = 0,
    Scheduled = 1,
    Activated = 2,
    Running = 3,
    Suspended = 4,
    Cancelled = 5,
    Exception = 6,
    Done = 7,
}

impl TaskStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskStatus::Scheduled,
            2 => TaskStatus::Activated,
            3 => TaskStatus::Running,
            4 => TaskStatus::Suspended,
            5 => TaskStatus::Cancelled,
            6 => TaskStatus::Exception,
            7 => TaskStatus::Done,
            _ => TaskStatus::None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self >= TaskStatus::Cancelled
    }

    pub fn is_running(self) -> bool {
        matches!(self, TaskStatus::Activated | TaskStatus::Running)
    }

    /// Waiting for a worker slot (fresh or re-driven after a suspension).
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskStatus::Scheduled | TaskStatus::Suspended)
    }
}

/// What a unit of work reports back. Suspension and cancellation are
/// regular outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Done(T),
    Suspended,
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskOutcome<U> {
        match self {
            TaskOutcome::Done(v) => TaskOutcome::Done(f(v)),
            TaskOutcome::Suspended => TaskOutcome::Suspended,
            TaskOutcome::Cancelled => TaskOutcome::Cancelled,
        }
    }
}

/// Handed to operators while they compute.
pub struct CalcContext<'a> {
    scheduler: &'a Arc<Scheduler>,
    signal: &'a CancellationSignal,
}

impl<'a> CalcContext<'a> {
    pub(crate) fn new(scheduler: &'a Arc<Scheduler>, signal: &'a CancellationSignal) -> Self {
        Self { scheduler, signal }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.scheduler
    }

    /// Safe point: yield when a suspension was requested.
    pub fn must_suspend(&self) -> bool {
        self.signal.must_suspend()
    }

    /// Safe point: true when nobody wants the result any more. The
    /// operator should return [`TaskOutcome::Cancelled`].
    pub fn cancel_if_out_of_interest(&self) -> bool {
        self.scheduler.cancel_if_no_interest_or_forced(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_separates_terminal_states() {
        assert!(TaskStatus::Scheduled < TaskStatus::Activated);
        assert!(TaskStatus::Running < TaskStatus::Suspended);
        assert!(!TaskStatus::Suspended.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Activated.is_running());
        assert!(!TaskStatus::Suspended.is_running());
    }

    #[test]
    fn status_survives_raw_conversion() {
        for status in [
            TaskStatus::None,
            TaskStatus::Scheduled,
            TaskStatus::Activated,
            TaskStatus::Running,
            TaskStatus::Suspended,
            TaskStatus::Cancelled,
            TaskStatus::Exception,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn outcome_map_keeps_control_states() {
        assert_eq!(TaskOutcome::Done(2).map(|v| v * 2), TaskOutcome::Done(4));
        assert_eq!(TaskOutcome::<i32>::Suspended.map(|v| v * 2), TaskOutcome::Suspended);
    }
}
