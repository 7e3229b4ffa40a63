//! Scheduler Hub
//!
//! Shared bookkeeping for all schedulers of one engine: the queue of
//! schedulers ready to run, the number currently running, and the
//! condition variable joiners wait on.
//!
//! # How It Works
//!
//! A scheduler enters the queue once it is scheduled and none of its
//! suppliers is pending. [`SchedulerHub::run_operation_contexts`] pops
//! queued schedulers while fewer than `max_threads` are running and hands
//! each to the worker pool (or runs it inline in single-threaded mode).
//! Every terminal transition notifies the condition variable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{Scheduler, TaskStatus};
use crate::engine::EngineContext;

#[derive(Debug, Default)]
pub(crate) struct HubState {
    pub(crate) scheduled: VecDeque<Arc<Scheduler>>,
    pub(crate) running: usize,
}

/// Run queue and completion signalling shared by all schedulers.
#[derive(Debug, Default)]
pub struct SchedulerHub {
    state: Mutex<HubState>,
    completed: Condvar,
}

impl SchedulerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock()
    }

    /// Schedulers currently holding a run license.
    pub fn running_count(&self) -> usize {
        self.state.lock().running
    }

    /// Schedulers waiting for a worker slot.
    pub fn scheduled_count(&self) -> usize {
        self.state.lock().scheduled.len()
    }

    pub(crate) fn notify_completed(&self) {
        self.completed.notify_all();
    }

    /// Wait for any scheduler to change state. Returns true on timeout.
    pub(crate) fn wait_completed(
        &self,
        guard: &mut MutexGuard<'_, HubState>,
        timeout: Duration,
    ) -> bool {
        self.completed.wait_for(guard, timeout).timed_out()
    }

    /// Start queued schedulers until the running limit is reached.
    pub fn run_operation_contexts(&self, ctx: &Arc<EngineContext>) {
        let max_running = ctx.config().max_threads.max(1);
        loop {
            // Suspended work stays queued until resume re-drives it.
            if ctx.signal().is_suspend_requested() {
                return;
            }
            let next = {
                let mut state = self.state.lock();
                if state.running >= max_running {
                    return;
                }
                let Some(scheduler) = state.scheduled.pop_front() else {
                    return;
                };
                if !scheduler.get_unique_license_to_run(&mut state) {
                    continue;
                }
                scheduler
            };

            if !ctx.config().multi_threading {
                next.run(ctx);
                continue;
            }

            let job_ctx = ctx.clone();
            let job = next.clone();
            if !ctx.spawn(move || job.run(&job_ctx)) {
                tracing::warn!(key = %next.key(), "worker pool unavailable; cancelling");
                let mut state = self.state.lock();
                next.separate_resources(ctx, &mut state, TaskStatus::Cancelled);
            }
        }
    }

    /// Cancel every queued scheduler. Running ones are flagged through the
    /// engine's cancellation signal and stop at their next safe point.
    pub fn cancel_queued(&self, ctx: &Arc<EngineContext>) -> usize {
        let mut state = self.state.lock();
        let queued: Vec<_> = state.scheduled.drain(..).collect();
        let count = queued.len();
        for scheduler in queued {
            scheduler.separate_resources(ctx, &mut state, TaskStatus::Cancelled);
        }
        count
    }
}
