//! Change Clock
//!
//! Every state change in the engine is attributed to a [`TimeStamp`]. A
//! result is stale when one of its suppliers changed at a later timestamp
//! than the one the result was derived at.
//!
//! # How It Works
//!
//! The clock keeps the last issued timestamp and a `committed` flag. A fresh
//! timestamp is only minted once the last one has been observed (committed):
//! a burst of changes nobody looked at in between shares one frame.
//!
//! Engine mutations stamp through [`TimeClock::active_ts`]. Two
//! thread-local scopes modify what it returns:
//!
//! - [`ChangeSourceLock`]: changes made inside the scope are attributed to a
//!   given timestamp (usually the one of the item being derived).
//! - [`DetermineChangeLock`]: while determining change state no new frame may
//!   be opened; the last timestamp is used instead.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A change timestamp. Zero means "undefined".
pub type TimeStamp = u64;

/// Undefined timestamp.
pub const TS_UNDEFINED: TimeStamp = 0;

/// The first timestamp. Everything that exists at startup carries it.
pub const TS_BERESHIT: TimeStamp = 1;

thread_local! {
    static ACTIVE_TS: Cell<TimeStamp> = const { Cell::new(TS_UNDEFINED) };
    static DETERMINE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Process-wide monotonic change clock.
#[derive(Debug)]
pub struct TimeClock {
    last: AtomicU64,
    committed: AtomicBool,
}

impl Default for TimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(TS_BERESHIT),
            committed: AtomicBool::new(true),
        }
    }

    /// The last issued timestamp. Observing it commits the current frame.
    pub fn last_ts(&self) -> TimeStamp {
        self.committed.store(true, Ordering::SeqCst);
        self.last.load(Ordering::SeqCst)
    }

    /// The last issued timestamp without committing it.
    pub fn peek_ts(&self) -> TimeStamp {
        self.last.load(Ordering::SeqCst)
    }

    /// Open a new frame if the current one has been committed.
    pub fn trigger_fresh_ts(&self) {
        if self
            .committed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let ts = self.last.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::trace!(ts, "opened change frame");
        }
    }

    /// A timestamp for a change made outside any active scope.
    pub fn fresh_ts(&self) -> TimeStamp {
        debug_assert!(!is_in_active_state());
        debug_assert!(!is_in_determine_state());
        self.trigger_fresh_ts();
        self.last.load(Ordering::SeqCst)
    }

    /// The timestamp to attribute a change to from the current thread.
    pub fn active_ts(&self) -> TimeStamp {
        let active = ACTIVE_TS.with(Cell::get);
        if active != TS_UNDEFINED {
            active
        } else if is_in_determine_state() {
            self.peek_ts()
        } else {
            self.fresh_ts()
        }
    }

    /// Whether `change_ts` lies within the frame visible from this thread.
    pub fn check_ts(&self, change_ts: TimeStamp) -> bool {
        let active = ACTIVE_TS.with(Cell::get);
        if active != TS_UNDEFINED {
            change_ts <= active
        } else {
            change_ts <= self.peek_ts()
        }
    }
}

/// Whether a [`ChangeSourceLock`] is active on this thread.
pub fn is_in_active_state() -> bool {
    ACTIVE_TS.with(Cell::get) != TS_UNDEFINED
}

/// Whether a [`DetermineChangeLock`] is active on this thread.
pub fn is_in_determine_state() -> bool {
    DETERMINE_DEPTH.with(Cell::get) > 0
}

/// Attributes changes made on this thread to a fixed timestamp.
///
/// Scopes nest; dropping restores the enclosing timestamp.
#[must_use = "the change source is released when the guard is dropped"]
pub struct ChangeSourceLock {
    previous: TimeStamp,
}

impl ChangeSourceLock {
    pub fn new(ts: TimeStamp) -> Self {
        let ts = ts.max(TS_BERESHIT);
        let previous = ACTIVE_TS.with(|active| active.replace(ts));
        if previous != TS_UNDEFINED && ts > previous {
            tracing::warn!(ts, previous, "change source activated a later frame");
        }
        Self { previous }
    }
}

impl Drop for ChangeSourceLock {
    fn drop(&mut self) {
        ACTIVE_TS.with(|active| active.set(self.previous));
    }
}

/// Suspends any active change source while change state is determined.
#[must_use = "determine state ends when the guard is dropped"]
pub struct DetermineChangeLock {
    previous: TimeStamp,
}

impl DetermineChangeLock {
    pub fn new() -> Self {
        let previous = ACTIVE_TS.with(|active| active.replace(TS_UNDEFINED));
        DETERMINE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { previous }
    }
}

impl Default for DetermineChangeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DetermineChangeLock {
    fn drop(&mut self) {
        debug_assert!(!is_in_active_state());
        DETERMINE_DEPTH.with(|depth| depth.set(depth.get() - 1));
        ACTIVE_TS.with(|active| active.set(self.previous));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_starts_at_bereshit() {
        let clock = TimeClock::new();
        assert_eq!(clock.last_ts(), TS_BERESHIT);
    }

    #[test]
    fn unobserved_changes_share_a_frame() {
        let clock = TimeClock::new();
        let first = clock.fresh_ts();
        let second = clock.fresh_ts();
        assert_eq!(first, 2);
        assert_eq!(first, second);

        // Observing commits the frame, so the next change opens a new one.
        assert_eq!(clock.last_ts(), 2);
        assert_eq!(clock.fresh_ts(), 3);
    }

    #[test]
    fn change_source_scopes_nest() {
        let clock = TimeClock::new();
        {
            let _outer = ChangeSourceLock::new(7);
            assert_eq!(clock.active_ts(), 7);
            {
                let _inner = ChangeSourceLock::new(5);
                assert_eq!(clock.active_ts(), 5);
                assert!(clock.check_ts(5));
                assert!(!clock.check_ts(6));
            }
            assert_eq!(clock.active_ts(), 7);
        }
        assert!(!is_in_active_state());
    }

    #[test]
    fn determine_state_does_not_open_frames() {
        let clock = TimeClock::new();
        let _source = ChangeSourceLock::new(4);
        {
            let _determine = DetermineChangeLock::new();
            assert!(is_in_determine_state());
            assert!(!is_in_active_state());
            assert_eq!(clock.active_ts(), TS_BERESHIT);
        }
        assert!(!is_in_determine_state());
        assert_eq!(clock.active_ts(), 4);
    }
}
