//! One-shot lifecycle flags shared by connections and listeners.
//!
//! Every stage of an endpoint (bind attempted, bound, connect attempted,
//! connected, disposed, ...) is a [`StageFlag`]: it moves from unset to set
//! exactly once and never goes back. Public lifecycle methods claim their
//! stage with [`StageFlag::try_claim`], which makes them safe to call
//! concurrently or redundantly.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Monotonic, atomically claimed boolean.
#[derive(Default)]
pub struct StageFlag(AtomicBool);

impl StageFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Set the flag. Returns `true` only for the single caller that flipped it.
    pub fn try_claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set the flag without caring who got there first.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StageFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageFlag").field(&self.is_set()).finish()
    }
}

/// Observable state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Bound,
    Connecting,
    Connected,
    Disposed,
}

/// Observable state of a [`Listener`](crate::Listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Bound,
    Listening,
    Disposed,
}

/// Which failure notification a teardown owes its consumer.
///
/// A stage that was attempted but never completed is reported; bind takes
/// precedence over the later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageFailure {
    Bind,
    Second,
    None,
}

pub(crate) fn stage_failure(
    bind_attempted: &StageFlag,
    bound: &StageFlag,
    second_attempted: &StageFlag,
    second_done: &StageFlag,
) -> StageFailure {
    if bind_attempted.is_set() && !bound.is_set() {
        StageFailure::Bind
    } else if second_attempted.is_set() && !second_done.is_set() {
        StageFailure::Second
    } else {
        StageFailure::None
    }
}

/// Keeps the final `disposed` notification behind every other notification.
///
/// Regular notifications go through [`run`](Self::run), which skips them once
/// the gate is closed. Teardown closes the gate, then hands the final
/// notification to [`finish`](Self::finish). It runs after the last
/// in-flight notification returns, on whichever thread leaves the gate last.
/// That includes a notification that disposed its own endpoint.
#[derive(Debug, Default)]
pub(crate) struct NotifyGate {
    active: AtomicUsize,
    closed: AtomicBool,
    finishing: AtomicBool,
    finished: StageFlag,
}

impl NotifyGate {
    pub(crate) const fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            finished: StageFlag::new(),
        }
    }

    /// Stop admitting notifications.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Raise `notify` unless the gate is closed. Returns whether it ran.
    pub(crate) fn run(&self, notify: impl FnOnce(), last: impl FnOnce()) -> bool {
        self.active.fetch_add(1, Ordering::SeqCst);
        let open = !self.closed.load(Ordering::SeqCst);
        if open {
            notify();
        }
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.settle(last);
        }
        open
    }

    /// Raise `last` once no notification is in flight. Call after [`close`](Self::close).
    pub(crate) fn finish(&self, last: impl FnOnce()) {
        self.finishing.store(true, Ordering::SeqCst);
        if self.active.load(Ordering::SeqCst) == 0 {
            self.settle(last);
        }
    }

    fn settle(&self, last: impl FnOnce()) {
        if self.finishing.load(Ordering::SeqCst) && self.finished.try_claim() {
            last();
        }
    }
}
