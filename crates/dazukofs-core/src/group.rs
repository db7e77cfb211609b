use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Condvar;

/// A named policy channel.
///
/// Only identity, wake channels and liveness live here; the queues and the
/// tracking counters are mutable engine state guarded by the single work
/// lock. Both condvars pair with that lock.
pub(crate) struct Group {
    pub(crate) id: usize,
    pub(crate) name: String,
    /// Wakes one blocked claimant when a todo slot appears.
    pub(crate) wait_queue: Condvar,
    /// Wakes every readiness poller.
    pub(crate) poll_queue: Condvar,
    /// Holds the group's storage alive across a registry-lock drop; a
    /// deprecated group is reaped only once this returns to zero.
    pub(crate) use_count: AtomicUsize,
    deprecated: AtomicBool,
}

impl Group {
    pub(crate) fn new(id: usize, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            wait_queue: Condvar::new(),
            poll_queue: Condvar::new(),
            use_count: AtomicUsize::new(0),
            deprecated: AtomicBool::new(false),
        }
    }

    pub(crate) fn deprecated(&self) -> bool {
        self.deprecated.load(Ordering::Acquire)
    }

    /// One-way transition; the group accepts no new events afterwards.
    pub(crate) fn deprecate(&self) {
        self.deprecated.store(true, Ordering::Release);
    }
}
