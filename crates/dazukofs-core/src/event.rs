use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use crate::pid::Pid;
use crate::sync;

/// Verdict a policy process returns for one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Put the event back on the group's todo queue for another claimant.
    Repost,
}

/// Outcome of arbitration as observed by the initiator of the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// One pending file access under arbitration.
///
/// The event is shared between the blocked initiator and one queue slot per
/// group it was fanned out to; `state.assigned` counts those slots. The
/// initiator sleeps on `wake` until the count reaches zero.
pub(crate) struct Event {
    subject: PathBuf,
    requester: Pid,
    /// Guards id, deny, assigned and deprecated.
    state: Mutex<EventState>,
    wake: Condvar,
}

#[derive(Default)]
struct EventState {
    id: u64,
    deny: bool,
    assigned: usize,
    deprecated: bool,
}

impl Event {
    pub(crate) fn new(subject: PathBuf, requester: Pid) -> Self {
        Self {
            subject,
            requester,
            state: Mutex::new(EventState::default()),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn subject(&self) -> &Path {
        &self.subject
    }

    pub(crate) fn requester(&self) -> &Pid {
        &self.requester
    }

    pub(crate) fn id(&self) -> u64 {
        sync::lock(&self.state).id
    }

    /// Stamp the fan-out id and account one queue slot per group. Called
    /// under the work lock so the id order matches the queue order.
    pub(crate) fn assign(&self, id: u64, groups: usize) {
        let mut state = sync::lock(&self.state);
        state.id = id;
        state.assigned += groups;
    }

    /// Block until every group has released its slot, then report the
    /// accumulated deny state. Not cancellable: the wait is re-entered on
    /// every spurious wakeup until the count reaches zero.
    pub(crate) fn wait_settled(&self) -> bool {
        let mut state = sync::lock(&self.state);
        while state.assigned > 0 {
            state = sync::wait(&self.wake, state);
        }
        state.deny
    }

    /// Release one side's handle on the event.
    ///
    /// Group side (`decrement` true): drop one slot, fold in `deny`, and
    /// wake the initiator when the last slot goes — unless the initiator
    /// already deprecated the event, in which case the last slot simply
    /// drops the final reference.
    ///
    /// Initiator side (`decrement` false): if slots are still out, mark the
    /// event deprecated so the last group-side release tears it down.
    pub(crate) fn release(&self, decrement: bool, deny: bool) {
        let mut state = sync::lock(&self.state);
        if deny {
            state.deny = true;
        }
        if decrement {
            state.assigned -= 1;
            if state.assigned == 0 && !state.deprecated {
                self.wake.notify_one();
            }
        } else if state.assigned > 0 {
            state.deprecated = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::PidTable;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn event() -> Event {
        let pids = PidTable::default();
        Event::new(PathBuf::from("/tmp/subject"), pids.acquire(100))
    }

    #[test]
    fn test_deny_is_sticky() {
        let evt = event();
        evt.assign(1, 3);
        evt.release(true, false);
        evt.release(true, true);
        evt.release(true, false);
        assert!(evt.wait_settled());
    }

    #[test]
    fn test_settles_only_after_last_release() {
        let evt = Arc::new(event());
        evt.assign(1, 2);
        let waiter = {
            let evt = Arc::clone(&evt);
            std::thread::spawn(move || evt.wait_settled())
        };
        evt.release(true, false);
        assert!(!waiter.is_finished());
        evt.release(true, false);
        assert!(!waiter.join().expect("waiter panicked"));
    }
}
