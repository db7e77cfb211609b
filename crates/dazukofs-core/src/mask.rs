use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::pid::Pid;
use crate::sync;

struct Entry {
    pid: Pid,
    token: u64,
}

/// Transient per-process markers suppressing recursive access events.
///
/// An entry exists only around the engine's own open of a subject file on
/// behalf of a claimant. The mediated-open path consumes it via [`take`];
/// the guard returned by [`mask`] unlinks it on drop if the open path did
/// not get that far.
///
/// [`take`]: RecursionMask::take
/// [`mask`]: RecursionMask::mask
#[derive(Default)]
pub(crate) struct RecursionMask {
    inner: Mutex<Vec<Entry>>,
    next_token: AtomicU64,
}

impl RecursionMask {
    /// Mark `pid` so that its next mediated open is passed through.
    pub(crate) fn mask(&self, pid: &Pid) -> MaskGuard<'_> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        sync::lock(&self.inner).push(Entry {
            pid: pid.clone(),
            token,
        });
        MaskGuard { mask: self, token }
    }

    /// Consume the most recent mask entry for `pid`. True means the caller
    /// is inside an engine-originated open and must not fan out an event.
    pub(crate) fn take(&self, pid: &Pid) -> bool {
        let mut list = sync::lock(&self.inner);
        if let Some(at) = list.iter().rposition(|e| e.pid.same(pid)) {
            list.remove(at);
            return true;
        }
        false
    }

    fn unlink(&self, token: u64) {
        let mut list = sync::lock(&self.inner);
        if let Some(at) = list.iter().position(|e| e.token == token) {
            list.remove(at);
        }
    }
}

pub(crate) struct MaskGuard<'a> {
    mask: &'a RecursionMask,
    token: u64,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        self.mask.unlink(self.token);
    }
}
