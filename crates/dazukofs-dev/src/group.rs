use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Arc;

use tracing::debug;

use dazukofs_core::{CancelFlag, Engine, Pid, Verdict};

use crate::error::DeviceError;
use crate::proto;

/// One open session on a per-group device.
///
/// Reads block for the next access event of the group and install a
/// read-only descriptor to the subject in the calling process; writes post
/// verdicts. Claims the session has read but not answered are reposted to
/// the group when the session drops, so another policy process can take
/// over after a crash.
pub struct GroupHandle {
    engine: Arc<Engine>,
    group_id: usize,
    pid: Pid,
    tracked: bool,
    claimed: Vec<u64>,
    cancel: Arc<CancelFlag>,
}

impl GroupHandle {
    pub(crate) fn open(engine: Arc<Engine>, group_id: usize, pid: Pid) -> Self {
        let tracked = engine.group_open_tracking(group_id);
        Self {
            engine,
            group_id,
            pid,
            tracked,
            claimed: Vec::new(),
            cancel: Arc::new(CancelFlag::new()),
        }
    }

    /// Block for the next event and render `"id=<E>\nfd=<F>\npid=<P>\n"`
    /// into `buf`. The descriptor `<F>` is installed in this process and
    /// owned by the caller from here on. Buffers shorter than
    /// [`GROUP_READ_MIN`](crate::GROUP_READ_MIN) are rejected before
    /// anything is claimed.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if buf.len() < proto::GROUP_READ_MIN {
            return Err(DeviceError::BufferTooSmall {
                got: buf.len(),
                need: proto::GROUP_READ_MIN,
            });
        }

        let claim = self
            .engine
            .get_event(self.group_id, &self.pid, &self.cancel)?;
        let line = proto::render_event_line(
            claim.event_id,
            claim.file.as_raw_fd(),
            claim.requester_pid,
        );
        if line.len() > buf.len() {
            drop(claim.file);
            let _ = self
                .engine
                .return_event(self.group_id, claim.event_id, Verdict::Repost);
            return Err(DeviceError::BufferTooSmall {
                got: buf.len(),
                need: line.len(),
            });
        }

        self.claimed.push(claim.event_id);
        buf[..line.len()].copy_from_slice(line.as_bytes());
        // Hand the descriptor over to the claimant.
        let _ = claim.file.into_raw_fd();
        Ok(line.len())
    }

    /// Post a verdict: `"id=<E>\nr=<R>\n"`, `0` for allow, anything else
    /// for deny.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        let (event_id, verdict) = proto::parse_verdict(buf)?;
        self.engine.return_event(self.group_id, event_id, verdict)?;
        self.claimed.retain(|id| *id != event_id);
        Ok(buf.len())
    }

    /// Readiness: true iff an event is queued for this group.
    pub fn poll(&self) -> Result<bool, DeviceError> {
        Ok(self.engine.poll(self.group_id)?)
    }

    pub fn group_id(&self) -> usize {
        self.group_id
    }

    /// A detached canceller that unblocks a read pending in another thread,
    /// the way a signal would.
    pub fn canceller(&self) -> GroupCanceller {
        GroupCanceller {
            engine: Arc::clone(&self.engine),
            group_id: self.group_id,
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl Drop for GroupHandle {
    fn drop(&mut self) {
        for event_id in self.claimed.drain(..) {
            debug!(group = self.group_id, event = event_id, "reposting unanswered claim");
            let _ = self
                .engine
                .return_event(self.group_id, event_id, Verdict::Repost);
        }
        if self.tracked {
            self.engine.group_release_tracking(self.group_id);
        }
    }
}

pub struct GroupCanceller {
    engine: Arc<Engine>,
    group_id: usize,
    cancel: Arc<CancelFlag>,
}

impl GroupCanceller {
    pub fn cancel(&self) {
        self.cancel.set();
        self.engine.wake_group(self.group_id);
    }
}
