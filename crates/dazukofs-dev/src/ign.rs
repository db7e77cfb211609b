use std::sync::Arc;

use tracing::debug;

use dazukofs_core::{Engine, Pid};

/// One open session on the ignore device.
///
/// While the session lives, the opener's file accesses bypass arbitration;
/// dropping it re-mediates the process. The device has no read or write
/// protocol.
pub struct IgnoreHandle {
    engine: Arc<Engine>,
    pid: Pid,
}

impl IgnoreHandle {
    pub(crate) fn new(engine: Arc<Engine>, pid: Pid) -> Self {
        engine.ignore_add(&pid);
        debug!(pid = pid.raw(), "process ignored");
        Self { engine, pid }
    }

    pub fn pid(&self) -> &Pid {
        &self.pid
    }
}

impl Drop for IgnoreHandle {
    fn drop(&mut self) {
        self.engine.ignore_remove(&self.pid);
        debug!(pid = self.pid.raw(), "process no longer ignored");
    }
}
