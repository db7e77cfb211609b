use std::sync::Arc;

use dazukofs_core::{Engine, GROUP_MAX};

use crate::ctrl::CtrlHandle;
use crate::error::DeviceError;
use crate::group::GroupHandle;
use crate::ign::IgnoreHandle;

/// Default device-class name; nodes appear as `dazukofs.ctrl`,
/// `dazukofs.ign` and `dazukofs.0` through `dazukofs.9`.
pub const DEVICE_NAME: &str = "dazukofs";

/// The character-device family in front of one engine: a control node, an
/// ignore node, and one node per possible group id. A host wires these to
/// real device nodes; sessions opened here carry all per-open state.
pub struct DeviceClass {
    engine: Arc<Engine>,
    name: String,
}

impl DeviceClass {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self::with_name(engine, DEVICE_NAME)
    }

    pub fn with_name(engine: Arc<Engine>, name: &str) -> Self {
        Self {
            engine,
            name: name.to_string(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node names in creation order: control, ignore, then the group nodes.
    pub fn node_names(&self) -> Vec<String> {
        let mut names = vec![format!("{}.ctrl", self.name), format!("{}.ign", self.name)];
        names.extend((0..GROUP_MAX).map(|k| format!("{}.{k}", self.name)));
        names
    }

    pub fn open_ctrl(&self) -> CtrlHandle {
        CtrlHandle::new(Arc::clone(&self.engine))
    }

    /// Open the ignore device for `pid`; the process stays unmediated for
    /// the life of the returned session.
    pub fn open_ignore(&self, pid: u32) -> IgnoreHandle {
        let pid = self.engine.pid(pid);
        IgnoreHandle::new(Arc::clone(&self.engine), pid)
    }

    /// Open the group device `k` for `pid`. Opening succeeds for any
    /// existing node, whether or not a group currently owns the id — reads
    /// on an ownerless node fail, as on a removed group.
    pub fn open_group(&self, k: usize, pid: u32) -> Result<GroupHandle, DeviceError> {
        if k >= GROUP_MAX {
            return Err(DeviceError::NoSuchNode);
        }
        let pid = self.engine.pid(pid);
        Ok(GroupHandle::open(Arc::clone(&self.engine), k, pid))
    }
}
