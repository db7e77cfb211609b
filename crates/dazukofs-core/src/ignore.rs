use std::sync::Mutex;

use crate::pid::Pid;
use crate::sync;

/// Processes whose file accesses bypass arbitration entirely.
///
/// Policy processes register themselves here so that their own file activity
/// (signature databases, logs) is not mediated back through their group.
#[derive(Default)]
pub(crate) struct IgnoreList {
    inner: Mutex<Vec<Pid>>,
}

impl IgnoreList {
    pub(crate) fn add(&self, pid: &Pid) {
        sync::lock(&self.inner).push(pid.clone());
    }

    pub(crate) fn remove(&self, pid: &Pid) {
        let mut list = sync::lock(&self.inner);
        if let Some(at) = list.iter().position(|p| p.same(pid)) {
            list.remove(at);
        }
    }

    pub(crate) fn contains(&self, pid: &Pid) -> bool {
        sync::lock(&self.inner).iter().any(|p| p.same(pid))
    }
}
