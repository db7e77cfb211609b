use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::event::{Access, Event, Verdict};
use crate::group::Group;
use crate::ignore::IgnoreList;
use crate::mask::RecursionMask;
use crate::pid::{Pid, PidTable};
use crate::{is_group_name_char, sync, GROUP_MAX};

/// Claim handed to a policy process: the event identity, a read-only handle
/// on the subject opened under the claimant's identity, and the requester's
/// visible pid number.
pub struct ClaimedEvent {
    pub event_id: u64,
    pub file: File,
    pub requester_pid: u32,
}

/// Cooperative cancellation for the claim wait, the userspace stand-in for
/// signal delivery. Set the flag, then wake the group so a blocked
/// [`Engine::get_event`] observes it.
#[derive(Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Group membership. Mutations serialize on the registry write lock;
/// fan-out and lookups take a read share.
struct Registry {
    groups: Vec<Arc<Group>>,
}

impl Registry {
    fn live(&self, id: usize) -> Option<&Arc<Group>> {
        self.groups.iter().find(|g| !g.deprecated() && g.id == id)
    }

    fn live_by_name(&self, name: &str) -> Option<&Arc<Group>> {
        self.groups.iter().find(|g| !g.deprecated() && g.name == name)
    }

    fn live_count(&self) -> usize {
        self.groups.iter().filter(|g| !g.deprecated()).count()
    }
}

/// Per-group queue state. An entry exists exactly while the group is not
/// deprecated; the drain on removal takes it out together with its events.
#[derive(Default)]
struct GroupWork {
    todo: VecDeque<Arc<Event>>,
    working: Vec<Arc<Event>>,
    tracking: bool,
    track_count: usize,
}

/// Everything the single work lock guards: every group's queues, the
/// tracking counters, and the event id counter.
struct WorkState {
    last_event_id: u64,
    groups: HashMap<usize, GroupWork>,
}

/// Holds a group alive across a registry-lock drop. Dropping the handle
/// releases the hold.
struct HeldGroup {
    group: Arc<Group>,
}

impl Drop for HeldGroup {
    fn drop(&mut self) {
        self.group.use_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The access-arbitration engine.
///
/// One instance mediates one mount (or one device-class worth of policy
/// groups). Every operation takes `&self`; the engine spawns no threads of
/// its own — each access intercept runs on the requester's thread and each
/// group operation on the policy process's thread.
///
/// Lock order, never acquired upward: registry lock, then the work lock,
/// then a single event's state lock. The ignore and mask locks are
/// independent leaves.
pub struct Engine {
    registry: RwLock<Registry>,
    work: Mutex<WorkState>,
    ignore: IgnoreList,
    mask: RecursionMask,
    pids: PidTable,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry { groups: Vec::new() }),
            work: Mutex::new(WorkState {
                last_event_id: 0,
                groups: HashMap::new(),
            }),
            ignore: IgnoreList::default(),
            mask: RecursionMask::default(),
            pids: PidTable::default(),
        }
    }

    /// Acquire an owned handle on a process identity.
    pub fn pid(&self, raw: u32) -> Pid {
        self.pids.acquire(raw)
    }

    // ---- group registry ----------------------------------------------

    /// Register a group. Succeeds if a group of this name already exists
    /// (upgrading it to tracking when `tracking` is set). Otherwise the
    /// smallest free id is allocated. Deprecated groups nobody holds
    /// anymore are reaped here.
    pub fn add_group(&self, name: &str, tracking: bool) -> Result<(), EngineError> {
        if name.is_empty() || !name.bytes().all(is_group_name_char) {
            return Err(EngineError::InvalidName);
        }

        let mut registry = sync::write(&self.registry);
        registry
            .groups
            .retain(|g| !g.deprecated() || g.use_count.load(Ordering::Acquire) > 0);

        if let Some(existing) = registry.live_by_name(name) {
            if tracking {
                let id = existing.id;
                let mut work = sync::lock(&self.work);
                if let Some(gw) = work.groups.get_mut(&id) {
                    gw.tracking = true;
                }
                info!(name, id, "group upgraded to tracking");
            }
            return Ok(());
        }

        if registry.live_count() == GROUP_MAX {
            return Err(EngineError::GroupLimit(GROUP_MAX));
        }
        let id = (0..GROUP_MAX)
            .find(|id| registry.live(*id).is_none())
            .ok_or(EngineError::GroupLimit(GROUP_MAX))?;

        let mut work = sync::lock(&self.work);
        work.groups.insert(
            id,
            GroupWork {
                tracking,
                ..GroupWork::default()
            },
        );
        drop(work);
        registry.groups.push(Arc::new(Group::new(id, name)));
        info!(name, id, tracking, "group added");
        Ok(())
    }

    /// Remove a group by name. Succeeds whether or not the group exists.
    /// All pending and in-progress events of the group are released
    /// (deny-neutral) and every waiter is woken; the storage lingers until
    /// the last holder lets go and is reaped on a later `add_group`.
    pub fn remove_group(&self, name: &str) {
        let registry = sync::write(&self.registry);
        if let Some(group) = registry.live_by_name(name) {
            let mut work = sync::lock(&self.work);
            Self::drain_group(group, &mut work);
            info!(name, id = group.id, "group removed");
        }
    }

    /// Snapshot of the live groups, one `"<id>:<name>\n"` line each.
    pub fn list_groups(&self) -> String {
        use std::fmt::Write;

        let registry = sync::read(&self.registry);
        let mut out = String::new();
        for group in registry.groups.iter().filter(|g| !g.deprecated()) {
            let _ = writeln!(out, "{}:{}", group.id, group.name);
        }
        out
    }

    /// Deprecate a group and release everything queued on it. Requires the
    /// work lock; the caller keeps a registry share so membership cannot
    /// shift underneath.
    fn drain_group(group: &Arc<Group>, work: &mut WorkState) {
        group.deprecate();
        if let Some(gw) = work.groups.remove(&group.id) {
            let pending = gw.todo.len() + gw.working.len();
            if pending > 0 {
                warn!(group = %group.name, pending, "draining group with pending events");
            }
            for event in gw.working.into_iter().chain(gw.todo) {
                event.release(true, false);
            }
        }
        group.wait_queue.notify_all();
        group.poll_queue.notify_all();
    }

    fn hold(&self, id: usize) -> Option<HeldGroup> {
        let registry = sync::read(&self.registry);
        let group = Arc::clone(registry.live(id)?);
        group.use_count.fetch_add(1, Ordering::AcqRel);
        Some(HeldGroup { group })
    }

    // ---- ignore registry ---------------------------------------------

    pub fn ignore_add(&self, pid: &Pid) {
        self.ignore.add(pid);
    }

    pub fn ignore_remove(&self, pid: &Pid) {
        self.ignore.remove(pid);
    }

    pub fn is_ignored(&self, pid: &Pid) -> bool {
        self.ignore.contains(pid)
    }

    // ---- arbitration: initiator side ---------------------------------

    /// Arbitrate one file access. Fans the event out to every live group
    /// and blocks, uninterruptibly, until each has answered or released it.
    /// Short-circuits to `Allowed` when there are no groups, when the
    /// requester is inside an engine-originated open (consuming its mask
    /// entry), or when the requester is ignored.
    pub fn check_access(&self, subject: &Path, requester: &Pid) -> Access {
        let registry = sync::read(&self.registry);

        if registry.live_count() == 0 {
            return Access::Allowed;
        }
        if self.mask.take(requester) {
            return Access::Allowed;
        }
        if self.ignore.contains(requester) {
            return Access::Allowed;
        }

        let event = Arc::new(Event::new(subject.to_path_buf(), requester.clone()));
        self.fan_out(&registry, &event);
        drop(registry);

        let denied = event.wait_settled();
        event.release(false, false);

        if denied {
            Access::Denied
        } else {
            Access::Allowed
        }
    }

    /// Stamp the next event id and link one queue slot per live group,
    /// waking each group's claimants and pollers. One critical section, so
    /// ids and queue positions agree in every group.
    fn fan_out(&self, registry: &Registry, event: &Arc<Event>) {
        let mut work = sync::lock(&self.work);
        work.last_event_id += 1;
        let id = work.last_event_id;

        let targets: Vec<&Arc<Group>> = registry
            .groups
            .iter()
            .filter(|g| !g.deprecated() && work.groups.contains_key(&g.id))
            .collect();
        event.assign(id, targets.len());
        for group in &targets {
            if let Some(gw) = work.groups.get_mut(&group.id) {
                gw.todo.push_back(Arc::clone(event));
                group.wait_queue.notify_one();
                group.poll_queue.notify_all();
            }
        }
        debug!(event = id, groups = targets.len(), "access event fanned out");
    }

    /// The host hook: arbitrate, then open the subject read-only. A denied
    /// verdict surfaces as [`EngineError::Denied`]. The claimant-side open
    /// inside [`Engine::get_event`] goes through here as well, which is what
    /// makes the recursion mask effective end to end.
    pub fn open_mediated(&self, subject: &Path, requester: &Pid) -> Result<File, EngineError> {
        match self.check_access(subject, requester) {
            Access::Denied => Err(EngineError::Denied),
            Access::Allowed => Ok(File::options().read(true).open(subject)?),
        }
    }

    // ---- arbitration: group side -------------------------------------

    /// Readiness snapshot: true iff the group has an unclaimed event.
    pub fn poll(&self, id: usize) -> Result<bool, EngineError> {
        let held = self.hold(id).ok_or(EngineError::NoSuchGroup(id))?;
        let work = sync::lock(&self.work);
        Ok(work
            .groups
            .get(&held.group.id)
            .is_some_and(|gw| !gw.todo.is_empty()))
    }

    /// Block until the group is readable or `timeout` elapses. Returns
    /// false on timeout; errors out if the group disappears meanwhile.
    pub fn poll_wait(&self, id: usize, timeout: Duration) -> Result<bool, EngineError> {
        let held = self.hold(id).ok_or(EngineError::NoSuchGroup(id))?;
        let group = &held.group;
        let deadline = Instant::now() + timeout;

        let mut work = sync::lock(&self.work);
        loop {
            if group.deprecated() {
                return Err(EngineError::NoSuchGroup(id));
            }
            if work
                .groups
                .get(&group.id)
                .is_some_and(|gw| !gw.todo.is_empty())
            {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            work = sync::wait_timeout(&group.poll_queue, work, deadline - now);
        }
    }

    /// Claim the next event for group `id`: wait for a todo slot, move it
    /// to the working set, and open the subject read-only under the
    /// claimant's identity with a recursion-mask entry pushed around the
    /// open. On open failure the slot goes back to the head of the todo
    /// queue and another claimant is woken.
    ///
    /// The wait is cancellable through `cancel` (returns `Interrupted`) and
    /// ends with `NoSuchGroup` if the group is removed meanwhile.
    pub fn get_event(
        &self,
        id: usize,
        claimant: &Pid,
        cancel: &CancelFlag,
    ) -> Result<ClaimedEvent, EngineError> {
        let held = self.hold(id).ok_or(EngineError::NoSuchGroup(id))?;
        let group = &held.group;

        let event = {
            let mut work = sync::lock(&self.work);
            loop {
                if cancel.is_set() {
                    return Err(EngineError::Interrupted);
                }
                if group.deprecated() {
                    return Err(EngineError::NoSuchGroup(id));
                }
                if let Some(event) = work
                    .groups
                    .get_mut(&group.id)
                    .and_then(|gw| gw.todo.pop_front())
                {
                    if let Some(gw) = work.groups.get_mut(&group.id) {
                        gw.working.push(Arc::clone(&event));
                    }
                    break event;
                }
                work = sync::wait(&group.wait_queue, work);
            }
        };

        let opened = {
            let _mask = self.mask.mask(claimant);
            self.open_mediated(event.subject(), claimant)
        };

        match opened {
            Ok(file) => {
                let claim = ClaimedEvent {
                    event_id: event.id(),
                    file,
                    requester_pid: event.requester().raw(),
                };
                debug!(group = id, event = claim.event_id, "event claimed");
                Ok(claim)
            }
            Err(err) => {
                self.unclaim(group, &event);
                Err(err)
            }
        }
    }

    /// Move a claimed-but-unserved event back to the head of the todo queue
    /// and wake another claimant.
    fn unclaim(&self, group: &Group, event: &Arc<Event>) {
        let mut work = sync::lock(&self.work);
        if let Some(gw) = work.groups.get_mut(&group.id) {
            if let Some(at) = gw.working.iter().position(|e| Arc::ptr_eq(e, event)) {
                let event = gw.working.remove(at);
                gw.todo.push_front(event);
            }
        }
        group.wait_queue.notify_one();
        group.poll_queue.notify_all();
    }

    /// Post a verdict for a claimed event. `Repost` returns the event to
    /// the todo queue without releasing it; `Allow`/`Deny` release the
    /// group's slot, folding the deny into the event.
    pub fn return_event(
        &self,
        id: usize,
        event_id: u64,
        verdict: Verdict,
    ) -> Result<(), EngineError> {
        let held = self.hold(id).ok_or(EngineError::NoSuchGroup(id))?;
        let group = &held.group;

        let mut work = sync::lock(&self.work);
        let gw = work
            .groups
            .get_mut(&group.id)
            .ok_or(EngineError::NoSuchEvent(event_id))?;
        let at = gw
            .working
            .iter()
            .position(|e| e.id() == event_id)
            .ok_or(EngineError::NoSuchEvent(event_id))?;
        let event = gw.working.remove(at);

        match verdict {
            Verdict::Repost => {
                gw.todo.push_front(event);
                group.wait_queue.notify_one();
                group.poll_queue.notify_all();
            }
            Verdict::Allow | Verdict::Deny => {
                drop(work);
                event.release(true, verdict == Verdict::Deny);
            }
        }
        debug!(group = id, event = event_id, ?verdict, "verdict returned");
        Ok(())
    }

    /// Wake every waiter of the group, claimants and pollers alike. Used by
    /// cancellers after setting their flag; the work lock is taken so the
    /// wakeup cannot slip between a waiter's flag check and its sleep.
    pub fn wake_group(&self, id: usize) {
        let registry = sync::read(&self.registry);
        if let Some(group) = registry.groups.iter().find(|g| g.id == id) {
            let _work = sync::lock(&self.work);
            group.wait_queue.notify_all();
            group.poll_queue.notify_all();
        }
    }

    // ---- tracking ----------------------------------------------------

    /// Record a policy-process registration on a tracking group. Returns
    /// true iff the group exists, is live, and tracks — the caller must
    /// then pair it with [`Engine::group_release_tracking`].
    pub fn group_open_tracking(&self, id: usize) -> bool {
        let registry = sync::read(&self.registry);
        let Some(group) = registry.live(id) else {
            return false;
        };
        let mut work = sync::lock(&self.work);
        match work.groups.get_mut(&group.id) {
            Some(gw) if gw.tracking => {
                group.use_count.fetch_add(1, Ordering::AcqRel);
                gw.track_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop a policy-process registration; the last one out removes the
    /// group.
    pub fn group_release_tracking(&self, id: usize) {
        let registry = sync::read(&self.registry);
        let Some(group) = registry.live(id) else {
            return;
        };
        let mut work = sync::lock(&self.work);
        let Some(gw) = work.groups.get_mut(&group.id) else {
            return;
        };
        if gw.tracking {
            group.use_count.fetch_sub(1, Ordering::AcqRel);
            gw.track_count -= 1;
            if gw.track_count == 0 {
                Self::drain_group(group, &mut work);
                info!(group = %group.name, id, "tracked group auto-removed");
            }
        }
    }

    // ---- lifecycle ---------------------------------------------------

    /// Tear the engine down: deprecate and drain every group, unblocking
    /// all initiators with whatever deny state accumulated. Callers must
    /// have released their device sessions first.
    pub fn shutdown(&self) {
        let mut registry = sync::write(&self.registry);
        let mut work = sync::lock(&self.work);
        let groups: Vec<Arc<Group>> = registry
            .groups
            .iter()
            .filter(|g| !g.deprecated())
            .cloned()
            .collect();
        for group in &groups {
            Self::drain_group(group, &mut work);
        }
        drop(work);
        registry.groups.clear();
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_rejects_bad_names() {
        let engine = Engine::new();
        assert!(matches!(
            engine.add_group("", false),
            Err(EngineError::InvalidName)
        ));
        assert!(matches!(
            engine.add_group("with space", false),
            Err(EngineError::InvalidName)
        ));
        assert!(matches!(
            engine.add_group("semi;colon", false),
            Err(EngineError::InvalidName)
        ));
        assert!(engine.add_group("Ok_name-2", false).is_ok());
    }

    #[test]
    fn test_add_is_idempotent() {
        let engine = Engine::new();
        engine.add_group("av", false).expect("first add");
        engine.add_group("av", false).expect("second add");
        assert_eq!(engine.list_groups(), "0:av\n");
    }

    #[test]
    fn test_ids_are_smallest_free() {
        let engine = Engine::new();
        engine.add_group("a", false).expect("add a");
        engine.add_group("b", false).expect("add b");
        engine.add_group("c", false).expect("add c");
        engine.remove_group("b");
        engine.add_group("d", false).expect("add d");
        assert_eq!(engine.list_groups(), "0:a\n2:c\n1:d\n");
    }

    #[test]
    fn test_group_limit() {
        let engine = Engine::new();
        for i in 0..GROUP_MAX {
            engine
                .add_group(&format!("g{i}"), false)
                .expect("add within limit");
        }
        assert!(matches!(
            engine.add_group("overflow", false),
            Err(EngineError::GroupLimit(_))
        ));
        // Re-adding an existing name still succeeds at the limit.
        engine.add_group("g3", false).expect("existing at limit");
    }

    #[test]
    fn test_remove_missing_group_is_ok() {
        let engine = Engine::new();
        engine.remove_group("ghost");
        assert_eq!(engine.list_groups(), "");
    }

    #[test]
    fn test_removed_group_rejects_operations() {
        let engine = Engine::new();
        engine.add_group("av", false).expect("add");
        engine.remove_group("av");
        assert!(matches!(
            engine.poll(0),
            Err(EngineError::NoSuchGroup(0))
        ));
        assert!(matches!(
            engine.return_event(0, 1, Verdict::Allow),
            Err(EngineError::NoSuchGroup(0))
        ));
    }

    #[test]
    fn test_no_groups_short_circuits_allow() {
        let engine = Engine::new();
        let pid = engine.pid(100);
        assert_eq!(
            engine.check_access(Path::new("/nonexistent"), &pid),
            Access::Allowed
        );
    }

    #[test]
    fn test_ignored_process_short_circuits_allow() {
        let engine = Engine::new();
        engine.add_group("av", false).expect("add");
        let pid = engine.pid(200);
        engine.ignore_add(&pid);
        assert_eq!(
            engine.check_access(Path::new("/nonexistent"), &pid),
            Access::Allowed
        );
        // Nothing was fanned out.
        assert!(!engine.poll(0).expect("poll"));
    }

    #[test]
    fn test_tracking_group_removed_with_last_registration() {
        let engine = Engine::new();
        engine.add_group("scan", true).expect("add");
        assert!(engine.group_open_tracking(0));
        assert!(engine.group_open_tracking(0));
        engine.group_release_tracking(0);
        assert_eq!(engine.list_groups(), "0:scan\n");
        engine.group_release_tracking(0);
        assert_eq!(engine.list_groups(), "");
    }

    #[test]
    fn test_tracking_not_taken_on_plain_group() {
        let engine = Engine::new();
        engine.add_group("plain", false).expect("add");
        assert!(!engine.group_open_tracking(0));
        // Upgrade through a second add.
        engine.add_group("plain", true).expect("upgrade");
        assert!(engine.group_open_tracking(0));
        engine.group_release_tracking(0);
        assert_eq!(engine.list_groups(), "");
    }

    #[test]
    fn test_verdict_for_unknown_event_is_rejected() {
        let engine = Engine::new();
        engine.add_group("av", false).expect("add");
        assert!(matches!(
            engine.return_event(0, 99, Verdict::Allow),
            Err(EngineError::NoSuchEvent(99))
        ));
    }
}
