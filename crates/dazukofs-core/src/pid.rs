use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::sync;

/// An owned handle on a process identity.
///
/// Handles compare by identity, never by raw number: acquiring a raw id
/// while another handle on it is still live yields the same identity, while
/// a raw id acquired after every prior handle dropped is a distinct one.
/// Membership sets keyed on `Pid` (ignore registry, recursion mask) are
/// therefore safe against pid reuse.
#[derive(Clone)]
pub struct Pid(Arc<PidSlot>);

struct PidSlot {
    raw: u32,
}

impl Pid {
    /// The numeric process id this handle was acquired for.
    pub fn raw(&self) -> u32 {
        self.0.raw
    }

    /// Identity comparison.
    pub fn same(&self, other: &Pid) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pid").field(&self.0.raw).finish()
    }
}

/// Interning table mapping live raw ids to their canonical identity.
#[derive(Default)]
pub(crate) struct PidTable {
    slots: Mutex<HashMap<u32, Weak<PidSlot>>>,
}

impl PidTable {
    pub(crate) fn acquire(&self, raw: u32) -> Pid {
        let mut slots = sync::lock(&self.slots);
        if let Some(slot) = slots.get(&raw).and_then(Weak::upgrade) {
            return Pid(slot);
        }
        slots.retain(|_, weak| weak.strong_count() > 0);
        let slot = Arc::new(PidSlot { raw });
        slots.insert(raw, Arc::downgrade(&slot));
        Pid(slot)
    }
}
