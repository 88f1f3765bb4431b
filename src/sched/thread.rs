//! Per-thread scheduler state
//!
//! Split in two: the *shared* slot other threads may poke (wanted
//! group masks plus the `sg_sem` change flag, all atomics) and the
//! *private* worker state owned by the `Worker` handle (sorted lane
//! list, reorder context pool, held queue). Membership changes flow
//! from group operations into the shared slot; the owning worker folds
//! them into its private state at the next `schedule` call.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::group::SchedGroup;
use crate::config::{MAX_SCHED_GROUP, NUM_PRIO};
use crate::error::{SchedError, SchedResult};
use crate::sync::AtomBitset;
use crate::types::{ThreadIndex, MAX_THREADS};

/// Upper bound on lanes a single worker can subscribe to.
pub const SCHEDQ_PER_THREAD: usize = MAX_SCHED_GROUP * NUM_PRIO;

/// Group masks span four 64-bit words.
pub type GroupMaskWords = AtomBitset<4>;

/// Shared, remotely-poked part of one thread's scheduler state.
#[derive(Debug)]
pub struct ThreadSlot {
    used: AtomicBool,
    /// Set by group operations when `sg_wanted` changed; cleared by the
    /// owning worker after it rebuilt its lane list.
    sg_sem: AtomicU32,
    /// Wanted group membership per priority.
    sg_wanted: [GroupMaskWords; NUM_PRIO],
}

impl ThreadSlot {
    fn new() -> Self {
        ThreadSlot {
            used: AtomicBool::new(false),
            sg_sem: AtomicU32::new(0),
            sg_wanted: core::array::from_fn(|_| AtomBitset::new()),
        }
    }

    /// Raise the change flag with release ordering so the wanted-mask
    /// updates are visible to the worker that observes the flag.
    pub fn raise_sem(&self) {
        self.sg_sem.store(1, Ordering::Release);
    }

    /// Racy check whether changes are pending.
    pub fn sem_pending(&self) -> bool {
        self.sg_sem.load(Ordering::Relaxed) != 0
    }

    /// Acquire-consume the change flag before rebuilding membership.
    pub fn take_sem(&self) {
        let _ = self.sg_sem.load(Ordering::Acquire);
        self.sg_sem.store(0, Ordering::Relaxed);
    }

    /// Wanted mask for one priority.
    pub fn sg_wanted(&self, prio: usize) -> &GroupMaskWords {
        &self.sg_wanted[prio]
    }
}

/// Fixed table of thread slots, indexed by thread index.
#[derive(Debug)]
pub struct ThreadTable {
    slots: Box<[ThreadSlot]>,
}

impl ThreadTable {
    /// Create the table with all slots free.
    pub fn new() -> Self {
        ThreadTable {
            slots: (0..MAX_THREADS).map(|_| ThreadSlot::new()).collect(),
        }
    }

    /// Allocate a thread index for an attaching thread.
    pub fn attach(&self) -> SchedResult<ThreadIndex> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot
                .used
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Force a membership rebuild on the first schedule call;
                // wanted bits may predate the attach.
                slot.raise_sem();
                return Ok(i as ThreadIndex);
            }
        }
        Err(SchedError::CapacityExceeded("thread table"))
    }

    /// Free a thread index at detach.
    pub fn detach(&self, tidx: ThreadIndex) {
        self.slots[tidx as usize].used.store(false, Ordering::Release);
    }

    /// Access a slot.
    pub fn slot(&self, tidx: ThreadIndex) -> &ThreadSlot {
        &self.slots[tidx as usize]
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's subscription to one lane of a group.
#[derive(Debug, Clone)]
pub struct LaneRef {
    pub grp: Arc<SchedGroup>,
    /// Index into the group's lane array.
    pub off: u32,
}

impl LaneRef {
    /// Priority of the referenced lane.
    pub fn prio(&self) -> u32 {
        self.grp.lane(self.off).prio()
    }

    fn is(&self, grp: &Arc<SchedGroup>, off: u32) -> bool {
        Arc::ptr_eq(&self.grp, grp) && self.off == off
    }
}

/// Sorted lane list held privately by each worker.
pub type LaneList = heapless::Vec<LaneRef, SCHEDQ_PER_THREAD>;

/// Insert a lane keeping the list sorted by priority. Equal-priority
/// entries shift so that earlier subscribers drift toward the end,
/// which combined with the thread-rotated lane offsets spreads workers
/// over a group's lanes.
pub fn insert_lane(list: &mut LaneList, mut lane: LaneRef) {
    for i in 0..list.len() {
        if lane.prio() <= list[i].prio() {
            core::mem::swap(&mut list[i], &mut lane);
        }
    }
    if list.push(lane).is_err() {
        // Sized for every lane of every group; cannot overflow unless
        // the tables disagree.
        log::error!("worker lane list overflow");
    }
}

/// Remove one lane from the list.
pub fn remove_lane(list: &mut LaneList, grp: &Arc<SchedGroup>, off: u32) {
    if let Some(pos) = list.iter().position(|l| l.is(grp, off)) {
        list.remove(pos);
    } else {
        log::error!("lane missing from worker lane list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach_roundtrip() {
        let table = ThreadTable::new();
        let a = table.attach().unwrap();
        let b = table.attach().unwrap();
        assert_ne!(a, b);
        assert!(table.slot(a).sem_pending());

        table.detach(a);
        let c = table.attach().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_lane_list_sorted_by_prio() {
        // Four priorities, one lane each: lane offset i has priority i
        let g = SchedGroup::new("t", 1, 4);
        let mut list = LaneList::new();
        for off in [2u32, 0, 3, 1] {
            insert_lane(&mut list, LaneRef { grp: Arc::clone(&g), off });
        }
        let prios: Vec<u32> = list.iter().map(|l| l.prio()).collect();
        assert_eq!(prios, vec![0, 1, 2, 3]);

        remove_lane(&mut list, &g, 0);
        let prios: Vec<u32> = list.iter().map(|l| l.prio()).collect();
        assert_eq!(prios, vec![1, 2, 3]);
    }
}
