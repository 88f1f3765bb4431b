//! Schedule group fabric
//!
//! Groups partition queues and threads into scheduling domains. A
//! group owns `num_prio * xfactor` lanes; each of its queues maps to
//! one lane of its priority, spread by creation order. Threads join
//! and leave groups through a wanted/actual mask pair per priority:
//! group operations update the wanted side and raise the target
//! thread's change flag; the thread itself folds the change into its
//! lane list at its next `schedule` call, so the hot path takes no
//! global lock.
//!
//! All group lifecycle operations serialize on one spin lock (cold
//! path by design).

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use super::lane::SchedLane;
use super::thread::ThreadTable;
use crate::config::{GROUP_NAME_LEN, MAX_SCHED_GROUP, NUM_PRIO};
use crate::error::{SchedError, SchedResult};
use crate::sync::{AtomBitset, Bitset};
use crate::types::{GroupId, ThrMask};

/// Default group joined by every attached thread.
pub const GROUP_ALL: GroupId = 0;
/// Default group joined by worker threads.
pub const GROUP_WORKER: GroupId = 1;
/// Default group joined by control threads.
pub const GROUP_CONTROL: GroupId = 2;

/// Information reported by `group_info`.
#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub thrmask: ThrMask,
}

/// One schedule group.
#[derive(Debug)]
pub struct SchedGroup {
    name: String,
    xfactor: u32,
    num_prio: u32,
    /// Threads that asked to be members.
    thr_wanted: AtomBitset<1>,
    /// Threads that have folded the membership into their lane lists,
    /// per priority. Bits only appear for priorities carrying queues.
    thr_actual: [AtomBitset<1>; NUM_PRIO],
    /// Queues created per priority; also drives lane spreading.
    xcount: [AtomicU32; NUM_PRIO],
    lanes: Box<[SchedLane]>,
}

impl SchedGroup {
    /// Create a group with empty membership.
    pub fn new(name: &str, xfactor: u32, num_prio: u32) -> Arc<Self> {
        let mut truncated = String::from(name);
        truncated.truncate(GROUP_NAME_LEN - 1);
        let lanes = (0..num_prio * xfactor)
            .map(|i| SchedLane::new(i / xfactor))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(SchedGroup {
            name: truncated,
            xfactor,
            num_prio,
            thr_wanted: AtomBitset::new(),
            thr_actual: core::array::from_fn(|_| AtomBitset::new()),
            xcount: core::array::from_fn(|_| AtomicU32::new(0)),
            lanes,
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lanes per priority.
    pub fn xfactor(&self) -> u32 {
        self.xfactor
    }

    /// Lane by flat index (`prio * xfactor + x`).
    pub fn lane(&self, off: u32) -> &SchedLane {
        &self.lanes[off as usize]
    }

    /// Wanted thread membership as a plain mask.
    pub fn thr_wanted(&self) -> ThrMask {
        ThrMask(self.thr_wanted.load(Ordering::Relaxed).0[0])
    }

    /// Actual membership at one priority.
    pub fn thr_actual(&self, prio: usize) -> ThrMask {
        ThrMask(self.thr_actual[prio].load(Ordering::Relaxed).0[0])
    }

    /// Record that a thread folded this group into its lane list at
    /// `prio`.
    pub fn set_actual(&self, prio: usize, thr: u32) {
        self.thr_actual[prio].set(thr as usize, Ordering::Relaxed);
    }

    /// Record that a thread dropped this group's lanes at `prio`.
    pub fn clr_actual(&self, prio: usize, thr: u32) {
        self.thr_actual[prio].clr(thr as usize, Ordering::Relaxed);
    }

    /// Queue count at one priority.
    pub fn xcount(&self, prio: usize) -> u32 {
        self.xcount[prio].load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinLeave {
    Join,
    Leave,
}

/// The group table: allocation bitset plus slot array.
#[derive(Debug)]
pub struct GroupTable {
    num_prio: u32,
    default_xfactor: u32,
    /// Serializes create/destroy/join/leave.
    lock: Mutex<()>,
    /// Set bit = slot free.
    free: AtomBitset<4>,
    slots: Box<[RwLock<Option<Arc<SchedGroup>>>]>,
}

impl GroupTable {
    /// Create an empty table.
    pub fn new(num_prio: u32, default_xfactor: u32) -> Self {
        let free = AtomBitset::new();
        let mut all = Bitset::null();
        for i in 0..MAX_SCHED_GROUP {
            all.set(i);
        }
        free.store(all, Ordering::Relaxed);
        GroupTable {
            num_prio,
            default_xfactor,
            lock: Mutex::new(()),
            free,
            slots: (0..MAX_SCHED_GROUP).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Resolve a group handle.
    pub fn group(&self, gid: GroupId) -> SchedResult<Arc<SchedGroup>> {
        self.slots
            .get(gid as usize)
            .and_then(|s| s.read().clone())
            .ok_or(SchedError::InvalidGroup(gid))
    }

    /// Create a group. The spread factor comes from the initial thread
    /// mask, or the configured default when the mask is empty.
    pub fn create(
        &self,
        threads: &ThreadTable,
        name: &str,
        mask: ThrMask,
    ) -> SchedResult<GroupId> {
        let _g = self.lock.lock();

        let free = self.free.load(Ordering::Relaxed);
        let gid = free
            .ffs()
            .ok_or(SchedError::CapacityExceeded("group table"))? as GroupId;
        self.free.clr(gid as usize, Ordering::Relaxed);

        let xfactor = if mask.count() > 0 {
            mask.count()
        } else {
            self.default_xfactor
        };
        let sg = SchedGroup::new(name, xfactor, self.num_prio);
        *self.slots[gid as usize].write() = Some(Arc::clone(&sg));

        if !mask.is_empty() {
            self.update_membership(threads, &sg, gid, mask, JoinLeave::Join);
        }
        Ok(gid)
    }

    /// Destroy a group. The group must have no queues; in-flight
    /// join/leave requests are quiesced first.
    pub fn destroy(&self, gid: GroupId) -> SchedResult<()> {
        let _g = self.lock.lock();
        let sg = self.locked_group(gid)?;

        // Wait until every notified thread has processed its pending
        // membership update for priorities that still carry queues.
        for p in 0..self.num_prio as usize {
            if sg.xcount(p) != 0 {
                let wanted = sg.thr_wanted();
                while sg.thr_actual(p) != wanted {
                    core::hint::spin_loop();
                }
            }
        }

        for p in 0..self.num_prio as usize {
            if !sg.thr_actual(p).is_empty() {
                log::error!("group {gid} destroy refused: threads present");
                return Err(SchedError::MisSequence("group has threads"));
            }
            if sg.xcount(p) != 0 {
                log::error!("group {gid} destroy refused: queues present");
                return Err(SchedError::MisSequence("group has queues"));
            }
        }

        *self.slots[gid as usize].write() = None;
        self.free.set(gid as usize, Ordering::Release);
        Ok(())
    }

    /// Find a group by name.
    pub fn lookup(&self, name: &str) -> SchedResult<GroupId> {
        let _g = self.lock.lock();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(sg) = slot.read().as_ref() {
                if sg.name() == name {
                    return Ok(i as GroupId);
                }
            }
        }
        Err(SchedError::InvalidGroup(GroupId::MAX))
    }

    /// Add threads to a group.
    pub fn join(&self, threads: &ThreadTable, gid: GroupId, mask: ThrMask) -> SchedResult<()> {
        let _g = self.lock.lock();
        let sg = self.locked_group(gid)?;
        self.update_membership(threads, &sg, gid, mask, JoinLeave::Join);
        Ok(())
    }

    /// Remove threads from a group.
    pub fn leave(&self, threads: &ThreadTable, gid: GroupId, mask: ThrMask) -> SchedResult<()> {
        let _g = self.lock.lock();
        let sg = self.locked_group(gid)?;
        self.update_membership(threads, &sg, gid, mask, JoinLeave::Leave);
        Ok(())
    }

    /// Wanted membership of a group.
    pub fn thrmask(&self, gid: GroupId) -> SchedResult<ThrMask> {
        let _g = self.lock.lock();
        Ok(self.locked_group(gid)?.thr_wanted())
    }

    /// Name and membership of a group.
    pub fn info(&self, gid: GroupId) -> SchedResult<GroupInfo> {
        let _g = self.lock.lock();
        let sg = self.locked_group(gid)?;
        Ok(GroupInfo {
            name: sg.name().to_string(),
            thrmask: sg.thr_wanted(),
        })
    }

    /// Register one queue at `prio`, choosing its lane. The first
    /// queue of a priority makes the group's wanted threads subscribe
    /// to that priority's lanes.
    pub fn queue_init(
        &self,
        threads: &ThreadTable,
        gid: GroupId,
        prio: u32,
    ) -> SchedResult<(Arc<SchedGroup>, u32)> {
        let sg = self.group(gid)?;
        let x = sg.xcount[prio as usize].fetch_add(1, Ordering::Relaxed);
        if x == 0 {
            // First queue for this priority: notify wanted threads.
            for thr in sg.thr_wanted().iter() {
                let slot = threads.slot(thr);
                slot.sg_wanted(prio as usize)
                    .set(gid as usize, Ordering::Release);
                slot.raise_sem();
            }
        }
        let off = prio * sg.xfactor() + x % sg.xfactor();
        Ok((sg, off))
    }

    /// Unregister one queue at `prio`. The last queue of a priority
    /// makes the wanted threads drop that priority's lanes.
    pub fn queue_fini(&self, threads: &ThreadTable, gid: GroupId, prio: u32) {
        let Ok(sg) = self.group(gid) else { return };
        let x = sg.xcount[prio as usize].fetch_sub(1, Ordering::Relaxed) - 1;
        if x == 0 {
            for thr in sg.thr_wanted().iter() {
                let slot = threads.slot(thr);
                slot.sg_wanted(prio as usize)
                    .clr(gid as usize, Ordering::Release);
                slot.raise_sem();
            }
        }
    }

    fn locked_group(&self, gid: GroupId) -> SchedResult<Arc<SchedGroup>> {
        if gid as usize >= MAX_SCHED_GROUP || self.free.is_set(gid as usize, Ordering::Relaxed) {
            return Err(SchedError::InvalidGroup(gid));
        }
        self.slots[gid as usize]
            .read()
            .clone()
            .ok_or(SchedError::InvalidGroup(gid))
    }

    fn update_membership(
        &self,
        threads: &ThreadTable,
        sg: &Arc<SchedGroup>,
        gid: GroupId,
        mask: ThrMask,
        op: JoinLeave,
    ) {
        for thr in mask.iter() {
            match op {
                JoinLeave::Join => sg.thr_wanted.set(thr as usize, Ordering::Relaxed),
                JoinLeave::Leave => sg.thr_wanted.clr(thr as usize, Ordering::Relaxed),
            }
            for p in 0..self.num_prio as usize {
                if sg.xcount(p) != 0 {
                    // Priorities carrying queues are reflected into the
                    // thread's wanted masks right away.
                    let slot = threads.slot(thr);
                    match op {
                        JoinLeave::Join => slot.sg_wanted(p).set(gid as usize, Ordering::Release),
                        JoinLeave::Leave => slot.sg_wanted(p).clr(gid as usize, Ordering::Release),
                    }
                    slot.raise_sem();
                }
            }
        }
    }
}
