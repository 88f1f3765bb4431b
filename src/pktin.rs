//! External input poll registry
//!
//! Packet input queues do not enqueue into scheduler queues by
//! themselves; workers poll them opportunistically whenever a schedule
//! pass found no work. The registry is a fixed array of 32-bit tags,
//! each encoding (interface, input queue) plus USED and BUSY bits.
//! Claiming a tag (USED -> USED|BUSY by CAS) gives one worker the
//! exclusive right to invoke the interface's poll callback, which in
//! turn enqueues any received events through the normal enqueue path.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use spin::RwLock;

use crate::error::{SchedError, SchedResult};

/// Registry capacity (total input queues across all interfaces).
pub const PKTIN_MAX: usize = 1024;

/// Maximum pollable interfaces.
pub const MAX_PKTIO: usize = 64;

const TAG_EMPTY: u32 = 0;
const TAG_USED: u32 = 1 << 15;
const TAG_BUSY: u32 = 1 << 31;

fn tag_encode(iface: u32, queue: u32) -> u32 {
    (iface << 16) | queue | TAG_USED
}

fn tag_iface(tag: u32) -> u32 {
    (tag >> 16) & 0x7FFF
}

fn tag_queue(tag: u32) -> u32 {
    tag & 0x7FFF
}

fn tag_ready(tag: u32) -> bool {
    tag & (TAG_USED | TAG_BUSY) == TAG_USED
}

/// Outcome of one poll callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PktinPollResult {
    /// Interface still running; the tag stays registered.
    Active,
    /// Interface stopped or closed; the tag is removed and
    /// `stop_finalize` fires once all of its queues are gone.
    Closed,
}

/// Callback contract for external input polling.
pub trait PktinPoller: Send + Sync {
    /// Poll one input queue of an interface. Received events are
    /// enqueued into scheduler queues by the implementation.
    fn poll(&self, iface: u32, queues: &[u32]) -> PktinPollResult;

    /// Called once the last input queue of a stopped interface has
    /// been removed from the registry.
    fn stop_finalize(&self, iface: u32);
}

/// The poll registry.
pub(crate) struct PktinRegistry {
    tags: Box<[AtomicU32]>,
    count: Box<[AtomicU16]>,
    num: AtomicU32,
    /// High watermark bounding tag iteration.
    hi: AtomicU32,
    poller: RwLock<Option<Arc<dyn PktinPoller>>>,
}

impl core::fmt::Debug for PktinRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PktinRegistry")
            .field("num", &self.num.load(Ordering::Relaxed))
            .field("hi", &self.hi.load(Ordering::Relaxed))
            .finish()
    }
}

impl PktinRegistry {
    pub(crate) fn new() -> Self {
        PktinRegistry {
            tags: (0..PKTIN_MAX).map(|_| AtomicU32::new(TAG_EMPTY)).collect(),
            count: (0..MAX_PKTIO).map(|_| AtomicU16::new(0)).collect(),
            num: AtomicU32::new(0),
            hi: AtomicU32::new(0),
            poller: RwLock::new(None),
        }
    }

    /// Install the poll callback. Must happen before any `start`.
    pub(crate) fn set_poller(&self, poller: Arc<dyn PktinPoller>) {
        *self.poller.write() = Some(poller);
    }

    /// Register the input queues of an interface.
    pub(crate) fn start(&self, iface: u32, queues: &[u32]) -> SchedResult<()> {
        if iface as usize >= MAX_PKTIO {
            return Err(SchedError::InvalidParam("interface index out of range"));
        }
        for &queue in queues {
            // Reserve capacity first so the slot scan below must find
            // an empty slot.
            if self.num.fetch_add(1, Ordering::Relaxed) as usize >= PKTIN_MAX {
                self.num.fetch_sub(1, Ordering::Relaxed);
                return Err(SchedError::CapacityExceeded("pktin registry"));
            }
            let mut j = 0usize;
            loop {
                if self.tags[j].load(Ordering::Relaxed) == TAG_EMPTY {
                    let tag = tag_encode(iface, queue);
                    if self.tags[j]
                        .compare_exchange(
                            TAG_EMPTY,
                            tag,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        self.hi.fetch_max(j as u32 + 1, Ordering::Relaxed);
                        self.count[iface as usize].fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                j = (j + 1) % PKTIN_MAX;
            }
        }
        Ok(())
    }

    /// Remove one (interface, queue) tag. Returns the interface's
    /// remaining registered queue count; the caller runs its own
    /// stop-finalize when that reaches zero.
    pub(crate) fn stop(&self, iface: u32, queue: u32) -> SchedResult<u16> {
        let want = tag_encode(iface, queue);
        let hi = self.hi.load(Ordering::Relaxed) as usize;
        for j in 0..hi {
            loop {
                let tag = self.tags[j].load(Ordering::Relaxed);
                if tag & !TAG_BUSY != want {
                    break;
                }
                if tag & TAG_BUSY != 0 {
                    // A worker is mid-poll on this tag; wait it out.
                    core::hint::spin_loop();
                    continue;
                }
                if self.tags[j]
                    .compare_exchange(tag, TAG_EMPTY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.num.fetch_sub(1, Ordering::Release);
                    let left = self.count[iface as usize].fetch_sub(1, Ordering::Relaxed) - 1;
                    return Ok(left);
                }
            }
        }
        Err(SchedError::InvalidParam("pktin tag not registered"))
    }

    /// One opportunistic poll pass. `next` and `poll_cnts` are the
    /// calling worker's rotation state. Stops after the first
    /// successful poll except on every sixteenth pass, which sweeps the
    /// whole registry so slots beyond the worker count cannot starve.
    pub(crate) fn poll(&self, next: &mut u32, poll_cnts: &mut u32) {
        let hi = self.hi.load(Ordering::Relaxed);
        if hi == 0 {
            return;
        }
        let poller = match self.poller.read().clone() {
            Some(p) => p,
            None => return,
        };

        let mut i = *next % hi;
        let mut npolls = 0;
        while npolls != hi {
            let tag = self.tags[i as usize].load(Ordering::Relaxed);
            if tag_ready(tag)
                && self.tags[i as usize]
                    .compare_exchange(tag, tag | TAG_BUSY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let iface = tag_iface(tag);
                let queue = tag_queue(tag);
                match poller.poll(iface, &[queue]) {
                    PktinPollResult::Closed => {
                        // Interface went away: drop the tag and
                        // finalize once its last queue is gone.
                        self.tags[i as usize].store(TAG_EMPTY, Ordering::Relaxed);
                        self.num.fetch_sub(1, Ordering::Release);
                        if self.count[iface as usize].fetch_sub(1, Ordering::Relaxed) == 1 {
                            poller.stop_finalize(iface);
                        }
                    }
                    PktinPollResult::Active => {
                        self.tags[i as usize].store(tag, Ordering::Relaxed);
                        if *poll_cnts & 0xF != 0 {
                            break;
                        }
                    }
                }
            }
            i = (i + 1) % hi;
            npolls += 1;
        }
        *poll_cnts = poll_cnts.wrapping_add(1);
        *next = i;
    }
}
