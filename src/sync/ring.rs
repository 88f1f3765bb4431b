//! Bounded MPMC event ring
//!
//! Every queue owns one of these rings. Producers and consumers claim
//! positions with CAS and hand slots over through per-slot sequence
//! numbers, so any mix of concurrent producers and consumers is safe:
//! atomic and ordered queues serialize their consumer side externally
//! (ticket or reorder turn), parallel queues dequeue concurrently.
//!
//! Enqueue and dequeue cursors live on separate cache lines.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::CacheAligned;
use crate::types::Event;

/// One ring slot: a sequence word for hand-over plus the event value.
#[derive(Debug)]
struct RingSlot {
    seq: AtomicU32,
    val: AtomicU64,
}

/// Bounded multi-producer multi-consumer ring of event handles.
#[derive(Debug)]
pub struct EventRing {
    mask: u32,
    slots: Box<[RingSlot]>,
    enq_pos: CacheAligned<AtomicU32>,
    deq_pos: CacheAligned<AtomicU32>,
}

impl EventRing {
    /// Create a ring with the given power-of-two capacity.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| RingSlot {
                seq: AtomicU32::new(i),
                val: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        EventRing {
            mask: capacity - 1,
            slots,
            enq_pos: CacheAligned::new(AtomicU32::new(0)),
            deq_pos: CacheAligned::new(AtomicU32::new(0)),
        }
    }

    /// Ring capacity.
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Push one event. Returns false when the ring is full.
    fn push(&self, ev: Event) -> bool {
        let mut pos = self.enq_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i32;
            if diff == 0 {
                match self.enq_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.val.store(ev.0, Ordering::Relaxed);
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                // Slot not yet consumed from the previous lap: full.
                return false;
            } else {
                pos = self.enq_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop one event. Returns None when the ring is empty.
    fn pop(&self) -> Option<Event> {
        let mut pos = self.deq_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i32;
            if diff == 0 {
                match self.deq_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let val = slot.val.load(Ordering::Relaxed);
                        slot.seq
                            .store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Some(Event(val));
                    }
                    Err(cur) => pos = cur,
                }
            } else if diff < 0 {
                // Slot not yet produced: empty.
                return None;
            } else {
                pos = self.deq_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Enqueue a burst. Returns the number actually enqueued (stops at
    /// the first full slot).
    pub fn enqueue(&self, events: &[Event]) -> usize {
        let mut done = 0;
        for ev in events {
            if !self.push(*ev) {
                break;
            }
            done += 1;
        }
        done
    }

    /// Dequeue a burst of at most `out.len()` events.
    pub fn dequeue(&self, out: &mut [Event]) -> usize {
        let mut done = 0;
        for slot in out.iter_mut() {
            match self.pop() {
                Some(ev) => {
                    *slot = ev;
                    done += 1;
                }
                None => break,
            }
        }
        done
    }

    /// Approximate occupancy. Exact only while producers and consumers
    /// are quiescent (the destroy path holds the queue writer-locked).
    pub fn len(&self) -> u32 {
        let enq = self.enq_pos.load(Ordering::Acquire);
        let deq = self.deq_pos.load(Ordering::Acquire);
        enq.wrapping_sub(deq)
    }

    /// Check emptiness (same caveat as `len`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
