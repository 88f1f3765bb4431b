//! Reorder engine for ordered queues
//!
//! An ordered queue owns a [`ReorderWindow`]: a bounded range of
//! outstanding sequence numbers. Workers reserve a slot before
//! dequeueing, dequeue strictly in reservation order (the `turn`
//! counter), and then process concurrently. Output order is restored
//! at release time: a worker may only retire its slot once every
//! earlier slot has retired (`head` reaches its sequence number), at
//! which point its stashed enqueues are replayed in insertion order.
//!
//! Each window also carries up to [`MAX_ORDERED_LOCKS`] named "order
//! locks": independent sub-orderings inside the processing of a single
//! queue, advanced explicitly by the worker or implicitly at retire.

use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::MAX_ORDERED_LOCKS;
use crate::sync::CacheAligned;
use crate::types::{Event, QueueIndex};

/// Maximum events stashed per reorder context.
pub const STASH_MAX_EVENTS: usize = 512;

/// Maximum distinct (destination, run) entries per reorder context.
pub const STASH_MAX_BLOCKS: usize = 64;

/// Number of reorder contexts in each worker's pool.
pub const TS_RVEC_SIZE: usize = 16;

/// Sliding window of outstanding sequence numbers for one ordered
/// queue.
///
/// Invariants: `head <= turn <= tail` and `tail - head <= size` (in
/// wrapping arithmetic). All three counters only move forward.
#[derive(Debug)]
pub struct ReorderWindow {
    /// First sequence number not yet retired.
    head: AtomicU32,
    /// Next sequence number allowed to dequeue.
    turn: AtomicU32,
    /// Next sequence number to hand out.
    tail: CacheAligned<AtomicU32>,
    winmask: u32,
    lock_count: u16,
    olock: [CacheAligned<AtomicU32>; MAX_ORDERED_LOCKS],
}

impl ReorderWindow {
    /// Create a window of `size` slots (power of two) with
    /// `lock_count` named order locks.
    pub fn new(size: u32, lock_count: u16) -> Arc<Self> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(lock_count as usize <= MAX_ORDERED_LOCKS);
        Arc::new(ReorderWindow {
            head: AtomicU32::new(0),
            turn: AtomicU32::new(0),
            tail: CacheAligned::new(AtomicU32::new(0)),
            winmask: size - 1,
            lock_count,
            olock: core::array::from_fn(|_| CacheAligned::new(AtomicU32::new(0))),
        })
    }

    /// Number of named order locks on this window.
    pub fn lock_count(&self) -> u16 {
        self.lock_count
    }

    /// Reserve the next sequence number. Fails when the window is full
    /// (the caller moves on to another lane and retries later).
    pub fn reserve(&self) -> Option<u32> {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) > self.winmask {
                return None;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(tail),
                Err(cur) => tail = cur,
            }
        }
    }

    /// Hand back a reservation that saw an empty queue, provided no
    /// later reservation was made. The caller must still hold the
    /// dequeue turn for `sn` (turn has not been advanced past it).
    pub fn unreserve(&self, sn: u32) -> bool {
        self.tail
            .compare_exchange(
                sn.wrapping_add(1),
                sn,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Spin until it is `sn`'s turn to dequeue.
    pub fn wait_turn(&self, sn: u32) {
        while self.turn.load(Ordering::Acquire) != sn {
            core::hint::spin_loop();
        }
    }

    /// Pass the dequeue turn to the next reservation. Release ordering
    /// publishes the ring consumer update to the successor.
    pub fn advance_turn(&self, sn: u32) {
        self.turn.store(sn.wrapping_add(1), Ordering::Release);
    }

    /// Whether `sn` is the current head (the holder is in-order).
    pub fn is_head(&self, sn: u32) -> bool {
        self.head.load(Ordering::Acquire) == sn
    }

    /// Spin until `sn` becomes the head.
    pub fn wait_head(&self, sn: u32) {
        while self.head.load(Ordering::Acquire) != sn {
            core::hint::spin_loop();
        }
    }

    /// Retire `sn`: advance the head past it. Must only be called by
    /// the holder of `sn` once it is the head.
    pub fn advance_head(&self, sn: u32) {
        debug_assert_eq!(self.head.load(Ordering::Relaxed), sn);
        self.head.store(sn.wrapping_add(1), Ordering::Release);
    }

    /// Any reservation still outstanding? Used by the queue destroy
    /// check.
    pub fn in_flight(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }

    /// Current sequence value of order lock `index`.
    pub fn olock_value(&self, index: usize) -> u32 {
        self.olock[index].load(Ordering::Acquire)
    }

    /// Spin until order lock `index` reaches `sn`.
    pub fn olock_wait(&self, index: usize, sn: u32) {
        while self.olock[index].load(Ordering::Acquire) != sn {
            core::hint::spin_loop();
        }
    }

    /// Pass order lock `index` to the next slot.
    pub fn olock_release(&self, index: usize, sn: u32) {
        self.olock[index].store(sn.wrapping_add(1), Ordering::Release);
    }
}

/// One stashed enqueue run: `count` events starting at `start` in the
/// context's event array, destined for `dest`.
#[derive(Debug, Clone, Copy)]
struct StashBlock {
    dest: QueueIndex,
    start: u16,
    count: u16,
}

/// Per-worker state for one reorder window slot.
///
/// Allocated from a small per-worker pool when the worker dequeues
/// from an ordered queue; released when the worker next calls
/// `schedule` (or explicitly). While the worker is out-of-order, its
/// outgoing enqueues are collected here and replayed at retire time.
#[derive(Debug)]
pub struct ReorderContext {
    rwin: Option<Arc<ReorderWindow>>,
    sn: u32,
    /// Bit per order lock the worker released explicitly.
    olock_flags: u32,
    blocks: heapless::Vec<StashBlock, STASH_MAX_BLOCKS>,
    n_events: usize,
    events: [Event; STASH_MAX_EVENTS],
}

impl ReorderContext {
    /// Create an idle context.
    pub fn new() -> Self {
        ReorderContext {
            rwin: None,
            sn: 0,
            olock_flags: 0,
            blocks: heapless::Vec::new(),
            n_events: 0,
            events: [Event::NULL; STASH_MAX_EVENTS],
        }
    }

    /// Bind the context to a window slot.
    pub fn init(&mut self, rwin: Arc<ReorderWindow>, sn: u32) {
        self.rwin = Some(rwin);
        self.sn = sn;
        self.olock_flags = 0;
        self.blocks.clear();
        self.n_events = 0;
    }

    /// The window this context is bound to, if any.
    pub fn rwin(&self) -> Option<&Arc<ReorderWindow>> {
        self.rwin.as_ref()
    }

    /// The slot's sequence number.
    pub fn sn(&self) -> u32 {
        self.sn
    }

    /// Whether order lock `index` was already released by the worker.
    pub fn olock_released(&self, index: usize) -> bool {
        self.olock_flags & (1 << index) != 0
    }

    /// Record an explicit order-lock release.
    pub fn mark_olock_released(&mut self, index: usize) {
        self.olock_flags |= 1 << index;
    }

    /// Stash a run of events for `dest`. Returns false when either
    /// stash bound would overflow; the caller then waits for in-order
    /// and enqueues directly.
    pub fn save(&mut self, dest: QueueIndex, events: &[Event]) -> bool {
        if self.n_events + events.len() > STASH_MAX_EVENTS {
            return false;
        }
        let block = StashBlock {
            dest,
            start: self.n_events as u16,
            count: events.len() as u16,
        };
        if self.blocks.push(block).is_err() {
            return false;
        }
        self.events[self.n_events..self.n_events + events.len()].copy_from_slice(events);
        self.n_events += events.len();
        true
    }

    /// Iterate stashed runs in insertion order.
    pub fn stashed(&self) -> impl Iterator<Item = (QueueIndex, &[Event])> {
        self.blocks.iter().map(move |b| {
            let start = b.start as usize;
            let end = start + b.count as usize;
            (b.dest, &self.events[start..end])
        })
    }

    /// Number of stashed events.
    pub fn stash_len(&self) -> usize {
        self.n_events
    }

    /// Drop the stash after it has been replayed, keeping the window
    /// binding (used when a worker flips to in-order early).
    pub fn clear_stash(&mut self) {
        self.blocks.clear();
        self.n_events = 0;
    }

    /// Unbind after retire, making the context reusable.
    pub fn reset(&mut self) {
        self.rwin = None;
        self.olock_flags = 0;
        self.blocks.clear();
        self.n_events = 0;
    }
}

impl Default for ReorderContext {
    fn default() -> Self {
        Self::new()
    }
}
