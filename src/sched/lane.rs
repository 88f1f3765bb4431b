//! Schedule lanes
//!
//! A lane is a FIFO of scheduled queues sharing one (group, priority,
//! spread-slot) coordinate. Workers scan their subscribed lanes in
//! priority order and serve the head queue. Each lane occupies its own
//! cache line.

use crate::sync::{LlNode, LlQueue};
use crate::types::QueueIndex;

/// One schedule lane: queue FIFO plus its priority tag.
#[derive(Debug)]
#[repr(align(64))]
pub struct SchedLane {
    llq: LlQueue,
    prio: u32,
}

impl SchedLane {
    /// Create an empty lane at the given priority.
    pub fn new(prio: u32) -> Self {
        SchedLane {
            llq: LlQueue::new(),
            prio,
        }
    }

    /// The lane's priority (lower value is served first).
    pub fn prio(&self) -> u32 {
        self.prio
    }

    /// Append a queue at the tail.
    pub fn push(&self, nodes: &[LlNode], idx: QueueIndex) {
        self.llq.push(nodes, idx);
    }

    /// Head queue, if any.
    pub fn peek(&self) -> Option<QueueIndex> {
        self.llq.peek()
    }

    /// Remove `idx` only if it is still the head.
    pub fn cond_pop(&self, nodes: &[LlNode], idx: QueueIndex) -> bool {
        self.llq.cond_pop(nodes, idx)
    }

    /// Rotate `idx` to the tail only if it is still the head.
    pub fn cond_rotate(&self, nodes: &[LlNode], idx: QueueIndex) -> bool {
        self.llq.cond_rotate(nodes, idx)
    }

    /// Check emptiness.
    pub fn is_empty(&self) -> bool {
        self.llq.is_empty()
    }
}
