//! Lane FIFO of queue indices
//!
//! Each schedule lane is a FIFO of queues linked through a shared node
//! table (one node per queue index, a queue is on at most one lane at
//! a time). Besides plain push and peek, the lane supports the two
//! conditional operations the scheduler state machine needs:
//!
//! - `cond_pop(q)`: remove `q` only if it is still the head;
//! - `cond_rotate(q)`: move `q` from head to tail only if it is still
//!   the head.
//!
//! The list is protected by a short spin-held critical section; the
//! `on_queue` flag is additionally readable without the lock (racy
//! reads are re-validated by the conditional operations).

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

/// Sentinel link value meaning "no node".
pub const LLQ_NIL: u32 = u32::MAX;

/// Per-queue link state. Lives in a dense table indexed by queue index
/// and is mutated only under the owning lane's lock.
#[derive(Debug)]
pub struct LlNode {
    next: AtomicU32,
    on_queue: AtomicBool,
}

impl LlNode {
    /// Create an unlinked node.
    pub fn new() -> Self {
        LlNode {
            next: AtomicU32::new(LLQ_NIL),
            on_queue: AtomicBool::new(false),
        }
    }

    /// Racy membership check. A false positive or negative is always
    /// re-validated by `cond_pop`/`cond_rotate` under the lane lock.
    pub fn on_queue(&self) -> bool {
        self.on_queue.load(Ordering::Relaxed)
    }
}

impl Default for LlNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LlInner {
    head: u32,
    tail: u32,
}

/// FIFO of queue indices linked through an external node table.
#[derive(Debug)]
pub struct LlQueue {
    inner: Mutex<LlInner>,
}

impl LlQueue {
    /// Create an empty lane list.
    pub fn new() -> Self {
        LlQueue {
            inner: Mutex::new(LlInner {
                head: LLQ_NIL,
                tail: LLQ_NIL,
            }),
        }
    }

    /// Append `idx` at the tail. The caller must hold the push right
    /// for `idx` (the ticket chain guarantees a queue is pushed at most
    /// once per empty-to-non-empty transition).
    pub fn push(&self, nodes: &[LlNode], idx: u32) {
        let mut q = self.inner.lock();
        let node = &nodes[idx as usize];
        debug_assert!(!node.on_queue.load(Ordering::Relaxed));
        node.next.store(LLQ_NIL, Ordering::Relaxed);
        if q.tail == LLQ_NIL {
            q.head = idx;
        } else {
            nodes[q.tail as usize].next.store(idx, Ordering::Relaxed);
        }
        q.tail = idx;
        node.on_queue.store(true, Ordering::Relaxed);
    }

    /// Current head index, if any.
    pub fn peek(&self) -> Option<u32> {
        let q = self.inner.lock();
        if q.head == LLQ_NIL {
            None
        } else {
            Some(q.head)
        }
    }

    /// Remove `idx` if it is still the head. Returns whether the pop
    /// happened.
    pub fn cond_pop(&self, nodes: &[LlNode], idx: u32) -> bool {
        let mut q = self.inner.lock();
        if q.head != idx {
            return false;
        }
        let node = &nodes[idx as usize];
        q.head = node.next.load(Ordering::Relaxed);
        if q.head == LLQ_NIL {
            q.tail = LLQ_NIL;
        }
        node.next.store(LLQ_NIL, Ordering::Relaxed);
        node.on_queue.store(false, Ordering::Relaxed);
        true
    }

    /// Move `idx` to the tail if it is still the head. Returns whether
    /// the element was the head (a single-element lane counts as a
    /// successful rotation).
    pub fn cond_rotate(&self, nodes: &[LlNode], idx: u32) -> bool {
        let mut q = self.inner.lock();
        if q.head != idx {
            return false;
        }
        let node = &nodes[idx as usize];
        let next = node.next.load(Ordering::Relaxed);
        if next == LLQ_NIL {
            // Alone on the lane: rotation is a no-op.
            return true;
        }
        q.head = next;
        node.next.store(LLQ_NIL, Ordering::Relaxed);
        nodes[q.tail as usize].next.store(idx, Ordering::Relaxed);
        q.tail = idx;
        true
    }

    /// Check emptiness.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().head == LLQ_NIL
    }
}

impl Default for LlQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_table(n: usize) -> Vec<LlNode> {
        (0..n).map(|_| LlNode::new()).collect()
    }

    #[test]
    fn test_push_peek_pop() {
        let nodes = node_table(4);
        let llq = LlQueue::new();
        assert!(llq.is_empty());
        assert_eq!(llq.peek(), None);

        llq.push(&nodes, 2);
        llq.push(&nodes, 0);
        assert_eq!(llq.peek(), Some(2));
        assert!(nodes[2].on_queue());
        assert!(nodes[0].on_queue());

        // Pop of a non-head element must fail
        assert!(!llq.cond_pop(&nodes, 0));
        assert!(llq.cond_pop(&nodes, 2));
        assert!(!nodes[2].on_queue());
        assert_eq!(llq.peek(), Some(0));
        assert!(llq.cond_pop(&nodes, 0));
        assert!(llq.is_empty());
    }

    #[test]
    fn test_rotate() {
        let nodes = node_table(4);
        let llq = LlQueue::new();
        llq.push(&nodes, 1);
        llq.push(&nodes, 2);
        llq.push(&nodes, 3);

        assert!(llq.cond_rotate(&nodes, 1));
        assert_eq!(llq.peek(), Some(2));
        assert!(!llq.cond_rotate(&nodes, 1));

        assert!(llq.cond_pop(&nodes, 2));
        assert!(llq.cond_pop(&nodes, 3));
        assert_eq!(llq.peek(), Some(1));

        // Single element: rotation succeeds and keeps it at head
        assert!(llq.cond_rotate(&nodes, 1));
        assert_eq!(llq.peek(), Some(1));
    }
}
