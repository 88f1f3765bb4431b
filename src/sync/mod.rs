//! Low-level concurrency primitives
//!
//! Building blocks for the scheduler hot path: atomic bitsets, the
//! bounded MPMC event ring, and the lane FIFO with conditional
//! pop/rotate. Spin locks and reader/writer locks come from the `spin`
//! crate; everything here blocks only by bounded spinning on atomics.

pub mod bitset;
pub mod llqueue;
pub mod ring;

pub use bitset::{AtomBitset, Bitset};
pub use llqueue::{LlNode, LlQueue, LLQ_NIL};
pub use ring::EventRing;

/// Pad-and-align wrapper keeping a value on its own cache line.
///
/// Producer and consumer metadata of hot structures are separated with
/// this wrapper so that enqueue and dequeue traffic do not false-share.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> core::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> core::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> CacheAligned<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        CacheAligned(value)
    }
}
