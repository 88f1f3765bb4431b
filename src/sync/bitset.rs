//! Word-array bitsets with atomic per-bit updates
//!
//! Group masks span multiple 64-bit words (256 groups); thread masks
//! fit in one. Per-bit set/clear are single-word atomic RMWs, loads
//! read word by word. Cross-word snapshots are not atomic as a whole;
//! the membership fabric only relies on per-bit atomicity plus the
//! `sg_sem` release/acquire handshake.

use core::sync::atomic::{AtomicU64, Ordering};

/// Plain value bitset over `W` 64-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitset<const W: usize>(pub [u64; W]);

impl<const W: usize> Bitset<W> {
    /// The empty set.
    pub const fn null() -> Self {
        Bitset([0; W])
    }

    /// Number of bits the set can hold.
    pub const fn capacity() -> usize {
        W * 64
    }

    /// Check whether no bit is set.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Set a bit.
    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < Self::capacity());
        self.0[bit / 64] |= 1u64 << (bit % 64);
    }

    /// Clear a bit.
    pub fn clr(&mut self, bit: usize) {
        debug_assert!(bit < Self::capacity());
        self.0[bit / 64] &= !(1u64 << (bit % 64));
    }

    /// Check a bit.
    pub fn is_set(&self, bit: usize) -> bool {
        debug_assert!(bit < Self::capacity());
        self.0[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Find the lowest set bit, if any.
    pub fn ffs(&self) -> Option<usize> {
        for (i, w) in self.0.iter().enumerate() {
            if *w != 0 {
                return Some(i * 64 + w.trailing_zeros() as usize);
            }
        }
        None
    }

    /// Bits set in `self` but not in `other`.
    pub fn andn(&self, other: &Bitset<W>) -> Bitset<W> {
        let mut out = [0u64; W];
        for i in 0..W {
            out[i] = self.0[i] & !other.0[i];
        }
        Bitset(out)
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterate set bits, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cur = *self;
        core::iter::from_fn(move || {
            let bit = cur.ffs()?;
            cur.clr(bit);
            Some(bit)
        })
    }
}

/// Bitset with atomic per-bit updates.
#[derive(Debug)]
pub struct AtomBitset<const W: usize>([AtomicU64; W]);

impl<const W: usize> AtomBitset<W> {
    /// Create an empty set.
    pub fn new() -> Self {
        AtomBitset(core::array::from_fn(|_| AtomicU64::new(0)))
    }

    /// Atomically set a bit.
    pub fn set(&self, bit: usize, order: Ordering) {
        debug_assert!(bit < W * 64);
        self.0[bit / 64].fetch_or(1u64 << (bit % 64), order);
    }

    /// Atomically clear a bit.
    pub fn clr(&self, bit: usize, order: Ordering) {
        debug_assert!(bit < W * 64);
        self.0[bit / 64].fetch_and(!(1u64 << (bit % 64)), order);
    }

    /// Read a single bit.
    pub fn is_set(&self, bit: usize, order: Ordering) -> bool {
        debug_assert!(bit < W * 64);
        self.0[bit / 64].load(order) & (1u64 << (bit % 64)) != 0
    }

    /// Snapshot the set word by word.
    ///
    /// Not a single atomic operation across words; callers that need a
    /// consistent view serialize on an outer lock or handshake.
    pub fn load(&self, order: Ordering) -> Bitset<W> {
        let mut out = [0u64; W];
        for i in 0..W {
            out[i] = self.0[i].load(order);
        }
        Bitset(out)
    }

    /// Overwrite the set word by word.
    pub fn store(&self, value: Bitset<W>, order: Ordering) {
        for i in 0..W {
            self.0[i].store(value.0[i], order);
        }
    }
}

impl<const W: usize> Default for AtomBitset<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_clr_ffs() {
        let mut bs: Bitset<4> = Bitset::null();
        assert!(bs.is_null());
        assert_eq!(bs.ffs(), None);

        bs.set(3);
        bs.set(130);
        assert_eq!(bs.ffs(), Some(3));
        assert!(bs.is_set(130));

        bs.clr(3);
        assert_eq!(bs.ffs(), Some(130));
        bs.clr(130);
        assert!(bs.is_null());
    }

    #[test]
    fn test_andn_diff() {
        let mut wanted: Bitset<4> = Bitset::null();
        let mut actual: Bitset<4> = Bitset::null();
        wanted.set(1);
        wanted.set(70);
        actual.set(70);
        actual.set(200);

        let added = wanted.andn(&actual);
        let removed = actual.andn(&wanted);
        assert_eq!(added.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(removed.iter().collect::<Vec<_>>(), vec![200]);
    }

    #[test]
    fn test_atomic_bits() {
        let bs: AtomBitset<4> = AtomBitset::new();
        bs.set(77, Ordering::Relaxed);
        bs.set(0, Ordering::Release);
        assert!(bs.is_set(77, Ordering::Relaxed));
        let snap = bs.load(Ordering::Acquire);
        assert_eq!(snap.count(), 2);
        bs.clr(77, Ordering::Relaxed);
        assert!(!bs.is_set(77, Ordering::Relaxed));
    }

    proptest! {
        #[test]
        fn prop_set_then_ffs_finds_min(bits in proptest::collection::btree_set(0usize..256, 1..20)) {
            let mut bs: Bitset<4> = Bitset::null();
            for &b in &bits {
                bs.set(b);
            }
            prop_assert_eq!(bs.ffs(), bits.iter().next().copied());
            prop_assert_eq!(bs.count() as usize, bits.len());
            prop_assert_eq!(bs.iter().collect::<Vec<_>>(), bits.iter().copied().collect::<Vec<_>>());
        }
    }
}
