//! Per-queue scheduler state and its transition machinery
//!
//! Every queue carries a 64-bit packed state word: the signed event
//! counter, the remaining WRR budget, and the two tickets serializing
//! lane-membership side effects. The whole word moves by CAS, so an
//! empty-to-non-empty transition can never lose its lane push to a
//! racing non-empty-to-empty transition: the side effects execute in
//! ticket order.
//!
//! For atomic queues the ticket pair doubles as the ownership token:
//! `cur_ticket != nxt_ticket` means some worker owns the queue.

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use super::lane::SchedLane;
use crate::sync::LlNode;
use crate::types::QueueIndex;

/// Unpacked view of the packed state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QschState {
    /// Enqueued-but-not-dequeued events. May go transiently negative
    /// under parallel dequeue races; only the sign transition matters.
    pub numevts: i32,
    /// Events this queue may still deliver before yielding its lane
    /// slot.
    pub wrr_budget: u16,
    /// Ticket currently allowed to mutate lane membership.
    pub cur_ticket: u8,
    /// Next ticket to hand out.
    pub nxt_ticket: u8,
}

const BUDGET_SHIFT: u32 = 32;
const CUR_SHIFT: u32 = 48;
const NXT_SHIFT: u32 = 56;

impl QschState {
    fn pack(self) -> u64 {
        (self.numevts as u32 as u64)
            | ((self.wrr_budget as u64) << BUDGET_SHIFT)
            | ((self.cur_ticket as u64) << CUR_SHIFT)
            | ((self.nxt_ticket as u64) << NXT_SHIFT)
    }

    fn unpack(word: u64) -> Self {
        QschState {
            numevts: word as u32 as i32,
            wrr_budget: (word >> BUDGET_SHIFT) as u16,
            cur_ticket: (word >> CUR_SHIFT) as u8,
            nxt_ticket: (word >> NXT_SHIFT) as u8,
        }
    }

    /// Whether an atomic queue is currently owned by a worker.
    pub fn is_owned(&self) -> bool {
        self.cur_ticket != self.nxt_ticket
    }
}

/// The packed, CAS-updated scheduler state of one queue, plus the
/// pop-deficit bookkeeping mutated only by the current ticket holder.
#[derive(Debug)]
pub struct Qschst {
    word: AtomicU64,
    pop_deficit: AtomicU16,
}

impl Qschst {
    /// Fresh state: empty queue, full WRR budget, no tickets out.
    pub fn new(wrr_weight: u16) -> Self {
        let init = QschState {
            numevts: 0,
            wrr_budget: wrr_weight,
            cur_ticket: 0,
            nxt_ticket: 0,
        };
        Qschst {
            word: AtomicU64::new(init.pack()),
            pop_deficit: AtomicU16::new(0),
        }
    }

    /// Snapshot the state word.
    pub fn load(&self, order: Ordering) -> QschState {
        QschState::unpack(self.word.load(order))
    }

    /// Missed pops not yet cancelled or resolved.
    pub fn pop_deficit(&self) -> u16 {
        self.pop_deficit.load(Ordering::Relaxed)
    }

    fn cas_weak(&self, old: QschState, new: QschState) -> Result<(), QschState> {
        self.word
            .compare_exchange_weak(
                old.pack(),
                new.pack(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(QschState::unpack)
    }

    /// Allocate the next ticket. The returned value signals producers
    /// and peers; the caller must spin with [`wait_cur`](Self::wait_cur)
    /// before touching lane membership.
    pub fn take_ticket(&self) -> u8 {
        let old = self.word.fetch_add(1u64 << NXT_SHIFT, Ordering::Relaxed);
        QschState::unpack(old).nxt_ticket
    }

    /// Spin until `ticket` becomes current.
    pub fn wait_cur(&self, ticket: u8) {
        while self.load(Ordering::Acquire).cur_ticket != ticket {
            core::hint::spin_loop();
        }
    }

    /// Pass the ticket chain on, publishing the holder's lane updates.
    pub fn release_cur(&self, ticket: u8) {
        let next = ticket.wrapping_add(1);
        self.word
            .fetch_update(Ordering::Release, Ordering::Relaxed, |w| {
                let mut st = QschState::unpack(w);
                debug_assert_eq!(st.cur_ticket, ticket);
                st.cur_ticket = next;
                Some(st.pack())
            })
            .ok();
    }

    /// Producer-side update: account `n` enqueued events and perform
    /// the empty-to-non-empty lane push when this enqueue caused it.
    ///
    /// Atomic queues take no ticket while owned; the owner re-pushes on
    /// release instead.
    pub fn update_enq(
        &self,
        is_atomic: bool,
        lane: &SchedLane,
        nodes: &[LlNode],
        idx: QueueIndex,
        n: u32,
    ) {
        let mut old = self.load(Ordering::Relaxed);
        let ticket = loop {
            let mut ticket = None;
            let mut new = old;
            new.numevts = old.numevts.wrapping_add(n as i32);
            if old.numevts <= 0 && new.numevts > 0 && (!is_atomic || !old.is_owned()) {
                ticket = Some(new.nxt_ticket);
                new.nxt_ticket = new.nxt_ticket.wrapping_add(1);
            }
            match self.cas_weak(old, new) {
                Ok(()) => break ticket,
                Err(cur) => old = cur,
            }
        };

        if let Some(t) = ticket {
            self.wait_cur(t);
            if !nodes[idx as usize].on_queue() && self.pop_deficit() == 0 {
                lane.push(nodes, idx);
            } else {
                // Missed push cancels one missed pop. The ticket chain
                // guarantees a deficit is pending whenever the queue is
                // still on a lane at an empty-to-non-empty transition.
                debug_assert!(self.pop_deficit() > 0);
                self.pop_deficit.fetch_sub(1, Ordering::Relaxed);
            }
            self.release_cur(t);
        }
    }

    /// Consumer-side update for parallel and ordered queues: account
    /// `n` dequeued events, spend WRR budget, and perform the
    /// non-empty-to-empty pop or the budget-exhausted rotation.
    pub fn update_deq(
        &self,
        n: u32,
        wrr_weight: u16,
        lane: &SchedLane,
        nodes: &[LlNode],
        idx: QueueIndex,
    ) {
        let mut old = self.load(Ordering::Relaxed);
        let ticket = loop {
            let mut ticket = None;
            let mut new = old;
            new.numevts = old.numevts.wrapping_sub(n as i32);
            if (old.numevts > 0 && new.numevts <= 0) || u32::from(old.wrr_budget) <= n {
                // Emptied the queue or exhausted its budget: a lane
                // update is due once our ticket comes up.
                ticket = Some(new.nxt_ticket);
                new.nxt_ticket = new.nxt_ticket.wrapping_add(1);
                new.wrr_budget = wrr_weight;
            } else {
                new.wrr_budget = old.wrr_budget - n as u16;
            }
            match self.cas_weak(old, new) {
                Ok(()) => break ticket,
                Err(cur) => old = cur,
            }
        };

        if let Some(t) = ticket {
            self.wait_cur(t);
            let emptied = old.numevts > 0 && old.numevts.wrapping_sub(n as i32) <= 0;
            if emptied {
                if !nodes[idx as usize].on_queue() || !lane.cond_pop(nodes, idx) {
                    // Queue no longer at the lane head: a peer popped
                    // or rotated it. Record the missed pop.
                    self.pop_deficit.fetch_add(1, Ordering::Relaxed);
                }
            } else if nodes[idx as usize].on_queue() {
                let _ = lane.cond_rotate(nodes, idx);
            }
            self.release_cur(t);
        }
    }

    /// Owner-side release of an atomic queue: account the events the
    /// owner dequeued, push the queue back if it is still non-empty,
    /// and hand the ticket chain on, all in one CAS.
    pub fn update_deq_atomic(
        &self,
        ticket: u8,
        dequeued: u32,
        lane: &SchedLane,
        nodes: &[LlNode],
        idx: QueueIndex,
    ) {
        // Only the owner dequeues, so numevts cannot drop to zero
        // behind our back; a push performed in a failed CAS iteration
        // stays valid and must not repeat.
        let mut pushed = false;
        let mut old = self.load(Ordering::Relaxed);
        loop {
            debug_assert_eq!(old.cur_ticket, ticket);
            debug_assert!(old.is_owned());
            let mut new = old;
            new.numevts = old.numevts.wrapping_sub(dequeued as i32);
            if new.numevts > 0 && !pushed {
                lane.push(nodes, idx);
                pushed = true;
            }
            new.cur_ticket = ticket.wrapping_add(1);
            match self
                .word
                .compare_exchange_weak(
                    old.pack(),
                    new.pack(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .map_err(QschState::unpack)
            {
                Ok(_) => return,
                Err(cur) => old = cur,
            }
        }
    }

    /// Resolve one missed pop, if the queue is at its lane head.
    /// Called by a worker that found the queue empty.
    pub fn update_popd(&self, lane: &SchedLane, nodes: &[LlNode], idx: QueueIndex) {
        let t = self.take_ticket();
        self.wait_cur(t);
        if self.pop_deficit() != 0
            && nodes[idx as usize].on_queue()
            && lane.cond_pop(nodes, idx)
        {
            self.pop_deficit.fetch_sub(1, Ordering::Relaxed);
        }
        self.release_cur(t);
    }

    /// Re-evaluate lane presence for a queue that external code wants
    /// considered again (the `sched_queue` notification): push it if it
    /// holds events but sits on no lane.
    pub fn force_push(&self, lane: &SchedLane, nodes: &[LlNode], idx: QueueIndex) {
        let t = self.take_ticket();
        self.wait_cur(t);
        if self.load(Ordering::Relaxed).numevts > 0
            && !nodes[idx as usize].on_queue()
            && self.pop_deficit() == 0
        {
            lane.push(nodes, idx);
        }
        self.release_cur(t);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node_table(n: usize) -> Vec<LlNode> {
        (0..n).map(|_| LlNode::new()).collect()
    }

    #[test]
    fn test_enq_pushes_once() {
        let nodes = node_table(2);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);

        st.update_enq(false, &lane, &nodes, 0, 4);
        assert_eq!(lane.peek(), Some(0));
        assert_eq!(st.load(Ordering::Relaxed).numevts, 4);

        // Already non-empty: no second push, no new ticket
        st.update_enq(false, &lane, &nodes, 0, 4);
        let s = st.load(Ordering::Relaxed);
        assert_eq!(s.numevts, 8);
        assert_eq!(s.cur_ticket, s.nxt_ticket);
        assert_eq!(s.cur_ticket, 1);
    }

    #[test]
    fn test_deq_pop_on_empty() {
        let nodes = node_table(2);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);

        st.update_enq(false, &lane, &nodes, 0, 8);
        st.update_deq(8, 64, &lane, &nodes, 0);
        assert_eq!(lane.peek(), None);
        assert!(!nodes[0].on_queue());
        assert_eq!(st.load(Ordering::Relaxed).numevts, 0);
        assert_eq!(st.pop_deficit(), 0);
    }

    #[test]
    fn test_wrr_rotation() {
        let nodes = node_table(2);
        let lane = SchedLane::new(0);
        let weight = 8u16;
        let a = Qschst::new(weight);
        let b = Qschst::new(weight);

        a.update_enq(false, &lane, &nodes, 0, 100);
        b.update_enq(false, &lane, &nodes, 1, 100);
        assert_eq!(lane.peek(), Some(0));

        // Budget lasts for weight events, then the queue rotates
        a.update_deq(u32::from(weight), weight, &lane, &nodes, 0);
        assert_eq!(lane.peek(), Some(1));
        assert_eq!(a.load(Ordering::Relaxed).wrr_budget, weight);
    }

    #[test]
    fn test_missed_pop_then_cancelled() {
        let nodes = node_table(2);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);

        st.update_enq(false, &lane, &nodes, 0, 1);
        // Rotate the queue away so the pop misses
        let other = Qschst::new(64);
        other.update_enq(false, &lane, &nodes, 1, 1);
        assert!(lane.cond_rotate(&nodes, 0));
        assert_eq!(lane.peek(), Some(1));

        st.update_deq(1, 64, &lane, &nodes, 0);
        assert_eq!(st.pop_deficit(), 1);
        assert!(nodes[0].on_queue());

        // The next empty-to-non-empty transition cancels the deficit
        // instead of double-pushing
        st.update_enq(false, &lane, &nodes, 0, 1);
        assert_eq!(st.pop_deficit(), 0);
        assert!(nodes[0].on_queue());
    }

    #[test]
    fn test_atomic_ownership_tickets() {
        let nodes = node_table(1);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);

        st.update_enq(true, &lane, &nodes, 0, 10);
        assert_eq!(lane.peek(), Some(0));

        // Worker acquires: pops the lane, takes a ticket
        assert!(lane.cond_pop(&nodes, 0));
        let t = st.take_ticket();
        st.wait_cur(t);
        assert!(st.load(Ordering::Relaxed).is_owned());

        // Producer enqueue on a non-empty owned queue: no ticket
        st.update_enq(true, &lane, &nodes, 0, 5);
        assert_eq!(st.load(Ordering::Relaxed).nxt_ticket, t.wrapping_add(1));

        // Owner releases having dequeued 10: 5 remain, queue re-pushed
        st.update_deq_atomic(t, 10, &lane, &nodes, 0);
        let s = st.load(Ordering::Relaxed);
        assert!(!s.is_owned());
        assert_eq!(s.numevts, 5);
        assert_eq!(lane.peek(), Some(0));
    }

    #[test]
    fn test_atomic_release_overshoot() {
        // A release may account more events than numevts shows when a
        // producer's ring publish preceded its counter update; the
        // counter goes transiently negative and the late counter update
        // restores it, pushing the queue again.
        let nodes = node_table(1);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);

        st.update_enq(true, &lane, &nodes, 0, 10);
        assert!(lane.cond_pop(&nodes, 0));
        let t = st.take_ticket();
        st.wait_cur(t);

        // Owner saw 12 events in the ring (two not yet counted)
        st.update_deq_atomic(t, 12, &lane, &nodes, 0);
        let s = st.load(Ordering::Relaxed);
        assert!(!s.is_owned());
        assert_eq!(s.numevts, -2);
        assert_eq!(lane.peek(), None);

        // The late producer update restores the balance and re-pushes
        st.update_enq(true, &lane, &nodes, 0, 2);
        assert_eq!(st.load(Ordering::Relaxed).numevts, 0);
        assert_eq!(lane.peek(), None);
        st.update_enq(true, &lane, &nodes, 0, 1);
        assert_eq!(st.load(Ordering::Relaxed).numevts, 1);
        assert_eq!(lane.peek(), Some(0));
    }

    #[test]
    fn test_popd_resolves_deficit() {
        let nodes = node_table(2);
        let lane = SchedLane::new(0);
        let st = Qschst::new(64);
        let other = Qschst::new(64);

        st.update_enq(false, &lane, &nodes, 0, 1);
        other.update_enq(false, &lane, &nodes, 1, 1);
        assert!(lane.cond_rotate(&nodes, 0));
        st.update_deq(1, 64, &lane, &nodes, 0);
        assert_eq!(st.pop_deficit(), 1);

        // Drain the peer so our queue reaches the head again
        assert!(lane.cond_pop(&nodes, 1));
        assert_eq!(lane.peek(), Some(0));

        st.update_popd(&lane, &nodes, 0);
        assert_eq!(st.pop_deficit(), 0);
        assert!(!nodes[0].on_queue());
    }

    proptest! {
        #[test]
        fn prop_pack_unpack_roundtrip(numevts in any::<i32>(),
                                      wrr_budget in any::<u16>(),
                                      cur_ticket in any::<u8>(),
                                      nxt_ticket in any::<u8>()) {
            let st = QschState { numevts, wrr_budget, cur_ticket, nxt_ticket };
            prop_assert_eq!(QschState::unpack(st.pack()), st);
        }

        #[test]
        fn prop_enq_deq_numevts_balance(ops in proptest::collection::vec(1u32..16, 1..50)) {
            let nodes = node_table(1);
            let lane = SchedLane::new(0);
            let st = Qschst::new(64);
            let mut expected = 0i32;
            for (i, n) in ops.iter().enumerate() {
                if i % 2 == 0 {
                    st.update_enq(false, &lane, &nodes, 0, *n);
                    expected += *n as i32;
                } else {
                    let take = (*n).min(expected.max(0) as u32);
                    if take > 0 {
                        st.update_deq(take, 64, &lane, &nodes, 0);
                        expected -= take as i32;
                    }
                }
            }
            prop_assert_eq!(st.load(Ordering::Relaxed).numevts, expected);
            // Ticket chain fully drained
            let s = st.load(Ordering::Relaxed);
            prop_assert_eq!(s.cur_ticket, s.nxt_ticket);
        }
    }
}
