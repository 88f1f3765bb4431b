//! Scheduler core
//!
//! Process-wide scheduling state lives in one [`Scheduler`] owner;
//! each participating thread attaches and receives a [`Worker`] handle
//! that runs the schedule loop. A schedule pass walks the worker's
//! subscribed lanes in priority order, dispatches the head queue by
//! its synchronization discipline, and falls back to opportunistic
//! external input polling when no lane yields work.
//!
//! Worker handles are explicit: every hot-path operation, including
//! the ordered-lock API, goes through the handle rather than
//! thread-local state.

pub mod group;
pub mod lane;
pub mod qschst;
pub mod thread;

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{SchedConfig, MAX_ORDERED_LOCKS, NUM_PRIO};
use crate::error::{SchedError, SchedResult};
use crate::pktin::{PktinPoller, PktinRegistry};
use crate::queue::{QueueInfo, QueueParams, QueueTable};
use crate::reorder::{ReorderContext, TS_RVEC_SIZE};
use crate::sync::Bitset;
use crate::types::{Event, GroupId, QueueIndex, SyncMode, ThrMask, ThreadIndex, ThreadType};

use group::{GroupInfo, GroupTable, GROUP_ALL, GROUP_CONTROL, GROUP_WORKER};
use thread::{insert_lane, remove_lane, LaneList, LaneRef, ThreadTable};

/// How long `schedule` keeps looking for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Single pass; may return nothing.
    NoWait,
    /// Spin until work appears.
    Forever,
    /// Spin until work appears or the given nanoseconds elapse.
    Ns(u64),
}

impl WaitMode {
    /// Alias for [`WaitMode::NoWait`].
    pub const NO_WAIT: WaitMode = WaitMode::NoWait;
    /// Alias for [`WaitMode::Forever`].
    pub const FOREVER: WaitMode = WaitMode::Forever;
}

/// Convert a nanosecond budget into a wait token.
pub fn wait_time_ns(ns: u64) -> WaitMode {
    WaitMode::Ns(ns)
}

/// Scheduler statistics, updated with relaxed counters off the
/// critical path.
#[derive(Debug, Default)]
pub struct SchedStats {
    schedule_calls: AtomicU64,
    empty_passes: AtomicU64,
    events_dispatched: AtomicU64,
    pktin_polls: AtomicU64,
}

/// Point-in-time copy of the statistics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub schedule_calls: u64,
    pub empty_passes: u64,
    pub events_dispatched: u64,
    pub pktin_polls: u64,
}

/// The process-wide scheduler.
///
/// Lifecycle: construct once, attach every participating thread,
/// schedule, detach, drop. Dropping destroys the default groups.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedConfig,
    queues: QueueTable,
    groups: GroupTable,
    threads: ThreadTable,
    pktin: PktinRegistry,
    stats: SchedStats,
}

impl Scheduler {
    /// Create a scheduler with the given configuration and the three
    /// default groups (ALL, WORKER, CONTROL).
    pub fn new(config: SchedConfig) -> SchedResult<Arc<Self>> {
        config.validate()?;
        let groups = GroupTable::new(config.priority_count, config.default_xfactor);
        let threads = ThreadTable::new();

        for (name, expect) in [
            ("__group_all", GROUP_ALL),
            ("__group_worker", GROUP_WORKER),
            ("__group_control", GROUP_CONTROL),
        ] {
            let gid = groups.create(&threads, name, ThrMask::zero())?;
            if gid != expect {
                return Err(SchedError::MisSequence("default group id mismatch"));
            }
        }

        log::info!(
            "scheduler up: {} priorities, wrr weight {}, burst {}",
            config.priority_count,
            config.wrr_weight,
            config.burst_size
        );
        Ok(Arc::new(Scheduler {
            config,
            queues: QueueTable::new(),
            groups,
            threads,
            pktin: PktinRegistry::new(),
            stats: SchedStats::default(),
        }))
    }

    /// Create a scheduler with default configuration.
    pub fn with_defaults() -> SchedResult<Arc<Self>> {
        Self::new(SchedConfig::default())
    }

    /// The active configuration.
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Number of priority levels.
    pub fn num_prio(&self) -> u32 {
        self.config.priority_count
    }

    /// Maximum named order locks per ordered queue.
    pub fn max_ordered_locks(&self) -> u32 {
        MAX_ORDERED_LOCKS as u32
    }

    /// Advisory prefetch hint. No-op in this implementation.
    pub fn prefetch(&self, _num: u32) {}

    /// Snapshot the statistics counters.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            schedule_calls: self.stats.schedule_calls.load(Ordering::Relaxed),
            empty_passes: self.stats.empty_passes.load(Ordering::Relaxed),
            events_dispatched: self.stats.events_dispatched.load(Ordering::Relaxed),
            pktin_polls: self.stats.pktin_polls.load(Ordering::Relaxed),
        }
    }

    // --- queue lifecycle -------------------------------------------------

    /// Create a queue.
    pub fn queue_create(&self, params: &QueueParams) -> SchedResult<QueueIndex> {
        self.queues
            .create(&self.config, &self.groups, &self.threads, params)
    }

    /// Destroy a queue. Refused while the queue holds events or state.
    pub fn queue_destroy(&self, idx: QueueIndex) -> SchedResult<()> {
        self.queues.destroy(&self.groups, &self.threads, idx)
    }

    /// Attributes of a queue, including its application context.
    pub fn queue_info(&self, idx: QueueIndex) -> SchedResult<QueueInfo> {
        self.queues
            .with_queue(idx, |q| QueueInfo {
                sync: q.sync,
                prio: q.prio,
                group: q.group,
                ctx: q.ctx,
            })
            .ok_or(SchedError::InvalidQueue(idx))
    }

    /// Producer enqueue. Returns the number of events accepted (0 when
    /// the ring is full) and notifies the scheduler of an
    /// empty-to-non-empty transition.
    ///
    /// Workers processing an ordered queue should enqueue through
    /// [`Worker::enqueue`] instead, which defers out-of-order output.
    pub fn enqueue(&self, dest: QueueIndex, events: &[Event]) -> SchedResult<usize> {
        self.queues
            .with_queue(dest, |q| {
                let n = q.ring.enqueue(events);
                if n > 0 && q.sync.is_some() {
                    q.qschst.update_enq(
                        q.is_atomic(),
                        q.sched_lane(),
                        self.queues.nodes(),
                        dest,
                        n as u32,
                    );
                }
                n
            })
            .ok_or(SchedError::InvalidQueue(dest))
    }

    /// Drain a plain (unscheduled) queue. Scheduled queues are drained
    /// exclusively through `schedule`.
    pub fn queue_deq(&self, idx: QueueIndex, out: &mut [Event]) -> SchedResult<usize> {
        self.queues
            .with_queue(idx, |q| {
                if q.sync.is_some() {
                    Err(SchedError::MisSequence(
                        "scheduled queues drain via schedule",
                    ))
                } else {
                    Ok(q.ring.dequeue(out))
                }
            })
            .ok_or(SchedError::InvalidQueue(idx))?
    }

    /// Re-enable a queue for scheduling and push it onto its lane if it
    /// holds events.
    pub fn sched_queue(&self, idx: QueueIndex) -> SchedResult<()> {
        self.queues
            .with_queue(idx, |q| {
                if q.sync.is_some() {
                    q.enabled.store(true, Ordering::Release);
                    q.qschst
                        .force_push(q.sched_lane(), self.queues.nodes(), idx);
                }
            })
            .ok_or(SchedError::InvalidQueue(idx))
    }

    /// Stop considering a queue for scheduling. Workers drop it from
    /// its lane on sight; pending events stay in the ring.
    pub fn unsched_queue(&self, idx: QueueIndex) -> SchedResult<()> {
        self.queues
            .with_queue(idx, |q| q.enabled.store(false, Ordering::Release))
            .ok_or(SchedError::InvalidQueue(idx))
    }

    // --- group API -------------------------------------------------------

    /// Create a schedule group.
    pub fn group_create(&self, name: &str, mask: ThrMask) -> SchedResult<GroupId> {
        self.groups.create(&self.threads, name, mask)
    }

    /// Destroy a schedule group (must hold no queues or threads).
    pub fn group_destroy(&self, gid: GroupId) -> SchedResult<()> {
        self.groups.destroy(gid)
    }

    /// Find a group by name.
    pub fn group_lookup(&self, name: &str) -> SchedResult<GroupId> {
        self.groups.lookup(name)
    }

    /// Add threads to a group.
    pub fn group_join(&self, gid: GroupId, mask: ThrMask) -> SchedResult<()> {
        self.groups.join(&self.threads, gid, mask)
    }

    /// Remove threads from a group.
    pub fn group_leave(&self, gid: GroupId, mask: ThrMask) -> SchedResult<()> {
        self.groups.leave(&self.threads, gid, mask)
    }

    /// Wanted thread membership of a group.
    pub fn group_thrmask(&self, gid: GroupId) -> SchedResult<ThrMask> {
        self.groups.thrmask(gid)
    }

    /// Name and membership of a group.
    pub fn group_info(&self, gid: GroupId) -> SchedResult<GroupInfo> {
        self.groups.info(gid)
    }

    // --- external input polling -----------------------------------------

    /// Install the external input poll callback.
    pub fn set_pktin_poller(&self, poller: Arc<dyn PktinPoller>) {
        self.pktin.set_poller(poller);
    }

    /// Register the input queues of an interface for worker polling.
    pub fn pktio_start(&self, iface: u32, queues: &[u32]) -> SchedResult<()> {
        self.pktin.start(iface, queues)
    }

    /// Remove one (interface, queue) registration. Returns the number
    /// of registrations the interface still has; the caller finalizes
    /// the interface stop when that reaches zero.
    pub fn pktio_stop(&self, iface: u32, queue: u32) -> SchedResult<u16> {
        self.pktin.stop(iface, queue)
    }

    // --- thread attach ---------------------------------------------------

    /// Attach the calling thread, joining the default groups for its
    /// type. The returned handle runs the schedule loop.
    pub fn thread_attach(self: &Arc<Self>, ttype: ThreadType) -> SchedResult<Worker> {
        let tidx = self.threads.attach()?;
        let mask = ThrMask::single(tidx);

        if let Err(e) = self.groups.join(&self.threads, GROUP_ALL, mask) {
            self.threads.detach(tidx);
            return Err(e);
        }
        let type_group = match ttype {
            ThreadType::Worker => GROUP_WORKER,
            ThreadType::Control => GROUP_CONTROL,
        };
        if let Err(e) = self.groups.join(&self.threads, type_group, mask) {
            let _ = self.groups.leave(&self.threads, GROUP_ALL, mask);
            self.threads.detach(tidx);
            return Err(e);
        }

        Ok(Worker {
            sched: Arc::clone(self),
            tidx,
            ttype,
            pause: false,
            detached: false,
            atomq: None,
            ticket: 0,
            dequeued: 0,
            rctx: None,
            out_of_order: false,
            rvec_free: ((1u32 << TS_RVEC_SIZE) - 1) as u16,
            rvec: (0..TS_RVEC_SIZE)
                .map(|_| ReorderContext::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            lanes: LaneList::new(),
            sg_actual: [Bitset::null(); NUM_PRIO],
            pktin_next: 0,
            pktin_poll_cnts: 0,
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for gid in [GROUP_CONTROL, GROUP_WORKER, GROUP_ALL] {
            if let Err(e) = self.groups.destroy(gid) {
                log::error!("failed to destroy default group {gid}: {e}");
            }
        }
    }
}

/// Outcome of dispatching one lane-head queue.
enum Dispatch {
    /// Events delivered to the caller.
    Events(usize),
    /// An atomic queue was acquired; restart the pass to dequeue it.
    Acquired,
    /// Lane head changed or queue vanished; peek the same lane again.
    Retry,
    /// Nothing here; move to the next lane.
    Next,
}

/// Per-thread scheduler handle.
///
/// Obtained from [`Scheduler::thread_attach`]; drop (or call
/// [`Worker::detach`]) to leave the default groups again.
#[derive(Debug)]
pub struct Worker {
    sched: Arc<Scheduler>,
    tidx: ThreadIndex,
    ttype: ThreadType,
    pause: bool,
    detached: bool,
    /// Atomic queue currently owned, with the ticket that encodes the
    /// ownership and the events dequeued since acquisition.
    atomq: Option<QueueIndex>,
    ticket: u8,
    dequeued: u32,
    /// Current reorder context (index into `rvec`).
    rctx: Option<usize>,
    out_of_order: bool,
    /// Bit per free entry of `rvec`.
    rvec_free: u16,
    rvec: Box<[ReorderContext]>,
    /// Subscribed lanes, sorted by priority.
    lanes: LaneList,
    /// Folded group membership per priority.
    sg_actual: [Bitset<4>; NUM_PRIO],
    pktin_next: u32,
    pktin_poll_cnts: u32,
}

impl Worker {
    /// This worker's thread index.
    pub fn thread_index(&self) -> ThreadIndex {
        self.tidx
    }

    /// Schedule one event.
    pub fn schedule(&mut self, wait: WaitMode) -> Option<(QueueIndex, Event)> {
        let mut out = [Event::NULL; 1];
        match self.schedule_multi(wait, &mut out) {
            (Some(src), 1) => Some((src, out[0])),
            _ => None,
        }
    }

    /// Schedule a batch. All returned events come from one source
    /// queue; at most `min(out.len(), burst_size)` are delivered.
    pub fn schedule_multi(
        &mut self,
        wait: WaitMode,
        out: &mut [Event],
    ) -> (Option<QueueIndex>, usize) {
        self.sched
            .stats
            .schedule_calls
            .fetch_add(1, Ordering::Relaxed);

        if self.pause {
            // A paused worker sheds everything it holds and reports
            // empty until resumed.
            self.release_held();
            return (None, 0);
        }
        if out.is_empty() {
            return (None, 0);
        }

        match wait {
            WaitMode::NoWait => self.schedule_pass(out),
            WaitMode::Forever => loop {
                let r = self.schedule_pass(out);
                if r.1 > 0 {
                    return r;
                }
            },
            WaitMode::Ns(ns) => {
                let r = self.schedule_pass(out);
                if r.1 > 0 {
                    return r;
                }
                let deadline = Instant::now() + Duration::from_nanos(ns);
                loop {
                    let r = self.schedule_pass(out);
                    if r.1 > 0 {
                        return r;
                    }
                    if Instant::now() >= deadline {
                        return (None, 0);
                    }
                }
            }
        }
    }

    /// Stop scheduling: the next `schedule` releases held state and
    /// returns empty until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        self.pause = true;
    }

    /// Resume scheduling after a pause.
    pub fn resume(&mut self) {
        self.pause = false;
    }

    /// Give up the atomic queue held from the last `schedule` call
    /// before the next one.
    pub fn release_atomic(&mut self) {
        self.release_atomic_inner();
    }

    /// Retire the ordered slot held from the last `schedule` call
    /// before the next one: waits until in-order, advances untouched
    /// order locks, replays the stash, advances the window head.
    pub fn release_ordered(&mut self) {
        if self.rctx.is_some() {
            self.release_ordered_inner();
        }
    }

    /// Enqueue from this worker. While the worker processes an ordered
    /// queue out-of-order, output to deferrable destinations is stashed
    /// and replayed in slot order at release; non-deferrable
    /// destinations force an in-order wait first.
    pub fn enqueue(&mut self, dest: QueueIndex, events: &[Event]) -> SchedResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        if self.rctx.is_some() && self.out_of_order {
            let deferrable = self
                .sched
                .queues
                .with_queue(dest, |q| q.deferrable)
                .ok_or(SchedError::InvalidQueue(dest))?;
            if deferrable {
                let ci = self.rctx.unwrap();
                if self.rvec[ci].save(dest, events) {
                    return Ok(events.len());
                }
                // Stash full: flip to in-order and enqueue directly.
            }
            self.go_in_order();
        }
        self.sched.enqueue(dest, events)
    }

    // --- named order locks ----------------------------------------------

    /// Enter the named sub-order `index`: blocks until every earlier
    /// slot has passed the lock.
    pub fn order_lock(&mut self, index: usize) {
        let Some((sn, rwin)) = self.held_rwin(index, "order_lock") else {
            return;
        };
        if self.rvec[self.rctx.unwrap()].olock_released(index) {
            log::error!("order_lock({index}) after order_unlock in the same slot");
            return;
        }
        rwin.olock_wait(index, sn);
    }

    /// Leave the named sub-order `index`, passing it to the next slot.
    pub fn order_unlock(&mut self, index: usize) {
        let Some((sn, rwin)) = self.held_rwin(index, "order_unlock") else {
            return;
        };
        let ci = self.rctx.unwrap();
        if rwin.olock_value(index) != sn || self.rvec[ci].olock_released(index) {
            log::error!("order_unlock({index}) without a matching order_lock");
            return;
        }
        rwin.olock_release(index, sn);
        self.rvec[ci].mark_olock_released(index);
    }

    /// Atomically leave sub-order `unlock` and enter sub-order `lock`.
    pub fn order_unlock_lock(&mut self, unlock: usize, lock: usize) {
        self.order_unlock(unlock);
        self.order_lock(lock);
    }

    /// Advisory start-of-critical-section hint. No-op.
    pub fn order_lock_start(&mut self, _index: usize) {}

    /// Wait for the named sub-order previously announced with
    /// [`order_lock_start`](Self::order_lock_start).
    pub fn order_lock_wait(&mut self, index: usize) {
        self.order_lock(index);
    }

    /// Detach from the scheduler, leaving the default groups. Fails if
    /// the thread still subscribes to lanes of other groups.
    pub fn detach(mut self) -> SchedResult<()> {
        self.do_detach()
    }

    // --- internals -------------------------------------------------------

    fn release_held(&mut self) {
        self.release_atomic_inner();
        if self.rctx.is_some() {
            self.release_ordered_inner();
        }
    }

    fn release_atomic_inner(&mut self) {
        let Some(aq) = self.atomq.take() else { return };
        let sched = Arc::clone(&self.sched);
        let ticket = self.ticket;
        let dequeued = self.dequeued;
        sched.queues.with_queue(aq, |q| {
            q.qschst.update_deq_atomic(
                ticket,
                dequeued,
                q.sched_lane(),
                sched.queues.nodes(),
                aq,
            );
        });
        self.dequeued = 0;
    }

    fn release_ordered_inner(&mut self) {
        let ci = self.rctx.take().expect("ordered release without context");
        self.out_of_order = false;

        let sched = Arc::clone(&self.sched);
        if let Some(rwin) = self.rvec[ci].rwin().cloned() {
            let sn = self.rvec[ci].sn();
            rwin.wait_head(sn);
            for i in 0..rwin.lock_count() as usize {
                if !self.rvec[ci].olock_released(i) {
                    rwin.olock_release(i, sn);
                }
            }
            for (dest, events) in self.rvec[ci].stashed() {
                let accepted = sched.enqueue(dest, events).unwrap_or(0);
                if accepted < events.len() {
                    // Destination vanished or overflowed; the surplus
                    // is dropped like any enqueue on a full ring.
                    log::warn!(
                        "dropped {} stashed events for queue {dest}",
                        events.len() - accepted
                    );
                }
            }
            rwin.advance_head(sn);
        }

        self.rvec[ci].reset();
        self.rvec_free |= 1 << ci;
    }

    /// Flip an out-of-order worker to in-order: wait for the window
    /// head, then replay the stash so later direct enqueues stay behind
    /// it.
    fn go_in_order(&mut self) {
        if !self.out_of_order {
            return;
        }
        let ci = self.rctx.expect("in-order wait without context");
        let sched = Arc::clone(&self.sched);
        if let Some(rwin) = self.rvec[ci].rwin().cloned() {
            rwin.wait_head(self.rvec[ci].sn());
        }
        for (dest, events) in self.rvec[ci].stashed() {
            let accepted = sched.enqueue(dest, events).unwrap_or(0);
            if accepted < events.len() {
                log::warn!(
                    "dropped {} stashed events for queue {dest}",
                    events.len() - accepted
                );
            }
        }
        self.rvec[ci].clear_stash();
        self.out_of_order = false;
    }

    fn held_rwin(
        &self,
        index: usize,
        what: &str,
    ) -> Option<(u32, Arc<crate::reorder::ReorderWindow>)> {
        let Some(ci) = self.rctx else {
            log::error!("{what}({index}) without an ordered context");
            return None;
        };
        let rctx = &self.rvec[ci];
        let Some(rwin) = rctx.rwin().cloned() else {
            log::error!("{what}({index}) without a reorder window");
            return None;
        };
        if index >= rwin.lock_count() as usize {
            log::error!("{what}({index}) out of range");
            return None;
        }
        Some((rctx.sn(), rwin))
    }

    fn update_membership(&mut self) {
        let sched = Arc::clone(&self.sched);
        let slot = sched.threads.slot(self.tidx);
        for p in 0..sched.config.priority_count as usize {
            let wanted = slot.sg_wanted(p).load(Ordering::Acquire);
            if wanted == self.sg_actual[p] {
                continue;
            }
            let added = wanted.andn(&self.sg_actual[p]);
            for gi in added.iter() {
                let Ok(grp) = sched.groups.group(gi as GroupId) else {
                    log::error!("wanted group {gi} no longer exists");
                    continue;
                };
                let xf = grp.xfactor();
                for x in 0..xf {
                    // The thread index rotates the insertion order so
                    // different workers probe a group's lanes starting
                    // from different offsets.
                    let off = p as u32 * xf + (x + self.tidx) % xf;
                    insert_lane(
                        &mut self.lanes,
                        LaneRef {
                            grp: Arc::clone(&grp),
                            off,
                        },
                    );
                }
                grp.set_actual(p, self.tidx);
            }
            let removed = self.sg_actual[p].andn(&wanted);
            for gi in removed.iter() {
                let Ok(grp) = sched.groups.group(gi as GroupId) else {
                    log::error!("left group {gi} no longer exists");
                    continue;
                };
                let xf = grp.xfactor();
                for x in 0..xf {
                    remove_lane(&mut self.lanes, &grp, p as u32 * xf + x);
                }
                grp.clr_actual(p, self.tidx);
            }
            self.sg_actual[p] = wanted;
        }
    }

    /// One full scheduling pass: serve a retained atomic queue, fold
    /// membership changes, scan lanes, fall back to input polling.
    fn schedule_pass(&mut self, out: &mut [Event]) -> (Option<QueueIndex>, usize) {
        let sched = Arc::clone(&self.sched);
        loop {
            // An acquired atomic queue stays with this worker until it
            // drains or exhausts its budget.
            if let Some(aq) = self.atomq {
                let limit = out.len().min(sched.config.burst_size as usize);
                let dequeued = self.dequeued;
                let mut got = 0usize;
                let present = sched.queues.with_queue(aq, |q| {
                    debug_assert_eq!(q.qschst.load(Ordering::Relaxed).cur_ticket, self.ticket);
                    if dequeued < u32::from(q.qschst.load(Ordering::Relaxed).wrr_budget) {
                        got = q.ring.dequeue(&mut out[..limit]);
                    }
                });
                match present {
                    Some(()) if got > 0 => {
                        self.dequeued += got as u32;
                        sched
                            .stats
                            .events_dispatched
                            .fetch_add(got as u64, Ordering::Relaxed);
                        return (Some(aq), got);
                    }
                    Some(()) => self.release_atomic_inner(),
                    None => {
                        // Queue vanished under us; drop the hold.
                        self.atomq = None;
                        self.dequeued = 0;
                    }
                }
            }

            // Retire the reorder slot from the previous call.
            if self.rctx.is_some() {
                self.release_ordered_inner();
            }

            // Fold pending group membership changes.
            let slot = sched.threads.slot(self.tidx);
            if slot.sem_pending() {
                slot.take_sem();
                self.update_membership();
            }

            // Scan subscribed lanes in priority order.
            let mut acquired = false;
            let mut li = 0;
            'lanes: while li < self.lanes.len() {
                let lane_ref = self.lanes[li].clone();
                loop {
                    let Some(qidx) = lane_ref.grp.lane(lane_ref.off).peek() else {
                        li += 1;
                        continue 'lanes;
                    };
                    match self.dispatch(&sched, &lane_ref, qidx, out) {
                        Dispatch::Events(n) => {
                            sched
                                .stats
                                .events_dispatched
                                .fetch_add(n as u64, Ordering::Relaxed);
                            return (Some(qidx), n);
                        }
                        Dispatch::Acquired => {
                            acquired = true;
                            break 'lanes;
                        }
                        Dispatch::Retry => continue,
                        Dispatch::Next => {
                            li += 1;
                            continue 'lanes;
                        }
                    }
                }
            }
            if acquired {
                continue;
            }

            // No scheduled work: poll one external input source.
            sched
                .pktin
                .poll(&mut self.pktin_next, &mut self.pktin_poll_cnts);
            sched.stats.pktin_polls.fetch_add(1, Ordering::Relaxed);
            sched.stats.empty_passes.fetch_add(1, Ordering::Relaxed);
            return (None, 0);
        }
    }

    /// Dispatch the queue at a lane head according to its discipline.
    fn dispatch(
        &mut self,
        sched: &Arc<Scheduler>,
        lane_ref: &LaneRef,
        qidx: QueueIndex,
        out: &mut [Event],
    ) -> Dispatch {
        let nodes = sched.queues.nodes();
        let lane = lane_ref.grp.lane(lane_ref.off);
        let limit = out.len().min(sched.config.burst_size as usize);
        let wrr = sched.config.wrr_weight;

        let mut disp = Dispatch::Next;
        let present = sched.queues.with_queue(qidx, |q| {
            if !q.enabled.load(Ordering::Acquire) {
                lane.cond_pop(nodes, qidx);
                disp = Dispatch::Retry;
                return;
            }
            match q.sync {
                Some(SyncMode::Atomic) => {
                    // Take the queue off the lane first; owning the
                    // head is what makes the ticket below ours.
                    if !lane.cond_pop(nodes, qidx) {
                        disp = Dispatch::Retry;
                        return;
                    }
                    let ticket = q.qschst.take_ticket();
                    q.qschst.wait_cur(ticket);
                    self.atomq = Some(qidx);
                    self.ticket = ticket;
                    self.dequeued = 0;
                    disp = Dispatch::Acquired;
                }
                Some(SyncMode::Parallel) => {
                    let n = q.ring.dequeue(&mut out[..limit]);
                    if n > 0 {
                        q.qschst
                            .update_deq(n as u32, wrr, q.sched_lane(), nodes, qidx);
                        disp = Dispatch::Events(n);
                    } else if q.qschst.pop_deficit() != 0 {
                        q.qschst.update_popd(q.sched_lane(), nodes, qidx);
                    }
                }
                Some(SyncMode::Ordered) => {
                    if self.rvec_free == 0 {
                        // No reorder context available; hope another
                        // lane offers non-ordered work.
                        return;
                    }
                    let Some(rwin) = q.rwin.clone() else { return };
                    let Some(sn) = rwin.reserve() else {
                        // Reorder window full.
                        return;
                    };
                    // Dequeue strictly in reservation order.
                    rwin.wait_turn(sn);
                    let n = q.ring.dequeue(&mut out[..limit]);
                    if n > 0 {
                        rwin.advance_turn(sn);
                        q.qschst
                            .update_deq(n as u32, wrr, q.sched_lane(), nodes, qidx);
                        let ci = self.rvec_free.trailing_zeros() as usize;
                        self.rvec_free &= !(1 << ci);
                        self.out_of_order = !rwin.is_head(sn);
                        self.rvec[ci].init(rwin, sn);
                        self.rctx = Some(ci);
                        disp = Dispatch::Events(n);
                    } else {
                        if rwin.unreserve(sn) {
                            // Nobody reserved after us: the slot is
                            // handed back untouched.
                        } else {
                            // Later reservations exist; retire the
                            // empty slot through the normal protocol.
                            rwin.advance_turn(sn);
                            rwin.wait_head(sn);
                            for i in 0..rwin.lock_count() as usize {
                                rwin.olock_release(i, sn);
                            }
                            rwin.advance_head(sn);
                        }
                        if q.qschst.pop_deficit() != 0 {
                            q.qschst.update_popd(q.sched_lane(), nodes, qidx);
                        }
                    }
                }
                None => {
                    // Plain queues never sit on lanes; treat as gone.
                    lane.cond_pop(nodes, qidx);
                    disp = Dispatch::Retry;
                }
            }
        });

        match present {
            Some(()) => disp,
            None => {
                // Slot freed while the index sat on the lane: unlink
                // and look again.
                lane.cond_pop(nodes, qidx);
                Dispatch::Retry
            }
        }
    }

    fn do_detach(&mut self) -> SchedResult<()> {
        if self.detached {
            return Ok(());
        }
        self.release_held();

        let sched = Arc::clone(&self.sched);
        let mask = ThrMask::single(self.tidx);
        if let Err(e) = sched.groups.leave(&sched.threads, GROUP_ALL, mask) {
            log::error!("thread {} failed to leave ALL: {e}", self.tidx);
        }
        let type_group = match self.ttype {
            ThreadType::Worker => GROUP_WORKER,
            ThreadType::Control => GROUP_CONTROL,
        };
        if let Err(e) = sched.groups.leave(&sched.threads, type_group, mask) {
            log::error!("thread {} failed to leave type group: {e}", self.tidx);
        }

        // Fold the leave notifications so actual membership clears.
        sched.threads.slot(self.tidx).take_sem();
        self.update_membership();

        self.detached = true;
        sched.threads.detach(self.tidx);

        if !self.lanes.is_empty() {
            log::error!(
                "thread {} detached while subscribed to {} lanes",
                self.tidx,
                self.lanes.len()
            );
            return Err(SchedError::MisSequence("thread still in schedule groups"));
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.do_detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, Mutex};
    use std::thread;

    fn sched() -> Arc<Scheduler> {
        Scheduler::with_defaults().unwrap()
    }

    #[test]
    fn test_single_worker_atomic_roundtrip() {
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Atomic, 3, GROUP_ALL))
            .unwrap();
        s.enqueue(q, &[Event(1), Event(2), Event(3)]).unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        let mut got = Vec::new();
        while let Some((src, ev)) = w.schedule(WaitMode::NoWait) {
            assert_eq!(src, q);
            got.push(ev.0);
        }
        assert_eq!(got, vec![1, 2, 3]);

        w.detach().unwrap();
        s.queue_destroy(q).unwrap();
    }

    #[test]
    fn test_atomic_exclusivity_two_workers() {
        // Scenario: one atomic queue, two workers. Ownership is
        // exclusive and survives across schedule calls, so the global
        // receive order must equal the enqueue order exactly.
        const N: u64 = 100;
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Atomic, 3, GROUP_ALL))
            .unwrap();
        let evs: Vec<Event> = (1..=N).map(Event).collect();
        assert_eq!(s.enqueue(q, &evs).unwrap(), N as usize);

        let remaining = Arc::new(AtomicUsize::new(N as usize));
        let order = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let s = Arc::clone(&s);
            let remaining = Arc::clone(&remaining);
            let order = Arc::clone(&order);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let mut w = s.thread_attach(ThreadType::Worker).unwrap();
                let mut out = [Event::NULL; 8];
                barrier.wait();
                while remaining.load(Ordering::Acquire) > 0 {
                    let (_, n) = w.schedule_multi(WaitMode::NoWait, &mut out);
                    if n > 0 {
                        // Still the exclusive owner here: the push
                        // order proves no interleaving happened.
                        order.lock().unwrap().extend(out[..n].iter().map(|e| e.0));
                        remaining.fetch_sub(n, Ordering::Release);
                    }
                }
                w.detach().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let got = order.lock().unwrap().clone();
        let want: Vec<u64> = (1..=N).collect();
        assert_eq!(got, want);
        s.queue_destroy(q).unwrap();
    }

    #[test]
    fn test_ordered_total_order_four_workers() {
        // Scenario: four workers race on one ordered queue and copy
        // every event into a plain destination queue. The destination
        // must observe the exact enqueue order.
        const N: u64 = 1000;
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Ordered, 4, GROUP_ALL))
            .unwrap();
        let dst = s.queue_create(&QueueParams::plain()).unwrap();

        let evs: Vec<Event> = (1..=N).map(Event).collect();
        assert_eq!(s.enqueue(q, &evs).unwrap(), N as usize);

        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            let done = Arc::clone(&done);
            handles.push(thread::spawn(move || {
                let mut w = s.thread_attach(ThreadType::Worker).unwrap();
                let mut out = [Event::NULL; 8];
                while done.load(Ordering::Acquire) < N as usize {
                    let (_, n) = w.schedule_multi(WaitMode::NoWait, &mut out);
                    if n > 0 {
                        assert_eq!(w.enqueue(dst, &out[..n]).unwrap(), n);
                        done.fetch_add(n, Ordering::Release);
                    }
                }
                // Detach retires any slot still held, replaying its
                // stash in order.
                w.detach().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut got = Vec::new();
        let mut out = [Event::NULL; 64];
        loop {
            let n = s.queue_deq(dst, &mut out).unwrap();
            if n == 0 {
                break;
            }
            got.extend(out[..n].iter().map(|e| e.0));
        }
        let want: Vec<u64> = (1..=N).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_wrr_rotation_between_queues() {
        // Scenario: two parallel queues on the same lane; after the
        // first queue burns its WRR budget the second must be served.
        let s = sched();
        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        let grp = s
            .group_create("pair", ThrMask::single(w.thread_index()))
            .unwrap();
        let qa = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, grp))
            .unwrap();
        let qb = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, grp))
            .unwrap();

        let evs: Vec<Event> = (1..=1000).map(Event).collect();
        assert_eq!(s.enqueue(qa, &evs).unwrap(), 1000);
        assert_eq!(s.enqueue(qb, &evs).unwrap(), 1000);

        let mut sources = Vec::new();
        let mut out = [Event::NULL; 32];
        let mut total = 0;
        while total < 2000 {
            let (src, n) = w.schedule_multi(WaitMode::NoWait, &mut out);
            if n > 0 {
                for _ in 0..n {
                    sources.push(src.unwrap());
                }
                total += n;
            }
        }

        let first_b = sources.iter().position(|&src| src == qb).unwrap();
        let weight = s.config().wrr_weight as usize;
        assert!(
            first_b >= weight && first_b <= 2 * weight,
            "first event from the second queue at position {first_b}"
        );

        // Leave the extra group so detach finds no stale lanes.
        s.group_leave(grp, ThrMask::single(w.thread_index())).unwrap();
        w.detach().unwrap();
    }

    #[test]
    fn test_group_join_latency() {
        // Scenario: an event sits in a group the thread has not
        // joined; after the join, a bounded number of schedule calls
        // must deliver it.
        let s = sched();
        let grp = s.group_create("late", ThrMask::zero()).unwrap();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, grp))
            .unwrap();
        s.enqueue(q, &[Event(42)]).unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        for _ in 0..4 {
            assert!(w.schedule(WaitMode::NoWait).is_none());
        }

        s.group_join(grp, ThrMask::single(w.thread_index())).unwrap();
        let mut found = None;
        for _ in 0..100 {
            if let Some((src, ev)) = w.schedule(WaitMode::NoWait) {
                found = Some((src, ev));
                break;
            }
        }
        assert_eq!(found, Some((q, Event(42))));

        s.group_leave(grp, ThrMask::single(w.thread_index())).unwrap();
        w.detach().unwrap();
    }

    #[test]
    fn test_group_destroy_nonempty_refused() {
        // Scenario: destroying a group that still has a queue (with a
        // pending event) must fail and leave everything intact.
        let s = sched();
        let grp = s.group_create("busy", ThrMask::zero()).unwrap();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 1, grp))
            .unwrap();
        s.enqueue(q, &[Event(7)]).unwrap();

        assert_eq!(
            s.group_destroy(grp),
            Err(SchedError::MisSequence("group has queues"))
        );
        assert_eq!(s.group_lookup("busy").unwrap(), grp);
        // Queue and event untouched: a joining worker still gets it.
        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        s.group_join(grp, ThrMask::single(w.thread_index())).unwrap();
        let got = (0..100).find_map(|_| w.schedule(WaitMode::NoWait));
        assert_eq!(got, Some((q, Event(7))));

        s.group_leave(grp, ThrMask::single(w.thread_index())).unwrap();
        w.detach().unwrap();
    }

    #[test]
    fn test_ordered_named_locks() {
        // Scenario: each of four slots passes through two named order
        // locks; each lock admits the slots strictly in slot order.
        let s = sched();
        let q = s
            .queue_create(
                &QueueParams::scheduled(SyncMode::Ordered, 2, GROUP_ALL).with_lock_count(2),
            )
            .unwrap();
        s.enqueue(q, &[Event(1), Event(2), Event(3), Event(4)])
            .unwrap();

        let section0 = Arc::new(Mutex::new(Vec::new()));
        let section1 = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&s);
            let section0 = Arc::clone(&section0);
            let section1 = Arc::clone(&section1);
            handles.push(thread::spawn(move || {
                let mut w = s.thread_attach(ThreadType::Worker).unwrap();
                let ev = loop {
                    if let Some((_, ev)) = w.schedule(WaitMode::NoWait) {
                        break ev;
                    }
                };
                w.order_lock(0);
                section0.lock().unwrap().push(ev.0);
                w.order_unlock(0);
                w.order_lock_start(1);
                w.order_lock_wait(1);
                section1.lock().unwrap().push(ev.0);
                w.order_unlock(1);
                w.detach().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(section0.lock().unwrap().clone(), vec![1, 2, 3, 4]);
        assert_eq!(section1.lock().unwrap().clone(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pause_resume() {
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, GROUP_ALL))
            .unwrap();
        s.enqueue(q, &[Event(5)]).unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        w.pause();
        for _ in 0..3 {
            assert!(w.schedule(WaitMode::NoWait).is_none());
        }
        w.resume();
        let got = (0..100).find_map(|_| w.schedule(WaitMode::NoWait));
        assert_eq!(got, Some((q, Event(5))));
        w.detach().unwrap();
    }

    #[test]
    fn test_wait_modes() {
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, GROUP_ALL))
            .unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();

        // Timed wait on an empty scheduler returns empty after the
        // deadline.
        let start = Instant::now();
        assert!(w.schedule(wait_time_ns(2_000_000)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(2));

        // Wait-forever returns once a producer delivers.
        let producer = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                s.enqueue(q, &[Event(11)]).unwrap();
            })
        };
        assert_eq!(w.schedule(WaitMode::FOREVER), Some((q, Event(11))));
        producer.join().unwrap();
        w.detach().unwrap();
    }

    #[test]
    fn test_unsched_and_resched_queue() {
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, GROUP_ALL))
            .unwrap();
        s.enqueue(q, &[Event(1)]).unwrap();
        s.unsched_queue(q).unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        for _ in 0..5 {
            assert!(w.schedule(WaitMode::NoWait).is_none());
        }

        // Re-enabling pushes the still-loaded queue back onto its lane.
        s.sched_queue(q).unwrap();
        let got = (0..100).find_map(|_| w.schedule(WaitMode::NoWait));
        assert_eq!(got, Some((q, Event(1))));
        w.detach().unwrap();
    }

    #[test]
    fn test_detach_refused_while_in_group() {
        let s = sched();
        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        let grp = s
            .group_create("sticky", ThrMask::single(w.thread_index()))
            .unwrap();
        let _q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, grp))
            .unwrap();

        // Fold the membership in, then detach without leaving: refused.
        assert!(w.schedule(WaitMode::NoWait).is_none());
        assert_eq!(
            w.detach(),
            Err(SchedError::MisSequence("thread still in schedule groups"))
        );
    }

    #[test]
    fn test_queue_info_reports_ctx() {
        let s = sched();
        let q = s
            .queue_create(
                &QueueParams::scheduled(SyncMode::Atomic, 5, GROUP_ALL).with_ctx(0xF10F),
            )
            .unwrap();
        let info = s.queue_info(q).unwrap();
        assert_eq!(info.sync, Some(SyncMode::Atomic));
        assert_eq!(info.prio, 5);
        assert_eq!(info.group, GROUP_ALL);
        assert_eq!(info.ctx, 0xF10F);
        s.queue_destroy(q).unwrap();
        assert!(s.queue_info(q).is_err());
    }

    #[test]
    fn test_no_lost_enqueue_mixed_disciplines() {
        // Stress: three queues of different disciplines and priorities,
        // concurrent producers and workers. Every enqueued event must
        // come back exactly once.
        const PER_QUEUE: u64 = 2000;
        let s = sched();
        let qs = [
            s.queue_create(&QueueParams::scheduled(SyncMode::Atomic, 1, GROUP_ALL))
                .unwrap(),
            s.queue_create(&QueueParams::scheduled(SyncMode::Parallel, 2, GROUP_ALL))
                .unwrap(),
            s.queue_create(&QueueParams::scheduled(SyncMode::Ordered, 3, GROUP_ALL))
                .unwrap(),
        ];

        let producers: Vec<_> = qs
            .iter()
            .enumerate()
            .map(|(qi, &q)| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    for i in 0..PER_QUEUE {
                        let ev = Event(((qi as u64 + 1) << 32) | (i + 1));
                        while s.enqueue(q, &[ev]).unwrap() == 0 {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = (qs.len() as u64 * PER_QUEUE) as usize;
        let done = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let s = Arc::clone(&s);
                let done = Arc::clone(&done);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    let mut w = s.thread_attach(ThreadType::Worker).unwrap();
                    let mut out = [Event::NULL; 16];
                    while done.load(Ordering::Acquire) < total {
                        let (_, n) = w.schedule_multi(WaitMode::NoWait, &mut out);
                        if n > 0 {
                            seen.lock().unwrap().extend(out[..n].iter().map(|e| e.0));
                            done.fetch_add(n, Ordering::Release);
                        }
                    }
                    w.detach().unwrap();
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for w in workers {
            w.join().unwrap();
        }

        let mut all = seen.lock().unwrap().clone();
        assert_eq!(all.len(), total);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "duplicated or lost events");
    }

    #[test]
    fn test_stats_accumulate() {
        let s = sched();
        let q = s
            .queue_create(&QueueParams::scheduled(SyncMode::Parallel, 0, GROUP_ALL))
            .unwrap();
        s.enqueue(q, &[Event(1), Event(2)]).unwrap();

        let mut w = s.thread_attach(ThreadType::Worker).unwrap();
        let mut got = 0;
        for _ in 0..10 {
            if w.schedule(WaitMode::NoWait).is_some() {
                got += 1;
            }
        }
        assert_eq!(got, 2);

        let stats = s.stats();
        assert_eq!(stats.events_dispatched, 2);
        assert_eq!(stats.schedule_calls, 10);
        assert!(stats.empty_passes >= 8);
        w.detach().unwrap();
    }
}
