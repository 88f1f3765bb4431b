//! Scheduled queue objects
//!
//! A queue owns a bounded MPMC event ring plus the scheduler-side
//! state attached to it: the packed `qschst` word, its lane link node,
//! the lane chosen inside its group, and (for ordered queues) the
//! reorder window. Queues live in a fixed table; the per-slot
//! reader/writer lock makes the destroy path wait out in-flight hot
//! path accesses instead of racing them.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::config::{SchedConfig, MAX_ORDERED_LOCKS, MAX_QUEUES};
use crate::error::{SchedError, SchedResult};
use crate::reorder::ReorderWindow;
use crate::sched::group::{GroupTable, SchedGroup};
use crate::sched::lane::SchedLane;
use crate::sched::qschst::Qschst;
use crate::sched::thread::ThreadTable;
use crate::sync::{EventRing, LlNode};
use crate::types::{GroupId, QueueIndex, SyncMode};

/// Parameters for queue creation.
#[derive(Debug, Clone)]
pub struct QueueParams {
    /// Synchronization discipline; `None` creates a plain
    /// (unscheduled) queue that is only drained with `queue_deq`.
    pub sync: Option<SyncMode>,
    /// Priority, `0..num_prio` (0 served first). Ignored for plain
    /// queues.
    pub prio: u32,
    /// Owning schedule group. Ignored for plain queues.
    pub group: GroupId,
    /// Named order locks, ordered queues only (`0..=2`).
    pub lock_count: u16,
    /// Ring capacity; 0 takes the configured default. Rounded up to a
    /// power of two.
    pub size: u32,
    /// Whether ordered producers may defer enqueues into this queue.
    /// Wire-order destinations (packet output) set this false, forcing
    /// the producer to wait until it is in-order.
    pub deferrable: bool,
    /// Opaque per-queue context returned by `queue_info`. Typically a
    /// pointer or index into application flow state.
    pub ctx: u64,
}

/// Queue attributes reported by `queue_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub sync: Option<SyncMode>,
    pub prio: u32,
    pub group: GroupId,
    pub ctx: u64,
}

impl QueueParams {
    /// A scheduled queue with the given discipline.
    pub fn scheduled(sync: SyncMode, prio: u32, group: GroupId) -> Self {
        QueueParams {
            sync: Some(sync),
            prio,
            group,
            lock_count: 0,
            size: 0,
            deferrable: true,
            ctx: 0,
        }
    }

    /// A plain queue (no scheduling), typically an output destination.
    pub fn plain() -> Self {
        QueueParams {
            sync: None,
            prio: 0,
            group: 0,
            lock_count: 0,
            size: 0,
            deferrable: true,
            ctx: 0,
        }
    }

    /// Set the number of named order locks (ordered queues).
    pub fn with_lock_count(mut self, lock_count: u16) -> Self {
        self.lock_count = lock_count;
        self
    }

    /// Set the ring capacity.
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    /// Mark the queue non-deferrable for ordered producers.
    pub fn not_deferrable(mut self) -> Self {
        self.deferrable = false;
        self
    }

    /// Attach an opaque application context.
    pub fn with_ctx(mut self, ctx: u64) -> Self {
        self.ctx = ctx;
        self
    }
}

/// One queue: event ring plus scheduler-side state.
#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) sync: Option<SyncMode>,
    pub(crate) prio: u32,
    pub(crate) group: GroupId,
    pub(crate) deferrable: bool,
    pub(crate) ctx: u64,
    /// Cleared by `unsched_queue`; workers drop disabled queues from
    /// their lanes on sight.
    pub(crate) enabled: AtomicBool,
    pub(crate) qschst: Qschst,
    /// The lane this queue lives on while non-empty (scheduled only).
    pub(crate) lane: Option<(Arc<SchedGroup>, u32)>,
    pub(crate) ring: EventRing,
    pub(crate) rwin: Option<Arc<ReorderWindow>>,
}

impl Queue {
    /// The lane of a scheduled queue.
    pub(crate) fn sched_lane(&self) -> &SchedLane {
        let (grp, off) = self.lane.as_ref().expect("scheduled queue has a lane");
        grp.lane(*off)
    }

    /// Whether this queue takes the atomic dispatch path.
    pub(crate) fn is_atomic(&self) -> bool {
        self.sync == Some(SyncMode::Atomic)
    }
}

/// Fixed table of queue slots plus the shared lane link nodes.
#[derive(Debug)]
pub(crate) struct QueueTable {
    lock: Mutex<()>,
    slots: Box<[RwLock<Option<Queue>>]>,
    nodes: Box<[LlNode]>,
}

impl QueueTable {
    pub(crate) fn new() -> Self {
        QueueTable {
            lock: Mutex::new(()),
            slots: (0..MAX_QUEUES).map(|_| RwLock::new(None)).collect(),
            nodes: (0..MAX_QUEUES).map(|_| LlNode::new()).collect(),
        }
    }

    /// The lane link node table (indexed by queue index).
    pub(crate) fn nodes(&self) -> &[LlNode] {
        &self.nodes
    }

    /// Run `f` against a live queue. Returns `None` for a dead slot,
    /// which hot paths treat as "queue vanished, move on".
    pub(crate) fn with_queue<R>(
        &self,
        idx: QueueIndex,
        f: impl FnOnce(&Queue) -> R,
    ) -> Option<R> {
        let slot = self.slots.get(idx as usize)?;
        let guard = slot.read();
        guard.as_ref().map(f)
    }

    /// Create a queue.
    pub(crate) fn create(
        &self,
        config: &SchedConfig,
        groups: &GroupTable,
        threads: &ThreadTable,
        params: &QueueParams,
    ) -> SchedResult<QueueIndex> {
        if params.lock_count as usize > MAX_ORDERED_LOCKS {
            return Err(SchedError::InvalidParam("lock_count exceeds maximum"));
        }
        if params.lock_count > 0 && params.sync != Some(SyncMode::Ordered) {
            return Err(SchedError::InvalidParam(
                "order locks require an ordered queue",
            ));
        }
        if params.sync.is_some() && params.prio >= config.priority_count {
            return Err(SchedError::InvalidParam("priority out of range"));
        }
        let size = match params.size {
            0 => config.queue_size,
            n => n.next_power_of_two(),
        };

        let _g = self.lock.lock();
        let idx = self
            .slots
            .iter()
            .enumerate()
            .position(|(i, s)| s.read().is_none() && !self.nodes[i].on_queue())
            .ok_or(SchedError::CapacityExceeded("queue table"))? as QueueIndex;

        let lane = match params.sync {
            Some(_) => Some(groups.queue_init(threads, params.group, params.prio)?),
            None => None,
        };
        let rwin = match params.sync {
            Some(SyncMode::Ordered) => {
                Some(ReorderWindow::new(config.reorder_window, params.lock_count))
            }
            _ => None,
        };

        let queue = Queue {
            sync: params.sync,
            prio: params.prio,
            group: params.group,
            deferrable: params.deferrable,
            ctx: params.ctx,
            enabled: AtomicBool::new(true),
            qschst: Qschst::new(config.wrr_weight),
            lane,
            ring: EventRing::new(size),
            rwin,
        };
        *self.slots[idx as usize].write() = Some(queue);
        Ok(idx)
    }

    /// Destroy a queue. Refused while the queue holds events, sits on
    /// a lane, is owned by a worker, or has reorder slots in flight.
    pub(crate) fn destroy(
        &self,
        groups: &GroupTable,
        threads: &ThreadTable,
        idx: QueueIndex,
    ) -> SchedResult<()> {
        let _g = self.lock.lock();
        let slot = self
            .slots
            .get(idx as usize)
            .ok_or(SchedError::InvalidQueue(idx))?;
        let mut guard = slot.write();
        let queue = guard.as_ref().ok_or(SchedError::InvalidQueue(idx))?;

        if self.nodes[idx as usize].on_queue() {
            log::error!("queue {idx} destroy refused: still on a schedule lane");
            return Err(SchedError::MisSequence("queue on a schedule lane"));
        }
        let st = queue.qschst.load(Ordering::Acquire);
        if queue.is_atomic() && st.is_owned() {
            log::error!("queue {idx} destroy refused: held by a worker");
            return Err(SchedError::MisSequence("queue held by a worker"));
        }
        if st.numevts > 0 || !queue.ring.is_empty() {
            log::error!("queue {idx} destroy refused: not empty");
            return Err(SchedError::MisSequence("queue not empty"));
        }
        if let Some(rwin) = &queue.rwin {
            if rwin.in_flight() {
                log::error!("queue {idx} destroy refused: reorder window busy");
                return Err(SchedError::MisSequence("reorder window busy"));
            }
        }

        if queue.sync.is_some() {
            groups.queue_fini(threads, queue.group, queue.prio);
        }
        *guard = None;
        Ok(())
    }
}
