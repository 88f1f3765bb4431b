//! evq - a data-plane event scheduler
//!
//! This crate multiplexes events (packets, timeouts, completions) from
//! a large population of logical queues across a bounded set of worker
//! threads, enforcing three synchronization disciplines per queue:
//!
//! - **parallel**: any worker, any time, no ordering;
//! - **atomic**: at most one worker holds a queue at any instant;
//! - **ordered**: concurrent processing, but output order equals the
//!   order events were dequeued.
//!
//! Work distribution runs through schedule groups: named sets of
//! threads and per-priority lane arrays. Workers discover queues by
//! scanning their subscribed lanes in priority order; weighted
//! round-robin rotation keeps queues of one lane from starving each
//! other. All hot-path blocking is bounded spinning on atomics.
//!
//! ```no_run
//! use evq::{Scheduler, QueueParams, SyncMode, ThreadType, WaitMode, Event, GROUP_ALL};
//!
//! let sched = Scheduler::with_defaults().unwrap();
//! let q = sched
//!     .queue_create(&QueueParams::scheduled(SyncMode::Atomic, 3, GROUP_ALL))
//!     .unwrap();
//! sched.enqueue(q, &[Event(1), Event(2)]).unwrap();
//!
//! let mut worker = sched.thread_attach(ThreadType::Worker).unwrap();
//! while let Some((src, ev)) = worker.schedule(WaitMode::NoWait) {
//!     assert_eq!(src, q);
//!     println!("event {:?}", ev);
//! }
//! worker.detach().unwrap();
//! ```

// Core types
pub mod types;

pub mod config;
pub mod error;
pub mod pktin;
pub mod queue;
pub mod reorder;
pub mod sched;
pub mod sync;

pub use config::{SchedConfig, MAX_ORDERED_LOCKS, MAX_QUEUES, MAX_SCHED_GROUP, NUM_PRIO};
pub use error::{SchedError, SchedResult};
pub use pktin::{PktinPollResult, PktinPoller};
pub use queue::{QueueInfo, QueueParams};
pub use sched::group::{GroupInfo, GROUP_ALL, GROUP_CONTROL, GROUP_WORKER};
pub use sched::{wait_time_ns, Scheduler, StatsSnapshot, WaitMode, Worker};
pub use types::{Event, GroupId, QueueIndex, SyncMode, ThrMask, ThreadIndex, ThreadType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name.
pub const NAME: &str = "evq";
