//! Scheduler error surface
//!
//! The hot path (`schedule`, enqueue, dequeue) never propagates errors;
//! it silently skips and retries. Only configuration and lifecycle
//! operations surface typed errors to the caller.

use thiserror::Error;

use crate::types::{GroupId, QueueIndex};

/// Errors returned by lifecycle and configuration operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    /// Queue index out of range or slot not allocated.
    #[error("invalid queue handle {0}")]
    InvalidQueue(QueueIndex),

    /// Group index out of range or slot not allocated.
    #[error("invalid group handle {0}")]
    InvalidGroup(GroupId),

    /// A fixed-capacity table is full (group table, queue table,
    /// thread table, pktin registry).
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// Operation violates lifecycle sequencing (destroying a non-empty
    /// group, detaching a thread that still subscribes to lanes,
    /// destroying a queue that is held or still on a lane).
    #[error("mis-sequenced operation: {0}")]
    MisSequence(&'static str),

    /// Invalid queue or group parameters.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Configuration rejected during validation or parse.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;
