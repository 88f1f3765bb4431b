//! Runtime scheduler configuration
//!
//! Tunables that do not size static tables are runtime options loaded
//! at `Scheduler` construction, either from defaults or from a TOML
//! fragment. Table-sizing limits (group capacity, ordered lock count,
//! stash capacity) are compile-time constants; validation rejects
//! values that exceed them.

use serde::Deserialize;

use crate::error::{SchedError, SchedResult};

/// Number of priority levels the tables are sized for (0 is highest).
pub const NUM_PRIO: usize = 8;

/// Maximum number of concurrent schedule groups.
pub const MAX_SCHED_GROUP: usize = 256;

/// Maximum number of queues.
pub const MAX_QUEUES: usize = 1024;

/// Maximum number of named order locks per ordered queue.
pub const MAX_ORDERED_LOCKS: usize = 2;

/// Group name capacity, including no terminator.
pub const GROUP_NAME_LEN: usize = 32;

/// Scheduler tunables.
///
/// Loaded once at `Scheduler` construction; immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedConfig {
    /// Active priority levels, `1..=NUM_PRIO`. Queues must use a
    /// priority below this count.
    pub priority_count: u32,

    /// Events a queue may deliver per lane visit before it is rotated
    /// to the lane tail.
    pub wrr_weight: u16,

    /// Lane spread factor used when a group is created with an empty
    /// thread mask.
    pub default_xfactor: u32,

    /// Per-dequeue batch cap. Accepted range 1..=64.
    pub burst_size: u32,

    /// Reorder window size per ordered queue. Power of two.
    pub reorder_window: u32,

    /// Default event-ring capacity for queues created with size 0.
    /// Power of two.
    pub queue_size: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            priority_count: NUM_PRIO as u32,
            wrr_weight: 64,
            default_xfactor: 4,
            burst_size: 32,
            reorder_window: 256,
            queue_size: 4096,
        }
    }
}

impl SchedConfig {
    /// Parse a TOML fragment into a configuration.
    ///
    /// Missing keys take their defaults; the result is validated.
    pub fn from_toml(text: &str) -> SchedResult<Self> {
        let cfg: SchedConfig =
            toml::from_str(text).map_err(|e| SchedError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check option ranges against the compile-time table limits.
    pub fn validate(&self) -> SchedResult<()> {
        if self.priority_count == 0 || self.priority_count as usize > NUM_PRIO {
            return Err(SchedError::Config(format!(
                "priority-count {} outside 1..={}",
                self.priority_count, NUM_PRIO
            )));
        }
        if self.wrr_weight == 0 {
            return Err(SchedError::Config("wrr-weight must be nonzero".into()));
        }
        if self.default_xfactor == 0 || self.default_xfactor as usize > crate::types::MAX_THREADS {
            return Err(SchedError::Config(format!(
                "default-xfactor {} outside 1..={}",
                self.default_xfactor,
                crate::types::MAX_THREADS
            )));
        }
        if self.burst_size == 0 || self.burst_size > 64 {
            return Err(SchedError::Config(format!(
                "burst-size {} outside 1..=64",
                self.burst_size
            )));
        }
        if !self.reorder_window.is_power_of_two() {
            return Err(SchedError::Config(format!(
                "reorder-window {} not a power of two",
                self.reorder_window
            )));
        }
        if !self.queue_size.is_power_of_two() {
            return Err(SchedError::Config(format!(
                "queue-size {} not a power of two",
                self.queue_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = SchedConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.priority_count, 8);
        assert_eq!(cfg.wrr_weight, 64);
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = SchedConfig::from_toml(
            r#"
            wrr-weight = 16
            burst-size = 8
            reorder-window = 128
            "#,
        )
        .unwrap();
        assert_eq!(cfg.wrr_weight, 16);
        assert_eq!(cfg.burst_size, 8);
        assert_eq!(cfg.reorder_window, 128);
        // Unset keys keep defaults
        assert_eq!(cfg.queue_size, 4096);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SchedConfig::from_toml("priority-count = 9").is_err());
        assert!(SchedConfig::from_toml("burst-size = 0").is_err());
        assert!(SchedConfig::from_toml("reorder-window = 100").is_err());
        assert!(SchedConfig::from_toml("queue-size = 1000").is_err());
        assert!(SchedConfig::from_toml("default-xfactor = 65").is_err());
    }
}
