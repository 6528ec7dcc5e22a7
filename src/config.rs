use crate::base::LiveValue;

/// Configuration for a read semaphore.
#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// Maximum number of concurrently admitted reads. Must not be negative.
    pub count: i64,
    /// Memory budget shared by all admitted reads, in bytes. Must not be negative.
    pub memory: i64,
    /// Name used in error messages and diagnostics dumps.
    pub name: String,
    /// Once wait-queue plus ready-list length reaches this, new reads are shed.
    pub max_queue_length: usize,
    /// Consumed memory beyond `memory * serialize_limit_multiplier` restricts
    /// memory growth to a single read. `0` or `u32::MAX` disables the limit.
    /// Cloning the config shares the cell, so the limit stays live-updatable.
    pub serialize_limit_multiplier: LiveValue<u32>,
    /// Consumed memory beyond `memory * kill_limit_multiplier` fails further
    /// consumption outright. `0` or `u32::MAX` disables the limit.
    pub kill_limit_multiplier: LiveValue<u32>,
}

impl SemaphoreConfig {
    pub fn new(name: impl Into<String>, count: i64, memory: i64) -> Self {
        Self {
            count,
            memory,
            name: name.into(),
            ..Default::default()
        }
    }

    /// A semaphore that admits everything: all limits at their maxima.
    pub fn unlimited(name: impl Into<String>) -> Self {
        Self {
            count: i64::MAX,
            memory: i64::MAX,
            name: name.into(),
            max_queue_length: usize::MAX,
            serialize_limit_multiplier: LiveValue::new(u32::MAX),
            kill_limit_multiplier: LiveValue::new(u32::MAX),
        }
    }

    /// A config tuned for tests: tiny budgets so admission and escalation
    /// paths are easy to hit.
    #[cfg(test)]
    pub(crate) fn for_testing(count: i64, memory: i64) -> Self {
        Self {
            count,
            memory,
            name: "test-weir".to_owned(),
            ..Default::default()
        }
    }
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            count: 100,
            memory: 128 * 1024 * 1024, // 128 MiB
            name: "weir".to_owned(),
            max_queue_length: 100,
            serialize_limit_multiplier: LiveValue::new(2),
            kill_limit_multiplier: LiveValue::new(4),
        }
    }
}
