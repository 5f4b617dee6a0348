//! Runtime configuration
//!
//! Built with defaults, a builder, or `from_env()` which reads `LKS_`
//! prefixed environment variables over the defaults.

use std::time::Duration;

use lockstep_core::constants::MAX_WORKERS;
use lockstep_core::env::{env_get, env_get_bool};

/// Configuration for the scheduler and streaming runtime.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (defaults to CPU count)
    pub num_workers: usize,

    /// Workers that also serve the background queues and io pump
    pub num_background_workers: usize,

    /// Initial capacity of each per-worker steal queue
    pub steal_queue_capacity: usize,

    /// Idle rounds to spin through before sleeping between phases
    pub idle_spins: usize,

    /// Sleep length once a worker gives up spinning on an idle scheduler
    pub idle_sleep: Duration,

    /// Timeout for a blocking io completion poll
    pub io_poll_timeout: Duration,

    /// io backend submission queue depth
    pub io_entries: u32,

    /// Byte budget of offered pages kept resident before eviction
    pub page_budget: usize,

    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            num_workers: num_cpus.min(MAX_WORKERS),
            num_background_workers: 1,
            steal_queue_capacity: 256,
            idle_spins: 64,
            idle_sleep: Duration::from_micros(200),
            io_poll_timeout: Duration::from_millis(1),
            io_entries: 256,
            page_budget: 64 * 1024 * 1024,
            debug_logging: false,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LKS_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            num_workers: env_get("LKS_NUM_WORKERS", defaults.num_workers),
            num_background_workers: env_get(
                "LKS_NUM_BACKGROUND_WORKERS",
                defaults.num_background_workers,
            ),
            steal_queue_capacity: env_get(
                "LKS_STEAL_QUEUE_CAPACITY",
                defaults.steal_queue_capacity,
            ),
            idle_spins: env_get("LKS_IDLE_SPINS", defaults.idle_spins),
            idle_sleep: Duration::from_micros(env_get(
                "LKS_IDLE_SLEEP_US",
                defaults.idle_sleep.as_micros() as u64,
            )),
            io_poll_timeout: Duration::from_micros(env_get(
                "LKS_IO_POLL_TIMEOUT_US",
                defaults.io_poll_timeout.as_micros() as u64,
            )),
            io_entries: env_get("LKS_IO_ENTRIES", defaults.io_entries),
            page_budget: env_get("LKS_PAGE_BUDGET", defaults.page_budget),
            debug_logging: env_get_bool("LKS_DEBUG_LOGGING", defaults.debug_logging),
        }
    }

    /// Set number of worker threads
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.min(MAX_WORKERS);
        self
    }

    /// Set number of background-capable workers
    pub fn num_background_workers(mut self, n: usize) -> Self {
        self.num_background_workers = n;
        self
    }

    /// Set initial steal queue capacity
    pub fn steal_queue_capacity(mut self, n: usize) -> Self {
        self.steal_queue_capacity = n;
        self
    }

    /// Set the offered-page byte budget
    pub fn page_budget(mut self, bytes: usize) -> Self {
        self.page_budget = bytes;
        self
    }

    /// Set io submission queue depth
    pub fn io_entries(mut self, n: u32) -> Self {
        self.io_entries = n;
        self
    }

    /// Enable debug logging
    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_workers == 0 {
            return Err("num_workers must be at least 1");
        }
        if self.num_workers > MAX_WORKERS {
            return Err("num_workers exceeds maximum");
        }
        if self.num_background_workers > self.num_workers {
            return Err("num_background_workers exceeds num_workers");
        }
        if self.steal_queue_capacity == 0 {
            return Err("steal_queue_capacity must be at least 1");
        }
        if self.io_entries == 0 || !self.io_entries.is_power_of_two() {
            return Err("io_entries must be a power of two");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_clamps_workers() {
        let config = SchedulerConfig::new().num_workers(10_000);
        assert_eq!(config.num_workers, MAX_WORKERS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SchedulerConfig::default();
        config.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.num_background_workers = config.num_workers + 1;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.io_entries = 100;
        assert!(config.validate().is_err());
    }
}
