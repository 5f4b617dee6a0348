//! # lockstep-runtime
//!
//! Platform-specific runtime for the lockstep phased scheduler.
//!
//! Builds on `lockstep-core`'s primitives:
//!
//! - `config` - Runtime configuration with environment overrides
//! - `worker` - OS worker thread pool and thread-local worker identity
//! - `scheduler` - The phased work-stealing scheduler
//! - `pages` - mmap-backed page regions and the page reclaimer
//! - `io` - Asynchronous read backends (io_uring on Linux, mock for tests)
//! - `cache` - The page-granular streaming file cache
//! - `file` - Readable file handles

#![allow(dead_code)]

pub mod cache;
pub mod config;
pub mod file;
pub mod io;
pub mod pages;
pub mod scheduler;
pub mod worker;

pub use cache::{CacheStatsSnapshot, FileCache, ReadRequest};
pub use config::SchedulerConfig;
pub use file::FileHandle;
pub use pages::{BudgetReclaimer, PageReclaimer, PageSpan, ReclaimOutcome};
pub use scheduler::{Scheduler, StopRequest};
