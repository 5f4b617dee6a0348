//! # lockstep - phased task scheduling with streaming io
//!
//! A frame-oriented concurrency runtime. Work is split into two
//! alternating phases; per-phase work-stealing queues guarantee that a
//! task scheduled for a phase never runs until that phase's *next*
//! occurrence, so one phase's reads never observe the same phase's
//! writes mid-round. Alongside the scheduler runs a page-granular file
//! cache fed by an asynchronous read backend.
//!
//! ## Quick Start
//!
//! ```ignore
//! use lockstep::{Runtime, SchedulerConfig, Phase, Task};
//!
//! fn step(ctx: *mut core::ffi::c_void, tcx: &lockstep::TaskContext) {
//!     // one frame's worth of work
//! }
//!
//! fn main() {
//!     let mut runtime = Runtime::new(SchedulerConfig::default()).unwrap();
//!     runtime.block_on(|rt| {
//!         rt.push(Phase::Sim, Task::new(core::ptr::null_mut(), step)).unwrap();
//!     });
//! }
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Re-export core types
pub use lockstep_core::{
    BarrierMember, CoreError, CoreResult, Phase, PhaseBarrier, SpscRing, Task, TaskContext,
};

// Re-export kprint macros for debug logging
pub use lockstep_core::kprint::{
    init as init_logging, set_flush_enabled, set_log_level, LogLevel,
};
pub use lockstep_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};

// Re-export env utilities
pub use lockstep_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use lockstep_runtime::{
    BudgetReclaimer, CacheStatsSnapshot, FileCache, FileHandle, PageReclaimer, ReadRequest,
    Scheduler, SchedulerConfig, StopRequest,
};

use lockstep_runtime::io::ReadBackend;

/// Owning handle over a scheduler and its streaming cache.
///
/// Wires the cache's completion pump into the scheduler's background
/// workers and runs the paired stop handshakes on shutdown: first the
/// cache drains its in-flight reads, then the scheduler drains its
/// queues, closes its mailbox, and joins the workers.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    cache: Arc<FileCache>,
    started: AtomicBool,
}

impl Runtime {
    /// Build a runtime over the platform io backend.
    #[cfg(target_os = "linux")]
    pub fn new(config: SchedulerConfig) -> CoreResult<Self> {
        let backend = lockstep_runtime::io::UringBackend::new(config.io_entries)?;
        Self::with_backend(config, Box::new(backend))
    }

    /// Build a runtime over a caller-supplied io backend.
    pub fn with_backend(
        config: SchedulerConfig,
        backend: Box<dyn ReadBackend>,
    ) -> CoreResult<Self> {
        let reclaimer = Arc::new(BudgetReclaimer::new(config.page_budget));
        let cache = Arc::new(FileCache::new(backend, reclaimer));
        let scheduler = Scheduler::new(config)?;
        let pump_cache = Arc::clone(&cache);
        scheduler.set_io_pump(Arc::new(move |timeout| pump_cache.pump(timeout)))?;
        Ok(Self {
            scheduler,
            cache,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyInitialized);
        }
        self.scheduler.start()
    }

    /// Run `f` with the scheduler active, then shut down.
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce(&Runtime) -> T,
    {
        let _ = self.start();
        let result = f(self);
        self.shutdown();
        result
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    /// Queue a task for the next occurrence of `phase`.
    pub fn push(&self, phase: Phase, task: Task) -> CoreResult<()> {
        self.scheduler.push(phase, task)
    }

    /// Queue a phase-independent background task.
    pub fn push_background(&self, task: Task) {
        self.scheduler.push_background(task)
    }

    /// Start (or join) a cached streaming read.
    pub fn read(&self, request: NonNull<ReadRequest>) -> CoreResult<()> {
        self.cache.read(request)
    }

    /// Release a completed read's reference on its cached pages.
    pub fn discard(&self, request: NonNull<ReadRequest>) {
        self.cache.discard(request)
    }

    /// Graceful shutdown: drain the cache, then the scheduler.
    pub fn shutdown(&mut self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let cache_stop = Box::new(StopRequest::noop());
        if self.cache.stop(NonNull::from(&*cache_stop)).is_ok() {
            while !cache_stop.has_fired() {
                self.cache.pump(Some(Duration::from_millis(1)));
            }
        }
        let sched_stop = Box::new(StopRequest::noop());
        if self.scheduler.request_stop(NonNull::from(&*sched_stop)).is_ok() {
            self.scheduler.join();
            debug_assert!(sched_stop.has_fired());
        } else {
            self.scheduler.shutdown();
            self.scheduler.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ffi::c_void;
    use lockstep_runtime::io::MockBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn test_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.num_workers = 3;
        config.num_background_workers = 1;
        config.idle_spins = 4;
        config.idle_sleep = Duration::from_micros(50);
        config
    }

    fn mock_runtime(contents: Vec<u8>) -> Runtime {
        let mut backend = MockBackend::new();
        backend.register_file(7, contents);
        Runtime::with_backend(test_config(), Box::new(backend)).unwrap()
    }

    fn bump(ctx: *mut c_void, _tcx: &TaskContext) {
        let counter = unsafe { &*(ctx as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_block_on_runs_tasks_and_stops() {
        let mut runtime = mock_runtime(Vec::new());
        let counter = Box::leak(Box::new(AtomicUsize::new(0)));
        runtime.block_on(|rt| {
            for _ in 0..10 {
                rt.push(
                    Phase::Sim,
                    Task::new(counter as *const AtomicUsize as *mut c_void, bump),
                )
                .unwrap();
            }
            let start = Instant::now();
            while counter.load(Ordering::SeqCst) < 10 {
                assert!(start.elapsed() < Duration::from_secs(10));
                std::thread::yield_now();
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_streaming_read_completes_via_background_pump() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let mut runtime = mock_runtime(data.clone());
        runtime.block_on(|rt| {
            let request = Box::leak(Box::new(ReadRequest::new(7, 16, 64)));
            rt.read(NonNull::from(&*request)).unwrap();
            let start = Instant::now();
            while !request.is_complete() {
                assert!(start.elapsed() < Duration::from_secs(10));
                std::thread::yield_now();
            }
            assert_eq!(request.result(), 64);
            let got = unsafe { std::slice::from_raw_parts(request.data(), 64) };
            assert_eq!(got, &data[16..80]);
            rt.discard(NonNull::from(&*request));
        });
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut runtime = mock_runtime(Vec::new());
        runtime.start().unwrap();
        runtime.shutdown();
        runtime.shutdown();
    }
}
