//! Worker thread management
//!
//! Workers are OS threads that run the phased scheduler loop. The last
//! `num_background_workers` of them are background-capable: they may
//! detach from the phase barrier to serve background tasks and the io
//! pump while the rest keep the phases turning.

use std::thread::{self, JoinHandle};

use lockstep_core::constants::MAX_WORKERS;
use lockstep_core::error::{CoreError, CoreResult, WorkerError};

/// Pool of scheduler worker threads.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    num_workers: usize,
    num_background_workers: usize,
}

impl WorkerPool {
    pub fn new(num_workers: usize, num_background_workers: usize) -> Self {
        debug_assert!(num_workers <= MAX_WORKERS);
        Self {
            handles: Vec::with_capacity(num_workers),
            num_workers,
            num_background_workers,
        }
    }

    /// Spawn all worker threads. `worker_fn(worker_id, background_capable)`
    /// runs on each.
    pub fn start<F>(&mut self, worker_fn: F) -> CoreResult<()>
    where
        F: Fn(usize, bool) + Send + Sync + Clone + 'static,
    {
        for i in 0..self.num_workers {
            let background_capable = i >= self.num_workers - self.num_background_workers;
            let worker_fn = worker_fn.clone();
            let handle = thread::Builder::new()
                .name(format!("lockstep-worker-{}", i))
                .spawn(move || {
                    set_current_worker_id(i);
                    worker_fn(i, background_capable);
                    clear_current_worker_id();
                })
                .map_err(|_| CoreError::Worker(WorkerError::SpawnFailed))?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Wait for all workers to finish. A worker panic is fatal and is
    /// re-raised on the joining thread.
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                std::panic::resume_unwind(payload);
            }
        }
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }
}

thread_local! {
    static CURRENT_WORKER_ID: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
    static CURRENT_WORKER_DETACHED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

pub(crate) fn set_current_worker_id(id: usize) {
    CURRENT_WORKER_ID.with(|cell| cell.set(id));
    lockstep_core::kprint::set_worker_id(id as u32);
}

pub(crate) fn clear_current_worker_id() {
    CURRENT_WORKER_ID.with(|cell| cell.set(usize::MAX));
    lockstep_core::kprint::clear_worker_id();
}

/// Worker id of the calling thread, or `usize::MAX` off the pool.
#[inline]
pub fn current_worker_id() -> usize {
    CURRENT_WORKER_ID.with(|cell| cell.get())
}

/// True if the calling thread is a pool worker.
#[inline]
pub fn on_worker_thread() -> bool {
    current_worker_id() != usize::MAX
}

/// Marks the calling worker as detached from the phase barrier. A detached
/// worker does not own its queues: rounds flip without it, so its shard may
/// be drained or left with a steal sentinel at any time.
pub(crate) fn set_worker_detached(detached: bool) {
    CURRENT_WORKER_DETACHED.with(|cell| cell.set(detached));
}

#[inline]
pub(crate) fn current_worker_detached() -> bool {
    CURRENT_WORKER_DETACHED.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_runs_every_worker() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(4, 1);
        let seen_clone = Arc::clone(&seen);
        pool.start(move |id, background| {
            assert_eq!(current_worker_id(), id);
            assert_eq!(background, id == 3);
            seen_clone.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        pool.join();
        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_off_pool_thread_has_no_id() {
        assert!(!on_worker_thread());
    }
}
