//! Work-stealing task queue
//!
//! A growable array of [`Task`] slots with a single signed end index. The
//! scheduler's phase protocol guarantees that pushes target a queue nobody
//! is stealing from (tasks for a phase are pushed to that phase's *next*
//! parity shard), so the owner publishes with a plain slot write followed
//! by a release store of the end index.
//!
//! Stealing is `fetch_sub(1)` from the top: any thread may steal, and when
//! several race past empty the index goes negative and every loser gets
//! `None`. The queue reads as invalid until the owner repairs it with
//! [`StealQueue::reset_if_invalid`] at the next phase flip, before the
//! shard becomes a push target again.
//!
//! Growing allocates a doubled buffer, copies the live slots, and retires
//! the old buffer without freeing it. `Task` is `Copy`, so a stealer that
//! raced the grow reads a stale but valid task from the retired buffer.
//! Retired buffers are freed when the queue is dropped.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};

use crate::constants::DEFAULT_STEAL_CAPACITY;
use crate::task::Task;

pub struct StealQueue {
    /// One past the last live slot. Negative after contended-empty steals.
    end: AtomicIsize,
    buf: AtomicPtr<Task>,
    cap: AtomicUsize,
    /// Buffers superseded by grows, kept alive for racing stealers.
    /// Owner-only.
    retired: UnsafeCell<Vec<(*mut Task, usize)>>,
}

unsafe impl Send for StealQueue {}
unsafe impl Sync for StealQueue {}

fn alloc_buf(cap: usize) -> *mut Task {
    let boxed = vec![Task::noop(); cap].into_boxed_slice();
    Box::into_raw(boxed) as *mut Task
}

unsafe fn free_buf(ptr: *mut Task, cap: usize) {
    let slice = core::ptr::slice_from_raw_parts_mut(ptr, cap);
    drop(Box::from_raw(slice));
}

impl StealQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STEAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            end: AtomicIsize::new(0),
            buf: AtomicPtr::new(alloc_buf(capacity)),
            cap: AtomicUsize::new(capacity),
            retired: UnsafeCell::new(Vec::new()),
        }
    }

    /// Number of live tasks. A contended-empty queue reads as zero.
    pub fn len(&self) -> usize {
        self.end.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Relaxed)
    }

    /// Owner-only. The queue must not be a steal target while pushed into.
    pub fn push(&self, task: Task) {
        let end = self.end.load(Ordering::Relaxed);
        debug_assert!(end >= 0, "push into an unrepaired contended-empty queue");
        let idx = end as usize;
        let cap = self.cap.load(Ordering::Relaxed);
        if idx == cap {
            self.grow(cap);
        }
        let buf = self.buf.load(Ordering::Relaxed);
        unsafe {
            buf.add(idx).write(task);
        }
        self.end.store(end + 1, Ordering::Release);
    }

    /// Take the top task. Any thread. Under contention past empty the end
    /// index is left negative and the queue yields `None` until repaired.
    pub fn steal(&self) -> Option<Task> {
        let pre = self.end.fetch_sub(1, Ordering::AcqRel);
        if pre <= 0 {
            return None;
        }
        let buf = self.buf.load(Ordering::Acquire);
        Some(unsafe { buf.add(pre as usize - 1).read() })
    }

    /// Owner-only. Discard all tasks.
    pub fn reset(&self) {
        self.end.store(0, Ordering::Relaxed);
    }

    /// Owner-only. Repair the negative end index left by racing stealers
    /// that all found the queue empty. Must run before the queue becomes a
    /// push target again.
    pub fn reset_if_invalid(&self) {
        if self.end.load(Ordering::Relaxed) < 0 {
            self.end.store(0, Ordering::Relaxed);
        }
    }

    fn grow(&self, old_cap: usize) {
        let new_cap = old_cap * 2;
        let old = self.buf.load(Ordering::Relaxed);
        let new = alloc_buf(new_cap);
        // Stealers only read slots, so copying alongside them is safe.
        unsafe {
            core::ptr::copy_nonoverlapping(old, new, old_cap);
            (*self.retired.get()).push((old, old_cap));
        }
        self.buf.store(new, Ordering::Release);
        self.cap.store(new_cap, Ordering::Release);
    }
}

impl Default for StealQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StealQueue {
    fn drop(&mut self) {
        unsafe {
            let cap = self.cap.load(Ordering::Relaxed);
            free_buf(self.buf.load(Ordering::Relaxed), cap);
            for (ptr, cap) in (*self.retired.get()).drain(..) {
                free_buf(ptr, cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskContext;
    use core::ffi::c_void;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;

    fn tagged(tag: usize) -> Task {
        fn noop_fn(_ctx: *mut c_void, _tcx: &TaskContext) {}
        Task::new(tag as *mut c_void, noop_fn)
    }

    fn tag_of(task: &Task) -> usize {
        task.context() as usize
    }

    #[test]
    fn test_lifo_single_thread() {
        let q = StealQueue::with_capacity(4);
        for v in 1..=3 {
            q.push(tagged(v));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(tag_of(&q.steal().unwrap()), 3);
        assert_eq!(tag_of(&q.steal().unwrap()), 2);
        assert_eq!(tag_of(&q.steal().unwrap()), 1);
        assert!(q.steal().is_none());
    }

    #[test]
    fn test_contended_empty_leaves_invalid() {
        let q = StealQueue::with_capacity(4);
        assert!(q.steal().is_none());
        assert!(q.steal().is_none());
        // Two failed steals drove end to -2; push is illegal until repair.
        assert_eq!(q.len(), 0);
        q.reset_if_invalid();
        q.push(tagged(7));
        assert_eq!(tag_of(&q.steal().unwrap()), 7);
    }

    #[test]
    fn test_grow_preserves_tasks() {
        let q = StealQueue::with_capacity(2);
        for v in 1..=40 {
            q.push(tagged(v));
        }
        assert!(q.capacity() >= 40);
        let mut seen = Vec::new();
        while let Some(t) = q.steal() {
            seen.push(tag_of(&t));
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=40).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_steal_multiset() {
        // Rounds of: owner fills the queue, then owner and stealers race
        // to drain it. Across all rounds every pushed tag must be taken
        // exactly once.
        let q = Arc::new(StealQueue::with_capacity(8));
        let taken: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let rounds = 50usize;
        let per_round = 64usize;
        let stealers = 3usize;
        let gate = Arc::new(Barrier::new(stealers + 1));
        let live = Arc::new(StdAtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..stealers {
            let q = Arc::clone(&q);
            let taken = Arc::clone(&taken);
            let gate = Arc::clone(&gate);
            let live = Arc::clone(&live);
            handles.push(thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..rounds {
                    gate.wait();
                    loop {
                        match q.steal() {
                            Some(t) => {
                                mine.push(tag_of(&t));
                                live.fetch_sub(1, Ordering::AcqRel);
                            }
                            None => {
                                if live.load(Ordering::Acquire) == 0 {
                                    break;
                                }
                                thread::yield_now();
                            }
                        }
                    }
                    gate.wait();
                }
                taken.lock().unwrap().extend(mine);
            }));
        }

        let mut owner_taken = Vec::new();
        for round in 0..rounds {
            for i in 0..per_round {
                q.push(tagged(round * per_round + i + 1));
            }
            live.store(per_round, Ordering::Release);
            gate.wait();
            loop {
                match q.steal() {
                    Some(t) => {
                        owner_taken.push(tag_of(&t));
                        live.fetch_sub(1, Ordering::AcqRel);
                    }
                    None => {
                        if live.load(Ordering::Acquire) == 0 {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            gate.wait();
            q.reset_if_invalid();
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut all = taken.lock().unwrap().clone();
        all.extend(owner_taken);
        all.sort_unstable();
        assert_eq!(all, (1..=rounds * per_round).collect::<Vec<_>>());
    }
}
