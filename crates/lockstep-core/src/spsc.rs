//! Bounded single-producer single-consumer ring
//!
//! Wait-free handoff between exactly one producer thread and one consumer
//! thread. The producer owns the write cursor, the consumer owns the read
//! cursor, and each publishes with a release store the other reads with an
//! acquire load. Cursors live on separate cache lines.
//!
//! Capacity is a hard bound: `push` fails when the ring is full rather
//! than blocking or reallocating.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::constants::CACHE_LINE_SIZE;

#[repr(align(64))]
struct Cursor(AtomicUsize);

const _: () = assert!(core::mem::align_of::<Cursor>() == CACHE_LINE_SIZE);

pub struct SpscRing<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to read. Consumer-owned, monotonically increasing.
    head: Cursor,
    /// Next slot to write. Producer-owned, monotonically increasing.
    tail: Cursor,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// `capacity` must be non-zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "spsc ring needs a non-zero capacity");
        let mut buf = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buf.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            buf: buf.into_boxed_slice(),
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer-side. Returns the value back on a full ring.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == self.buf.len() {
            return Err(value);
        }
        let slot = self.buf[tail % self.buf.len()].get();
        unsafe {
            (*slot).write(value);
        }
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer-side.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = self.buf[head % self.buf.len()].get();
        let value = unsafe { (*slot).assume_init_read() };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        let mut i = head;
        while i != tail {
            let slot = self.buf[i % self.buf.len()].get();
            unsafe {
                (*slot).assume_init_drop();
            }
            i = i.wrapping_add(1);
        }
    }
}
