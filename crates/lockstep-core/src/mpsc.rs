//! Intrusive multi-producer single-consumer queues
//!
//! Two flavors built on [`LinkNode`]:
//!
//! * [`Mailbox`]: a Treiber-style stack of pending items. Producers push
//!   lock-free, the consumer takes the whole pending chain in one swap.
//!   Drain order is unspecified.
//! * [`ActorQueue`]: the same incoming stack plus a consumer-owned local
//!   chain that preserves FIFO order, and a `stop()` handshake that closes
//!   the queue only if it was observed empty. A racing push wins over a
//!   racing stop, so no item is ever silently dropped.
//!
//! Neither queue owns its nodes. The caller keeps nodes alive while queued
//! and reclaims them after dequeue.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::ptr::NonNull;

use crate::link::{chain_end, owner_of, LinkNode, Linked, UNLINKED_ADDR};

/// Address of the tag pointer marking a closed queue head. Distinct from
/// the unlinked tag so a stopped head can never read as a free node.
const STOPPED_ADDR: usize = 2;
const _: () = assert!(STOPPED_ADDR != UNLINKED_ADDR);

/// Tag pointer marking a closed queue head. Never dereferenced.
const STOPPED: *mut LinkNode = STOPPED_ADDR as *mut LinkNode;

/// Lock-free multi-producer mailbox. The consumer drains everything at once.
pub struct Mailbox<T: Linked> {
    head: AtomicPtr<LinkNode>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Linked + Send> Send for Mailbox<T> {}
unsafe impl<T: Linked + Send> Sync for Mailbox<T> {}

impl<T: Linked> Mailbox<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Push a node. The node must stay alive until it is drained.
    pub fn push(&self, node: NonNull<T>) {
        let link = unsafe { node.as_ref() }.link();
        debug_assert!(link.is_unlinked(), "node already queued");
        let raw = link.as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.set_next(head);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Take the entire pending chain. Order is unspecified.
    pub fn drain_all(&self) -> MailboxDrain<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        MailboxDrain {
            cur: head,
            _marker: PhantomData,
        }
    }
}

pub struct MailboxDrain<T: Linked> {
    cur: *mut LinkNode,
    _marker: PhantomData<*mut T>,
}

impl<T: Linked> Iterator for MailboxDrain<T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        if self.cur.is_null() {
            return None;
        }
        let link = self.cur;
        unsafe {
            self.cur = (*link).take_next();
            Some(owner_of(link))
        }
    }
}

/// Intrusive MPSC queue with FIFO pop and a close handshake.
///
/// `pop_one` and `stop` are consumer-side operations. Exactly one thread
/// may act as the consumer at a time; producers are unrestricted.
pub struct ActorQueue<T: Linked> {
    head: AtomicPtr<LinkNode>,
    /// Dequeued chain in FIFO order. Consumer-owned.
    local: UnsafeCell<*mut LinkNode>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T: Linked + Send> Send for ActorQueue<T> {}
unsafe impl<T: Linked + Send> Sync for ActorQueue<T> {}

impl<T: Linked> ActorQueue<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            local: UnsafeCell::new(chain_end()),
            _marker: PhantomData,
        }
    }

    /// Push a node. Returns `false` if the queue has been stopped, in which
    /// case the node was not enqueued and ownership stays with the caller.
    pub fn push(&self, node: NonNull<T>) -> bool {
        let link = unsafe { node.as_ref() }.link();
        debug_assert!(link.is_unlinked(), "node already queued");
        let raw = link.as_ptr();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == STOPPED {
                return false;
            }
            link.set_next(head);
            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        }
    }

    /// Pop the oldest item, refilling the local chain from the incoming
    /// stack when it runs dry. Consumer-side.
    pub fn pop_one(&self) -> Option<NonNull<T>> {
        unsafe {
            let local = &mut *self.local.get();
            if (*local).is_null() {
                let head = self.head.load(Ordering::Acquire);
                if head.is_null() || head == STOPPED {
                    return None;
                }
                // Only the consumer stores null here, so the swap cannot
                // clobber a STOPPED head.
                let mut chain = self.head.swap(ptr::null_mut(), Ordering::Acquire);
                // Incoming chain is LIFO. Reverse into FIFO.
                let mut rev = chain_end();
                while !chain.is_null() {
                    let next = (*chain).next.load(Ordering::Relaxed);
                    (*chain).set_next(rev);
                    rev = chain;
                    chain = next;
                }
                *local = rev;
            }
            let node = *local;
            if node.is_null() {
                return None;
            }
            *local = (*node).take_next();
            Some(owner_of(node))
        }
    }

    /// Close the queue, but only if both the incoming stack and the local
    /// chain were observed empty. Returns `false` if a racing push beat the
    /// close. Consumer-side.
    pub fn stop(&self) -> bool {
        if unsafe { !(*self.local.get()).is_null() } {
            return false;
        }
        self.head
            .compare_exchange(
                ptr::null_mut(),
                STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.head.load(Ordering::Acquire) == STOPPED
    }

    /// True if nothing is queued. A stopped queue reads as empty.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        (head.is_null() || head == STOPPED) && unsafe { (*self.local.get()).is_null() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    struct Msg {
        link: LinkNode,
        value: usize,
    }

    unsafe impl Linked for Msg {
        fn link(&self) -> &LinkNode {
            &self.link
        }
    }

    fn msg(value: usize) -> NonNull<Msg> {
        NonNull::new(Box::into_raw(Box::new(Msg {
            link: LinkNode::new(),
            value,
        })))
        .unwrap()
    }

    unsafe fn reclaim(node: NonNull<Msg>) -> usize {
        let boxed = Box::from_raw(node.as_ptr());
        boxed.value
    }

    #[test]
    fn test_mailbox_drains_everything() {
        let mb: Mailbox<Msg> = Mailbox::new();
        for v in 0..8 {
            mb.push(msg(v));
        }
        assert!(!mb.is_empty());
        let mut seen: Vec<usize> = mb.drain_all().map(|n| unsafe { reclaim(n) }).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert!(mb.is_empty());
    }

    #[test]
    fn test_mailbox_concurrent_push() {
        let mb: Arc<Mailbox<Msg>> = Arc::new(Mailbox::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let mb = Arc::clone(&mb);
            handles.push(thread::spawn(move || {
                for i in 0..256 {
                    mb.push(msg(t * 1000 + i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let count = mb.drain_all().map(|n| unsafe { reclaim(n) }).count();
        assert_eq!(count, 4 * 256);
    }

    #[test]
    fn test_actor_queue_fifo_order() {
        let q: ActorQueue<Msg> = ActorQueue::new();
        for v in 0..5 {
            assert!(q.push(msg(v)));
        }
        for expect in 0..5 {
            let node = q.pop_one().unwrap();
            assert_eq!(unsafe { reclaim(node) }, expect);
        }
        assert!(q.pop_one().is_none());
    }

    #[test]
    fn test_actor_queue_fifo_across_refills() {
        let q: ActorQueue<Msg> = ActorQueue::new();
        assert!(q.push(msg(0)));
        assert!(q.push(msg(1)));
        assert_eq!(unsafe { reclaim(q.pop_one().unwrap()) }, 0);
        // New arrivals land behind the already-dequeued chain.
        assert!(q.push(msg(2)));
        assert_eq!(unsafe { reclaim(q.pop_one().unwrap()) }, 1);
        assert_eq!(unsafe { reclaim(q.pop_one().unwrap()) }, 2);
    }

    #[test]
    fn test_stop_only_when_empty() {
        let q: ActorQueue<Msg> = ActorQueue::new();
        assert!(q.push(msg(1)));
        assert!(!q.stop());
        let node = q.pop_one().unwrap();
        unsafe {
            reclaim(node);
        }
        assert!(q.stop());
        assert!(q.is_stopped());
        // Push after stop fails and hands the node back.
        let n = msg(2);
        assert!(!q.push(n));
        unsafe {
            reclaim(n);
        }
    }

    #[test]
    fn test_stop_race_with_pushers() {
        // Consumer repeatedly tries to quiesce while producers keep pushing.
        // Every pushed item must either be popped or be refused by a
        // stopped queue; none may vanish.
        let q: Arc<ActorQueue<Msg>> = Arc::new(ActorQueue::new());
        let total = 2000usize;
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut refused = 0usize;
                for v in 0..total {
                    let n = msg(v);
                    if !q.push(n) {
                        unsafe {
                            reclaim(n);
                        }
                        refused += 1;
                    }
                }
                refused
            })
        };
        let mut popped = 0usize;
        loop {
            while let Some(n) = q.pop_one() {
                unsafe {
                    reclaim(n);
                }
                popped += 1;
            }
            if popped >= total / 2 && q.stop() {
                break;
            }
            thread::yield_now();
        }
        let refused = producer.join().unwrap();
        // Anything that slipped in between pop and stop was refused.
        assert_eq!(popped + refused, total);
    }
}
