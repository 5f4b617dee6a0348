//! Intrusive singly-linked node
//!
//! The forwarding pointer for anything that travels through the intrusive
//! MPSC queues lives inside the payload object itself, so enqueuing never
//! allocates. Exactly one queue may own a node's `next` field at a time;
//! enqueuing the same node into two queues concurrently is a protocol
//! violation, caught by debug assertions.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::ptr::NonNull;

/// Address of the tag pointer marking a node that is in no queue.
pub(crate) const UNLINKED_ADDR: usize = 1;

/// Tag pointer marking a node that is in no queue. Never dereferenced.
pub(crate) const UNLINKED: *mut LinkNode = UNLINKED_ADDR as *mut LinkNode;

/// Intrusive singly-linked node.
///
/// Embed as the **first** field of a `#[repr(C)]` struct and implement
/// [`Linked`] for that struct.
pub struct LinkNode {
    pub(crate) next: AtomicPtr<LinkNode>,
}

impl LinkNode {
    /// A fresh, unqueued node.
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(UNLINKED),
        }
    }

    /// True if the node is not currently in any queue.
    #[inline]
    pub fn is_unlinked(&self) -> bool {
        self.next.load(Ordering::Relaxed) == UNLINKED
    }

    /// Point this node at `next`. The caller must own the node's queue
    /// position.
    #[inline]
    pub fn set_next(&self, next: *mut LinkNode) {
        self.next.store(next, Ordering::Relaxed);
    }

    /// Detach the node's forward pointer, returning it to the unlinked
    /// state.
    #[inline]
    pub fn take_next(&self) -> *mut LinkNode {
        let next = self.next.load(Ordering::Relaxed);
        self.next.store(UNLINKED, Ordering::Relaxed);
        next
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut LinkNode {
        self as *const LinkNode as *mut LinkNode
    }
}

impl Default for LinkNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that embed a [`LinkNode`] and can travel through intrusive queues.
///
/// # Safety
///
/// The `LinkNode` returned by `link()` must be the first field of `Self`,
/// and `Self` must be `#[repr(C)]`, so a pointer to the link is a pointer
/// to the whole object.
pub unsafe trait Linked {
    fn link(&self) -> &LinkNode;
}

/// Recover the owning object from its embedded link pointer.
///
/// # Safety
///
/// `ptr` must point at the `LinkNode` embedded at the start of a live `T`.
#[inline]
pub(crate) unsafe fn owner_of<T: Linked>(ptr: *mut LinkNode) -> NonNull<T> {
    debug_assert!(!ptr.is_null() && ptr != UNLINKED);
    NonNull::new_unchecked(ptr as *mut T)
}

/// Null chain terminator helper.
#[inline]
pub(crate) const fn chain_end() -> *mut LinkNode {
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        link: LinkNode,
        value: u32,
    }

    unsafe impl Linked for Node {
        fn link(&self) -> &LinkNode {
            &self.link
        }
    }

    #[test]
    fn test_new_is_unlinked() {
        let n = Node {
            link: LinkNode::new(),
            value: 9,
        };
        assert!(n.link.is_unlinked());
    }

    #[test]
    fn test_owner_recovery() {
        let mut n = Node {
            link: LinkNode::new(),
            value: 17,
        };
        let link_ptr = n.link.as_ptr();
        let _ = &mut n;
        let owner: NonNull<Node> = unsafe { owner_of(link_ptr) };
        assert_eq!(unsafe { owner.as_ref() }.value, 17);
    }
}
