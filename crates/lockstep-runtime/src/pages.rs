//! Page regions and the page reclaimer
//!
//! A [`PageRegion`] is an anonymous, page-aligned mmap owned by a cache
//! entry. When an entry's refcount drops to zero its pages are *offered*
//! to a [`PageReclaimer`] instead of being freed: the kernel may take
//! them back, but until it does a re-read can reclaim the contents
//! without touching the disk.
//!
//! [`BudgetReclaimer`] is the default policy. Offered spans queue up to a
//! byte budget; beyond it the oldest spans are released to the OS with
//! `madvise(MADV_DONTNEED)` and marked lost. Whether a reclaim finds the
//! contents intact is therefore an explicit, deterministic property of
//! the budget rather than of kernel memory pressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use lockstep_core::error::{CoreError, CoreResult, MemoryError};
use lockstep_core::kwarn;
use lockstep_core::spinlock::SpinLock;

/// OS page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 {
            4096
        } else {
            sz as usize
        }
    })
}

#[inline]
pub fn page_round_down(v: u64) -> u64 {
    v & !(page_size() as u64 - 1)
}

#[inline]
pub fn page_round_up(v: u64) -> u64 {
    let mask = page_size() as u64 - 1;
    (v + mask) & !mask
}

/// An anonymous page-aligned mapping.
pub struct PageRegion {
    addr: *mut u8,
    len: usize,
}

unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Map `len` bytes of anonymous memory. `len` must be page-aligned
    /// and non-zero.
    pub fn alloc(len: usize) -> CoreResult<Self> {
        if len == 0 || len % page_size() != 0 {
            return Err(CoreError::Memory(MemoryError::InvalidLength));
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CoreError::Memory(MemoryError::AllocationFailed));
        }
        Ok(Self {
            addr: addr as *mut u8,
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole mapping as a reclaimer span.
    #[inline]
    pub fn span(&self) -> PageSpan {
        PageSpan {
            addr: self.addr as usize,
            len: self.len,
        }
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.addr as *mut libc::c_void, self.len) };
        if ret != 0 {
            kwarn!("munmap({:p}, {}) failed", self.addr, self.len);
        }
    }
}

/// A page-aligned address range, detached from its owning region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    pub addr: usize,
    pub len: usize,
}

/// Whether reclaimed pages still hold their contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// The span was never released; contents are valid.
    Intact,
    /// The span's pages went back to the OS; contents are gone.
    Lost,
}

/// Policy deciding when offered pages are released to the OS.
///
/// The cache offers a span when an entry's refcount drops to zero,
/// reclaims it when the entry is read again, and forgets it when the
/// entry is destroyed while offered.
pub trait PageReclaimer: Send + Sync {
    /// Hand over an unreferenced span. Offering a span already held is
    /// a no-op.
    fn offer(&self, span: PageSpan);

    /// Take a span back for reuse. [`ReclaimOutcome::Intact`] only if
    /// the span was offered and never released in between.
    fn reclaim(&self, span: PageSpan) -> ReclaimOutcome;

    /// Drop all bookkeeping for a span whose mapping is going away.
    fn forget(&self, span: PageSpan);
}

struct ReclaimState {
    /// Offered spans, oldest first.
    held: Vec<PageSpan>,
    held_bytes: usize,
    /// Addresses whose pages were released while offered.
    lost: Vec<usize>,
    /// Addresses reclaimed before their offer arrived; the in-flight
    /// offer must be dropped, the span is live again.
    vetoed: Vec<usize>,
}

/// LRU byte-budget reclaimer.
pub struct BudgetReclaimer {
    state: SpinLock<ReclaimState>,
    budget: usize,
    evicted_bytes: AtomicUsize,
}

impl BudgetReclaimer {
    pub fn new(budget: usize) -> Self {
        Self {
            state: SpinLock::new(ReclaimState {
                held: Vec::new(),
                held_bytes: 0,
                lost: Vec::new(),
                vetoed: Vec::new(),
            }),
            budget,
            evicted_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes released to the OS so far.
    pub fn evicted_bytes(&self) -> usize {
        self.evicted_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently held under the budget.
    pub fn held_bytes(&self) -> usize {
        self.state.lock().held_bytes
    }
}

impl PageReclaimer for BudgetReclaimer {
    fn offer(&self, span: PageSpan) {
        let mut evicted = Vec::new();
        {
            let mut st = self.state.lock();
            if let Some(pos) = st.vetoed.iter().position(|&a| a == span.addr) {
                // The span was reclaimed back before this offer landed.
                st.vetoed.swap_remove(pos);
                return;
            }
            if st.held.iter().any(|s| s.addr == span.addr) {
                return;
            }
            st.lost.retain(|&a| a != span.addr);
            st.held.push(span);
            st.held_bytes += span.len;
            while st.held_bytes > self.budget && st.held.len() > 1 {
                let oldest = st.held.remove(0);
                st.held_bytes -= oldest.len;
                st.lost.push(oldest.addr);
                evicted.push(oldest);
            }
            // A single span over the whole budget is released too.
            if st.held_bytes > self.budget {
                let only = st.held.remove(0);
                st.held_bytes -= only.len;
                st.lost.push(only.addr);
                evicted.push(only);
            }
        }
        // madvise outside the lock; the spans are off the held list so
        // no reclaim can hand them out concurrently.
        for span in evicted {
            let ret = unsafe {
                libc::madvise(
                    span.addr as *mut libc::c_void,
                    span.len,
                    libc::MADV_DONTNEED,
                )
            };
            if ret != 0 {
                kwarn!("madvise(DONTNEED, {:#x}, {}) failed", span.addr, span.len);
            }
            self.evicted_bytes.fetch_add(span.len, Ordering::Relaxed);
        }
    }

    fn reclaim(&self, span: PageSpan) -> ReclaimOutcome {
        let mut st = self.state.lock();
        if let Some(pos) = st.held.iter().position(|s| s.addr == span.addr) {
            let held = st.held.remove(pos);
            st.held_bytes -= held.len;
            return ReclaimOutcome::Intact;
        }
        if let Some(pos) = st.lost.iter().position(|&a| a == span.addr) {
            st.lost.swap_remove(pos);
        } else {
            // Offer still in flight; make sure it does not land.
            st.vetoed.push(span.addr);
        }
        ReclaimOutcome::Lost
    }

    fn forget(&self, span: PageSpan) {
        let mut st = self.state.lock();
        if let Some(pos) = st.held.iter().position(|s| s.addr == span.addr) {
            let held = st.held.remove(pos);
            st.held_bytes -= held.len;
        }
        st.lost.retain(|&a| a != span.addr);
        st.vetoed.retain(|&a| a != span.addr);
    }
}
