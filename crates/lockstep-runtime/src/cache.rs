//! Page-granular streaming file cache
//!
//! Read ranges are rounded out to page boundaries and cached per
//! `(fd, rounded range)` in anonymous page regions. A request for a
//! range that is already loading joins the entry's waiter chain instead
//! of issuing a second device read; every waiter on an entry resolves to
//! a pointer into the same region, so identical ranges yield identical
//! pointers.
//!
//! Entries are refcounted. `discard` drops a reference; at zero the
//! entry's pages are offered to the [`PageReclaimer`] and the entry goes
//! dormant. A later read either reclaims the contents intact or, if the
//! reclaimer released the pages in between, reloads them into the same
//! region.
//!
//! The map lock is never held across an OS call: region allocation and
//! backend submission happen outside it, with the entry re-checked under
//! the lock afterwards. Completion tokens are the address of the driving
//! [`ReadRequest`]; a short read is re-issued at the corrected offset
//! until the region fills or the device reports end of file.

use core::cell::Cell;
use core::ffi::c_void;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lockstep_core::error::{CoreError, CoreResult, MemoryError};
use lockstep_core::kwarn;
use lockstep_core::link::{LinkNode, Linked};

use crate::io::{IoToken, ReadBackend, ReadCompletion};
use crate::pages::{page_round_down, page_round_up, PageRegion, PageReclaimer, ReclaimOutcome};
use crate::scheduler::StopRequest;

/// Page-rounded cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EntryKey {
    fd: RawFd,
    start: u64,
    end: u64,
}

impl EntryKey {
    const EMPTY: EntryKey = EntryKey {
        fd: -1,
        start: 0,
        end: 0,
    };

    #[inline]
    fn span_len(&self) -> u64 {
        self.end - self.start
    }
}

const READ_PENDING: u32 = 0;
const READ_DONE: u32 = 1;

/// A single-use streaming read. The caller allocates it, hands it to
/// [`FileCache::read`], and must keep it alive and in place until it
/// completes. `data()` stays valid until the matching `discard`.
#[repr(C)]
pub struct ReadRequest {
    link: LinkNode,
    state: AtomicU32,
    result: AtomicI64,
    data: AtomicPtr<u8>,
    fd: RawFd,
    offset: u64,
    len: u64,
    /// Written by the cache under its map lock.
    key: Cell<EntryKey>,
    on_complete: Option<fn(*mut c_void)>,
    context: *mut c_void,
}

unsafe impl Send for ReadRequest {}
unsafe impl Sync for ReadRequest {}

unsafe impl Linked for ReadRequest {
    fn link(&self) -> &LinkNode {
        &self.link
    }
}

impl ReadRequest {
    pub fn new(fd: RawFd, offset: u64, len: u64) -> Self {
        Self {
            link: LinkNode::new(),
            state: AtomicU32::new(READ_PENDING),
            result: AtomicI64::new(0),
            data: AtomicPtr::new(std::ptr::null_mut()),
            fd,
            offset,
            len,
            key: Cell::new(EntryKey::EMPTY),
            on_complete: None,
            context: std::ptr::null_mut(),
        }
    }

    /// `on_complete(context)` runs once when the request resolves, off
    /// the cache lock, on whichever thread pumped the completion.
    pub fn with_callback(
        fd: RawFd,
        offset: u64,
        len: u64,
        on_complete: fn(*mut c_void),
        context: *mut c_void,
    ) -> Self {
        Self {
            on_complete: Some(on_complete),
            context,
            ..Self::new(fd, offset, len)
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == READ_DONE
    }

    /// Bytes readable at `data()`, or a negative errno. Meaningful only
    /// once complete.
    #[inline]
    pub fn result(&self) -> i64 {
        self.result.load(Ordering::Acquire)
    }

    /// Pointer to the first requested byte inside the cached region.
    #[inline]
    pub fn data(&self) -> *const u8 {
        self.data.load(Ordering::Acquire)
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    fn complete(&self, data: *mut u8, result: i64) {
        debug_assert!(!self.is_complete(), "request completed twice");
        self.data.store(data, Ordering::Relaxed);
        self.result.store(result, Ordering::Relaxed);
        self.state.store(READ_DONE, Ordering::Release);
    }

    fn callback(&self) -> Option<(fn(*mut c_void), *mut c_void)> {
        self.on_complete.map(|f| (f, self.context))
    }
}

enum EntryState {
    /// A device read is in flight; requests chain up as waiters.
    Loading,
    Resident,
    /// Unreferenced; pages are in the reclaimer's hands.
    Offered,
}

struct CacheEntry {
    key: EntryKey,
    region: PageRegion,
    state: EntryState,
    refcount: u32,
    /// Bytes of the region holding file data (short at end of file).
    valid: u64,
    /// Loading progress across short-read retries.
    received: u64,
    /// The request whose address is the io correlation token.
    driver: *mut ReadRequest,
    /// Coalesced requests, chained through their link nodes.
    waiters: *mut LinkNode,
}

impl CacheEntry {
    fn push_waiter(&mut self, request: NonNull<ReadRequest>) {
        let link = unsafe { request.as_ref() }.link();
        debug_assert!(link.is_unlinked());
        link.set_next(self.waiters);
        self.waiters = link.as_ptr();
    }

    /// Unchain the driver and every waiter.
    fn take_requests(&mut self) -> Vec<*mut ReadRequest> {
        let mut out = Vec::new();
        if !self.driver.is_null() {
            out.push(self.driver);
            self.driver = std::ptr::null_mut();
        }
        let mut cur = self.waiters;
        self.waiters = std::ptr::null_mut();
        while !cur.is_null() {
            unsafe {
                let next = (*cur).take_next();
                out.push(cur as *mut ReadRequest);
                cur = next;
            }
        }
        out
    }
}

#[derive(Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    reclaims: AtomicU64,
    reloads: AtomicU64,
    /// Short reads reissued at a corrected offset.
    reissues: AtomicU64,
    completed_reads: AtomicU64,
    failed_reads: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub reclaims: u64,
    pub reloads: u64,
    pub reissues: u64,
    pub completed_reads: u64,
    pub failed_reads: u64,
}

type Callback = (fn(*mut c_void), *mut c_void);

/// What `read` decided to do once the map lock dropped.
enum ReadAction {
    Done,
    Alloc,
    Submit {
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: IoToken,
    },
}

pub struct FileCache {
    map: Mutex<HashMap<EntryKey, Box<CacheEntry>>>,
    backend: Mutex<Box<dyn ReadBackend>>,
    reclaimer: Arc<dyn PageReclaimer>,
    stats: CacheStats,
    in_flight: AtomicUsize,
    stopping: AtomicBool,
    stop_request: AtomicPtr<StopRequest>,
}

// Safety: the raw pointers inside entries (buffers, waiter chains, request
// handles) are only touched under the map mutex, and requests outlive their
// completion per the `read` contract.
unsafe impl Send for FileCache {}
unsafe impl Sync for FileCache {}

impl FileCache {
    pub fn new(backend: Box<dyn ReadBackend>, reclaimer: Arc<dyn PageReclaimer>) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            backend: Mutex::new(backend),
            reclaimer,
            stats: CacheStats::default(),
            in_flight: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            stop_request: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<EntryKey, Box<CacheEntry>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start (or join) a cached read. The request completes either
    /// inline, for resident data, or at a later [`pump`](Self::pump).
    pub fn read(&self, request: NonNull<ReadRequest>) -> CoreResult<()> {
        let req = unsafe { request.as_ref() };
        if self.stopping.load(Ordering::Acquire) {
            return Err(CoreError::Stopped);
        }
        if req.len == 0 {
            return Err(CoreError::Memory(MemoryError::InvalidLength));
        }
        debug_assert!(!req.is_complete(), "request reused without reset");
        let key = EntryKey {
            fd: req.fd,
            start: page_round_down(req.offset),
            end: page_round_up(req.offset + req.len),
        };
        req.key.set(key);

        let mut prealloc: Option<PageRegion> = None;
        loop {
            let mut fire: Option<Callback> = None;
            let action = {
                let mut map = self.lock_map();
                match map.entry(key) {
                    MapEntry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        match entry.state {
                            EntryState::Loading => {
                                entry.refcount += 1;
                                entry.push_waiter(request);
                                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                                ReadAction::Done
                            }
                            EntryState::Resident => {
                                entry.refcount += 1;
                                fire = complete_against(entry, request.as_ptr());
                                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                                ReadAction::Done
                            }
                            EntryState::Offered => {
                                match self.reclaimer.reclaim(entry.region.span()) {
                                    ReclaimOutcome::Intact => {
                                        entry.state = EntryState::Resident;
                                        entry.refcount = 1;
                                        fire = complete_against(entry, request.as_ptr());
                                        self.stats.reclaims.fetch_add(1, Ordering::Relaxed);
                                        ReadAction::Done
                                    }
                                    ReclaimOutcome::Lost => {
                                        entry.state = EntryState::Loading;
                                        entry.refcount = 1;
                                        entry.received = 0;
                                        entry.valid = 0;
                                        entry.driver = request.as_ptr();
                                        self.stats.reloads.fetch_add(1, Ordering::Relaxed);
                                        self.in_flight.fetch_add(1, Ordering::AcqRel);
                                        ReadAction::Submit {
                                            buf: entry.region.as_ptr(),
                                            len: key.span_len() as u32,
                                            offset: key.start,
                                            token: request.as_ptr() as IoToken,
                                        }
                                    }
                                }
                            }
                        }
                    }
                    MapEntry::Vacant(vacant) => match prealloc.take() {
                        None => ReadAction::Alloc,
                        Some(region) => {
                            let buf = region.as_ptr();
                            vacant.insert(Box::new(CacheEntry {
                                key,
                                region,
                                state: EntryState::Loading,
                                refcount: 1,
                                valid: 0,
                                received: 0,
                                driver: request.as_ptr(),
                                waiters: std::ptr::null_mut(),
                            }));
                            self.stats.misses.fetch_add(1, Ordering::Relaxed);
                            self.in_flight.fetch_add(1, Ordering::AcqRel);
                            ReadAction::Submit {
                                buf,
                                len: key.span_len() as u32,
                                offset: key.start,
                                token: request.as_ptr() as IoToken,
                            }
                        }
                    },
                }
            };
            match action {
                ReadAction::Done => {
                    run_callback(fire);
                    return Ok(());
                }
                ReadAction::Alloc => {
                    // mmap outside the lock, then race to insert.
                    prealloc = Some(PageRegion::alloc(key.span_len() as usize)?);
                }
                ReadAction::Submit {
                    buf,
                    len,
                    offset,
                    token,
                } => {
                    if let Err(e) = self.submit(key.fd, buf, len, offset, token) {
                        self.fail_entry(key, -(libc::EIO as i64));
                        return Err(e);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Drop one reference. At zero the entry's pages are offered to the
    /// reclaimer.
    pub fn discard(&self, request: NonNull<ReadRequest>) {
        let key = unsafe { request.as_ref() }.key.get();
        let mut offer = None;
        {
            let mut map = self.lock_map();
            if let Some(entry) = map.get_mut(&key) {
                debug_assert!(entry.refcount > 0, "discard without a matching read");
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 && matches!(entry.state, EntryState::Resident) {
                    entry.state = EntryState::Offered;
                    offer = Some(entry.region.span());
                }
                // A zero refcount while loading is resolved at completion.
            }
        }
        if let Some(span) = offer {
            self.reclaimer.offer(span);
        }
    }

    /// Drive the backend: flush queued submissions and handle whatever
    /// completions are available. With a timeout this blocks until at
    /// least one arrives or the timeout lapses. Returns completions
    /// handled.
    pub fn pump(&self, timeout: Option<Duration>) -> usize {
        let mut completions = Vec::new();
        {
            let mut backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = backend.flush() {
                kwarn!("io flush failed: {}", e);
            }
            match timeout {
                Some(t) => backend.wait_completions(&mut completions, t),
                None => backend.poll_completions(&mut completions),
            };
        }
        let handled = completions.len();
        for completion in completions {
            self.handle_completion(completion);
        }
        handled
    }

    /// Begin the stop handshake. New reads are refused immediately; the
    /// request fires once the last in-flight completion has been pumped.
    pub fn stop(&self, request: NonNull<StopRequest>) -> CoreResult<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Stopped);
        }
        self.stop_request
            .store(request.as_ptr(), Ordering::Release);
        self.maybe_finish_stop();
        Ok(())
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            reclaims: self.stats.reclaims.load(Ordering::Relaxed),
            reloads: self.stats.reloads.load(Ordering::Relaxed),
            reissues: self.stats.reissues.load(Ordering::Relaxed),
            completed_reads: self.stats.completed_reads.load(Ordering::Relaxed),
            failed_reads: self.stats.failed_reads.load(Ordering::Relaxed),
        }
    }

    fn submit(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: IoToken,
    ) -> CoreResult<()> {
        let mut backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        backend.submit_read(fd, buf, len, offset, token)?;
        backend.flush()?;
        Ok(())
    }

    fn handle_completion(&self, completion: ReadCompletion) {
        let driver = completion.token as *mut ReadRequest;
        let mut resubmit = None;
        let mut callbacks: Vec<Callback> = Vec::new();
        let mut offer = None;
        {
            let mut map = self.lock_map();
            let key = unsafe { (*driver).key.get() };
            let Some(entry) = map.get_mut(&key) else {
                kwarn!("completion for unknown entry fd={} start={}", key.fd, key.start);
                return;
            };
            debug_assert!(matches!(entry.state, EntryState::Loading));
            debug_assert_eq!(entry.driver, driver);
            let needed = key.span_len();
            if completion.result < 0 {
                for req in entry.take_requests() {
                    let req = unsafe { &*req };
                    req.complete(std::ptr::null_mut(), completion.result);
                    if let Some(cb) = req.callback() {
                        callbacks.push(cb);
                    }
                }
                map.remove(&key);
                self.stats.failed_reads.fetch_add(1, Ordering::Relaxed);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            } else if completion.result > 0
                && entry.received + (completion.result as u64) < needed
            {
                // Short read: pick up where the device left off.
                entry.received += completion.result as u64;
                self.stats.reissues.fetch_add(1, Ordering::Relaxed);
                resubmit = Some((
                    key.fd,
                    unsafe { entry.region.as_ptr().add(entry.received as usize) },
                    (needed - entry.received) as u32,
                    key.start + entry.received,
                    completion.token,
                ));
            } else {
                entry.received += completion.result as u64;
                entry.valid = entry.received;
                entry.state = EntryState::Resident;
                for req in entry.take_requests() {
                    let req = unsafe { &*req };
                    if let Some(cb) = complete_against(entry, req as *const _ as *mut _) {
                        callbacks.push(cb);
                    }
                }
                self.stats.completed_reads.fetch_add(1, Ordering::Relaxed);
                if entry.refcount == 0 {
                    // Everyone discarded while we were loading.
                    entry.state = EntryState::Offered;
                    offer = Some(entry.region.span());
                }
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
        if let Some((fd, buf, len, offset, token)) = resubmit {
            if let Err(e) = self.submit(fd, buf, len, offset, token) {
                kwarn!("short-read resubmit failed: {}", e);
                self.fail_entry(unsafe { (*driver).key.get() }, -(libc::EIO as i64));
            }
            return;
        }
        for (f, ctx) in callbacks {
            f(ctx);
        }
        if let Some(span) = offer {
            self.reclaimer.offer(span);
        }
        self.maybe_finish_stop();
    }

    /// Complete everyone on an entry with an error and drop the entry.
    fn fail_entry(&self, key: EntryKey, result: i64) {
        let mut callbacks: Vec<Callback> = Vec::new();
        {
            let mut map = self.lock_map();
            let Some(mut entry) = map.remove(&key) else {
                return;
            };
            for req in entry.take_requests() {
                let req = unsafe { &*req };
                req.complete(std::ptr::null_mut(), result);
                if let Some(cb) = req.callback() {
                    callbacks.push(cb);
                }
            }
            self.stats.failed_reads.fetch_add(1, Ordering::Relaxed);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        for (f, ctx) in callbacks {
            f(ctx);
        }
        self.maybe_finish_stop();
    }

    fn maybe_finish_stop(&self) {
        if self.stopping.load(Ordering::Acquire) && self.in_flight.load(Ordering::Acquire) == 0 {
            let request = self.stop_request.load(Ordering::Acquire);
            if !request.is_null() {
                unsafe {
                    (*request).fire();
                }
            }
        }
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        let map = self.map.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in map.values_mut() {
            match entry.state {
                EntryState::Offered => self.reclaimer.forget(entry.region.span()),
                EntryState::Loading => {
                    for req in entry.take_requests() {
                        unsafe {
                            (*req).complete(std::ptr::null_mut(), -(libc::ECANCELED as i64));
                        }
                    }
                }
                EntryState::Resident => {}
            }
        }
        self.backend
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
    }
}

/// Resolve `request` against a resident entry: pointer into the region
/// at the requested offset, result clamped to the valid bytes.
fn complete_against(entry: &CacheEntry, request: *mut ReadRequest) -> Option<Callback> {
    let req = unsafe { &*request };
    let delta = req.offset - entry.key.start;
    let avail = entry.valid.saturating_sub(delta).min(req.len);
    let data = unsafe { entry.region.as_ptr().add(delta as usize) };
    req.complete(data, avail as i64);
    req.callback()
}

fn run_callback(cb: Option<Callback>) {
    if let Some((f, ctx)) = cb {
        f(ctx);
    }
}
