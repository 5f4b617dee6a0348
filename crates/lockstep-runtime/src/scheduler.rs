//! The phased work-stealing scheduler
//!
//! Execution alternates between two phases. Per worker and per phase
//! there are two steal queues selected by the parity of that phase's
//! iteration counter: the queue being drained this round, and the queue
//! collecting tasks for the phase's next round. A task pushed for phase
//! `k` while `k` is running lands in the next-parity queue and stays
//! invisible until `k` comes around again, so a phase never consumes
//! work it produced for itself mid-round.
//!
//! That split is also what makes the queues cheap: pushes only ever
//! target queues nobody is stealing from, so `StealQueue::push` needs no
//! compare-and-swap loop.
//!
//! Workers drain their own queue first, then probe the other shards in
//! ring order. When a worker's steal circle comes up empty it arrives at
//! the phase barrier; the last arrival flips the phase, drains the
//! remote mailbox into the shards, and checks the stop handshake.
//! Background-capable workers instead detach from the barrier when
//! background work is pending, serve it (and the io pump), and rejoin.
//!
//! Stopping is a two-step handshake threaded through the mailbox: a
//! [`StopRequest`] arrives like any other remote message, and once every
//! queue is empty the flip closes the mailbox with its own
//! observed-empty handshake. A push that raced the close either made it
//! in (and runs) or is refused back to the caller. The last worker to
//! exit fires the request's callback exactly once.

use core::ffi::c_void;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use lockstep_core::barrier::PhaseBarrier;
use lockstep_core::constants::NUM_PHASES;
use lockstep_core::error::{CoreError, CoreResult};
use lockstep_core::link::{LinkNode, Linked};
use lockstep_core::mpsc::ActorQueue;
use lockstep_core::spinlock::SpinLock;
use lockstep_core::steal::StealQueue;
use lockstep_core::task::{Phase, Task, TaskContext};
use lockstep_core::{kdebug, kinfo};

use crate::config::SchedulerConfig;
use crate::worker::{current_worker_detached, current_worker_id, set_worker_detached, WorkerPool};

/// Callback descriptor for a graceful stop. The caller keeps it alive
/// until it has fired; the callback runs exactly once, on the last
/// worker out, after all queued tasks have drained.
pub struct StopRequest {
    on_stopped: Option<fn(*mut c_void)>,
    context: *mut c_void,
    fired: AtomicBool,
}

unsafe impl Send for StopRequest {}
unsafe impl Sync for StopRequest {}

impl StopRequest {
    pub fn new(on_stopped: fn(*mut c_void), context: *mut c_void) -> Self {
        Self {
            on_stopped: Some(on_stopped),
            context,
            fired: AtomicBool::new(false),
        }
    }

    /// A request that only latches; poll with `has_fired`.
    pub fn noop() -> Self {
        Self {
            on_stopped: None,
            context: std::ptr::null_mut(),
            fired: AtomicBool::new(false),
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            if let Some(f) = self.on_stopped {
                f(self.context);
            }
        }
    }
}

/// Message from off-worker threads, delivered at the next phase flip.
enum RemoteMsg {
    Spawn { phase: Phase, task: Task },
    Stop(*const StopRequest),
}

#[repr(C)]
struct RemoteNode {
    link: LinkNode,
    msg: RemoteMsg,
}

unsafe impl Linked for RemoteNode {
    fn link(&self) -> &LinkNode {
        &self.link
    }
}

// Safety: `Task` is plain data, and the `StopRequest` pointer is only
// dereferenced while the request outlives the scheduler, per `request_stop`.
unsafe impl Send for RemoteNode {}

/// Per-worker queues.
struct Shard {
    /// `queues[phase][parity]`
    queues: [[StealQueue; 2]; NUM_PHASES],
    background: SpinLock<VecDeque<Task>>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            queues: [
                [
                    StealQueue::with_capacity(capacity),
                    StealQueue::with_capacity(capacity),
                ],
                [
                    StealQueue::with_capacity(capacity),
                    StealQueue::with_capacity(capacity),
                ],
            ],
            background: SpinLock::new(VecDeque::new()),
        }
    }
}

type IoPump = Arc<dyn Fn(Option<Duration>) -> usize + Send + Sync>;

pub struct Scheduler {
    config: SchedulerConfig,
    shards: Vec<Shard>,
    global_background: SpinLock<VecDeque<Task>>,
    background_count: AtomicUsize,
    barrier: PhaseBarrier,
    mailbox: ActorQueue<RemoteNode>,
    /// Index of the phase currently running.
    current_phase: AtomicUsize,
    /// Iteration counter per phase; parity selects the drain queue.
    phase_iter: [AtomicU64; NUM_PHASES],
    tick: AtomicU64,
    tasks_this_round: AtomicUsize,
    idle_round: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    stop_requested: AtomicBool,
    stop_request: AtomicPtr<StopRequest>,
    live_workers: AtomicUsize,
    /// Flip-runner round-robin cursor for routing remote spawns.
    route_cursor: AtomicUsize,
    io_pump: OnceLock<IoPump>,
    pool: Mutex<Option<WorkerPool>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> CoreResult<Arc<Self>> {
        config.validate().map_err(|msg| {
            kdebug!("invalid scheduler config: {}", msg);
            CoreError::InvalidConfig(msg)
        })?;
        let shards = (0..config.num_workers)
            .map(|_| Shard::new(config.steal_queue_capacity))
            .collect();
        Ok(Arc::new(Self {
            config,
            shards,
            global_background: SpinLock::new(VecDeque::new()),
            background_count: AtomicUsize::new(0),
            barrier: PhaseBarrier::new(),
            mailbox: ActorQueue::new(),
            current_phase: AtomicUsize::new(Phase::Sim.index()),
            // Sim's first round is iteration 1; Record flips in at 1.
            phase_iter: [AtomicU64::new(1), AtomicU64::new(0)],
            tick: AtomicU64::new(0),
            tasks_this_round: AtomicUsize::new(0),
            idle_round: AtomicBool::new(false),
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_request: AtomicPtr::new(std::ptr::null_mut()),
            live_workers: AtomicUsize::new(0),
            route_cursor: AtomicUsize::new(0),
            io_pump: OnceLock::new(),
            pool: Mutex::new(None),
        }))
    }

    /// Spawn the worker pool. May be called once.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyInitialized);
        }
        lockstep_core::kprint::init();
        if self.config.debug_logging {
            lockstep_core::kprint::set_log_level(lockstep_core::kprint::LogLevel::Debug);
        }
        self.live_workers
            .store(self.config.num_workers, Ordering::SeqCst);
        let mut pool = WorkerPool::new(self.config.num_workers, self.config.num_background_workers);
        let sched = Arc::clone(self);
        pool.start(move |id, background_capable| sched.worker_main(id, background_capable))?;
        *self.pool.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        kinfo!(
            "scheduler started: {} workers, {} background-capable",
            self.config.num_workers,
            self.config.num_background_workers
        );
        Ok(())
    }

    /// Hook the io pump; called from background-capable workers and the
    /// phase flip. May be set once, before `start`.
    pub fn set_io_pump(&self, pump: IoPump) -> CoreResult<()> {
        self.io_pump
            .set(pump)
            .map_err(|_| CoreError::AlreadyInitialized)
    }

    #[inline]
    pub fn current_phase(&self) -> Phase {
        Phase::from_index(self.current_phase.load(Ordering::Acquire))
    }

    /// Iteration counter of `phase`; bumped each time the phase flips in.
    #[inline]
    pub fn phase_iteration(&self, phase: Phase) -> u64 {
        self.phase_iter[phase.index()].load(Ordering::Acquire)
    }

    /// Completed phase flips.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue `task` to run during the next occurrence of `phase`. On an
    /// attached worker thread this goes straight into the worker's shard;
    /// any other thread, including a worker detached to serve background
    /// tasks, routes through the remote mailbox.
    pub fn push(&self, phase: Phase, task: Task) -> CoreResult<()> {
        let wid = current_worker_id();
        if wid >= self.shards.len() || current_worker_detached() {
            return self.push_remote(phase, task);
        }
        let parity = self.next_parity(phase);
        self.shards[wid].queues[phase.index()][parity].push(task);
        Ok(())
    }

    /// Queue `task` from an arbitrary thread. Delivered to the shards at
    /// the next phase flip. Fails once a stop has been finalized.
    pub fn push_remote(&self, phase: Phase, task: Task) -> CoreResult<()> {
        self.send(RemoteMsg::Spawn { phase, task })
    }

    /// Queue a phase-independent task for the background workers.
    pub fn push_background(&self, task: Task) {
        let wid = current_worker_id();
        if wid < self.shards.len() {
            self.shards[wid].background.lock().push_back(task);
        } else {
            self.global_background.lock().push_back(task);
        }
        self.background_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Request a graceful stop. `request` must outlive its own firing.
    /// The scheduler finishes every queued task, closes the mailbox, and
    /// fires the request from the last worker to exit.
    pub fn request_stop(&self, request: NonNull<StopRequest>) -> CoreResult<()> {
        self.send(RemoteMsg::Stop(request.as_ptr()))
    }

    fn send(&self, msg: RemoteMsg) -> CoreResult<()> {
        let node = NonNull::new(Box::into_raw(Box::new(RemoteNode {
            link: LinkNode::new(),
            msg,
        })))
        .ok_or(CoreError::Stopped)?;
        if self.mailbox.push(node) {
            Ok(())
        } else {
            // Refused by a finalized stop; take the node back.
            unsafe {
                drop(Box::from_raw(node.as_ptr()));
            }
            Err(CoreError::Stopped)
        }
    }

    /// Hard shutdown: stop after the current round without draining
    /// future-parity queues.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Block until every worker has exited.
    pub fn join(&self) {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut pool) = pool {
            pool.join();
        }
    }

    #[inline]
    fn next_parity(&self, phase: Phase) -> usize {
        ((self.phase_iter[phase.index()].load(Ordering::Acquire) + 1) & 1) as usize
    }

    fn run_task(&self, worker_id: usize, task: Task) {
        let tcx = TaskContext {
            worker_id,
            phase: self.current_phase(),
        };
        task.run(&tcx);
    }

    fn worker_main(&self, worker_id: usize, background_capable: bool) {
        let mut member = self.barrier.join_detachable();
        let mut idle_rounds = 0usize;
        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            let phase = self.current_phase();
            let parity = (self.phase_iter[phase.index()].load(Ordering::Acquire) & 1) as usize;
            let ran = self.run_phase_round(worker_id, phase, parity);
            if ran > 0 {
                self.tasks_this_round.fetch_add(ran, Ordering::Relaxed);
                idle_rounds = 0;
            }

            if background_capable && self.background_count.load(Ordering::Acquire) > 0 {
                // Serve background work off the barrier, then wait out
                // whatever round we missed before touching phase queues
                // again.
                self.barrier.leave(member);
                set_worker_detached(true);
                let served = self.serve_background(worker_id);
                if served == 0 {
                    if let Some(pump) = self.io_pump.get() {
                        pump(Some(self.config.io_poll_timeout));
                    }
                }
                member = self.barrier.join_detachable();
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                self.barrier.sync(&member, || self.advance_phase());
                // Rounds ran while this worker was away; repair every
                // queue except the one the new round is draining.
                let cur = self.current_phase();
                let cur_parity =
                    (self.phase_iter[cur.index()].load(Ordering::Acquire) & 1) as usize;
                for (p, per_phase) in self.shards[worker_id].queues.iter().enumerate() {
                    for (q, queue) in per_phase.iter().enumerate() {
                        if p == cur.index() && q == cur_parity {
                            continue;
                        }
                        queue.reset_if_invalid();
                    }
                }
                set_worker_detached(false);
                continue;
            }

            self.barrier.sync(&member, || self.advance_phase());
            // Repair the contended-empty sentinel before this queue
            // becomes a push target again.
            self.shards[worker_id].queues[phase.index()][parity].reset_if_invalid();

            if self.idle_round.load(Ordering::Relaxed) {
                idle_rounds += 1;
                if idle_rounds > self.config.idle_spins {
                    std::thread::sleep(self.config.idle_sleep);
                } else {
                    std::thread::yield_now();
                }
            } else {
                idle_rounds = 0;
            }
        }
        self.barrier.leave(member);
        let remaining = self.live_workers.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            let request = self.stop_request.load(Ordering::Acquire);
            if !request.is_null() {
                unsafe {
                    (*request).fire();
                }
            }
            kinfo!("scheduler stopped after {} flips", self.tick());
        }
    }

    /// Drain own queue, then steal around the ring, until a full circle
    /// finds nothing.
    fn run_phase_round(&self, worker_id: usize, phase: Phase, parity: usize) -> usize {
        let n = self.shards.len();
        let mut ran = 0usize;
        loop {
            if let Some(task) = self.shards[worker_id].queues[phase.index()][parity].steal() {
                self.run_task(worker_id, task);
                ran += 1;
                continue;
            }
            let mut stolen = None;
            for off in 1..n {
                let victim = (worker_id + off) % n;
                if let Some(task) = self.shards[victim].queues[phase.index()][parity].steal() {
                    stolen = Some(task);
                    break;
                }
            }
            match stolen {
                Some(task) => {
                    self.run_task(worker_id, task);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Drain one victim's background queue, falling back to the global
    /// overflow queue.
    fn serve_background(&self, worker_id: usize) -> usize {
        let n = self.shards.len();
        let mut ran = 0usize;
        for off in 0..n {
            let victim = (worker_id + off) % n;
            loop {
                let task = match self.shards[victim].background.try_lock() {
                    Some(mut q) => q.pop_front(),
                    None => break,
                };
                match task {
                    Some(task) => {
                        self.background_count.fetch_sub(1, Ordering::AcqRel);
                        self.run_task(worker_id, task);
                        ran += 1;
                    }
                    None => break,
                }
            }
            if ran > 0 {
                return ran;
            }
        }
        loop {
            let task = self.global_background.lock().pop_front();
            match task {
                Some(task) => {
                    self.background_count.fetch_sub(1, Ordering::AcqRel);
                    self.run_task(worker_id, task);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Runs on the last arrival of every rendezvous, under the barrier
    /// lock. All other members are parked, so the flip has exclusive use
    /// of every shard.
    fn advance_phase(&self) {
        let delivered = self.drain_mailbox();
        if self.stop_requested.load(Ordering::Relaxed)
            && delivered == 0
            && self.all_queues_empty()
            && self.mailbox.stop()
        {
            self.running.store(false, Ordering::Release);
        }
        let ran = self.tasks_this_round.swap(0, Ordering::Relaxed);
        self.idle_round
            .store(ran == 0 && delivered == 0, Ordering::Relaxed);

        let cur = self.current_phase();
        let next = cur.other();
        self.phase_iter[next.index()].fetch_add(1, Ordering::Release);
        self.current_phase.store(next.index(), Ordering::Release);
        self.tick.fetch_add(1, Ordering::Relaxed);

        // Keep io moving even when no background worker is detached.
        if let Some(pump) = self.io_pump.get() {
            pump(None);
        }
    }

    /// Deliver remote spawns into the shards. Exclusive during the flip.
    fn drain_mailbox(&self) -> usize {
        let mut delivered = 0usize;
        while let Some(node) = self.mailbox.pop_one() {
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            match node.msg {
                RemoteMsg::Spawn { phase, task } => {
                    let shard =
                        self.route_cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
                    let parity = self.next_parity(phase);
                    let queue = &self.shards[shard].queues[phase.index()][parity];
                    queue.reset_if_invalid();
                    queue.push(task);
                    delivered += 1;
                }
                RemoteMsg::Stop(request) => {
                    self.stop_request
                        .store(request as *mut StopRequest, Ordering::Release);
                    self.stop_requested.store(true, Ordering::Release);
                    kdebug!("stop requested; draining queues");
                }
            }
        }
        delivered
    }

    fn all_queues_empty(&self) -> bool {
        if self.background_count.load(Ordering::Acquire) != 0 {
            return false;
        }
        for shard in &self.shards {
            for per_phase in &shard.queues {
                for queue in per_phase {
                    if !queue.is_empty() {
                        return false;
                    }
                }
            }
        }
        self.mailbox.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Free any remote nodes a hard shutdown left behind.
        while let Some(node) = self.mailbox.pop_one() {
            unsafe {
                drop(Box::from_raw(node.as_ptr()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::time::Instant;

    fn small_config(workers: usize, background: usize) -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.num_workers = workers;
        config.num_background_workers = background;
        config.idle_spins = 4;
        config.idle_sleep = Duration::from_micros(50);
        config
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let start = Instant::now();
        while !cond() {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "condition never became true"
            );
            std::thread::yield_now();
        }
    }

    struct CountCtx {
        sim: AtomicUsize,
        record: AtomicUsize,
    }

    fn counting_task(ctx: *mut c_void, tcx: &TaskContext) {
        let ctx = unsafe { &*(ctx as *const CountCtx) };
        match tcx.phase {
            Phase::Sim => ctx.sim.fetch_add(1, Ordering::SeqCst),
            Phase::Record => ctx.record.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn stop_flag_cb(ctx: *mut c_void) {
        let flag = unsafe { &*(ctx as *const AtomicUsize) };
        flag.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_tasks_run_in_their_phase() {
        let scheduler = Scheduler::new(small_config(2, 0)).unwrap();
        scheduler.start().unwrap();
        let ctx = Box::leak(Box::new(CountCtx {
            sim: AtomicUsize::new(0),
            record: AtomicUsize::new(0),
        }));
        let ctx_ptr = ctx as *const CountCtx as *mut c_void;
        for _ in 0..50 {
            scheduler
                .push_remote(Phase::Sim, Task::new(ctx_ptr, counting_task))
                .unwrap();
            scheduler
                .push_remote(Phase::Record, Task::new(ctx_ptr, counting_task))
                .unwrap();
        }
        wait_until(|| {
            ctx.sim.load(Ordering::SeqCst) == 50 && ctx.record.load(Ordering::SeqCst) == 50
        });
        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn test_stop_fires_once_after_drain() {
        let scheduler = Scheduler::new(small_config(3, 1)).unwrap();
        scheduler.start().unwrap();
        let ctx = Box::leak(Box::new(CountCtx {
            sim: AtomicUsize::new(0),
            record: AtomicUsize::new(0),
        }));
        let ctx_ptr = ctx as *const CountCtx as *mut c_void;
        for _ in 0..200 {
            scheduler
                .push_remote(Phase::Sim, Task::new(ctx_ptr, counting_task))
                .unwrap();
        }
        let fired = Box::leak(Box::new(AtomicUsize::new(0)));
        let request = Box::leak(Box::new(StopRequest::new(
            stop_flag_cb,
            fired as *const AtomicUsize as *mut c_void,
        )));
        scheduler.request_stop(NonNull::from(&*request)).unwrap();
        scheduler.join();
        // Every queued task drained before the stop fired, exactly once.
        assert_eq!(ctx.sim.load(Ordering::SeqCst), 200);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(request.has_fired());
        // The mailbox is closed; further remote pushes are refused.
        let err = scheduler
            .push_remote(Phase::Sim, Task::new(ctx_ptr, counting_task))
            .unwrap_err();
        assert!(matches!(err, CoreError::Stopped));
    }

    struct IsoCtx {
        scheduler: *const Scheduler,
        parent_iter: StdAtomicU64,
        child_iter: StdAtomicU64,
        done: AtomicBool,
    }

    fn iso_child(ctx: *mut c_void, _tcx: &TaskContext) {
        let ctx = unsafe { &*(ctx as *const IsoCtx) };
        let sched = unsafe { &*ctx.scheduler };
        ctx.child_iter
            .store(sched.phase_iteration(Phase::Sim), Ordering::SeqCst);
        ctx.done.store(true, Ordering::SeqCst);
    }

    fn iso_parent(ctx: *mut c_void, _tcx: &TaskContext) {
        let iso = unsafe { &*(ctx as *const IsoCtx) };
        let sched = unsafe { &*iso.scheduler };
        iso.parent_iter
            .store(sched.phase_iteration(Phase::Sim), Ordering::SeqCst);
        sched.push(Phase::Sim, Task::new(ctx, iso_child)).unwrap();
    }

    #[test]
    fn test_same_phase_spawn_waits_for_next_iteration() {
        let scheduler = Scheduler::new(small_config(2, 0)).unwrap();
        scheduler.start().unwrap();
        let ctx = Box::leak(Box::new(IsoCtx {
            scheduler: Arc::as_ptr(&scheduler),
            parent_iter: StdAtomicU64::new(0),
            child_iter: StdAtomicU64::new(0),
            done: AtomicBool::new(false),
        }));
        scheduler
            .push_remote(
                Phase::Sim,
                Task::new(ctx as *const IsoCtx as *mut c_void, iso_parent),
            )
            .unwrap();
        wait_until(|| ctx.done.load(Ordering::SeqCst));
        scheduler.shutdown();
        scheduler.join();
        // The child became visible only at a later Sim iteration.
        assert!(ctx.child_iter.load(Ordering::SeqCst) > ctx.parent_iter.load(Ordering::SeqCst));
    }

    fn background_task(ctx: *mut c_void, _tcx: &TaskContext) {
        let flag = unsafe { &*(ctx as *const AtomicUsize) };
        flag.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_background_tasks_run_while_phases_turn() {
        let scheduler = Scheduler::new(small_config(3, 1)).unwrap();
        scheduler.start().unwrap();
        let counter = Box::leak(Box::new(AtomicUsize::new(0)));
        for _ in 0..20 {
            scheduler.push_background(Task::new(
                counter as *const AtomicUsize as *mut c_void,
                background_task,
            ));
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 20);
        scheduler.shutdown();
        scheduler.join();
    }

    struct BgSpawnCtx {
        scheduler: *const Scheduler,
        ran: AtomicUsize,
    }

    fn bg_spawned_work(ctx: *mut c_void, tcx: &TaskContext) {
        let ctx = unsafe { &*(ctx as *const BgSpawnCtx) };
        assert_eq!(tcx.phase, Phase::Sim);
        ctx.ran.fetch_add(1, Ordering::SeqCst);
    }

    fn bg_spawner(ctx: *mut c_void, _tcx: &TaskContext) {
        // Runs on a worker that has left the barrier; the push must not
        // touch this worker's shard while rounds flip without it.
        let bg = unsafe { &*(ctx as *const BgSpawnCtx) };
        let sched = unsafe { &*bg.scheduler };
        for _ in 0..4 {
            sched.push(Phase::Sim, Task::new(ctx, bg_spawned_work)).unwrap();
        }
    }

    #[test]
    fn test_background_task_spawns_primary_work() {
        let scheduler = Scheduler::new(small_config(3, 1)).unwrap();
        scheduler.start().unwrap();
        let ctx = Box::leak(Box::new(BgSpawnCtx {
            scheduler: Arc::as_ptr(&scheduler),
            ran: AtomicUsize::new(0),
        }));
        let ctx_ptr = ctx as *const BgSpawnCtx as *mut c_void;
        for _ in 0..25 {
            scheduler.push_background(Task::new(ctx_ptr, bg_spawner));
        }
        wait_until(|| ctx.ran.load(Ordering::SeqCst) == 100);
        scheduler.shutdown();
        scheduler.join();
    }

    #[test]
    fn test_stop_request_latch_fires_once() {
        let request = StopRequest::noop();
        assert!(!request.has_fired());
        request.fire();
        request.fire();
        assert!(request.has_fired());
    }
}
