//! Type-erased task and execution context
//!
//! A `Task` is the common currency moved through every queue in the
//! scheduler: a context pointer plus a function pointer, copied by value.
//! The task does not own its context; the caller manages that lifetime
//! (typically a pool- or frame-allocated request object).

use core::ffi::c_void;
use core::fmt;

/// One of the two alternating primary phases.
///
/// All primary workers drain a phase's queues in lockstep before either
/// phase's *next* queues become visible. The names follow the usual
/// frame split: simulate, then record commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Phase {
    Sim = 0,
    Record = 1,
}

impl Phase {
    /// The other phase.
    #[inline]
    pub fn other(self) -> Phase {
        match self {
            Phase::Sim => Phase::Record,
            Phase::Record => Phase::Sim,
        }
    }

    /// Phase index, usable for array indexing.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Phase from an index. Values other than 0/1 are a programmer error.
    #[inline]
    pub fn from_index(idx: usize) -> Phase {
        match idx {
            0 => Phase::Sim,
            1 => Phase::Record,
            _ => unreachable!("phase index out of range"),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sim => write!(f, "sim"),
            Phase::Record => write!(f, "record"),
        }
    }
}

/// Per-thread execution context handed to every task function.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    /// Index of the worker executing the task
    pub worker_id: usize,
    /// Phase the task is executing in
    pub phase: Phase,
}

/// Task function signature.
///
/// The first argument is the task's own context pointer, the second the
/// executing worker's context.
pub type TaskFn = fn(*mut c_void, &TaskContext);

/// A type-erased unit of work.
///
/// Immutable once constructed and copied by value into queues. `Task`
/// does not own `context`; enqueuing a task whose context has been freed
/// is a programmer error.
#[derive(Clone, Copy)]
pub struct Task {
    context: *mut c_void,
    func: TaskFn,
}

// Safety: a Task is just a (pointer, fn) pair. The scheduler's contract
// requires contexts to be valid until the task has run, on whichever
// worker runs it.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

fn noop_fn(_ctx: *mut c_void, _tcx: &TaskContext) {}

impl Task {
    /// Build a task from a context pointer and function.
    #[inline]
    pub fn new(context: *mut c_void, func: TaskFn) -> Self {
        Self { context, func }
    }

    /// A task that does nothing. Used to initialize queue storage.
    #[inline]
    pub fn noop() -> Self {
        Self {
            context: core::ptr::null_mut(),
            func: noop_fn,
        }
    }

    /// The task's context pointer.
    #[inline]
    pub fn context(&self) -> *mut c_void {
        self.context
    }

    /// Execute the task on the calling worker.
    #[inline]
    pub fn run(&self, tcx: &TaskContext) {
        (self.func)(self.context, tcx);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("context", &self.context)
            .field("func", &(self.func as usize as *const ()))
            .finish()
    }
}
