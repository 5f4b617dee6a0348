//! # lockstep-core
//!
//! Core primitives for the lockstep phased task scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations (worker pool, page cache,
//! io backends) live in `lockstep-runtime`.
//!
//! ## Modules
//!
//! - `task` - Type-erased task and per-thread execution context
//! - `link` - Intrusive singly-linked node for zero-allocation queues
//! - `mpsc` - Lock-free intrusive MPSC mailbox and actor queue
//! - `spsc` - Bounded lock-free SPSC ring
//! - `steal` - Growable per-thread work-stealing queue
//! - `barrier` - Generation-counted rendezvous with dynamic membership
//! - `error` - Error types
//! - `spinlock` - Internal spinlock primitive
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod barrier;
pub mod env;
pub mod error;
pub mod kprint;
pub mod link;
pub mod mpsc;
pub mod spinlock;
pub mod spsc;
pub mod steal;
pub mod task;

// Re-exports for convenience
pub use barrier::{BarrierMember, PhaseBarrier};
pub use env::{env_get, env_get_bool, env_get_opt};
pub use error::{CoreError, CoreResult, MemoryError, WorkerError};
pub use link::{LinkNode, Linked};
pub use mpsc::{ActorQueue, Mailbox};
pub use spinlock::SpinLock;
pub use spsc::SpscRing;
pub use steal::StealQueue;
pub use task::{Phase, Task, TaskContext};

/// Shared constants
pub mod constants {
    /// Cache line size for alignment
    pub const CACHE_LINE_SIZE: usize = 64;

    /// Maximum workers (OS threads)
    pub const MAX_WORKERS: usize = 64;

    /// Number of alternating primary phases
    pub const NUM_PHASES: usize = 2;

    /// Default capacity of a per-worker steal queue (tasks)
    pub const DEFAULT_STEAL_CAPACITY: usize = 256;
}
