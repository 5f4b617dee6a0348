//! Asynchronous read backends
//!
//! The cache talks to storage through [`ReadBackend`]: positioned reads
//! are submitted with an opaque correlation token, batched with `flush`,
//! and answered through completion records. On Linux the production
//! backend is io_uring; [`MockBackend`] serves tests and non-Linux
//! builds.

use std::os::unix::io::RawFd;
use std::time::Duration;

use lockstep_core::error::CoreResult;

pub mod mock;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod uring;
        pub use uring::UringBackend;
    }
}

pub use mock::{MockBackend, MockReadLog};

/// Correlation token carried from submission to completion.
pub type IoToken = u64;

/// One finished read. `result` is bytes read, or a negative errno.
#[derive(Debug, Clone, Copy)]
pub struct ReadCompletion {
    pub token: IoToken,
    pub result: i64,
}

/// A positioned-read device.
///
/// Submissions are buffered until `flush`. The buffer behind `buf` must
/// stay valid until the matching completion is observed.
pub trait ReadBackend: Send {
    /// Queue a read of `len` bytes at `offset` into `buf`.
    fn submit_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: IoToken,
    ) -> CoreResult<()>;

    /// Push queued submissions to the device. Returns how many went out.
    fn flush(&mut self) -> CoreResult<usize>;

    /// Drain available completions without blocking.
    fn poll_completions(&mut self, out: &mut Vec<ReadCompletion>) -> usize;

    /// Wait up to `timeout` for at least one completion, then drain.
    fn wait_completions(&mut self, out: &mut Vec<ReadCompletion>, timeout: Duration) -> usize;

    /// Reads submitted but not yet completed.
    fn inflight(&self) -> usize;

    /// Drain and drop anything still in flight.
    fn shutdown(&mut self);
}
