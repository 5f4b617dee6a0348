//! io_uring read backend
//!
//! Thin wrapper over the `io-uring` crate's safe API. No SQPOLL, no
//! fixed files, no fixed buffers; works on any kernel with io_uring.
//! Submission never blocks; `wait_completions` is the only blocking
//! call and is bounded by its timeout.

use std::os::unix::io::RawFd;
use std::time::Duration;

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{opcode, types, IoUring};

use lockstep_core::error::{CoreError, CoreResult};

use super::{IoToken, ReadBackend, ReadCompletion};

pub struct UringBackend {
    ring: IoUring,
    pending_submit: u32,
    inflight: usize,
}

impl UringBackend {
    /// `entries` must be a power of two.
    pub fn new(entries: u32) -> CoreResult<Self> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| CoreError::Io(e.raw_os_error().unwrap_or(-1)))?;
        Ok(Self {
            ring,
            pending_submit: 0,
            inflight: 0,
        })
    }

    fn push_sqe(&mut self, sqe: &io_uring::squeue::Entry) -> Result<(), ()> {
        unsafe { self.ring.submission().push(sqe).map_err(|_| ()) }
    }

    fn drain_cq(&mut self, out: &mut Vec<ReadCompletion>) -> usize {
        let mut count = 0;
        for cqe in self.ring.completion() {
            out.push(ReadCompletion {
                token: cqe.user_data(),
                result: cqe.result() as i64,
            });
            self.inflight = self.inflight.saturating_sub(1);
            count += 1;
        }
        count
    }
}

impl ReadBackend for UringBackend {
    fn submit_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: IoToken,
    ) -> CoreResult<()> {
        let sqe = opcode::Read::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build()
            .user_data(token);
        if self.push_sqe(&sqe).is_err() {
            // SQ full: push what we have and retry once.
            self.flush()?;
            self.push_sqe(&sqe)
                .map_err(|_| CoreError::Io(libc::EBUSY))?;
        }
        self.pending_submit += 1;
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<usize> {
        if self.pending_submit == 0 {
            return Ok(0);
        }
        let submitted = self
            .ring
            .submit()
            .map_err(|e| CoreError::Io(e.raw_os_error().unwrap_or(-1)))?;
        self.inflight += submitted;
        self.pending_submit = 0;
        Ok(submitted)
    }

    fn poll_completions(&mut self, out: &mut Vec<ReadCompletion>) -> usize {
        self.drain_cq(out)
    }

    fn wait_completions(&mut self, out: &mut Vec<ReadCompletion>, timeout: Duration) -> usize {
        if self.inflight == 0 {
            return self.drain_cq(out);
        }
        let ts = Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            // Timed out or interrupted; drain whatever landed.
            Err(ref e)
                if e.raw_os_error() == Some(libc::ETIME)
                    || e.raw_os_error() == Some(libc::EINTR) => {}
            Err(_) => return 0,
        }
        self.drain_cq(out)
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn shutdown(&mut self) {
        // Drain remaining CQEs so the ring releases cleanly; the inner
        // IoUring's Drop closes the fd and unmaps the rings.
        let mut sink = Vec::new();
        while self.inflight > 0 {
            if self.wait_completions(&mut sink, Duration::from_millis(10)) == 0 {
                break;
            }
            sink.clear();
        }
        self.pending_submit = 0;
        self.inflight = 0;
    }
}
