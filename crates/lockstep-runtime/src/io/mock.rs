//! In-memory read backend for tests
//!
//! Serves reads out of registered byte buffers. Data is copied at
//! submission time but completions are withheld until `flush`, so the
//! submit/flush/poll cadence of a real device is preserved. A short-read
//! limit can be set to force the cache through its partial-read path.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use lockstep_core::error::CoreResult;

use super::{IoToken, ReadBackend, ReadCompletion};

/// Observable read traffic, shared with the test.
#[derive(Default)]
pub struct MockReadLog {
    pub submitted: AtomicUsize,
    pub completed: AtomicUsize,
    pub bytes_read: AtomicUsize,
}

impl MockReadLog {
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::SeqCst)
    }
}

pub struct MockBackend {
    files: HashMap<RawFd, Arc<Vec<u8>>>,
    /// Submitted but not yet flushed.
    queued: Vec<ReadCompletion>,
    /// Flushed, awaiting poll.
    done: ArrayQueue<ReadCompletion>,
    log: Arc<MockReadLog>,
    short_read: Option<u32>,
    inflight: usize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            queued: Vec::new(),
            done: ArrayQueue::new(1024),
            log: Arc::new(MockReadLog::default()),
            short_read: None,
            inflight: 0,
        }
    }

    /// Register the contents behind a fake fd.
    pub fn register_file(&mut self, fd: RawFd, contents: Vec<u8>) {
        self.files.insert(fd, Arc::new(contents));
    }

    /// Cap every read at `limit` bytes to exercise partial-read retries.
    pub fn short_read(mut self, limit: u32) -> Self {
        self.short_read = Some(limit);
        self
    }

    pub fn log(&self) -> Arc<MockReadLog> {
        Arc::clone(&self.log)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBackend for MockBackend {
    fn submit_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        token: IoToken,
    ) -> CoreResult<()> {
        self.log.submitted.fetch_add(1, Ordering::SeqCst);
        let result = match self.files.get(&fd) {
            None => -(libc::EBADF as i64),
            Some(contents) => {
                let avail = contents.len() as u64;
                if offset >= avail {
                    0
                } else {
                    let mut n = (avail - offset).min(len as u64);
                    if let Some(limit) = self.short_read {
                        n = n.min(limit as u64);
                    }
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            contents.as_ptr().add(offset as usize),
                            buf,
                            n as usize,
                        );
                    }
                    self.log.bytes_read.fetch_add(n as usize, Ordering::SeqCst);
                    n as i64
                }
            }
        };
        self.queued.push(ReadCompletion { token, result });
        Ok(())
    }

    fn flush(&mut self) -> CoreResult<usize> {
        let n = self.queued.len();
        for c in self.queued.drain(..) {
            // Capacity overflow only under absurd test load; drop loudly.
            if self.done.push(c).is_err() {
                panic!("mock completion queue overflow");
            }
        }
        self.inflight += n;
        Ok(n)
    }

    fn poll_completions(&mut self, out: &mut Vec<ReadCompletion>) -> usize {
        let mut count = 0;
        while let Some(c) = self.done.pop() {
            out.push(c);
            count += 1;
        }
        self.inflight -= count;
        self.log.completed.fetch_add(count, Ordering::SeqCst);
        count
    }

    fn wait_completions(&mut self, out: &mut Vec<ReadCompletion>, _timeout: Duration) -> usize {
        // Everything completes at flush; waiting cannot produce more.
        self.poll_completions(out)
    }

    fn inflight(&self) -> usize {
        self.inflight
    }

    fn shutdown(&mut self) {
        self.queued.clear();
        while self.done.pop().is_some() {}
        self.inflight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_round_trip() {
        let mut backend = MockBackend::new();
        backend.register_file(3, (0..100u8).collect());
        let mut buf = [0u8; 10];
        backend
            .submit_read(3, buf.as_mut_ptr(), 10, 20, 77)
            .unwrap();
        assert_eq!(backend.flush().unwrap(), 1);
        let mut out = Vec::new();
        assert_eq!(backend.poll_completions(&mut out), 1);
        assert_eq!(out[0].token, 77);
        assert_eq!(out[0].result, 10);
        assert_eq!(buf, [20, 21, 22, 23, 24, 25, 26, 27, 28, 29]);
    }

    #[test]
    fn test_completions_held_until_flush() {
        let mut backend = MockBackend::new();
        backend.register_file(3, vec![1, 2, 3]);
        let mut buf = [0u8; 3];
        backend.submit_read(3, buf.as_mut_ptr(), 3, 0, 1).unwrap();
        let mut out = Vec::new();
        assert_eq!(backend.poll_completions(&mut out), 0);
        backend.flush().unwrap();
        assert_eq!(backend.poll_completions(&mut out), 1);
    }

    #[test]
    fn test_reads_clamped_at_eof() {
        let mut backend = MockBackend::new();
        backend.register_file(3, vec![9; 5]);
        let mut buf = [0u8; 16];
        backend.submit_read(3, buf.as_mut_ptr(), 16, 2, 1).unwrap();
        backend.submit_read(3, buf.as_mut_ptr(), 16, 5, 2).unwrap();
        backend.flush().unwrap();
        let mut out = Vec::new();
        backend.poll_completions(&mut out);
        out.sort_by_key(|c| c.token);
        assert_eq!(out[0].result, 3);
        assert_eq!(out[1].result, 0);
    }

    #[test]
    fn test_short_read_limit() {
        let mut backend = MockBackend::new().short_read(4);
        backend.register_file(3, vec![7; 100]);
        let mut buf = [0u8; 32];
        backend.submit_read(3, buf.as_mut_ptr(), 32, 0, 1).unwrap();
        backend.flush().unwrap();
        let mut out = Vec::new();
        backend.poll_completions(&mut out);
        assert_eq!(out[0].result, 4);
    }

    #[test]
    fn test_unknown_fd_fails() {
        let mut backend = MockBackend::new();
        let mut buf = [0u8; 4];
        backend.submit_read(99, buf.as_mut_ptr(), 4, 0, 1).unwrap();
        backend.flush().unwrap();
        let mut out = Vec::new();
        backend.poll_completions(&mut out);
        assert_eq!(out[0].result, -(libc::EBADF as i64));
    }
}
