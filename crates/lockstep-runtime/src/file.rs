//! Readable file handles
//!
//! Raw-fd file handles for the streaming cache. Opened read-only; the
//! cache only ever needs the fd and the length.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use lockstep_core::error::{CoreError, CoreResult};

#[derive(Debug)]
pub struct FileHandle {
    fd: RawFd,
    len: u64,
}

impl FileHandle {
    pub fn open_readable<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let bytes = path.as_ref().to_string_lossy().into_owned().into_bytes();
        let cpath = CString::new(bytes).map_err(|_| CoreError::Io(libc::EINVAL))?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(CoreError::Io(errno()));
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret != 0 {
            let err = errno();
            unsafe {
                libc::close(fd);
            }
            return Err(CoreError::Io(err));
        }
        Ok(Self {
            fd,
            len: stat.st_size as u64,
        })
    }

    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_and_stat() {
        let mut tmp = std::env::temp_dir();
        tmp.push("lockstep-file-test.bin");
        std::fs::File::create(&tmp)
            .unwrap()
            .write_all(&[0u8; 1234])
            .unwrap();
        let handle = FileHandle::open_readable(&tmp).unwrap();
        assert!(handle.as_raw_fd() >= 0);
        assert_eq!(handle.len(), 1234);
        drop(handle);
        std::fs::remove_file(&tmp).unwrap();
    }

    #[test]
    fn test_open_missing_file_fails() {
        let err = FileHandle::open_readable("/no/such/lockstep/file").unwrap_err();
        match err {
            CoreError::Io(e) => assert_eq!(e, libc::ENOENT),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
