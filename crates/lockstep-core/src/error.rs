//! Error types for the lockstep scheduler and streaming cache

use core::fmt;

/// Result type for scheduler and cache operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in scheduler or cache operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Subsystem already initialized or started
    AlreadyInitialized,

    /// Subsystem not initialized
    NotInitialized,

    /// Operation submitted after the subsystem's stop handshake completed
    Stopped,

    /// Configuration failed validation
    InvalidConfig(&'static str),

    /// Memory allocation/mapping failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),

    /// OS I/O error (negative errno)
    Io(i32),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::AlreadyInitialized => write!(f, "already initialized"),
            CoreError::NotInitialized => write!(f, "not initialized"),
            CoreError::Stopped => write!(f, "subsystem stopped"),
            CoreError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            CoreError::Memory(e) => write!(f, "memory error: {}", e),
            CoreError::Worker(e) => write!(f, "worker error: {}", e),
            CoreError::Io(errno) => write!(f, "io error: errno {}", errno),
        }
    }
}

impl std::error::Error for CoreError {}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed - the OS declined to allocate virtual memory.
    /// Surfaced to the requester as a hard failure.
    AllocationFailed,

    /// madvise failed
    AdviseFailed,

    /// Zero-length or overflowing allocation request
    InvalidLength,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::AdviseFailed => write!(f, "memory advise failed"),
            MemoryError::InvalidLength => write!(f, "invalid allocation length"),
        }
    }
}

impl From<MemoryError> for CoreError {
    fn from(e: MemoryError) -> Self {
        CoreError::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

impl From<WorkerError> for CoreError {
    fn from(e: WorkerError) -> Self {
        CoreError::Worker(e)
    }
}
