//! Streaming read demo
//!
//! Reads a file front to back through the page cache with a bounded
//! number of outstanding requests, then prints throughput and the
//! cache's hit/miss counters.

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("streamread needs the io_uring backend; build on linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    use std::ptr::NonNull;
    use std::time::Instant;

    use lockstep::{FileHandle, ReadRequest, Runtime, SchedulerConfig};

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: streamread <file> [chunk-bytes] [max-outstanding]");
            std::process::exit(2);
        }
    };
    let chunk: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(256 * 1024);
    let window: usize = std::env::args()
        .nth(3)
        .and_then(|s| s.parse().ok())
        .unwrap_or(16);

    let file = match FileHandle::open_readable(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("open {}: {}", path, e);
            std::process::exit(1);
        }
    };
    let file_len = file.len();
    println!("=== lockstep streaming read ===");
    println!(
        "{}: {} bytes, {} byte chunks, {} outstanding\n",
        path, file_len, chunk, window
    );

    let mut runtime = match Runtime::new(SchedulerConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let (bytes_read, elapsed, stats) = runtime.block_on(|rt| {
        let start = Instant::now();
        let mut bytes_read = 0u64;
        let mut checksum = 0u64;
        let mut offset = 0u64;
        let mut outstanding: Vec<Box<ReadRequest>> = Vec::with_capacity(window);

        while offset < file_len || !outstanding.is_empty() {
            while offset < file_len && outstanding.len() < window {
                let len = chunk.min(file_len - offset);
                let req = Box::new(ReadRequest::new(file.as_raw_fd(), offset, len));
                if let Err(e) = rt.read(NonNull::from(&*req)) {
                    eprintln!("read at {}: {}", offset, e);
                    std::process::exit(1);
                }
                outstanding.push(req);
                offset += len;
            }

            // Retire the oldest request so reads complete in file order.
            let req = outstanding.remove(0);
            while !req.is_complete() {
                std::thread::yield_now();
            }
            let result = req.result();
            if result < 0 {
                eprintln!("read at {} failed: errno {}", req.offset(), -result);
                std::process::exit(1);
            }
            let data = unsafe { std::slice::from_raw_parts(req.data(), result as usize) };
            for &b in data.iter().step_by(4096) {
                checksum = checksum.wrapping_mul(31).wrapping_add(b as u64);
            }
            bytes_read += result as u64;
            rt.discard(NonNull::from(&*req));
        }

        let elapsed = start.elapsed();
        println!("checksum: {:#x}", checksum);
        (bytes_read, elapsed, rt.cache().stats())
    });

    println!("read {} bytes in {:?}", bytes_read, elapsed);
    println!(
        "throughput: {:.1} MiB/sec",
        bytes_read as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
    );
    println!(
        "cache: {} misses, {} hits, {} coalesced, {} reclaims, {} reloads",
        stats.misses, stats.hits, stats.coalesced, stats.reclaims, stats.reloads
    );
    println!(
        "reads: {} completed, {} failed",
        stats.completed_reads, stats.failed_reads
    );
}
