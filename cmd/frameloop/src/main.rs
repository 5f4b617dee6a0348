//! Frame loop demo - alternating sim/record phases
//!
//! Drives a fixed number of frames through the scheduler, each frame
//! fanning a batch of tasks into both phases, and reports task
//! throughput at the end.

use core::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use lockstep::{Phase, Runtime, SchedulerConfig, Task, TaskContext};

struct FrameCtx {
    sim_done: AtomicU64,
    record_done: AtomicU64,
    /// Scratch sum so the work is not optimized away.
    checksum: AtomicU64,
}

fn sim_task(ctx: *mut c_void, _tcx: &TaskContext) {
    let ctx = unsafe { &*(ctx as *const FrameCtx) };
    let mut acc = 0u64;
    for i in 0..512u64 {
        acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
    }
    ctx.checksum.fetch_add(acc, Ordering::Relaxed);
    ctx.sim_done.fetch_add(1, Ordering::Release);
}

fn record_task(ctx: *mut c_void, _tcx: &TaskContext) {
    let ctx = unsafe { &*(ctx as *const FrameCtx) };
    ctx.record_done.fetch_add(1, Ordering::Release);
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("frameloop needs the io_uring backend; build on linux");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() {
    let frames: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let tasks_per_frame: u64 = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(64);

    println!("=== lockstep frame loop ===");
    println!("{} frames, {} tasks per phase per frame\n", frames, tasks_per_frame);

    let config = SchedulerConfig::from_env();
    let ctx: &'static FrameCtx = Box::leak(Box::new(FrameCtx {
        sim_done: AtomicU64::new(0),
        record_done: AtomicU64::new(0),
        checksum: AtomicU64::new(0),
    }));
    let ctx_ptr = ctx as *const FrameCtx as *mut c_void;

    let mut runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let elapsed = runtime.block_on(|rt| {
        let start = Instant::now();
        for frame in 0..frames {
            for _ in 0..tasks_per_frame {
                rt.push(Phase::Sim, Task::new(ctx_ptr, sim_task)).unwrap();
                rt.push(Phase::Record, Task::new(ctx_ptr, record_task)).unwrap();
            }
            let target = (frame + 1) * tasks_per_frame;
            while ctx.sim_done.load(Ordering::Acquire) < target
                || ctx.record_done.load(Ordering::Acquire) < target
            {
                std::thread::yield_now();
            }
        }
        start.elapsed()
    });

    let total = frames * tasks_per_frame * 2;
    println!("ran {} tasks in {:?}", total, elapsed);
    println!(
        "throughput: {:.0} tasks/sec ({:.1} us/frame)",
        total as f64 / elapsed.as_secs_f64(),
        elapsed.as_micros() as f64 / frames as f64
    );
    println!("checksum: {:#x}", ctx.checksum.load(Ordering::Relaxed));
}
