//! Microbenchmarks for the core queue primitives.

use core::ffi::c_void;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use std::ptr::NonNull;

use lockstep_core::link::{LinkNode, Linked};
use lockstep_core::mpsc::Mailbox;
use lockstep_core::spsc::SpscRing;
use lockstep_core::steal::StealQueue;
use lockstep_core::task::{Task, TaskContext};

fn noop(_ctx: *mut c_void, _tcx: &TaskContext) {}

#[repr(C)]
struct Node {
    link: LinkNode,
    value: u64,
}

unsafe impl Linked for Node {
    fn link(&self) -> &LinkNode {
        &self.link
    }
}

fn bench_steal_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("steal_queue");
    group.bench_function("push_steal_64", |b| {
        let q = StealQueue::with_capacity(64);
        let task = Task::new(core::ptr::null_mut(), noop);
        b.iter(|| {
            for _ in 0..64 {
                q.push(black_box(task));
            }
            while let Some(t) = q.steal() {
                black_box(t);
            }
            q.reset_if_invalid();
        });
    });
    group.finish();
}

fn bench_spsc_ring(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc_ring");
    group.bench_function("push_pop_64", |b| {
        let ring: SpscRing<u64> = SpscRing::with_capacity(64);
        b.iter(|| {
            for v in 0..64u64 {
                ring.push(black_box(v)).unwrap();
            }
            while let Some(v) = ring.pop() {
                black_box(v);
            }
        });
    });
    group.finish();
}

fn bench_mailbox(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox");
    group.bench_function("push_drain_64", |b| {
        let mb: Mailbox<Node> = Mailbox::new();
        let nodes: Vec<Box<Node>> = (0..64)
            .map(|value| {
                Box::new(Node {
                    link: LinkNode::new(),
                    value,
                })
            })
            .collect();
        b.iter(|| {
            for node in &nodes {
                mb.push(NonNull::from(&**node));
            }
            for node in mb.drain_all() {
                black_box(node);
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_steal_queue, bench_spsc_ring, bench_mailbox);
criterion_main!(benches);
