//! Phase rendezvous barrier
//!
//! A generation-counted barrier over a mutex and condvar. Members arrive
//! with [`PhaseBarrier::sync`]; the last arrival runs the caller-supplied
//! flip closure while still holding the lock, bumps the generation, and
//! wakes everyone. Every `sync` returns the member's slot index, freshly
//! computed after the rendezvous.
//!
//! Two membership flavors:
//!
//! * *pinned* members occupy the front slots and keep their index for the
//!   barrier's lifetime;
//! * *detachable* members sit behind them and may leave and rejoin. Slot
//!   compaction after a leave is deferred to the next rendezvous, so
//!   indices handed out by the previous one stay valid for the round.
//!
//! Joining while a round is in progress parks the newcomer until that
//! round completes; it is not counted toward the round it missed. Leaving
//! can itself complete a round: the departure drops the expected count,
//! and if everyone else has already arrived, one of the parked waiters is
//! elected to run the flip.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Membership token. Returned by the join calls, consumed by
/// [`PhaseBarrier::leave`].
pub struct BarrierMember {
    key: u64,
    pinned: bool,
}

impl BarrierMember {
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

struct State {
    /// Member keys in join order. Pinned members map to indices
    /// `0..pinned.len()`, detachable members follow.
    pinned: Vec<u64>,
    detachable: Vec<u64>,
    /// Detachable members that left mid-round. Still occupying slots
    /// until the next rendezvous compacts them out.
    departing: Vec<u64>,
    /// Joins that arrived while a round was in progress.
    pending_join: Vec<(u64, bool)>,
    arrived: usize,
    generation: u64,
    /// Set by a departure that completed the round; the first waiter to
    /// observe it runs the flip.
    finish_pending: bool,
    next_key: u64,
}

impl State {
    fn expected(&self) -> usize {
        self.pinned.len() + self.detachable.len() - self.departing.len()
    }

    fn is_active(&self, key: u64) -> bool {
        self.pinned.contains(&key)
            || (self.detachable.contains(&key) && !self.departing.contains(&key))
    }

    fn index_of(&self, key: u64) -> Option<usize> {
        if let Some(i) = self.pinned.iter().position(|&k| k == key) {
            return Some(i);
        }
        self.detachable
            .iter()
            .position(|&k| k == key)
            .map(|i| self.pinned.len() + i)
    }

    /// End-of-round bookkeeping: compact departed slots, admit deferred
    /// joins, rearm the arrival count.
    fn complete_round(&mut self) {
        self.arrived = 0;
        self.finish_pending = false;
        if !self.departing.is_empty() {
            let departing = std::mem::take(&mut self.departing);
            self.detachable.retain(|k| !departing.contains(k));
        }
        for (key, pinned) in self.pending_join.drain(..) {
            if pinned {
                self.pinned.push(key);
            } else {
                self.detachable.push(key);
            }
        }
    }
}

pub struct PhaseBarrier {
    state: Mutex<State>,
    cond: Condvar,
}

impl PhaseBarrier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pinned: Vec::new(),
                detachable: Vec::new(),
                departing: Vec::new(),
                pending_join: Vec::new(),
                arrived: 0,
                generation: 0,
                finish_pending: false,
                next_key: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join with a stable front slot. Takes effect at the next rendezvous
    /// if a round is in progress.
    pub fn join_pinned(&self) -> BarrierMember {
        self.join(true)
    }

    /// Join behind the pinned members. May later [`leave`](Self::leave)
    /// and rejoin.
    pub fn join_detachable(&self) -> BarrierMember {
        self.join(false)
    }

    fn join(&self, pinned: bool) -> BarrierMember {
        let mut st = self.lock();
        let key = st.next_key;
        st.next_key += 1;
        if st.arrived > 0 {
            st.pending_join.push((key, pinned));
        } else if pinned {
            st.pinned.push(key);
        } else {
            st.detachable.push(key);
        }
        BarrierMember { key, pinned }
    }

    /// Leave the barrier. If every remaining member has already arrived,
    /// the round completes without the departing member; one parked waiter
    /// is woken to run the flip.
    pub fn leave(&self, member: BarrierMember) {
        debug_assert!(!member.pinned, "pinned members cannot leave");
        let mut st = self.lock();
        if let Some(pos) = st
            .pending_join
            .iter()
            .position(|&(k, _)| k == member.key)
        {
            // Never activated; cancel the deferred join outright.
            st.pending_join.remove(pos);
            return;
        }
        debug_assert!(st.is_active(member.key));
        st.departing.push(member.key);
        if st.arrived > 0 && st.arrived >= st.expected() {
            st.finish_pending = true;
            self.cond.notify_all();
        } else if st.arrived == 0 && st.expected() == 0 {
            // Last member out with no round open: compact now and admit
            // deferred joins so they are not stranded waiting for a
            // rendezvous that can never happen.
            st.complete_round();
            self.cond.notify_all();
        }
    }

    /// Arrive at the rendezvous and wait for the rest. The last arrival
    /// runs `flip` under the barrier lock before waking the others.
    /// Returns the member's slot index as of the completed rendezvous.
    pub fn sync<F: FnOnce()>(&self, member: &BarrierMember, flip: F) -> usize {
        let mut st = self.lock();
        // A member admitted mid-round waits out the round it missed.
        while !st.is_active(member.key) {
            debug_assert!(
                st.pending_join.iter().any(|&(k, _)| k == member.key),
                "sync by a non-member"
            );
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        let gen = st.generation;
        st.arrived += 1;
        let mut run_flip = st.arrived >= st.expected();
        if !run_flip {
            loop {
                st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
                if st.generation != gen {
                    break;
                }
                if st.finish_pending {
                    // A departure completed the round; we were elected.
                    st.finish_pending = false;
                    run_flip = true;
                    break;
                }
            }
        }
        if run_flip {
            st.complete_round();
            flip();
            st.generation = st.generation.wrapping_add(1);
            self.cond.notify_all();
        }
        let idx = st.index_of(member.key);
        debug_assert!(idx.is_some(), "member lost its slot across a rendezvous");
        idx.unwrap_or(usize::MAX)
    }

    /// Members counted toward the next rendezvous.
    pub fn participants(&self) -> usize {
        self.lock().expected()
    }

    /// Completed rendezvous count.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    #[cfg(test)]
    fn arrived(&self) -> usize {
        self.lock().arrived
    }
}

impl Default for PhaseBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..5000 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_single_member_rounds() {
        let barrier = PhaseBarrier::new();
        let member = barrier.join_pinned();
        let flips = AtomicUsize::new(0);
        for _ in 0..3 {
            let idx = barrier.sync(&member, || {
                flips.fetch_add(1, Ordering::Relaxed);
            });
            assert_eq!(idx, 0);
        }
        assert_eq!(flips.load(Ordering::Relaxed), 3);
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn test_flip_runs_once_per_round() {
        let barrier = Arc::new(PhaseBarrier::new());
        let flips = Arc::new(AtomicUsize::new(0));
        let rounds = 25usize;
        let members: Vec<_> = (0..4).map(|_| barrier.join_pinned()).collect();
        let mut handles = Vec::new();
        for member in members {
            let barrier = Arc::clone(&barrier);
            let flips = Arc::clone(&flips);
            handles.push(thread::spawn(move || {
                for _ in 0..rounds {
                    barrier.sync(&member, || {
                        flips.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(flips.load(Ordering::Relaxed), rounds);
        assert_eq!(barrier.generation(), rounds as u64);
    }

    #[test]
    fn test_leave_completes_round() {
        let barrier = Arc::new(PhaseBarrier::new());
        let pinned = barrier.join_pinned();
        let detachable = barrier.join_detachable();
        let flips = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            let flips = Arc::clone(&flips);
            thread::spawn(move || {
                barrier.sync(&pinned, || {
                    flips.fetch_add(1, Ordering::Relaxed);
                })
            })
        };
        wait_for(|| barrier.arrived() == 1);
        barrier.leave(detachable);
        let idx = waiter.join().unwrap();
        assert_eq!(idx, 0);
        assert_eq!(flips.load(Ordering::Relaxed), 1);
        assert_eq!(barrier.participants(), 1);
    }

    #[test]
    fn test_join_mid_round_deferred() {
        let barrier = Arc::new(PhaseBarrier::new());
        let a = barrier.join_pinned();
        let b = barrier.join_pinned();
        let first = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.sync(&a, || {}))
        };
        wait_for(|| barrier.arrived() == 1);
        // Joins while the round is open do not count toward it.
        let late = barrier.join_detachable();
        assert_eq!(barrier.participants(), 2);
        let idx_b = barrier.sync(&b, || {});
        first.join().unwrap();
        assert_eq!(idx_b, 1);
        // After the round the newcomer is counted and slotted behind.
        assert_eq!(barrier.participants(), 3);
        barrier.leave(late);
    }

    #[test]
    fn test_indices_compact_after_leave() {
        let barrier = Arc::new(PhaseBarrier::new());
        let p0 = barrier.join_pinned();
        let d1 = barrier.join_detachable();
        let d2 = barrier.join_detachable();

        let run_round = |members: Vec<BarrierMember>| -> Vec<(usize, BarrierMember)> {
            let mut handles = Vec::new();
            for member in members {
                let barrier = Arc::clone(&barrier);
                handles.push(thread::spawn(move || {
                    let idx = barrier.sync(&member, || {});
                    (idx, member)
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        };

        let mut round1 = run_round(vec![p0, d1, d2]);
        round1.sort_by_key(|&(idx, _)| idx);
        let indices: Vec<usize> = round1.iter().map(|&(idx, _)| idx).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let mut members = round1.into_iter().map(|(_, m)| m);
        let p0 = members.next().unwrap();
        let d1 = members.next().unwrap();
        let d2 = members.next().unwrap();

        barrier.leave(d1);
        let mut round2 = run_round(vec![p0, d2]);
        round2.sort_by_key(|&(idx, _)| idx);
        let indices: Vec<usize> = round2.iter().map(|&(idx, _)| idx).collect();
        // The surviving detachable member compacted down behind the
        // pinned front.
        assert_eq!(indices, vec![0, 1]);
    }
}
