//! Shared atomics and flags described in §3. Everything here is cheap to read/write from any
//! thread; the decisions built on top of these values happen only on the executor task (§5).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::records::TopicPartition;

/// Demand counter with saturating semantics (§3 "Demand counter").
#[derive(Debug, Default)]
pub struct Demand(AtomicI64);

impl Demand {
    pub fn add(&self, n: i64) {
        loop {
            let cur = self.0.load(Ordering::SeqCst);
            let next = cur.saturating_add(n);
            if self
                .0
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn decrement_one(&self) {
        loop {
            let cur = self.0.load(Ordering::SeqCst);
            if cur <= 0 {
                return;
            }
            if self
                .0
                .compare_exchange(cur, cur - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared mutable state for one consumer loop (§3).
#[derive(Debug, Default)]
pub struct LoopState {
    pub active: AtomicBool,
    pub requested: Demand,
    pub awaiting_transaction: AtomicBool,
    pub paused_by_user: Mutex<HashSet<TopicPartition>>,
    pub paused_by_us: AtomicBool,
    pub retrying: AtomicBool,
    pub is_pending: AtomicBool,
    pub in_progress: AtomicUsize,
    pub consecutive_failures: AtomicUsize,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One-shot transition; returns true iff this call performed the transition.
    pub fn deactivate(&self) -> bool {
        self.active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_transaction(&self) -> bool {
        self.awaiting_transaction.load(Ordering::SeqCst)
    }

    pub fn set_awaiting_transaction(&self, value: bool) {
        self.awaiting_transaction.store(value, Ordering::SeqCst);
    }

    pub fn is_paused_by_us(&self) -> bool {
        self.paused_by_us.load(Ordering::SeqCst)
    }

    /// Check-and-set transition into paused-by-us. Returns `true` iff this call performed the
    /// 0->1 transition (the caller uses that to decide whether a wakeup recheck is owed, per the
    /// pause/resume race documented in §9).
    pub fn enter_paused_by_us(&self) -> bool {
        self.paused_by_us
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear_paused_by_us(&self) -> bool {
        self.paused_by_us
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn paused_by_user_set(&self) -> HashSet<TopicPartition> {
        self.paused_by_user.lock().unwrap().clone()
    }

    pub fn add_paused_by_user(&self, parts: impl IntoIterator<Item = TopicPartition>) {
        let mut guard = self.paused_by_user.lock().unwrap();
        guard.extend(parts);
    }

    pub fn remove_paused_by_user(&self, parts: impl IntoIterator<Item = TopicPartition>) {
        let mut guard = self.paused_by_user.lock().unwrap();
        for p in parts {
            guard.remove(&p);
        }
    }

    /// Drop bookkeeping for partitions no longer assigned to us (§6.3 `partitions_revoked`).
    pub fn retain_paused_by_user(&self, still_assigned: impl Fn(&TopicPartition) -> bool) {
        let mut guard = self.paused_by_user.lock().unwrap();
        guard.retain(|p| still_assigned(p));
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending.load(Ordering::SeqCst)
    }

    pub fn arm_pending(&self) -> bool {
        self.is_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn force_pending(&self) {
        self.is_pending.store(true, Ordering::SeqCst);
    }

    /// CAS true->false; returns whether it *was* pending (i.e. whether the caller should run).
    pub fn take_pending(&self) -> bool {
        self.is_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_retrying(&self, value: bool) {
        self.retrying.store(value, Ordering::SeqCst);
    }

    pub fn incr_in_progress(&self) {
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_in_progress(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn reset_consecutive_failures(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the post-increment count.
    pub fn bump_consecutive_failures(&self) -> usize {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}
