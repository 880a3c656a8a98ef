//! Completion
//!
//! One-shot (or counted) "this work is done" signal. The completer side
//! calls `complete` once per unit of work, or `complete_all` to release
//! every current and future waiter. Waiters consume one completion each
//! unless `complete_all` was issued.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::wait_queue::{WaitQueue, WakeReason};

pub struct Completion {
    /// Unconsumed `complete` calls.
    done: AtomicU32,
    /// Sticky: set by `complete_all`, never cleared.
    everyone: AtomicBool,
    waiters: WaitQueue,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicU32::new(0),
            everyone: AtomicBool::new(false),
            waiters: WaitQueue::new(),
        }
    }

    /// Signal one unit of completed work, releasing one waiter.
    pub fn complete(&self) {
        self.done.fetch_add(1, Ordering::AcqRel);
        self.waiters.notify_one();
    }

    /// Signal completion to all current and future waiters.
    pub fn complete_all(&self) {
        self.everyone.store(true, Ordering::Release);
        self.waiters.notify_all();
    }

    /// Consume one completion if available, without blocking.
    pub fn try_wait(&self) -> bool {
        if self.everyone.load(Ordering::Acquire) {
            return true;
        }
        self.done
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Block until completed.
    pub fn wait(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            self.waiters.wait();
        }
    }

    /// Block until completed or `deadline_ns` passes.
    pub fn wait_deadline(&self, deadline_ns: u64) -> KernelResult<()> {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            if self.waiters.wait_deadline(deadline_ns) == WakeReason::Timeout {
                // One last chance: the signal may have raced the timeout.
                return if self.try_wait() { Ok(()) } else { Err(KernelError::Timeout) };
            }
        }
    }

    /// True once `complete_all` ran or an unconsumed completion exists.
    pub fn is_complete(&self) -> bool {
        self.everyone.load(Ordering::Acquire) || self.done.load(Ordering::Acquire) > 0
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
