//! Wait queue
//!
//! Threads park here until an event occurs. Wakeup is FIFO. Waits may carry
//! a monotonic deadline (enforced by the scheduler tick) and may be
//! cancelled by the owner of the waited-on object.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::sched::{self, task::Task};
use crate::sync::spinlock::SpinLock;

/// Why a wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Woken by notify.
    Signaled,
    /// The deadline passed first.
    Timeout,
    /// The waited-on object cancelled the wait (e.g. closed).
    Cancelled,
}

const PENDING: u8 = 0;
const SIGNALED: u8 = 1;
const TIMED_OUT: u8 = 2;
const CANCELLED: u8 = 3;

/// One parked task. Shared between the queue, the sleeper list, and the
/// waiting task itself.
pub struct Waiter {
    task: Arc<Task>,
    state: AtomicU8,
}

impl Waiter {
    pub(crate) fn new(task: Arc<Task>) -> Arc<Self> {
        Arc::new(Self { task, state: AtomicU8::new(PENDING) })
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Resolve the wait once; later attempts lose. Returns true if this call
    /// performed the transition.
    pub fn resolve(&self, reason: WakeReason) -> bool {
        let new = match reason {
            WakeReason::Signaled => SIGNALED,
            WakeReason::Timeout => TIMED_OUT,
            WakeReason::Cancelled => CANCELLED,
        };
        self.state
            .compare_exchange(PENDING, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reason(&self) -> Option<WakeReason> {
        match self.state.load(Ordering::Acquire) {
            SIGNALED => Some(WakeReason::Signaled),
            TIMED_OUT => Some(WakeReason::Timeout),
            CANCELLED => Some(WakeReason::Cancelled),
            _ => None,
        }
    }
}

/// FIFO queue of parked tasks.
pub struct WaitQueue {
    waiters: SpinLock<VecDeque<Arc<Waiter>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self { waiters: SpinLock::new(VecDeque::new()) }
    }

    /// Park the current task until notified.
    pub fn wait(&self) -> WakeReason {
        self.wait_until(None)
    }

    /// Park the current task until notified or `deadline_ns` passes.
    pub fn wait_deadline(&self, deadline_ns: u64) -> WakeReason {
        self.wait_until(Some(deadline_ns))
    }

    fn wait_until(&self, deadline_ns: Option<u64>) -> WakeReason {
        let Some(task) = sched::current() else {
            // No task context (early boot); nothing can park here.
            log::warn!("wait on queue outside task context ignored");
            return WakeReason::Signaled;
        };
        let waiter = Waiter::new(task);
        self.waiters.lock().push_back(waiter.clone());
        if let Some(deadline) = deadline_ns {
            sched::register_sleeper(waiter.clone(), deadline);
        }
        loop {
            // Announce the sleep before the final check so a notify
            // between the check and the switch flips the block into a
            // no-op instead of being lost.
            sched::prepare_to_block();
            if let Some(reason) = waiter.reason() {
                sched::abort_block();
                return reason;
            }
            sched::block_current();
        }
    }

    /// Wake the oldest pending waiter. Returns true if one was woken.
    pub fn notify_one(&self) -> bool {
        let waiter = {
            let mut waiters = self.waiters.lock();
            loop {
                match waiters.pop_front() {
                    // Resolved entries (timeout/cancel) are skipped here;
                    // their wakeup already happened.
                    Some(w) if w.resolve(WakeReason::Signaled) => break Some(w),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };
        match waiter {
            Some(w) => {
                sched::wake(w.task());
                true
            }
            None => false,
        }
    }

    /// Wake every pending waiter. Returns the number woken.
    pub fn notify_all(&self) -> usize {
        let woken: alloc::vec::Vec<Arc<Waiter>> = {
            let mut waiters = self.waiters.lock();
            waiters
                .drain(..)
                .filter(|w| w.resolve(WakeReason::Signaled))
                .collect()
        };
        for w in &woken {
            sched::wake(w.task());
        }
        woken.len()
    }

    /// Cancel a specific task's wait. The waker owns the decision.
    pub fn cancel(&self, task: &Arc<Task>) -> bool {
        let cancelled = {
            let mut waiters = self.waiters.lock();
            let mut found = None;
            for (i, w) in waiters.iter().enumerate() {
                if Arc::ptr_eq(w.task(), task) && w.is_pending() {
                    found = Some(i);
                    break;
                }
            }
            found.and_then(|i| waiters.remove(i))
        };
        match cancelled {
            Some(w) if w.resolve(WakeReason::Cancelled) => {
                sched::wake(w.task());
                true
            }
            _ => false,
        }
    }

    /// Pending waiter count (may race; diagnostic only).
    pub fn len(&self) -> usize {
        self.waiters.lock().iter().filter(|w| w.is_pending()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Task;

    fn parked(wq: &WaitQueue) -> Arc<Waiter> {
        let task = Task::new_for_tests("waiter");
        // Running: the wake side then only resolves the waiter instead of
        // re-enqueueing, which keeps these tests off the runqueues.
        task.set_state(crate::sched::TaskState::Running);
        let waiter = Waiter::new(task);
        wq.waiters.lock().push_back(waiter.clone());
        waiter
    }

    #[test]
    fn notify_one_is_fifo() {
        let wq = WaitQueue::new();
        let first = parked(&wq);
        let second = parked(&wq);
        assert!(wq.notify_one());
        assert_eq!(first.reason(), Some(WakeReason::Signaled));
        assert!(second.is_pending());
    }

    #[test]
    fn notify_all_resolves_everyone() {
        let wq = WaitQueue::new();
        let a = parked(&wq);
        let b = parked(&wq);
        assert_eq!(wq.notify_all(), 2);
        assert_eq!(a.reason(), Some(WakeReason::Signaled));
        assert_eq!(b.reason(), Some(WakeReason::Signaled));
        assert!(wq.is_empty());
    }

    #[test]
    fn cancel_targets_one_task() {
        let wq = WaitQueue::new();
        let victim = parked(&wq);
        let other = parked(&wq);
        assert!(wq.cancel(victim.task()));
        assert_eq!(victim.reason(), Some(WakeReason::Cancelled));
        assert!(other.is_pending());
        // Cancelling again finds nothing.
        assert!(!wq.cancel(victim.task()));
    }

    #[test]
    fn resolved_waiter_is_skipped_by_notify() {
        let wq = WaitQueue::new();
        let stale = parked(&wq);
        stale.resolve(WakeReason::Timeout);
        let live = parked(&wq);
        assert!(wq.notify_one());
        assert_eq!(stale.reason(), Some(WakeReason::Timeout));
        assert_eq!(live.reason(), Some(WakeReason::Signaled));
    }

    #[test]
    fn resolve_is_first_writer_wins() {
        let wq = WaitQueue::new();
        let w = parked(&wq);
        assert!(w.resolve(WakeReason::Timeout));
        assert!(!w.resolve(WakeReason::Signaled));
        assert_eq!(w.reason(), Some(WakeReason::Timeout));
    }
}
