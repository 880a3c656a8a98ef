//! Sleeping mutex with priority inheritance
//!
//! Process-context only: contenders block rather than spin. While an RT or
//! deadline waiter is blocked, the holder borrows the highest waiting
//! priority so it cannot be preempted indefinitely by middle-priority work
//! (classic priority-inversion avoidance). Ownership is handed directly to
//! the best waiter on unlock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sched::{self, SchedClass, Task};
use crate::sync::spinlock::SpinLock;
use crate::sync::wait_queue::Waiter;

/// Inheritance priority a waiter lends: its RT priority, or the RT
/// ceiling for deadline tasks (their urgency is not expressible as an RT
/// level, so they boost the holder to the top).
fn lent_prio(task: &Arc<Task>) -> Option<u8> {
    match task.class() {
        SchedClass::Deadline => Some(99),
        SchedClass::Rt => Some(task.rt_prio()),
        _ => None,
    }
}

struct MutexState {
    locked: bool,
    /// Holder, kept for priority inheritance. `None` while locked only
    /// when the lock was taken outside task context (early boot).
    owner: Option<Arc<Task>>,
    waiters: Vec<Arc<Waiter>>,
}

pub struct Mutex<T> {
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinLock::new(MutexState { locked: false, owner: None, waiters: Vec::new() }),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire, blocking the calling task while contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let me = sched::current();
            match self.try_acquire(me.as_ref()) {
                Ok(()) => return MutexGuard { mutex: self },
                Err(Some(waiter)) => {
                    // Ownership is handed to us on resolve. The sleep is
                    // announced before each check so an unlock racing the
                    // final check cannot strand us.
                    loop {
                        sched::prepare_to_block();
                        if waiter.reason().is_some() {
                            sched::abort_block();
                            break;
                        }
                        sched::block_current();
                    }
                    return MutexGuard { mutex: self };
                }
                Err(None) => {
                    // No task context: nothing to park, spin politely.
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.try_acquire(sched::current().as_ref()) {
            Ok(()) => Some(MutexGuard { mutex: self }),
            Err(Some(waiter)) => {
                self.abandon_waiter(&waiter);
                None
            }
            Err(None) => None,
        }
    }

    /// Take the lock or register `me` as a waiter, lending priority to
    /// the holder. `Err(None)` means contended with no task to park.
    fn try_acquire(&self, me: Option<&Arc<Task>>) -> Result<(), Option<Arc<Waiter>>> {
        let mut st = self.state.lock();
        if !st.locked {
            st.locked = true;
            st.owner = me.cloned();
            return Ok(());
        }
        let Some(me) = me else {
            return Err(None);
        };
        crate::kernel_assert!(
            st.owner.as_ref().map_or(true, |o| o.tid() != me.tid()),
            "recursive mutex lock"
        );
        if let (Some(prio), Some(owner)) = (lent_prio(me), st.owner.clone()) {
            sched::boost(&owner, prio);
        }
        let waiter = Waiter::new(me.clone());
        st.waiters.push(waiter.clone());
        Err(Some(waiter))
    }

    /// Drop a registration made by a failed `try_lock`.
    fn abandon_waiter(&self, waiter: &Arc<Waiter>) {
        let mut st = self.state.lock();
        st.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        // A lent boost stays until unlock; the owner re-derives it there.
    }

    /// Release: shed any inherited priority and hand the lock to the most
    /// urgent waiter, FIFO among equals.
    fn unlock(&self) {
        let woken = {
            let mut st = self.state.lock();
            if let Some(owner) = st.owner.take() {
                sched::unboost(&owner);
            }
            let best = st
                .waiters
                .iter()
                .enumerate()
                .filter(|(_, w)| w.is_pending())
                .min_by_key(|(idx, w)| {
                    let class = w.task().class();
                    // Class rank first, higher RT priority next, then age.
                    (class, core::cmp::Reverse(w.task().rt_prio()), *idx)
                })
                .map(|(idx, _)| idx);
            match best {
                Some(idx) => {
                    let waiter = st.waiters.remove(idx);
                    st.owner = Some(waiter.task().clone());
                    // Still locked: direct handoff.
                    Some(waiter)
                }
                None => {
                    st.waiters.clear();
                    st.locked = false;
                    None
                }
            }
        };
        if let Some(waiter) = woken {
            waiter.resolve(crate::sync::wait_queue::WakeReason::Signaled);
            sched::wake(waiter.task());
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Policy, TaskState};

    // Contenders are marked Running so the handoff wake only resolves the
    // waiter and never touches the shared runqueues.
    fn contender(name: &str, policy: Policy) -> Arc<Task> {
        let task = Task::with_policy_for_tests(name, policy);
        task.set_state(TaskState::Running);
        task
    }

    #[test]
    fn uncontended_lock_unlock() {
        let m = Mutex::new(7u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 8);
    }

    #[test]
    fn try_lock_respects_holder() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn rt_waiter_boosts_fair_owner() {
        let m = Mutex::new(());
        let owner = contender("owner", Policy::Fair { nice: 0 });
        let rt = contender("rt-waiter", Policy::Fifo { prio: 70 });

        assert!(m.try_acquire(Some(&owner)).is_ok());
        let waiter = m.try_acquire(Some(&rt)).unwrap_err().expect("task context");
        // Owner inherited the waiter's priority.
        assert_eq!(owner.class(), SchedClass::Rt);
        assert_eq!(owner.rt_prio(), 70);

        m.unlock();
        // Boost shed, ownership handed to the waiter.
        assert_eq!(owner.class(), SchedClass::Fair);
        assert!(waiter.reason().is_some());
        assert_eq!(
            m.state.lock().owner.as_ref().map(|t| t.tid()),
            Some(rt.tid())
        );
        m.unlock();
        assert!(!m.state.lock().locked);
    }

    #[test]
    fn handoff_prefers_most_urgent_waiter() {
        let m = Mutex::new(());
        let owner = contender("owner", Policy::Fair { nice: 0 });
        let fair = contender("fair-waiter", Policy::Fair { nice: 0 });
        let low_rt = contender("rt-30", Policy::Fifo { prio: 30 });
        let high_rt = contender("rt-80", Policy::Fifo { prio: 80 });

        assert!(m.try_acquire(Some(&owner)).is_ok());
        let w_fair = m.try_acquire(Some(&fair)).unwrap_err().unwrap();
        let w_low = m.try_acquire(Some(&low_rt)).unwrap_err().unwrap();
        let w_high = m.try_acquire(Some(&high_rt)).unwrap_err().unwrap();

        m.unlock();
        assert!(w_high.reason().is_some());
        assert!(w_low.reason().is_none());
        m.unlock();
        assert!(w_low.reason().is_some());
        m.unlock();
        assert!(w_fair.reason().is_some());
    }

    #[test]
    fn deadline_waiter_boosts_to_ceiling() {
        let m = Mutex::new(());
        let owner = contender("owner", Policy::Fair { nice: 0 });
        let dl = contender(
            "dl-waiter",
            Policy::Deadline { runtime_ns: 1_000_000, deadline_ns: 2_000_000, period_ns: 2_000_000 },
        );
        assert!(m.try_acquire(Some(&owner)).is_ok());
        let _w = m.try_acquire(Some(&dl)).unwrap_err().unwrap();
        assert_eq!(owner.rt_prio(), 99);
        m.unlock();
    }
}
