//! Raw spinlock
//!
//! Busy-waiting lock for short critical sections. Acquiring disables local
//! interrupts and preemption; dropping the guard restores both. Holders must
//! never sleep; the scheduler asserts on it in debug builds.

use core::ops::{Deref, DerefMut};

use crate::hal;
use crate::sched::switch::{preempt_disable, preempt_enable};

/// IRQ-disabling spinlock.
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value) }
    }

    /// Acquire, spinning with interrupts disabled.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        preempt_disable();
        let hal = hal::hal();
        let irq_was_enabled = hal.interrupts_are_enabled();
        hal.interrupts_disable();
        SpinLockGuard {
            guard: Some(self.inner.lock()),
            irq_was_enabled,
        }
    }

    /// Non-blocking acquire.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        preempt_disable();
        let hal = hal::hal();
        let irq_was_enabled = hal.interrupts_are_enabled();
        hal.interrupts_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(SpinLockGuard { guard: Some(guard), irq_was_enabled }),
            None => {
                if irq_was_enabled {
                    hal.interrupts_enable();
                }
                preempt_enable();
                None
            }
        }
    }
}

pub struct SpinLockGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before touching the interrupt flag; a deferred
        // reschedule may fire inside preempt_enable.
        self.guard.take();
        if self.irq_was_enabled {
            hal::hal().interrupts_enable();
        }
        preempt_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::switch::preempt_count;

    #[test]
    fn guard_protects_data() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 5;
        }
        assert_eq!(*lock.lock(), 5);
    }

    #[test]
    fn preempt_count_balances() {
        let lock = SpinLock::new(());
        let before = preempt_count();
        {
            let _guard = lock.lock();
            assert_eq!(preempt_count(), before + 1);
        }
        assert_eq!(preempt_count(), before);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(1u8);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
