//! Context switch and preemption control
//!
//! The preempt counter is per-CPU: while it is nonzero the scheduler will
//! not switch tasks involuntarily on that CPU. A reschedule requested inside
//! a non-preemptible region is deferred and fires at the first zero
//! transition.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::mm;

use super::task::Task;

#[cfg(not(test))]
mod counter {
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::cpu::MAX_CPUS;
    use crate::hal;

    const COUNT_SLOT: AtomicU32 = AtomicU32::new(0);
    static COUNTS: [AtomicU32; MAX_CPUS] = [COUNT_SLOT; MAX_CPUS];
    const DEFER_SLOT: AtomicBool = AtomicBool::new(false);
    static DEFERRED: [AtomicBool; MAX_CPUS] = [DEFER_SLOT; MAX_CPUS];

    fn cpu() -> usize {
        hal::hal().current_cpu_id() as usize % MAX_CPUS
    }

    pub fn get() -> u32 {
        COUNTS[cpu()].load(Ordering::Relaxed)
    }

    pub fn inc() {
        COUNTS[cpu()].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when the count reached zero.
    pub fn dec() -> bool {
        let prev = COUNTS[cpu()].fetch_sub(1, Ordering::Relaxed);
        crate::kernel_assert!(prev != 0, "unbalanced preempt_enable");
        prev == 1
    }

    pub fn set_deferred() {
        DEFERRED[cpu()].store(true, Ordering::Relaxed);
    }

    pub fn take_deferred() -> bool {
        DEFERRED[cpu()].swap(false, Ordering::Relaxed)
    }
}

// Host tests run on many OS threads that all report CPU 0; a thread-local
// counter keeps their preempt bookkeeping independent.
#[cfg(test)]
mod counter {
    use core::cell::Cell;

    std::thread_local! {
        static COUNT: Cell<u32> = const { Cell::new(0) };
        static DEFERRED: Cell<bool> = const { Cell::new(false) };
    }

    pub fn get() -> u32 {
        COUNT.with(|c| c.get())
    }

    pub fn inc() {
        COUNT.with(|c| c.set(c.get() + 1));
    }

    pub fn dec() -> bool {
        COUNT.with(|c| {
            let prev = c.get();
            crate::kernel_assert!(prev != 0, "unbalanced preempt_enable");
            c.set(prev - 1);
            prev == 1
        })
    }

    pub fn set_deferred() {
        DEFERRED.with(|d| d.set(true));
    }

    pub fn take_deferred() -> bool {
        DEFERRED.with(|d| d.replace(false))
    }
}

/// Current CPU's preempt count. Zero means preemption is legal.
pub fn preempt_count() -> u32 {
    counter::get()
}

/// Enter a non-preemptible region.
pub fn preempt_disable() {
    counter::inc();
}

/// Leave a non-preemptible region. A reschedule deferred while the count
/// was nonzero fires here on the zero transition.
pub fn preempt_enable() {
    let reached_zero = counter::dec();
    if reached_zero && counter::take_deferred() {
        super::schedule();
    }
}

/// Request a reschedule from a non-preemptible region; it runs once the
/// count drops to zero.
pub fn defer_resched() {
    counter::set_deferred();
}

/// Swap execution from `prev` to `next` on the current CPU. The caller has
/// already updated runqueue state and dropped its lock; this only installs
/// the address space and asks the HAL to swap registers.
pub(super) fn context_switch(prev: &Arc<Task>, next: &Arc<Task>) {
    if let Some(next_mm) = next.mm() {
        if prev.mm() != Some(next_mm) {
            mm::switch_address_space(next_mm);
        }
    }
    // Safety: both save areas are live for the lifetime of their Arcs and
    // this CPU is the only one running either task.
    unsafe {
        crate::hal::hal().switch_context(prev.ctx_ptr(), next.ctx_ptr());
    }
}

/// Voluntary/involuntary switch accounting, called just before the swap.
pub(super) fn account_switch(prev: &Arc<Task>, voluntary: bool) {
    if voluntary {
        prev.stats.nvcsw.fetch_add(1, Ordering::Relaxed);
    } else {
        prev.stats.nivcsw.fetch_add(1, Ordering::Relaxed);
    }
}
