//! Threaded interrupt handlers
//!
//! The hard handler runs in interrupt context and should only quiesce the
//! device; returning `WakeThread` defers the real work to a dedicated
//! kernel thread running FIFO at `IRQ_THREAD_PRIO`. For `ONESHOT` lines
//! the vector stays masked from hard handler to thread completion, so
//! level-triggered devices cannot re-fire mid-service.

use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::cpu::CpuMask;
use crate::error::KernelResult;
use crate::sched::{self, Policy, Task};
use crate::sync::completion::Completion;

use super::chip::chip;
use super::{IrqFlags, IrqHandler};

/// Realtime priority of handler threads. High enough to beat ordinary RT
/// work, below priority ceilings used for inheritance.
pub const IRQ_THREAD_PRIO: u8 = 50;

/// Shared between the descriptor (producer) and the handler thread.
pub(super) struct IrqThread {
    vector: u32,
    thread_fn: IrqHandler,
    cookie: usize,
    flags: IrqFlags,
    /// Hard-handler wakeups not yet serviced.
    pending: AtomicU32,
    work: Completion,
    should_exit: AtomicBool,
    exited: Completion,
    task: spin::Once<Arc<Task>>,
}

impl IrqThread {
    /// Create the state and spawn the runner.
    pub(super) fn spawn(
        vector: u32,
        name: &str,
        thread_fn: IrqHandler,
        cookie: usize,
        flags: IrqFlags,
    ) -> KernelResult<Arc<Self>> {
        let this = Arc::new(Self {
            vector,
            thread_fn,
            cookie,
            flags,
            pending: AtomicU32::new(0),
            work: Completion::new(),
            should_exit: AtomicBool::new(false),
            exited: Completion::new(),
            task: spin::Once::new(),
        });
        let arg = Arc::into_raw(this.clone()) as usize;
        let task = sched::create_kernel_thread(
            &format!("irq/{}-{}", vector, name),
            Policy::Fifo { prio: IRQ_THREAD_PRIO },
            runner,
            arg,
            CpuMask::all(),
        )
        .map_err(|e| {
            // Reclaim the reference the runner will never take.
            unsafe { drop(Arc::from_raw(arg as *const Self)) };
            e
        })?;
        this.task.call_once(|| task);
        Ok(this)
    }

    /// Interrupt-context side: record one wakeup and kick the runner.
    pub(super) fn kick(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.work.complete();
    }

    /// Drain pending wakeups through the thread handler. Unmasks a oneshot
    /// line once the backlog is gone.
    pub(super) fn service(&self) {
        while self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            (self.thread_fn)(self.vector, self.cookie);
        }
        if self.flags.contains(IrqFlags::ONESHOT) {
            chip().unmask(self.vector);
        }
    }

    /// Tell the runner to exit and wait for it. Called from `free_irq`.
    pub(super) fn stop(&self) {
        self.should_exit.store(true, Ordering::Release);
        self.work.complete();
        if sched::current().is_some() {
            self.exited.wait();
        } else {
            // No task context to wait from; pull the runner off its queue.
            #[cfg(test)]
            if let Some(task) = self.task.get() {
                sched::rq(task.cpu() as usize).deactivate(task);
            }
        }
    }

    #[cfg(test)]
    pub(super) fn pending_wakeups(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }
}

fn runner(arg: usize) -> ! {
    let this = unsafe { Arc::from_raw(arg as *const IrqThread) };
    loop {
        if this.should_exit.load(Ordering::Acquire) {
            break;
        }
        this.work.wait();
        this.service();
    }
    this.exited.complete_all();
    sched::exit_current()
}
