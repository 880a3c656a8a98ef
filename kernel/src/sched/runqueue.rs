//! Per-CPU runqueue
//!
//! One runqueue per online CPU, owning a sub-queue per scheduling class.
//! `pick_next` polls the classes in fixed order (stop, deadline, RT, fair,
//! idle) and the idle class never declines, so picking is total. All
//! mutation happens under the runqueue spinlock with IRQs disabled; the
//! runqueue clock only advances while that lock is held.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::cpu;
use crate::hal;
use crate::sync::spinlock::{SpinLock, SpinLockGuard};
use crate::time;

use super::deadline::DlQueue;
use super::fair::{self, FairQueue};
use super::idle::IdleQueue;
use super::rt::RtQueue;
use super::stop::StopQueue;
use super::task::{SchedClass, Task, TaskState};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnqueueFlags: u8 {
        /// The task is waking from a blocked state.
        const WAKEUP = 1 << 0;
        /// The task has never run.
        const NEW = 1 << 1;
    }
}

/// Class operations as seen by the runqueue. Five implementations, polled
/// in `SchedClass` order; no runtime registration.
pub trait ClassQueue {
    fn enqueue(&mut self, task: Arc<Task>, flags: EnqueueFlags, now: u64);
    fn dequeue(&mut self, task: &Arc<Task>) -> bool;
    fn pick_next(&mut self, now: u64) -> Option<Arc<Task>>;
    fn put_prev(&mut self, task: Arc<Task>, now: u64);
    /// Account the running task; true requests a reschedule.
    fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool;
    fn nr_queued(&self) -> usize;
}

impl ClassQueue for StopQueue {
    fn enqueue(&mut self, task: Arc<Task>, _flags: EnqueueFlags, _now: u64) {
        StopQueue::enqueue(self, task);
    }

    fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        StopQueue::dequeue(self, task)
    }

    fn pick_next(&mut self, _now: u64) -> Option<Arc<Task>> {
        StopQueue::pick_next(self)
    }

    fn put_prev(&mut self, task: Arc<Task>, _now: u64) {
        StopQueue::enqueue(self, task);
    }

    fn task_tick(&mut self, _curr: &Arc<Task>, _now: u64) -> bool {
        // Stoppers run to completion.
        false
    }

    fn nr_queued(&self) -> usize {
        StopQueue::nr_queued(self)
    }
}

impl ClassQueue for DlQueue {
    fn enqueue(&mut self, task: Arc<Task>, _flags: EnqueueFlags, now: u64) {
        DlQueue::enqueue(self, task, now);
    }

    fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        DlQueue::dequeue(self, task)
    }

    fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        DlQueue::pick_next(self, now)
    }

    fn put_prev(&mut self, task: Arc<Task>, _now: u64) {
        DlQueue::put_prev(self, task);
    }

    fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        DlQueue::task_tick(self, curr, now)
    }

    fn nr_queued(&self) -> usize {
        DlQueue::nr_queued(self)
    }
}

impl ClassQueue for RtQueue {
    fn enqueue(&mut self, task: Arc<Task>, _flags: EnqueueFlags, _now: u64) {
        RtQueue::enqueue(self, task);
    }

    fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        RtQueue::dequeue(self, task)
    }

    fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        RtQueue::pick_next(self, now)
    }

    fn put_prev(&mut self, task: Arc<Task>, _now: u64) {
        RtQueue::put_prev(self, task);
    }

    fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        RtQueue::task_tick(self, curr, now)
    }

    fn nr_queued(&self) -> usize {
        RtQueue::nr_queued(self)
    }
}

impl ClassQueue for FairQueue {
    fn enqueue(&mut self, task: Arc<Task>, flags: EnqueueFlags, _now: u64) {
        FairQueue::enqueue(
            self,
            task,
            flags.contains(EnqueueFlags::WAKEUP),
            flags.contains(EnqueueFlags::NEW),
        );
    }

    fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        FairQueue::dequeue(self, task)
    }

    fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        FairQueue::pick_next(self, now)
    }

    fn put_prev(&mut self, task: Arc<Task>, _now: u64) {
        FairQueue::put_prev(self, task);
    }

    fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        FairQueue::task_tick(self, curr, now)
    }

    fn nr_queued(&self) -> usize {
        FairQueue::nr_queued(self)
    }
}

impl ClassQueue for IdleQueue {
    fn enqueue(&mut self, _task: Arc<Task>, _flags: EnqueueFlags, _now: u64) {
        // The idle task is owned by the queue itself and never enqueued.
    }

    fn dequeue(&mut self, _task: &Arc<Task>) -> bool {
        false
    }

    fn pick_next(&mut self, _now: u64) -> Option<Arc<Task>> {
        Some(IdleQueue::pick_next(self))
    }

    fn put_prev(&mut self, _task: Arc<Task>, _now: u64) {}

    fn task_tick(&mut self, _curr: &Arc<Task>, _now: u64) -> bool {
        false
    }

    fn nr_queued(&self) -> usize {
        0
    }
}

pub struct RqInner {
    /// Runqueue clock, ns. Advances only under the lock.
    pub(super) clock_ns: u64,
    /// Runnable tasks owned by this runqueue, the running one included.
    pub(super) nr_running: usize,
    pub(super) current: Option<Arc<Task>>,

    pub(super) stop: StopQueue,
    pub(super) dl: DlQueue,
    pub(super) rt: RtQueue,
    pub(super) fair: FairQueue,
    pub(super) idle: IdleQueue,

    /// Exponentially smoothed fair load, the balancer's primary signal.
    pub(super) load_avg: u64,
    pub(super) last_balance_ns: u64,
    /// Consecutive balance attempts that moved nothing; drives backoff.
    pub(super) balance_failures: u32,
}

impl RqInner {
    pub(super) fn update_clock(&mut self) -> u64 {
        let now = time::now_ns();
        if now > self.clock_ns {
            self.clock_ns = now;
        }
        self.clock_ns
    }

    fn class_queue(&mut self, class: SchedClass) -> &mut dyn ClassQueue {
        match class {
            SchedClass::Stop => &mut self.stop,
            SchedClass::Deadline => &mut self.dl,
            SchedClass::Rt => &mut self.rt,
            SchedClass::Fair => &mut self.fair,
            SchedClass::Idle => &mut self.idle,
        }
    }

    /// First offer in class order; the idle class never declines.
    pub(super) fn pick_next(&mut self) -> Arc<Task> {
        let now = self.clock_ns;
        for class in [SchedClass::Stop, SchedClass::Deadline, SchedClass::Rt, SchedClass::Fair] {
            if let Some(task) = self.class_queue(class).pick_next(now) {
                return task;
            }
        }
        IdleQueue::pick_next(&self.idle)
    }

    /// Instantaneous fair load: queued weights plus the running fair task.
    pub(super) fn instantaneous_load(&self) -> u64 {
        let mut load = self.fair.load_weight();
        if let Some(curr) = &self.current {
            if curr.class() == SchedClass::Fair {
                load += fair::task_weight(curr);
            }
        }
        load
    }

    /// Does any class above `class` have runnable work?
    pub(super) fn higher_class_runnable(&mut self, class: SchedClass) -> bool {
        let now = self.clock_ns;
        (class > SchedClass::Stop && self.stop.nr_queued() > 0)
            || (class > SchedClass::Deadline && self.dl.has_runnable(now))
            || (class > SchedClass::Rt && self.rt.has_runnable(now))
            || (class > SchedClass::Fair && self.fair.nr_queued() > 0)
    }
}

pub struct RunQueue {
    cpu: u32,
    inner: SpinLock<RqInner>,
}

impl RunQueue {
    pub fn new(cpu: u32) -> Self {
        Self {
            cpu,
            inner: SpinLock::new(RqInner {
                clock_ns: 0,
                nr_running: 0,
                current: None,
                stop: StopQueue::new(),
                dl: DlQueue::new(),
                rt: RtQueue::new(),
                fair: FairQueue::new(),
                idle: IdleQueue::new(cpu),
                load_avg: 0,
                last_balance_ns: 0,
                balance_failures: 0,
            }),
        }
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub(super) fn lock(&self) -> SpinLockGuard<'_, RqInner> {
        self.inner.lock()
    }

    pub fn nr_running(&self) -> usize {
        self.inner.lock().nr_running
    }

    pub fn current(&self) -> Option<Arc<Task>> {
        self.inner.lock().current.clone()
    }

    pub fn load_avg(&self) -> u64 {
        self.inner.lock().load_avg
    }

    /// Make a task runnable on this runqueue.
    pub fn activate(&self, task: Arc<Task>, flags: EnqueueFlags) {
        crate::kernel_assert!(
            task.class() != SchedClass::Idle,
            "idle tasks never enter a class queue"
        );
        let mut rq = self.inner.lock();
        let now = rq.update_clock();
        debug_assert!(!task.on_rq(), "activate of task already on a runqueue");
        task.set_cpu(self.cpu);
        task.set_on_rq(true);
        task.set_state(TaskState::Runnable);
        let class = task.class();
        rq.class_queue(class).enqueue(task, flags, now);
        rq.nr_running += 1;
    }

    /// Remove a task that is queued here (not the running one).
    /// Returns false if it was not queued.
    pub fn deactivate(&self, task: &Arc<Task>) -> bool {
        let mut rq = self.inner.lock();
        let class = task.class();
        if !rq.class_queue(class).dequeue(task) {
            return false;
        }
        task.set_on_rq(false);
        rq.nr_running -= 1;
        true
    }

    /// Enqueue a waking task and decide whether it should preempt the
    /// running one. Also flags the current task when preemption is due.
    pub fn activate_wakeup(&self, task: Arc<Task>) -> bool {
        let woken_class = task.class();
        crate::kernel_assert!(
            woken_class != SchedClass::Idle,
            "idle tasks never enter a class queue"
        );
        let preempt = {
            let mut rq = self.inner.lock();
            let now = rq.update_clock();
            task.set_cpu(self.cpu);
            task.set_on_rq(true);
            task.set_state(TaskState::Runnable);
            rq.class_queue(woken_class).enqueue(task.clone(), EnqueueFlags::WAKEUP, now);
            rq.nr_running += 1;

            match &rq.current {
                None => true,
                Some(curr) => {
                    let curr_class = curr.class();
                    if woken_class < curr_class {
                        true
                    } else if woken_class > curr_class {
                        false
                    } else {
                        match woken_class {
                            SchedClass::Rt => RtQueue::should_preempt_curr(curr, &task),
                            SchedClass::Deadline => DlQueue::should_preempt_curr(curr, &task),
                            SchedClass::Fair => rq.fair.should_preempt_curr(curr, &task),
                            _ => false,
                        }
                    }
                }
            }
        };
        if preempt {
            if let Some(curr) = self.current() {
                curr.set_need_resched();
            }
        }
        preempt
    }

    /// Timer tick on this runqueue's CPU. Updates the clock, accounts the
    /// running task, refreshes the load average, and sets `need_resched`
    /// when the running task should give way.
    pub fn tick(&self) {
        let mut rq = self.inner.lock();
        let now = rq.update_clock();

        let inst = rq.instantaneous_load();
        rq.load_avg = rq.load_avg - rq.load_avg / 8 + inst / 8;

        let Some(curr) = rq.current.clone() else {
            return;
        };
        curr.set_last_ran(now);
        let class = curr.class();
        let mut resched = rq.class_queue(class).task_tick(&curr, now);
        if rq.higher_class_runnable(class) {
            resched = true;
        }
        if resched {
            curr.set_need_resched();
        }
    }
}

static RUNQUEUES: Once<Box<[RunQueue]>> = Once::new();

fn build_runqueues() -> Box<[RunQueue]> {
    let n = (cpu::nr_cpus() as usize).max(hal::hal().cpu_count() as usize).max(1);
    // Host tests share one array across threads that bring pieces up in
    // arbitrary order; keep it at least as large as the test topology.
    #[cfg(test)]
    let n = n.max(8);
    (0..n as u32).map(RunQueue::new).collect::<Vec<_>>().into_boxed_slice()
}

/// Bring up the runqueue array. Idempotent; sized to the published
/// topology (or the HAL CPU count if larger).
pub fn init() {
    RUNQUEUES.call_once(build_runqueues);
}

pub(super) fn runqueues() -> &'static [RunQueue] {
    RUNQUEUES.call_once(build_runqueues)
}

/// Runqueue of a CPU. Out-of-range ids map to CPU 0 rather than panicking;
/// callers validate affinity masks before routing.
pub fn rq(cpu: usize) -> &'static RunQueue {
    let rqs = runqueues();
    match rqs.get(cpu) {
        Some(rq) => rq,
        None => &rqs[0],
    }
}

/// The executing CPU's runqueue.
pub fn this_rq() -> &'static RunQueue {
    rq(hal::hal().current_cpu_id() as usize)
}
