//! Scheduler
//!
//! Per-CPU runqueues with five classes polled in fixed order (stop,
//! deadline, RT, fair, idle), a preempt counter gating involuntary
//! switches, and a hierarchical load balancer. This module carries the
//! public surface: thread creation, wake/block/yield, policy and affinity
//! control, the tick, and the reschedule IPI entry.

pub mod balance;
pub mod deadline;
pub mod fair;
pub mod idle;
pub mod rt;
pub mod runqueue;
pub mod stop;
pub mod switch;
pub mod task;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config;
use crate::cpu::{topology, CpuMask};
use crate::error::{KernelError, KernelResult};
use crate::hal::{self, RESCHED_VECTOR};
use crate::sync::spinlock::SpinLock;
use crate::sync::wait_queue::{WakeReason, Waiter};
use crate::time;

pub use runqueue::{rq, this_rq, EnqueueFlags, RunQueue};
pub use switch::{preempt_count, preempt_disable, preempt_enable};
pub use task::{Policy, SchedClass, Task, TaskState, Tid};

/// Bring the scheduler up: validate config, build the runqueue array, and
/// program the periodic tick.
pub fn init() {
    let t = config::tunables();
    runqueue::init();
    hal::hal().timer_set_periodic(t.timer_hz);
    log::info!(
        "sched: {} cpus, {} Hz tick, latency {} us",
        topology::nr_cpus(),
        t.timer_hz,
        t.sched_latency_ns / 1_000
    );
}

/// The task running on this CPU, if the scheduler has taken over.
pub fn current() -> Option<Arc<Task>> {
    this_rq().current()
}

/// Spawn a kernel thread and make it runnable. The entry function never
/// returns; a finished thread calls `exit_current`.
pub fn create_kernel_thread(
    name: &str,
    policy: Policy,
    entry: fn(usize) -> !,
    arg: usize,
    affinity: CpuMask,
) -> KernelResult<Arc<Task>> {
    let task = Task::new_kernel(name, Policy::Fair { nice: 0 }, affinity, entry, arg)?;
    // Routed through the policy switch so deadline reservations are
    // admitted, not just assumed.
    set_scheduler(&task, policy)?;
    let cpu = select_cpu(&task).ok_or(KernelError::InvalidParameter { what: "no online cpu in affinity" })?;
    rq(cpu).activate(task.clone(), EnqueueFlags::NEW);
    kick_cpu(cpu);
    Ok(task)
}

/// Voluntarily give up the CPU; the caller stays runnable.
pub fn yield_now() {
    let rq = this_rq();
    if let Some(curr) = rq.current() {
        switch::account_switch(&curr, true);
    }
    schedule_on(rq, true);
}

/// First half of a blocking wait: publish the intent to sleep before the
/// caller's final condition check. A wakeup landing after this point flips
/// the state back under the runqueue lock, turning the later
/// `block_current` into a no-op instead of sleeping through the signal.
pub fn prepare_to_block() {
    let rq = this_rq();
    if let Some(curr) = rq.current() {
        let _inner = rq.lock();
        curr.set_state(TaskState::Blocked);
    }
}

/// Undo `prepare_to_block` when the awaited condition was already
/// satisfied.
pub fn abort_block() {
    let rq = this_rq();
    if let Some(curr) = rq.current() {
        let _inner = rq.lock();
        if curr.state() == TaskState::Blocked {
            curr.set_state(TaskState::Running);
        }
    }
}

/// Commit the block started by `prepare_to_block`. The caller must already
/// be registered with a waker (wait queue, completion, mutex); returns
/// once the task is woken, or immediately when a wakeup already consumed
/// the blocked state.
pub fn block_current() {
    crate::kernel_assert!(preempt_count() == 0, "blocking in a non-preemptible region");
    let rq = this_rq();
    let Some(curr) = rq.current() else {
        return;
    };
    if curr.state() != TaskState::Blocked {
        // The wakeup won the race; stay on the CPU.
        return;
    }
    switch::account_switch(&curr, true);
    schedule_on(rq, true);
}

/// Mark the running task dead and leave the CPU for good.
pub fn exit_current() -> ! {
    let rq = this_rq();
    if let Some(curr) = rq.current() {
        curr.set_state(TaskState::Zombie);
    }
    loop {
        schedule_on(rq, true);
    }
}

/// Wake a blocked (or never-run) task. Returns false when the task was
/// already runnable. Cross-CPU wakeups send a reschedule IPI when the
/// woken task deserves its CPU immediately.
pub fn wake(task: &Arc<Task>) -> bool {
    {
        let _inner = rq(task.cpu() as usize).lock();
        if task.on_rq() {
            // Still accounted on a runqueue. Between `prepare_to_block`
            // and the switch the task is Blocked yet on_rq; flipping it
            // back here, under the lock the commit path also takes, makes
            // the pending block a no-op and the signal sticks.
            if task.state() == TaskState::Blocked {
                task.set_state(TaskState::Running);
                return true;
            }
            return false;
        }
    }
    match task.state() {
        TaskState::Blocked | TaskState::Runnable | TaskState::Stopped => {}
        TaskState::Running | TaskState::Zombie | TaskState::Dead => return false,
    }
    let Some(cpu) = select_cpu(task) else {
        log::warn!("wake of {}: no online cpu in affinity, using cpu 0", task.name());
        rq(0).activate_wakeup(task.clone());
        return true;
    };
    let preempt = rq(cpu).activate_wakeup(task.clone());
    if preempt {
        kick_cpu(cpu);
    }
    true
}

/// Pin or widen a task's CPU set. The task is moved immediately when its
/// current CPU falls outside the new mask.
pub fn set_affinity(task: &Arc<Task>, mask: CpuMask) -> KernelResult<()> {
    if mask.and(&topology::online_mask()).is_empty() {
        return Err(KernelError::InvalidParameter { what: "affinity excludes every online cpu" });
    }
    task.set_affinity_mask(mask);
    let home = task.cpu() as usize;
    if mask.test(home) {
        return Ok(());
    }
    if task.on_rq() && rq(home).deactivate(task) {
        // Queued somewhere now illegal: re-route through the wake path.
        let cpu = select_cpu(task).ok_or(KernelError::InvalidParameter { what: "affinity" })?;
        rq(cpu).activate(task.clone(), EnqueueFlags::empty());
        kick_cpu(cpu);
    } else if let Some(curr) = rq(home).current() {
        // Running on an excluded CPU: push it off at the next tick.
        if Arc::ptr_eq(&curr, task) {
            curr.set_need_resched();
            kick_cpu(home);
        }
    }
    Ok(())
}

pub fn get_affinity(task: &Arc<Task>) -> CpuMask {
    task.affinity()
}

/// Change a task's policy. Deadline requests go through admission: the
/// reservation must fit under the utilization cap on some CPU the task may
/// run on.
pub fn set_scheduler(task: &Arc<Task>, policy: Policy) -> KernelResult<()> {
    policy.validate()?;
    if matches!(policy, Policy::Stop | Policy::Idle) {
        // The idle task is owned by its runqueue and the stopper by the
        // migration machinery; neither class takes outside members.
        return Err(KernelError::PermissionDenied { what: "idle and stop classes are kernel-internal" });
    }

    let home = task.cpu() as usize;
    let was_queued = task.on_rq() && rq(home).deactivate(task);

    let old_policy = task.sched().lock().policy;
    if let Policy::Deadline { runtime_ns, period_ns, .. } = old_policy {
        let util = deadline::utilization_permille(runtime_ns, period_ns);
        rq(home).lock().dl.release(util);
    }

    let target = if let Policy::Deadline { runtime_ns, period_ns, .. } = policy {
        let util = deadline::utilization_permille(runtime_ns, period_ns);
        match admit_deadline(task, util) {
            Some(cpu) => cpu,
            None => {
                // Roll back: restore the old reservation and queue state.
                if let Policy::Deadline { runtime_ns, period_ns, .. } = old_policy {
                    let old_util = deadline::utilization_permille(runtime_ns, period_ns);
                    let restored = rq(home).lock().dl.try_admit(old_util);
                    debug_assert!(restored, "lost reservation on failed admission");
                }
                if was_queued {
                    rq(home).activate(task.clone(), EnqueueFlags::empty());
                }
                return Err(KernelError::InvalidParameter { what: "deadline reservation over cap" });
            }
        }
    } else {
        home
    };

    {
        let mut info = task.sched().lock();
        info.policy = policy;
        info.rt.timeslice_ns = config::tunables().rr_timeslice_ns();
        info.dl.abs_deadline = 0;
        info.dl.remaining_ns = 0;
        info.dl.throttled_until = 0;
    }
    task.set_cpu(target as u32);
    if was_queued {
        rq(target).activate(task.clone(), EnqueueFlags::empty());
        kick_cpu(target);
    }
    Ok(())
}

fn admit_deadline(task: &Arc<Task>, util_permille: u64) -> Option<usize> {
    let candidates = task.affinity().and(&topology::online_mask());
    for cpu in candidates.iter() {
        if rq(cpu).lock().dl.try_admit(util_permille) {
            return Some(cpu);
        }
    }
    None
}

/// Lend an RT priority to `task` until `unboost` (priority inheritance
/// from a blocked waiter). Requeues the task if its effective class or
/// priority changes while queued.
pub fn boost(task: &Arc<Task>, prio: u8) {
    requeue_with(task, |info| {
        if info.boost.map_or(true, |b| b < prio) {
            info.boost = Some(prio);
        }
    });
}

/// Drop a lent priority.
pub fn unboost(task: &Arc<Task>) {
    requeue_with(task, |info| info.boost = None);
}

fn requeue_with(task: &Arc<Task>, mutate: impl FnOnce(&mut task::SchedInfo)) {
    let home = task.cpu() as usize;
    let was_queued = task.on_rq() && rq(home).deactivate(task);
    mutate(&mut task.sched().lock());
    if was_queued {
        rq(home).activate(task.clone(), EnqueueFlags::empty());
        kick_cpu(home);
    }
}

/// Take a CPU out of service. New placements stop landing on it, queued
/// tasks whose affinity permits are migrated to online CPUs, and vectors
/// steered at it are re-routed. Tasks pinned to this CPU alone stay queued
/// until `online_cpu` brings it back; the task running there is flagged so
/// its next reschedule lands on the drained queue.
pub fn offline_cpu(cpu: usize) -> KernelResult<()> {
    let mut rest = topology::online_mask();
    rest.clear(cpu);
    if rest.is_empty() {
        return Err(KernelError::InvalidParameter { what: "cannot offline the last cpu" });
    }
    if !topology::is_online(cpu) {
        return Ok(());
    }
    topology::set_online(cpu, false);

    let src = rq(cpu);
    let migratable =
        |task: &Arc<Task>| !task.affinity().and(&topology::online_mask()).is_empty();
    let (fair_tasks, rt_tasks, dl_tasks) = {
        let mut inner = src.lock();
        inner.update_clock();
        let fair = inner.fair.detach_filtered(usize::MAX, &migratable);
        let rt = inner.rt.detach_filtered(usize::MAX, &migratable);
        let dl = inner.dl.detach_filtered(usize::MAX, &migratable);
        inner.nr_running -= fair.len() + rt.len() + dl.len();
        (fair, rt, dl)
    };

    for task in fair_tasks {
        let target = select_cpu(&task).unwrap_or(0);
        let mut inner = rq(target).lock();
        task.set_cpu(target as u32);
        inner.fair.attach(&task);
        inner.fair.enqueue(task, false, false);
        inner.nr_running += 1;
    }
    for task in rt_tasks {
        let target = select_cpu(&task).unwrap_or(0);
        let mut inner = rq(target).lock();
        task.set_cpu(target as u32);
        inner.rt.enqueue(task);
        inner.nr_running += 1;
    }
    // Deadline tasks carry their reservation; detach already released it
    // on the source, so each needs a CPU that can re-admit it.
    for task in dl_tasks {
        let util = balance::reservation_of(&task);
        let mut placed = false;
        for target in task.affinity().and(&topology::online_mask()).iter() {
            let mut inner = rq(target).lock();
            if inner.dl.try_admit(util) {
                let now = inner.update_clock();
                task.set_cpu(target as u32);
                inner.dl.enqueue(task.clone(), now);
                inner.nr_running += 1;
                placed = true;
                break;
            }
        }
        if !placed {
            // Nowhere to fit the reservation: it keeps its slot here and
            // waits for the CPU to return.
            let mut inner = src.lock();
            let readmitted = inner.dl.try_admit(util);
            debug_assert!(readmitted, "source lost its own reservation");
            let now = inner.clock_ns;
            inner.dl.enqueue(task, now);
            inner.nr_running += 1;
        }
    }

    if let Some(curr) = src.current() {
        curr.set_need_resched();
        kick_cpu(cpu);
    }
    crate::irq::reroute_for_offline(cpu);
    log::info!("sched: cpu {} offline, queue drained", cpu);
    Ok(())
}

/// Bring a CPU back into service; the load balancer repopulates it.
pub fn online_cpu(cpu: usize) {
    topology::set_online(cpu, true);
    log::info!("sched: cpu {} online", cpu);
}

struct Sleeper {
    waiter: Arc<Waiter>,
    deadline_ns: u64,
}

static SLEEPERS: SpinLock<Vec<Sleeper>> = SpinLock::new(Vec::new());

/// Register a deadline for a parked waiter; the tick path wakes it with a
/// timeout status once the clock passes the deadline.
pub fn register_sleeper(waiter: Arc<Waiter>, deadline_ns: u64) {
    SLEEPERS.lock().push(Sleeper { waiter, deadline_ns });
}

fn expire_sleepers(now: u64) {
    let expired: Vec<Arc<Waiter>> = {
        let mut sleepers = SLEEPERS.lock();
        let mut due = Vec::new();
        sleepers.retain(|s| {
            if !s.waiter.is_pending() {
                return false;
            }
            if s.deadline_ns <= now {
                due.push(s.waiter.clone());
                return false;
            }
            true
        });
        due
    };
    for waiter in expired {
        if waiter.resolve(WakeReason::Timeout) {
            wake(waiter.task());
        }
    }
}

/// Periodic tick entry, called from the timer interrupt with IRQs
/// disabled. Accounts the running task, expires sleepers, and runs the
/// balancer; the actual reschedule happens on IRQ exit.
pub fn scheduler_tick() {
    let rq = this_rq();
    rq.tick();
    let now = time::now_ns();
    expire_sleepers(now);
    crate::irq::storm_tick(now);
    balance::run_periodic(rq);
}

/// Reschedule IPI handler: another CPU flagged our current task.
pub fn resched_ipi() {
    if let Some(curr) = this_rq().current() {
        if curr.need_resched() {
            reschedule_if_allowed();
        }
    }
}

/// Honor a pending `need_resched` if preemption is currently legal.
/// Called on IRQ exit and at voluntary preemption points.
pub fn reschedule_if_allowed() {
    if config::tunables().preempt_voluntary_only {
        return;
    }
    if preempt_count() != 0 {
        switch::defer_resched();
        return;
    }
    schedule();
}

/// Pick and switch on the current CPU. This is the involuntary entry,
/// taken on IRQ exit and deferred-preemption points.
pub fn schedule() {
    schedule_on(this_rq(), false);
}

pub(crate) fn schedule_on(rq: &'static RunQueue, voluntary: bool) {
    crate::kernel_assert!(preempt_count() == 0, "schedule in a non-preemptible region");

    loop {
        let (prev, next) = {
            let mut inner = rq.lock();
            inner.update_clock();
            let now = inner.clock_ns;

            let prev = inner.current.take();
            if let Some(p) = &prev {
                p.clear_need_resched();
                match p.state() {
                    TaskState::Running | TaskState::Runnable => {
                        p.set_state(TaskState::Runnable);
                        p.set_last_ran(now);
                        if !inner.idle.is_idle_task(p) {
                            let class = p.class();
                            put_prev_class(&mut inner, p.clone(), class, now);
                        }
                    }
                    // Blocked, stopped or exiting: drop it from this
                    // queue's accounting here, under the lock a racing
                    // wake must also take.
                    _ => {
                        if p.on_rq() {
                            p.set_on_rq(false);
                            inner.nr_running -= 1;
                        }
                    }
                }
            }

            let next = inner.pick_next();
            next.set_state(TaskState::Running);
            next.clear_need_resched();
            next.set_cpu(rq.cpu());
            inner.current = Some(next.clone());
            (prev, next)
        };

        let went_idle = {
            let inner = rq.lock();
            inner.idle.is_idle_task(&next)
        };
        match prev {
            Some(prev) if !Arc::ptr_eq(&prev, &next) => {
                // Voluntary paths account before they call in; a switch
                // forced on a still-runnable task is a preemption.
                if !voluntary {
                    switch::account_switch(&prev, false);
                }
                switch::context_switch(&prev, &next);
            }
            None => {
                // First dispatch on this CPU; nothing to save.
            }
            _ => {}
        }

        // Idle entry: one pull attempt before committing to sleep.
        if went_idle && rq.nr_running() == 0 {
            if balance::rebalance(rq) > 0 {
                continue;
            }
        }
        return;
    }
}

fn put_prev_class(
    inner: &mut runqueue::RqInner,
    task: Arc<Task>,
    class: SchedClass,
    now: u64,
) {
    use runqueue::ClassQueue;
    match class {
        SchedClass::Stop => ClassQueue::put_prev(&mut inner.stop, task, now),
        SchedClass::Deadline => ClassQueue::put_prev(&mut inner.dl, task, now),
        SchedClass::Rt => ClassQueue::put_prev(&mut inner.rt, task, now),
        SchedClass::Fair => ClassQueue::put_prev(&mut inner.fair, task, now),
        SchedClass::Idle => {}
    }
}

/// Route task placement: keep the current CPU when legal, otherwise the
/// least-loaded online CPU in the affinity mask.
fn select_cpu(task: &Arc<Task>) -> Option<usize> {
    let candidates = task.affinity().and(&topology::online_mask());
    let home = task.cpu() as usize;
    if candidates.test(home) && candidates.is_single() {
        return Some(home);
    }
    if candidates.is_empty() {
        return None;
    }
    let mut best = None;
    for cpu in candidates.iter() {
        let load = rq(cpu).current_load();
        let score = if cpu == home { load.saturating_sub(1) } else { load };
        match best {
            Some((_, best_load)) if best_load <= score => {}
            _ => best = Some((cpu, score)),
        }
    }
    best.map(|(cpu, _)| cpu)
}

fn kick_cpu(cpu: usize) {
    let hal = hal::hal();
    if cpu as u32 != hal.current_cpu_id() {
        hal.send_ipi(cpu as u32, RESCHED_VECTOR);
    }
}
