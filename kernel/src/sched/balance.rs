//! Load balancer
//!
//! Walks the topology inside out (SMT siblings, cores, packages, NUMA) and
//! pulls work from the busiest eligible peer toward the CPU running the
//! balance pass. Wider levels demand a larger imbalance and a colder cache
//! before a migration pays off. Runs from the periodic tick and when a CPU
//! is about to enter idle.

use alloc::sync::Arc;

use crate::config;
use crate::cpu::topology::{self, TopologyLevel};

use super::deadline;
use super::fair::NICE_0_LOAD;
use super::runqueue::{rq, RunQueue};
use super::task::{Policy, Task};

/// Load gap below which a level will not bother migrating, before the
/// level cost multiplier.
const BASE_IMBALANCE: u64 = NICE_0_LOAD / 2;

/// Periodic entry: rate-limited per runqueue, with exponential backoff
/// after fruitless attempts.
pub fn run_periodic(this: &'static RunQueue) {
    let due = {
        let mut inner = this.lock();
        let now = inner.update_clock();
        let interval = config::tunables().load_balance_interval_ms * 1_000_000;
        let backoff = interval << inner.balance_failures.min(4);
        if now < inner.last_balance_ns + backoff {
            false
        } else {
            inner.last_balance_ns = now;
            true
        }
    };
    if due {
        rebalance(this);
    }
}

/// One full balance pass. Returns the number of tasks pulled.
pub fn rebalance(this: &'static RunQueue) -> usize {
    let my_cpu = this.cpu() as usize;
    let my_load = this.current_load();

    for level in TopologyLevel::ALL {
        let peers = topology::peers(my_cpu, level);
        let busiest = peers
            .iter()
            .map(|cpu| (cpu, rq(cpu).current_load()))
            .max_by_key(|&(_, load)| load);
        let Some((victim_cpu, victim_load)) = busiest else {
            continue;
        };
        let threshold = BASE_IMBALANCE * level.cost_factor();
        if victim_load <= my_load + threshold {
            continue;
        }
        let moved = pull_tasks(rq(victim_cpu), this, (victim_load - my_load) / 2, level);
        if moved > 0 {
            this.lock().balance_failures = 0;
            return moved;
        }
    }
    let mut inner = this.lock();
    inner.balance_failures = inner.balance_failures.saturating_add(1);
    0
}

/// Detach up to half the imbalance from `src` and attach it to `dst`.
/// Both runqueue locks are held, taken in CPU-id order.
fn pull_tasks(src: &RunQueue, dst: &RunQueue, imbalance: u64, level: TopologyLevel) -> usize {
    if src.cpu() == dst.cpu() {
        return 0;
    }
    let (mut src_inner, mut dst_inner) = if src.cpu() < dst.cpu() {
        let s = src.lock();
        let d = dst.lock();
        (s, d)
    } else {
        let d = dst.lock();
        let s = src.lock();
        (s, d)
    };
    let now = src_inner.clock_ns;
    let dst_cpu = dst.cpu();
    let hot_cutoff = config::tunables().migration_cost_ns * level.cost_factor();

    let eligible = |task: &Arc<Task>| {
        let affinity = task.affinity();
        if affinity.is_single() || !affinity.test(dst_cpu as usize) {
            return false;
        }
        // Prefer cache-cold tasks; a task that never ran is cold.
        let last = task.last_ran();
        last == 0 || now.saturating_sub(last) > hot_cutoff
    };

    let mut moved = 0;

    // Fair tasks carry the imbalance budget: move roughly enough weight to
    // halve the gap.
    let max_fair = ((imbalance / NICE_0_LOAD).max(1) as usize).min(src_inner.fair.nr_queued());
    let fair_tasks = src_inner.fair.detach_filtered(max_fair, &eligible);
    for task in fair_tasks {
        src_inner.nr_running -= 1;
        task.set_cpu(dst_cpu);
        // Detach left the vruntime relative to the source floor; ground
        // it on the destination clock before it competes there.
        dst_inner.fair.attach(&task);
        dst_inner.fair.enqueue(task, false, false);
        dst_inner.nr_running += 1;
        moved += 1;
    }

    // RT moves only off an overloaded source toward an RT-idle CPU.
    if src_inner.rt.nr_queued() > 1 && dst_inner.rt.nr_queued() == 0 {
        for task in src_inner.rt.detach_filtered(1, &eligible) {
            src_inner.nr_running -= 1;
            task.set_cpu(dst_cpu);
            dst_inner.rt.enqueue(task);
            dst_inner.nr_running += 1;
            moved += 1;
        }
    }

    // Deadline tasks move only with their reservation re-admitted on the
    // destination; detach already released it on the source.
    if src_inner.dl.nr_queued() > 1 {
        for task in src_inner.dl.detach_filtered(1, &eligible) {
            let util = reservation_of(&task);
            if dst_inner.dl.try_admit(util) {
                src_inner.nr_running -= 1;
                task.set_cpu(dst_cpu);
                dst_inner.dl.enqueue(task, now);
                dst_inner.nr_running += 1;
                moved += 1;
            } else {
                // No room: hand the reservation back and requeue at home.
                let readmitted = src_inner.dl.try_admit(util);
                debug_assert!(readmitted, "source lost its own reservation");
                src_inner.dl.enqueue(task, now);
            }
        }
    }

    moved
}

pub(super) fn reservation_of(task: &Arc<Task>) -> u64 {
    match task.sched().lock().policy {
        Policy::Deadline { runtime_ns, period_ns, .. } => {
            deadline::utilization_permille(runtime_ns, period_ns)
        }
        _ => 0,
    }
}

impl RunQueue {
    /// Balancer-facing load: the smoothed average, or the instantaneous
    /// value when it is higher (a burst should be visible immediately).
    pub fn current_load(&self) -> u64 {
        let inner = self.lock();
        inner.load_avg.max(inner.instantaneous_load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuMask;
    use crate::sched::runqueue::EnqueueFlags;
    use crate::sched::task::Task;
    use crate::test_util;

    // All tests here mutate the shared runqueue array; they serialize on
    // the global test lock and drain what they enqueued before returning.

    #[test]
    fn pull_moves_cold_tasks_once() {
        test_util::init_topology();
        let _serial = test_util::global_lock();
        let src = rq(5);
        let dst = rq(4);
        let tasks: alloc::vec::Vec<_> = (0..4).map(|_| Task::new_for_tests("hog")).collect();
        for task in &tasks {
            src.activate(task.clone(), EnqueueFlags::NEW);
        }

        let moved = pull_tasks(src, dst, 2 * NICE_0_LOAD, TopologyLevel::Smt);
        assert!(moved >= 1);
        for task in &tasks {
            // Invariant: each task sits on exactly one runqueue.
            let home = rq(task.cpu() as usize);
            assert!(task.on_rq());
            assert!(home.deactivate(task));
            assert!(!rq(5).deactivate(task) && !rq(4).deactivate(task));
        }
    }

    #[test]
    fn pinned_tasks_stay_put() {
        test_util::init_topology();
        let _serial = test_util::global_lock();
        let src = rq(7);
        let dst = rq(6);
        let pinned = Task::new_for_tests("pinned");
        pinned.set_affinity_mask(CpuMask::single(7));
        src.activate(pinned.clone(), EnqueueFlags::NEW);

        let moved = pull_tasks(src, dst, 4 * NICE_0_LOAD, TopologyLevel::Smt);
        assert_eq!(moved, 0);
        assert_eq!(pinned.cpu(), 7);
        assert!(src.deactivate(&pinned));
    }

    #[test]
    fn affinity_excluding_destination_blocks_pull() {
        test_util::init_topology();
        let _serial = test_util::global_lock();
        let src = rq(5);
        let dst = rq(4);
        let task = Task::new_for_tests("avoidant");
        let mut mask = CpuMask::empty();
        mask.set(5);
        mask.set(6);
        task.set_affinity_mask(mask);
        src.activate(task.clone(), EnqueueFlags::NEW);

        assert_eq!(pull_tasks(src, dst, 4 * NICE_0_LOAD, TopologyLevel::Smt), 0);
        assert!(src.deactivate(&task));
    }

    #[test]
    fn rebalance_pulls_from_busiest_sibling() {
        test_util::init_topology();
        let _serial = test_util::global_lock();
        let this = rq(6);
        let victim = rq(7);
        let tasks: alloc::vec::Vec<_> = (0..6).map(|_| Task::new_for_tests("load")).collect();
        for task in &tasks {
            victim.activate(task.clone(), EnqueueFlags::NEW);
        }

        let moved = rebalance(this);
        assert!(moved >= 1);
        assert!(tasks.iter().any(|t| t.cpu() == 6));
        // Cleanup so later tests see these queues near-empty.
        for task in &tasks {
            rq(task.cpu() as usize).deactivate(task);
        }
    }

    #[test]
    fn fruitless_attempts_back_off() {
        test_util::init_topology();
        let _serial = test_util::global_lock();
        let this = rq(4);
        let before = this.lock().balance_failures;
        // Nothing queued anywhere nearby for this pass to take.
        assert_eq!(rebalance(this), 0);
        assert!(this.lock().balance_failures > before);
    }
}
