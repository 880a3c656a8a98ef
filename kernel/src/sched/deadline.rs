//! Deadline class
//!
//! Earliest-deadline-first dispatch with a constant-bandwidth server. Each
//! task reserves `(runtime, deadline, period)`; admission keeps the summed
//! utilization on a CPU below the configured cap, and a task that burns its
//! budget is throttled until its replenishment instant.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config;

use super::task::{Policy, Task, Tid};

/// Reservation utilization in permille of one CPU.
pub fn utilization_permille(runtime_ns: u64, period_ns: u64) -> u64 {
    runtime_ns * 1000 / period_ns
}

fn params(task: &Task) -> (u64, u64, u64) {
    match task.sched().lock().policy {
        Policy::Deadline { runtime_ns, deadline_ns, period_ns } => {
            (runtime_ns, deadline_ns, period_ns)
        }
        _ => panic!("non-deadline task on deadline queue"),
    }
}

pub struct DlQueue {
    /// Runnable tasks ordered by absolute deadline.
    tree: BTreeMap<(u64, Tid), Arc<Task>>,
    /// Tasks that exhausted their budget, waiting for replenishment.
    parked: Vec<Arc<Task>>,
    /// Summed utilization of admitted reservations on this CPU, permille.
    admitted_permille: u64,
    last_update_ns: u64,
}

impl DlQueue {
    pub const fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            parked: Vec::new(),
            admitted_permille: 0,
            last_update_ns: 0,
        }
    }

    pub fn nr_queued(&self) -> usize {
        self.tree.len()
    }

    pub fn admitted_permille(&self) -> u64 {
        self.admitted_permille
    }

    /// Reserve bandwidth on this CPU. Fails when the cap would be crossed;
    /// no state changes on failure.
    pub fn try_admit(&mut self, util_permille: u64) -> bool {
        let cap = config::tunables().dl_utilization_cap_permille;
        if self.admitted_permille + util_permille > cap {
            return false;
        }
        self.admitted_permille += util_permille;
        true
    }

    /// Give back a reservation (policy change, exit, or migration away).
    pub fn release(&mut self, util_permille: u64) {
        self.admitted_permille = self.admitted_permille.saturating_sub(util_permille);
    }

    /// Enqueue a runnable deadline task, applying the CBS wakeup rule.
    ///
    /// Waking past the absolute deadline starts a fresh period. Waking
    /// early keeps the remaining `(budget, deadline)` pair only while it
    /// is still bandwidth-feasible, i.e. `remaining / (deadline - now)`
    /// does not exceed the reserved `runtime / period`; otherwise the
    /// deadline is pushed out a full relative deadline with a fresh budget.
    pub fn enqueue(&mut self, task: Arc<Task>, now: u64) {
        let (runtime, deadline, period) = params(&task);
        let key = {
            let mut info = task.sched().lock();
            let fresh = info.dl.abs_deadline <= now
                || info.dl.remaining_ns * period > runtime * (info.dl.abs_deadline - now);
            if fresh {
                info.dl.abs_deadline = now + deadline;
                info.dl.remaining_ns = runtime;
            }
            info.dl.throttled_until = 0;
            (info.dl.abs_deadline, task.tid())
        };
        self.tree.insert(key, task);
    }

    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        let key = (task.sched().lock().dl.abs_deadline, task.tid());
        if self.tree.remove(&key).is_some() {
            return true;
        }
        let Some(pos) = self.parked.iter().position(|t| t.tid() == task.tid()) else {
            return false;
        };
        self.parked.remove(pos);
        true
    }

    /// Earliest absolute deadline, replenishing any parked task whose
    /// period boundary has passed.
    pub fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        self.replenish(now);
        let (&key, _) = self.tree.iter().next()?;
        let task = self.tree.remove(&key).expect("leftmost vanished under lock");
        self.last_update_ns = now;
        Some(task)
    }

    /// Return the previous task: back into the tree while it has budget,
    /// parked until replenishment otherwise.
    pub fn put_prev(&mut self, task: Arc<Task>) {
        let throttled = {
            let info = task.sched().lock();
            info.dl.throttled_until != 0 || info.dl.remaining_ns == 0
        };
        if throttled {
            self.parked.push(task);
        } else {
            let key = (task.sched().lock().dl.abs_deadline, task.tid());
            self.tree.insert(key, task);
        }
    }

    /// Account the running deadline task. Returns true when it must yield:
    /// budget exhausted, deadline missed, or an earlier deadline waiting.
    pub fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        let delta = now.saturating_sub(self.last_update_ns);
        self.last_update_ns = now;
        curr.stats.sum_exec_runtime.fetch_add(delta, Ordering::Relaxed);

        let exhausted = {
            let mut info = curr.sched().lock();
            info.dl.remaining_ns = info.dl.remaining_ns.saturating_sub(delta);
            if info.dl.remaining_ns == 0 || now >= info.dl.abs_deadline {
                // Budget gone, or the deadline itself passed with budget
                // to spare: either way the period is over. Throttled
                // until the deadline, where the next period's budget
                // arrives (immediately, when already behind).
                info.dl.throttled_until = info.dl.abs_deadline;
                true
            } else {
                false
            }
        };
        if exhausted {
            return true;
        }
        self.replenish(now);
        match self.tree.iter().next() {
            Some((&(earliest, _), _)) => earliest < curr.sched().lock().dl.abs_deadline,
            None => false,
        }
    }

    /// A waking deadline task preempts a deadline current with a later
    /// absolute deadline.
    pub fn should_preempt_curr(curr: &Arc<Task>, woken: &Arc<Task>) -> bool {
        woken.sched().lock().dl.abs_deadline < curr.sched().lock().dl.abs_deadline
    }

    pub fn has_runnable(&mut self, now: u64) -> bool {
        self.replenish(now);
        !self.tree.is_empty()
    }

    /// Detach up to `max` eligible runnable tasks, latest deadline first.
    pub fn detach_filtered(
        &mut self,
        max: usize,
        eligible: impl Fn(&Arc<Task>) -> bool,
    ) -> Vec<Arc<Task>> {
        let keys: Vec<(u64, Tid)> = self
            .tree
            .iter()
            .rev()
            .filter(|(_, task)| eligible(task))
            .take(max)
            .map(|(&k, _)| k)
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(task) = self.tree.remove(&key) {
                let (runtime, _, period) = params(&task);
                self.release(utilization_permille(runtime, period));
                out.push(task);
            }
        }
        out
    }

    /// Move parked tasks whose replenishment instant has passed back into
    /// the tree with a fresh period.
    fn replenish(&mut self, now: u64) {
        let mut i = 0;
        while i < self.parked.len() {
            let due = self.parked[i].sched().lock().dl.throttled_until <= now;
            if due {
                let task = self.parked.swap_remove(i);
                let (runtime, deadline, _) = params(&task);
                let key = {
                    let mut info = task.sched().lock();
                    info.dl.abs_deadline = now + deadline;
                    info.dl.remaining_ns = runtime;
                    info.dl.throttled_until = 0;
                    (info.dl.abs_deadline, task.tid())
                };
                self.tree.insert(key, task);
            } else {
                i += 1;
            }
        }
    }
}

impl Default for DlQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Task;

    const MS: u64 = 1_000_000;

    fn dl(name: &str, runtime: u64, deadline: u64, period: u64) -> Arc<Task> {
        Task::with_policy_for_tests(
            name,
            Policy::Deadline { runtime_ns: runtime, deadline_ns: deadline, period_ns: period },
        )
    }

    #[test]
    fn earliest_deadline_first() {
        let mut q = DlQueue::new();
        let late = dl("late", 2 * MS, 50 * MS, 50 * MS);
        let soon = dl("soon", 2 * MS, 10 * MS, 10 * MS);
        q.enqueue(late, 0);
        q.enqueue(soon.clone(), 0);
        assert_eq!(q.pick_next(0).unwrap().tid(), soon.tid());
    }

    #[test]
    fn admission_respects_cap() {
        let mut q = DlQueue::new();
        // 900 permille admitted.
        assert!(q.try_admit(utilization_permille(9 * MS, 10 * MS)));
        // A full-CPU reservation no longer fits under the 950 cap.
        assert!(!q.try_admit(utilization_permille(10 * MS, 10 * MS)));
        assert_eq!(q.admitted_permille(), 900);
        // A small one still does.
        assert!(q.try_admit(utilization_permille(1 * MS, 100 * MS)));
        q.release(10);
        assert_eq!(q.admitted_permille(), 900);
    }

    #[test]
    fn budget_exhaustion_throttles_until_deadline() {
        let mut q = DlQueue::new();
        let task = dl("t", 2 * MS, 10 * MS, 10 * MS);
        q.enqueue(task.clone(), 0);
        let curr = q.pick_next(0).unwrap();

        // Burn the whole 2 ms budget.
        assert!(q.task_tick(&curr, 2 * MS));
        q.put_prev(curr);
        assert_eq!(q.nr_queued(), 0);
        assert!(q.pick_next(5 * MS).is_none());

        // At the old deadline the budget returns with the next period.
        let again = q.pick_next(10 * MS).unwrap();
        assert_eq!(again.tid(), task.tid());
        let info = again.sched().lock();
        assert_eq!(info.dl.remaining_ns, 2 * MS);
        assert_eq!(info.dl.abs_deadline, 20 * MS);
    }

    #[test]
    fn early_wakeup_keeps_feasible_state() {
        let mut q = DlQueue::new();
        let task = dl("t", 4 * MS, 10 * MS, 10 * MS);
        q.enqueue(task.clone(), 0);
        let curr = q.pick_next(0).unwrap();
        // Run 1 ms, block, wake at 2 ms: 3 ms left over 8 ms to the
        // deadline is under the reserved 4/10, so the pair is kept.
        q.task_tick(&curr, 1 * MS);
        q.enqueue(curr, 2 * MS);
        let info = task.sched().lock();
        assert_eq!(info.dl.abs_deadline, 10 * MS);
        assert_eq!(info.dl.remaining_ns, 3 * MS);
    }

    #[test]
    fn infeasible_wakeup_postpones_deadline() {
        let mut q = DlQueue::new();
        let task = dl("t", 4 * MS, 10 * MS, 10 * MS);
        q.enqueue(task.clone(), 0);
        let curr = q.pick_next(0).unwrap();
        // Wake at 9 ms with ~3 ms left against 1 ms of headroom: over the
        // reserved bandwidth, so a fresh period starts.
        q.task_tick(&curr, 1 * MS);
        q.enqueue(curr, 9 * MS);
        let info = task.sched().lock();
        assert_eq!(info.dl.abs_deadline, 19 * MS);
        assert_eq!(info.dl.remaining_ns, 4 * MS);
    }

    #[test]
    fn deadline_miss_with_budget_left_still_ends_the_period() {
        let mut q = DlQueue::new();
        let task = dl("t", 4 * MS, 10 * MS, 10 * MS);
        q.enqueue(task.clone(), 0);
        let curr = q.pick_next(0).unwrap();
        // 1 ms of the 4 ms budget used; plenty remains.
        assert!(!q.task_tick(&curr, 1 * MS));
        q.put_prev(curr);

        // Nothing happens until just before the deadline, then the task
        // crosses it with budget to spare. It must yield anyway.
        let curr = q.pick_next(9 * MS).unwrap();
        assert!(q.task_tick(&curr, 10 * MS + 1));
        {
            let info = task.sched().lock();
            assert!(info.dl.remaining_ns > 0);
            assert_eq!(info.dl.throttled_until, 10 * MS);
        }
        q.put_prev(curr);

        // The replenishment instant is already behind: the next pick
        // starts a fresh period immediately.
        let again = q.pick_next(11 * MS).unwrap();
        assert_eq!(again.tid(), task.tid());
        let info = again.sched().lock();
        assert_eq!(info.dl.remaining_ns, 4 * MS);
        assert_eq!(info.dl.abs_deadline, 21 * MS);
    }

    #[test]
    fn earlier_waiter_preempts_on_tick() {
        let mut q = DlQueue::new();
        let curr = dl("curr", 2 * MS, 100 * MS, 100 * MS);
        q.enqueue(curr.clone(), 0);
        let curr = q.pick_next(0).unwrap();
        assert!(!q.task_tick(&curr, 1 * MS));
        let urgent = dl("urgent", 1 * MS, 5 * MS, 5 * MS);
        q.enqueue(urgent, 1 * MS);
        assert!(q.task_tick(&curr, 2 * MS));
    }
}
