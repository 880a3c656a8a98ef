//! Fair class
//!
//! Weight-proportional virtual-time scheduling. Each task's runtime is
//! scaled by the inverse of its nice-derived weight into a vruntime; the
//! queue keeps runnable entities ordered by vruntime and always runs the
//! smallest. Sleepers get a bounded credit on wakeup, new tasks a small
//! debit, so neither can monopolize the CPU.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config;

use super::task::{Policy, Task, Tid};

/// Weight of nice 0; the vruntime unit.
pub const NICE_0_LOAD: u64 = 1024;

/// Nice -20..=19 to load weight. Each nice step changes CPU share by ~10%,
/// so the table roughly multiplies by 1.25 per step down.
pub static NICE_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, // -20 .. -16
    29154, 23254, 18705, 14949, 11916, // -15 .. -11
    9548, 7620, 6100, 4904, 3906, // -10 .. -6
    3121, 2501, 1991, 1586, 1277, // -5 .. -1
    1024, 820, 655, 526, 423, // 0 .. 4
    335, 272, 215, 172, 137, // 5 .. 9
    110, 87, 70, 56, 45, // 10 .. 14
    36, 29, 23, 18, 15, // 15 .. 19
];

/// Load weight for a nice level.
pub fn weight_of(nice: i8) -> u64 {
    let idx = (nice as i32 + 20).clamp(0, 39) as usize;
    NICE_TO_WEIGHT[idx]
}

/// Weight of a task as currently configured; `NICE_0_LOAD` for anything
/// that is not fair-class (only meaningful while it is).
pub fn task_weight(task: &Task) -> u64 {
    match task.sched().lock().policy {
        Policy::Fair { nice } => weight_of(nice),
        _ => NICE_0_LOAD,
    }
}

/// Real time to virtual time for a given weight.
fn calc_delta_fair(delta_ns: u64, weight: u64) -> u64 {
    delta_ns * NICE_0_LOAD / weight
}

/// Per-CPU fair runqueue. The running task is not in the tree; `put_prev`
/// reinserts it.
pub struct FairQueue {
    tree: BTreeMap<(u64, Tid), Arc<Task>>,
    /// Monotonic floor for wakeup placement. Never decreases while the
    /// queue stays non-empty.
    min_vruntime: u64,
    /// Sum of queued weights, for load balancing and slice computation.
    load_weight: u64,
    /// Real time the current task has run since it was picked.
    curr_slice_ns: u64,
}

impl FairQueue {
    pub const fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
            min_vruntime: 0,
            load_weight: 0,
            curr_slice_ns: 0,
        }
    }

    pub fn nr_queued(&self) -> usize {
        self.tree.len()
    }

    pub fn load_weight(&self) -> u64 {
        self.load_weight
    }

    pub fn min_vruntime(&self) -> u64 {
        self.min_vruntime
    }

    /// Fair share of the target latency for `weight` against the queue's
    /// current total, floored at the minimum granularity. The period
    /// stretches when enough tasks are runnable that everyone's floor no
    /// longer fits.
    pub fn sched_slice(&self, weight: u64) -> u64 {
        let t = config::tunables();
        let nr = self.tree.len() as u64 + 1; // current included
        let period = t.sched_latency_ns.max(nr * t.min_granularity_ns);
        let total = self.load_weight + weight;
        (period * weight / total).max(t.min_granularity_ns)
    }

    /// Place and insert a runnable entity.
    ///
    /// `new` tasks start at `min_vruntime` plus a one-slice debit so a
    /// fork bomb cannot starve the queue. Waking sleepers are clamped to
    /// at most half a latency period of credit, which rewards sleeping
    /// without allowing unbounded runaway.
    pub fn enqueue(&mut self, task: Arc<Task>, wakeup: bool, new: bool) {
        let t = config::tunables();
        let weight = task_weight(&task);
        let vruntime = {
            let mut info = task.sched().lock();
            if new {
                info.fair.vruntime =
                    self.min_vruntime + calc_delta_fair(t.min_granularity_ns, weight);
            } else if wakeup {
                let floor = self.min_vruntime.saturating_sub(t.sched_latency_ns / 2);
                if info.fair.vruntime < floor {
                    info.fair.vruntime = floor;
                }
            }
            info.fair.vruntime
        };
        self.load_weight += weight;
        self.tree.insert((vruntime, task.tid()), task);
    }

    /// Remove a specific entity. Returns false if it was not queued.
    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        let key = (task.sched().lock().fair.vruntime, task.tid());
        match self.tree.remove(&key) {
            Some(_) => {
                self.load_weight -= task_weight(task);
                true
            }
            None => false,
        }
    }

    /// Pop the leftmost entity and start its slice accounting.
    pub fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        let (&key, _) = self.tree.iter().next()?;
        let task = self.tree.remove(&key).expect("leftmost vanished under lock");
        self.load_weight -= task_weight(&task);
        task.sched().lock().fair.exec_start = now;
        self.curr_slice_ns = 0;
        self.advance_min_vruntime(key.0);
        Some(task)
    }

    /// Return the previously running entity to the tree if still runnable.
    pub fn put_prev(&mut self, task: Arc<Task>) {
        let vruntime = task.sched().lock().fair.vruntime;
        self.load_weight += task_weight(&task);
        self.tree.insert((vruntime, task.tid()), task);
    }

    /// Account the running task's tick. Returns true when the current task
    /// should be preempted.
    pub fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        let t = config::tunables();
        let weight = task_weight(curr);
        let vruntime = {
            let mut info = curr.sched().lock();
            let delta = now.saturating_sub(info.fair.exec_start);
            info.fair.exec_start = now;
            info.fair.vruntime += calc_delta_fair(delta, weight);
            curr.stats.sum_exec_runtime.fetch_add(delta, Ordering::Relaxed);
            self.curr_slice_ns += delta;
            info.fair.vruntime
        };
        self.advance_min_vruntime(vruntime);

        let Some((&(leftmost, _), _)) = self.tree.iter().next() else {
            return false;
        };
        if self.curr_slice_ns < t.min_granularity_ns {
            return false;
        }
        // Preempt on a clear vruntime deficit, or when the fair share of
        // the period is used up.
        vruntime > leftmost + t.wakeup_granularity_ns
            || self.curr_slice_ns >= self.sched_slice(weight)
    }

    /// Would an enqueued wakeup deserve the CPU over `curr` immediately?
    pub fn should_preempt_curr(&self, curr: &Arc<Task>, woken: &Arc<Task>) -> bool {
        let gran = config::tunables().wakeup_granularity_ns;
        let curr_vr = curr.sched().lock().fair.vruntime;
        let woken_vr = woken.sched().lock().fair.vruntime;
        curr_vr > woken_vr + gran
    }

    /// Detach up to `max` entities matching `eligible`, rightmost first
    /// (largest vruntime, least likely to run soon). Used for migration;
    /// each detached entity leaves with its vruntime rebased relative to
    /// this queue's floor, and `attach` grounds it on the destination.
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
                self.load_weight -= task_weight(&task);
                let mut info = task.sched().lock();
                info.fair.vruntime = info.fair.vruntime.saturating_sub(self.min_vruntime);
                drop(info);
                out.push(task);
            }
        }
        out
    }

    /// Ground a migrating entity, detached elsewhere, on this queue's
    /// virtual clock. Must run before the entity is enqueued here, or its
    /// source-relative vruntime would be compared against an unrelated
    /// clock.
    pub fn attach(&self, task: &Arc<Task>) {
        let mut info = task.sched().lock();
        info.fair.vruntime += self.min_vruntime;
    }

    fn advance_min_vruntime(&mut self, candidate: u64) {
        let floor = match self.tree.iter().next() {
            Some((&(leftmost, _), _)) => candidate.min(leftmost),
            None => candidate,
        };
        if floor > self.min_vruntime {
            self.min_vruntime = floor;
        }
    }
}

impl Default for FairQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Task;

    const TICK: u64 = 500_000; // 0.5 ms

    fn fair_task(name: &str, nice: i8) -> Arc<Task> {
        Task::with_policy_for_tests(name, Policy::Fair { nice })
    }

    /// Drive a pick/tick/put loop for `total_ns` of simulated time.
    fn run_hogs(tasks: &[Arc<Task>], total_ns: u64) {
        let mut q = FairQueue::new();
        for task in tasks {
            q.enqueue(task.clone(), false, true);
        }
        let mut now = 0;
        let mut curr = q.pick_next(now).expect("queue non-empty");
        while now < total_ns {
            now += TICK;
            if q.task_tick(&curr, now) {
                q.put_prev(curr);
                curr = q.pick_next(now).expect("queue non-empty");
            }
        }
    }

    fn runtime(task: &Arc<Task>) -> u64 {
        task.stats.sum_exec_runtime.load(Ordering::Relaxed)
    }

    #[test]
    fn weight_table_anchors() {
        assert_eq!(weight_of(0), 1024);
        assert_eq!(weight_of(-20), 88761);
        assert_eq!(weight_of(19), 15);
        assert_eq!(weight_of(5), 335);
    }

    #[test]
    fn equal_nice_hogs_converge() {
        let a = fair_task("hog-a", 0);
        let b = fair_task("hog-b", 0);
        run_hogs(&[a.clone(), b.clone()], 5_000_000_000);
        let (ra, rb) = (runtime(&a), runtime(&b));
        let diff = ra.abs_diff(rb);
        // Within 2% of each other after 5 s.
        assert!(
            diff * 100 <= (ra + rb),
            "imbalance: {} vs {}",
            ra,
            rb
        );
    }

    #[test]
    fn nice_asymmetry_matches_weight_ratio() {
        let fast = fair_task("nice0", 0);
        let slow = fair_task("nice5", 5);
        run_hogs(&[fast.clone(), slow.clone()], 5_000_000_000);
        let (rf, rs) = (runtime(&fast), runtime(&slow));
        // Expected ratio w(0)/w(5) = 1024/335, within 10%.
        let expected_permille = 1024 * 1000 / 335;
        let measured_permille = rf * 1000 / rs;
        let err = measured_permille.abs_diff(expected_permille) * 100 / expected_permille;
        assert!(err <= 10, "ratio {} vs expected {}", measured_permille, expected_permille);
    }

    #[test]
    fn min_vruntime_is_monotonic() {
        let tasks: Vec<_> = (0..4).map(|i| fair_task("t", (i * 3) as i8)).collect();
        let mut q = FairQueue::new();
        for task in &tasks {
            q.enqueue(task.clone(), false, true);
        }
        let mut now = 0;
        let mut prev_min = q.min_vruntime();
        let mut curr = q.pick_next(now).unwrap();
        for _ in 0..1000 {
            now += TICK;
            if q.task_tick(&curr, now) {
                q.put_prev(curr);
                curr = q.pick_next(now).unwrap();
            }
            assert!(q.min_vruntime() >= prev_min);
            prev_min = q.min_vruntime();
        }
    }

    #[test]
    fn wakeup_placement_is_clamped() {
        let mut q = FairQueue::new();
        let hog = fair_task("hog", 0);
        q.enqueue(hog.clone(), false, true);
        let mut now = 0;
        let mut curr = q.pick_next(now).unwrap();
        for _ in 0..2000 {
            now += TICK;
            if q.task_tick(&curr, now) {
                q.put_prev(curr);
                curr = q.pick_next(now).unwrap();
            }
        }
        let min_vr = q.min_vruntime();
        assert!(min_vr > 0);

        // A task that slept the whole time wakes with bounded credit, not
        // its ancient vruntime.
        let sleeper = fair_task("sleeper", 0);
        q.enqueue(sleeper.clone(), true, false);
        let placed = sleeper.sched().lock().fair.vruntime;
        let latency = config::tunables().sched_latency_ns;
        assert_eq!(placed, min_vr - latency / 2);
    }

    #[test]
    fn new_task_starts_with_debit() {
        let mut q = FairQueue::new();
        let first = fair_task("first", 0);
        q.enqueue(first, false, true);
        let min_vr = q.min_vruntime();
        let fresh = fair_task("fresh", 0);
        q.enqueue(fresh.clone(), false, true);
        assert!(fresh.sched().lock().fair.vruntime > min_vr);
    }

    #[test]
    fn enqueue_dequeue_restores_counts() {
        let mut q = FairQueue::new();
        let a = fair_task("a", 0);
        let b = fair_task("b", 3);
        q.enqueue(a.clone(), false, true);
        let (nr, load) = (q.nr_queued(), q.load_weight());
        q.enqueue(b.clone(), false, true);
        assert!(q.dequeue(&b));
        assert_eq!(q.nr_queued(), nr);
        assert_eq!(q.load_weight(), load);
        assert!(!q.dequeue(&b));
    }

    #[test]
    fn detach_prefers_rightmost() {
        let mut q = FairQueue::new();
        let tasks: Vec<_> = (0..3).map(|_| fair_task("t", 0)).collect();
        for (i, task) in tasks.iter().enumerate() {
            task.sched().lock().fair.vruntime = (i as u64 + 1) * 1_000_000;
            q.enqueue(task.clone(), false, false);
        }
        let stolen = q.detach_filtered(1, |_| true);
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen[0].tid(), tasks[2].tid());
        assert_eq!(q.nr_queued(), 2);
    }

    #[test]
    fn migration_rebases_vruntime_on_the_destination() {
        let mut src = FairQueue::new();
        let mut dst = FairQueue::new();

        // Source queue whose virtual clock is far ahead.
        let veteran = fair_task("veteran", 0);
        veteran.sched().lock().fair.vruntime = 50_000_000;
        src.enqueue(veteran.clone(), false, false);
        let picked = src.pick_next(0).unwrap();
        src.put_prev(picked);
        assert_eq!(src.min_vruntime(), 50_000_000);

        // Destination clock has barely moved.
        let native = fair_task("native", 0);
        native.sched().lock().fair.vruntime = 3_000_000;
        dst.enqueue(native.clone(), false, false);
        let picked = dst.pick_next(0).unwrap();
        dst.put_prev(picked);
        assert_eq!(dst.min_vruntime(), 3_000_000);

        let moved = src.detach_filtered(1, |_| true);
        assert_eq!(moved.len(), 1);
        dst.attach(&moved[0]);
        dst.enqueue(moved[0].clone(), false, false);

        // The migrant lands at the destination floor instead of dragging
        // its 50 ms of source history along and starving.
        assert_eq!(moved[0].sched().lock().fair.vruntime, dst.min_vruntime());
        assert!(
            moved[0].sched().lock().fair.vruntime <= native.sched().lock().fair.vruntime
        );
    }
}
