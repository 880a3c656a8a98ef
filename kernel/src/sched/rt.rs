//! Real-time class
//!
//! Fixed priorities 0..=99, higher wins. FIFO tasks run until they block or
//! a higher priority arrives; round-robin tasks additionally rotate to the
//! bucket tail when their slice runs out. A per-CPU bandwidth cap keeps a
//! runaway RT task from starving the fair class entirely.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::config;

use super::task::{Policy, Task};

pub const RT_PRIO_LEVELS: usize = 100;

pub struct RtQueue {
    buckets: [VecDeque<Arc<Task>>; RT_PRIO_LEVELS],
    /// Bit `p` set iff bucket `p` is non-empty; O(1) highest lookup.
    bitmap: [u64; 2],
    nr_queued: usize,

    /// Bandwidth accounting for the cap.
    period_start_ns: u64,
    consumed_ns: u64,
    throttled: bool,

    /// Clock of the last accounting update for the running RT task.
    last_update_ns: u64,
    /// Set when the slice of the current RR task expired with a peer
    /// waiting; `put_prev` then requeues at the tail instead of the head.
    rotate_curr: bool,
}

impl RtQueue {
    pub fn new() -> Self {
        const BUCKET: VecDeque<Arc<Task>> = VecDeque::new();
        Self {
            buckets: [BUCKET; RT_PRIO_LEVELS],
            bitmap: [0; 2],
            nr_queued: 0,
            period_start_ns: 0,
            consumed_ns: 0,
            throttled: false,
            last_update_ns: 0,
            rotate_curr: false,
        }
    }

    pub fn nr_queued(&self) -> usize {
        self.nr_queued
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Highest non-empty priority.
    pub fn highest_prio(&self) -> Option<u8> {
        if self.bitmap[1] != 0 {
            return Some(64 + (63 - self.bitmap[1].leading_zeros()) as u8);
        }
        if self.bitmap[0] != 0 {
            return Some((63 - self.bitmap[0].leading_zeros()) as u8);
        }
        None
    }

    fn mark(&mut self, prio: usize) {
        self.bitmap[prio / 64] |= 1 << (prio % 64);
    }

    fn unmark_if_empty(&mut self, prio: usize) {
        if self.buckets[prio].is_empty() {
            self.bitmap[prio / 64] &= !(1 << (prio % 64));
        }
    }

    pub fn enqueue(&mut self, task: Arc<Task>) {
        let prio = task.rt_prio() as usize;
        {
            let mut info = task.sched().lock();
            if info.rt.timeslice_ns == 0 {
                info.rt.timeslice_ns = config::tunables().rr_timeslice_ns();
            }
        }
        self.buckets[prio].push_back(task);
        self.mark(prio);
        self.nr_queued += 1;
    }

    pub fn dequeue(&mut self, task: &Arc<Task>) -> bool {
        let prio = task.rt_prio() as usize;
        let bucket = &mut self.buckets[prio];
        let Some(pos) = bucket.iter().position(|t| t.tid() == task.tid()) else {
            return false;
        };
        bucket.remove(pos);
        self.unmark_if_empty(prio);
        self.nr_queued -= 1;
        true
    }

    /// Head of the highest bucket, unless the class is throttled.
    pub fn pick_next(&mut self, now: u64) -> Option<Arc<Task>> {
        self.update_bandwidth(now);
        if self.throttled {
            return None;
        }
        let prio = self.highest_prio()? as usize;
        let task = self.buckets[prio].pop_front().expect("bitmap bit without task");
        self.unmark_if_empty(prio);
        self.nr_queued -= 1;
        self.last_update_ns = now;
        self.rotate_curr = false;
        Some(task)
    }

    /// Preempted tasks return to the head of their bucket; an expired RR
    /// slice sends them to the tail instead.
    pub fn put_prev(&mut self, task: Arc<Task>) {
        let prio = task.rt_prio() as usize;
        if self.rotate_curr {
            self.buckets[prio].push_back(task);
        } else {
            self.buckets[prio].push_front(task);
        }
        self.rotate_curr = false;
        self.mark(prio);
        self.nr_queued += 1;
    }

    /// Account the running RT task. Returns true when it must yield the
    /// CPU: slice expiry with a waiting peer, a higher waiter, or the
    /// bandwidth cap.
    pub fn task_tick(&mut self, curr: &Arc<Task>, now: u64) -> bool {
        let delta = now.saturating_sub(self.last_update_ns);
        self.last_update_ns = now;
        self.consumed_ns += delta;
        curr.stats.sum_exec_runtime.fetch_add(delta, Ordering::Relaxed);

        self.update_bandwidth(now);
        if self.throttled {
            return true;
        }

        let mut resched = false;
        {
            let mut info = curr.sched().lock();
            if let Policy::RoundRobin { prio } = info.policy {
                info.rt.timeslice_ns = info.rt.timeslice_ns.saturating_sub(delta);
                if info.rt.timeslice_ns == 0 {
                    info.rt.timeslice_ns = config::tunables().rr_timeslice_ns();
                    if !self.buckets[prio as usize].is_empty() {
                        self.rotate_curr = true;
                        resched = true;
                    }
                }
            }
        }
        if let Some(highest) = self.highest_prio() {
            if highest > curr.rt_prio() {
                resched = true;
            }
        }
        resched
    }

    /// A waking RT task preempts a lower-priority RT current; the caller
    /// handles non-RT currents (RT always beats fair and idle).
    pub fn should_preempt_curr(curr: &Arc<Task>, woken: &Arc<Task>) -> bool {
        woken.rt_prio() > curr.rt_prio()
    }

    /// Runnable work exists and the class is not throttled.
    pub fn has_runnable(&mut self, now: u64) -> bool {
        self.update_bandwidth(now);
        !self.throttled && self.nr_queued > 0
    }

    /// Fraction of the current period consumed, permille. Balancer signal.
    pub fn bandwidth_used_permille(&self) -> u64 {
        let period = config::tunables().rt_period_us * 1_000;
        self.consumed_ns * 1000 / period
    }

    /// Detach up to `max` eligible tasks, lowest priority first (they hurt
    /// least to move).
    pub fn detach_filtered(
        &mut self,
        max: usize,
        eligible: impl Fn(&Arc<Task>) -> bool,
    ) -> Vec<Arc<Task>> {
        let mut out = Vec::new();
        for prio in 0..RT_PRIO_LEVELS {
            while out.len() < max {
                let bucket = &mut self.buckets[prio];
                let Some(pos) = bucket.iter().position(&eligible) else {
                    break;
                };
                if let Some(task) = bucket.remove(pos) {
                    self.nr_queued -= 1;
                    out.push(task);
                }
            }
            self.unmark_if_empty(prio);
            if out.len() >= max {
                break;
            }
        }
        out
    }

    /// Roll the bandwidth window forward and lift the throttle at each
    /// period boundary.
    fn update_bandwidth(&mut self, now: u64) {
        let t = config::tunables();
        let period = t.rt_period_us * 1_000;
        let runtime = t.rt_runtime_us * 1_000;
        if now >= self.period_start_ns + period {
            let elapsed = now - self.period_start_ns;
            self.period_start_ns += (elapsed / period) * period;
            self.consumed_ns = 0;
            self.throttled = false;
        }
        if !self.throttled && self.consumed_ns >= runtime {
            self.throttled = true;
        }
    }
}

impl Default for RtQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Task;

    fn fifo(name: &str, prio: u8) -> Arc<Task> {
        Task::with_policy_for_tests(name, Policy::Fifo { prio })
    }

    fn rr(name: &str, prio: u8) -> Arc<Task> {
        Task::with_policy_for_tests(name, Policy::RoundRobin { prio })
    }

    #[test]
    fn highest_priority_wins() {
        let mut q = RtQueue::new();
        q.enqueue(fifo("low", 10));
        let high = fifo("high", 90);
        q.enqueue(high.clone());
        q.enqueue(fifo("mid", 50));
        let picked = q.pick_next(0).unwrap();
        assert_eq!(picked.tid(), high.tid());
    }

    #[test]
    fn same_priority_is_fifo() {
        let mut q = RtQueue::new();
        let first = fifo("first", 50);
        let second = fifo("second", 50);
        q.enqueue(first.clone());
        q.enqueue(second.clone());
        assert_eq!(q.pick_next(0).unwrap().tid(), first.tid());
        assert_eq!(q.pick_next(0).unwrap().tid(), second.tid());
        assert!(q.pick_next(0).is_none());
    }

    #[test]
    fn preempted_task_keeps_its_turn() {
        let mut q = RtQueue::new();
        let a = fifo("a", 50);
        let b = fifo("b", 50);
        q.enqueue(a.clone());
        q.enqueue(b.clone());
        let curr = q.pick_next(0).unwrap();
        q.put_prev(curr); // preempted, not expired
        assert_eq!(q.pick_next(0).unwrap().tid(), a.tid());
    }

    #[test]
    fn rr_rotates_on_slice_expiry() {
        let mut q = RtQueue::new();
        let a = rr("a", 50);
        let b = rr("b", 50);
        q.enqueue(a.clone());
        q.enqueue(b.clone());
        let slice = config::tunables().rr_timeslice_ns();
        let curr = q.pick_next(0).unwrap();
        assert_eq!(curr.tid(), a.tid());
        // Burn the whole slice in one tick.
        assert!(q.task_tick(&curr, slice));
        q.put_prev(curr);
        // Expired current went to the tail; the peer runs next.
        assert_eq!(q.pick_next(slice).unwrap().tid(), b.tid());
    }

    #[test]
    fn bandwidth_cap_throttles_and_recovers() {
        let mut q = RtQueue::new();
        let hog = fifo("hog", 50);
        q.enqueue(hog.clone());
        let t = config::tunables();
        let runtime = t.rt_runtime_us * 1_000;
        let period = t.rt_period_us * 1_000;

        let curr = q.pick_next(0).unwrap();
        // Consume the entire budget.
        assert!(q.task_tick(&curr, runtime));
        q.put_prev(curr);
        assert!(q.is_throttled());
        assert!(q.pick_next(runtime).is_none());

        // Next period lifts the throttle.
        let picked = q.pick_next(period).unwrap();
        assert_eq!(picked.tid(), hog.tid());
        assert!(!q.is_throttled());
    }

    #[test]
    fn wakeup_preemption_by_priority() {
        let curr = fifo("curr", 40);
        let higher = fifo("higher", 41);
        let lower = fifo("lower", 39);
        assert!(RtQueue::should_preempt_curr(&curr, &higher));
        assert!(!RtQueue::should_preempt_curr(&curr, &lower));
    }

    #[test]
    fn higher_waiter_preempts_on_tick() {
        let mut q = RtQueue::new();
        let curr = fifo("curr", 40);
        assert!(!q.task_tick(&curr, 1_000_000));
        q.enqueue(fifo("waiter", 90));
        assert!(q.task_tick(&curr, 2_000_000));
    }
}
