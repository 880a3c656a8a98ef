//! Idle class and C-state entry
//!
//! Each CPU owns one idle task that the idle class hands out when every
//! other class is empty. What the CPU does while idle is a power-management
//! decision made by an external driver; the scheduler only reports how long
//! it expects to stay idle and invokes the chosen state.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use super::task::Task;

/// CPU idle power states, shallow to deep. Deeper states save more power
/// but cost more wakeup latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuPowerState {
    /// Not idle.
    Active,
    /// Plain halt, negligible exit cost.
    Halt,
    C1,
    C2,
    C3,
}

/// Platform idle driver: picks a state for an expected idle duration and
/// enters it. Entering returns when an interrupt arrives.
pub trait CpuIdleDriver: Send + Sync {
    fn select(&self, expected_idle_ns: u64) -> CpuPowerState;
    fn enter(&self, state: CpuPowerState);
}

/// Fallback driver: always halt.
pub struct HaltIdleDriver {
    entries: AtomicU64,
}

impl HaltIdleDriver {
    pub const fn new() -> Self {
        Self { entries: AtomicU64::new(0) }
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

impl CpuIdleDriver for HaltIdleDriver {
    fn select(&self, _expected_idle_ns: u64) -> CpuPowerState {
        CpuPowerState::Halt
    }

    fn enter(&self, _state: CpuPowerState) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }
}

static HALT_DRIVER: HaltIdleDriver = HaltIdleDriver::new();
static DRIVER: Once<&'static dyn CpuIdleDriver> = Once::new();

/// Install the platform idle driver. First call wins.
pub fn set_idle_driver(driver: &'static dyn CpuIdleDriver) {
    DRIVER.call_once(|| driver);
}

pub fn idle_driver() -> &'static dyn CpuIdleDriver {
    match DRIVER.get() {
        Some(d) => *d,
        None => &HALT_DRIVER,
    }
}

/// Idle "queue": holds the CPU's idle task and offers it unconditionally.
pub struct IdleQueue {
    task: Arc<Task>,
}

impl IdleQueue {
    pub fn new(cpu: u32) -> Self {
        Self { task: Task::new_idle(cpu) }
    }

    pub fn pick_next(&self) -> Arc<Task> {
        self.task.clone()
    }

    pub fn is_idle_task(&self, task: &Arc<Task>) -> bool {
        Arc::ptr_eq(&self.task, task)
    }
}

/// One pass of the idle loop body: ask the driver for a state and enter it.
/// Called by the idle task with interrupts enabled and nothing runnable.
pub fn idle_once(expected_idle_ns: u64) {
    let driver = idle_driver();
    let state = driver.select(expected_idle_ns);
    driver.enter(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_queue_always_offers_its_task() {
        let q = IdleQueue::new(2);
        let a = q.pick_next();
        let b = q.pick_next();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(q.is_idle_task(&a));
        assert_eq!(a.cpu(), 2);
    }

    #[test]
    fn states_order_shallow_to_deep() {
        assert!(CpuPowerState::Halt < CpuPowerState::C1);
        assert!(CpuPowerState::C1 < CpuPowerState::C3);
    }

    #[test]
    fn fallback_driver_halts() {
        let d = HaltIdleDriver::new();
        assert_eq!(d.select(1_000_000), CpuPowerState::Halt);
        d.enter(CpuPowerState::Halt);
        assert_eq!(d.entries(), 1);
    }
}
