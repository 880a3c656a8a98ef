//! Boot-time tunables
//!
//! All scheduler and IRQ knobs live in one struct, validated and published
//! once during early boot. After `init` the values are frozen; queries are
//! lock-free reads.

use spin::Once;

use crate::error::{KernelError, KernelResult};

/// Scheduler and IRQ tunables with their boot defaults.
#[derive(Debug, Clone, Copy)]
pub struct KernelTunables {
    /// Target scheduling period for the fair class (ns). Default 6 ms.
    pub sched_latency_ns: u64,
    /// Floor on any fair-class slice (ns). Default 0.75 ms.
    pub min_granularity_ns: u64,
    /// Minimum vruntime lead before a wakeup preempts (ns). Default 1 ms.
    pub wakeup_granularity_ns: u64,

    /// Round-robin time slice (ms). Default 100 ms.
    pub rr_timeslice_ms: u64,
    /// RT bandwidth budget per period (us). Default 950 ms of each second.
    pub rt_runtime_us: u64,
    /// RT bandwidth period (us). Default 1 s.
    pub rt_period_us: u64,

    /// Deadline-class admission cap, permille of one CPU. Default 950.
    pub dl_utilization_cap_permille: u64,

    /// Periodic load-balance interval (ms). Default 100 ms.
    pub load_balance_interval_ms: u64,
    /// Cache-hot cutoff: a task that ran within this window is not worth
    /// migrating at the innermost level (ns). Default 0.5 ms.
    pub migration_cost_ns: u64,

    /// Triggers per second above which a vector is considered storming.
    /// Default 10 000.
    pub irq_storm_threshold_per_sec: u64,
    /// Mask duration once a storm escalates past sampling (ms). Default 1 s.
    pub irq_storm_quiet_time_ms: u64,

    /// Timer tick rate consumed from the HAL (Hz). Default 1000.
    pub timer_hz: u32,

    /// When set, involuntary kernel preemption is disabled and reschedules
    /// happen only at voluntary points.
    pub preempt_voluntary_only: bool,
}

impl KernelTunables {
    pub const fn defaults() -> Self {
        Self {
            sched_latency_ns: 6_000_000,
            min_granularity_ns: 750_000,
            wakeup_granularity_ns: 1_000_000,
            rr_timeslice_ms: 100,
            rt_runtime_us: 950_000,
            rt_period_us: 1_000_000,
            dl_utilization_cap_permille: 950,
            load_balance_interval_ms: 100,
            migration_cost_ns: 500_000,
            irq_storm_threshold_per_sec: 10_000,
            irq_storm_quiet_time_ms: 1_000,
            timer_hz: 1000,
            preempt_voluntary_only: false,
        }
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> KernelResult<()> {
        if self.sched_latency_ns == 0 || self.min_granularity_ns == 0 {
            return Err(KernelError::InvalidParameter { what: "zero fair granularity" });
        }
        if self.min_granularity_ns > self.sched_latency_ns {
            return Err(KernelError::InvalidParameter { what: "min granularity above latency target" });
        }
        if self.rt_period_us == 0 || self.rt_runtime_us > self.rt_period_us {
            return Err(KernelError::InvalidParameter { what: "rt runtime exceeds period" });
        }
        if self.dl_utilization_cap_permille == 0 || self.dl_utilization_cap_permille > 1000 {
            return Err(KernelError::InvalidParameter { what: "deadline cap out of range" });
        }
        if self.timer_hz == 0 {
            return Err(KernelError::InvalidParameter { what: "timer_hz" });
        }
        Ok(())
    }

    /// RR slice in nanoseconds.
    pub fn rr_timeslice_ns(&self) -> u64 {
        self.rr_timeslice_ms * 1_000_000
    }

    /// Length of one timer tick in nanoseconds.
    pub fn tick_ns(&self) -> u64 {
        1_000_000_000 / self.timer_hz as u64
    }
}

impl Default for KernelTunables {
    fn default() -> Self {
        Self::defaults()
    }
}

static TUNABLES: Once<KernelTunables> = Once::new();

/// Publish the boot configuration. Later calls keep the first value.
pub fn init(tunables: KernelTunables) -> KernelResult<()> {
    tunables.validate()?;
    TUNABLES.call_once(|| tunables);
    Ok(())
}

/// Active tunables; defaults if `init` was never called.
pub fn tunables() -> &'static KernelTunables {
    TUNABLES.call_once(KernelTunables::defaults)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(KernelTunables::defaults().validate().is_ok());
    }

    #[test]
    fn rejects_runtime_above_period() {
        let mut t = KernelTunables::defaults();
        t.rt_runtime_us = t.rt_period_us + 1;
        assert_eq!(
            t.validate(),
            Err(KernelError::InvalidParameter { what: "rt runtime exceeds period" })
        );
    }

    #[test]
    fn rejects_cap_above_one_cpu() {
        let mut t = KernelTunables::defaults();
        t.dl_utilization_cap_permille = 1001;
        assert!(t.validate().is_err());
    }

    #[test]
    fn tick_length_matches_hz() {
        let t = KernelTunables::defaults();
        assert_eq!(t.tick_ns(), 1_000_000);
    }
}
