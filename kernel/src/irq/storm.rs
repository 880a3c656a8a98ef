//! Interrupt storm damping
//!
//! A misbehaving device can fire faster than its handler retires work and
//! starve every CPU it lands on. Each line counts arrivals over a one
//! second window and a short burst window; crossing either threshold walks
//! a rate ladder: normal delivery, then 1-of-N sampling with N doubling
//! while the storm holds,
//! then a hardware mask for a quiet period. A line that keeps storming
//! through repeated mask cycles is disabled outright and stays down until
//! someone re-enables it by hand.

use crate::config;

/// Fate of one incoming interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StormVerdict {
    /// Run the handler chain.
    Deliver,
    /// Dropped by 1-of-N sampling.
    Sampled,
    /// Line should be (or already is) masked for the quiet period.
    Masked,
    /// Line has exhausted its mask cycles; disable it persistently.
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Normal,
    Sampling,
    Masked,
    Disabled,
}

const WINDOW_NS: u64 = 1_000_000_000;
/// Short window that catches a flood long before the 1 s counter does.
const BURST_WINDOW_NS: u64 = 10_000_000;
const SAMPLE_START: u32 = 8;
const SAMPLE_MAX: u32 = 256;
/// Mask cycles before giving up on the line.
const MAX_MASK_CYCLES: u32 = 3;

/// Per-line storm tracker. Lives inside the descriptor's lock.
pub(super) struct StormState {
    level: Level,
    window_start_ns: u64,
    window_count: u64,
    burst_start_ns: u64,
    burst_count: u64,
    sample_mod: u32,
    sample_seq: u32,
    masked_until_ns: u64,
    mask_cycles: u32,
}

impl StormState {
    pub(super) const fn new() -> Self {
        Self {
            level: Level::Normal,
            window_start_ns: 0,
            window_count: 0,
            burst_start_ns: 0,
            burst_count: 0,
            sample_mod: SAMPLE_START,
            sample_seq: 0,
            masked_until_ns: 0,
            mask_cycles: 0,
        }
    }

    /// Account one arrival and decide its fate.
    pub(super) fn record(&mut self, now_ns: u64) -> StormVerdict {
        match self.level {
            Level::Disabled => return StormVerdict::Disabled,
            Level::Masked => {
                if now_ns < self.masked_until_ns {
                    return StormVerdict::Masked;
                }
                // Quiet period over: come back cautiously, still sampling.
                self.level = Level::Sampling;
                self.roll_window(now_ns);
            }
            _ => {}
        }

        if now_ns.saturating_sub(self.window_start_ns) >= WINDOW_NS {
            // A full calm window earns one step back down the ladder.
            if self.level == Level::Sampling
                && self.window_count <= self.threshold() / 2
            {
                self.sample_mod /= 2;
                if self.sample_mod <= 1 {
                    self.level = Level::Normal;
                    self.sample_mod = SAMPLE_START;
                }
            }
            self.roll_window(now_ns);
        }
        if now_ns.saturating_sub(self.burst_start_ns) >= BURST_WINDOW_NS {
            self.burst_start_ns = now_ns;
            self.burst_count = 0;
        }
        self.window_count += 1;
        self.burst_count += 1;

        if self.window_count > self.threshold() || self.burst_count > self.burst_threshold() {
            return self.escalate(now_ns);
        }

        match self.level {
            Level::Sampling => {
                self.sample_seq = self.sample_seq.wrapping_add(1);
                if self.sample_seq % self.sample_mod == 0 {
                    StormVerdict::Deliver
                } else {
                    StormVerdict::Sampled
                }
            }
            _ => StormVerdict::Deliver,
        }
    }

    /// Forget everything, e.g. after a manual re-enable.
    pub(super) fn reset(&mut self) {
        *self = Self::new();
    }

    pub(super) fn is_disabled(&self) -> bool {
        self.level == Level::Disabled
    }

    fn escalate(&mut self, now_ns: u64) -> StormVerdict {
        self.roll_window(now_ns);
        match self.level {
            Level::Normal => {
                self.level = Level::Sampling;
                self.sample_mod = SAMPLE_START;
                log::warn!("irq storm: sampling 1 of {}", self.sample_mod);
                StormVerdict::Sampled
            }
            Level::Sampling if self.sample_mod < SAMPLE_MAX => {
                self.sample_mod *= 2;
                log::warn!("irq storm: sampling 1 of {}", self.sample_mod);
                StormVerdict::Sampled
            }
            Level::Sampling => {
                self.mask_cycles += 1;
                if self.mask_cycles >= MAX_MASK_CYCLES {
                    self.level = Level::Disabled;
                    log::error!("irq storm: line disabled after {} mask cycles", self.mask_cycles);
                    StormVerdict::Disabled
                } else {
                    self.level = Level::Masked;
                    self.masked_until_ns =
                        now_ns + config::tunables().irq_storm_quiet_time_ms * 1_000_000;
                    log::warn!("irq storm: masking line for quiet period");
                    StormVerdict::Masked
                }
            }
            // record() already folded these away.
            Level::Masked | Level::Disabled => StormVerdict::Masked,
        }
    }

    fn threshold(&self) -> u64 {
        config::tunables().irq_storm_threshold_per_sec
    }

    /// Per-second threshold scaled down to the burst window.
    fn burst_threshold(&self) -> u64 {
        (self.threshold() / (WINDOW_NS / BURST_WINDOW_NS)).max(1)
    }

    fn roll_window(&mut self, now_ns: u64) {
        self.window_start_ns = now_ns;
        self.window_count = 0;
        self.burst_start_ns = now_ns;
        self.burst_count = 0;
    }

    /// When a masked line may be unmasked again, if it is masked.
    pub(super) fn masked_until(&self) -> Option<u64> {
        (self.level == Level::Masked).then_some(self.masked_until_ns)
    }
}
