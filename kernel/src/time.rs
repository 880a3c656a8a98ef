//! Monotonic kernel time
//!
//! A single nanosecond clock behind a pluggable source. The timer subsystem
//! installs the real source during bring-up; until then (and in host tests)
//! a manually advanced clock is used so accounting stays deterministic.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

/// Source of monotonic nanoseconds since boot.
pub trait ClockSource: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Manually advanced clock. The default source before the platform installs
/// a real one; unit tests drive it tick by tick.
pub struct ManualClock {
    ns: AtomicU64,
}

impl ManualClock {
    pub const fn new() -> Self {
        Self { ns: AtomicU64::new(0) }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn set(&self, ns: u64) {
        self.ns.store(ns, Ordering::Relaxed);
    }
}

impl ClockSource for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Relaxed)
    }
}

static BOOT_CLOCK: ManualClock = ManualClock::new();
static CLOCK: Once<&'static dyn ClockSource> = Once::new();

/// Install the platform clock source. First call wins.
pub fn set_clock(source: &'static dyn ClockSource) {
    CLOCK.call_once(|| source);
}

/// Monotonic nanoseconds since boot.
pub fn now_ns() -> u64 {
    match CLOCK.get() {
        Some(source) => source.now_ns(),
        None => BOOT_CLOCK.now_ns(),
    }
}

/// The fallback boot clock, advanced by the tick path until a real source
/// exists. Tests use it directly.
pub fn boot_clock() -> &'static ManualClock {
    &BOOT_CLOCK
}
