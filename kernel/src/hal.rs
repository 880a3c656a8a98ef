//! Hardware abstraction seam
//!
//! The scheduling core never touches registers directly; everything
//! architecture-specific comes in through the `Hal` trait installed once at
//! boot. `StubHal` is the single-CPU no-op implementation used before the
//! platform installs the real one, and by the host test suite.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Once;

use crate::cpu::CpuMask;

/// Reschedule IPI vector. The platform's interrupt glue routes this vector
/// back into `sched::resched_ipi`.
pub const RESCHED_VECTOR: u8 = 0xFD;

/// Opaque architecture context save area: callee-saved registers, stack
/// pointer, instruction pointer, flags. Layout is owned by the HAL; the
/// scheduler only moves it around.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArchContext {
    pub regs: [u64; 8],
    pub sp: u64,
    pub ip: u64,
    pub flags: u64,
}

impl ArchContext {
    pub const fn zeroed() -> Self {
        Self { regs: [0; 8], sp: 0, ip: 0, flags: 0 }
    }
}

/// Operations the core consumes from the architecture layer.
pub trait Hal: Send + Sync {
    fn cpu_count(&self) -> u32;
    fn current_cpu_id(&self) -> u32;

    /// Prepare a fresh context so that switching to it enters `entry(arg)`
    /// on the given stack.
    fn prepare_thread(&self, ctx: &mut ArchContext, entry: usize, arg: usize, stack_top: usize);

    /// Swap register state: save into `prev`, load from `next`.
    ///
    /// # Safety
    /// Both pointers must reference live, correctly prepared save areas and
    /// the caller must not hold any runqueue lock.
    unsafe fn switch_context(&self, prev: *mut ArchContext, next: *const ArchContext);

    fn interrupts_enable(&self);
    fn interrupts_disable(&self);
    fn interrupts_are_enabled(&self) -> bool;

    fn send_ipi(&self, cpu: u32, vector: u8);

    fn send_ipi_mask(&self, mask: &CpuMask, vector: u8) {
        for cpu in mask.iter() {
            self.send_ipi(cpu as u32, vector);
        }
    }

    /// Program the local timer for a periodic tick.
    fn timer_set_periodic(&self, hz: u32);

    /// Program a one-shot timer event (monotonic deadline).
    fn timer_set_oneshot(&self, deadline_ns: u64);
}

/// No-op HAL: one CPU by default, software interrupt flag, context switches
/// are bookkeeping only. Enough to run the core's logic on a host.
pub struct StubHal {
    cpus: u32,
    current_cpu: AtomicU32,
    irq_enabled: AtomicBool,
    ipis_sent: AtomicU64,
}

impl StubHal {
    pub const fn new(cpus: u32) -> Self {
        Self {
            cpus,
            current_cpu: AtomicU32::new(0),
            irq_enabled: AtomicBool::new(true),
            ipis_sent: AtomicU64::new(0),
        }
    }

    /// Pretend execution moved to another CPU. Test-side control knob.
    pub fn set_current_cpu(&self, cpu: u32) {
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn ipis_sent(&self) -> u64 {
        self.ipis_sent.load(Ordering::Relaxed)
    }
}

impl Hal for StubHal {
    fn cpu_count(&self) -> u32 {
        self.cpus
    }

    fn current_cpu_id(&self) -> u32 {
        self.current_cpu.load(Ordering::Relaxed)
    }

    fn prepare_thread(&self, ctx: &mut ArchContext, entry: usize, arg: usize, stack_top: usize) {
        *ctx = ArchContext::zeroed();
        ctx.ip = entry as u64;
        ctx.regs[0] = arg as u64;
        ctx.sp = stack_top as u64;
    }

    unsafe fn switch_context(&self, _prev: *mut ArchContext, _next: *const ArchContext) {}

    fn interrupts_enable(&self) {
        self.irq_enabled.store(true, Ordering::Relaxed);
    }

    fn interrupts_disable(&self) {
        self.irq_enabled.store(false, Ordering::Relaxed);
    }

    fn interrupts_are_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Relaxed)
    }

    fn send_ipi(&self, _cpu: u32, _vector: u8) {
        self.ipis_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn timer_set_periodic(&self, _hz: u32) {}

    fn timer_set_oneshot(&self, _deadline_ns: u64) {}
}

static STUB: StubHal = StubHal::new(1);
static HAL: Once<&'static dyn Hal> = Once::new();

/// Install the platform HAL. First call wins; everything before it sees the
/// single-CPU stub.
pub fn install(hal: &'static dyn Hal) {
    HAL.call_once(|| hal);
}

/// The active HAL.
pub fn hal() -> &'static dyn Hal {
    match HAL.get() {
        Some(h) => *h,
        None => &STUB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_prepares_entry_context() {
        let stub = StubHal::new(4);
        let mut ctx = ArchContext::zeroed();
        stub.prepare_thread(&mut ctx, 0x1000, 42, 0x8000);
        assert_eq!(ctx.ip, 0x1000);
        assert_eq!(ctx.regs[0], 42);
        assert_eq!(ctx.sp, 0x8000);
    }

    #[test]
    fn stub_tracks_interrupt_flag() {
        let stub = StubHal::new(1);
        assert!(stub.interrupts_are_enabled());
        stub.interrupts_disable();
        assert!(!stub.interrupts_are_enabled());
        stub.interrupts_enable();
        assert!(stub.interrupts_are_enabled());
    }
}
