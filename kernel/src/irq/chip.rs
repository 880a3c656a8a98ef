//! Interrupt controller abstraction
//!
//! Descriptors talk to the controller through `IrqChip`; the platform
//! installs the real one at boot. Until then (and under test) a recording
//! stub answers, so dispatch logic never special-cases "no chip yet".

use spin::Once;

use crate::cpu::topology;
use crate::cpu::CpuMask;
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqFlow, NR_VECTORS};
use crate::sync::spinlock::SpinLock;

pub trait IrqChip: Send + Sync {
    fn name(&self) -> &'static str;

    /// Acknowledge receipt; called before the handler chain runs.
    fn ack(&self, vector: u32);

    fn mask(&self, vector: u32);
    fn unmask(&self, vector: u32);

    /// End of interrupt; called after the handler chain, masked or not.
    fn eoi(&self, vector: u32);

    /// Steer the line toward `mask`. Returns the mask the hardware
    /// actually honors, which may be a subset.
    fn set_affinity(&self, vector: u32, mask: &CpuMask) -> KernelResult<CpuMask>;

    /// Program trigger mode and polarity. Controllers without per-line
    /// trigger control accept any mode silently.
    fn set_flow(&self, vector: u32, flow: IrqFlow) -> KernelResult<()> {
        let _ = (vector, flow);
        Ok(())
    }
}

/// Fallback chip: tracks mask and trigger state in memory and routes to
/// CPU 0 only.
pub struct StubChip {
    masked: SpinLock<[u64; NR_VECTORS / 64]>,
    flows: SpinLock<[Option<IrqFlow>; NR_VECTORS]>,
}

impl StubChip {
    pub const fn new() -> Self {
        Self {
            masked: SpinLock::new([0; NR_VECTORS / 64]),
            flows: SpinLock::new([None; NR_VECTORS]),
        }
    }

    pub fn is_masked(&self, vector: u32) -> bool {
        let v = vector as usize;
        v < NR_VECTORS && self.masked.lock()[v / 64] & (1 << (v % 64)) != 0
    }

    /// Last trigger mode programmed for a vector, if any.
    pub fn flow_of(&self, vector: u32) -> Option<IrqFlow> {
        self.flows.lock().get(vector as usize).copied().flatten()
    }
}

impl IrqChip for StubChip {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn ack(&self, _vector: u32) {}

    fn mask(&self, vector: u32) {
        let v = vector as usize;
        if v < NR_VECTORS {
            self.masked.lock()[v / 64] |= 1 << (v % 64);
        }
    }

    fn unmask(&self, vector: u32) {
        let v = vector as usize;
        if v < NR_VECTORS {
            self.masked.lock()[v / 64] &= !(1 << (v % 64));
        }
    }

    fn eoi(&self, _vector: u32) {}

    fn set_affinity(&self, _vector: u32, mask: &CpuMask) -> KernelResult<CpuMask> {
        let effective = mask.and(&topology::online_mask());
        if effective.is_empty() {
            return Err(KernelError::InvalidParameter { what: "irq affinity has no online cpu" });
        }
        Ok(effective)
    }

    fn set_flow(&self, vector: u32, flow: IrqFlow) -> KernelResult<()> {
        let v = vector as usize;
        if v < NR_VECTORS {
            self.flows.lock()[v] = Some(flow);
        }
        Ok(())
    }
}

static STUB: StubChip = StubChip::new();
static CHIP: Once<&'static dyn IrqChip> = Once::new();

/// Install the platform controller. First caller wins.
pub fn install(chip: &'static dyn IrqChip) {
    CHIP.call_once(|| chip);
    log::info!("irq: controller '{}' installed", chip.name());
}

pub fn chip() -> &'static dyn IrqChip {
    match CHIP.get() {
        Some(c) => *c,
        None => &STUB,
    }
}

#[cfg(test)]
pub(crate) fn stub_chip() -> &'static StubChip {
    &STUB
}

/// Legacy 8259 pair, remapped above the CPU exception range. Only usable
/// for vectors 32..48; no affinity, everything lands on the boot CPU.
#[cfg(target_arch = "x86_64")]
pub mod pic8259 {
    use super::*;

    const PIC1_COMMAND: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_COMMAND: u16 = 0xA0;
    const PIC2_DATA: u16 = 0xA1;
    const PIC_EOI: u8 = 0x20;

    /// IRQ 0-7 land on vectors 32-39, IRQ 8-15 on 40-47.
    pub const VECTOR_OFFSET: u32 = 32;

    #[inline]
    unsafe fn outb(port: u16, value: u8) {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack));
    }

    #[inline]
    unsafe fn inb(port: u16) -> u8 {
        let value: u8;
        core::arch::asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack));
        value
    }

    unsafe fn io_wait() {
        outb(0x80, 0);
    }

    /// Remap both controllers away from the exception vectors and mask
    /// every line; drivers unmask what they claim.
    pub fn init() {
        unsafe {
            // ICW1: begin initialization, expect ICW4.
            outb(PIC1_COMMAND, 0x11);
            io_wait();
            outb(PIC2_COMMAND, 0x11);
            io_wait();
            // ICW2: vector offsets.
            outb(PIC1_DATA, VECTOR_OFFSET as u8);
            io_wait();
            outb(PIC2_DATA, VECTOR_OFFSET as u8 + 8);
            io_wait();
            // ICW3: slave on IRQ2.
            outb(PIC1_DATA, 4);
            io_wait();
            outb(PIC2_DATA, 2);
            io_wait();
            // ICW4: 8086 mode.
            outb(PIC1_DATA, 0x01);
            io_wait();
            outb(PIC2_DATA, 0x01);
            io_wait();
            outb(PIC1_DATA, 0xFF);
            outb(PIC2_DATA, 0xFF);
        }
    }

    pub struct Pic8259;

    fn line_of(vector: u32) -> Option<u8> {
        vector.checked_sub(VECTOR_OFFSET).filter(|l| *l < 16).map(|l| l as u8)
    }

    impl IrqChip for Pic8259 {
        fn name(&self) -> &'static str {
            "pic-8259"
        }

        fn ack(&self, _vector: u32) {}

        fn mask(&self, vector: u32) {
            let Some(line) = line_of(vector) else { return };
            let port = if line < 8 { PIC1_DATA } else { PIC2_DATA };
            unsafe { outb(port, inb(port) | 1 << (line % 8)) };
        }

        fn unmask(&self, vector: u32) {
            let Some(line) = line_of(vector) else { return };
            let port = if line < 8 { PIC1_DATA } else { PIC2_DATA };
            unsafe { outb(port, inb(port) & !(1 << (line % 8))) };
        }

        fn eoi(&self, vector: u32) {
            let Some(line) = line_of(vector) else { return };
            unsafe {
                if line >= 8 {
                    outb(PIC2_COMMAND, PIC_EOI);
                }
                outb(PIC1_COMMAND, PIC_EOI);
            }
        }

        fn set_affinity(&self, _vector: u32, _mask: &CpuMask) -> KernelResult<CpuMask> {
            // Hardwired to the boot CPU.
            Ok(CpuMask::single(0))
        }
    }
}

/// x2APIC in MSR mode; per-vector steering is kept in a soft table and
/// applied when the redirection entry is programmed.
#[cfg(target_arch = "x86_64")]
pub mod x2apic {
    use super::*;

    const X2APIC_EOI: u32 = 0x80B;

    #[inline]
    unsafe fn wrmsr(msr: u32, value: u64) {
        let low = value as u32;
        let high = (value >> 32) as u32;
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") low,
            in("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }

    pub struct X2Apic {
        masked: SpinLock<[u64; NR_VECTORS / 64]>,
        target: SpinLock<[u32; NR_VECTORS]>,
    }

    impl X2Apic {
        pub const fn new() -> Self {
            Self {
                masked: SpinLock::new([0; NR_VECTORS / 64]),
                target: SpinLock::new([0; NR_VECTORS]),
            }
        }

        /// CPU a vector is steered to.
        pub fn target_of(&self, vector: u32) -> u32 {
            self.target.lock()[vector as usize % NR_VECTORS]
        }
    }

    impl IrqChip for X2Apic {
        fn name(&self) -> &'static str {
            "x2apic"
        }

        fn ack(&self, _vector: u32) {}

        fn mask(&self, vector: u32) {
            let v = vector as usize;
            if v < NR_VECTORS {
                self.masked.lock()[v / 64] |= 1 << (v % 64);
            }
        }

        fn unmask(&self, vector: u32) {
            let v = vector as usize;
            if v < NR_VECTORS {
                self.masked.lock()[v / 64] &= !(1 << (v % 64));
            }
        }

        fn eoi(&self, _vector: u32) {
            unsafe { wrmsr(X2APIC_EOI, 0) };
        }

        fn set_affinity(&self, vector: u32, mask: &CpuMask) -> KernelResult<CpuMask> {
            let effective = mask.and(&topology::online_mask());
            // Physical destination mode: one CPU per vector.
            let Some(cpu) = effective.first() else {
                return Err(KernelError::InvalidParameter { what: "irq affinity has no online cpu" });
            };
            if (vector as usize) < NR_VECTORS {
                self.target.lock()[vector as usize] = cpu as u32;
            }
            Ok(CpuMask::single(cpu))
        }
    }
}
