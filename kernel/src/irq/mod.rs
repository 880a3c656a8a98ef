//! Interrupt handling
//!
//! Flat 1024-entry vector space. `descriptor` owns registration and
//! dispatch, `chip` abstracts the controller hardware, `storm` protects
//! against runaway lines, `thread` hosts deferred handler work.

pub mod chip;
mod descriptor;
mod storm;
mod thread;

pub use chip::{chip, install as install_chip, IrqChip, StubChip};
pub use descriptor::{
    disable_irq, dispatch, enable_irq, free_irq, irq_affinity, irq_flow, irq_msi, irq_priority,
    irq_set_affinity, irq_stats, request_irq, request_threaded_irq, reroute_for_offline,
    set_irq_flow, set_irq_msi, set_irq_priority, storm_tick, IrqFlags, IrqFlow, IrqHandler,
    IrqPriority, IrqReturn, IrqStats, MsiInfo, NR_VECTORS,
};
pub use storm::StormVerdict;
pub use thread::IRQ_THREAD_PRIO;
