//! CPU topology and masks

pub mod mask;
pub mod topology;

pub use mask::{CpuMask, CpuMaskIter, MAX_CPUS};
pub use topology::{CpuTopology, TopologyLevel, nr_cpus, nr_online_cpus};
