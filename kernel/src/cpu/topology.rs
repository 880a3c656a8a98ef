//! CPU topology
//!
//! Enumerates logical CPUs with their core/package/NUMA placement and cache
//! sharing ids. The table is built during SMP bring-up, published once, and
//! read lock-free afterwards; only online/offline bits change later.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use super::mask::{CpuMask, MAX_CPUS};

/// Per-CPU placement record. Immutable after publication.
#[derive(Debug, Clone, Copy)]
pub struct CpuTopology {
    pub cpu_id: u32,
    pub core_id: u32,
    pub package_id: u32,
    pub numa_node: u32,
    /// Cache-sharing domain ids, innermost first (L1, L2, L3).
    pub cache_ids: [u32; 3],
}

/// Balancing scope, innermost first. Each level widens the set of peers and
/// raises the cost of moving a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TopologyLevel {
    /// Logical CPUs sharing one physical core.
    Smt,
    /// Cores sharing one package.
    Core,
    /// Packages sharing one NUMA node.
    Package,
    /// Everything else.
    Numa,
}

impl TopologyLevel {
    pub const ALL: [TopologyLevel; 4] =
        [TopologyLevel::Smt, TopologyLevel::Core, TopologyLevel::Package, TopologyLevel::Numa];

    /// Imbalance multiplier: migrations across wider domains need a larger
    /// load gap to pay off.
    pub fn cost_factor(self) -> u64 {
        match self {
            TopologyLevel::Smt => 1,
            TopologyLevel::Core => 2,
            TopologyLevel::Package => 4,
            TopologyLevel::Numa => 8,
        }
    }
}

struct TopologyTable {
    cpus: Vec<CpuTopology>,
    /// NUMA distance matrix, row-major `node_count * node_count`.
    numa_distance: Vec<u8>,
    node_count: u32,
}

static TABLE: Once<TopologyTable> = Once::new();

// Online bits sit outside the frozen table; offline transitions flip them.
const ONLINE_WORD: AtomicU64 = AtomicU64::new(0);
static ONLINE: [AtomicU64; MAX_CPUS / 64] = [ONLINE_WORD; MAX_CPUS / 64];

/// Publish the topology. First call wins; all listed CPUs start online.
pub fn publish(cpus: Vec<CpuTopology>, numa_distance: Vec<u8>, node_count: u32) {
    TABLE.call_once(|| {
        for topo in &cpus {
            set_online(topo.cpu_id as usize, true);
        }
        TopologyTable { cpus, numa_distance, node_count }
    });
}

/// Flat topology for `n` CPUs: every CPU its own core, one package, one
/// NUMA node. Used when the platform supplies nothing better.
pub fn publish_flat(n: u32) {
    let cpus = (0..n)
        .map(|cpu| CpuTopology {
            cpu_id: cpu,
            core_id: cpu,
            package_id: 0,
            numa_node: 0,
            cache_ids: [cpu, cpu, 0],
        })
        .collect();
    publish(cpus, alloc::vec![10], 1);
}

fn table() -> &'static TopologyTable {
    TABLE.call_once(|| {
        // Nothing published: single-CPU fallback.
        TopologyTable {
            cpus: alloc::vec![CpuTopology {
                cpu_id: 0,
                core_id: 0,
                package_id: 0,
                numa_node: 0,
                cache_ids: [0, 0, 0],
            }],
            numa_distance: alloc::vec![10],
            node_count: 1,
        }
    })
}

/// Number of possible CPUs.
pub fn nr_cpus() -> u32 {
    table().cpus.len() as u32
}

/// Number of CPUs currently online.
pub fn nr_online_cpus() -> u32 {
    online_mask().weight()
}

/// Topology record for one CPU.
pub fn cpu(cpu_id: usize) -> Option<&'static CpuTopology> {
    table().cpus.get(cpu_id)
}

pub fn set_online(cpu_id: usize, online: bool) {
    if cpu_id >= MAX_CPUS {
        return;
    }
    let bit = 1u64 << (cpu_id % 64);
    if online {
        ONLINE[cpu_id / 64].fetch_or(bit, Ordering::Release);
    } else {
        ONLINE[cpu_id / 64].fetch_and(!bit, Ordering::Release);
    }
}

pub fn is_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && ONLINE[cpu_id / 64].load(Ordering::Acquire) & (1 << (cpu_id % 64)) != 0
}

/// Mask of online CPUs.
pub fn online_mask() -> CpuMask {
    let mut mask = CpuMask::empty();
    for topo in &table().cpus {
        if is_online(topo.cpu_id as usize) {
            mask.set(topo.cpu_id as usize);
        }
    }
    mask
}

/// NUMA distance between two nodes; 10 is local by convention.
pub fn numa_distance(a: u32, b: u32) -> u8 {
    let t = table();
    if a >= t.node_count || b >= t.node_count {
        return u8::MAX;
    }
    t.numa_distance[(a * t.node_count + b) as usize]
}

/// Online peers of `cpu_id` at exactly the given level, excluding the CPU
/// itself. `Smt` is same core, `Core` same package but different core,
/// `Package` same node but different package, `Numa` different node.
pub fn peers(cpu_id: usize, level: TopologyLevel) -> CpuMask {
    let t = table();
    let Some(me) = t.cpus.get(cpu_id) else {
        return CpuMask::empty();
    };
    let mut mask = CpuMask::empty();
    for other in &t.cpus {
        if other.cpu_id as usize == cpu_id || !is_online(other.cpu_id as usize) {
            continue;
        }
        let matches = match level {
            TopologyLevel::Smt => {
                other.package_id == me.package_id && other.core_id == me.core_id
            }
            TopologyLevel::Core => {
                other.package_id == me.package_id && other.core_id != me.core_id
            }
            TopologyLevel::Package => {
                other.numa_node == me.numa_node && other.package_id != me.package_id
            }
            TopologyLevel::Numa => other.numa_node != me.numa_node,
        };
        if matches {
            mask.set(other.cpu_id as usize);
        }
    }
    mask
}

/// SMT siblings of a CPU, itself included.
pub fn smt_siblings(cpu_id: usize) -> CpuMask {
    let mut mask = peers(cpu_id, TopologyLevel::Smt);
    mask.set(cpu_id);
    mask
}

/// Probe topology from CPUID leaf 0x0B. Fills SMT and core ids for the
/// executing CPU's layout applied uniformly; platforms with ACPI tables
/// should publish those instead.
#[cfg(target_arch = "x86_64")]
pub fn probe_x86(n: u32) -> Vec<CpuTopology> {
    let cpuid = raw_cpuid::CpuId::new();
    let smt_width = cpuid
        .get_extended_topology_info()
        .and_then(|mut iter| iter.next())
        .map(|level| level.processors() as u32)
        .unwrap_or(1)
        .max(1);
    (0..n)
        .map(|cpu| CpuTopology {
            cpu_id: cpu,
            core_id: cpu / smt_width,
            package_id: 0,
            numa_node: 0,
            cache_ids: [cpu / smt_width, cpu / smt_width, 0],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two packages of two dual-SMT cores each, all in one NUMA node,
    // published once for the whole test binary.
    fn test_topology() {
        let mut cpus = Vec::new();
        for cpu in 0u32..8 {
            cpus.push(CpuTopology {
                cpu_id: cpu,
                core_id: cpu / 2,
                package_id: cpu / 4,
                numa_node: 0,
                cache_ids: [cpu / 2, cpu / 2, cpu / 4],
            });
        }
        publish(cpus, alloc::vec![10], 1);
    }

    #[test]
    fn smt_peers_share_core() {
        test_topology();
        let smt = peers(0, TopologyLevel::Smt);
        assert_eq!(smt.iter().collect::<Vec<_>>(), [1]);
        assert_eq!(smt_siblings(0).weight(), 2);
    }

    #[test]
    fn core_peers_share_package_only() {
        test_topology();
        let core = peers(0, TopologyLevel::Core);
        assert_eq!(core.iter().collect::<Vec<_>>(), [2, 3]);
    }

    #[test]
    fn package_peers_cross_packages() {
        test_topology();
        let pkg = peers(0, TopologyLevel::Package);
        assert_eq!(pkg.iter().collect::<Vec<_>>(), [4, 5, 6, 7]);
    }

    #[test]
    fn offline_cpu_leaves_peer_sets() {
        test_topology();
        // The online bits are process-global; keep other tests from seeing
        // the transient offline window.
        let _serial = crate::test_util::global_lock();
        set_online(1, false);
        assert!(peers(0, TopologyLevel::Smt).is_empty());
        set_online(1, true);
        assert!(peers(0, TopologyLevel::Smt).test(1));
    }

    #[test]
    fn level_costs_increase_outward() {
        let costs: Vec<u64> = TopologyLevel::ALL.iter().map(|l| l.cost_factor()).collect();
        assert!(costs.windows(2).all(|w| w[0] < w[1]));
    }
}
