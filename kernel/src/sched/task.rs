//! Task control block
//!
//! The fundamental schedulable entity. Hot flags (state, need_resched,
//! on_rq, current CPU) are lock-free atomics; per-class scheduling fields
//! live behind the task's own spinlock, taken after the runqueue lock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::cpu::CpuMask;
use crate::error::{KernelError, KernelResult};
use crate::hal::{self, ArchContext};
use crate::mm::AddressSpaceId;
use crate::sync::spinlock::SpinLock;

pub type Tid = u64;

/// Default kernel thread stack, 32 KiB.
pub const KSTACK_SIZE: usize = 32 * 1024;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Executing on a CPU right now.
    Running = 0,
    /// On a runqueue, waiting for a CPU.
    Runnable = 1,
    /// Off every runqueue, parked on a wait object.
    Blocked = 2,
    /// Suspended by an external request.
    Stopped = 3,
    /// Exited, not yet reaped.
    Zombie = 4,
    /// Reaped; the object lingers only until the last reference drops.
    Dead = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Runnable,
            2 => Self::Blocked,
            3 => Self::Stopped,
            4 => Self::Zombie,
            _ => Self::Dead,
        }
    }
}

/// Scheduling policy as requested by the creator or `set_scheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Weight-proportional fair scheduling; nice in -20..=19.
    Fair { nice: i8 },
    /// Fixed-priority FIFO; prio in 0..=99, higher wins.
    Fifo { prio: u8 },
    /// Fixed-priority round-robin with a time slice.
    RoundRobin { prio: u8 },
    /// EDF with a constant-bandwidth server reservation.
    Deadline { runtime_ns: u64, deadline_ns: u64, period_ns: u64 },
    /// Runs only when nothing else is runnable.
    Idle,
    /// Kernel-internal stopper; preempts everything. Not settable from
    /// outside the scheduler.
    Stop,
}

impl Policy {
    /// Reject parameter combinations the classes cannot honor.
    pub fn validate(&self) -> KernelResult<()> {
        match *self {
            Policy::Fair { nice } => {
                if !(-20..=19).contains(&nice) {
                    return Err(KernelError::InvalidParameter { what: "nice out of range" });
                }
            }
            Policy::Fifo { prio } | Policy::RoundRobin { prio } => {
                if prio > 99 {
                    return Err(KernelError::InvalidParameter { what: "rt priority out of range" });
                }
            }
            Policy::Deadline { runtime_ns, deadline_ns, period_ns } => {
                if runtime_ns == 0 || runtime_ns > deadline_ns || deadline_ns > period_ns {
                    return Err(KernelError::InvalidParameter {
                        what: "deadline parameters must satisfy runtime <= deadline <= period",
                    });
                }
            }
            Policy::Idle | Policy::Stop => {}
        }
        Ok(())
    }
}

/// Class pick order: lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedClass {
    Stop,
    Deadline,
    Rt,
    Fair,
    Idle,
}

/// Fair-class per-task state.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairEntity {
    /// Virtual runtime, the sort key in the fair tree.
    pub vruntime: u64,
    /// Runqueue clock when this task last started executing.
    pub exec_start: u64,
}

/// RT-class per-task state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtEntity {
    /// Remaining slice for round-robin, ns. Unused for FIFO.
    pub timeslice_ns: u64,
}

/// Deadline-class per-task state.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlEntity {
    /// Current absolute deadline, ns since boot.
    pub abs_deadline: u64,
    /// Budget left in the current period, ns.
    pub remaining_ns: u64,
    /// Nonzero while throttled: the replenishment instant.
    pub throttled_until: u64,
}

/// Per-class scheduling fields, guarded by `Task::sched`.
#[derive(Debug, Clone, Copy)]
pub struct SchedInfo {
    pub policy: Policy,
    /// Priority-inheritance boost: an RT priority lent by a blocked waiter.
    /// The task schedules as RT at this priority until the lender unblocks.
    pub boost: Option<u8>,
    pub fair: FairEntity,
    pub rt: RtEntity,
    pub dl: DlEntity,
}

impl SchedInfo {
    fn new(policy: Policy) -> Self {
        Self {
            policy,
            boost: None,
            fair: FairEntity::default(),
            rt: RtEntity::default(),
            dl: DlEntity::default(),
        }
    }

    /// Effective class, boost included.
    pub fn class(&self) -> SchedClass {
        if self.boost.is_some() {
            return SchedClass::Rt;
        }
        match self.policy {
            Policy::Stop => SchedClass::Stop,
            Policy::Deadline { .. } => SchedClass::Deadline,
            Policy::Fifo { .. } | Policy::RoundRobin { .. } => SchedClass::Rt,
            Policy::Fair { .. } => SchedClass::Fair,
            Policy::Idle => SchedClass::Idle,
        }
    }

    /// Effective RT priority: the boost when lent, else the policy's own.
    /// Zero for non-RT policies without a boost.
    pub fn rt_prio(&self) -> u8 {
        let own = match self.policy {
            Policy::Fifo { prio } | Policy::RoundRobin { prio } => prio,
            _ => 0,
        };
        match self.boost {
            Some(boost) => boost.max(own),
            None => own,
        }
    }
}

/// Accounting counters, updated lock-free.
#[derive(Debug, Default)]
pub struct TaskStats {
    /// Total CPU time consumed, ns.
    pub sum_exec_runtime: AtomicU64,
    pub user_time_ns: AtomicU64,
    pub sys_time_ns: AtomicU64,
    /// Voluntary context switches (blocked or yielded).
    pub nvcsw: AtomicU64,
    /// Involuntary context switches (preempted).
    pub nivcsw: AtomicU64,
    pub minor_faults: AtomicU64,
    pub major_faults: AtomicU64,
}

pub struct Task {
    tid: Tid,
    name: String,

    state: AtomicU8,
    need_resched: AtomicBool,
    /// True while the task sits on some runqueue.
    on_rq: AtomicBool,
    /// Back index to the owning runqueue; never a pointer, so an offlined
    /// CPU cannot leave a dangling edge.
    cpu: AtomicU32,
    /// Runqueue clock when the task last ran, for cache-hotness scoring.
    last_ran: AtomicU64,

    affinity: SpinLock<CpuMask>,
    sched: SpinLock<SchedInfo>,

    /// Register save area; touched only by the CPU performing the switch.
    ctx: UnsafeCell<ArchContext>,
    /// Kernel stack backing storage. Absent for the boot task, whose stack
    /// predates the allocator.
    #[allow(dead_code)]
    stack: Option<Box<[u8]>>,
    /// Address space; `None` for kernel threads (they run on whatever
    /// tables are live).
    mm: Option<AddressSpaceId>,

    pub stats: TaskStats,
}

// The UnsafeCell'd context is only accessed from the context-switch path,
// serialized by the runqueue owning the task.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Kernel thread: own stack, no address space, entered at `entry(arg)`.
    pub fn new_kernel(
        name: &str,
        policy: Policy,
        affinity: CpuMask,
        entry: fn(usize) -> !,
        arg: usize,
    ) -> KernelResult<Arc<Self>> {
        policy.validate()?;
        if affinity.is_empty() {
            return Err(KernelError::InvalidParameter { what: "empty affinity mask" });
        }
        let stack = vec![0u8; KSTACK_SIZE].into_boxed_slice();
        let stack_top = stack.as_ptr() as usize + stack.len();
        let mut ctx = ArchContext::zeroed();
        hal::hal().prepare_thread(&mut ctx, entry as usize, arg, stack_top);
        Ok(Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            state: AtomicU8::new(TaskState::Runnable as u8),
            need_resched: AtomicBool::new(false),
            on_rq: AtomicBool::new(false),
            cpu: AtomicU32::new(affinity.first().unwrap_or(0) as u32),
            last_ran: AtomicU64::new(0),
            affinity: SpinLock::new(affinity),
            sched: SpinLock::new(SchedInfo::new(policy)),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            mm: None,
            stats: TaskStats::default(),
        }))
    }

    /// Per-CPU idle task. Never enters a runqueue; the idle class hands it
    /// out when everything else is empty.
    pub fn new_idle(cpu: u32) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: String::from("idle"),
            state: AtomicU8::new(TaskState::Runnable as u8),
            need_resched: AtomicBool::new(false),
            on_rq: AtomicBool::new(false),
            cpu: AtomicU32::new(cpu),
            last_ran: AtomicU64::new(0),
            affinity: SpinLock::new(CpuMask::single(cpu as usize)),
            sched: SpinLock::new(SchedInfo::new(Policy::Idle)),
            ctx: UnsafeCell::new(ArchContext::zeroed()),
            stack: None,
            mm: None,
            stats: TaskStats::default(),
        })
    }

    /// Bare fair-class task for unit tests; no stack, no entry point.
    #[cfg(test)]
    pub fn new_for_tests(name: &str) -> Arc<Self> {
        Self::with_policy_for_tests(name, Policy::Fair { nice: 0 })
    }

    #[cfg(test)]
    pub fn with_policy_for_tests(name: &str, policy: Policy) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            state: AtomicU8::new(TaskState::Runnable as u8),
            need_resched: AtomicBool::new(false),
            on_rq: AtomicBool::new(false),
            cpu: AtomicU32::new(0),
            last_ran: AtomicU64::new(0),
            affinity: SpinLock::new(CpuMask::all()),
            sched: SpinLock::new(SchedInfo::new(policy)),
            ctx: UnsafeCell::new(ArchContext::zeroed()),
            stack: None,
            mm: None,
            stats: TaskStats::default(),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub fn clear_need_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    pub fn on_rq(&self) -> bool {
        self.on_rq.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_rq(&self, on: bool) {
        self.on_rq.store(on, Ordering::Release);
    }

    /// CPU whose runqueue owns (or last owned) this task.
    pub fn cpu(&self) -> u32 {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn last_ran(&self) -> u64 {
        self.last_ran.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_ran(&self, now: u64) {
        self.last_ran.store(now, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> CpuMask {
        *self.affinity.lock()
    }

    pub(crate) fn set_affinity_mask(&self, mask: CpuMask) {
        *self.affinity.lock() = mask;
    }

    /// Scheduling fields. Lock order: runqueue lock first when both are
    /// needed.
    pub fn sched(&self) -> &SpinLock<SchedInfo> {
        &self.sched
    }

    /// Effective class snapshot.
    pub fn class(&self) -> SchedClass {
        self.sched.lock().class()
    }

    /// Effective RT priority snapshot.
    pub fn rt_prio(&self) -> u8 {
        self.sched.lock().rt_prio()
    }

    pub fn mm(&self) -> Option<AddressSpaceId> {
        self.mm
    }

    pub(crate) fn ctx_ptr(&self) -> *mut ArchContext {
        self.ctx.get()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .finish()
    }
}
