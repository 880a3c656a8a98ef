//! Interrupt descriptors and dispatch
//!
//! One descriptor per vector, 1024 vectors. Drivers attach handlers with
//! `request_irq` / `request_threaded_irq`; the low-level vector stubs call
//! `dispatch`. Handler chains run outside the descriptor lock so a handler
//! may request or free other vectors.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Once;

use crate::cpu::topology;
use crate::cpu::CpuMask;
use crate::error::{KernelError, KernelResult};
use crate::hal;
use crate::sync::spinlock::SpinLock;
use crate::time;

use super::chip::chip;
use super::storm::{StormState, StormVerdict};
use super::thread::IrqThread;

pub const NR_VECTORS: usize = 1024;

/// Vectors 0-31 are CPU exceptions; drivers may not claim them.
const FIRST_DEVICE_VECTOR: u32 = 32;

/// Consecutive unclaimed deliveries before a line is written off as
/// broken and masked.
const UNHANDLED_LIMIT: u32 = 1000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line may carry handlers from several devices; every handler on
        /// the vector must agree.
        const SHARED = 1 << 0;
        /// Keep the line masked from hard handler until the thread
        /// finishes. Required for level-triggered threaded handlers.
        const ONESHOT = 1 << 1;
    }
}

/// What a handler made of the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not this device.
    None,
    /// Serviced in hard context.
    Handled,
    /// Device quiesced; finish the work in the handler thread.
    WakeThread,
}

/// Trigger mode, as programmed into the controller's trigger and polarity
/// bits. Edge lines latch a transition; level lines assert until the
/// device is serviced, so their threaded handlers need `ONESHOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqFlow {
    EdgeRising,
    EdgeFalling,
    EdgeBoth,
    LevelHigh,
    LevelLow,
}

impl IrqFlow {
    pub fn is_level(self) -> bool {
        matches!(self, IrqFlow::LevelHigh | IrqFlow::LevelLow)
    }
}

/// Urgency band for a vector; folded into the controller's hardware
/// priority scheme where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IrqPriority {
    Low,
    Normal,
    High,
}

/// Message-signaled interrupt programming, recorded when a PCI driver
/// binds the vector. `table_index` is set for MSI-X entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiInfo {
    pub address: u64,
    pub data: u32,
    pub table_index: Option<u32>,
}

/// Hard handler: (vector, cookie) in interrupt context.
pub type IrqHandler = fn(u32, usize) -> IrqReturn;

struct IrqAction {
    name: &'static str,
    handler: IrqHandler,
    cookie: usize,
    flags: IrqFlags,
    thread: Option<Arc<IrqThread>>,
}

struct DescState {
    actions: Vec<Arc<IrqAction>>,
    flow: IrqFlow,
    priority: IrqPriority,
    msi: Option<MsiInfo>,
    /// Nested `disable_irq` calls; line unmasks when this returns to zero.
    disable_depth: u32,
    /// Masked by the kernel itself (unhandled streak or storm). Cleared
    /// only by an explicit `enable_irq`.
    auto_disabled: bool,
    /// Steering the caller asked for, kept so the line can fall back
    /// toward it again after CPU hotplug changes the online set.
    requested_affinity: CpuMask,
    /// Steering the controller actually honors.
    affinity: CpuMask,
    storm: StormState,
}

pub struct IrqDesc {
    vector: u32,
    state: SpinLock<DescState>,
    delivered: AtomicU64,
    handled: AtomicU64,
    unhandled: AtomicU64,
    dropped: AtomicU64,
    unhandled_streak: AtomicU32,
    time_total_ns: AtomicU64,
    time_min_ns: AtomicU64,
    time_max_ns: AtomicU64,
    last_handled_ns: AtomicU64,
}

/// Counters for one vector. The `time_*` fields cover handler-chain
/// execution of claimed deliveries only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IrqStats {
    pub delivered: u64,
    pub handled: u64,
    pub unhandled: u64,
    pub dropped: u64,
    pub time_total_ns: u64,
    /// Shortest handled chain; zero while nothing was handled.
    pub time_min_ns: u64,
    pub time_max_ns: u64,
    /// Delivery timestamp of the most recent handled interrupt.
    pub last_handled_ns: u64,
}

impl IrqStats {
    pub fn avg_time_ns(&self) -> u64 {
        if self.handled == 0 {
            0
        } else {
            self.time_total_ns / self.handled
        }
    }
}

static DESCRIPTORS: Once<alloc::boxed::Box<[IrqDesc]>> = Once::new();

/// Storm-masked vectors and the time their quiet period ends; swept by
/// the tick.
static MASKED_FOR_QUIET: Once<SpinLock<hashbrown::HashMap<u32, u64>>> = Once::new();

fn masked_for_quiet() -> &'static SpinLock<hashbrown::HashMap<u32, u64>> {
    MASKED_FOR_QUIET.call_once(|| SpinLock::new(hashbrown::HashMap::new()))
}

fn descriptors() -> &'static [IrqDesc] {
    DESCRIPTORS.call_once(|| {
        let mut table = Vec::with_capacity(NR_VECTORS);
        for vector in 0..NR_VECTORS as u32 {
            table.push(IrqDesc {
                vector,
                state: SpinLock::new(DescState {
                    actions: Vec::new(),
                    flow: IrqFlow::EdgeRising,
                    priority: IrqPriority::Normal,
                    msi: None,
                    disable_depth: 0,
                    auto_disabled: false,
                    requested_affinity: CpuMask::all(),
                    affinity: CpuMask::all(),
                    storm: StormState::new(),
                }),
                delivered: AtomicU64::new(0),
                handled: AtomicU64::new(0),
                unhandled: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                unhandled_streak: AtomicU32::new(0),
                time_total_ns: AtomicU64::new(0),
                time_min_ns: AtomicU64::new(u64::MAX),
                time_max_ns: AtomicU64::new(0),
                last_handled_ns: AtomicU64::new(0),
            });
        }
        table.into_boxed_slice()
    })
}

fn desc_checked(vector: u32) -> KernelResult<&'static IrqDesc> {
    descriptors()
        .get(vector as usize)
        .ok_or(KernelError::InvalidParameter { what: "irq vector out of range" })
}

fn wake_thread_primary(_vector: u32, _cookie: usize) -> IrqReturn {
    IrqReturn::WakeThread
}

/// Attach a hard handler to `vector`. The cookie distinguishes handlers
/// on a shared line and is passed back on every invocation and on free.
pub fn request_irq(
    vector: u32,
    name: &'static str,
    handler: IrqHandler,
    cookie: usize,
    flags: IrqFlags,
) -> KernelResult<()> {
    setup_irq(vector, name, handler, None, cookie, flags)
}

/// Attach a handler pair: `handler` runs in interrupt context (defaults to
/// an immediate thread wakeup), `thread_fn` in a dedicated kernel thread.
pub fn request_threaded_irq(
    vector: u32,
    name: &'static str,
    handler: Option<IrqHandler>,
    thread_fn: IrqHandler,
    cookie: usize,
    flags: IrqFlags,
) -> KernelResult<()> {
    setup_irq(
        vector,
        name,
        handler.unwrap_or(wake_thread_primary),
        Some(thread_fn),
        cookie,
        flags,
    )
}

fn setup_irq(
    vector: u32,
    name: &'static str,
    handler: IrqHandler,
    thread_fn: Option<IrqHandler>,
    cookie: usize,
    flags: IrqFlags,
) -> KernelResult<()> {
    let desc = desc_checked(vector)?;
    if vector < FIRST_DEVICE_VECTOR || vector == hal::RESCHED_VECTOR as u32 {
        return Err(KernelError::PermissionDenied { what: "vector reserved by the kernel" });
    }
    check_sharing(desc, cookie, flags)?;

    // Spawn outside the descriptor lock; the runner takes scheduler locks.
    let thread = match thread_fn {
        Some(f) => Some(IrqThread::spawn(vector, name, f, cookie, flags)?),
        None => None,
    };

    let conflict = {
        let mut st = desc.state.lock();
        if sharing_conflict(&st, cookie, flags) {
            true
        } else {
            let first = st.actions.is_empty();
            st.actions.push(Arc::new(IrqAction { name, handler, cookie, flags, thread: thread.clone() }));
            if first {
                st.storm.reset();
                st.auto_disabled = false;
                desc.unhandled_streak.store(0, Ordering::Relaxed);
                if st.disable_depth == 0 {
                    chip().unmask(vector);
                }
            }
            false
        }
    };
    if conflict {
        // Lost a race with another requester.
        if let Some(t) = &thread {
            t.stop();
        }
        return Err(KernelError::Busy { what: "irq vector in use" });
    }
    log::debug!("irq {}: handler '{}' attached", vector, name);
    Ok(())
}

fn check_sharing(desc: &IrqDesc, cookie: usize, flags: IrqFlags) -> KernelResult<()> {
    let st = desc.state.lock();
    if sharing_conflict(&st, cookie, flags) {
        return Err(KernelError::Busy { what: "irq vector in use" });
    }
    Ok(())
}

fn sharing_conflict(st: &DescState, cookie: usize, flags: IrqFlags) -> bool {
    if st.actions.iter().any(|a| a.cookie == cookie) {
        return true;
    }
    !st.actions.is_empty()
        && (!flags.contains(IrqFlags::SHARED)
            || st.actions.iter().any(|a| !a.flags.contains(IrqFlags::SHARED)))
}

/// Detach the handler registered with `cookie`. Waits for its handler
/// thread to exit; the caller must not hold locks the thread needs.
pub fn free_irq(vector: u32, cookie: usize) -> KernelResult<()> {
    let desc = desc_checked(vector)?;
    let removed = {
        let mut st = desc.state.lock();
        let pos = st
            .actions
            .iter()
            .position(|a| a.cookie == cookie)
            .ok_or(KernelError::NotFound { what: "no handler with this cookie" })?;
        let action = st.actions.remove(pos);
        if st.actions.is_empty() {
            chip().mask(vector);
        }
        action
    };
    if let Some(thread) = &removed.thread {
        thread.stop();
    }
    log::debug!("irq {}: handler '{}' detached", vector, removed.name);
    Ok(())
}

/// Mask the line. Nests; `enable_irq` must be called as many times.
pub fn disable_irq(vector: u32) -> KernelResult<()> {
    let desc = desc_checked(vector)?;
    let mut st = desc.state.lock();
    st.disable_depth += 1;
    if st.disable_depth == 1 {
        chip().mask(vector);
    }
    Ok(())
}

/// Undo one `disable_irq`. Also the manual recovery path for lines the
/// kernel masked itself (storm or unhandled streak).
pub fn enable_irq(vector: u32) -> KernelResult<()> {
    let desc = desc_checked(vector)?;
    let mut st = desc.state.lock();
    match st.disable_depth {
        0 => {
            if !st.auto_disabled && !st.storm.is_disabled() {
                log::warn!("irq {}: unbalanced enable", vector);
                return Ok(());
            }
        }
        _ => {
            st.disable_depth -= 1;
            if st.disable_depth != 0 {
                return Ok(());
            }
        }
    }
    st.auto_disabled = false;
    st.storm.reset();
    desc.unhandled_streak.store(0, Ordering::Relaxed);
    if !st.actions.is_empty() {
        chip().unmask(vector);
    }
    Ok(())
}

/// Steer the vector. Returns the affinity the controller actually honors.
pub fn irq_set_affinity(vector: u32, mask: CpuMask) -> KernelResult<CpuMask> {
    let desc = desc_checked(vector)?;
    let effective = chip().set_affinity(vector, &mask)?;
    let mut st = desc.state.lock();
    st.requested_affinity = mask;
    st.affinity = effective;
    Ok(effective)
}

pub fn irq_affinity(vector: u32) -> KernelResult<CpuMask> {
    Ok(desc_checked(vector)?.state.lock().affinity)
}

/// Re-steer every vector whose effective affinity includes a CPU that went
/// offline. The originally requested mask is honored where it still names
/// an online CPU; a line whose request became impossible falls back to any
/// online CPU.
pub fn reroute_for_offline(cpu: usize) {
    for desc in descriptors().iter() {
        let mut st = desc.state.lock();
        if !st.affinity.test(cpu) {
            continue;
        }
        let mut wanted = st.requested_affinity.and(&topology::online_mask());
        if wanted.is_empty() {
            wanted = topology::online_mask();
        }
        match chip().set_affinity(desc.vector, &wanted) {
            Ok(effective) => st.affinity = effective,
            Err(err) => {
                log::warn!("irq {}: re-route off cpu {} failed: {}", desc.vector, cpu, err);
            }
        }
    }
}

/// Select the trigger mode and program it into the controller. Refused
/// while handlers are attached.
pub fn set_irq_flow(vector: u32, flow: IrqFlow) -> KernelResult<()> {
    let desc = desc_checked(vector)?;
    let mut st = desc.state.lock();
    if !st.actions.is_empty() {
        return Err(KernelError::Busy { what: "flow change with handlers attached" });
    }
    chip().set_flow(vector, flow)?;
    st.flow = flow;
    Ok(())
}

pub fn irq_flow(vector: u32) -> KernelResult<IrqFlow> {
    Ok(desc_checked(vector)?.state.lock().flow)
}

/// Urgency class for the vector; takes effect the next time the chip
/// programs the line.
pub fn set_irq_priority(vector: u32, priority: IrqPriority) -> KernelResult<()> {
    desc_checked(vector)?.state.lock().priority = priority;
    Ok(())
}

pub fn irq_priority(vector: u32) -> KernelResult<IrqPriority> {
    Ok(desc_checked(vector)?.state.lock().priority)
}

/// Record the MSI/MSI-X message programmed for this vector, or clear it
/// when the device releases the line.
pub fn set_irq_msi(vector: u32, info: Option<MsiInfo>) -> KernelResult<()> {
    desc_checked(vector)?.state.lock().msi = info;
    Ok(())
}

pub fn irq_msi(vector: u32) -> KernelResult<Option<MsiInfo>> {
    Ok(desc_checked(vector)?.state.lock().msi)
}

pub fn irq_stats(vector: u32) -> KernelResult<IrqStats> {
    let desc = desc_checked(vector)?;
    let min = desc.time_min_ns.load(Ordering::Relaxed);
    Ok(IrqStats {
        delivered: desc.delivered.load(Ordering::Relaxed),
        handled: desc.handled.load(Ordering::Relaxed),
        unhandled: desc.unhandled.load(Ordering::Relaxed),
        dropped: desc.dropped.load(Ordering::Relaxed),
        time_total_ns: desc.time_total_ns.load(Ordering::Relaxed),
        time_min_ns: if min == u64::MAX { 0 } else { min },
        time_max_ns: desc.time_max_ns.load(Ordering::Relaxed),
        last_handled_ns: desc.last_handled_ns.load(Ordering::Relaxed),
    })
}

/// Entry from the low-level vector stub; interrupts are disabled.
pub fn dispatch(vector: u32) {
    dispatch_at(vector, time::now_ns())
}

pub(crate) fn dispatch_at(vector: u32, now_ns: u64) {
    if vector == hal::RESCHED_VECTOR as u32 {
        crate::sched::resched_ipi();
        chip().eoi(vector);
        return;
    }
    let Some(desc) = descriptors().get(vector as usize) else {
        log::warn!("interrupt on impossible vector {}", vector);
        return;
    };
    chip().ack(vector);
    desc.delivered.fetch_add(1, Ordering::Relaxed);

    let actions = {
        let mut st = desc.state.lock();
        if st.disable_depth > 0 || st.auto_disabled {
            None
        } else {
            match st.storm.record(now_ns) {
                StormVerdict::Deliver => Some(st.actions.clone()),
                StormVerdict::Sampled => None,
                StormVerdict::Masked => {
                    chip().mask(vector);
                    if let Some(until) = st.storm.masked_until() {
                        note_masked(vector, until);
                    }
                    None
                }
                StormVerdict::Disabled => {
                    st.auto_disabled = true;
                    chip().mask(vector);
                    log::error!("irq {}: storming, disabled until re-enabled", vector);
                    None
                }
            }
        }
    };
    let Some(actions) = actions else {
        desc.dropped.fetch_add(1, Ordering::Relaxed);
        chip().eoi(vector);
        return;
    };

    let chain_start = time::now_ns();
    let mut claimed = false;
    for action in &actions {
        match (action.handler)(vector, action.cookie) {
            IrqReturn::None => {}
            IrqReturn::Handled => claimed = true,
            IrqReturn::WakeThread => {
                claimed = true;
                if let Some(thread) = &action.thread {
                    if action.flags.contains(IrqFlags::ONESHOT) {
                        chip().mask(vector);
                    }
                    thread.kick();
                } else {
                    log::warn!("irq {}: '{}' woke a thread it does not have", vector, action.name);
                }
            }
        }
    }

    if claimed {
        let elapsed = time::now_ns().saturating_sub(chain_start);
        desc.handled.fetch_add(1, Ordering::Relaxed);
        desc.unhandled_streak.store(0, Ordering::Relaxed);
        desc.time_total_ns.fetch_add(elapsed, Ordering::Relaxed);
        desc.time_min_ns.fetch_min(elapsed, Ordering::Relaxed);
        desc.time_max_ns.fetch_max(elapsed, Ordering::Relaxed);
        desc.last_handled_ns.store(now_ns, Ordering::Relaxed);
    } else {
        desc.unhandled.fetch_add(1, Ordering::Relaxed);
        let streak = desc.unhandled_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= UNHANDLED_LIMIT {
            let mut st = desc.state.lock();
            if !st.auto_disabled {
                st.auto_disabled = true;
                chip().mask(vector);
                log::error!("irq {}: nobody cared after {} deliveries, disabled", desc.vector, streak);
            }
        }
    }
    chip().eoi(vector);
}

fn note_masked(vector: u32, until_ns: u64) {
    masked_for_quiet().lock().insert(vector, until_ns);
}

/// Periodic sweep: unmask storm-quieted lines whose quiet period ended.
pub fn storm_tick(now_ns: u64) {
    let expired: Vec<u32> = {
        let mut masked = masked_for_quiet().lock();
        let done: Vec<u32> = masked
            .iter()
            .filter(|&(_, &until)| until <= now_ns)
            .map(|(&v, _)| v)
            .collect();
        for v in &done {
            masked.remove(v);
        }
        done
    };
    for vector in expired {
        let Ok(desc) = desc_checked(vector) else { continue };
        let st = desc.state.lock();
        if st.disable_depth == 0 && !st.auto_disabled && !st.actions.is_empty() {
            chip().unmask(vector);
            log::info!("irq {}: quiet period over, unmasked", vector);
        }
    }
}

#[cfg(test)]
fn thread_of(vector: u32, cookie: usize) -> Option<Arc<IrqThread>> {
    let desc = desc_checked(vector).ok()?;
    let st = desc.state.lock();
    st.actions.iter().find(|a| a.cookie == cookie)?.thread.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::irq::chip::stub_chip;
    use core::sync::atomic::AtomicUsize;

    // Cookie doubles as a pointer to the per-test hit counter, so each
    // test observes only its own handler.
    fn hits(cookie: usize) -> &'static AtomicUsize {
        unsafe { &*(cookie as *const AtomicUsize) }
    }

    fn claiming(vector: u32, cookie: usize) -> IrqReturn {
        let _ = vector;
        hits(cookie).fetch_add(1, Ordering::SeqCst);
        IrqReturn::Handled
    }

    fn declining(vector: u32, cookie: usize) -> IrqReturn {
        let _ = vector;
        hits(cookie).fetch_add(1, Ordering::SeqCst);
        IrqReturn::None
    }

    fn leak_counter() -> usize {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(AtomicUsize::new(0))) as *const _ as usize
    }

    #[test]
    fn reserved_and_out_of_range_vectors_are_refused() {
        let c = leak_counter();
        assert!(matches!(
            request_irq(3, "bad", claiming, c, IrqFlags::empty()),
            Err(KernelError::PermissionDenied { .. })
        ));
        assert!(matches!(
            request_irq(NR_VECTORS as u32, "bad", claiming, c, IrqFlags::empty()),
            Err(KernelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn shared_line_walks_the_whole_chain() {
        let vector = 100;
        let (a, b) = (leak_counter(), leak_counter());
        request_irq(vector, "dev-a", declining, a, IrqFlags::SHARED).unwrap();
        request_irq(vector, "dev-b", claiming, b, IrqFlags::SHARED).unwrap();

        dispatch_at(vector, 1_000);
        assert_eq!(hits(a).load(Ordering::SeqCst), 1);
        assert_eq!(hits(b).load(Ordering::SeqCst), 1);
        let stats = irq_stats(vector).unwrap();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.handled, 1);

        free_irq(vector, a).unwrap();
        free_irq(vector, b).unwrap();
        assert!(matches!(free_irq(vector, b), Err(KernelError::NotFound { .. })));
    }

    #[test]
    fn exclusive_line_rejects_second_handler() {
        let vector = 101;
        let (a, b) = (leak_counter(), leak_counter());
        request_irq(vector, "dev-a", claiming, a, IrqFlags::empty()).unwrap();
        assert!(matches!(
            request_irq(vector, "dev-b", claiming, b, IrqFlags::SHARED),
            Err(KernelError::Busy { .. })
        ));
        // Same cookie twice is a driver bug even with SHARED.
        assert!(matches!(
            request_irq(vector, "dev-a", claiming, a, IrqFlags::SHARED),
            Err(KernelError::Busy { .. })
        ));
        free_irq(vector, a).unwrap();
    }

    #[test]
    fn disable_depth_nests() {
        let vector = 102;
        let c = leak_counter();
        request_irq(vector, "dev", claiming, c, IrqFlags::empty()).unwrap();
        disable_irq(vector).unwrap();
        disable_irq(vector).unwrap();
        dispatch_at(vector, 1_000);
        assert_eq!(hits(c).load(Ordering::SeqCst), 0);
        assert_eq!(irq_stats(vector).unwrap().dropped, 1);

        enable_irq(vector).unwrap();
        dispatch_at(vector, 2_000);
        assert_eq!(hits(c).load(Ordering::SeqCst), 0);

        enable_irq(vector).unwrap();
        assert!(!stub_chip().is_masked(vector));
        dispatch_at(vector, 3_000);
        assert_eq!(hits(c).load(Ordering::SeqCst), 1);
        free_irq(vector, c).unwrap();
    }

    #[test]
    fn unclaimed_streak_disables_the_line() {
        let vector = 103;
        let c = leak_counter();
        request_irq(vector, "mute", declining, c, IrqFlags::empty()).unwrap();
        for i in 0..UNHANDLED_LIMIT as u64 {
            // Slow cadence so the storm ladder stays out of the way.
            dispatch_at(vector, i * 10_000_000);
        }
        assert!(stub_chip().is_masked(vector));
        let before = irq_stats(vector).unwrap();
        dispatch_at(vector, u64::from(UNHANDLED_LIMIT) * 10_000_000 + 1);
        assert_eq!(irq_stats(vector).unwrap().dropped, before.dropped + 1);

        // Manual recovery.
        enable_irq(vector).unwrap();
        assert!(!stub_chip().is_masked(vector));
        free_irq(vector, c).unwrap();
    }

    #[test]
    fn flow_change_requires_a_free_line() {
        let vector = 104;
        let c = leak_counter();
        set_irq_flow(vector, IrqFlow::LevelHigh).unwrap();
        request_irq(vector, "dev", claiming, c, IrqFlags::empty()).unwrap();
        assert!(matches!(
            set_irq_flow(vector, IrqFlow::EdgeRising),
            Err(KernelError::Busy { .. })
        ));
        free_irq(vector, c).unwrap();
        set_irq_flow(vector, IrqFlow::EdgeRising).unwrap();
    }

    #[test]
    fn affinity_is_clamped_to_online_cpus() {
        crate::test_util::init_topology();
        let vector = 105;
        let effective = irq_set_affinity(vector, CpuMask::first_n(4)).unwrap();
        assert!(!effective.is_empty());
        assert_eq!(irq_affinity(vector).unwrap(), effective);
        assert!(matches!(
            irq_set_affinity(vector, CpuMask::empty()),
            Err(KernelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn storm_masks_then_recovers_after_quiet_period() {
        let vector = 106;
        let c = leak_counter();
        request_irq(vector, "chatty", claiming, c, IrqFlags::empty()).unwrap();

        // Fire 1 ns apart until the ladder masks the line.
        let mut now = 0u64;
        while !stub_chip().is_masked(vector) {
            now += 1;
            dispatch_at(vector, now);
        }
        let stats = irq_stats(vector).unwrap();
        assert!(stats.dropped > 0);
        assert!(stats.handled < stats.delivered);

        // Quiet period passes; the tick unmasks.
        let quiet_ns = config::tunables().irq_storm_quiet_time_ms * 1_000_000;
        storm_tick(now + 1);
        assert!(stub_chip().is_masked(vector));
        storm_tick(now + quiet_ns + 1);
        assert!(!stub_chip().is_masked(vector));

        dispatch_at(vector, now + quiet_ns + 2);
        free_irq(vector, c).unwrap();
    }

    // First chain takes 5 us of clock, later ones 1 us.
    fn timed(vector: u32, cookie: usize) -> IrqReturn {
        let _ = vector;
        let n = hits(cookie).fetch_add(1, Ordering::SeqCst);
        crate::time::boot_clock().advance(if n == 0 { 5_000 } else { 1_000 });
        IrqReturn::Handled
    }

    #[test]
    fn handler_runtime_feeds_the_stats() {
        let vector = 108;
        let c = leak_counter();
        request_irq(vector, "timed", timed, c, IrqFlags::empty()).unwrap();

        dispatch_at(vector, 1_000);
        dispatch_at(vector, 2_000);
        let stats = irq_stats(vector).unwrap();
        assert_eq!(stats.handled, 2);
        assert_eq!(stats.time_min_ns, 1_000);
        assert_eq!(stats.time_max_ns, 5_000);
        assert_eq!(stats.time_total_ns, 6_000);
        assert_eq!(stats.avg_time_ns(), 3_000);
        assert_eq!(stats.last_handled_ns, 2_000);

        free_irq(vector, c).unwrap();
    }

    #[test]
    fn flow_priority_and_msi_metadata_round_trip() {
        let vector = 109;
        assert_eq!(irq_flow(vector).unwrap(), IrqFlow::EdgeRising);
        set_irq_flow(vector, IrqFlow::LevelLow).unwrap();
        assert_eq!(irq_flow(vector).unwrap(), IrqFlow::LevelLow);
        assert!(IrqFlow::LevelLow.is_level());
        // The controller saw the trigger programming.
        assert_eq!(stub_chip().flow_of(vector), Some(IrqFlow::LevelLow));

        assert_eq!(irq_priority(vector).unwrap(), IrqPriority::Normal);
        set_irq_priority(vector, IrqPriority::High).unwrap();
        assert_eq!(irq_priority(vector).unwrap(), IrqPriority::High);

        assert_eq!(irq_msi(vector).unwrap(), None);
        let msi = MsiInfo { address: 0xfee0_0000, data: 0x4041, table_index: Some(3) };
        set_irq_msi(vector, Some(msi)).unwrap();
        assert_eq!(irq_msi(vector).unwrap(), Some(msi));
        set_irq_msi(vector, None).unwrap();
        assert_eq!(irq_msi(vector).unwrap(), None);
    }

    #[test]
    fn offline_reroute_falls_back_within_the_requested_mask() {
        crate::test_util::init_topology();
        let _serial = crate::test_util::global_lock();
        let vector = 110;
        let mut wanted = CpuMask::empty();
        wanted.set(4);
        wanted.set(5);
        assert_eq!(irq_set_affinity(vector, wanted).unwrap(), wanted);

        topology::set_online(5, false);
        reroute_for_offline(5);
        assert_eq!(irq_affinity(vector).unwrap(), CpuMask::single(4));
        topology::set_online(5, true);

        // The original request survives the detour.
        assert_eq!(irq_set_affinity(vector, wanted).unwrap(), wanted);
    }

    #[test]
    fn threaded_handler_defers_work_and_oneshot_unmasks_after_service() {
        crate::test_util::init_topology();
        let _serial = crate::test_util::global_lock();
        let vector = 107;
        let c = leak_counter();
        request_threaded_irq(vector, "slow-dev", None, claiming, c, IrqFlags::ONESHOT).unwrap();

        dispatch_at(vector, 1_000);
        // Hard path only woke the thread; the work has not run yet.
        assert_eq!(hits(c).load(Ordering::SeqCst), 0);
        assert!(stub_chip().is_masked(vector));
        let thread = thread_of(vector, c).expect("handler thread");
        assert_eq!(thread.pending_wakeups(), 1);

        thread.service();
        assert_eq!(hits(c).load(Ordering::SeqCst), 1);
        assert!(!stub_chip().is_masked(vector));

        free_irq(vector, c).unwrap();
    }
}
