//! RCU-style grace-period engine for deferred reclamation.
//!
//! Read sections are cheap: a per-CPU depth increment with preemption
//! disabled. Writers either block in [`synchronize`] or defer a callback
//! with [`call`]; both wait for a grace period, an interval after which
//! every CPU online at its start has been quiescent (read depth zero and
//! preempt depth zero) at least once.
//!
//! Grace periods are tracked by a monotone sequence number. Starting a
//! period publishes a target `gp_seq + 1`; each CPU acknowledges by
//! publishing `seen_gp = target` from a quiescent moment; when every
//! online CPU has acknowledged, the sequence advances and callbacks whose
//! target is now covered detach for invocation outside the lock, in FIFO
//! order.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use argon_core::cpu::{self, MAX_CPUS};
use argon_core::cpu_local::CpuLocal;
use argon_core::id::CpuId;
use argon_core::kwarn;
use argon_core::sync::IrqSpinLock;
use argon_sched::preempt;

use crate::config::RCU_SYNC_TIMEOUT_TICKS;
use crate::time;

/// Deferred-callback function.
pub type RcuCallback = fn(ctx: *mut ());

/// Heap node for one deferred callback, linked FIFO.
struct CallbackNode {
    next: *mut CallbackNode,
    func: RcuCallback,
    ctx: *mut (),
    target_gp: u64,
}

/// Grace-period bookkeeping guarded by the RCU lock.
struct GpState {
    /// Pending target, or 0 when no grace period is in flight.
    target: u64,
    cb_head: *mut CallbackNode,
    cb_tail: *mut CallbackNode,
    cb_pending: u64,
}

// SAFETY: The raw callback pointers are only touched under the RCU lock.
unsafe impl Send for GpState {}

/// Completed grace-period sequence. Written under the RCU lock,
/// acquire-loaded by `synchronize` spinners: the sequence advance
/// happens-before any callback whose target it covers is invoked.
static GP_SEQ: AtomicU64 = AtomicU64::new(0);

static STATE: IrqSpinLock<GpState> = IrqSpinLock::new(GpState {
    target: 0,
    cb_head: ptr::null_mut(),
    cb_tail: ptr::null_mut(),
    cb_pending: 0,
});

/// Per-CPU read-section depth.
static READ_DEPTH: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

/// Highest grace-period target each CPU has acknowledged.
static SEEN_GP: CpuLocal<AtomicU64> = CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);

static READY: AtomicBool = AtomicBool::new(false);

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcuStats {
    /// Completed grace-period sequence.
    pub gp_seq: u64,
    /// Pending target (0 if none).
    pub gp_target: u64,
    /// Callbacks waiting for a grace period.
    pub callbacks_pending: u64,
    /// Calling CPU's read-section depth.
    pub local_read_depth: u32,
    /// Calling CPU's preempt-disable depth.
    pub local_preempt_depth: u32,
}

/// Initializes (or re-arms) the engine with no grace period in flight.
///
/// Callbacks still queued are dropped on the floor; callers only invoke
/// this before the first writer exists.
pub fn init() {
    let mut state = STATE.lock();
    state.target = 0;
    state.cb_head = ptr::null_mut();
    state.cb_tail = ptr::null_mut();
    state.cb_pending = 0;
    GP_SEQ.store(0, Ordering::Release);
    for i in 0..MAX_CPUS as u32 {
        READ_DEPTH.get_for(CpuId::new(i)).store(0, Ordering::Release);
        SEEN_GP.get_for(CpuId::new(i)).store(0, Ordering::Release);
    }
    READY.store(true, Ordering::Release);
}

/// Quiescence predicate: no read section and no preempt-disable nesting.
fn can_report_qs(cpu: CpuId) -> bool {
    READ_DEPTH.get_for(cpu).load(Ordering::Acquire) == 0 && preempt::depth_of(cpu) == 0
}

/// Starts a grace period if none is pending; returns the active target.
///
/// CPUs already quiescent are pre-marked as having acknowledged: a CPU
/// with no reader at start time cannot hold a reference the new period
/// must wait for.
fn start_gp_locked(state: &mut GpState) -> u64 {
    if state.target != 0 {
        return state.target;
    }

    let target = GP_SEQ.load(Ordering::Acquire) + 1;
    state.target = target;

    for online in cpu::table().online_cpus() {
        if can_report_qs(online) {
            SEEN_GP.get_for(online).store(target, Ordering::Release);
        }
    }
    target
}

/// Completes the pending grace period if every online CPU acknowledged it.
/// Returns the completed sequence, or 0.
fn try_complete_gp_locked(state: &mut GpState) -> u64 {
    if state.target == 0 {
        return 0;
    }
    let target = state.target;

    for online in cpu::table().online_cpus() {
        if SEEN_GP.get_for(online).load(Ordering::Acquire) < target {
            return 0;
        }
    }

    GP_SEQ.store(target, Ordering::Release);
    state.target = 0;
    target
}

/// Detaches the FIFO prefix of callbacks whose target is covered by
/// `completed_gp`, preserving order.
fn detach_ready_locked(state: &mut GpState, completed_gp: u64) -> *mut CallbackNode {
    if completed_gp == 0 || state.cb_head.is_null() {
        return ptr::null_mut();
    }

    let mut ready_head: *mut CallbackNode = ptr::null_mut();
    let mut ready_tail: *mut CallbackNode = ptr::null_mut();

    // SAFETY: All nodes are live heap allocations linked under this lock.
    unsafe {
        while !state.cb_head.is_null() && (*state.cb_head).target_gp <= completed_gp {
            let node = state.cb_head;
            state.cb_head = (*node).next;
            (*node).next = ptr::null_mut();

            if ready_head.is_null() {
                ready_head = node;
            } else {
                (*ready_tail).next = node;
            }
            ready_tail = node;
            state.cb_pending = state.cb_pending.saturating_sub(1);
        }
    }

    if state.cb_head.is_null() {
        state.cb_tail = ptr::null_mut();
    }
    ready_head
}

/// Invokes and frees a detached callback list. Runs outside the RCU lock.
fn run_callback_list(mut list: *mut CallbackNode) {
    while !list.is_null() {
        // SAFETY: The list was detached under the lock; nodes are exclusively
        // ours now.
        unsafe {
            let node = list;
            list = (*node).next;
            ((*node).func)((*node).ctx);
            alloc::alloc::dealloc(node.cast::<u8>(), Layout::new::<CallbackNode>());
        }
    }
}

/// Reports a quiescent state for `cpu` and reaps whatever became ready.
fn note_qs_on(cpu: CpuId) {
    if !READY.load(Ordering::Acquire) || !can_report_qs(cpu) {
        return;
    }

    let ready = {
        let mut state = STATE.lock();
        if state.target != 0 && SEEN_GP.get_for(cpu).load(Ordering::Acquire) < state.target {
            SEEN_GP.get_for(cpu).store(state.target, Ordering::Release);
        }
        let completed = try_complete_gp_locked(&mut state);
        detach_ready_locked(&mut state, completed)
    };

    run_callback_list(ready);
}

/// Reports a quiescent state for the calling CPU.
///
/// Called from `read_unlock`, from `synchronize`'s spin, and
/// opportunistically from the idle loop.
pub fn note_quiescent_state() {
    note_qs_on(cpu::current_logical_index());
}

/// Enters a read section: disables preemption and bumps the local depth.
pub fn read_lock() {
    if !READY.load(Ordering::Acquire) {
        return;
    }
    preempt::disable();
    READ_DEPTH.get().fetch_add(1, Ordering::AcqRel);
}

/// Leaves a read section, then drops into a quiescent-state check.
pub fn read_unlock() {
    if !READY.load(Ordering::Acquire) {
        return;
    }
    let depth = READ_DEPTH.get();
    if depth.load(Ordering::Relaxed) != 0 {
        depth.fetch_sub(1, Ordering::AcqRel);
    }
    preempt::enable();
    note_quiescent_state();
}

/// Defers `func(ctx)` until a grace period that began no earlier than this
/// call has elapsed. Returns `false` on allocation failure.
pub fn call(func: RcuCallback, ctx: *mut ()) -> bool {
    if !READY.load(Ordering::Acquire) {
        return false;
    }

    let layout = Layout::new::<CallbackNode>();
    // SAFETY: The layout has non-zero size and valid alignment.
    let node = unsafe { alloc::alloc::alloc(layout) }.cast::<CallbackNode>();
    if node.is_null() {
        return false;
    }

    {
        let mut state = STATE.lock();
        let target = start_gp_locked(&mut state);
        // SAFETY: `node` is a fresh allocation of the right layout.
        unsafe {
            node.write(CallbackNode {
                next: ptr::null_mut(),
                func,
                ctx,
                target_gp: target,
            });
            if state.cb_tail.is_null() {
                state.cb_head = node;
            } else {
                (*state.cb_tail).next = node;
            }
        }
        state.cb_tail = node;
        state.cb_pending += 1;
    }

    note_quiescent_state();
    true
}

/// Waits until a grace period that began no earlier than this call has
/// fully elapsed.
///
/// Spins with pause-backoff, re-reporting the caller's own quiescence.
/// Returns `false` if the tick-bounded budget expires first. This is a liveness
/// bound, not a safety one: the period stays pending and completes when
/// the straggler CPU quiesces, so the caller may simply retry.
pub fn synchronize() -> bool {
    if !READY.load(Ordering::Acquire) {
        return false;
    }

    let target = {
        let mut state = STATE.lock();
        start_gp_locked(&mut state)
    };

    let start_ticks = time::ticks();
    loop {
        if GP_SEQ.load(Ordering::Acquire) >= target {
            return true;
        }

        note_quiescent_state();
        core::hint::spin_loop();

        if time::ticks().wrapping_sub(start_ticks) > RCU_SYNC_TIMEOUT_TICKS {
            kwarn!(
                "rcu: synchronize timed out waiting for gp {} (seq {})",
                target,
                GP_SEQ.load(Ordering::Acquire)
            );
            return false;
        }
    }
}

/// Snapshot of the engine state plus the calling CPU's depths.
#[must_use]
pub fn stats() -> RcuStats {
    let cpu = cpu::current_logical_index();
    let state = STATE.lock();
    RcuStats {
        gp_seq: GP_SEQ.load(Ordering::Acquire),
        gp_target: state.target,
        callbacks_pending: state.cb_pending,
        local_read_depth: READ_DEPTH.get_for(cpu).load(Ordering::Relaxed),
        local_preempt_depth: preempt::depth_of(cpu),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn setup() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        test_util::init_topology();
        init();
        guard
    }

    /// Simulates a remote CPU entering a read section.
    fn remote_read_lock(cpu: CpuId) {
        READ_DEPTH.get_for(cpu).fetch_add(1, Ordering::AcqRel);
    }

    /// Simulates a remote CPU leaving its read section and reporting.
    fn remote_read_unlock(cpu: CpuId) {
        READ_DEPTH.get_for(cpu).fetch_sub(1, Ordering::AcqRel);
        note_qs_on(cpu);
    }

    #[test]
    fn read_roundtrip_leaves_no_trace() {
        let _guard = setup();
        let before = stats();
        read_lock();
        assert_eq!(stats().local_read_depth, before.local_read_depth + 1);
        read_unlock();
        let after = stats();
        assert_eq!(after.local_read_depth, before.local_read_depth);
        // No concurrent grace period was waiting, so the sequence is
        // untouched.
        assert_eq!(after.gp_seq, before.gp_seq);
    }

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_fire(_ctx: *mut ()) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn callback_waits_for_every_reader() {
        let _guard = setup();
        FIRED.store(0, Ordering::SeqCst);

        // CPUs 1..=3 are mid-read when the callback is registered.
        for i in 1..=3u32 {
            remote_read_lock(CpuId::new(i));
        }
        assert!(call(count_fire, ptr::null_mut()));
        assert_eq!(stats().gp_target, 1);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        // Readers drain one by one; the callback may fire only after the
        // last one.
        remote_read_unlock(CpuId::new(1));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        remote_read_unlock(CpuId::new(2));
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        remote_read_unlock(CpuId::new(3));

        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        let s = stats();
        assert_eq!(s.gp_seq, 1);
        assert_eq!(s.gp_target, 0);
        assert_eq!(s.callbacks_pending, 0);
    }

    static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record_a(_ctx: *mut ()) {
        ORDER.lock().unwrap().push(1);
    }
    fn record_b(_ctx: *mut ()) {
        ORDER.lock().unwrap().push(2);
    }

    #[test]
    fn callbacks_fire_in_fifo_order() {
        let _guard = setup();
        ORDER.lock().unwrap().clear();

        remote_read_lock(CpuId::new(1));
        assert!(call(record_a, ptr::null_mut()));
        assert!(call(record_b, ptr::null_mut()));
        remote_read_unlock(CpuId::new(1));

        assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn synchronize_without_readers_is_immediate() {
        let _guard = setup();
        let seq_before = stats().gp_seq;
        assert!(synchronize());
        assert_eq!(stats().gp_seq, seq_before + 1);
    }

    #[test]
    fn synchronize_times_out_under_a_stuck_reader() {
        let _guard = setup();
        remote_read_lock(CpuId::new(2));

        // Drive the tick clock from another thread so the bound can expire.
        static TICKING: AtomicBool = AtomicBool::new(true);
        TICKING.store(true, Ordering::SeqCst);
        let ticker = std::thread::spawn(|| {
            while TICKING.load(Ordering::SeqCst) {
                time::on_tick();
            }
        });

        assert!(!synchronize());
        TICKING.store(false, Ordering::SeqCst);
        ticker.join().unwrap();
        remote_read_unlock(CpuId::new(2));
        // The period was only delayed, not lost.
        assert!(synchronize());
    }

    #[test]
    fn call_before_init_reports_failure() {
        let _guard = setup();
        READY.store(false, Ordering::Release);
        assert!(!call(count_fire, ptr::null_mut()));
        assert!(!synchronize());
        init();
    }
}
