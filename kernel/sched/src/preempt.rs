//! Preemption bookkeeping.
//!
//! A nestable per-CPU preempt-disable depth and a per-CPU resched flag.
//! While the depth is non-zero, tick-driven preemption is inhibited on the
//! calling CPU; the RCU engine also reads the depth as part of its
//! quiescence predicate.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use argon_core::cpu::{self, MAX_CPUS};
use argon_core::cpu_local::CpuLocal;
use argon_core::id::CpuId;

static PREEMPT_DEPTH: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

static NEED_RESCHED: CpuLocal<AtomicBool> =
    CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);

/// Increments the calling CPU's preempt-disable depth.
#[inline]
pub fn disable() {
    PREEMPT_DEPTH.get().fetch_add(1, Ordering::AcqRel);
}

/// Decrements the calling CPU's preempt-disable depth.
///
/// # Panics
///
/// In debug builds, on underflow (an unmatched enable).
#[inline]
pub fn enable() {
    let prev = PREEMPT_DEPTH.get().fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev != 0, "preempt_enable without matching disable");
}

/// Returns the calling CPU's preempt-disable depth.
#[inline]
#[must_use]
pub fn depth() -> u32 {
    PREEMPT_DEPTH.get().load(Ordering::Acquire)
}

/// Returns a specific CPU's preempt-disable depth.
///
/// Remote snapshot; used by the RCU engine's quiescence scan.
#[inline]
#[must_use]
pub fn depth_of(cpu: CpuId) -> u32 {
    PREEMPT_DEPTH.get_for(cpu).load(Ordering::Acquire)
}

/// Flags the calling CPU for rescheduling at the next preemption point.
#[inline]
pub fn set_need_resched() {
    NEED_RESCHED.get().store(true, Ordering::Release);
}

/// Consumes the calling CPU's resched flag, returning whether it was set.
#[inline]
pub fn take_need_resched() -> bool {
    NEED_RESCHED.get().swap(false, Ordering::AcqRel)
}

/// Clears all local preemption state. Called from per-CPU scheduler init.
pub(crate) fn reset(cpu: CpuId) {
    PREEMPT_DEPTH.get_for(cpu).store(0, Ordering::Release);
    NEED_RESCHED.get_for(cpu).store(false, Ordering::Release);
}

/// Returns `true` if the calling CPU is currently preemptible.
#[inline]
#[must_use]
pub fn preemptible() -> bool {
    depth() == 0
}

// Re-exported here so preempt state and the current-CPU resolution stay in
// one place for callers.
pub use cpu::current_logical_index;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_enable_roundtrip() {
        let before = depth();
        disable();
        disable();
        assert_eq!(depth(), before + 2);
        enable();
        enable();
        assert_eq!(depth(), before);
    }

    #[test]
    fn resched_flag_is_consumed_once() {
        set_need_resched();
        assert!(take_need_resched());
        assert!(!take_need_resched());
    }
}
