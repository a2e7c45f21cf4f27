//! The core's surface toward the syscall layer.
//!
//! The syscall dispatch table lives outside the core; these are the
//! operations it consumes. Failures come back as [`CoreError`] values and
//! map to non-zero return codes at the syscall boundary.

use argon_core::addr::VirtAddr;
use argon_core::cpu;
use argon_core::id::{ApicId, CpuId};
use argon_sched as sched;

use crate::error::CoreError;
use crate::{rcu, tlb};

/// Identity snapshot of the calling CPU.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    /// Logical index of the calling CPU.
    pub logical: CpuId,
    /// Physical (APIC) id of the calling CPU, when registered.
    pub apic: Option<ApicId>,
    /// Number of CPUs currently online.
    pub online_count: u32,
}

/// Schedules work on the caller's CPU (subject to push-balance).
pub fn schedule(entry: sched::WorkFn, arg: *mut ()) -> Result<(), CoreError> {
    if sched::schedule(entry, arg) {
        Ok(())
    } else {
        Err(CoreError::OutOfMemory)
    }
}

/// Schedules work pinned to a specific CPU.
pub fn schedule_on(cpu: CpuId, entry: sched::WorkFn, arg: *mut ()) -> Result<(), CoreError> {
    if !cpu::table().is_online(cpu) {
        return Err(CoreError::OfflineTarget);
    }
    if sched::schedule_on(cpu, entry, arg) {
        Ok(())
    } else {
        Err(CoreError::OutOfMemory)
    }
}

/// Voluntarily gives up the CPU.
pub fn yield_now() {
    sched::yield_now();
}

/// Terminates the calling task.
pub fn exit_current_task() -> ! {
    sched::exit_current()
}

/// Returns the calling CPU's identity and the online count.
#[must_use]
pub fn current_cpu_info() -> CpuInfo {
    let logical = cpu::current_logical_index();
    CpuInfo {
        logical,
        apic: cpu::table().apic_from_logical(logical),
        online_count: cpu::table().online_count(),
    }
}

/// Run-queue depth snapshot: `(local, total)`.
#[must_use]
pub fn runqueue_depths() -> (u32, u32) {
    (sched::runqueue_depth(), sched::runqueue_depth_total())
}

/// Waits for an RCU grace period.
pub fn rcu_synchronize() -> Result<(), CoreError> {
    if rcu::synchronize() {
        Ok(())
    } else {
        Err(CoreError::Timeout)
    }
}

/// RCU engine statistics.
#[must_use]
pub fn rcu_stats() -> rcu::RcuStats {
    rcu::stats()
}

/// Invalidates one page on every online CPU.
pub fn tlb_shootdown_page(virt: VirtAddr) -> Result<(), CoreError> {
    if tlb::shootdown_page(virt) {
        Ok(())
    } else {
        Err(CoreError::Timeout)
    }
}

/// Flushes every online CPU's TLB.
pub fn tlb_shootdown_all() -> Result<(), CoreError> {
    if tlb::shootdown_all() {
        Ok(())
    } else {
        Err(CoreError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn offline_schedule_is_typed() {
        test_util::init_topology();
        fn nop(_arg: *mut ()) {}
        assert_eq!(
            schedule_on(CpuId::new(250), nop, core::ptr::null_mut()),
            Err(CoreError::OfflineTarget)
        );
    }

    #[test]
    fn cpu_info_reports_bsp_on_host() {
        test_util::init_topology();
        let info = current_cpu_info();
        assert_eq!(info.logical, CpuId::BSP);
        assert!(info.online_count >= 1);
    }
}
