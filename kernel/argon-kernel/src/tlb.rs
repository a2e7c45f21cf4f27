//! TLB shootdown engine.
//!
//! One shootdown is in flight at a time, serialized by a spinlock taken
//! with IRQs saved. The initiating CPU flushes locally first, publishes a
//! generation-numbered request, IPIs every other online CPU, and
//! spin-waits (pause-backoff, bounded) until each target's acknowledged
//! generation catches up. Targets process the request in interrupt
//! context: flush, count, release-store the acknowledgement.
//!
//! The request fields live outside the lock as atomics because targets
//! read them while the initiator still holds the lock.

use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};

use argon_core::addr::VirtAddr;
use argon_core::arch::x86_64::instructions::tlb as tlb_ops;
use argon_core::cpu::{self, MAX_CPUS};
use argon_core::id::{ApicId, CpuId};
use argon_core::kwarn;
use argon_core::sync::IrqSpinLock;
use planck_noalloc::vec::ArrayVec;

use crate::config::TLB_ACK_TIMEOUT_LOOPS;

/// What a pending shootdown request asks targets to invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlushKind {
    /// No request pending.
    None = 0,
    /// Invalidate a single page.
    Page = 1,
    /// Reload the root (full flush).
    All = 2,
}

impl FlushKind {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Page,
            2 => Self::All,
            _ => Self::None,
        }
    }
}

/// Serializes shootdowns; only one request is in flight at any time.
static SHOOTDOWN_LOCK: IrqSpinLock<()> = IrqSpinLock::new(());

/// Monotone request generation. Incremented under the lock with
/// acquire-release semantics: the increment happens-before targets observe
/// the new `(kind, virt)` pair.
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Page-aligned target address (0 for full flushes).
static TARGET_VIRT: AtomicU64 = AtomicU64::new(0);

/// Pending request kind, `FlushKind::None` between shootdowns.
static KIND: AtomicU8 = AtomicU8::new(FlushKind::None as u8);

fn no_sender(_apic: ApicId) -> bool {
    false
}

/// Sender for the TLB-shootdown IPI, installed by the arch layer (and by
/// host tests with a loopback simulator). The default refuses delivery,
/// which degrades to forward-acknowledged best-effort completion.
static SEND_FN: AtomicPtr<()> = AtomicPtr::new(no_sender as *mut ());

/// Installs the shootdown IPI sender.
///
/// # Safety
///
/// `f` must deliver the TLB vector to the given APIC id and be callable
/// with interrupts disabled.
pub unsafe fn set_ipi_sender(f: fn(ApicId) -> bool) {
    SEND_FN.store(f as *mut (), Ordering::Release);
}

fn send_ipi(apic: ApicId) -> bool {
    let ptr = SEND_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(ApicId) -> bool` pointers are ever stored.
    let f: fn(ApicId) -> bool = unsafe { core::mem::transmute(ptr) };
    f(apic)
}

/// Invalidates `virt`'s page everywhere.
///
/// The local TLB entry is flushed synchronously before the broadcast; the
/// caller's CPU is never IPI'd. Returns `true` iff every other online CPU
/// acknowledged within the bounded wait (best-effort on `false`: the IPI
/// stays pending on stragglers, so the hardware still converges).
pub fn shootdown_page(virt: VirtAddr) -> bool {
    tlb_ops::flush(virt);
    issue(FlushKind::Page, virt.page_base())
}

/// Flushes every CPU's entire TLB (root reload).
pub fn shootdown_all() -> bool {
    tlb_ops::flush_all();
    issue(FlushKind::All, VirtAddr::zero())
}

fn issue(kind: FlushKind, virt: VirtAddr) -> bool {
    let table = cpu::table();
    if table.online_count() <= 1 {
        return true;
    }

    let this = cpu::current_logical_index();
    let mut targets: ArrayVec<CpuId, MAX_CPUS> = ArrayVec::new();
    for online in table.online_cpus() {
        if online != this {
            targets.push(online);
        }
    }
    if targets.len() == 0 {
        return true;
    }

    let mut ok = true;
    let _guard = SHOOTDOWN_LOCK.lock();

    let generation = GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
    TARGET_VIRT.store(virt.as_u64(), Ordering::Relaxed);
    KIND.store(kind as u8, Ordering::Release);

    // Arm every target's acknowledgement slot one generation back so the
    // wait below cannot be satisfied by a stale value.
    for &target in targets.iter() {
        if let Some(rec) = table.record(target) {
            rec.tlb_ack_generation
                .store(generation - 1, Ordering::Relaxed);
        }
    }

    for &target in targets.iter() {
        let Some(apic) = table.apic_from_logical(target) else {
            continue;
        };
        if !send_ipi(apic) {
            kwarn!("tlb: shootdown IPI send failed cpu={target} apic={apic}");
            // The target never sees the request; acknowledge on its behalf
            // so the wait terminates. Report the miss to the caller.
            if let Some(rec) = table.record(target) {
                rec.tlb_ack_generation.store(generation, Ordering::Relaxed);
            }
            ok = false;
        }
    }

    for &target in targets.iter() {
        let Some(rec) = table.record(target) else {
            continue;
        };
        let mut acked = false;
        for _ in 0..TLB_ACK_TIMEOUT_LOOPS {
            if rec.tlb_ack_generation.load(Ordering::Acquire) >= generation {
                acked = true;
                break;
            }
            core::hint::spin_loop();
        }
        if !acked {
            kwarn!("tlb: shootdown ack timeout cpu={target} gen={generation}");
            ok = false;
        }
    }

    KIND.store(FlushKind::None as u8, Ordering::Release);
    ok
}

/// Applies the pending request on behalf of `cpu` and acknowledges it.
///
/// Factored out of the interrupt handler so host tests can stand in for
/// remote CPUs.
pub(crate) fn apply_request_on(cpu: CpuId) {
    let virt = TARGET_VIRT.load(Ordering::Relaxed);
    let kind = FlushKind::from_u8(KIND.load(Ordering::Acquire));
    let generation = GENERATION.load(Ordering::Relaxed);

    match kind {
        FlushKind::Page => tlb_ops::flush(VirtAddr::new_truncate(virt)),
        FlushKind::All => tlb_ops::flush_all(),
        FlushKind::None => {}
    }

    if let Some(rec) = cpu::table().record(cpu) {
        rec.tlb_ipi_count.fetch_add(1, Ordering::Relaxed);
        rec.tlb_ack_generation.store(generation, Ordering::Release);
    }
}

/// TLB-shootdown IPI handler body: apply and acknowledge on the executing
/// CPU. The arch dispatch layer issues the EOI.
pub fn handle_shootdown_ipi() {
    apply_request_on(cpu::current_logical_index());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;
    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn setup() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        test_util::init_topology();
        guard
    }

    /// Loopback sender: handles the request synchronously as the target
    /// CPU would in its interrupt handler.
    fn loopback(apic: ApicId) -> bool {
        let cpu = cpu::table().logical_from_apic(apic).unwrap();
        apply_request_on(cpu);
        true
    }

    fn refuse(_apic: ApicId) -> bool {
        false
    }

    fn ack_of(cpu: u32) -> u64 {
        cpu::table()
            .record(CpuId::new(cpu))
            .unwrap()
            .tlb_ack_generation
            .load(Ordering::Acquire)
    }

    fn ipi_count_of(cpu: u32) -> u64 {
        cpu::table()
            .record(CpuId::new(cpu))
            .unwrap()
            .tlb_ipi_count
            .load(Ordering::Relaxed)
    }

    #[test]
    fn page_shootdown_reaches_every_other_cpu() {
        let _guard = setup();
        // SAFETY: Loopback runs entirely in this test's thread.
        unsafe { set_ipi_sender(loopback) };

        let before: Vec<u64> = (1..4).map(ipi_count_of).collect();
        let gen_before = GENERATION.load(Ordering::Acquire);

        assert!(shootdown_page(VirtAddr::new(0xFFFF_8000_0001_2345)));

        let generation = GENERATION.load(Ordering::Acquire);
        assert_eq!(generation, gen_before + 1);
        for (i, cpu) in (1..4u32).enumerate() {
            assert_eq!(ipi_count_of(cpu), before[i] + 1, "cpu {cpu} missed the IPI");
            assert!(ack_of(cpu) >= generation);
        }
        // The request slot is quiet again.
        assert_eq!(FlushKind::from_u8(KIND.load(Ordering::Acquire)), FlushKind::None);
    }

    #[test]
    fn full_shootdown_acknowledges_and_completes() {
        let _guard = setup();
        // SAFETY: Loopback runs entirely in this test's thread.
        unsafe { set_ipi_sender(loopback) };
        assert!(shootdown_all());
    }

    #[test]
    fn failed_send_forward_acks_and_reports_false() {
        let _guard = setup();
        // SAFETY: The refusing sender has no side effects.
        unsafe { set_ipi_sender(refuse) };

        let counts_before: Vec<u64> = (1..4).map(ipi_count_of).collect();
        // Must terminate (forward-ack) and report the miss.
        assert!(!shootdown_page(VirtAddr::new(0x1000)));

        let generation = GENERATION.load(Ordering::Acquire);
        for (i, cpu) in (1..4u32).enumerate() {
            // No target processed anything, but every slot was forwarded.
            assert_eq!(ipi_count_of(cpu), counts_before[i]);
            assert_eq!(ack_of(cpu), generation);
        }
        // Restore a working transport for later tests.
        // SAFETY: Loopback runs entirely in this test's thread.
        unsafe { set_ipi_sender(loopback) };
    }

}
