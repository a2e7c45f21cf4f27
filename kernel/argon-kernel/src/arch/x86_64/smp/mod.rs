//! SMP bring-up: INIT-SIPI-SIPI, the AP entry path, and AP timer start.
//!
//! The BSP walks the detected CPU list in order. For each AP it publishes
//! the handoff record, fires the standard INIT-SIPI-SIPI sequence at the
//! trampoline page, and polls `ready && online` with a bounded budget; a
//! timed-out AP is logged and skipped, never marked online.

pub mod handoff;
pub mod selftest;
mod trampoline;

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;

use argon_core::arch::x86_64::instructions::interrupts;
use argon_core::arch::x86_64::registers::control::Cr3;
use argon_core::arch::x86_64::registers::model_specific::{EferFlags, IA32_EFER};
use argon_core::cpu::{self, MAX_CPUS};
use argon_core::id::{ApicId, CpuId};
use argon_core::{kdebug, kinfo, kwarn};

use crate::config::{
    AP_READY_TIMEOUT_LOOPS, INIT_DELAY_LOOPS, KERNEL_STACK_SIZE, SIPI_DELAY_LOOPS,
    TIMER_INIT_TIMEOUT_LOOPS, TRAMPOLINE_VECTOR, VEC_TIMER_INIT,
};
use crate::fpu;

use super::hw::local_apic;
use super::{ipi, syscall};

/// Statically reserved AP kernel stacks, one per logical slot.
#[repr(align(16))]
struct ApStacks(UnsafeCell<[[u8; KERNEL_STACK_SIZE]; MAX_CPUS]>);

// SAFETY: Each stack slot is handed to exactly one AP, which is its sole
// user from then on.
unsafe impl Sync for ApStacks {}

static AP_STACKS: ApStacks = ApStacks(UnsafeCell::new([[0; KERNEL_STACK_SIZE]; MAX_CPUS]));

/// Returns the 16-byte-aligned stack top for a logical slot.
fn ap_stack_top(index: CpuId) -> u64 {
    // SAFETY: Address arithmetic only; the slot is not dereferenced here.
    let base = unsafe { (*AP_STACKS.0.get())[index.as_usize()].as_ptr() };
    (base as u64 + KERNEL_STACK_SIZE as u64) & !0xF
}

fn delay(loops: u32) {
    for _ in 0..loops {
        core::hint::spin_loop();
    }
}

/// Polls `ready && online` for one AP with a bounded budget.
fn wait_ap_ready(apic: ApicId) -> bool {
    for _ in 0..AP_READY_TIMEOUT_LOOPS {
        if handoff::is_ready() && cpu::table().is_apic_online(apic) {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}

/// Boots every detected non-BSP CPU, in detection order.
///
/// Logical indices are assigned densely starting at 1 (the BSP is 0).
/// Failures are per-AP and fail-soft: the machine continues with whatever
/// came online.
pub fn start_aps(detected: &[ApicId]) {
    if detected.len() <= 1 {
        kinfo!("smp: single-processor system, no APs to boot");
        return;
    }
    if !ipi::ready() {
        kwarn!("smp: local APIC not enabled, skipping AP bring-up");
        return;
    }
    if !trampoline::prepare() {
        return;
    }

    let lapic = local_apic::get().expect("ipi::ready implies a mapped LAPIC");
    let bsp_apic = lapic.id();
    let cr3 = Cr3::read();
    assert!(
        cr3.as_u64() < u32::MAX as u64,
        "kernel page-table root above 4 GiB, unreachable from the trampoline"
    );

    let mut next_index = 1u32;
    for &apic in detected {
        if apic == bsp_apic {
            continue;
        }
        let index = CpuId::new(next_index);
        next_index += 1;
        kdebug!("smp: startup begin apic={apic} cpu={index}");

        let stack_top = ap_stack_top(index);
        cpu::table().register(index, apic);
        cpu::table()
            .set_kernel_stack_top(index, argon_core::addr::VirtAddr::new_truncate(stack_top));

        // SAFETY: The trampoline page is mapped and no other AP is between
        // SIPI and ready (the loop below serializes on each one).
        unsafe {
            handoff::publish(&handoff::HandoffParams {
                page_table_root: cr3.as_u64(),
                stack_top,
                entry64: ap_entry as usize as u64,
                apic_id: apic,
                cpu_index: index,
            });
        }

        // The standard INIT-SIPI-SIPI dance.
        if !lapic.send_init(apic) {
            kwarn!("smp: INIT IPI failed apic={apic} cpu={index}");
            continue;
        }
        delay(INIT_DELAY_LOOPS);
        let mut sipi_ok = lapic.send_sipi(apic, TRAMPOLINE_VECTOR);
        delay(SIPI_DELAY_LOOPS);
        sipi_ok &= lapic.send_sipi(apic, TRAMPOLINE_VECTOR);
        delay(SIPI_DELAY_LOOPS);
        if !sipi_ok {
            kwarn!("smp: STARTUP IPI failed apic={apic} cpu={index}");
            continue;
        }

        if !wait_ap_ready(apic) {
            kwarn!("smp: AP ready timeout apic={apic} cpu={index}");
            continue;
        }
    }

    kinfo!("smp: {} CPUs online", cpu::table().online_count());
}

/// The 64-bit AP entry point; the trampoline jumps here with the handoff
/// physical address in the first argument register.
extern "C" fn ap_entry(handoff_phys: u64) -> ! {
    interrupts::disable();

    // SAFETY: The shared GDT/IDT were built and finalized by the BSP.
    unsafe {
        super::gdt::load();
        super::idt::load();
    }

    // NX for this CPU (paging flags in the shared tables rely on it).
    // SAFETY: Long mode is active; setting NXE is always legal there.
    unsafe { IA32_EFER.write(IA32_EFER.read() | EferFlags::NO_EXECUTE_ENABLE.bits()) };

    // SAFETY: The BSP published the record before starting this AP.
    let (index, handoff_apic, stack_top) = unsafe { handoff::read(handoff_phys) };
    kdebug!("smp: ap_entry apic={handoff_apic} cpu={index} stack={stack_top:#x}");

    // Fail-soft: an AP without a working FPU parks instead of running
    // tasks that would fault.
    if !fpu::init_cpu(index) {
        argon_sched::idle_loop();
    }
    fpu::lazy_probe();

    if let Some(lapic) = local_apic::get() {
        lapic.enable(crate::config::VEC_SPURIOUS);
        // Clear any interrupt condition left over from startup.
        lapic.eoi();
    }

    argon_sched::init_cpu(index);
    // SAFETY: GDT selectors match the STAR layout; called once per CPU.
    unsafe { syscall::init() };

    // The local controller's own id is authoritative; a mismatch against
    // the firmware-detected id is a fatal table inconsistency.
    let apic = local_apic::current_apic_id();
    cpu::table().register(index, apic);
    cpu::table().mark_online(index);

    // SAFETY: Called exactly once, after mark_online, per the protocol.
    unsafe { handoff::signal_ready() };

    // SAFETY: IDT and LAPIC are configured above.
    unsafe { interrupts::enable() };

    kinfo!("smp: AP online apic={apic} cpu={index}");
    argon_sched::idle_loop()
}

/// Starts each online AP's local timer via the TIMER_INIT IPI and waits
/// (bounded) for every acknowledgement through the per-CPU start counters.
///
/// Returns `true` iff every AP acknowledged a successful start.
pub fn start_ap_timers() -> bool {
    let table = cpu::table();
    if !ipi::ready() || table.online_count() <= 1 {
        return table.online_count() <= 1;
    }

    let bsp = CpuId::BSP;
    let mut all_ok = true;

    for target in table.online_cpus() {
        if target == bsp {
            continue;
        }
        let Some(rec) = table.record(target) else {
            continue;
        };
        let Some(apic) = table.apic_from_logical(target) else {
            continue;
        };

        let ok_before = rec.timer_start_count.load(Ordering::Relaxed);
        let fail_before = rec.timer_start_fail_count.load(Ordering::Relaxed);

        if !ipi::send_to(apic, VEC_TIMER_INIT) {
            kwarn!("smp: timer-init IPI send failed apic={apic} cpu={target}");
            all_ok = false;
            continue;
        }

        let mut acked = false;
        let mut started = false;
        for _ in 0..TIMER_INIT_TIMEOUT_LOOPS {
            if rec.timer_start_count.load(Ordering::Acquire) > ok_before {
                acked = true;
                started = true;
                break;
            }
            if rec.timer_start_fail_count.load(Ordering::Acquire) > fail_before {
                acked = true;
                break;
            }
            core::hint::spin_loop();
        }

        if !acked {
            kwarn!("smp: timer-init ack timeout apic={apic} cpu={target}");
            all_ok = false;
        } else if started {
            kdebug!("smp: AP timer active apic={apic} cpu={target}");
        } else {
            kwarn!("smp: AP timer start failed apic={apic} cpu={target}");
            all_ok = false;
        }
    }

    all_ok
}
