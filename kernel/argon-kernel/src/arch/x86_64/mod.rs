//! x86_64 arch layer: descriptor tables, interrupt plumbing, the Local
//! APIC, IPIs, and SMP bring-up.

pub mod gdt;
pub mod hw;
pub mod idt;
pub mod interrupts;
pub mod ipi;
pub mod smp;
pub mod syscall;

use argon_core::addr::VirtAddr;
use argon_core::cpu;
use argon_core::id::{ApicId, CpuId};
use argon_core::{kinfo, kwarn};
use argon_sched::hooks::ArchHooks;

use crate::config::{VEC_SPURIOUS, VEC_TIMER};
use crate::{fpu, rcu, tlb};

/// What the platform layer hands the core at boot: the mapped LAPIC, the
/// CPUs the interrupt-controller tables enumerate (the single topology
/// source), and the calibrated local-timer period.
pub struct PlatformInfo<'a> {
    /// Virtual base of the Local APIC MMIO window.
    pub lapic_virt: VirtAddr,
    /// Detected CPUs in firmware order (BSP included).
    pub detected_cpus: &'a [ApicId],
    /// Calibrated LAPIC timer initial count (0 = not calibrated).
    pub timer_initial: u32,
    /// LAPIC timer divide value.
    pub timer_divide: u8,
}

/// Scheduler arch services: kick IPIs, the lazy-FPU trap arm, FPU
/// ownership teardown, and idle-time RCU quiescence.
static SCHED_HOOKS: ArchHooks = ArchHooks {
    kick: ipi::kick_cpu,
    on_task_switch: fpu::on_task_switch,
    on_task_exit: fpu::on_task_exit,
    on_idle: rcu::note_quiescent_state,
};

/// Brings the multiprocessor core up on the BSP, boots every AP, and runs
/// the bring-up validation suite.
///
/// # Safety
///
/// Must be called exactly once, on the BSP, with interrupts disabled,
/// after the memory subsystem ([`crate::mm::install`]) and heap are up and
/// `platform.lapic_virt` maps the LAPIC.
pub unsafe fn init(platform: &PlatformInfo<'_>) {
    // Descriptor tables first: every later step may fault.
    interrupts::handlers::install();
    // SAFETY: 64-bit mode, interrupts disabled, tables finalized above.
    unsafe {
        gdt::load();
        idt::load();
    }

    let leaf1 = argon_core::arch::x86_64::cpuid::cpuid(1, 0);
    assert!(
        leaf1.edx & argon_core::arch::x86_64::cpuid::FEAT_EDX_APIC != 0,
        "CPU reports no local APIC"
    );

    // SAFETY: The caller guarantees the LAPIC mapping.
    unsafe { hw::local_apic::init_base(platform.lapic_virt) };
    let lapic = hw::local_apic::get().expect("LAPIC base just installed");
    let bsp_apic = lapic.id();

    // From here on the identity table can resolve the executing CPU.
    // SAFETY: The reader only touches the mapped LAPIC window.
    unsafe { cpu::set_local_apic_id_fn(hw::local_apic::current_apic_id) };

    cpu::table().register(CpuId::BSP, bsp_apic);
    cpu::table().mark_online(CpuId::BSP);
    kinfo!(
        "smp: BSP online apic={bsp_apic}, {} CPUs detected",
        platform.detected_cpus.len()
    );

    ipi::set_bsp_apic(bsp_apic);
    ipi::set_ap_timer_config(platform.timer_initial, platform.timer_divide);
    ipi::register_handlers();
    smp::selftest::register_vectors();
    // SAFETY: The sender delivers the TLB vector and is IRQ-safe.
    unsafe { tlb::set_ipi_sender(ipi::send_tlb_vector) };

    argon_sched::hooks::install(&SCHED_HOOKS);
    argon_sched::init_cpu(CpuId::BSP);
    rcu::init();

    if fpu::init_cpu(CpuId::BSP) {
        fpu::lazy_probe();
    } else {
        kwarn!("fpu: BSP init failed, lazy FPU disabled");
    }

    lapic.enable(VEC_SPURIOUS);
    if platform.timer_initial > 0 {
        lapic.start_timer_periodic(VEC_TIMER, platform.timer_initial, platform.timer_divide);
    }

    smp::start_aps(platform.detected_cpus);
    smp::selftest::run_all();

    if !smp::start_ap_timers() {
        kwarn!("smp: not every AP timer started");
    }
}
