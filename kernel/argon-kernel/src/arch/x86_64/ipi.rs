//! Inter-processor interrupt substrate.
//!
//! Send-to-one and send-to-all-others primitives over physical APIC ids,
//! plus the handlers for the reserved control-plane vectors. Handlers run
//! with interrupts disabled, never block, and EOI before returning.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use argon_core::cpu;
use argon_core::id::{ApicId, CpuId};
use argon_core::{kdebug, kwarn};
use argon_sched::preempt;

use crate::config;
use crate::tlb;

use super::hw::local_apic;

/// PONG replies observed by the BSP (process-wide).
static PONG_TOTAL: AtomicU64 = AtomicU64::new(0);

/// The BSP's APIC id, recorded during init so PING handlers know where to
/// reply.
static BSP_APIC: AtomicU32 = AtomicU32::new(0);

/// Local-timer configuration the BSP calibrated; APs start their timers
/// from these values when the TIMER_INIT IPI arrives. Zero initial count
/// means "not calibrated" and fails the start.
static AP_TIMER_INITIAL: AtomicU32 = AtomicU32::new(0);
static AP_TIMER_DIVIDE: AtomicU32 = AtomicU32::new(16);

/// Records the BSP's APIC id for PONG routing.
pub fn set_bsp_apic(apic: ApicId) {
    BSP_APIC.store(apic.as_u32(), Ordering::Release);
}

/// Publishes the calibrated local-timer period for AP timer starts.
pub fn set_ap_timer_config(initial_count: u32, divide: u8) {
    AP_TIMER_DIVIDE.store(u32::from(divide), Ordering::Relaxed);
    AP_TIMER_INITIAL.store(initial_count, Ordering::Release);
}

/// Returns the total PONG replies received.
#[must_use]
pub fn pong_total() -> u64 {
    PONG_TOTAL.load(Ordering::Relaxed)
}

/// Returns whether the local controller is up and IPIs can be sent.
#[must_use]
pub fn ready() -> bool {
    local_apic::get().is_some()
}

/// Signals end-of-interrupt on the local controller.
pub fn eoi() {
    if let Some(lapic) = local_apic::get() {
        lapic.eoi();
    }
}

/// Sends `vector` to the CPU owning `apic`.
///
/// Returns `false` if the controller is not enabled, the target is not
/// online, or the hardware send could not be serialized within the
/// bounded spin.
pub fn send_to(apic: ApicId, vector: u8) -> bool {
    let Some(lapic) = local_apic::get() else {
        return false;
    };
    if !cpu::table().is_apic_online(apic) {
        return false;
    }
    lapic.send_ipi(apic, vector)
}

/// Sends `vector` to every online CPU except the caller.
///
/// Vacuously `true` with no online peers.
pub fn send_to_all_others(vector: u8) -> bool {
    let Some(lapic) = local_apic::get() else {
        return false;
    };
    let this_apic = lapic.id();

    let mut ok = true;
    for online in cpu::table().online_cpus() {
        let Some(apic) = cpu::table().apic_from_logical(online) else {
            continue;
        };
        if apic == this_apic {
            continue;
        }
        if !lapic.send_ipi(apic, vector) {
            ok = false;
        }
    }
    ok
}

/// Scheduler-kick sender, installed as the scheduler's `kick` hook.
pub fn kick_cpu(target: CpuId) -> bool {
    match cpu::table().apic_from_logical(target) {
        Some(apic) => send_to(apic, config::VEC_SCHED_KICK),
        None => false,
    }
}

/// TLB-vector sender, installed into the shootdown engine.
pub fn send_tlb_vector(apic: ApicId) -> bool {
    send_to(apic, config::VEC_TLB)
}

// ── Reserved-vector handlers ─────────────────────────────────────────────

/// PING: count, reply PONG to the BSP, EOI.
fn ping_handler(_vector: u8) {
    let this_apic = local_apic::current_apic_id();
    let rec = cpu::table().record_for_apic(this_apic);
    if let Some(rec) = rec {
        rec.ping_count.fetch_add(1, Ordering::Relaxed);
    }

    let bsp = ApicId::new(BSP_APIC.load(Ordering::Acquire));
    if send_to(bsp, config::VEC_PONG) {
        if let Some(rec) = rec {
            rec.pong_sent_count.fetch_add(1, Ordering::Relaxed);
        }
    } else {
        kdebug!("ipi: PONG send failed from apic {this_apic}");
    }

    eoi();
}

/// PONG: count the reply, EOI.
fn pong_handler(_vector: u8) {
    PONG_TOTAL.fetch_add(1, Ordering::Relaxed);
    eoi();
}

/// Scheduler kick: count, flag a reschedule, EOI. The actual reschedule
/// happens in the dispatch epilogue on the way out of the interrupt.
fn sched_kick_handler(_vector: u8) {
    if let Some(rec) = cpu::table().record(cpu::current_logical_index()) {
        rec.sched_kick_count.fetch_add(1, Ordering::Relaxed);
    }
    preempt::set_need_resched();
    eoi();
}

/// TLB shootdown: apply the pending request, acknowledge, EOI.
fn tlb_handler(_vector: u8) {
    tlb::handle_shootdown_ipi();
    eoi();
}

/// Deferred AP timer start: arm the local timer from the BSP-calibrated
/// values, count success or failure, EOI.
fn timer_init_handler(_vector: u8) {
    let rec = cpu::table().record_for_apic(local_apic::current_apic_id());
    let initial = AP_TIMER_INITIAL.load(Ordering::Acquire);
    let divide = AP_TIMER_DIVIDE.load(Ordering::Relaxed) as u8;

    let started = match local_apic::get() {
        Some(lapic) if initial > 0 => {
            lapic.start_timer_periodic(config::VEC_TIMER, initial, divide);
            true
        }
        _ => false,
    };

    if let Some(rec) = rec {
        if started {
            rec.timer_start_count.fetch_add(1, Ordering::Relaxed);
        } else {
            rec.timer_start_fail_count.fetch_add(1, Ordering::Relaxed);
            kwarn!(
                "ipi: AP timer init failed on apic {}",
                local_apic::current_apic_id()
            );
        }
    }

    eoi();
}

/// Binds the reserved control-plane vectors. BSP-only, once.
pub(super) fn register_handlers() {
    use super::interrupts::dispatch::register_vector;

    register_vector(config::VEC_PING, ping_handler).expect("PING vector taken");
    register_vector(config::VEC_PONG, pong_handler).expect("PONG vector taken");
    register_vector(config::VEC_SCHED_KICK, sched_kick_handler).expect("kick vector taken");
    register_vector(config::VEC_TLB, tlb_handler).expect("TLB vector taken");
    register_vector(config::VEC_TIMER_INIT, timer_init_handler).expect("timer-init vector taken");
}
