//! Boot-time SMP validation suite.
//!
//! Runs on the BSP right after AP bring-up, before the machine takes real
//! work: PING/PONG link validation, a cross-CPU counter stress, scheduler
//! affinity and balance stresses, the blocked-CPU pathological case, a
//! YMM save/restore stress, and TLB shootdown validation. Every phase is
//! fail-soft: a failure is logged and the kernel continues, marked "not
//! fully validated".

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use planck_noalloc::vec::ArrayVec;

use argon_core::addr::VirtAddr;
use argon_core::arch::x86_64::instructions::interrupts;
use argon_core::cpu::{self, MAX_CPUS};
use argon_core::cpu_local::CpuLocal;
use argon_core::id::{ApicId, CpuId};
use argon_core::sync::IrqSpinLock;
use argon_core::{kdebug, kinfo, kwarn};
use argon_sched as sched;

use crate::arch::x86_64::interrupts::dispatch;
use crate::arch::x86_64::ipi;
use crate::{config, fpu, tlb};

/// `(logical, apic)` pairs of every online CPU, BSP included.
type Targets = ArrayVec<(CpuId, ApicId), MAX_CPUS>;

fn online_targets(include_bsp: bool) -> Targets {
    let table = cpu::table();
    let mut targets = Targets::new();
    for online in table.online_cpus() {
        if !include_bsp && online == CpuId::BSP {
            continue;
        }
        if let Some(apic) = table.apic_from_logical(online) {
            targets.push((online, apic));
        }
    }
    targets
}

/// Runs `f` with interrupts enabled, restoring the previous state. The
/// BSP's wait loops need open interrupts to receive replies.
fn with_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_disabled = !interrupts::are_enabled();
    if was_disabled {
        // SAFETY: The IDT and LAPIC are configured before any self test.
        unsafe { interrupts::enable() };
    }
    let result = f();
    if was_disabled {
        interrupts::disable();
    }
    result
}

/// Runs every enabled phase. Called once from arch init.
pub fn run_all() {
    if config::SELFTEST_IPI_LINK && !validate_ipi_link() {
        kwarn!("selftest: IPI validation failed on one or more APs");
    }
    if config::SELFTEST_COUNTER && !counter_stress() {
        kwarn!("selftest: counter stress reported failures");
    }
    if config::SELFTEST_SCHED && !sched_affinity_stress() {
        kwarn!("selftest: scheduler affinity stress reported failures");
    }
    if config::SELFTEST_BALANCE && !balance_tests() {
        kwarn!("selftest: scheduler balance tests reported failures");
    }
    if config::SELFTEST_PATHOLOGICAL && !pathological_test() {
        kwarn!("selftest: blocked-CPU test reported failures");
    }
    if config::SELFTEST_YMM && !ymm_stress() {
        kwarn!("selftest: YMM stress reported failures");
    }
    if config::SELFTEST_TLB && !validate_tlb_shootdown() {
        kwarn!("selftest: TLB shootdown validation failed");
    }
}

// ── PING/PONG link validation ────────────────────────────────────────────

fn validate_ipi_link() -> bool {
    let targets = online_targets(false);
    if targets.len() == 0 {
        return true;
    }

    with_interrupts(|| {
        let mut ok = true;
        for &(index, apic) in targets.iter() {
            let Some(rec) = cpu::table().record(index) else {
                continue;
            };
            let ping_before = rec.ping_count.load(Ordering::Relaxed);
            let pong_before = rec.pong_sent_count.load(Ordering::Relaxed);
            let pong_irq_before = ipi::pong_total();

            if !ipi::send_to(apic, config::VEC_PING) {
                kwarn!("selftest: PING send failed apic={apic} cpu={index}");
                ok = false;
                continue;
            }

            let mut replied = false;
            for _ in 0..config::IPI_PONG_TIMEOUT_LOOPS {
                if rec.ping_count.load(Ordering::Relaxed) > ping_before
                    && rec.pong_sent_count.load(Ordering::Relaxed) > pong_before
                    && ipi::pong_total() > pong_irq_before
                {
                    replied = true;
                    break;
                }
                core::hint::spin_loop();
            }

            if replied {
                kdebug!(
                    "selftest: PING/PONG ok apic={apic} cpu={index} ping={} pong={}",
                    rec.ping_count.load(Ordering::Relaxed),
                    rec.pong_sent_count.load(Ordering::Relaxed),
                );
            } else {
                kwarn!(
                    "selftest: PING/PONG timeout apic={apic} cpu={index} pong_irq={}",
                    ipi::pong_total(),
                );
                ok = false;
            }
        }
        ok
    })
}

// ── Counter stress ───────────────────────────────────────────────────────

static COUNTER_LOCK: IrqSpinLock<()> = IrqSpinLock::new(());
static COUNTER_VALUE: AtomicU32 = AtomicU32::new(0);
static COUNTER_WORK: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
static COUNTER_DONE: CpuLocal<AtomicBool> =
    CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);

/// Counter-stress IPI handler: run this CPU's share of increments under
/// the shared lock, mark done, EOI.
fn counter_vector_handler(_vector: u8) {
    let this = cpu::current_logical_index();
    let work = COUNTER_WORK.get_for(this).load(Ordering::Acquire);

    for _ in 0..work {
        let _guard = COUNTER_LOCK.lock();
        COUNTER_VALUE.fetch_add(1, Ordering::Relaxed);
    }

    COUNTER_DONE.get_for(this).store(true, Ordering::Release);
    ipi::eoi();
}

/// Binds the counter-stress vector. Called once from arch init.
pub(in crate::arch) fn register_vectors() {
    dispatch::register_vector(config::VEC_COUNTER, counter_vector_handler)
        .expect("counter vector taken");
}

/// Distributes `COUNTER_STRESS_TARGET` increments across the APs (via the
/// counter IPI) plus the BSP's own share, then checks the exact total.
fn counter_stress() -> bool {
    let targets = online_targets(false);

    for (_, work) in COUNTER_WORK.iter() {
        work.store(0, Ordering::Relaxed);
    }
    for (_, done) in COUNTER_DONE.iter() {
        done.store(false, Ordering::Relaxed);
    }
    COUNTER_VALUE.store(0, Ordering::Relaxed);

    let participants = targets.len() as u32 + 1;
    let base = config::COUNTER_STRESS_TARGET / participants;
    let mut remainder = config::COUNTER_STRESS_TARGET % participants;

    let bsp_work = base + u32::from(remainder > 0);
    remainder = remainder.saturating_sub(1);
    for &(index, _) in targets.iter() {
        let work = base + u32::from(remainder > 0);
        remainder = remainder.saturating_sub(1);
        COUNTER_WORK.get_for(index).store(work, Ordering::Release);
    }

    let ok = with_interrupts(|| {
        let mut ok = true;
        for &(index, apic) in targets.iter() {
            if !ipi::send_to(apic, config::VEC_COUNTER) {
                kwarn!("selftest: counter IPI send failed apic={apic} cpu={index}");
                ok = false;
            }
        }

        for _ in 0..bsp_work {
            let _guard = COUNTER_LOCK.lock();
            COUNTER_VALUE.fetch_add(1, Ordering::Relaxed);
        }

        for &(index, apic) in targets.iter() {
            let mut done = false;
            for _ in 0..config::COUNTER_STRESS_TIMEOUT_LOOPS {
                if COUNTER_DONE.get_for(index).load(Ordering::Acquire) {
                    done = true;
                    break;
                }
                core::hint::spin_loop();
            }
            if !done {
                kwarn!("selftest: counter timeout cpu={index} apic={apic}");
                ok = false;
            }
        }
        ok
    });

    let final_value = COUNTER_VALUE.load(Ordering::Relaxed);
    if final_value != config::COUNTER_STRESS_TARGET {
        kwarn!(
            "selftest: counter FAILED got={final_value} expected={} (targets={} bsp_work={bsp_work})",
            config::COUNTER_STRESS_TARGET,
            targets.len(),
        );
        return false;
    }

    kinfo!(
        "selftest: counter ok final={final_value} targets={} bsp_work={bsp_work}",
        targets.len(),
    );
    ok
}

// ── Scheduler stresses ───────────────────────────────────────────────────

/// One preallocated self-test job slot.
struct SchedJob {
    work: AtomicU32,
    expected_cpu: AtomicU32,
}

static SCHED_JOBS: [SchedJob; config::SCHED_MAX_JOBS] = {
    const JOB: SchedJob = SchedJob {
        work: AtomicU32::new(0),
        expected_cpu: AtomicU32::new(u32::MAX),
    };
    [JOB; config::SCHED_MAX_JOBS]
};

static SCHED_LOCK: IrqSpinLock<()> = IrqSpinLock::new(());
static SCHED_COUNTER: AtomicU32 = AtomicU32::new(0);
static SCHED_JOBS_DONE: AtomicU32 = AtomicU32::new(0);
static SCHED_EXEC: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
static MIGRATION_ERRORS: AtomicU32 = AtomicU32::new(0);
static FIRST_EXPECTED: AtomicU32 = AtomicU32::new(u32::MAX);
static FIRST_GOT: AtomicU32 = AtomicU32::new(u32::MAX);

fn reset_sched_state() {
    SCHED_COUNTER.store(0, Ordering::Relaxed);
    SCHED_JOBS_DONE.store(0, Ordering::Relaxed);
    MIGRATION_ERRORS.store(0, Ordering::Relaxed);
    FIRST_EXPECTED.store(u32::MAX, Ordering::Relaxed);
    FIRST_GOT.store(u32::MAX, Ordering::Relaxed);
    for (_, exec) in SCHED_EXEC.iter() {
        exec.store(0, Ordering::Relaxed);
    }
    for job in &SCHED_JOBS {
        job.work.store(0, Ordering::Relaxed);
        job.expected_cpu.store(u32::MAX, Ordering::Relaxed);
    }
}

fn grind(work: u32) {
    for _ in 0..work {
        let _guard = SCHED_LOCK.lock();
        SCHED_COUNTER.fetch_add(1, Ordering::Relaxed);
    }
}

/// Affinity-checking job body: records where it ran, flags a migration if
/// that differs from the pin, grinds its share.
fn sched_counter_job(arg: *mut ()) {
    let job: &SchedJob =
        // SAFETY: Self-test jobs always receive a pointer into SCHED_JOBS.
        unsafe { &*arg.cast::<SchedJob>() };
    let got = cpu::current_logical_index();
    let expected = job.expected_cpu.load(Ordering::Acquire);

    SCHED_EXEC.get_for(got).fetch_add(1, Ordering::Relaxed);
    if got.as_u32() != expected {
        if MIGRATION_ERRORS.fetch_add(1, Ordering::Relaxed) == 0 {
            FIRST_EXPECTED.store(expected, Ordering::Relaxed);
            FIRST_GOT.store(got.as_u32(), Ordering::Relaxed);
        }
    }

    grind(job.work.load(Ordering::Relaxed));
    SCHED_JOBS_DONE.fetch_add(1, Ordering::Release);
}

/// Unpinned job body for the balance phases.
fn sched_balance_job(arg: *mut ()) {
    let job: &SchedJob =
        // SAFETY: Self-test jobs always receive a pointer into SCHED_JOBS.
        unsafe { &*arg.cast::<SchedJob>() };
    SCHED_EXEC
        .get_for(cpu::current_logical_index())
        .fetch_add(1, Ordering::Relaxed);
    grind(job.work.load(Ordering::Relaxed));
    SCHED_JOBS_DONE.fetch_add(1, Ordering::Release);
}

fn split_work(job_count: u32) -> u32 {
    let job_count = job_count
        .min(config::SCHED_STRESS_TARGET)
        .min(config::SCHED_MAX_JOBS as u32);
    job_count.max(1)
}

/// Pins jobs round-robin across every online CPU and verifies each ran
/// exactly where it was pinned.
fn sched_affinity_stress() -> bool {
    let targets = online_targets(true);
    if targets.len() == 0 {
        return true;
    }

    reset_sched_state();
    let job_count = split_work(config::SCHED_STRESS_JOBS);
    let base = config::SCHED_STRESS_TARGET / job_count;
    let mut remainder = config::SCHED_STRESS_TARGET % job_count;
    let mut expected_per_cpu = [0u32; MAX_CPUS];

    for i in 0..job_count as usize {
        let (index, apic) = targets[i % targets.len()];
        let work = base + u32::from(remainder > 0);
        remainder = remainder.saturating_sub(1);

        SCHED_JOBS[i].work.store(work, Ordering::Relaxed);
        SCHED_JOBS[i]
            .expected_cpu
            .store(index.as_u32(), Ordering::Release);
        expected_per_cpu[index.as_usize()] += 1;

        let arg = core::ptr::from_ref(&SCHED_JOBS[i]).cast_mut().cast::<()>();
        if !sched::schedule_on(index, sched_counter_job, arg) {
            kwarn!(
                "selftest: sched enqueue failed idx={i} cpu={index} apic={apic} depth={} total={}",
                sched::runqueue_depth_cpu(index),
                sched::runqueue_depth_total(),
            );
            return false;
        }
    }

    let done = with_interrupts(|| {
        for _ in 0..config::SCHED_STRESS_TIMEOUT_LOOPS {
            while sched::run_next_work() {}
            if SCHED_JOBS_DONE.load(Ordering::Acquire) == job_count {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    });

    if !done {
        kwarn!(
            "selftest: sched stress timeout done={}/{job_count} counter={} total_depth={}",
            SCHED_JOBS_DONE.load(Ordering::Relaxed),
            SCHED_COUNTER.load(Ordering::Relaxed),
            sched::runqueue_depth_total(),
        );
        return false;
    }

    let final_counter = SCHED_COUNTER.load(Ordering::Relaxed);
    if final_counter != config::SCHED_STRESS_TARGET {
        kwarn!(
            "selftest: sched stress FAILED got={final_counter} expected={}",
            config::SCHED_STRESS_TARGET
        );
        return false;
    }

    let migrations = MIGRATION_ERRORS.load(Ordering::Relaxed);
    if migrations != 0 {
        kwarn!(
            "selftest: affinity violated {migrations} times (first: expected cpu {} got {})",
            FIRST_EXPECTED.load(Ordering::Relaxed),
            FIRST_GOT.load(Ordering::Relaxed),
        );
        return false;
    }

    for &(index, apic) in targets.iter() {
        let got = SCHED_EXEC.get_for(index).load(Ordering::Relaxed);
        let expected = expected_per_cpu[index.as_usize()];
        if got != expected {
            kwarn!(
                "selftest: sched stress FAILED cpu={index} apic={apic} expected_jobs={expected} got_jobs={got}"
            );
            return false;
        }
    }

    kinfo!(
        "selftest: scheduler affinity ok final={final_counter} jobs={job_count} cpus={}",
        targets.len()
    );
    true
}

/// One balance phase: unpinned jobs under a given flag combination; when
/// `bsp_drains` is false the BSP only polls, so remote CPUs must pull the
/// work themselves.
fn balance_phase(push: bool, steal: bool, bsp_drains: bool, label: &str) -> bool {
    reset_sched_state();
    sched::set_push_balance(push);
    sched::set_work_stealing(steal);

    let job_count = split_work(config::SCHED_STRESS_JOBS);
    let base = config::SCHED_STRESS_TARGET / job_count;
    let mut remainder = config::SCHED_STRESS_TARGET % job_count;

    for i in 0..job_count as usize {
        let work = base + u32::from(remainder > 0);
        remainder = remainder.saturating_sub(1);
        SCHED_JOBS[i].work.store(work, Ordering::Relaxed);

        let arg = core::ptr::from_ref(&SCHED_JOBS[i]).cast_mut().cast::<()>();
        if !sched::schedule(sched_balance_job, arg) {
            kwarn!(
                "selftest: {label} enqueue failed idx={i} depth={} total={}",
                sched::runqueue_depth(),
                sched::runqueue_depth_total(),
            );
            return false;
        }
    }

    let done = with_interrupts(|| {
        for _ in 0..config::SCHED_STRESS_TIMEOUT_LOOPS {
            if bsp_drains {
                while sched::run_next_work() {}
            }
            if SCHED_JOBS_DONE.load(Ordering::Acquire) == job_count {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    });

    if !done {
        kwarn!(
            "selftest: {label} timeout done={}/{job_count} counter={} total_depth={}",
            SCHED_JOBS_DONE.load(Ordering::Relaxed),
            SCHED_COUNTER.load(Ordering::Relaxed),
            sched::runqueue_depth_total(),
        );
        return false;
    }

    let final_counter = SCHED_COUNTER.load(Ordering::Relaxed);
    if final_counter != config::SCHED_STRESS_TARGET {
        kwarn!(
            "selftest: {label} FAILED got={final_counter} expected={}",
            config::SCHED_STRESS_TARGET
        );
        return false;
    }

    let mut remote_exec = 0;
    for online in cpu::table().online_cpus() {
        if online != CpuId::BSP {
            remote_exec += SCHED_EXEC.get_for(online).load(Ordering::Relaxed);
        }
    }
    if cpu::table().online_count() > 1 && remote_exec == 0 {
        kwarn!("selftest: {label} FAILED no remote execution");
        return false;
    }

    kinfo!("selftest: {label} ok final={final_counter} jobs={job_count} remote_exec={remote_exec}");
    true
}

/// Exercises push-balance and work stealing separately, restoring the
/// production flag settings afterwards.
fn balance_tests() -> bool {
    if cpu::table().online_count() <= 1 {
        return true;
    }

    let saved_push = sched::is_push_balance_enabled();
    let saved_steal = sched::is_work_stealing_enabled();

    let push_ok = balance_phase(true, false, true, "push-balance");
    let steal_ok = balance_phase(false, true, false, "work-steal");

    sched::set_push_balance(saved_push);
    sched::set_work_stealing(saved_steal);

    while sched::run_next_work() {}
    push_ok && steal_ok
}

// ── Blocked-CPU pathological case ────────────────────────────────────────

static PATHO_LONG_DONE: AtomicBool = AtomicBool::new(false);
static PATHO_SHORT_DONE: AtomicU32 = AtomicU32::new(0);
static PATHO_SHORT_EXEC: CpuLocal<AtomicU32> =
    CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

fn patho_long_job(_arg: *mut ()) {
    for _ in 0..config::PATHO_LONG_SPINS {
        core::hint::spin_loop();
    }
    PATHO_LONG_DONE.store(true, Ordering::Release);
}

fn patho_short_job(_arg: *mut ()) {
    PATHO_SHORT_EXEC
        .get_for(cpu::current_logical_index())
        .fetch_add(1, Ordering::Relaxed);
    PATHO_SHORT_DONE.fetch_add(1, Ordering::Release);
}

/// One long spinner pinned to an AP plus a burst of unpinned short jobs on
/// the non-draining BSP: the shorts can only complete if somebody steals.
fn pathological_test() -> bool {
    if cpu::table().online_count() <= 2 {
        return true;
    }
    let Some(blocked) = cpu::table().online_cpus().find(|&c| c != CpuId::BSP) else {
        return true;
    };

    let saved_push = sched::is_push_balance_enabled();
    let saved_steal = sched::is_work_stealing_enabled();
    sched::set_push_balance(false);
    sched::set_work_stealing(true);

    PATHO_LONG_DONE.store(false, Ordering::Relaxed);
    PATHO_SHORT_DONE.store(0, Ordering::Relaxed);
    for (_, exec) in PATHO_SHORT_EXEC.iter() {
        exec.store(0, Ordering::Relaxed);
    }

    let restore = |ok: bool| {
        sched::set_push_balance(saved_push);
        sched::set_work_stealing(saved_steal);
        ok
    };

    if !sched::schedule_on(blocked, patho_long_job, core::ptr::null_mut()) {
        kwarn!("selftest: patho enqueue failed (long) cpu={blocked}");
        return restore(false);
    }
    for i in 0..config::PATHO_SHORT_JOBS {
        if !sched::schedule(patho_short_job, core::ptr::null_mut()) {
            kwarn!(
                "selftest: patho enqueue failed (short) idx={i} total={}",
                sched::runqueue_depth_total()
            );
            return restore(false);
        }
    }

    let done = with_interrupts(|| {
        for _ in 0..config::PATHO_TIMEOUT_LOOPS {
            if PATHO_SHORT_DONE.load(Ordering::Acquire) == config::PATHO_SHORT_JOBS
                && PATHO_LONG_DONE.load(Ordering::Acquire)
            {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    });

    if !done {
        kwarn!(
            "selftest: patho timeout short={}/{} long_done={} total_depth={}",
            PATHO_SHORT_DONE.load(Ordering::Relaxed),
            config::PATHO_SHORT_JOBS,
            PATHO_LONG_DONE.load(Ordering::Relaxed),
            sched::runqueue_depth_total(),
        );
        return restore(false);
    }

    let mut remote_short = 0;
    for online in cpu::table().online_cpus() {
        if online != CpuId::BSP {
            remote_short += PATHO_SHORT_EXEC.get_for(online).load(Ordering::Relaxed);
        }
    }
    if remote_short == 0 {
        kwarn!("selftest: patho FAILED no stolen short execution");
        return restore(false);
    }

    kinfo!(
        "selftest: patho ok blocked_cpu={blocked} short_jobs={} remote_short={remote_short} blocked_short={}",
        config::PATHO_SHORT_JOBS,
        PATHO_SHORT_EXEC.get_for(blocked).load(Ordering::Relaxed),
    );
    restore(true)
}

// ── YMM stress ───────────────────────────────────────────────────────────

static YMM_DONE: CpuLocal<AtomicBool> = CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);
static YMM_FAIL: CpuLocal<AtomicBool> = CpuLocal::new([const { AtomicBool::new(false) }; MAX_CPUS]);
static YMM_SIG: CpuLocal<core::sync::atomic::AtomicU64> =
    CpuLocal::new([const { core::sync::atomic::AtomicU64::new(0) }; MAX_CPUS]);

fn ymm_job(_arg: *mut ()) {
    let this = cpu::current_logical_index();
    match fpu::stress_ymm_local(config::YMM_STRESS_ITERS) {
        Some(signature) => {
            YMM_SIG.get_for(this).store(signature, Ordering::Relaxed);
            YMM_FAIL.get_for(this).store(false, Ordering::Release);
        }
        None => YMM_FAIL.get_for(this).store(true, Ordering::Release),
    }
    YMM_DONE.get_for(this).store(true, Ordering::Release);
}

/// Runs the YMM save/restore probe on every online CPU and mixes the
/// per-CPU signatures (deterministic per iteration seed).
fn ymm_stress() -> bool {
    if !fpu::is_avx_enabled() {
        kinfo!("selftest: YMM stress skipped (AVX disabled)");
        return true;
    }
    let targets = online_targets(true);
    if targets.len() == 0 {
        return true;
    }

    for (_, done) in YMM_DONE.iter() {
        done.store(false, Ordering::Relaxed);
    }
    for (_, fail) in YMM_FAIL.iter() {
        fail.store(false, Ordering::Relaxed);
    }
    for (_, sig) in YMM_SIG.iter() {
        sig.store(0, Ordering::Relaxed);
    }

    for &(index, apic) in targets.iter() {
        if !sched::schedule_on(index, ymm_job, core::ptr::null_mut()) {
            kwarn!("selftest: YMM enqueue failed cpu={index} apic={apic}");
            return false;
        }
    }

    let done = with_interrupts(|| {
        for _ in 0..config::YMM_STRESS_TIMEOUT_LOOPS {
            while sched::run_next_work() {}
            let done_count = targets
                .iter()
                .filter(|&&(index, _)| YMM_DONE.get_for(index).load(Ordering::Acquire))
                .count();
            if done_count == targets.len() {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    });

    if !done {
        kwarn!(
            "selftest: YMM timeout iters={} total_depth={}",
            config::YMM_STRESS_ITERS,
            sched::runqueue_depth_total()
        );
        return false;
    }

    let mut signature_mix: u64 = 0;
    for &(index, _) in targets.iter() {
        if YMM_FAIL.get_for(index).load(Ordering::Acquire) {
            kwarn!(
                "selftest: YMM FAILED cpu={index} iters={}",
                config::YMM_STRESS_ITERS
            );
            return false;
        }
        let signature = YMM_SIG.get_for(index).load(Ordering::Relaxed);
        signature_mix ^= signature.wrapping_add(u64::from(index.as_u32() + 1) << 32);
    }

    kinfo!(
        "selftest: YMM ok cpus={} iters={} sig={signature_mix:#x}",
        targets.len(),
        config::YMM_STRESS_ITERS
    );
    true
}

// ── TLB shootdown validation ─────────────────────────────────────────────

static TLB_PROBE_TARGET: AtomicU32 = AtomicU32::new(0);

/// Shoots down a live kernel page and checks that every other online CPU's
/// `tlb_ipi_count` moved.
fn validate_tlb_shootdown() -> bool {
    let targets = online_targets(false);
    if targets.len() == 0 {
        return true;
    }

    let mut before = [0u64; MAX_CPUS];
    for &(index, _) in targets.iter() {
        if let Some(rec) = cpu::table().record(index) {
            before[index.as_usize()] = rec.tlb_ipi_count.load(Ordering::Relaxed);
        }
    }

    let probe = VirtAddr::from_ref(&TLB_PROBE_TARGET);
    let ok = with_interrupts(|| tlb::shootdown_page(probe));
    if !ok {
        return false;
    }

    for &(index, apic) in targets.iter() {
        let after = cpu::table()
            .record(index)
            .map_or(0, |rec| rec.tlb_ipi_count.load(Ordering::Relaxed));
        if after == before[index.as_usize()] {
            kwarn!("selftest: TLB shootdown missed cpu={index} apic={apic}");
            return false;
        }
    }

    kinfo!("selftest: TLB shootdown ok targets={}", targets.len());
    true
}
