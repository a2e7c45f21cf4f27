//! Compile-time configuration.
//!
//! Single source of truth for the core's constants: fixed physical
//! addresses shared with the real-mode trampoline, reserved interrupt
//! vectors, spin-wait budgets, and the knobs of the boot-time SMP
//! validation suite.

/// Maximum number of logical CPUs (re-exported from the identity table).
pub use argon_core::cpu::MAX_CPUS;

/// Kernel stack size for APs and tasks.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

// ── AP bring-up ──────────────────────────────────────────────────────────

/// Physical page the real-mode trampoline is copied to. Must be below
/// 1 MiB and page-aligned: the STARTUP IPI vector encodes `addr >> 12`.
pub const TRAMPOLINE_PHYS: u64 = 0x7000;

/// Fixed physical address of the AP handoff record, inside the trampoline
/// page so real-mode code can reach it with 16-bit addressing.
pub const HANDOFF_PHYS: u64 = 0x7E00;

/// STARTUP IPI vector for the trampoline page.
pub const TRAMPOLINE_VECTOR: u8 = (TRAMPOLINE_PHYS >> 12) as u8;

/// Magic cookie the trampoline checks before trusting the handoff record.
pub const HANDOFF_MAGIC: u64 = 0x4150_5F48_414E_444F;

/// Bounded iterations while polling an AP's ready flag.
pub const AP_READY_TIMEOUT_LOOPS: u32 = 50_000_000;

/// Pause iterations after the INIT IPI (≈10 ms on contemporary parts).
pub const INIT_DELAY_LOOPS: u32 = 10_000_000;

/// Pause iterations after each STARTUP IPI (≈1 ms).
pub const SIPI_DELAY_LOOPS: u32 = 1_000_000;

/// Bounded spin on the ICR delivery-status bit per IPI send.
pub const ICR_DELIVERY_TIMEOUT_LOOPS: u32 = 1_000_000;

// ── Reserved interrupt vectors ───────────────────────────────────────────

/// PING request (BSP → AP link validation).
pub const VEC_PING: u8 = 0xF1;
/// PONG reply (AP → BSP).
pub const VEC_PONG: u8 = 0xF2;
/// Counter-stress work order.
pub const VEC_COUNTER: u8 = 0xF3;
/// Scheduler kick: forces a reschedule on return from interrupt.
pub const VEC_SCHED_KICK: u8 = 0xF4;
/// TLB shootdown request.
pub const VEC_TLB: u8 = 0xF5;
/// Deferred AP local-timer start.
pub const VEC_TIMER_INIT: u8 = 0xF6;
/// Local APIC timer tick.
pub const VEC_TIMER: u8 = 0xFE;
/// Spurious-interrupt vector.
pub const VEC_SPURIOUS: u8 = 0xFF;

// ── Spin-wait budgets (pause-backoff loop iterations) ────────────────────

/// PING/PONG round-trip wait.
pub const IPI_PONG_TIMEOUT_LOOPS: u32 = 10_000_000;
/// Remote TLB acknowledgement wait, per target.
pub const TLB_ACK_TIMEOUT_LOOPS: u32 = 10_000_000;
/// Per-AP timer-start acknowledgement wait.
pub const TIMER_INIT_TIMEOUT_LOOPS: u32 = 10_000_000;
/// RCU `synchronize` bound, in timer ticks.
pub const RCU_SYNC_TIMEOUT_TICKS: u64 = 100_000;

// ── FPU/XSAVE ────────────────────────────────────────────────────────────

/// Upper bound on the XSAVE area size we accept from CPUID.
pub const XSAVE_AREA_MAX: u32 = 4096;
/// Architectural XSAVE area alignment.
pub const XSAVE_ALIGN: usize = 64;
/// Size of a legacy FXSAVE area.
pub const FXSAVE_AREA_SIZE: u32 = 512;

// ── Boot-time SMP validation suite ───────────────────────────────────────

/// Master switch plus per-phase enables for the bring-up self tests.
pub const SELFTEST_IPI_LINK: bool = true;
/// Counter-stress phase enable.
pub const SELFTEST_COUNTER: bool = true;
/// Scheduler affinity-stress phase enable.
pub const SELFTEST_SCHED: bool = true;
/// Push-balance / work-steal phase enable.
pub const SELFTEST_BALANCE: bool = true;
/// Blocked-CPU pathological phase enable.
pub const SELFTEST_PATHOLOGICAL: bool = true;
/// YMM save/restore stress enable.
pub const SELFTEST_YMM: bool = true;
/// TLB shootdown validation enable.
pub const SELFTEST_TLB: bool = true;

/// Total increments for the counter stress.
pub const COUNTER_STRESS_TARGET: u32 = 10_000;
/// Counter-stress completion wait.
pub const COUNTER_STRESS_TIMEOUT_LOOPS: u32 = 50_000_000;

/// Total increments for the scheduler stress phases.
pub const SCHED_STRESS_TARGET: u32 = 10_000;
/// Number of jobs the scheduler stress splits its work into.
pub const SCHED_STRESS_JOBS: u32 = 64;
/// Upper bound on preallocated self-test job slots.
pub const SCHED_MAX_JOBS: usize = 256;
/// Scheduler-stress completion wait.
pub const SCHED_STRESS_TIMEOUT_LOOPS: u32 = 50_000_000;

/// Short jobs submitted in the blocked-CPU phase.
pub const PATHO_SHORT_JOBS: u32 = 32;
/// Pause iterations the long blocking job spins for.
pub const PATHO_LONG_SPINS: u32 = 5_000_000;
/// Blocked-CPU phase completion wait.
pub const PATHO_TIMEOUT_LOOPS: u32 = 100_000_000;

/// YMM stress iterations per CPU.
pub const YMM_STRESS_ITERS: u32 = 64;
/// YMM stress completion wait.
pub const YMM_STRESS_TIMEOUT_LOOPS: u32 = 100_000_000;
