//! Fast-syscall (SYSCALL/SYSRET) MSR setup.
//!
//! The syscall dispatch table and its entry stub belong to the embedding
//! kernel; the core only installs the entry on every CPU. Until an entry
//! is registered, SYSCALL stays disabled on CPUs that initialize; there
//! is no way to take a syscall before the process layer exists.

use core::sync::atomic::{AtomicU64, Ordering};

use argon_core::arch::x86_64::registers::model_specific::{
    EferFlags, IA32_EFER, MSR_LSTAR, MSR_SFMASK, MSR_STAR,
};
use argon_core::kdebug;

use super::gdt;

/// RFLAGS bits masked on syscall entry: IF, TF, DF, AC.
const SFMASK_BITS: u64 = (1 << 9) | (1 << 8) | (1 << 10) | (1 << 18);

/// Registered 64-bit syscall entry address (0 = none yet).
static SYSCALL_ENTRY: AtomicU64 = AtomicU64::new(0);

/// Registers the kernel's syscall entry stub. CPUs initialized afterwards
/// pick it up; call before SMP bring-up.
pub fn set_entry(entry: u64) {
    SYSCALL_ENTRY.store(entry, Ordering::Release);
}

/// Programs STAR/LSTAR/SFMASK and enables SYSCALL on the calling CPU.
///
/// No-op (logged) when no entry has been registered.
///
/// # Safety
///
/// The GDT must be loaded with the selector layout in [`gdt`]; must be
/// called once per CPU.
pub unsafe fn init() {
    let entry = SYSCALL_ENTRY.load(Ordering::Acquire);
    if entry == 0 {
        kdebug!("syscall: no entry registered, SYSCALL left disabled");
        return;
    }

    // STAR[47:32] = kernel CS base; STAR[63:48] = user base such that
    // SYSRET loads CS = base+16 (user code) and SS = base+8 (user data).
    let user_base = u64::from(gdt::USER_DATA & !3) - 8;
    let star = (u64::from(gdt::KERNEL_CODE) << 32) | (user_base << 48);

    // SAFETY: Selector layout is guaranteed by the caller; the entry was
    // registered by the kernel's syscall layer.
    unsafe {
        MSR_STAR.write(star);
        MSR_LSTAR.write(entry);
        MSR_SFMASK.write(SFMASK_BITS);
        IA32_EFER.write(IA32_EFER.read() | EferFlags::SYSTEM_CALL_ENABLE.bits());
    }
}
