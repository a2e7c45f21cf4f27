//! Interrupt-flag control.

/// RFLAGS interrupt-enable bit.
const RFLAGS_IF: u64 = 1 << 9;

/// Enables interrupts (`sti`).
///
/// # Safety
///
/// The caller must ensure the IDT and interrupt controller are configured;
/// a spurious interrupt with no handler is fatal.
#[inline]
pub unsafe fn enable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Disables interrupts (`cli`).
#[inline]
pub fn disable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Masking interrupts is always safe in kernel mode.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Returns `true` if interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn are_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        super::super::registers::rflags::read() & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = RFLAGS_IF;
        false
    }
}

/// Saves the current RFLAGS and disables interrupts.
///
/// Returns the saved flags for a later [`restore`]. The save/disable pair
/// is the acquisition half of the IRQ-save lock discipline.
#[inline]
#[must_use]
pub fn save_and_disable() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let flags: u64;
        // SAFETY: Reading RFLAGS and disabling interrupts is safe in
        // kernel mode.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) flags,
                options(nomem),
            );
        }
        flags
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Restores a previously saved interrupt state.
///
/// Only the IF bit is honored: interrupts are re-enabled iff they were
/// enabled at the matching [`save_and_disable`].
#[inline]
pub fn restore(saved_flags: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if saved_flags & RFLAGS_IF != 0 {
        // SAFETY: Re-enabling interrupts restores a previous state; the IDT
        // was necessarily configured when the flags were saved.
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = saved_flags;
    }
}

/// Enables interrupts and halts in one step (`sti; hlt`).
///
/// The `sti` shadow guarantees no interrupt is taken between the two
/// instructions, so a wake-up cannot be lost. This is the idle loop's
/// blocking primitive.
///
/// # Safety
///
/// Same contract as [`enable`].
#[inline]
pub unsafe fn enable_and_hlt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("sti; hlt", options(nomem, nostack, preserves_flags));
    }
}
