//! RFLAGS register access.

/// Reads the current RFLAGS value.
#[inline]
#[must_use]
pub fn read() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let flags: u64;
        // SAFETY: Reading RFLAGS has no side effects.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                out(reg) flags,
                options(nomem, preserves_flags),
            );
        }
        flags
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}
