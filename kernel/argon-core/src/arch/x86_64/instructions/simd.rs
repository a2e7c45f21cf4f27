//! FPU/SSE/AVX state instructions.
//!
//! Save-area pointers passed to the `xsave`/`fxsave` family must satisfy
//! the architectural alignment (64 bytes for XSAVE, 16 for FXSAVE) and be
//! large enough for the active feature mask; callers own that contract.

/// Re-initializes the x87 FPU to its power-on state (`fninit`).
#[inline]
pub fn fninit() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: FNINIT only resets FPU-internal state.
    unsafe {
        core::arch::asm!("fninit", options(nostack, preserves_flags));
    }
}

/// Saves x87/SSE state to a 512-byte area (`fxsave`).
///
/// # Safety
///
/// `area` must point to 512 writable bytes aligned to 16.
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "fxsr"))]
pub unsafe fn fxsave(area: *mut u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("fxsave [{}]", in(reg) area, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = area;
    }
}

/// Restores x87/SSE state from a 512-byte area (`fxrstor`).
///
/// # Safety
///
/// `area` must point to 512 readable bytes aligned to 16, previously
/// written by [`fxsave`] or image-compatible.
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "fxsr"))]
pub unsafe fn fxrstor(area: *const u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("fxrstor [{}]", in(reg) area, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = area;
    }
}

/// Saves extended state selected by `mask` (`xsave`).
///
/// # Safety
///
/// `area` must point to a writable XSAVE area aligned to 64 and sized for
/// `mask`; CR4.OSXSAVE must be set.
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "xsave"))]
pub unsafe fn xsave(area: *mut u8, mask: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!(
            "xsave [{}]",
            in(reg) area,
            in("eax") mask as u32,
            in("edx") (mask >> 32) as u32,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (area, mask);
    }
}

/// Restores extended state selected by `mask` (`xrstor`).
///
/// # Safety
///
/// Same area requirements as [`xsave`]; the area must hold a valid image.
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "xsave"))]
pub unsafe fn xrstor(area: *const u8, mask: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!(
            "xrstor [{}]",
            in(reg) area,
            in("eax") mask as u32,
            in("edx") (mask >> 32) as u32,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = (area, mask);
    }
}

/// Loads 32 bytes into YMM0 (`vmovdqu`).
///
/// # Safety
///
/// AVX must be enabled (CR4.OSXSAVE + XCR0.AVX).
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "avx"))]
pub unsafe fn load_ymm0(pattern: &[u8; 32]) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!(
            "vmovdqu ymm0, [{}]",
            in(reg) pattern.as_ptr(),
            out("ymm0") _,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = pattern;
    }
}

/// Stores YMM0 into a 32-byte buffer (`vmovdqu`).
///
/// # Safety
///
/// AVX must be enabled (CR4.OSXSAVE + XCR0.AVX).
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "avx"))]
pub unsafe fn store_ymm0(out: &mut [u8; 32]) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!(
            "vmovdqu [{}], ymm0",
            in(reg) out.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = out;
    }
}

/// Zeroes the upper halves of all YMM registers (`vzeroupper`).
///
/// # Safety
///
/// AVX must be enabled.
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "avx"))]
pub unsafe fn vzeroupper() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("vzeroupper", options(nostack, preserves_flags));
    }
}

/// Executes one SSE instruction (`xorps xmm0, xmm0`) to provoke `#NM` when
/// CR0.TS is set. Used by the lazy-FPU probe.
///
/// # Safety
///
/// SSE must be enabled (CR4.OSFXSR).
#[inline]
#[cfg_attr(target_arch = "x86_64", target_feature(enable = "sse"))]
pub unsafe fn sse_probe() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Guaranteed by the caller per this function's contract.
    unsafe {
        core::arch::asm!("xorps xmm0, xmm0", out("xmm0") _, options(nostack, preserves_flags));
    }
}
