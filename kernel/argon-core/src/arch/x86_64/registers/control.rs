//! Control register access (CR0, CR3, CR4, XCR0).

use crate::addr::PhysAddr;

bitflags::bitflags! {
    /// CR0 flags the core manipulates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Monitor Coprocessor: `wait`/`fwait` honor TS.
        const MONITOR_COPROCESSOR = 1 << 1;
        /// Emulation: FPU instructions trap `#UD`. Must be clear.
        const EMULATE_COPROCESSOR = 1 << 2;
        /// Task Switched: next FPU/SSE instruction traps `#NM`.
        const TASK_SWITCHED = 1 << 3;
        /// Numeric Error: native x87 exception reporting.
        const NUMERIC_ERROR = 1 << 5;
    }
}

bitflags::bitflags! {
    /// CR4 flags the core manipulates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// OS supports FXSAVE/FXRSTOR.
        const OSFXSR = 1 << 9;
        /// OS supports unmasked SIMD exceptions (`#XM`).
        const OSXMMEXCPT = 1 << 10;
        /// OS supports XSAVE/XRSTOR and XCR0.
        const OSXSAVE = 1 << 18;
    }
}

bitflags::bitflags! {
    /// XCR0 state-component bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Xcr0Flags: u64 {
        /// x87 FPU state. Architecturally always set.
        const X87 = 1 << 0;
        /// SSE (XMM) state.
        const SSE = 1 << 1;
        /// AVX (upper-YMM) state.
        const AVX = 1 << 2;
    }
}

/// The CR0 control register.
pub struct Cr0;

impl Cr0 {
    /// Reads CR0.
    #[inline]
    #[must_use]
    pub fn read() -> u64 {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let value: u64;
            // SAFETY: Reading CR0 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            value
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            0
        }
    }

    /// Writes CR0.
    ///
    /// # Safety
    ///
    /// Changing paging/caching/FPU bits alters global CPU behavior; the
    /// caller must know the new value is coherent.
    #[inline]
    pub unsafe fn write(value: u64) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Guaranteed by the caller per this function's contract.
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) value, options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = value;
        }
    }

    /// Sets CR0.TS so the next FPU/SSE instruction traps `#NM`.
    #[inline]
    pub fn set_task_switched() {
        // SAFETY: Setting TS only arms the lazy-FPU trap.
        unsafe { Self::write(Self::read() | Cr0Flags::TASK_SWITCHED.bits()) };
    }

    /// Clears CR0.TS (`clts`), permitting FPU/SSE instructions.
    #[inline]
    pub fn clear_task_switched() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: CLTS only clears the TS bit.
        unsafe {
            core::arch::asm!("clts", options(nomem, nostack, preserves_flags));
        }
    }
}

/// The CR3 control register (page-table root).
pub struct Cr3;

impl Cr3 {
    /// Reads the current page-table root.
    #[inline]
    #[must_use]
    pub fn read() -> PhysAddr {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let value: u64;
            // SAFETY: Reading CR3 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            PhysAddr::new(value)
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            PhysAddr::zero()
        }
    }

    /// Writes the page-table root, flushing non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must point to a valid top-level page table that maps the
    /// currently executing code and stack.
    #[inline]
    pub unsafe fn write(root: PhysAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Guaranteed by the caller per this function's contract.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = root;
        }
    }
}

/// The CR4 control register.
pub struct Cr4;

impl Cr4 {
    /// Reads CR4.
    #[inline]
    #[must_use]
    pub fn read() -> u64 {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let value: u64;
            // SAFETY: Reading CR4 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            value
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            0
        }
    }

    /// Writes CR4.
    ///
    /// # Safety
    ///
    /// Setting feature bits the CPU does not support raises `#GP`; the
    /// caller must have verified support via CPUID.
    #[inline]
    pub unsafe fn write(value: u64) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Guaranteed by the caller per this function's contract.
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) value, options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = value;
        }
    }
}

/// The XCR0 extended control register (XSAVE feature mask).
pub struct Xcr0;

impl Xcr0 {
    /// Reads XCR0 (`xgetbv` with ecx=0).
    ///
    /// # Safety
    ///
    /// CR4.OSXSAVE must be set.
    #[inline]
    #[must_use]
    pub unsafe fn read() -> u64 {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            let (low, high): (u32, u32);
            // SAFETY: Guaranteed by the caller per this function's contract.
            unsafe {
                core::arch::asm!(
                    "xgetbv",
                    in("ecx") 0u32,
                    out("eax") low,
                    out("edx") high,
                    options(nomem, nostack, preserves_flags),
                );
            }
            u64::from(high) << 32 | u64::from(low)
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            0
        }
    }

    /// Writes XCR0 (`xsetbv` with ecx=0).
    ///
    /// # Safety
    ///
    /// CR4.OSXSAVE must be set and every bit in `value` must be supported
    /// (CPUID leaf 0xD), else `#GP`.
    #[inline]
    pub unsafe fn write(value: u64) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        // SAFETY: Guaranteed by the caller per this function's contract.
        unsafe {
            core::arch::asm!(
                "xsetbv",
                in("ecx") 0u32,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nomem, nostack, preserves_flags),
            );
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            let _ = value;
        }
    }
}
