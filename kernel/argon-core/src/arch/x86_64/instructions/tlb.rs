//! TLB (Translation Lookaside Buffer) management instructions.

use crate::addr::VirtAddr;
use crate::arch::x86_64::registers::control::Cr3;

/// Flushes the TLB entry for the page containing `addr` (INVLPG).
#[inline]
pub fn flush(addr: VirtAddr) {
    let page = addr.page_base();
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: INVLPG only invalidates a single TLB entry and has no other
    // side effects.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) page.as_u64(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = page;
    }
}

/// Flushes the entire TLB by reloading CR3.
///
/// Writing back the same root only flushes non-global entries; the page
/// table itself is unchanged.
#[inline]
pub fn flush_all() {
    // SAFETY: Re-writing the current CR3 value does not change the address
    // space.
    unsafe { Cr3::write(Cr3::read()) };
}
