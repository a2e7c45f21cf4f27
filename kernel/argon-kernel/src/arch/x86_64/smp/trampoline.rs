//! The 16-bit AP startup trampoline.
//!
//! APs come out of STARTUP IPI in real mode at `TRAMPOLINE_PHYS`. The stub
//! below switches straight to 64-bit long mode (PAE + LME, then PE|PG in
//! one CR0 write), loads the stack and entry address from the handoff
//! record, and jumps into the kernel with the handoff physical address as
//! the first argument.
//!
//! The code is assembled into the kernel image position-dependent for
//! `TRAMPOLINE_PHYS`: absolute targets are computed as
//! `0x7000 + (label - start)`, so it only works from that page.

use argon_core::addr::{PhysAddr, VirtAddr};
use argon_core::kerr;

use crate::config::{HANDOFF_PHYS, TRAMPOLINE_PHYS};
use crate::mm::{self, PageFlags};

core::arch::global_asm!(
    r#"
    .section .text
    .global ap_trampoline_start
    .global ap_trampoline_end
    .align 16
    .code16
ap_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds

    # GDT for the mode switch lives inside this page.
    lgdtl (0x7000 + trampoline_gdt_desc - ap_trampoline_start)

    # PAE on.
    movl %cr4, %eax
    orl $0x20, %eax
    movl %eax, %cr4

    # Kernel page-table root from the handoff record (low 32 bits; the
    # root is guaranteed below 4 GiB).
    movl (0x7E00 + 8), %eax
    movl %eax, %cr3

    # EFER.LME: the PG write below activates long mode directly.
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x100, %eax
    wrmsr

    # PE + PG in one shot, then far-jump into 64-bit code.
    movl %cr0, %eax
    orl $0x80000001, %eax
    movl %eax, %cr0
    ljmpl $0x08, $(0x7000 + trampoline_long - ap_trampoline_start)

    .code64
trampoline_long:
    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    # Stack, argument, and entry from the handoff record.
    movq (0x7E00 + 16), %rsp
    movq (0x7E00 + 32), %rdi
    movq (0x7E00 + 24), %rax
    jmpq *%rax

    .balign 8
trampoline_gdt:
    .quad 0
    .quad 0x00AF9A000000FFFF    # 0x08: 64-bit code
    .quad 0x00CF92000000FFFF    # 0x10: data
trampoline_gdt_desc:
    .word trampoline_gdt_desc - trampoline_gdt - 1
    .long 0x7000 + trampoline_gdt - ap_trampoline_start
ap_trampoline_end:
    "#,
    options(att_syntax)
);

unsafe extern "C" {
    #[allow(non_upper_case_globals)]
    static ap_trampoline_start: u8;
    #[allow(non_upper_case_globals)]
    static ap_trampoline_end: u8;
}

/// Returns the trampoline machine code as embedded in the kernel image.
fn code() -> &'static [u8] {
    // SAFETY: The two symbols delimit the assembled stub above.
    unsafe {
        let start = &raw const ap_trampoline_start;
        let end = &raw const ap_trampoline_end;
        core::slice::from_raw_parts(start, end.offset_from(start) as usize)
    }
}

/// Copies the trampoline to its fixed low page.
///
/// Identity-maps the page (the AP executes from it in real mode and the
/// handoff record shares it), zeroes it, and installs the stub. Returns
/// `false` if the mapping fails or the stub would overlap the handoff
/// record.
pub fn prepare() -> bool {
    let page_virt = VirtAddr::new(TRAMPOLINE_PHYS);
    let page_phys = PhysAddr::new(TRAMPOLINE_PHYS);
    if !mm::map_page(page_virt, page_phys, PageFlags::WRITABLE) {
        kerr!("smp: cannot identity-map trampoline page {page_phys}");
        return false;
    }

    let stub = code();
    let room = (HANDOFF_PHYS - TRAMPOLINE_PHYS) as usize;
    if stub.is_empty() || stub.len() >= room {
        kerr!("smp: trampoline size {} does not fit {room} bytes", stub.len());
        return false;
    }

    // SAFETY: The page was just identity-mapped writable and holds nothing
    // else yet.
    unsafe {
        core::ptr::write_bytes(page_virt.as_mut_ptr::<u8>(), 0, 0x1000);
        core::ptr::copy_nonoverlapping(stub.as_ptr(), page_virt.as_mut_ptr::<u8>(), stub.len());
    }
    true
}
