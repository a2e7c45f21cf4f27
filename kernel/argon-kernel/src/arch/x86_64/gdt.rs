//! Global Descriptor Table.
//!
//! One flat-model GDT shared by every CPU. The selector layout matches
//! what SYSCALL/SYSRET expect: kernel code, kernel data, then user data
//! before user code (SYSRET derives SS from STAR+8 and CS from STAR+16).

use core::arch::asm;

/// Kernel code selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DATA: u16 = 0x10;
/// User data selector (RPL 3).
pub const USER_DATA: u16 = 0x18 | 3;
/// User code selector (RPL 3).
pub const USER_CODE: u16 = 0x20 | 3;

/// 64-bit kernel code: present, DPL 0, executable, long mode.
const KCODE_DESC: u64 = 0x00AF_9A00_0000_FFFF;
/// Kernel data: present, DPL 0, writable.
const KDATA_DESC: u64 = 0x00CF_9200_0000_FFFF;
/// User data: present, DPL 3, writable.
const UDATA_DESC: u64 = 0x00CF_F200_0000_FFFF;
/// 64-bit user code: present, DPL 3, executable, long mode.
const UCODE_DESC: u64 = 0x00AF_FA00_0000_FFFF;

static GDT: [u64; 5] = [0, KCODE_DESC, KDATA_DESC, UDATA_DESC, UCODE_DESC];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Loads the GDT and reloads every segment register.
///
/// Called by the BSP during early init and by each AP from its entry path.
///
/// # Safety
///
/// The caller must be in 64-bit mode with interrupts disabled; CS is
/// reloaded via a far return.
pub unsafe fn load() {
    let pointer = DescriptorPointer {
        limit: (size_of_val(&GDT) - 1) as u16,
        base: GDT.as_ptr() as u64,
    };

    // SAFETY: The GDT is a static with 'static lifetime; the descriptor
    // pointer is valid for the duration of the lgdt. The far return lands
    // on the next instruction with the new CS.
    unsafe {
        asm!(
            "lgdt [{ptr}]",
            "push {code_sel}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {data_sel:x}",
            "mov es, {data_sel:x}",
            "mov ss, {data_sel:x}",
            "xor {tmp:e}, {tmp:e}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            ptr = in(reg) &pointer,
            code_sel = const KERNEL_CODE as u64,
            data_sel = in(reg) u64::from(KERNEL_DATA),
            tmp = out(reg) _,
            options(preserves_flags),
        );
    }
}
