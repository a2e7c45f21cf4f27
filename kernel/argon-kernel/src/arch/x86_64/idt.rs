//! Interrupt Descriptor Table.
//!
//! A single IDT shared by every CPU: the BSP populates it once during
//! early init, each AP only executes `lidt`. Exceptions 0–31 route to the
//! handlers in [`super::interrupts::handlers`]; the reserved IPI and timer
//! vectors route through the dispatch table.

use core::arch::asm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use super::gdt;

/// Number of IDT entries.
const IDT_ENTRIES: usize = 256;

/// Gate type for 64-bit interrupt gates (interrupts disabled on entry).
const GATE_INTERRUPT: u16 = 0x8E00;

/// One 16-byte IDT gate descriptor.
#[derive(Clone, Copy)]
#[repr(C)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn new(handler: u64) -> Self {
        Self {
            offset_low: handler as u16,
            selector: gdt::KERNEL_CODE,
            options: GATE_INTERRUPT,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

struct Idt {
    entries: UnsafeCell<[IdtEntry; IDT_ENTRIES]>,
    built: AtomicBool,
}

// SAFETY: The entry array is written only by the BSP before `built` is
// release-stored; afterwards it is read-only (lidt and the CPU itself).
unsafe impl Sync for Idt {}

static IDT: Idt = Idt {
    entries: UnsafeCell::new([IdtEntry::missing(); IDT_ENTRIES]),
    built: AtomicBool::new(false),
};

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Installs a gate for `vector`. BSP-only, before [`finalize`].
pub(super) fn set_gate(vector: u8, handler: u64) {
    assert!(
        !IDT.built.load(Ordering::Acquire),
        "IDT modified after finalize"
    );
    // SAFETY: Gated to the single-threaded BSP build phase by the assert
    // above.
    unsafe {
        (*IDT.entries.get())[vector as usize] = IdtEntry::new(handler);
    }
}

/// Marks the table complete. Further [`set_gate`] calls panic.
pub(super) fn finalize() {
    IDT.built.store(true, Ordering::Release);
}

/// Loads the IDT on the calling CPU.
///
/// # Safety
///
/// The table must have been built and finalized by the BSP first.
pub unsafe fn load() {
    debug_assert!(IDT.built.load(Ordering::Acquire));
    let pointer = DescriptorPointer {
        limit: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
        base: IDT.entries.get() as u64,
    };
    // SAFETY: The IDT is a finalized static; the pointer is valid for the
    // duration of the lidt instruction.
    unsafe {
        asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
}
