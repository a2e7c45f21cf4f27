//! The AP handoff record.
//!
//! A single fixed-address, physically contiguous structure shared with the
//! 16-bit trampoline. The BSP fills it before INIT-SIPI-SIPI; the AP reads
//! it once on the way up and sets `ready` when fully online; the BSP then
//! reuses the record for the next AP. The byte layout is part of the
//! trampoline ABI and must never change.

use core::sync::atomic::{Ordering, compiler_fence, fence};

use argon_core::id::{ApicId, CpuId};
use argon_core::static_assert;

use crate::config::{HANDOFF_MAGIC, HANDOFF_PHYS};

/// The handoff record. Offsets are fixed: the trampoline addresses fields
/// with absolute 16-bit displacements.
#[repr(C)]
pub struct ApHandoff {
    /// Magic cookie ([`HANDOFF_MAGIC`]) at +0.
    pub magic: u64,
    /// Kernel page-table root at +8. Must lie below 4 GiB: the
    /// trampoline loads it with a 32-bit move.
    pub page_table_root: u64,
    /// This AP's kernel-stack top at +16.
    pub stack_top: u64,
    /// 64-bit entry address at +24.
    pub entry64: u64,
    /// Opaque argument (the handoff physical address) at +32.
    pub arg: u64,
    /// Target physical id at +40.
    pub apic_id: u32,
    /// Target logical index at +44.
    pub cpu_index: u32,
    /// Ready flag at +48: the AP stores 1 once fully online.
    pub ready: u8,
    _reserved: [u8; 7],
}

static_assert!(core::mem::offset_of!(ApHandoff, magic) == 0);
static_assert!(core::mem::offset_of!(ApHandoff, page_table_root) == 8);
static_assert!(core::mem::offset_of!(ApHandoff, stack_top) == 16);
static_assert!(core::mem::offset_of!(ApHandoff, entry64) == 24);
static_assert!(core::mem::offset_of!(ApHandoff, arg) == 32);
static_assert!(core::mem::offset_of!(ApHandoff, apic_id) == 40);
static_assert!(core::mem::offset_of!(ApHandoff, cpu_index) == 44);
static_assert!(core::mem::offset_of!(ApHandoff, ready) == 48);
static_assert!(size_of::<ApHandoff>() == 56);

/// Returns the record's fixed location (identity-mapped with the
/// trampoline page).
fn record() -> *mut ApHandoff {
    HANDOFF_PHYS as *mut ApHandoff
}

/// Fields the BSP publishes for one AP.
pub struct HandoffParams {
    /// Kernel CR3 for the AP to load.
    pub page_table_root: u64,
    /// Top of the AP's kernel stack.
    pub stack_top: u64,
    /// 64-bit entry the trampoline jumps to.
    pub entry64: u64,
    /// Target physical id.
    pub apic_id: ApicId,
    /// Target logical index.
    pub cpu_index: CpuId,
}

/// Zeroes and refills the record for the next AP, `ready = 0`.
///
/// # Safety
///
/// The handoff page must be identity-mapped and no AP may be mid-boot.
pub unsafe fn publish(params: &HandoffParams) {
    let rec = record();
    // SAFETY: Fixed page mapped by `trampoline::prepare`; the BSP is the
    // only writer while no AP is between SIPI and ready.
    unsafe {
        core::ptr::write_bytes(rec.cast::<u8>(), 0, size_of::<ApHandoff>());
        (&raw mut (*rec).magic).write_volatile(HANDOFF_MAGIC);
        (&raw mut (*rec).page_table_root).write_volatile(params.page_table_root);
        (&raw mut (*rec).stack_top).write_volatile(params.stack_top);
        (&raw mut (*rec).entry64).write_volatile(params.entry64);
        (&raw mut (*rec).arg).write_volatile(HANDOFF_PHYS);
        (&raw mut (*rec).apic_id).write_volatile(params.apic_id.as_u32());
        (&raw mut (*rec).cpu_index).write_volatile(params.cpu_index.as_u32());
        (&raw mut (*rec).ready).write_volatile(0);
    }
    // Everything above must be in memory before the SIPI goes out.
    compiler_fence(Ordering::SeqCst);
}

/// Reads the record from the AP side.
///
/// # Safety
///
/// `phys` must be the identity-mapped handoff address this AP received.
#[must_use]
pub unsafe fn read(phys: u64) -> (CpuId, ApicId, u64) {
    let rec = phys as *const ApHandoff;
    // SAFETY: The BSP published the record before starting this AP.
    unsafe {
        debug_assert!((&raw const (*rec).magic).read_volatile() == HANDOFF_MAGIC);
        (
            CpuId::new((&raw const (*rec).cpu_index).read_volatile()),
            ApicId::new((&raw const (*rec).apic_id).read_volatile()),
            (&raw const (*rec).stack_top).read_volatile(),
        )
    }
}

/// AP-side: publishes `ready = 1` with a release fence, making every store
/// the AP performed during bring-up visible to the polling BSP first.
///
/// # Safety
///
/// Must be called exactly once per AP boot, after `mark_online`.
pub unsafe fn signal_ready() {
    fence(Ordering::Release);
    // SAFETY: The record is mapped and owned by this mid-boot AP.
    unsafe { (&raw mut (*record()).ready).write_volatile(1) };
}

/// BSP-side poll of the ready flag.
#[must_use]
pub fn is_ready() -> bool {
    // SAFETY: The record is mapped for the whole bring-up phase.
    let ready = unsafe { (&raw const (*record()).ready).read_volatile() };
    fence(Ordering::Acquire);
    ready == 1
}
