//! Memory-subsystem contract.
//!
//! The core does not own physical or virtual memory management; the
//! embedding kernel installs its allocator and mapper here once during
//! boot. Task stacks and RCU callback nodes go through the global heap
//! (also provided by the embedding kernel); this contract covers the page
//! granularity operations the bring-up path needs.

use core::sync::atomic::{AtomicPtr, Ordering};

use argon_core::addr::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    /// Mapping attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        /// Writable mapping.
        const WRITABLE = 1 << 0;
        /// Accessible from user mode.
        const USER = 1 << 1;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 2;
        /// Caching disabled.
        const NO_CACHE = 1 << 3;
        /// Not executable.
        const NO_EXECUTE = 1 << 4;
    }
}

/// The operations the core consumes from the memory subsystem.
pub struct MemoryOps {
    /// Allocates one physical page.
    pub alloc_page: fn() -> Option<PhysAddr>,
    /// Maps `virt` to `phys` with the given flags. Returns `false` if the
    /// mapping could not be established.
    pub map_page: fn(VirtAddr, PhysAddr, PageFlags) -> bool,
    /// Removes the mapping for `virt`.
    pub unmap_page: fn(VirtAddr),
    /// Translates a virtual address, if mapped.
    pub virt_to_phys: fn(VirtAddr) -> Option<PhysAddr>,
}

fn no_alloc() -> Option<PhysAddr> {
    None
}
fn no_map(_virt: VirtAddr, _phys: PhysAddr, _flags: PageFlags) -> bool {
    false
}
fn no_unmap(_virt: VirtAddr) {}
fn no_translate(_virt: VirtAddr) -> Option<PhysAddr> {
    None
}

static DEFAULT_OPS: MemoryOps = MemoryOps {
    alloc_page: no_alloc,
    map_page: no_map,
    unmap_page: no_unmap,
    virt_to_phys: no_translate,
};

static OPS: AtomicPtr<MemoryOps> = AtomicPtr::new(core::ptr::from_ref(&DEFAULT_OPS).cast_mut());

/// Installs the memory subsystem. Called once during boot, before SMP
/// bring-up.
pub fn install(ops: &'static MemoryOps) {
    OPS.store(core::ptr::from_ref(ops).cast_mut(), Ordering::Release);
}

fn active() -> &'static MemoryOps {
    // SAFETY: Only `'static` references are ever stored.
    unsafe { &*OPS.load(Ordering::Acquire) }
}

/// Allocates one physical page.
#[must_use]
pub fn alloc_page() -> Option<PhysAddr> {
    (active().alloc_page)()
}

/// Maps `virt` to `phys` with the given flags.
#[must_use]
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> bool {
    (active().map_page)(virt, phys, flags)
}

/// Removes the mapping for `virt`.
pub fn unmap_page(virt: VirtAddr) {
    (active().unmap_page)(virt);
}

/// Translates a virtual address, if mapped.
#[must_use]
pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
    (active().virt_to_phys)(virt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_refuse_everything() {
        assert!(alloc_page().is_none());
        assert!(!map_page(
            VirtAddr::new(0x7000),
            PhysAddr::new(0x7000),
            PageFlags::WRITABLE
        ));
        assert!(virt_to_phys(VirtAddr::new(0x7000)).is_none());
    }
}
