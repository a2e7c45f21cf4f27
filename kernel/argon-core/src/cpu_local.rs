//! CPU-local storage.
//!
//! Wraps a `[T; MAX_CPUS]` indexed by the current CPU's logical index.
//! Each CPU only writes its own slot; cross-CPU reads go through the
//! element's own atomics.

use crate::cpu::{self, MAX_CPUS};
use crate::id::CpuId;

/// CPU-local storage: one `T` per logical CPU slot.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    #[inline]
    pub fn get(&self) -> &T {
        &self.data[cpu::current_logical_index().as_usize()]
    }

    /// Returns a reference to a specific CPU's instance.
    #[inline]
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }

    /// Iterates over all slots with their logical indices.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.data
            .iter()
            .enumerate()
            .map(|(i, t)| (CpuId::new(i as u32), t))
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only mutates its own slot and cross-CPU reads use the
// element's own synchronization.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn get_for_is_per_slot() {
        static SLOTS: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
        SLOTS.get_for(CpuId::new(2)).store(7, Ordering::Relaxed);
        assert_eq!(SLOTS.get_for(CpuId::new(2)).load(Ordering::Relaxed), 7);
        assert_eq!(SLOTS.get_for(CpuId::new(3)).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn current_slot_resolves() {
        let local = CpuLocal::new([0u8; MAX_CPUS]);
        // On the host the current index resolves to the BSP slot.
        assert_eq!(*local.get(), 0);
    }
}
