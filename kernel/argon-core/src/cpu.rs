//! CPU identity table.
//!
//! Ground truth for which CPUs exist, their physical (APIC) identifiers,
//! and which are online. One [`CpuRecord`] per logical slot plus a dense
//! APIC→logical map sized for the full physical-ID space.
//!
//! Ownership discipline: a record is mutated only by its owning CPU, except
//! `online` and the acknowledgement generations, which the owner
//! release-stores and remote CPUs acquire-load. Publication of
//! `online = true` therefore happens-before any remote observation of the
//! record's counters.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::addr::VirtAddr;
use crate::id::{ApicId, CpuId};

/// Maximum number of logical CPU slots.
pub const MAX_CPUS: usize = 256;

/// Size of the APIC→logical map (the largest physical-ID space we accept).
pub const APIC_ID_MAP_SIZE: usize = 1024;

/// Sentinel for an unassigned APIC id in a record.
const INVALID_APIC: u32 = u32::MAX;

/// Per-CPU bookkeeping record.
///
/// Counter fields are plain atomics bumped by their owning CPU's interrupt
/// handlers and read by remote validators.
pub struct CpuRecord {
    apic_id: AtomicU32,
    online: AtomicBool,
    kstack_top: AtomicU64,
    /// PING IPIs received.
    pub ping_count: AtomicU32,
    /// PONG replies successfully sent back to the BSP.
    pub pong_sent_count: AtomicU32,
    /// Scheduler-kick IPIs received.
    pub sched_kick_count: AtomicU64,
    /// TLB-shootdown IPIs received.
    pub tlb_ipi_count: AtomicU64,
    /// Highest shootdown generation this CPU has acknowledged.
    pub tlb_ack_generation: AtomicU64,
    /// Successful local-timer starts.
    pub timer_start_count: AtomicU32,
    /// Failed local-timer starts.
    pub timer_start_fail_count: AtomicU32,
}

impl CpuRecord {
    const fn new() -> Self {
        Self {
            apic_id: AtomicU32::new(INVALID_APIC),
            online: AtomicBool::new(false),
            kstack_top: AtomicU64::new(0),
            ping_count: AtomicU32::new(0),
            pong_sent_count: AtomicU32::new(0),
            sched_kick_count: AtomicU64::new(0),
            tlb_ipi_count: AtomicU64::new(0),
            tlb_ack_generation: AtomicU64::new(0),
            timer_start_count: AtomicU32::new(0),
            timer_start_fail_count: AtomicU32::new(0),
        }
    }

    /// Returns this CPU's APIC id, if registered.
    pub fn apic_id(&self) -> Option<ApicId> {
        let raw = self.apic_id.load(Ordering::Acquire);
        (raw != INVALID_APIC).then(|| ApicId::new(raw))
    }

    /// Returns whether this CPU has been marked online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Returns the kernel stack top recorded for this CPU.
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::new_truncate(self.kstack_top.load(Ordering::Relaxed))
    }
}

/// The CPU identity table: records plus the APIC→logical map.
pub struct CpuTable {
    records: [CpuRecord; MAX_CPUS],
    /// APIC id → logical index, or −1 for unassigned.
    apic_to_cpu: [AtomicI32; APIC_ID_MAP_SIZE],
    online_count: AtomicU32,
}

impl CpuTable {
    /// Creates an empty table (all slots offline and unmapped).
    #[must_use]
    pub const fn new() -> Self {
        const REC: CpuRecord = CpuRecord::new();
        const UNMAPPED: AtomicI32 = AtomicI32::new(-1);
        Self {
            records: [REC; MAX_CPUS],
            apic_to_cpu: [UNMAPPED; APIC_ID_MAP_SIZE],
            online_count: AtomicU32::new(0),
        }
    }

    /// Binds a logical index to a physical APIC id.
    ///
    /// Called by the BSP for itself and for each AP before that AP is
    /// started. Assignments are monotone within a boot: rebinding a slot to
    /// a *different* APIC id, or an APIC id to a different slot, is a fatal
    /// kernel bug.
    ///
    /// # Panics
    ///
    /// On out-of-range ids or a conflicting prior assignment.
    pub fn register(&self, index: CpuId, apic_id: ApicId) {
        let rec = &self.records[index.as_usize()];
        assert!(
            apic_id.as_usize() < APIC_ID_MAP_SIZE,
            "cpu {index}: apic id {apic_id} outside identity map"
        );

        let prev = rec
            .apic_id
            .compare_exchange(
                INVALID_APIC,
                apic_id.as_u32(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|prev| prev);
        assert!(
            prev == INVALID_APIC || prev == apic_id.as_u32(),
            "cpu {index}: already bound to apic {prev}, rebind to {apic_id}"
        );

        let slot = &self.apic_to_cpu[apic_id.as_usize()];
        let prev_slot = slot
            .compare_exchange(
                -1,
                index.as_u32() as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|prev| prev);
        assert!(
            prev_slot == -1 || prev_slot == index.as_u32() as i32,
            "apic {apic_id}: already mapped to cpu {prev_slot}, remap to {index}"
        );
    }

    /// Marks a registered CPU online. Called exactly once per CPU per boot:
    /// by the BSP for itself during init, by each AP from its own entry
    /// path once its per-CPU hardware is ready.
    ///
    /// # Panics
    ///
    /// If the slot was never registered or is already online.
    pub fn mark_online(&self, index: CpuId) {
        let rec = &self.records[index.as_usize()];
        assert!(
            rec.apic_id.load(Ordering::Acquire) != INVALID_APIC,
            "cpu {index}: mark_online before register"
        );
        let was_online = rec.online.swap(true, Ordering::AcqRel);
        assert!(!was_online, "cpu {index}: marked online twice");
        self.online_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Records the kernel stack top for a CPU slot.
    pub fn set_kernel_stack_top(&self, index: CpuId, top: VirtAddr) {
        self.records[index.as_usize()]
            .kstack_top
            .store(top.as_u64(), Ordering::Relaxed);
    }

    /// Maps a physical APIC id to its logical index.
    ///
    /// Returns `None` for ids outside the map or not (yet) assigned;
    /// callers must treat that as "not a known CPU".
    #[must_use]
    pub fn logical_from_apic(&self, apic_id: ApicId) -> Option<CpuId> {
        if apic_id.as_usize() >= APIC_ID_MAP_SIZE {
            return None;
        }
        let raw = self.apic_to_cpu[apic_id.as_usize()].load(Ordering::Acquire);
        if raw < 0 || raw as usize >= MAX_CPUS {
            return None;
        }
        Some(CpuId::new(raw as u32))
    }

    /// Maps a logical index to its physical APIC id.
    #[must_use]
    pub fn apic_from_logical(&self, index: CpuId) -> Option<ApicId> {
        self.records.get(index.as_usize())?.apic_id()
    }

    /// Returns the record for a logical index.
    #[must_use]
    pub fn record(&self, index: CpuId) -> Option<&CpuRecord> {
        self.records.get(index.as_usize())
    }

    /// Returns the record owning a physical APIC id.
    #[must_use]
    pub fn record_for_apic(&self, apic_id: ApicId) -> Option<&CpuRecord> {
        self.record(self.logical_from_apic(apic_id)?)
    }

    /// Returns whether the given logical CPU is online.
    #[must_use]
    pub fn is_online(&self, index: CpuId) -> bool {
        self.record(index).is_some_and(CpuRecord::is_online)
    }

    /// Returns whether the CPU owning `apic_id` is online.
    #[must_use]
    pub fn is_apic_online(&self, apic_id: ApicId) -> bool {
        self.record_for_apic(apic_id)
            .is_some_and(CpuRecord::is_online)
    }

    /// Returns the number of online CPUs.
    #[must_use]
    pub fn online_count(&self) -> u32 {
        self.online_count.load(Ordering::Acquire)
    }

    /// Iterates over the logical indices of all online CPUs.
    pub fn online_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.is_online())
            .map(|(i, _)| CpuId::new(i as u32))
    }
}

impl Default for CpuTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-global identity table.
static CPUS: CpuTable = CpuTable::new();

/// Returns the kernel-global identity table.
#[must_use]
pub fn table() -> &'static CpuTable {
    &CPUS
}

fn no_apic_id() -> ApicId {
    ApicId::new(0)
}

/// Reader for the local interrupt controller's id, installed by the arch
/// layer once the Local APIC is mapped.
static LOCAL_APIC_ID_FN: AtomicPtr<()> = AtomicPtr::new(no_apic_id as *mut ());

/// Installs the local-APIC-id reader used by [`current_logical_index`].
///
/// # Safety
///
/// `f` must be callable from any context, including interrupt handlers.
pub unsafe fn set_local_apic_id_fn(f: fn() -> ApicId) {
    LOCAL_APIC_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the logical index of the executing CPU.
///
/// Reads the local interrupt-controller id and maps it through the identity
/// table. During very early boot, before the map is populated (or before
/// the reader is installed), this returns the BSP's index.
#[must_use]
pub fn current_logical_index() -> CpuId {
    let ptr = LOCAL_APIC_ID_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn() -> ApicId` pointers are ever stored.
    let f: fn() -> ApicId = unsafe { core::mem::transmute(ptr) };
    table().logical_from_apic(f()).unwrap_or(CpuId::BSP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_roundtrip() {
        let table = CpuTable::new();
        table.register(CpuId::new(0), ApicId::new(0));
        table.register(CpuId::new(1), ApicId::new(4));

        assert_eq!(table.apic_from_logical(CpuId::new(1)), Some(ApicId::new(4)));
        assert_eq!(table.logical_from_apic(ApicId::new(4)), Some(CpuId::new(1)));
        // Both directions agree for every registered CPU.
        for idx in [0u32, 1] {
            let cpu = CpuId::new(idx);
            let apic = table.apic_from_logical(cpu).unwrap();
            assert_eq!(table.logical_from_apic(apic), Some(cpu));
        }
    }

    #[test]
    fn out_of_range_apic_is_unknown() {
        let table = CpuTable::new();
        assert_eq!(
            table.logical_from_apic(ApicId::new(APIC_ID_MAP_SIZE as u32)),
            None
        );
        assert!(!table.is_apic_online(ApicId::new(u32::MAX)));
    }

    #[test]
    fn online_transitions_and_count() {
        let table = CpuTable::new();
        table.register(CpuId::new(0), ApicId::new(0));
        table.register(CpuId::new(1), ApicId::new(2));
        assert_eq!(table.online_count(), 0);
        assert!(!table.is_online(CpuId::new(1)));

        table.mark_online(CpuId::new(0));
        table.mark_online(CpuId::new(1));
        assert_eq!(table.online_count(), 2);
        assert!(table.is_apic_online(ApicId::new(2)));
        assert_eq!(table.online_cpus().count(), 2);
    }

    #[test]
    #[should_panic(expected = "marked online twice")]
    fn double_online_panics() {
        let table = CpuTable::new();
        table.register(CpuId::new(0), ApicId::new(0));
        table.mark_online(CpuId::new(0));
        table.mark_online(CpuId::new(0));
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn conflicting_rebind_panics() {
        let table = CpuTable::new();
        table.register(CpuId::new(1), ApicId::new(3));
        table.register(CpuId::new(1), ApicId::new(5));
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn duplicate_apic_assignment_panics() {
        let table = CpuTable::new();
        table.register(CpuId::new(1), ApicId::new(3));
        table.register(CpuId::new(2), ApicId::new(3));
    }

    #[test]
    fn register_is_idempotent_for_same_pair() {
        let table = CpuTable::new();
        table.register(CpuId::new(1), ApicId::new(3));
        table.register(CpuId::new(1), ApicId::new(3));
        assert_eq!(table.logical_from_apic(ApicId::new(3)), Some(CpuId::new(1)));
    }

    #[test]
    fn early_boot_current_index_is_bsp() {
        // No reader installed and nothing mapped in the global table slot 0
        // for APIC 0 in this test binary, so the fallback must be the BSP.
        assert_eq!(current_logical_index(), CpuId::BSP);
    }
}
