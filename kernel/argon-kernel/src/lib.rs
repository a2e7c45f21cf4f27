//! The argon kernel core.
//!
//! Multiprocessor bring-up and the machinery that keeps multi-core
//! operation correct: the IPI substrate, TLB shootdown, the lazy-FPU/XSAVE
//! manager, the RCU grace-period engine, and the glue binding them to the
//! scheduler in `argon-sched` and the identity table in `argon-core`.
//!
//! The core is a library: it consumes a page allocator and mapper through
//! [`mm`], a periodic tick through [`time::on_tick`], and a global heap
//! from the embedding kernel, and it exposes its operations to the syscall
//! layer through [`services`]. Device drivers, file systems, and the
//! boot-loader protocol live outside.
//!
//! Modules above the `arch` boundary are pure protocol logic and are
//! host-testable; `arch` requires the kernel target.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

// ── Always-available modules (pure logic, host-testable) ─────────────────

pub mod config;
pub mod error;
pub mod fpu;
pub mod mm;
pub mod rcu;
pub mod services;
pub mod time;
pub mod tlb;

// ── Kernel-runtime modules (require target_os = "none") ──────────────────

#[cfg(target_os = "none")]
pub mod arch;

#[cfg(test)]
pub(crate) mod test_util {
    //! Shared host-test scaffolding: one topology init for the whole test
    //! binary (the identity table forbids double-online).

    use argon_core::cpu;
    use argon_core::id::{ApicId, CpuId};
    use std::sync::Once;

    /// Brings logical CPUs 0..=3 online with APIC ids 0..=3.
    pub fn init_topology() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            for i in 0..4u32 {
                cpu::table().register(CpuId::new(i), ApicId::new(i));
                cpu::table().mark_online(CpuId::new(i));
            }
        });
    }
}
