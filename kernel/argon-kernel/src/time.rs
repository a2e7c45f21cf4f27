//! Boot-relative tick counter.
//!
//! An external timer source calls [`on_tick`] at a fixed frequency; the
//! core does not mandate which (PIT, HPET, or the local-APIC timer). The
//! counter feeds the RCU synchronize bound and log timestamps; the
//! scheduler's preemption signal rides along.

use core::sync::atomic::{AtomicU64, Ordering};

/// Process-wide tick counter.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Returns the number of ticks since boot.
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Advances the tick counter and signals the scheduler.
///
/// Called from the timer interrupt handler on the CPU that owns the tick
/// source, and from each AP's local-timer handler.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::AcqRel);
    argon_sched::on_tick();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance() {
        let before = ticks();
        on_tick();
        on_tick();
        assert!(ticks() >= before + 2);
    }
}
