//! Synchronization primitives.
//!
//! Two lock types cover the core's needs: [`SpinLock`] for data never
//! touched from interrupt context, and [`IrqSpinLock`] for data shared with
//! interrupt handlers (it saves and disables the interrupt flag for the
//! duration of the critical section).

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
