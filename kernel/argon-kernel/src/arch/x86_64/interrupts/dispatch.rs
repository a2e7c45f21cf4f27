//! Interrupt vector registry.
//!
//! A static table binding each hardware vector (32–255) to exactly one
//! handler. The reserved IPI vectors are bound once during SMP init and
//! the table is immutable afterwards. Handlers run with interrupts
//! disabled, must not block, and must issue EOI before returning.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Handler function signature: receives the vector number.
pub type InterruptHandler = fn(u8);

/// One atomic function pointer per vector; null = unregistered.
static HANDLERS: [AtomicPtr<()>; 256] = {
    const INIT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [INIT; 256]
};

/// Error type for vector registration.
#[derive(Debug)]
pub enum InterruptError {
    /// Vector is below the hardware range (0–31 are exceptions).
    InvalidVector,
    /// A handler is already bound to this vector.
    AlreadyRegistered,
}

impl fmt::Display for InterruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidVector => write!(f, "vector outside valid range 32-255"),
            Self::AlreadyRegistered => write!(f, "handler already registered for this vector"),
        }
    }
}

/// Binds `handler` to `vector` (32–255). Each vector is bound exactly
/// once per boot.
pub fn register_vector(vector: u8, handler: InterruptHandler) -> Result<(), InterruptError> {
    if vector < 32 {
        return Err(InterruptError::InvalidVector);
    }

    HANDLERS[vector as usize]
        .compare_exchange(
            core::ptr::null_mut(),
            handler as *mut (),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map(|_| ())
        .map_err(|_| InterruptError::AlreadyRegistered)
}

/// Common dispatch called by the hardware interrupt stubs.
///
/// Invokes the registered handler (which EOIs), then gives the scheduler
/// its preemption point: a pending kick or tick takes effect here, on the
/// way out of the interrupt.
pub(in crate::arch) fn dispatch_interrupt(vector: u8) {
    let ptr = HANDLERS[vector as usize].load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: Only valid `InterruptHandler` pointers are registered.
        let handler: InterruptHandler = unsafe { core::mem::transmute(ptr) };
        handler(vector);
    }

    argon_sched::preempt_point();
}
