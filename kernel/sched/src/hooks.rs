//! Arch-service injection.
//!
//! The kernel installs its IPI sender, FPU notification, task teardown,
//! and idle-time callbacks here during boot. Defaults are no-ops so the
//! scheduler is fully exercisable on the host.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use argon_core::id::CpuId;

use crate::task::Task;

/// Arch services consumed by the scheduler.
pub struct ArchHooks {
    /// Sends a scheduler-kick IPI to the given CPU. Returns `false` if the
    /// IPI could not be delivered (controller down, target offline).
    pub kick: fn(CpuId) -> bool,
    /// Invoked immediately before switching into a task. The lazy-FPU
    /// manager arms the `#NM` trap here.
    pub on_task_switch: fn(),
    /// Invoked after a task's entry function has returned, before the task
    /// and its stack are freed. The FPU manager releases hardware ownership
    /// here.
    pub on_task_exit: fn(NonNull<Task>),
    /// Invoked from the idle loop between drain attempts. The RCU engine
    /// reports quiescence here.
    pub on_idle: fn(),
}

fn no_kick(_cpu: CpuId) -> bool {
    false
}
fn no_notify() {}
fn no_task_exit(_task: NonNull<Task>) {}

/// Hooks used before the kernel installs its own.
static DEFAULT_HOOKS: ArchHooks = ArchHooks {
    kick: no_kick,
    on_task_switch: no_notify,
    on_task_exit: no_task_exit,
    on_idle: no_notify,
};

static HOOKS: AtomicPtr<ArchHooks> =
    AtomicPtr::new(core::ptr::from_ref(&DEFAULT_HOOKS).cast_mut());

/// Installs the kernel's arch hooks. Called once during boot, before any
/// AP enters the scheduler.
pub fn install(hooks: &'static ArchHooks) {
    HOOKS.store(core::ptr::from_ref(hooks).cast_mut(), Ordering::Release);
}

/// Returns the active hook table.
pub(crate) fn active() -> &'static ArchHooks {
    // SAFETY: Only `'static` references are ever stored.
    unsafe { &*HOOKS.load(Ordering::Acquire) }
}
