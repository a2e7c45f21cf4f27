//! Kernel task objects.
//!
//! A task is a unit of schedulable work: an entry function, an opaque
//! argument, an owned kernel stack, and the saved context needed to resume
//! it. Tasks are created when work is scheduled and destroyed when their
//! entry function returns. Allocation failures are reported to the caller,
//! never panicked on.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use argon_core::addr::PhysAddr;
use argon_core::arch::x86_64::registers::control::Cr3;
use argon_core::id::{CpuId, Pid};

use crate::context::TaskContext;

/// Entry function of a scheduled work item.
pub type WorkFn = fn(arg: *mut ());

/// Size of a task's kernel stack.
pub const TASK_STACK_SIZE: usize = 16 * 1024;

/// Stack alignment (ABI requirement).
const TASK_STACK_ALIGN: usize = 16;

/// A task's permission to run on a specific CPU, or on any CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Runnable on every online CPU.
    Any,
    /// Pinned to one logical CPU; never enqueued on, stolen by, or
    /// migrated to any other.
    Pinned(CpuId),
}

impl Affinity {
    /// Returns `true` if this affinity admits execution on `cpu`.
    #[must_use]
    pub fn admits(self, cpu: CpuId) -> bool {
        match self {
            Self::Any => true,
            Self::Pinned(only) => only == cpu,
        }
    }
}

/// Lazy-FPU bookkeeping embedded in each task, owned by the FPU manager.
///
/// Touched only from the `#NM` handler and task teardown on the CPU the
/// task occupies, so plain fields suffice.
#[derive(Debug)]
pub struct FpuArea {
    /// 64-byte-aligned save-area pointer, or null before first FPU use.
    pub state_ptr: *mut u8,
    /// Raw allocation backing `state_ptr` (freed on task teardown).
    pub alloc_ptr: *mut u8,
    /// Bytes allocated at `alloc_ptr`.
    pub alloc_size: usize,
    /// Usable size of the save area.
    pub state_size: u32,
    /// Whether the save area holds a valid image.
    pub initialized: bool,
}

impl FpuArea {
    const fn empty() -> Self {
        Self {
            state_ptr: ptr::null_mut(),
            alloc_ptr: ptr::null_mut(),
            alloc_size: 0,
            state_size: 0,
            initialized: false,
        }
    }
}

/// A kernel task.
pub struct Task {
    /// Saved context while the task is not running.
    pub context: TaskContext,
    /// Entry function.
    pub entry: WorkFn,
    /// Opaque argument passed to `entry`.
    pub arg: *mut (),
    /// Page-table root the task runs under.
    pub page_table_root: PhysAddr,
    /// Owning process (kernel work belongs to [`Pid::KERNEL`]).
    pub pid: Pid,
    /// CPU affinity.
    pub affinity: Affinity,
    /// Lazy-FPU state, managed by the FPU manager.
    pub fpu: FpuArea,
    /// Base of the owned stack allocation.
    stack_base: *mut u8,
    /// Intrusive run-queue link. Only touched under the owning queue lock.
    pub(crate) queue_next: *mut Task,
    /// Debug guard for the "at most one queue" invariant.
    pub(crate) in_queue: bool,
}

impl Task {
    /// Allocates a task and its stack.
    ///
    /// Returns `None` if either allocation fails; partial allocations are
    /// released. The context is left unseeded; the scheduler seeds it when
    /// the task first runs on the target, and the host test build executes
    /// the entry inline instead.
    #[must_use]
    pub fn allocate(entry: WorkFn, arg: *mut (), affinity: Affinity) -> Option<NonNull<Task>> {
        let stack_layout = Self::stack_layout();
        // SAFETY: The layout has non-zero size and valid alignment.
        let stack_base = unsafe { alloc::alloc::alloc(stack_layout) };
        if stack_base.is_null() {
            return None;
        }

        let task_layout = Layout::new::<Task>();
        // SAFETY: The layout has non-zero size and valid alignment.
        let raw = unsafe { alloc::alloc::alloc(task_layout) }.cast::<Task>();
        let Some(task) = NonNull::new(raw) else {
            // SAFETY: `stack_base` was just allocated with `stack_layout`.
            unsafe { alloc::alloc::dealloc(stack_base, stack_layout) };
            return None;
        };

        // SAFETY: `task` is a fresh, properly aligned allocation.
        unsafe {
            task.write(Task {
                context: TaskContext::new(),
                entry,
                arg,
                page_table_root: Cr3::read(),
                pid: Pid::KERNEL,
                affinity,
                fpu: FpuArea::empty(),
                stack_base,
                queue_next: ptr::null_mut(),
                in_queue: false,
            });
        }
        Some(task)
    }

    /// Returns the 16-byte-aligned top of this task's stack.
    #[must_use]
    pub fn stack_top(&self) -> u64 {
        let top = self.stack_base as u64 + TASK_STACK_SIZE as u64;
        top & !(TASK_STACK_ALIGN as u64 - 1)
    }

    const fn stack_layout() -> Layout {
        match Layout::from_size_align(TASK_STACK_SIZE, TASK_STACK_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid task stack layout"),
        }
    }

    /// Frees a task, its stack, and any FPU save area.
    ///
    /// # Safety
    ///
    /// `task` must have come from [`Task::allocate`], must not be in any
    /// run queue, and must not be the caller's own execution context.
    pub unsafe fn destroy(task: NonNull<Task>) {
        // SAFETY: Per the caller contract the pointer is live and exclusive.
        let t = unsafe { task.as_ref() };
        debug_assert!(!t.in_queue, "destroying a queued task");

        if !t.fpu.alloc_ptr.is_null() {
            // SAFETY: The FPU manager allocated `alloc_size` bytes with
            // byte alignment; teardown owns the area now.
            unsafe {
                alloc::alloc::dealloc(
                    t.fpu.alloc_ptr,
                    Layout::from_size_align_unchecked(t.fpu.alloc_size, 1),
                );
            }
        }

        let stack_base = t.stack_base;
        // SAFETY: `stack_base` was allocated with `stack_layout()`; the
        // task itself with `Layout::new::<Task>()`. Nothing references
        // either after this point.
        unsafe {
            alloc::alloc::dealloc(stack_base, Self::stack_layout());
            alloc::alloc::dealloc(task.as_ptr().cast::<u8>(), Layout::new::<Task>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_admission() {
        assert!(Affinity::Any.admits(CpuId::new(3)));
        assert!(Affinity::Pinned(CpuId::new(2)).admits(CpuId::new(2)));
        assert!(!Affinity::Pinned(CpuId::new(2)).admits(CpuId::new(1)));
    }

    fn nop(_arg: *mut ()) {}

    #[test]
    fn allocate_and_destroy() {
        let task = Task::allocate(nop, ptr::null_mut(), Affinity::Any).unwrap();
        // SAFETY: Freshly allocated, not queued, not running.
        let top = unsafe { task.as_ref() }.stack_top();
        assert_eq!(top % 16, 0);
        // SAFETY: Same.
        unsafe { Task::destroy(task) };
    }
}
