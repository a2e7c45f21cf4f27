//! Scheduler operations: enqueue, balance, steal, dispatch, preemption.
//!
//! Each CPU owns a run queue, a dispatcher context, and a current-task
//! slot. Tasks are dispatched from the per-CPU dispatcher (the boot
//! context on the BSP, the idle loop on APs): `run_next_work` switches
//! into a task, and the task switches back when it yields or exits.
//!
//! Locking: a run queue's `IrqSpinLock` is held only for O(1) queue work
//! (enqueue, dequeue head, peek head). Migration is atomic: a task is
//! removed under the victim's lock and inserted under the thief's lock,
//! with the lock releases/acquires providing the happens-before edge.

use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use argon_core::arch::x86_64::instructions::interrupts;
use argon_core::cpu::{self, MAX_CPUS};
use argon_core::cpu_local::CpuLocal;
use argon_core::id::CpuId;
use argon_core::sync::IrqSpinLock;

use crate::context::TaskContext;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use crate::context::switch_context;
use crate::hooks;
use crate::preempt;
use crate::queue::RunQueue;
use crate::task::{Affinity, Task, WorkFn};

/// Per-CPU ready queues.
static RUN_QUEUES: CpuLocal<IrqSpinLock<RunQueue>> =
    CpuLocal::new([const { IrqSpinLock::new(RunQueue::new()) }; MAX_CPUS]);

/// Lock-free queue-depth mirrors for snapshot reads and balance decisions.
static QUEUE_DEPTH: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

/// The task currently executing on each CPU (null in dispatcher context).
static CURRENT: CpuLocal<AtomicPtr<Task>> =
    CpuLocal::new([const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS]);

/// A task that switched away and must be requeued by the dispatcher once
/// its context save is complete. Requeueing after the switch closes the
/// window where another CPU could steal a task whose registers are still
/// being written out.
static PENDING_REQUEUE: CpuLocal<AtomicPtr<Task>> =
    CpuLocal::new([const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS]);

/// A task that exited and must be freed by the dispatcher (a task cannot
/// free the stack it is standing on).
static PENDING_FREE: CpuLocal<AtomicPtr<Task>> =
    CpuLocal::new([const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS]);

/// Per-CPU dispatcher context. Only the owning CPU touches its slot.
struct DispatchSlot(UnsafeCell<TaskContext>);

// SAFETY: Each CPU only accesses its own slot, single-threaded by
// construction.
unsafe impl Sync for DispatchSlot {}

static DISPATCH_CTX: CpuLocal<DispatchSlot> =
    CpuLocal::new([const { DispatchSlot(UnsafeCell::new(TaskContext::new())) }; MAX_CPUS]);

/// Kernel-global balance toggles. Writes are release-stored, reads relaxed.
static PUSH_BALANCE: AtomicBool = AtomicBool::new(true);
static WORK_STEALING: AtomicBool = AtomicBool::new(true);

/// Enables or disables push-balance at enqueue time (kernel-global).
pub fn set_push_balance(enabled: bool) {
    PUSH_BALANCE.store(enabled, Ordering::Release);
}

/// Returns whether push-balance is enabled.
#[must_use]
pub fn is_push_balance_enabled() -> bool {
    PUSH_BALANCE.load(Ordering::Relaxed)
}

/// Enables or disables idle-time work stealing (kernel-global).
pub fn set_work_stealing(enabled: bool) {
    WORK_STEALING.store(enabled, Ordering::Release);
}

/// Returns whether work stealing is enabled.
#[must_use]
pub fn is_work_stealing_enabled() -> bool {
    WORK_STEALING.load(Ordering::Relaxed)
}

/// Initializes the calling CPU's scheduler state.
///
/// Called once per CPU during bring-up, before that CPU runs any task.
pub fn init_cpu(cpu: CpuId) {
    preempt::reset(cpu);
    CURRENT.get_for(cpu).store(ptr::null_mut(), Ordering::Release);
    PENDING_REQUEUE
        .get_for(cpu)
        .store(ptr::null_mut(), Ordering::Release);
    PENDING_FREE
        .get_for(cpu)
        .store(ptr::null_mut(), Ordering::Release);
}

/// Returns the task currently running on the calling CPU, or null from
/// dispatcher/idle context. Consumed by the `#NM` handler.
#[must_use]
pub fn current_task() -> *mut Task {
    CURRENT.get().load(Ordering::Acquire)
}

/// Enqueues `task` at the tail of `cpu`'s run queue.
fn enqueue(cpu: CpuId, task: NonNull<Task>) {
    // SAFETY: The task is not yet visible to any queue; reading its
    // affinity is race-free.
    let affinity = unsafe { task.as_ref() }.affinity;
    assert!(
        affinity.admits(cpu),
        "task pinned elsewhere enqueued on cpu {cpu}"
    );

    let mut rq = RUN_QUEUES.get_for(cpu).lock();
    rq.push_back(task);
    QUEUE_DEPTH.get_for(cpu).store(rq.len(), Ordering::Release);
}

/// Dequeues the head of `cpu`'s run queue.
fn dequeue(cpu: CpuId) -> Option<NonNull<Task>> {
    let mut rq = RUN_QUEUES.get_for(cpu).lock();
    let task = rq.pop_front();
    QUEUE_DEPTH.get_for(cpu).store(rq.len(), Ordering::Release);
    task
}

/// Picks the push-balance target for work entering `local`'s queue.
///
/// Chooses the online CPU whose queue is shorter than the local one by at
/// least two, preferring the smallest depth and breaking depth ties toward
/// the smallest logical index. Falls back to `local`.
fn pick_push_target(local: CpuId) -> CpuId {
    let local_depth = QUEUE_DEPTH.get_for(local).load(Ordering::Relaxed);
    let mut best = local;
    let mut best_depth = local_depth;

    for candidate in cpu::table().online_cpus() {
        if candidate == local {
            continue;
        }
        let depth = QUEUE_DEPTH.get_for(candidate).load(Ordering::Relaxed);
        if local_depth >= depth + 2 && depth < best_depth {
            best = candidate;
            best_depth = depth;
        }
    }
    best
}

/// Enqueues work at the tail of the caller's run queue. When push-balance
/// is enabled and a remote queue is shorter by at least two, the work goes
/// to that remote CPU instead, followed by a scheduler-kick IPI.
///
/// Returns `false` on out-of-memory; the caller decides whether to retry.
pub fn schedule(entry: WorkFn, arg: *mut ()) -> bool {
    let Some(task) = Task::allocate(entry, arg, Affinity::Any) else {
        return false;
    };

    let local = cpu::current_logical_index();
    let target = if is_push_balance_enabled() {
        pick_push_target(local)
    } else {
        local
    };

    enqueue(target, task);
    if target != local {
        (hooks::active().kick)(target);
    }
    true
}

/// Enqueues work pinned to `cpu` and kicks that CPU.
///
/// Returns `false` if the target is offline (no queue is touched) or on
/// out-of-memory.
pub fn schedule_on(cpu: CpuId, entry: WorkFn, arg: *mut ()) -> bool {
    if !cpu::table().is_online(cpu) {
        return false;
    }
    let Some(task) = Task::allocate(entry, arg, Affinity::Pinned(cpu)) else {
        return false;
    };

    enqueue(cpu, task);
    if cpu != cpu::current_logical_index() {
        (hooks::active().kick)(cpu);
    }
    true
}

/// Snapshot of the calling CPU's run-queue depth. Not linearizable.
#[must_use]
pub fn runqueue_depth() -> u32 {
    QUEUE_DEPTH.get().load(Ordering::Relaxed)
}

/// Snapshot of a specific CPU's run-queue depth. Not linearizable.
#[must_use]
pub fn runqueue_depth_cpu(cpu: CpuId) -> u32 {
    QUEUE_DEPTH.get_for(cpu).load(Ordering::Relaxed)
}

/// Snapshot of the total queued work across all CPUs. Not linearizable.
#[must_use]
pub fn runqueue_depth_total() -> u32 {
    (0..MAX_CPUS as u32)
        .map(|i| QUEUE_DEPTH.get_for(CpuId::new(i)).load(Ordering::Relaxed))
        .sum()
}

/// Pops and executes one task from the local queue.
///
/// Returns `false` if the queue was empty. Must be called from dispatcher
/// context (the boot drain loop or the idle loop), never from inside a
/// task.
pub fn run_next_work() -> bool {
    let local = cpu::current_logical_index();
    let Some(task) = dequeue(local) else {
        return false;
    };
    dispatch(task);
    true
}

/// Attempts to steal one task for the calling CPU.
///
/// Victim selection: the online CPU with the deepest queue, ties broken
/// toward the smallest logical index. The attempt fails (taking nothing)
/// if the victim's queue emptied in the meantime, its lock is contended,
/// or its head task is pinned to another CPU. At most one task moves per
/// attempt.
pub fn try_steal() -> bool {
    let local = cpu::current_logical_index();
    let mut victim: Option<CpuId> = None;
    let mut victim_depth = 0;

    for candidate in cpu::table().online_cpus() {
        if candidate == local {
            continue;
        }
        let depth = QUEUE_DEPTH.get_for(candidate).load(Ordering::Relaxed);
        if depth > victim_depth {
            victim = Some(candidate);
            victim_depth = depth;
        }
    }
    let Some(victim) = victim else {
        return false;
    };

    let stolen = {
        // try_lock: never spin on a queue its owner is working.
        let Some(mut rq) = RUN_QUEUES.get_for(victim).try_lock() else {
            return false;
        };
        match rq.head_affinity() {
            Some(affinity) if affinity.admits(local) => {
                let task = rq.pop_front();
                QUEUE_DEPTH.get_for(victim).store(rq.len(), Ordering::Release);
                task
            }
            _ => None,
        }
    };

    match stolen {
        Some(task) => {
            enqueue(local, task);
            true
        }
        None => false,
    }
}

/// Called from the timer interrupt. Signals a reschedule on return from
/// interrupt when the local CPU is preemptible.
pub fn on_tick() {
    if preempt::preemptible() {
        preempt::set_need_resched();
    }
}

/// Preemption point, invoked by the interrupt epilogue after EOI.
///
/// Yields the current task if a reschedule was signalled, preemption is
/// not inhibited, and a task (not the dispatcher) was interrupted.
pub fn preempt_point() {
    if !preempt::preemptible() {
        return;
    }
    if current_task().is_null() {
        // Dispatcher or idle context: its own loop re-checks the queue.
        preempt::take_need_resched();
        return;
    }
    if preempt::take_need_resched() {
        yield_now();
    }
}

// ── Dispatch: kernel target ─────────────────────────────────────────────

/// Switches into `task` and returns once it yields or exits.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn dispatch(task: NonNull<Task>) {
    let saved = interrupts::save_and_disable();
    let local = cpu::current_logical_index();
    let task_ptr = task.as_ptr();

    {
        // SAFETY: The task came off a run queue; this CPU owns it
        // exclusively.
        let t = unsafe { &mut *task_ptr };
        if t.context.rsp == 0 {
            // First run: aim the context at the entry trampoline.
            // SAFETY: `stack_top` is the aligned top of the task's own
            // stack.
            unsafe { t.context.seed(t.stack_top(), task_entry_trampoline) };
        }
        if t.page_table_root != argon_core::arch::x86_64::registers::control::Cr3::read() {
            // SAFETY: The task's root was captured from a live address
            // space that maps the kernel.
            unsafe { argon_core::arch::x86_64::registers::control::Cr3::write(t.page_table_root) };
        }
    }

    CURRENT.get_for(local).store(task_ptr, Ordering::Release);
    (hooks::active().on_task_switch)();

    let dispatch_ctx = DISPATCH_CTX.get_for(local).0.get();
    // SAFETY: Interrupts are disabled; the dispatcher context is owned by
    // this CPU and the task context was seeded or saved by a prior switch.
    unsafe { switch_context(dispatch_ctx, &raw const (*task_ptr).context) };

    // The task yielded or exited and control is back on the dispatcher
    // stack. Finish whatever the departing task could not do for itself.
    CURRENT.get_for(local).store(ptr::null_mut(), Ordering::Release);
    service_pending(local);
    interrupts::restore(saved);
}

/// First-run entry: every freshly seeded task context "returns" here.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" fn task_entry_trampoline() -> ! {
    let task = current_task();
    debug_assert!(!task.is_null());
    // SAFETY: The dispatcher stored a live task pointer before switching.
    let (entry, arg) = unsafe { ((*task).entry, (*task).arg) };

    // Tasks run with interrupts enabled; the dispatcher switched in with
    // them disabled.
    // SAFETY: IDT and LAPIC are fully configured before any task runs.
    unsafe { interrupts::enable() };

    entry(arg);
    exit_current();
}

/// Terminates the calling task. Its entry function returned (or the task
/// chose to stop); the task and its stack are freed by the dispatcher.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn exit_current() -> ! {
    interrupts::disable();
    let local = cpu::current_logical_index();
    let task = CURRENT.get_for(local).load(Ordering::Acquire);
    debug_assert!(!task.is_null(), "exit_current from dispatcher context");

    PENDING_FREE.get_for(local).store(task, Ordering::Release);
    let dispatch_ctx = DISPATCH_CTX.get_for(local).0.get();
    // SAFETY: The dying task's context is a valid scratch save target; the
    // dispatcher context was saved by the matching dispatch call.
    unsafe { switch_context(&raw mut (*task).context, dispatch_ctx) };
    unreachable!("freed task was resumed");
}

/// Suspends the calling task and re-enters the dispatcher, which requeues
/// it at the local tail and picks the next runnable task. No-op from
/// dispatcher context.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn yield_now() {
    let local = cpu::current_logical_index();
    let task = CURRENT.get_for(local).load(Ordering::Acquire);
    if task.is_null() {
        return;
    }

    let saved = interrupts::save_and_disable();
    PENDING_REQUEUE.get_for(local).store(task, Ordering::Release);
    let dispatch_ctx = DISPATCH_CTX.get_for(local).0.get();
    // SAFETY: Interrupts are disabled; both contexts belong to this CPU.
    unsafe { switch_context(&raw mut (*task).context, dispatch_ctx) };
    // Resumed by a later dispatch on this task's owning queue.
    interrupts::restore(saved);
}

// ── Dispatch: host fallback ─────────────────────────────────────────────
//
// A user process cannot switch kernel stacks, so the host build executes
// tasks inline on the caller's stack. Yielding is a no-op and exit is the
// normal return path; all queueing, balance, and steal logic above is
// identical to the target build.

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn dispatch(task: NonNull<Task>) {
    let local = cpu::current_logical_index();
    // SAFETY: The task came off a run queue; this CPU owns it exclusively.
    let (entry, arg) = {
        let t = unsafe { task.as_ref() };
        (t.entry, t.arg)
    };

    CURRENT.get_for(local).store(task.as_ptr(), Ordering::Release);
    (hooks::active().on_task_switch)();
    entry(arg);
    CURRENT.get_for(local).store(ptr::null_mut(), Ordering::Release);

    (hooks::active().on_task_exit)(task);
    // SAFETY: The task finished and is in no queue.
    unsafe { Task::destroy(task) };
    service_pending(local);
}

/// Host stand-in for [`yield_now`]: inline execution cannot suspend.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn yield_now() {}

/// Host stand-in for [`exit_current`]; unreachable off-target because the
/// inline dispatcher handles task teardown itself.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn exit_current() -> ! {
    unreachable!("exit_current is only reachable on the kernel target");
}

/// Requeues a yielded task and frees an exited one, on behalf of contexts
/// that could not do it themselves.
fn service_pending(local: CpuId) {
    let freed = PENDING_FREE
        .get_for(local)
        .swap(ptr::null_mut(), Ordering::AcqRel);
    if let Some(task) = NonNull::new(freed) {
        (hooks::active().on_task_exit)(task);
        // SAFETY: The task exited, is unqueued, and nothing else holds it.
        unsafe { Task::destroy(task) };
    }

    let requeue = PENDING_REQUEUE
        .get_for(local)
        .swap(ptr::null_mut(), Ordering::AcqRel);
    if let Some(task) = NonNull::new(requeue) {
        enqueue(local, task);
    }
}

/// The per-CPU idle loop: drain local work, report quiescence, steal if
/// enabled, otherwise halt until the next interrupt. Spurious wake-ups
/// simply re-run the loop.
pub fn idle_loop() -> ! {
    loop {
        while run_next_work() {}

        (hooks::active().on_idle)();

        if is_work_stealing_enabled() && try_steal() {
            continue;
        }

        // Close the wake-up race: with interrupts disabled, re-check for
        // work, then sleep atomically via sti;hlt if there is none.
        interrupts::disable();
        if runqueue_depth() == 0 && !preempt::take_need_resched() {
            // SAFETY: Interrupt infrastructure is up before any CPU idles.
            unsafe { interrupts::enable_and_hlt() };
        } else {
            // SAFETY: Same.
            unsafe { interrupts::enable() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_core::id::ApicId;
    use core::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, MutexGuard, Once};

    /// Scheduler state is global; serialize tests touching it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn lock_sched() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Brings logical CPUs 0..=3 online (APIC ids 0,1,2,3) once per test
    /// binary.
    fn init_topology() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            for i in 0..4u32 {
                cpu::table().register(CpuId::new(i), ApicId::new(i));
                cpu::table().mark_online(CpuId::new(i));
            }
        });
    }

    /// Empties every queue, destroying the drained tasks.
    fn drain_all() {
        for i in 0..MAX_CPUS as u32 {
            while let Some(task) = dequeue(CpuId::new(i)) {
                // SAFETY: Test owns the drained task exclusively.
                unsafe { Task::destroy(task) };
            }
        }
    }

    static EXECUTED: AtomicUsize = AtomicUsize::new(0);

    fn bump(_arg: *mut ()) {
        EXECUTED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn run_next_work_on_empty_queue() {
        let _guard = lock_sched();
        init_topology();
        drain_all();
        assert!(!run_next_work());
    }

    #[test]
    fn schedule_then_run_executes() {
        let _guard = lock_sched();
        init_topology();
        drain_all();
        set_push_balance(false);

        let before = EXECUTED.load(Ordering::SeqCst);
        assert!(schedule(bump, ptr::null_mut()));
        assert_eq!(runqueue_depth(), 1);
        assert!(run_next_work());
        assert_eq!(EXECUTED.load(Ordering::SeqCst), before + 1);
        assert_eq!(runqueue_depth(), 0);

        set_push_balance(true);
    }

    #[test]
    fn schedule_on_offline_cpu_fails_cleanly() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        let offline = CpuId::new(200);
        let total_before = runqueue_depth_total();
        assert!(!schedule_on(offline, bump, ptr::null_mut()));
        assert_eq!(runqueue_depth_total(), total_before);
        assert_eq!(runqueue_depth_cpu(offline), 0);
    }

    #[test]
    fn schedule_on_pins_to_target_queue() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        assert!(schedule_on(CpuId::new(2), bump, ptr::null_mut()));
        assert_eq!(runqueue_depth_cpu(CpuId::new(2)), 1);
        assert_eq!(runqueue_depth_cpu(CpuId::new(0)), 0);

        let head = RUN_QUEUES.get_for(CpuId::new(2)).lock().head_affinity();
        assert_eq!(head, Some(Affinity::Pinned(CpuId::new(2))));
        drain_all();
    }

    #[test]
    fn push_balance_prefers_shortest_then_smallest_index() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        // Local (cpu 0) is 3 deep, cpu 1 is 1 deep, cpus 2 and 3 empty:
        // the target must be cpu 2 (smallest depth, smallest index on tie).
        for _ in 0..3 {
            assert!(schedule_on(CpuId::new(0), bump, ptr::null_mut()));
        }
        assert!(schedule_on(CpuId::new(1), bump, ptr::null_mut()));
        assert_eq!(pick_push_target(CpuId::new(0)), CpuId::new(2));

        // With only a 1-task local queue, nothing is ≥2 shorter.
        drain_all();
        assert!(schedule_on(CpuId::new(0), bump, ptr::null_mut()));
        assert_eq!(pick_push_target(CpuId::new(0)), CpuId::new(0));
        drain_all();
    }

    #[test]
    fn steal_takes_from_deepest_admissible_victim() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        // Put two unpinned tasks on cpu 3 by hand (enqueue directly so
        // affinity stays Any).
        for _ in 0..2 {
            let task = Task::allocate(bump, ptr::null_mut(), Affinity::Any).unwrap();
            enqueue(CpuId::new(3), task);
        }
        assert!(try_steal());
        assert_eq!(runqueue_depth_cpu(CpuId::new(0)), 1);
        assert_eq!(runqueue_depth_cpu(CpuId::new(3)), 1);

        // The stolen task still runs.
        let before = EXECUTED.load(Ordering::SeqCst);
        assert!(run_next_work());
        assert_eq!(EXECUTED.load(Ordering::SeqCst), before + 1);
        drain_all();
    }

    #[test]
    fn steal_refuses_pinned_head() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        assert!(schedule_on(CpuId::new(1), bump, ptr::null_mut()));
        assert!(!try_steal());
        assert_eq!(runqueue_depth_cpu(CpuId::new(1)), 1);
        assert_eq!(runqueue_depth_cpu(CpuId::new(0)), 0);
        drain_all();
    }

    #[test]
    fn depth_total_sums_all_queues() {
        let _guard = lock_sched();
        init_topology();
        drain_all();

        assert!(schedule_on(CpuId::new(1), bump, ptr::null_mut()));
        assert!(schedule_on(CpuId::new(2), bump, ptr::null_mut()));
        assert_eq!(runqueue_depth_total(), 2);
        drain_all();
        assert_eq!(runqueue_depth_total(), 0);
    }

    #[test]
    fn tick_signals_resched_only_when_preemptible() {
        let _guard = lock_sched();
        init_topology();

        preempt::take_need_resched();
        preempt::disable();
        on_tick();
        assert!(!preempt::take_need_resched());
        preempt::enable();

        on_tick();
        assert!(preempt::take_need_resched());
    }
}
