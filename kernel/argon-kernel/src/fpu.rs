//! Lazy FPU/SSE/AVX state management.
//!
//! No task's FPU state is saved or restored eagerly. Every task switch
//! sets CR0.TS; the first FPU/SSE instruction a task then executes traps
//! `#NM`, and the handler migrates hardware state: save the previous
//! owner's registers into its task, restore (or first-time-initialize) the
//! new owner's. A task that never touches the FPU never pays for it.
//!
//! The save format is XSAVE when AVX is available, legacy FXSAVE
//! otherwise. A canonical zero-initial image is snapshotted once on the
//! BSP and used to seed every task's first use.
//!
//! Contract: kernel code executes no FPU/SSE/AVX instruction outside this
//! module's save/restore paths and the explicit YMM stress probe, which
//! brackets its register use with its own save/restore.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use argon_core::arch::x86_64::cpuid;
use argon_core::arch::x86_64::instructions::simd;
use argon_core::arch::x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags, Xcr0, Xcr0Flags};
use argon_core::cpu::{self, MAX_CPUS};
use argon_core::cpu_local::CpuLocal;
use argon_core::id::CpuId;
use argon_core::{kdebug, kwarn};
use argon_sched::Task;

use crate::config::{FXSAVE_AREA_SIZE, XSAVE_ALIGN, XSAVE_AREA_MAX};

static SSE_ENABLED: AtomicBool = AtomicBool::new(false);
static AVX_ENABLED: AtomicBool = AtomicBool::new(false);

/// Active save-area size (FXSAVE legacy size until CPUID says otherwise).
static STATE_SIZE: AtomicU32 = AtomicU32::new(FXSAVE_AREA_SIZE);

/// Active XSAVE feature mask.
static STATE_MASK: AtomicU64 =
    AtomicU64::new(Xcr0Flags::X87.bits() | Xcr0Flags::SSE.bits());

#[repr(C, align(64))]
struct InitialImage([u8; XSAVE_AREA_MAX as usize]);

/// The canonical zero-initial state, captured once right after `fninit`.
struct InitialState {
    ready: AtomicBool,
    image: UnsafeCell<InitialImage>,
}

// SAFETY: The image is written exactly once by the BSP before any AP (or
// task) can observe `ready == true`; afterwards it is read-only.
unsafe impl Sync for InitialState {}

static INITIAL: InitialState = InitialState {
    ready: AtomicBool::new(false),
    image: UnsafeCell::new(InitialImage([0; XSAVE_AREA_MAX as usize])),
};

/// Task whose state currently occupies each CPU's FPU (null = none).
static OWNER: CpuLocal<AtomicPtr<Task>> =
    CpuLocal::new([const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS]);

/// `#NM` trap counter per CPU.
static NM_HITS: CpuLocal<AtomicU64> = CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);

fn state_size() -> u32 {
    STATE_SIZE.load(Ordering::Relaxed)
}

fn state_mask() -> u64 {
    STATE_MASK.load(Ordering::Relaxed)
}

/// Saves the live register state into `area` in the active format.
fn save_state(area: *mut u8) {
    if AVX_ENABLED.load(Ordering::Relaxed) {
        // SAFETY: Callers pass areas sized/aligned by `ensure_task_state`
        // or the static initial image; the mask matches XCR0.
        unsafe { simd::xsave(area, state_mask()) };
    } else {
        // SAFETY: Same; the legacy area is 16-byte aligned by construction.
        unsafe { simd::fxsave(area) };
    }
}

/// Restores register state from `area` in the active format.
fn restore_state(area: *const u8) {
    if AVX_ENABLED.load(Ordering::Relaxed) {
        // SAFETY: As in `save_state`; the image was produced by it.
        unsafe { simd::xrstor(area, state_mask()) };
    } else {
        // SAFETY: Same.
        unsafe { simd::fxrstor(area) };
    }
}

/// Returns whether SSE (and therefore the lazy-FPU protocol) is active.
#[must_use]
pub fn is_sse_enabled() -> bool {
    SSE_ENABLED.load(Ordering::Acquire)
}

/// Returns whether AVX state is being managed.
#[must_use]
pub fn is_avx_enabled() -> bool {
    AVX_ENABLED.load(Ordering::Acquire)
}

/// Returns this CPU's `#NM` trap count.
#[must_use]
pub fn nm_hits(cpu: CpuId) -> u64 {
    NM_HITS.get_for(cpu).load(Ordering::Relaxed)
}

/// Per-CPU FPU bring-up: feature-test, set control bits, capture the
/// canonical initial image (once), reset ownership.
///
/// Fail-soft: returns `false` when FXSR/SSE are absent; the caller parks
/// the CPU rather than running tasks that might fault.
pub fn init_cpu(this_cpu: CpuId) -> bool {
    let leaf1 = cpuid::cpuid(1, 0);
    let has_fxsr = leaf1.edx & cpuid::FEAT_EDX_FXSR != 0;
    let has_sse = leaf1.edx & cpuid::FEAT_EDX_SSE != 0;
    if !has_fxsr || !has_sse {
        kwarn!("fpu: cpu {this_cpu} lacks FXSR/SSE, not starting");
        return false;
    }

    let has_xsave = leaf1.ecx & cpuid::FEAT_ECX_XSAVE != 0;
    let has_avx = leaf1.ecx & cpuid::FEAT_ECX_AVX != 0;
    let try_avx = has_xsave && has_avx && cpuid::max_basic_leaf() >= cpuid::XSAVE_LEAF;

    let mut cr0 = Cr0::read();
    cr0 |= Cr0Flags::MONITOR_COPROCESSOR.bits() | Cr0Flags::NUMERIC_ERROR.bits();
    cr0 &= !Cr0Flags::EMULATE_COPROCESSOR.bits();
    // SAFETY: Enabling native FPU operation with emulation off is the
    // architecturally supported configuration for FXSR-capable CPUs.
    unsafe { Cr0::write(cr0) };

    let mut cr4 = Cr4::read();
    cr4 |= Cr4Flags::OSFXSR.bits() | Cr4Flags::OSXMMEXCPT.bits();
    if try_avx {
        cr4 |= Cr4Flags::OSXSAVE.bits();
    }
    // SAFETY: All bits were verified supported via CPUID above.
    unsafe { Cr4::write(cr4) };

    if try_avx {
        // SAFETY: CR4.OSXSAVE was just set; x87/SSE/AVX support was
        // CPUID-verified.
        unsafe {
            let xcr0 = Xcr0::read()
                | Xcr0Flags::X87.bits()
                | Xcr0Flags::SSE.bits()
                | Xcr0Flags::AVX.bits();
            Xcr0::write(xcr0);
        }

        let xsave_size = cpuid::cpuid(cpuid::XSAVE_LEAF, 0).ebx;
        if xsave_size >= FXSAVE_AREA_SIZE && xsave_size <= XSAVE_AREA_MAX {
            STATE_SIZE.store(xsave_size, Ordering::Relaxed);
            // SAFETY: OSXSAVE is set.
            STATE_MASK.store(unsafe { Xcr0::read() }, Ordering::Relaxed);
            AVX_ENABLED.store(true, Ordering::Release);
        } else {
            // Unusable enumeration; drop back to SSE-only management.
            // SAFETY: Removing AVX from XCR0 is always accepted.
            unsafe {
                let fallback = (Xcr0::read() & !Xcr0Flags::AVX.bits())
                    | Xcr0Flags::X87.bits()
                    | Xcr0Flags::SSE.bits();
                Xcr0::write(fallback);
            }
            STATE_SIZE.store(FXSAVE_AREA_SIZE, Ordering::Relaxed);
            STATE_MASK.store(
                Xcr0Flags::X87.bits() | Xcr0Flags::SSE.bits(),
                Ordering::Relaxed,
            );
            AVX_ENABLED.store(false, Ordering::Release);
        }
    }

    Cr0::clear_task_switched();

    if !INITIAL.ready.load(Ordering::Acquire) {
        simd::fninit();
        // SAFETY: Only the BSP reaches this point with `ready` false; APs
        // start after the release store below.
        let image = unsafe { &mut *INITIAL.image.get() };
        image.0.fill(0);
        save_state(image.0.as_mut_ptr());
        INITIAL.ready.store(true, Ordering::Release);
    }

    OWNER
        .get_for(this_cpu)
        .store(ptr::null_mut(), Ordering::Release);
    NM_HITS.get_for(this_cpu).store(0, Ordering::Relaxed);
    SSE_ENABLED.store(true, Ordering::Release);

    kdebug!(
        "fpu: cpu {} up sse=on avx={} lazy=#NM state={}B mode={}",
        this_cpu,
        if is_avx_enabled() { "on" } else { "off" },
        state_size(),
        if is_avx_enabled() { "xsave" } else { "fxsave" },
    );
    true
}

/// Arms the lazy trap: the next FPU/SSE instruction on this CPU faults
/// `#NM`. Installed as the scheduler's task-switch hook.
pub fn on_task_switch() {
    if is_sse_enabled() {
        Cr0::set_task_switched();
    }
}

/// Executes one SSE (and, when managed, one AVX) instruction so the lazy
/// trap machinery is exercised at least once per CPU during bring-up.
pub fn lazy_probe() {
    if !is_sse_enabled() {
        return;
    }
    // SAFETY: SSE was enabled by `init_cpu` on this CPU.
    unsafe { simd::sse_probe() };
    if is_avx_enabled() {
        // SAFETY: AVX was enabled by `init_cpu` on this CPU.
        unsafe {
            simd::load_ymm0(&[0u8; 32]);
            simd::vzeroupper();
        }
    }
}

/// Releases hardware ownership when a task dies. Installed as the
/// scheduler's task-exit hook; runs on the CPU that ran the task.
pub fn on_task_exit(task: core::ptr::NonNull<Task>) {
    let owner = OWNER.get();
    if owner.load(Ordering::Acquire) == task.as_ptr() {
        owner.store(ptr::null_mut(), Ordering::Release);
    }
}

/// Ensures `task` has a usable save area: present, large enough for the
/// active format, 64-byte aligned. Allocates (or re-allocates) on demand.
///
/// The allocation is made with byte alignment and aligned by hand, so
/// teardown can free it without knowing the FPU manager's alignment.
fn ensure_task_state(task: &mut Task) -> bool {
    let needed = state_size();
    let aligned_ok = !task.fpu.state_ptr.is_null()
        && task.fpu.state_size >= needed
        && (task.fpu.state_ptr as usize) % XSAVE_ALIGN == 0;
    if aligned_ok {
        return true;
    }

    if !task.fpu.alloc_ptr.is_null() {
        // SAFETY: `alloc_ptr`/`alloc_size` describe a live allocation this
        // module made with byte alignment.
        unsafe {
            alloc::alloc::dealloc(
                task.fpu.alloc_ptr,
                Layout::from_size_align_unchecked(task.fpu.alloc_size, 1),
            );
        }
        task.fpu.alloc_ptr = ptr::null_mut();
        task.fpu.state_ptr = ptr::null_mut();
        task.fpu.state_size = 0;
        task.fpu.alloc_size = 0;
    }

    let alloc_size = needed as usize + XSAVE_ALIGN - 1;
    // SAFETY: Non-zero size, alignment 1.
    let raw = unsafe { alloc::alloc::alloc(Layout::from_size_align_unchecked(alloc_size, 1)) };
    if raw.is_null() {
        return false;
    }

    let aligned = ((raw as usize + XSAVE_ALIGN - 1) & !(XSAVE_ALIGN - 1)) as *mut u8;
    // SAFETY: `aligned` stays within the `alloc_size` allocation.
    unsafe { ptr::write_bytes(aligned, 0, needed as usize) };

    task.fpu.alloc_ptr = raw;
    task.fpu.alloc_size = alloc_size;
    task.fpu.state_ptr = aligned;
    task.fpu.state_size = needed;
    true
}

/// Saves the hardware state into `task`'s area, if it has a valid image.
fn save_task(task: &mut Task) {
    if !task.fpu.initialized {
        return;
    }
    if !ensure_task_state(task) {
        task.fpu.initialized = false;
        return;
    }
    save_state(task.fpu.state_ptr);
}

/// Restores `task`'s saved image into hardware.
fn restore_task(task: &mut Task) -> bool {
    if !task.fpu.initialized || !ensure_task_state(task) {
        task.fpu.initialized = false;
        return false;
    }
    restore_state(task.fpu.state_ptr);
    true
}

/// Loads the canonical initial image (or falls back to `fninit`).
fn restore_initial() {
    if INITIAL.ready.load(Ordering::Acquire) {
        // SAFETY: `ready` gates a write-once image; reads are race-free.
        let image = unsafe { &*INITIAL.image.get() };
        restore_state(image.0.as_ptr());
    } else {
        simd::fninit();
    }
}

/// The `#NM` (device-not-available) handler body. Wired to vector 7 by
/// the IDT; exceptions do not EOI.
pub fn handle_device_not_available() {
    if !is_sse_enabled() {
        return;
    }
    // TS must be cleared before any save/restore instruction below.
    Cr0::clear_task_switched();
    lazy_switch(
        cpu::current_logical_index(),
        argon_sched::current_task(),
    );
}

/// Ownership migration. Four cases:
///
/// 1. owner == current: first use after a switch back. TS is already
///    clear, nothing to migrate.
/// 2. owner != current with a live owner: save the owner, restore (or
///    first-initialize) current, transfer ownership.
/// 3. no owner, current uninitialized: allocate, seed from the canonical
///    image, take ownership.
/// 4. allocation failure anywhere: reinitialize the FPU and leave it
///    ownerless; the task keeps running with fresh state (best-effort).
fn lazy_switch(this_cpu: CpuId, current: *mut Task) {
    let owner_slot = OWNER.get_for(this_cpu);
    let owner = owner_slot.load(Ordering::Acquire);

    let Some(current) = core::ptr::NonNull::new(current) else {
        // Trap from dispatcher context: no task state to manage.
        simd::fninit();
        owner_slot.store(ptr::null_mut(), Ordering::Release);
        return;
    };

    if owner == current.as_ptr() {
        NM_HITS.get_for(this_cpu).fetch_add(1, Ordering::Relaxed);
        return;
    }

    if let Some(owner) = core::ptr::NonNull::new(owner) {
        // SAFETY: The previous owner last ran on this CPU and cannot run
        // elsewhere until its state is saved here.
        let owner = unsafe { &mut *owner.as_ptr() };
        if owner.fpu.initialized {
            save_task(owner);
        }
    }

    // SAFETY: `current` is this CPU's running task; the handler has
    // exclusive access to it.
    let cur = unsafe { &mut *current.as_ptr() };
    if cur.fpu.initialized {
        if !restore_task(cur) {
            simd::fninit();
            owner_slot.store(ptr::null_mut(), Ordering::Release);
            return;
        }
    } else {
        if !ensure_task_state(cur) {
            simd::fninit();
            owner_slot.store(ptr::null_mut(), Ordering::Release);
            return;
        }
        restore_initial();
        cur.fpu.initialized = true;
    }

    owner_slot.store(current.as_ptr(), Ordering::Release);
    NM_HITS.get_for(this_cpu).fetch_add(1, Ordering::Relaxed);
}

/// YMM save/restore stress probe.
///
/// Loads two distinct 256-bit patterns, XSAVEs each to scratch, restores
/// and verifies bit-exact readback, folding every byte into a rolling
/// signature. Deterministic per iteration count. Returns `None` when AVX
/// is unavailable, scratch allocation fails, or readback mismatches.
pub fn stress_ymm_local(iterations: u32) -> Option<u64> {
    if !is_sse_enabled() || !is_avx_enabled() {
        return None;
    }
    let iterations = iterations.max(1);
    let size = state_size() as usize;

    let layout = Layout::from_size_align(size, XSAVE_ALIGN).ok()?;
    // SAFETY: Non-zero, valid layout.
    let scratch_a = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if scratch_a.is_null() {
        return None;
    }
    // SAFETY: Same layout.
    let scratch_b = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if scratch_b.is_null() {
        // SAFETY: `scratch_a` came from this layout.
        unsafe { alloc::alloc::dealloc(scratch_a, layout) };
        return None;
    }

    let mut pattern_a = [0u8; 32];
    let mut pattern_b = [0u8; 32];
    let mut readback = [0u8; 32];
    let mut signature: u64 = 0;
    let mut ok = true;

    Cr0::clear_task_switched();

    let mask = state_mask();
    'iters: for iter in 0..iterations {
        for i in 0..32u32 {
            pattern_a[i as usize] = ((iter.wrapping_mul(13) + i * 7 + 0x11) & 0xFF) as u8;
            pattern_b[i as usize] = ((iter.wrapping_mul(17) + i * 3 + 0x5A) & 0xFF) as u8;
        }

        // SAFETY: AVX is enabled; scratch areas satisfy XSAVE size and
        // alignment for the active mask.
        unsafe {
            simd::load_ymm0(&pattern_a);
            simd::xsave(scratch_a, mask);
            simd::load_ymm0(&pattern_b);
            simd::xsave(scratch_b, mask);

            for (scratch, expected) in [(scratch_a, &pattern_a), (scratch_b, &pattern_b)] {
                simd::xrstor(scratch, mask);
                simd::store_ymm0(&mut readback);
                if readback != *expected {
                    ok = false;
                    break 'iters;
                }
                for byte in readback {
                    signature = (signature << 5) ^ (signature >> 2) ^ u64::from(byte);
                }
            }
        }
    }

    // SAFETY: AVX is enabled.
    unsafe { simd::vzeroupper() };
    Cr0::set_task_switched();

    // SAFETY: Both came from `layout` above.
    unsafe {
        alloc::alloc::dealloc(scratch_a, layout);
        alloc::alloc::dealloc(scratch_b, layout);
    }

    ok.then_some(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_sched::Affinity;
    use core::ptr::NonNull;
    use std::sync::{Mutex, MutexGuard};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn setup() -> MutexGuard<'static, ()> {
        let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        SSE_ENABLED.store(true, Ordering::Release);
        AVX_ENABLED.store(false, Ordering::Release);
        STATE_SIZE.store(FXSAVE_AREA_SIZE, Ordering::Relaxed);
        OWNER
            .get_for(CpuId::BSP)
            .store(ptr::null_mut(), Ordering::Release);
        guard
    }

    fn nop(_arg: *mut ()) {}

    fn mk_task() -> NonNull<Task> {
        Task::allocate(nop, ptr::null_mut(), Affinity::Any).unwrap()
    }

    fn free_task(task: NonNull<Task>) {
        // SAFETY: Test-owned, unqueued, not running.
        unsafe { Task::destroy(task) };
    }

    #[test]
    fn ensure_state_allocates_aligned_area() {
        let _guard = setup();
        let mut task = mk_task();
        // SAFETY: Exclusive test ownership.
        let t = unsafe { task.as_mut() };

        assert!(ensure_task_state(t));
        assert!(!t.fpu.state_ptr.is_null());
        assert_eq!(t.fpu.state_ptr as usize % XSAVE_ALIGN, 0);
        assert_eq!(t.fpu.state_size, FXSAVE_AREA_SIZE);
        assert!(!t.fpu.initialized);

        // Idempotent: a second call keeps the same area.
        let first = t.fpu.state_ptr;
        assert!(ensure_task_state(t));
        assert_eq!(t.fpu.state_ptr, first);

        free_task(task);
    }

    #[test]
    fn first_use_takes_ownership() {
        let _guard = setup();
        let mut task = mk_task();

        lazy_switch(CpuId::BSP, task.as_ptr());

        // SAFETY: Exclusive test ownership.
        let t = unsafe { task.as_mut() };
        assert!(t.fpu.initialized);
        assert_eq!(
            OWNER.get_for(CpuId::BSP).load(Ordering::Acquire),
            task.as_ptr()
        );

        free_task(task);
        OWNER
            .get_for(CpuId::BSP)
            .store(ptr::null_mut(), Ordering::Release);
    }

    #[test]
    fn repeat_owner_is_a_fast_path() {
        let _guard = setup();
        let task = mk_task();

        let hits_before = nm_hits(CpuId::BSP);
        lazy_switch(CpuId::BSP, task.as_ptr());
        let ptr_after_first = unsafe { task.as_ref() }.fpu.state_ptr;
        lazy_switch(CpuId::BSP, task.as_ptr());

        // Same owner: no reallocation, but the trap was counted.
        assert_eq!(unsafe { task.as_ref() }.fpu.state_ptr, ptr_after_first);
        assert_eq!(nm_hits(CpuId::BSP), hits_before + 2);

        free_task(task);
        OWNER
            .get_for(CpuId::BSP)
            .store(ptr::null_mut(), Ordering::Release);
    }

    #[test]
    fn switching_tasks_transfers_ownership() {
        let _guard = setup();
        let task_a = mk_task();
        let task_b = mk_task();

        lazy_switch(CpuId::BSP, task_a.as_ptr());
        lazy_switch(CpuId::BSP, task_b.as_ptr());

        // SAFETY: Exclusive test ownership.
        unsafe {
            assert!(task_a.as_ref().fpu.initialized);
            assert!(task_b.as_ref().fpu.initialized);
        }
        assert_eq!(
            OWNER.get_for(CpuId::BSP).load(Ordering::Acquire),
            task_b.as_ptr()
        );

        free_task(task_a);
        free_task(task_b);
        OWNER
            .get_for(CpuId::BSP)
            .store(ptr::null_mut(), Ordering::Release);
    }

    #[test]
    fn task_exit_clears_matching_owner_only() {
        let _guard = setup();
        let task_a = mk_task();
        let task_b = mk_task();

        lazy_switch(CpuId::BSP, task_a.as_ptr());
        // An unrelated task exiting must not disturb ownership.
        on_task_exit(task_b);
        assert_eq!(
            OWNER.get_for(CpuId::BSP).load(Ordering::Acquire),
            task_a.as_ptr()
        );

        on_task_exit(task_a);
        assert!(OWNER.get_for(CpuId::BSP).load(Ordering::Acquire).is_null());

        free_task(task_a);
        free_task(task_b);
    }

    #[test]
    fn dispatcher_trap_resets_ownership() {
        let _guard = setup();
        let task = mk_task();
        lazy_switch(CpuId::BSP, task.as_ptr());

        lazy_switch(CpuId::BSP, ptr::null_mut());
        assert!(OWNER.get_for(CpuId::BSP).load(Ordering::Acquire).is_null());

        free_task(task);
    }

    #[test]
    fn ymm_stress_requires_avx() {
        let _guard = setup();
        assert_eq!(stress_ymm_local(4), None);
    }
}
