//! Exception and interrupt entry stubs.
//!
//! Fault policy: any fault taken in kernel mode panics the faulting CPU
//! with a trap-frame dump. A page fault from user mode is forwarded to the
//! process layer through the installed user-fault callback and terminates
//! only the faulting task's process, never the kernel.

use core::sync::atomic::{AtomicPtr, Ordering};

use argon_core::addr::VirtAddr;
use argon_core::id::Pid;
use argon_core::kfatal;

use crate::config;
use crate::fpu;
use crate::time;

use super::dispatch;
use crate::arch::x86_64::idt;
use crate::arch::x86_64::ipi;

/// Stack frame pushed by the CPU on interrupt entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptStackFrame {
    /// Saved instruction pointer.
    pub rip: u64,
    /// Saved code segment.
    pub cs: u64,
    /// Saved RFLAGS.
    pub rflags: u64,
    /// Saved stack pointer.
    pub rsp: u64,
    /// Saved stack segment.
    pub ss: u64,
}

/// Callback for faults taken below the kernel boundary: `(owning process,
/// faulting address, error code)`. The process layer delivers a signal and
/// tears the task down.
pub type UserFaultHandler = fn(Pid, VirtAddr, u64);

fn default_user_fault(pid: Pid, addr: VirtAddr, code: u64) {
    // No process layer installed yet; treat like a kernel fault.
    panic!("user fault with no handler: pid={pid} addr={addr} err={code:#x}");
}

static USER_FAULT_FN: AtomicPtr<()> = AtomicPtr::new(default_user_fault as *mut ());

/// Installs the process layer's user-fault callback.
///
/// # Safety
///
/// `f` must be callable from exception context (no blocking, no
/// allocation).
pub unsafe fn set_user_fault_handler(f: UserFaultHandler) {
    USER_FAULT_FN.store(f as *mut (), Ordering::Release);
}

fn panic_with_frame(name: &str, frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    kfatal!(
        "CPU fault: {} rip={:#x} cs={:#x} rflags={:#x} rsp={:#x} err={:?}",
        name,
        frame.rip,
        frame.cs,
        frame.rflags,
        frame.rsp,
        error_code,
    );
    panic!("unrecoverable kernel-mode fault: {name}");
}

macro_rules! exception_stub {
    ($stub:ident, $name:literal) => {
        extern "x86-interrupt" fn $stub(frame: InterruptStackFrame) {
            panic_with_frame($name, &frame, None);
        }
    };
}

macro_rules! exception_stub_with_code {
    ($stub:ident, $name:literal) => {
        extern "x86-interrupt" fn $stub(frame: InterruptStackFrame, error_code: u64) {
            panic_with_frame($name, &frame, Some(error_code));
        }
    };
}

exception_stub!(divide_error, "divide error");
exception_stub!(debug_trap, "debug");
exception_stub!(nmi, "non-maskable interrupt");
exception_stub!(breakpoint, "breakpoint");
exception_stub!(overflow, "overflow");
exception_stub!(bound_range, "bound range exceeded");
exception_stub!(invalid_opcode, "invalid opcode");
exception_stub!(coprocessor_overrun, "coprocessor segment overrun");
exception_stub_with_code!(invalid_tss, "invalid TSS");
exception_stub_with_code!(segment_not_present, "segment not present");
exception_stub_with_code!(stack_segment, "stack-segment fault");
exception_stub_with_code!(general_protection, "general protection fault");
exception_stub!(x87_error, "x87 floating-point error");
exception_stub_with_code!(alignment_check, "alignment check");
exception_stub!(machine_check, "machine check");
exception_stub!(simd_error, "SIMD floating-point error");
exception_stub!(virtualization, "virtualization exception");

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error_code: u64) -> ! {
    panic_with_frame("double fault", &frame, Some(error_code));
}

/// `#NM`, the lazy-FPU trap. No EOI: exceptions are not APIC-delivered.
extern "x86-interrupt" fn device_not_available(_frame: InterruptStackFrame) {
    fpu::handle_device_not_available();
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error_code: u64) {
    let addr: u64;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) addr, options(nomem, nostack, preserves_flags));
    }

    if frame.cs & 3 == 3 {
        // Fault below the kernel boundary: signal the owning process.
        let task = argon_sched::current_task();
        let pid = if task.is_null() {
            Pid::KERNEL
        } else {
            // SAFETY: The faulting CPU's current task is live.
            unsafe { (*task).pid }
        };
        let ptr = USER_FAULT_FN.load(Ordering::Acquire);
        // SAFETY: Only valid `UserFaultHandler` pointers are stored.
        let f: UserFaultHandler = unsafe { core::mem::transmute(ptr) };
        f(pid, VirtAddr::new_truncate(addr), error_code);
        return;
    }

    kfatal!("page fault at {addr:#x}");
    panic_with_frame("page fault", &frame, Some(error_code));
}

macro_rules! ipi_stub {
    ($stub:ident, $vector:expr) => {
        extern "x86-interrupt" fn $stub(_frame: InterruptStackFrame) {
            dispatch::dispatch_interrupt($vector);
        }
    };
}

ipi_stub!(ping_stub, config::VEC_PING);
ipi_stub!(pong_stub, config::VEC_PONG);
ipi_stub!(counter_stub, config::VEC_COUNTER);
ipi_stub!(sched_kick_stub, config::VEC_SCHED_KICK);
ipi_stub!(tlb_stub, config::VEC_TLB);
ipi_stub!(timer_init_stub, config::VEC_TIMER_INIT);
ipi_stub!(timer_stub, config::VEC_TIMER);

/// Spurious interrupts are acknowledged by ignoring them; no EOI.
extern "x86-interrupt" fn spurious_stub(_frame: InterruptStackFrame) {}

/// Local APIC timer handler. The BSP owns the process-wide tick counter;
/// every CPU's timer signals its own scheduler preemption. Preemption
/// itself happens in the dispatch epilogue.
fn timer_handler(_vector: u8) {
    if argon_core::cpu::current_logical_index() == argon_core::id::CpuId::BSP {
        time::on_tick();
    } else {
        argon_sched::on_tick();
    }
    ipi::eoi();
}

/// Builds the IDT: exception gates, the lazy-FPU trap, and the reserved
/// vector stubs. BSP-only.
pub(in crate::arch) fn install() {
    idt::set_gate(0, divide_error as usize as u64);
    idt::set_gate(1, debug_trap as usize as u64);
    idt::set_gate(2, nmi as usize as u64);
    idt::set_gate(3, breakpoint as usize as u64);
    idt::set_gate(4, overflow as usize as u64);
    idt::set_gate(5, bound_range as usize as u64);
    idt::set_gate(6, invalid_opcode as usize as u64);
    idt::set_gate(7, device_not_available as usize as u64);
    idt::set_gate(8, double_fault as usize as u64);
    idt::set_gate(9, coprocessor_overrun as usize as u64);
    idt::set_gate(10, invalid_tss as usize as u64);
    idt::set_gate(11, segment_not_present as usize as u64);
    idt::set_gate(12, stack_segment as usize as u64);
    idt::set_gate(13, general_protection as usize as u64);
    idt::set_gate(14, page_fault as usize as u64);
    idt::set_gate(16, x87_error as usize as u64);
    idt::set_gate(17, alignment_check as usize as u64);
    idt::set_gate(18, machine_check as usize as u64);
    idt::set_gate(19, simd_error as usize as u64);
    idt::set_gate(20, virtualization as usize as u64);

    idt::set_gate(config::VEC_PING, ping_stub as usize as u64);
    idt::set_gate(config::VEC_PONG, pong_stub as usize as u64);
    idt::set_gate(config::VEC_COUNTER, counter_stub as usize as u64);
    idt::set_gate(config::VEC_SCHED_KICK, sched_kick_stub as usize as u64);
    idt::set_gate(config::VEC_TLB, tlb_stub as usize as u64);
    idt::set_gate(config::VEC_TIMER_INIT, timer_init_stub as usize as u64);
    idt::set_gate(config::VEC_TIMER, timer_stub as usize as u64);
    idt::set_gate(config::VEC_SPURIOUS, spurious_stub as usize as u64);

    dispatch::register_vector(config::VEC_TIMER, timer_handler)
        .expect("timer vector already bound");

    idt::finalize();
}
