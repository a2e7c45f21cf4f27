//! Local APIC driver.
//!
//! MMIO access to the per-CPU interrupt controller: identification, EOI,
//! fixed IPIs with bounded delivery waits, the INIT/STARTUP sequence for
//! AP bring-up, and the local timer.

use core::sync::atomic::{AtomicU64, Ordering};

use argon_core::addr::VirtAddr;
use argon_core::arch::x86_64::registers::model_specific::{APIC_BASE_ENABLE, IA32_APIC_BASE};
use argon_core::id::ApicId;

use crate::config::ICR_DELIVERY_TIMEOUT_LOOPS;

// Register offsets.
const REG_ID: u64 = 0x020;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SVR: u64 = 0x0F0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// ICR delivery-status bit (send pending).
const ICR_PENDING: u32 = 1 << 12;
/// ICR delivery mode: INIT.
const ICR_MODE_INIT: u32 = 0b101 << 8;
/// ICR delivery mode: STARTUP.
const ICR_MODE_STARTUP: u32 = 0b110 << 8;
/// ICR level-assert bit.
const ICR_LEVEL_ASSERT: u32 = 1 << 14;

/// LVT timer periodic-mode bit.
const TIMER_PERIODIC: u32 = 1 << 17;
/// LVT mask bit.
const TIMER_MASKED: u32 = 1 << 16;

/// Virtual base of the LAPIC MMIO window; zero until mapped.
static LAPIC_VIRT: AtomicU64 = AtomicU64::new(0);

/// Records the LAPIC mapping and hardware-enables the controller on the
/// calling CPU.
///
/// # Safety
///
/// `virt_base` must map the LAPIC MMIO region (at least 4 KiB,
/// cache-disabled).
pub unsafe fn init_base(virt_base: VirtAddr) {
    LAPIC_VIRT.store(virt_base.as_u64(), Ordering::Release);
    // SAFETY: Caller guarantees the mapping; we only re-write the base the
    // hardware already reports, plus the global-enable bit.
    unsafe {
        let base = IA32_APIC_BASE.read();
        IA32_APIC_BASE.write(base | APIC_BASE_ENABLE);
    }
}

/// Returns a driver handle once [`init_base`] has run.
#[must_use]
pub fn get() -> Option<LocalApic> {
    let base = LAPIC_VIRT.load(Ordering::Acquire);
    (base != 0).then(|| LocalApic { base })
}

/// Returns the executing CPU's APIC id, or id 0 before the LAPIC is
/// mapped (only the BSP runs that early).
#[must_use]
pub fn current_apic_id() -> ApicId {
    get().map_or(ApicId::new(0), |lapic| lapic.id())
}

/// Handle to the executing CPU's Local APIC.
pub struct LocalApic {
    base: u64,
}

impl LocalApic {
    fn read(&self, offset: u64) -> u32 {
        // SAFETY: `base` maps the LAPIC window; all offsets used are
        // architectural registers.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: u64, value: u32) {
        // SAFETY: Same as `read`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) };
    }

    /// Returns this CPU's APIC id.
    #[must_use]
    pub fn id(&self) -> ApicId {
        ApicId::new(self.read(REG_ID) >> 24)
    }

    /// Software-enables the APIC with the given spurious vector and opens
    /// the task-priority gate.
    pub fn enable(&self, spurious_vector: u8) {
        self.write(REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
        self.write(REG_TPR, 0);
    }

    /// Signals end-of-interrupt.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Waits for a previous IPI to leave the ICR, bounded.
    fn wait_delivery(&self) -> bool {
        for _ in 0..ICR_DELIVERY_TIMEOUT_LOOPS {
            if self.read(REG_ICR_LOW) & ICR_PENDING == 0 {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }

    fn write_icr(&self, target: ApicId, low: u32) -> bool {
        self.write(REG_ICR_HIGH, u32::from(target.as_u8()) << 24);
        self.write(REG_ICR_LOW, low);
        self.wait_delivery()
    }

    /// Sends a fixed-delivery IPI. Returns `false` if the hardware send
    /// could not be serialized within the bounded spin.
    pub fn send_ipi(&self, target: ApicId, vector: u8) -> bool {
        self.write_icr(target, u32::from(vector))
    }

    /// Sends the INIT IPI that resets an AP into wait-for-SIPI state.
    pub fn send_init(&self, target: ApicId) -> bool {
        self.write_icr(target, ICR_MODE_INIT | ICR_LEVEL_ASSERT)
    }

    /// Sends a STARTUP IPI; `vector` encodes the trampoline page frame.
    pub fn send_sipi(&self, target: ApicId, vector: u8) -> bool {
        self.write_icr(target, ICR_MODE_STARTUP | u32::from(vector))
    }

    /// Starts the local timer in periodic mode.
    pub fn start_timer_periodic(&self, vector: u8, initial_count: u32, divide: u8) {
        self.write(REG_TIMER_DIVIDE, divide_config(divide));
        self.write(REG_LVT_TIMER, TIMER_PERIODIC | u32::from(vector));
        self.write(REG_TIMER_INITIAL, initial_count);
    }

    /// Stops the local timer by masking its LVT entry.
    pub fn stop_timer(&self) {
        self.write(REG_LVT_TIMER, TIMER_MASKED);
    }
}

/// Converts a power-of-two divide value to the divide-configuration
/// register encoding.
fn divide_config(divide: u8) -> u32 {
    match divide {
        1 => 0b1011,
        2 => 0b0000,
        4 => 0b0001,
        8 => 0b0010,
        16 => 0b0011,
        32 => 0b1000,
        64 => 0b1001,
        128 => 0b1010,
        _ => 0b0011, // Default to divide by 16.
    }
}
