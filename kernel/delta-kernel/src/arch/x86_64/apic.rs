//! Local APIC access: EOI, IPIs, and the periodic timer.
//!
//! The LAPIC registers are memory-mapped at the base reported by
//! `IA32_APIC_BASE` and reached through the HHDM.

use core::sync::atomic::{AtomicU64, Ordering};

use delta_core::addr::PhysAddr;

use super::idt::{SPURIOUS_VECTOR, TIMER_VECTOR};
use super::instructions::{IA32_APIC_BASE, rdmsr, wrmsr};
use crate::mm::hhdm;

const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SVR: usize = 0xF0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_DIVIDE: usize = 0x3E0;
const REG_TPR: usize = 0x80;

/// ICR delivery mode: INIT.
const ICR_INIT: u32 = 0x500;
/// ICR delivery mode: STARTUP.
const ICR_STARTUP: u32 = 0x600;
/// ICR delivery mode: NMI.
const ICR_NMI: u32 = 0x400;
/// ICR level assert.
const ICR_ASSERT: u32 = 0x4000;
/// ICR destination shorthand: all excluding self.
const ICR_ALL_BUT_SELF: u32 = 0xC_0000;
/// ICR delivery status bit.
const ICR_PENDING: u32 = 0x1000;

/// LVT timer periodic mode.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// Virtual base of the LAPIC register window, set during [`init`].
static LAPIC_VIRT: AtomicU64 = AtomicU64::new(0);

fn reg(offset: usize) -> *mut u32 {
    let base = LAPIC_VIRT.load(Ordering::Acquire);
    debug_assert!(base != 0, "LAPIC used before init");
    (base as usize + offset) as *mut u32
}

fn read(offset: usize) -> u32 {
    // SAFETY: The register window was mapped during init; reads of defined
    // registers are side-effect free except where intended.
    unsafe { reg(offset).read_volatile() }
}

fn write(offset: usize, value: u32) {
    // SAFETY: As in `read`; the callers only touch defined registers.
    unsafe { reg(offset).write_volatile(value) }
}

/// Enables the calling CPU's local APIC and unmasks its timer.
///
/// The BSP resolves the MMIO base first; APs reuse it.
pub fn init() {
    if LAPIC_VIRT.load(Ordering::Acquire) == 0 {
        // SAFETY: IA32_APIC_BASE is architectural.
        let base = unsafe { rdmsr(IA32_APIC_BASE) };
        let phys = PhysAddr::new(base & 0xF_FFFF_F000);
        LAPIC_VIRT.store(hhdm::phys_to_virt(phys).as_u64(), Ordering::Release);
        // Ensure the APIC global enable bit is set.
        // SAFETY: Re-writing the architectural enable bit.
        unsafe { wrmsr(IA32_APIC_BASE, base | (1 << 11)) };
    }

    // Software-enable with the spurious vector.
    write(REG_SVR, 0x100 | SPURIOUS_VECTOR as u32);
    write(REG_TPR, 0);
}

/// Starts the periodic timer at roughly [`crate::time::TICK_HZ`].
///
/// The divider/initial-count pair assumes the usual QEMU/KVM bus clock; a
/// production boot calibrates against the PIT first.
pub fn start_timer() {
    write(REG_TIMER_DIVIDE, 0b0011); // divide by 16
    write(REG_LVT_TIMER, LVT_TIMER_PERIODIC | TIMER_VECTOR as u32);
    write(REG_TIMER_INITIAL, 62_500);
}

/// Signals end-of-interrupt for the current vector.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// The calling CPU's APIC id.
pub fn local_id() -> u32 {
    read(REG_ID) >> 24
}

fn wait_for_delivery() {
    while read(REG_ICR_LOW) & ICR_PENDING != 0 {
        core::hint::spin_loop();
    }
}

fn send_icr(apic_id: u32, low: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, low);
    wait_for_delivery();
}

/// Sends a fixed-vector IPI to `apic_id`.
pub fn send_ipi(apic_id: u32, vector: u8) {
    send_icr(apic_id, ICR_ASSERT | vector as u32);
}

/// Sends an INIT IPI to `apic_id` (AP bring-up, step one).
pub fn send_init(apic_id: u32) {
    send_icr(apic_id, ICR_INIT | ICR_ASSERT);
}

/// Sends a STARTUP IPI pointing at the real-mode trampoline page.
pub fn send_startup(apic_id: u32, trampoline_page: u8) {
    send_icr(apic_id, ICR_STARTUP | ICR_ASSERT | trampoline_page as u32);
}

/// Broadcasts an NMI to every other CPU (the panic halt).
pub fn broadcast_nmi() {
    if LAPIC_VIRT.load(Ordering::Acquire) == 0 {
        // Panic before APIC init: no other CPU is running yet.
        return;
    }
    write(REG_ICR_HIGH, 0);
    write(REG_ICR_LOW, ICR_ALL_BUT_SELF | ICR_NMI | ICR_ASSERT);
}
