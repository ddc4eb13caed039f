//! x86_64 architecture shim.
//!
//! Page-table structures and context layouts are plain data and compile
//! everywhere (the memory managers and their host tests depend on them).
//! Everything that touches CPU state is gated to the kernel target.

pub mod context;
pub mod paging;

#[cfg(target_os = "none")]
pub mod apic;
#[cfg(target_os = "none")]
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
#[cfg(target_os = "none")]
pub mod instructions;
#[cfg(target_os = "none")]
pub mod smp;
#[cfg(target_os = "none")]
pub mod syscall;

/// Early per-CPU initialization for the BSP: GDT, IDT, syscall MSRs, PAT.
///
/// Interrupts stay disabled; the boot sequence enables them after the
/// scheduler is running.
#[cfg(target_os = "none")]
pub fn cpu_init() {
    // SAFETY: Called once on the BSP before any other CPU state is used.
    unsafe {
        gdt::init_bsp();
        idt::init();
        crate::percpu::init_bsp_gs();
        syscall::init();
        instructions::init_pat();
    }
}
