//! Per-CPU data.
//!
//! Each CPU reaches its own [`PerCpu`] through the GS base register
//! (`GS:[0]` holds a self-pointer), so the scheduler hot path needs no
//! lock. [`CpuLocal`] gives static per-CPU storage indexed by the current
//! CPU id; host builds fall back to index 0.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 32;

/// Per-CPU data reached through the GS base.
///
/// `#[repr(C)]` keeps field offsets stable for the assembly entry stubs:
/// offset 0 is the self-pointer, offset 8 the kernel stack top for syscall
/// entry, offset 16 the saved user stack pointer.
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer for the `GS:[0]` access pattern.
    pub self_ptr: u64,
    /// Kernel stack top loaded on syscall entry (offset 8).
    pub kernel_rsp: u64,
    /// User stack pointer saved across a syscall (offset 16).
    pub user_rsp: u64,
    /// Logical CPU id (0 = BSP).
    pub cpu_id: AtomicU32,
    /// Hardware (local APIC) id.
    pub apic_id: AtomicU32,
    /// Set by an AP once it is fully online.
    pub started: AtomicBool,
}

impl PerCpu {
    /// Creates an uninitialized instance.
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            user_rsp: 0,
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU32::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Logical CPU id.
    pub fn id(&self) -> u32 {
        self.cpu_id.load(Ordering::Relaxed)
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Records the number of online CPUs (SMP bring-up).
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::Release);
}

/// Returns the current logical CPU id.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
pub fn current_cpu_id() -> u32 {
    current_cpu().id()
}

/// Host fallback: everything runs as CPU 0.
#[cfg(not(target_os = "none"))]
#[inline]
pub fn current_cpu_id() -> u32 {
    0
}

/// Returns the current CPU's [`PerCpu`].
///
/// Reads the self-pointer from `GS:[0]`, set during CPU init.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn current_cpu() -> &'static PerCpu {
    // SAFETY: GS:[0] holds the self-pointer installed by init_bsp_gs /
    // AP bring-up before any caller can run.
    unsafe {
        let ptr: u64;
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const PerCpu)
    }
}

/// CPU-local storage: one `T` per possible CPU, indexed by the current id.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Wraps a per-CPU array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns the current CPU's instance.
    pub fn get(&self) -> &T {
        &self.data[current_cpu_id() as usize]
    }

    /// Returns a specific CPU's instance.
    pub fn get_for(&self, cpu: u32) -> &T {
        &self.data[cpu as usize]
    }
}

// SAFETY: Each CPU accesses only its own slot in the hot path; cross-CPU
// access happens through interior synchronization of T.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}

// ---------------------------------------------------------------------------
// GS base initialization (BSP; APs run the same steps in smp.rs)
// ---------------------------------------------------------------------------

/// BSP per-CPU data.
#[cfg(target_os = "none")]
static mut BSP_PERCPU: PerCpu = PerCpu::new();

/// Points GS base (and KERNEL_GS_BASE) at the BSP's [`PerCpu`].
///
/// # Safety
///
/// Must run once on the BSP, after GDT init and before anything reads
/// per-CPU state.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub unsafe fn init_bsp_gs() {
    use crate::arch::x86_64::instructions::{IA32_GS_BASE, IA32_KERNEL_GS_BASE, wrmsr};

    let addr = core::ptr::addr_of_mut!(BSP_PERCPU) as u64;
    // SAFETY: BSP_PERCPU is a static; writing its self-pointer and the MSRs
    // before other CPUs exist is race-free.
    unsafe {
        (*core::ptr::addr_of_mut!(BSP_PERCPU)).self_ptr = addr;
        wrmsr(IA32_GS_BASE, addr);
        wrmsr(IA32_KERNEL_GS_BASE, addr);
    }
}

/// Installs GS base for an AP's heap-allocated [`PerCpu`].
///
/// # Safety
///
/// `percpu` must point to a leaked, fully initialized instance; must run on
/// the AP itself after its GDT is loaded.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub unsafe fn install_ap_gs(percpu: *mut PerCpu) {
    use crate::arch::x86_64::instructions::{IA32_GS_BASE, IA32_KERNEL_GS_BASE, wrmsr};

    // SAFETY: Caller guarantees the pointer is valid and leaked.
    unsafe {
        (*percpu).self_ptr = percpu as u64;
        wrmsr(IA32_GS_BASE, percpu as u64);
        wrmsr(IA32_KERNEL_GS_BASE, percpu as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_runs_as_cpu0() {
        assert_eq!(current_cpu_id(), 0);
    }

    #[test]
    fn cpu_local_indexes_by_id() {
        static SLOTS: CpuLocal<AtomicU32> =
            CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);
        SLOTS.get().store(7, Ordering::Relaxed);
        assert_eq!(SLOTS.get_for(0).load(Ordering::Relaxed), 7);
        assert_eq!(SLOTS.get_for(1).load(Ordering::Relaxed), 0);
    }
}
