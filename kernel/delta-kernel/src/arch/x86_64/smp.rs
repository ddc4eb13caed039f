//! SMP bring-up: INIT/STARTUP bootstrap of application processors.
//!
//! The BSP copies a real-mode trampoline to a fixed low physical page,
//! fills the handoff block with the AP's stack, the kernel CR3, and the
//! 64-bit entry point, then sends INIT followed by two STARTUP IPIs and
//! polls the AP's started flag for up to a second. Each AP climbs from
//! real mode into long mode inside the trampoline, then finishes its setup
//! in Rust: GDT/TSS, the shared IDT, GS-based per-CPU data, its LAPIC, and
//! finally the scheduler's idle loop.

use alloc::boxed::Box;
use alloc::vec;
use core::sync::atomic::{AtomicU32, Ordering};

use delta_core::addr::PhysAddr;
use delta_core::{kinfo, kwarn};

use super::{apic, gdt, idt, instructions};
use crate::mm::hhdm;
use crate::percpu::{MAX_CPUS, PerCpu};
use crate::proc::thread::KERNEL_STACK_SIZE;

/// Physical page the trampoline is copied to (page number for STARTUP).
const TRAMPOLINE_PHYS: u64 = 0x8000;

/// Offset of the handoff block inside the trampoline page.
const HANDOFF_OFFSET: u64 = 0xF00;

/// Poll budget for one AP, in microseconds.
const AP_START_TIMEOUT_US: u64 = 1_000_000;

/// Handoff block read by the trampoline and the 64-bit AP entry.
#[repr(C)]
struct ApHandoff {
    /// Top of the AP's kernel stack.
    stack_top: u64,
    /// Kernel CR3 value.
    cr3: u64,
    /// 64-bit entry point (`ap_entry`).
    entry: u64,
    /// Logical CPU index assigned by the BSP.
    cpu_index: u64,
    /// Hardware APIC id.
    apic_id: u64,
    /// Address of this AP's PerCpu.
    percpu: u64,
}

// The 16-bit climb to long mode. Assembled position-dependent against the
// fixed copy address: every absolute reference is `0x8000 + (label -
// start)`, so copying the blob to TRAMPOLINE_PHYS makes them line up.
core::arch::global_asm!(
    ".section .rodata.ap_trampoline, \"a\"",
    ".global ap_trampoline_start",
    ".global ap_trampoline_end",
    ".code16",
    "ap_trampoline_start:",
    "cli",
    "cld",
    // Load the trampoline GDT (flat 32/64-bit segments).
    "lgdtl 0x8000 + (tramp_gdt_ptr - ap_trampoline_start)",
    "movl %cr0, %eax",
    "orl $1, %eax",
    "movl %eax, %cr0",
    "ljmpl $0x08, $(0x8000 + (tramp_pm - ap_trampoline_start))",
    ".code32",
    "tramp_pm:",
    "movw $0x10, %ax",
    "movw %ax, %ds",
    "movw %ax, %es",
    "movw %ax, %ss",
    // PAE on, kernel CR3 from the handoff block.
    "movl %cr4, %eax",
    "orl $(1 << 5), %eax",
    "movl %eax, %cr4",
    "movl 0x8F08, %eax",
    "movl %eax, %cr3",
    // EFER.LME, then paging.
    "movl $0xC0000080, %ecx",
    "rdmsr",
    "orl $(1 << 8), %eax",
    "wrmsr",
    "movl %cr0, %eax",
    "orl $(1 << 31), %eax",
    "movl %eax, %cr0",
    "ljmpl $0x18, $(0x8000 + (tramp_lm - ap_trampoline_start))",
    ".code64",
    "tramp_lm:",
    // Stack and 64-bit entry from the handoff block, argument = block.
    "movq 0x8F00, %rsp",
    "movq $0x8F00, %rdi",
    "movq 0x8F10, %rax",
    "jmpq *%rax",
    ".balign 8",
    "tramp_gdt:",
    ".quad 0",
    ".quad 0x00CF9B000000FFFF", // 32-bit code
    ".quad 0x00CF93000000FFFF", // data
    ".quad 0x00AF9B000000FFFF", // 64-bit code
    "tramp_gdt_ptr:",
    ".word (tramp_gdt_ptr - tramp_gdt) - 1",
    ".long 0x8000 + (tramp_gdt - ap_trampoline_start)",
    "ap_trampoline_end:",
    options(att_syntax),
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

/// APIC ids of online CPUs, indexed by logical CPU id (IPI routing).
static CPU_APIC_IDS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

/// Sends a reschedule IPI to logical CPU `cpu`.
pub fn send_resched_ipi(cpu: u32) {
    let apic_id = CPU_APIC_IDS[cpu as usize].load(Ordering::Acquire);
    apic::send_ipi(apic_id, idt::RESCHED_VECTOR);
}

/// Boots every AP listed in the boot info. Returns when all are online or
/// timed out.
pub fn boot_aps(boot_info: &deltaboot::BootInfo) {
    let bsp_apic = apic::local_id();
    CPU_APIC_IDS[0].store(bsp_apic, Ordering::Release);

    let aps: alloc::vec::Vec<u32> = boot_info
        .smp_cpus
        .iter()
        .map(|cpu| cpu.apic_id)
        .filter(|&id| id != bsp_apic)
        .collect();
    if aps.is_empty() {
        kinfo!("SMP: single-processor system");
        return;
    }
    if aps.len() + 1 > MAX_CPUS {
        kwarn!("SMP: {} APs reported, booting the first {}", aps.len(), MAX_CPUS - 1);
    }

    install_trampoline();

    let mut online = 1u32;
    for (i, &apic_id) in aps.iter().take(MAX_CPUS - 1).enumerate() {
        let cpu_index = (i + 1) as u32;
        if start_one_ap(cpu_index, apic_id) {
            CPU_APIC_IDS[cpu_index as usize].store(apic_id, Ordering::Release);
            online += 1;
        } else {
            kwarn!("SMP: AP {} (APIC {}) did not start", cpu_index, apic_id);
        }
    }

    crate::percpu::set_cpu_count(online);
    kinfo!("SMP: {} CPUs online", online);
}

/// Copies the trampoline blob to its fixed low page.
fn install_trampoline() {
    // SAFETY: The linker places the blob contiguously between the two
    // symbols; the low page is identity-covered by the HHDM and reserved.
    unsafe {
        let start = core::ptr::addr_of!(ap_trampoline_start);
        let end = core::ptr::addr_of!(ap_trampoline_end);
        let len = end as usize - start as usize;
        let dst = hhdm::phys_to_virt(PhysAddr::new(TRAMPOLINE_PHYS)).as_mut_ptr::<u8>();
        core::ptr::copy_nonoverlapping(start, dst, len);
    }
}

/// Starts one AP through the INIT/STARTUP protocol; polls its started flag.
fn start_one_ap(cpu_index: u32, apic_id: u32) -> bool {
    // The AP's PerCpu lives forever.
    let percpu: &'static mut PerCpu = Box::leak(Box::new(PerCpu::new()));
    percpu.cpu_id.store(cpu_index, Ordering::Relaxed);
    percpu.apic_id.store(apic_id, Ordering::Relaxed);

    // Kernel stack for the climb; the scheduler hands out per-thread
    // stacks once the AP is in its idle loop.
    let stack = vec![0u8; KERNEL_STACK_SIZE].leak();
    let stack_top = (stack.as_ptr() as u64 + KERNEL_STACK_SIZE as u64) & !0xF;

    let handoff_virt =
        hhdm::phys_to_virt(PhysAddr::new(TRAMPOLINE_PHYS + HANDOFF_OFFSET));
    // SAFETY: The handoff block lies inside the reserved trampoline page.
    unsafe {
        let handoff = handoff_virt.as_mut_ptr::<ApHandoff>();
        *handoff = ApHandoff {
            stack_top,
            cr3: instructions::read_cr3(),
            entry: ap_entry as usize as u64,
            cpu_index: cpu_index as u64,
            apic_id: apic_id as u64,
            percpu: percpu as *mut PerCpu as u64,
        };
    }

    // INIT, settle, then STARTUP twice per the protocol.
    apic::send_init(apic_id);
    instructions::io_delay(10_000);
    apic::send_startup(apic_id, (TRAMPOLINE_PHYS >> 12) as u8);
    instructions::io_delay(200);
    apic::send_startup(apic_id, (TRAMPOLINE_PHYS >> 12) as u8);

    // Poll the started flag for up to one second.
    let mut waited = 0u64;
    while waited < AP_START_TIMEOUT_US {
        if percpu.started.load(Ordering::Acquire) {
            return true;
        }
        instructions::io_delay(100);
        waited += 100;
    }
    false
}

/// 64-bit AP entry, reached from the trampoline with the handoff block in
/// RDI. Finishes CPU setup and enters the idle loop.
extern "C" fn ap_entry(handoff: *const ApHandoff) -> ! {
    // SAFETY: The BSP filled the block and will not touch it again until
    // our started flag is set.
    let (cpu_index, percpu) = unsafe {
        ((*handoff).cpu_index as u32, (*handoff).percpu as *mut PerCpu)
    };

    // SAFETY: One-time per-AP setup in the prescribed order: segments
    // before GS (segment loads clear the GS base), then the shared IDT,
    // syscall MSRs, PAT, and the LAPIC.
    unsafe {
        gdt::init_for_cpu(cpu_index);
        crate::percpu::install_ap_gs(percpu);
        idt::load();
        super::syscall::init();
        instructions::init_pat();
    }
    apic::init();
    apic::start_timer();

    crate::sched::init_cpu();

    // SAFETY: Our PerCpu is exclusively ours until the flag flips.
    unsafe {
        (*percpu).started.store(true, Ordering::Release);
    }
    kinfo!("SMP: AP {} online", cpu_index);

    crate::sched::start()
}
