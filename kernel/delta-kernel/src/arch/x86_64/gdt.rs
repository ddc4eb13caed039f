//! Per-CPU GDT and TSS.
//!
//! Selector layout is fixed by the SYSCALL/SYSRET MSR contract: kernel code
//! at 0x08 with data following, user data at 0x18 with user code following,
//! so one STAR value covers both transitions.

use core::cell::UnsafeCell;

use crate::percpu::MAX_CPUS;

/// Kernel code selector.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User data selector (RPL 3).
pub const USER_DATA_SELECTOR: u16 = 0x18 | 3;
/// User code selector (RPL 3).
pub const USER_CODE_SELECTOR: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

/// 64-bit task state segment.
#[repr(C, packed)]
struct Tss {
    _reserved0: u32,
    /// Stack loaded on ring 3 -> ring 0 transitions.
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: 0,
            rsp1: 0,
            rsp2: 0,
            _reserved1: 0,
            ist: [0; 7],
            _reserved2: 0,
            _reserved3: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

/// One CPU's GDT: five segment descriptors plus the 16-byte TSS descriptor.
#[repr(C, align(16))]
struct Gdt {
    table: [u64; 8],
    tss: Tss,
}

impl Gdt {
    const fn new() -> Self {
        Self {
            table: [
                0,
                // Kernel code: long mode, present, DPL 0.
                0x00AF_9B00_0000_FFFF,
                // Kernel data: present, writable, DPL 0.
                0x00CF_9300_0000_FFFF,
                // User data: present, writable, DPL 3.
                0x00CF_F300_0000_FFFF,
                // User code: long mode, present, DPL 3.
                0x00AF_FB00_0000_FFFF,
                // TSS descriptor, filled at load time (two slots).
                0,
                0,
                0,
            ],
            tss: Tss::new(),
        }
    }
}

struct GdtCell(UnsafeCell<Gdt>);

// SAFETY: Each CPU only ever touches its own slot; initialization happens
// before the CPU runs anything else.
unsafe impl Sync for GdtCell {}

static GDTS: [GdtCell; MAX_CPUS] =
    [const { GdtCell(UnsafeCell::new(Gdt::new())) }; MAX_CPUS];

#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

/// Builds and loads the GDT + TSS for `cpu`, reloading all segment
/// registers.
///
/// # Safety
///
/// Must run on the CPU it describes, exactly once, before user transitions
/// or interrupts use the TSS.
pub unsafe fn init_for_cpu(cpu: u32) {
    let gdt = GDTS[cpu as usize].0.get();

    // SAFETY: Exclusive access per the function contract.
    unsafe {
        // System-segment (TSS) descriptor: base/limit split across two
        // slots, type 0x9 (available 64-bit TSS), present.
        let base = core::ptr::addr_of!((*gdt).tss) as u64;
        let limit = (size_of::<Tss>() - 1) as u64;
        (*gdt).table[5] = limit
            | ((base & 0xFF_FFFF) << 16)
            | (0x89u64 << 40)
            | (((base >> 24) & 0xFF) << 56);
        (*gdt).table[6] = base >> 32;

        let pointer = GdtPointer {
            limit: (size_of::<[u64; 8]>() - 1) as u16,
            base: gdt as u64,
        };

        core::arch::asm!(
            "lgdt [{ptr}]",
            // Reload CS via a far return.
            "lea {tmp}, [2f + rip]",
            "push {kcode}",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {kdata:x}",
            "mov es, {kdata:x}",
            "mov ss, {kdata:x}",
            // Null FS/GS; the GS base MSRs are programmed separately.
            "xor eax, eax",
            "mov fs, ax",
            "mov gs, ax",
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            tmp = out(reg) _,
            kcode = const KERNEL_CODE_SELECTOR as u64,
            kdata = in(reg) KERNEL_DATA_SELECTOR as u64,
            tss = in(reg) TSS_SELECTOR as u64,
            out("rax") _,
        );
    }
}

/// Loads the BSP's GDT.
///
/// # Safety
///
/// As [`init_for_cpu`], on the BSP.
pub unsafe fn init_bsp() {
    // SAFETY: Forwarded contract.
    unsafe { init_for_cpu(0) };
}

/// Points the current CPU's TSS RSP0 at `stack_top`; interrupts and
/// syscalls from ring 3 land there.
///
/// # Safety
///
/// `stack_top` must be the top of a mapped kernel stack that stays alive
/// while this CPU can take ring 3 entries.
pub unsafe fn set_tss_rsp0(stack_top: u64) {
    let cpu = crate::percpu::current_cpu_id();
    let gdt = GDTS[cpu as usize].0.get();
    // SAFETY: Only this CPU writes its own TSS.
    unsafe {
        (*gdt).tss.rsp0 = stack_top;
    }
}
