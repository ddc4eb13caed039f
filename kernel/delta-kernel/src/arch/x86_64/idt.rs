//! Interrupt descriptor table and the common trap path.
//!
//! One IDT is shared by every CPU. Exception stubs funnel into a common
//! frame-saving path; hardware vectors (timer, reschedule IPI, spurious)
//! dispatch to their subsystems. A fault from ring 3 kills the faulting
//! process; a fault from ring 0 is a kernel bug and panics.

use core::cell::UnsafeCell;

use super::gdt::KERNEL_CODE_SELECTOR;

/// Timer interrupt vector.
pub const TIMER_VECTOR: u8 = 0x20;
/// Reschedule IPI vector.
pub const RESCHED_VECTOR: u8 = 0xF0;
/// Spurious interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Registers and hardware frame captured by the common trap stub, in push
/// order.
#[repr(C)]
pub struct TrapFrame {
    /// General registers, r15 first (pushed last).
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    /// Interrupt vector number.
    pub vector: u64,
    /// Hardware error code (0 for vectors without one).
    pub error: u64,
    /// Saved instruction pointer.
    pub rip: u64,
    /// Saved code selector; RPL 3 means the trap came from user mode.
    pub cs: u64,
    /// Saved RFLAGS.
    pub rflags: u64,
    /// Saved stack pointer.
    pub rsp: u64,
    /// Saved stack selector.
    pub ss: u64,
}

impl TrapFrame {
    /// Whether the interrupted context was ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            _reserved: 0,
        }
    }

    fn set_handler(&mut self, handler: u64) {
        self.offset_low = handler as u16;
        self.selector = KERNEL_CODE_SELECTOR;
        // Present, interrupt gate, DPL 0.
        self.options = 0x8E00;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
    }
}

#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; 256],
}

struct IdtCell(UnsafeCell<Idt>);

// SAFETY: Written once by the BSP before interrupts are enabled anywhere;
// read-only afterwards.
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new(Idt {
    entries: [const { IdtEntry::missing() }; 256],
}));

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

macro_rules! trap_stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                concat!("push ", $vector),
                "jmp {common}",
                common = sym trap_common,
            );
        }
    };
    ($name:ident, $vector:literal, err) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            core::arch::naked_asm!(
                concat!("push ", $vector),
                "jmp {common}",
                common = sym trap_common,
            );
        }
    };
}

trap_stub!(trap_de, 0);
trap_stub!(trap_db, 1);
trap_stub!(trap_nmi, 2);
trap_stub!(trap_bp, 3);
trap_stub!(trap_of, 4);
trap_stub!(trap_br, 5);
trap_stub!(trap_ud, 6);
trap_stub!(trap_nm, 7);
trap_stub!(trap_df, 8, err);
trap_stub!(trap_ts, 10, err);
trap_stub!(trap_np, 11, err);
trap_stub!(trap_ss, 12, err);
trap_stub!(trap_gp, 13, err);
trap_stub!(trap_pf, 14, err);
trap_stub!(trap_mf, 16);
trap_stub!(trap_ac, 17, err);
trap_stub!(trap_mc, 18);
trap_stub!(trap_xm, 19);
trap_stub!(trap_timer, 0x20);
trap_stub!(trap_resched, 0xF0);
trap_stub!(trap_spurious, 0xFF);

/// Common trap path: save registers, fix GS for user entries, call the
/// Rust handler, restore.
#[unsafe(naked)]
extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Swap to the kernel GS when the trap came from ring 3.
        "test byte ptr [rsp + 0x90], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "mov rdi, rsp",
        "call {handler}",
        "test byte ptr [rsp + 0x90], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        // Drop vector and error code.
        "add rsp, 16",
        "iretq",
        handler = sym trap_handler,
    );
}

/// Rust-level trap dispatch.
extern "C" fn trap_handler(frame: &mut TrapFrame) {
    match frame.vector as u8 {
        TIMER_VECTOR => {
            super::apic::eoi();
            crate::time::on_tick();
            crate::sched::tick(frame.from_user());
        }
        RESCHED_VECTOR => {
            super::apic::eoi();
            crate::sched::on_resched_ipi();
        }
        SPURIOUS_VECTOR => {}
        2 => {
            // NMI: during a panic every other CPU is told to stop here.
            if crate::panic::panic_in_progress() {
                super::instructions::halt_forever();
            }
        }
        vector => handle_exception(vector, frame),
    }
}

fn handle_exception(vector: u8, frame: &mut TrapFrame) {
    let cr2 = super::instructions::read_cr2();

    if frame.from_user() {
        // A user fault kills the process, not the kernel.
        let process = crate::proc::current();
        delta_core::kerr!(
            "process {} ({}) faulted: vector={} error={:#x} rip={:#x} cr2={:#x}",
            process.pid,
            process.name,
            vector,
            frame.error,
            frame.rip,
            cr2
        );
        process.note_exit(-1);
        crate::sched::exit();
    }

    panic!(
        "kernel fault: vector={} error={:#x} rip={:#x} rsp={:#x} cr2={:#x}",
        vector, frame.error, frame.rip, frame.rsp, cr2
    );
}

/// Builds the shared IDT (BSP only) and loads it on the calling CPU.
///
/// # Safety
///
/// The build must happen before any CPU enables interrupts; every AP calls
/// [`load`] afterwards.
pub unsafe fn init() {
    let idt = IDT.0.get();
    // SAFETY: Single-threaded boot context per the contract.
    unsafe {
        let e = &mut (*idt).entries;
        e[0].set_handler(trap_de as usize as u64);
        e[1].set_handler(trap_db as usize as u64);
        e[2].set_handler(trap_nmi as usize as u64);
        e[3].set_handler(trap_bp as usize as u64);
        e[4].set_handler(trap_of as usize as u64);
        e[5].set_handler(trap_br as usize as u64);
        e[6].set_handler(trap_ud as usize as u64);
        e[7].set_handler(trap_nm as usize as u64);
        e[8].set_handler(trap_df as usize as u64);
        e[10].set_handler(trap_ts as usize as u64);
        e[11].set_handler(trap_np as usize as u64);
        e[12].set_handler(trap_ss as usize as u64);
        e[13].set_handler(trap_gp as usize as u64);
        e[14].set_handler(trap_pf as usize as u64);
        e[16].set_handler(trap_mf as usize as u64);
        e[17].set_handler(trap_ac as usize as u64);
        e[18].set_handler(trap_mc as usize as u64);
        e[19].set_handler(trap_xm as usize as u64);
        e[TIMER_VECTOR as usize].set_handler(trap_timer as usize as u64);
        e[RESCHED_VECTOR as usize].set_handler(trap_resched as usize as u64);
        e[SPURIOUS_VECTOR as usize].set_handler(trap_spurious as usize as u64);
    }
    // SAFETY: The table is fully built.
    unsafe { load() };
}

/// Loads the shared IDT on the calling CPU (AP bring-up).
///
/// # Safety
///
/// [`init`] must have completed on the BSP.
pub unsafe fn load() {
    let pointer = IdtPointer {
        limit: (size_of::<Idt>() - 1) as u16,
        base: IDT.0.get() as u64,
    };
    // SAFETY: The pointer describes a valid, fully initialized IDT.
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack));
    }
}
