//! SYSCALL/SYSRET setup and the machine-level entry stub.
//!
//! Userspace passes the syscall number in RAX and arguments in RDI, RSI,
//! RDX, R10, R8, R9 (R10 replaces RCX, which the instruction clobbers).
//! The stub swaps to the kernel GS and stack, marshals into the C calling
//! convention, and calls `syscall_dispatch`.

use super::gdt::{KERNEL_CODE_SELECTOR, USER_DATA_SELECTOR};
use super::instructions::{IA32_EFER, IA32_FMASK, IA32_LSTAR, IA32_STAR, rdmsr, wrmsr};

/// Programs the SYSCALL MSRs on the calling CPU.
///
/// # Safety
///
/// The GDT must be loaded with the selector layout the STAR value encodes,
/// and the per-CPU GS base must be valid before any syscall can fire.
pub unsafe fn init() {
    // SAFETY: Architectural MSR writes with values matching our GDT.
    unsafe {
        // EFER.SCE enables the instructions.
        wrmsr(IA32_EFER, rdmsr(IA32_EFER) | 1);

        // STAR: syscall CS/SS from the kernel selectors, sysret from the
        // user base (sysret adds 16 for CS, 8 for SS).
        let star = ((KERNEL_CODE_SELECTOR as u64) << 32)
            | (((USER_DATA_SELECTOR as u64 - 8) | 3) << 48);
        wrmsr(IA32_STAR, star);

        wrmsr(IA32_LSTAR, syscall_entry as usize as u64);

        // Mask IF, TF, and DF on entry; handlers run with interrupts off
        // until they block or return.
        wrmsr(IA32_FMASK, 0x700);
    }
}

/// The SYSCALL entry stub.
///
/// On entry: RCX = user RIP, R11 = user RFLAGS, GS still the user's.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        // Stash the user stack, take the kernel stack from per-CPU data.
        "mov gs:[16], rsp",
        "mov rsp, gs:[8]",
        // Preserve the sysret state and the user stack pointer.
        "push qword ptr gs:[16]",
        "push rcx",
        "push r11",
        // Marshal (rax, rdi, rsi, rdx, r10, r8, r9) into the C convention:
        // dispatch(nr, a0, a1, a2, a3, a4, a5).
        "push r9",
        "mov r9, r8",
        "mov r8, r10",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call syscall_dispatch",
        "add rsp, 8",
        // Restore sysret state; the result stays in RAX.
        "pop r11",
        "pop rcx",
        "pop rsp",
        "swapgs",
        "sysretq",
    );
}
