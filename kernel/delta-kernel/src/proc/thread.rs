//! Threads: kernel-stack-owning schedulable entities.
//!
//! A thread's kernel context starts at a trampoline that enables interrupts
//! and runs the entry function; user threads transition to ring 3 through
//! the exception-return path on first schedule. The kernel stack is freed by
//! the scheduler's reaper, never by the thread running on it — the last
//! `Arc` clone (held by the CPU that switched away) keeps the stack alive
//! until the switch is complete.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::any::Any;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use delta_core::addr::VirtAddr;
use delta_syscall::Error;

use crate::arch::x86_64::context::{CpuContext, UserContext, context_init};
use crate::obj::{KernelObject, ObjectType};
use crate::proc::Process;

/// Kernel stack size per thread (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Thread scheduling states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Runnable, waiting in a ready queue.
    Ready = 0,
    /// Executing on some CPU.
    Running = 1,
    /// Parked on a wait queue.
    Blocked = 2,
    /// Exited; awaiting reap.
    Dead = 3,
}

impl ThreadState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Dead,
        }
    }
}

/// A reference-counted thread.
pub type ThreadRef = Arc<Thread>;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Entry function of a kernel thread.
pub type ThreadEntry = fn(usize);

/// A schedulable entity owning a kernel stack.
pub struct Thread {
    /// Thread id.
    pub tid: u64,
    /// Owning process.
    pub process: Arc<Process>,
    state: AtomicU8,
    /// The kernel stack buffer.
    kernel_stack: Box<[u8]>,
    /// Parked kernel context; exclusively accessed by the scheduler.
    pub(crate) context: UnsafeCell<CpuContext>,
    /// Ring 3 entry state for user threads.
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    pub(crate) user_context: UserContext,
    /// Entry function for kernel threads.
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    entry: Option<ThreadEntry>,
    /// Argument passed to `entry`.
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    arg: usize,
}

// SAFETY: The context cell is only touched by the scheduler with the thread
// off-CPU (or by the CPU that owns it during a switch); everything else is
// atomic or immutable after creation.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn alloc_common(
        process: &Arc<Process>,
        entry: Option<ThreadEntry>,
        arg: usize,
        user_context: UserContext,
        trampoline: u64,
    ) -> ThreadRef {
        let mut kernel_stack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();

        let thread = Arc::new_cyclic(|weak: &alloc::sync::Weak<Thread>| {
            // The trampoline receives the thread pointer; the weak handle
            // gives us its future address without a reference cycle.
            let thread_ptr = weak.as_ptr() as u64;
            let context = context_init(&mut kernel_stack, trampoline, thread_ptr);
            Thread {
                tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
                process: process.clone(),
                state: AtomicU8::new(ThreadState::Ready as u8),
                kernel_stack,
                context: UnsafeCell::new(context),
                user_context,
                entry,
                arg,
            }
        });

        process.link_thread(thread.clone());
        thread
    }

    /// Creates a kernel thread running `entry(arg)`.
    pub fn create(process: &Arc<Process>, entry: ThreadEntry, arg: usize) -> ThreadRef {
        Self::alloc_common(
            process,
            Some(entry),
            arg,
            UserContext::zero(),
            kernel_trampoline_addr(),
        )
    }

    /// Creates a user thread entering ring 3 at `entry` on `user_stack`.
    pub fn create_user(
        process: &Arc<Process>,
        entry: VirtAddr,
        user_stack: VirtAddr,
    ) -> ThreadRef {
        Self::alloc_common(
            process,
            None,
            0,
            UserContext::for_entry(entry, user_stack),
            user_trampoline_addr(),
        )
    }

    /// Current scheduling state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Updates the scheduling state.
    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Top of the kernel stack, loaded into the TSS on switch-in.
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64
    }

    /// Pointer to the parked context for the switch primitives.
    pub(crate) fn context_ptr(&self) -> *mut CpuContext {
        self.context.get()
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("pid", &self.process.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl KernelObject for Thread {
    fn obj_type(&self) -> ObjectType {
        ObjectType::Thread
    }

    fn get_info(
        &self,
        topic: delta_syscall::InfoTopic,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        match topic {
            delta_syscall::InfoTopic::ThreadStats => {
                let stats = delta_syscall::ThreadStats {
                    tid: self.tid as u32,
                    state: self.state() as u32,
                    cpu_time_ns: 0,
                    priority: 0,
                    _pad: 0,
                };
                crate::obj::write_info_struct(buf, &stats)
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Trampolines
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
fn kernel_trampoline_addr() -> u64 {
    kernel_thread_trampoline as usize as u64
}

#[cfg(target_os = "none")]
fn user_trampoline_addr() -> u64 {
    user_thread_trampoline as usize as u64
}

#[cfg(not(target_os = "none"))]
fn kernel_trampoline_addr() -> u64 {
    0x1
}

#[cfg(not(target_os = "none"))]
fn user_trampoline_addr() -> u64 {
    0x2
}

/// First code a kernel thread runs. Context switches happen with interrupts
/// disabled; enable them here so entry functions never have to know.
#[cfg(target_os = "none")]
extern "C" fn kernel_thread_trampoline(thread: *const Thread) -> ! {
    // SAFETY: The scheduler only resumes live threads; the pointer is the
    // Arc target and survives until reap.
    let thread = unsafe { &*thread };

    // SAFETY: Enabling interrupts in a fresh kernel thread is always safe.
    unsafe { crate::arch::x86_64::instructions::enable_interrupts() };

    if let Some(entry) = thread.entry {
        entry(thread.arg);
    }
    crate::sched::exit();
}

/// First code a user thread runs: drop to ring 3 via the exception-return
/// mechanism. Never returns to the kernel context.
#[cfg(target_os = "none")]
extern "C" fn user_thread_trampoline(thread: *const Thread) -> ! {
    // SAFETY: As in the kernel trampoline.
    let thread = unsafe { &*thread };
    // SAFETY: The process's address space is active (the scheduler switched
    // it) and exec validated the entry and stack mappings.
    unsafe { crate::arch::x86_64::context::enter_usermode(&thread.user_context) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc;

    #[test]
    fn create_links_into_process() {
        let process = proc::Process::new_kernel_for_tests("threads");
        fn noop(_: usize) {}
        let t1 = Thread::create(&process, noop, 0);
        let t2 = Thread::create(&process, noop, 1);
        assert_ne!(t1.tid, t2.tid);
        assert_eq!(process.thread_count(), 2);
        assert_eq!(t1.state(), ThreadState::Ready);
    }

    #[test]
    fn stack_top_is_above_base() {
        let process = proc::Process::new_kernel_for_tests("stack");
        fn noop(_: usize) {}
        let t = Thread::create(&process, noop, 0);
        let top = t.kernel_stack_top();
        assert_eq!(top % 8, 0);
        // The parked context lives inside the stack buffer.
        // SAFETY: No scheduler is running in tests.
        let rsp = unsafe { (*t.context_ptr()).rsp };
        assert!(rsp < top && rsp > top - 256);
    }
}
