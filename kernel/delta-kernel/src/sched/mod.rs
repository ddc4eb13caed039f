//! Per-CPU scheduler.
//!
//! Each CPU owns a FIFO ready queue, a current-thread slot, and an idle
//! thread, all behind one IRQ-disabling lock. Cooperative yields and timer
//! preemption share the same queue manipulation; they differ only in what
//! is safe to do around it (the ISR path skips reaping). Dead threads park
//! on a global list and are reaped on the next `schedule` — never while any
//! CPU is still standing on their stack: the Arc held in the per-CPU `prev`
//! slot keeps the stack alive until the switch away has completed.

pub mod wait;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use delta_core::sync::IrqSpinLock;

use crate::percpu::{CpuLocal, MAX_CPUS};
use crate::proc::thread::{ThreadRef, ThreadState};

/// Timer ticks per scheduling slice.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Per-CPU scheduler state.
struct CpuSched {
    /// Runnable threads, FIFO. The idle thread is never queued here.
    ready: VecDeque<ThreadRef>,
    /// The thread executing on this CPU.
    current: Option<ThreadRef>,
    /// The previously running thread; its Arc pins the kernel stack that
    /// the last context switch stepped off of.
    prev: Option<ThreadRef>,
    /// This CPU's idle thread.
    idle: Option<ThreadRef>,
    /// Ticks since the last preemption.
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    tick: u32,
}

impl CpuSched {
    const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            current: None,
            prev: None,
            idle: None,
            tick: 0,
        }
    }
}

static CPU_SCHED: CpuLocal<IrqSpinLock<CpuSched>> =
    CpuLocal::new([const { IrqSpinLock::new(CpuSched::new()) }; MAX_CPUS]);

/// Dead threads awaiting reap.
static DEAD_LIST: IrqSpinLock<Vec<ThreadRef>> = IrqSpinLock::new(Vec::new());

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// Appends `thread` to the calling CPU's ready queue.
pub fn add(thread: ThreadRef) {
    make_ready(thread);
}

/// Marks `thread` ready and appends it to the calling CPU's ready queue.
pub fn make_ready(thread: ThreadRef) {
    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    if let Some(idle) = &guard.idle {
        if Arc::ptr_eq(idle, &thread) {
            return;
        }
    }
    thread.set_state(ThreadState::Ready);
    guard.ready.push_back(thread);
}

/// Unlinks `thread` from the calling CPU's ready queue.
pub fn remove(thread: &ThreadRef) {
    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    guard.ready.retain(|t| !Arc::ptr_eq(t, thread));
}

/// The thread currently executing on the calling CPU.
pub fn current_thread() -> Option<ThreadRef> {
    CPU_SCHED.get().lock().current.clone()
}

/// Picks the next thread to run and updates queue state.
///
/// Returns `None` when the caller should keep running the current thread:
/// either the pick is the current thread, or the queue is empty and the
/// current thread is still runnable. A still-runnable current is re-queued
/// at the tail; the pick is marked running.
fn select_locked(sched: &mut CpuSched) -> Option<ThreadRef> {
    let next = match sched.ready.pop_front() {
        Some(next) => next,
        None => {
            // Nothing queued: stay on a runnable current, else go idle.
            if let Some(current) = &sched.current {
                let keep_running = current.state() == ThreadState::Running
                    && !is_idle(sched, current);
                if keep_running {
                    return None;
                }
            }
            sched.idle.clone()?
        }
    };

    if let Some(current) = &sched.current {
        if Arc::ptr_eq(current, &next) {
            next.set_state(ThreadState::Running);
            return None;
        }
        if current.state() == ThreadState::Running && !is_idle(sched, current) {
            current.set_state(ThreadState::Ready);
            sched.ready.push_back(current.clone());
        }
    }

    next.set_state(ThreadState::Running);
    Some(next)
}

fn is_idle(sched: &CpuSched, thread: &ThreadRef) -> bool {
    sched
        .idle
        .as_ref()
        .is_some_and(|idle| Arc::ptr_eq(idle, thread))
}

// ---------------------------------------------------------------------------
// Reaping
// ---------------------------------------------------------------------------

/// Appends the calling thread to the dead list (from `exit`).
fn push_dead(thread: ThreadRef) {
    DEAD_LIST.lock().push(thread);
}

/// Reaps dead threads: unlinks each from its process and drops the list's
/// reference. Stacks are actually freed once the owning CPU's `prev` slot
/// lets go — a thread that just exited is still referenced there until that
/// CPU completes its next switch.
fn reap() {
    let dead: Vec<ThreadRef> = core::mem::take(&mut *DEAD_LIST.lock());
    let mut still_running: Vec<ThreadRef> = Vec::new();
    for thread in dead {
        // References: this local + the process thread list. Anything beyond
        // that is a CPU's current/prev slot, meaning some CPU has not
        // finished stepping off the thread's stack yet.
        if Arc::strong_count(&thread) > 2 {
            still_running.push(thread);
            continue;
        }
        let process = thread.process.clone();
        let remaining = process.unlink_thread(&thread);
        drop(thread);
        if remaining == 0 && process.pid != 0 {
            crate::proc::destroy(&process);
        }
    }
    if !still_running.is_empty() {
        DEAD_LIST.lock().append(&mut still_running);
    }
}

// ---------------------------------------------------------------------------
// Scheduling (kernel target)
// ---------------------------------------------------------------------------

/// Initializes the calling CPU's scheduler and its idle thread.
///
/// Used for the BSP and every AP alike; each CPU gets its own idle thread
/// in the kernel process.
#[cfg(target_os = "none")]
pub fn init_cpu() {
    use crate::proc::thread::Thread;

    let kernel = crate::proc::kernel_process();
    let idle = Thread::create(&kernel, idle_entry, 0);
    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    guard.idle = Some(idle);
    guard.tick = 0;
}

/// The idle loop: halt until an interrupt, then offer the CPU back.
#[cfg(target_os = "none")]
fn idle_entry(_arg: usize) {
    loop {
        // SAFETY: Idle runs with a valid IDT; halting with interrupts
        // enabled is the canonical idle.
        unsafe { crate::arch::x86_64::instructions::enable_interrupts_and_halt() };
        yield_now();
    }
}

/// Cooperative yield.
#[cfg(target_os = "none")]
pub fn yield_now() {
    schedule();
}

/// Full reschedule: reap, pick, switch.
#[cfg(target_os = "none")]
pub fn schedule() {
    reap();
    switch_to_next();
}

/// ISR-safe preemption: identical queue manipulation, no reaping (the ISR
/// must stay short and must not take teardown locks).
#[cfg(target_os = "none")]
fn preempt() {
    switch_to_next();
}

#[cfg(target_os = "none")]
fn switch_to_next() {
    use crate::arch::x86_64::context;

    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    let Some(next) = select_locked(&mut guard) else {
        return;
    };

    switch_address_space(&next);
    // SAFETY: next's stack top is valid; the TSS entry is per-CPU.
    unsafe {
        crate::arch::x86_64::gdt::set_tss_rsp0(next.kernel_stack_top());
        let percpu = crate::percpu::current_cpu() as *const crate::percpu::PerCpu
            as *mut crate::percpu::PerCpu;
        (*percpu).kernel_rsp = next.kernel_stack_top();
    }

    let old = guard.current.take();
    let new_ctx = next.context_ptr();
    let old_ctx = old.as_ref().map(|t| t.context_ptr());
    // Pin the outgoing thread until the switch off its stack is complete;
    // the slot is recycled on the next switch.
    guard.prev = old;
    guard.current = Some(next);
    drop(guard);

    match old_ctx {
        // SAFETY: Both contexts are owned by parked/current threads whose
        // stacks are pinned by the scheduler's Arcs.
        Some(old_ctx) => unsafe { context::context_switch(old_ctx, new_ctx) },
        // First switch on this CPU: nothing to save.
        None => unsafe { context::context_load(new_ctx) },
    }
}

/// Terminates the calling thread. The stack stays in use until the switch
/// completes, so the thread is only queued for reaping here; a later
/// `schedule` on some CPU frees it.
#[cfg(target_os = "none")]
pub fn exit() -> ! {
    if let Some(current) = current_thread() {
        current.set_state(ThreadState::Dead);
        push_dead(current);
    }
    schedule();
    // A dead thread is never picked again.
    unreachable!("dead thread rescheduled");
}

/// Timer tick hook. Preemption fires only when the interrupted context was
/// user mode and the slice is used up.
#[cfg(target_os = "none")]
pub fn tick(from_user: bool) {
    let expired = {
        let sched = CPU_SCHED.get();
        let mut guard = sched.lock();
        guard.tick += 1;
        if guard.tick >= TIME_SLICE_TICKS {
            guard.tick = 0;
            true
        } else {
            false
        }
    };
    if expired && from_user {
        preempt();
    }
}

/// Enters the scheduler on the calling CPU, running the first ready thread
/// (or idle). Does not return.
#[cfg(target_os = "none")]
pub fn start() -> ! {
    use crate::arch::x86_64::context;

    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    let next = guard
        .ready
        .pop_front()
        .or_else(|| guard.idle.clone())
        .expect("sched: no thread to start");
    next.set_state(ThreadState::Running);

    switch_address_space(&next);
    // SAFETY: As in switch_to_next.
    unsafe {
        crate::arch::x86_64::gdt::set_tss_rsp0(next.kernel_stack_top());
        let percpu = crate::percpu::current_cpu() as *const crate::percpu::PerCpu
            as *mut crate::percpu::PerCpu;
        (*percpu).kernel_rsp = next.kernel_stack_top();
    }

    let ctx = next.context_ptr();
    guard.current = Some(next);
    drop(guard);

    // SAFETY: The context was initialized by thread creation; the boot
    // stack is abandoned.
    unsafe { context::context_load(ctx) }
}

/// Loads the address space of `next`'s process: its user pagemap when it
/// has one, the kernel pagemap otherwise.
#[cfg(target_os = "none")]
fn switch_address_space(next: &ThreadRef) {
    use crate::arch::x86_64::instructions::{read_cr3, write_cr3};

    let target = match next.process.pagemap_root() {
        Some(root) => root,
        None => crate::mm::vmm::with_vmm(|vmm| vmm.kernel_root()),
    };
    // Avoid the full TLB flush when the space does not change.
    if read_cr3() != target.as_u64() {
        // SAFETY: target is a valid pagemap root whose upper half maps the
        // kernel, so execution continues seamlessly.
        unsafe { write_cr3(target.as_u64()) };
    }
}

/// Sends a reschedule IPI to another CPU after queueing work for it.
#[cfg(target_os = "none")]
pub fn send_resched(cpu: u32) {
    crate::arch::x86_64::smp::send_resched_ipi(cpu);
}

/// Entry point of the reschedule IPI: run the ISR-safe preempt path.
#[cfg(target_os = "none")]
pub fn on_resched_ipi() {
    preempt();
}

// ---------------------------------------------------------------------------
// Host-test support
// ---------------------------------------------------------------------------

/// Empties the calling CPU's ready queue (test isolation).
#[cfg(any(test, not(target_os = "none")))]
pub fn test_drain_ready() {
    let sched = CPU_SCHED.get();
    let mut guard = sched.lock();
    guard.ready.clear();
    guard.current = None;
    guard.prev = None;
}

/// Serializes tests that touch the shared per-CPU queues; the cargo test
/// harness runs tests concurrently.
#[cfg(test)]
pub(crate) mod test_sync {
    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Process;
    use crate::proc::thread::Thread;

    fn noop(_: usize) {}

    /// Runs the shared pick logic once against CPU 0's queue, emulating the
    /// context switch by updating `current`.
    fn pick_once() -> Option<ThreadRef> {
        let sched = CPU_SCHED.get();
        let mut guard = sched.lock();
        let next = select_locked(&mut guard)?;
        guard.prev = guard.current.take();
        guard.current = Some(next.clone());
        Some(next)
    }

    #[test]
    fn round_robin_is_fair() {
        let _serial = test_sync::lock();
        test_drain_ready();
        let process = Process::new_kernel_for_tests("fair");
        let a = Thread::create(&process, noop, 0);
        let b = Thread::create(&process, noop, 1);
        add(a.clone());
        add(b.clone());

        let mut runs = [0u32; 2];
        for _ in 0..100 {
            let picked = pick_once().expect("two runnable threads");
            if Arc::ptr_eq(&picked, &a) {
                runs[0] += 1;
            } else {
                runs[1] += 1;
            }
        }
        // Strict alternation: both within a hair of each other.
        assert!(runs[0].abs_diff(runs[1]) <= 1, "unfair: {runs:?}");
        test_drain_ready();
    }

    #[test]
    fn runnable_current_keeps_cpu_when_queue_empty() {
        let _serial = test_sync::lock();
        test_drain_ready();
        let process = Process::new_kernel_for_tests("solo");
        let solo = Thread::create(&process, noop, 0);
        add(solo.clone());

        let first = pick_once().unwrap();
        assert!(Arc::ptr_eq(&first, &solo));
        // No other runnable thread: the pick is a no-op.
        assert!(pick_once().is_none());
        assert_eq!(solo.state(), ThreadState::Running);
        test_drain_ready();
    }

    #[test]
    fn blocked_current_is_not_requeued() {
        let _serial = test_sync::lock();
        test_drain_ready();
        let process = Process::new_kernel_for_tests("blocker");
        let a = Thread::create(&process, noop, 0);
        let b = Thread::create(&process, noop, 1);
        add(a.clone());
        add(b.clone());

        let first = pick_once().unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        // a blocks; picking again must not put it back on the queue.
        a.set_state(ThreadState::Blocked);
        let second = pick_once().unwrap();
        assert!(Arc::ptr_eq(&second, &b));
        assert!(pick_once().is_none(), "blocked thread was requeued");
        test_drain_ready();
    }

    #[test]
    fn reap_unlinks_thread_and_destroys_empty_process() {
        let _serial = test_sync::lock();
        test_drain_ready();
        let process = Process::new_kernel_for_tests("doomed");
        let t = Thread::create(&process, noop, 0);
        assert_eq!(process.thread_count(), 1);

        t.set_state(ThreadState::Dead);
        push_dead(t);
        reap();
        assert_eq!(process.thread_count(), 0);
    }
}
