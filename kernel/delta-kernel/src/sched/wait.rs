//! Wait queues: the blocking primitive behind channels, process exit, and
//! every other condition the kernel sleeps on.
//!
//! A queue is a FIFO of blocked threads. Waking moves a thread to the ready
//! queue of the waking CPU. To sleep without losing a wakeup, the sleeper
//! enqueues itself (and flips to `Blocked`) while still holding the lock
//! that guards its condition, then releases it and schedules — a waker
//! serialized on that lock either sees the thread on the queue or runs
//! before the sleeper committed, in which case the sleeper re-checks its
//! condition.

use alloc::collections::VecDeque;

use delta_core::sync::IrqSpinLock;

use crate::proc::thread::{ThreadRef, ThreadState};

/// A FIFO of blocked threads.
pub struct WaitQueue {
    waiters: IrqSpinLock<VecDeque<ThreadRef>>,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            waiters: IrqSpinLock::new(VecDeque::new()),
        }
    }

    /// Number of parked threads.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no thread is parked.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Parks `thread` on the queue, marking it blocked.
    ///
    /// Exposed separately from [`sleep`](Self::sleep) so callers holding a
    /// condition lock can commit to sleeping before releasing it.
    pub fn enqueue(&self, thread: ThreadRef) {
        thread.set_state(ThreadState::Blocked);
        self.waiters.lock().push_back(thread);
    }

    /// Wakes the longest-waiting thread, if any. Returns whether one was
    /// woken.
    pub fn wake_one(&self) -> bool {
        let thread = self.waiters.lock().pop_front();
        match thread {
            Some(thread) => {
                crate::sched::make_ready(thread);
                true
            }
            None => false,
        }
    }

    /// Wakes every parked thread; returns how many.
    pub fn wake_all(&self) -> usize {
        let drained: VecDeque<ThreadRef> = core::mem::take(&mut *self.waiters.lock());
        let count = drained.len();
        for thread in drained {
            crate::sched::make_ready(thread);
        }
        count
    }

    /// Blocks the calling thread until woken.
    #[cfg(target_os = "none")]
    pub fn sleep(&self) {
        let current = crate::sched::current_thread().expect("sleep without a current thread");
        self.enqueue(current);
        crate::sched::schedule();
    }

    /// Commits the calling thread to this queue, releases `guard`, then
    /// blocks. The queue insertion happens before the guard drops, so a
    /// waker serialized on the same lock cannot miss the sleeper.
    #[cfg(target_os = "none")]
    pub fn sleep_releasing<G>(&self, guard: G) {
        let current = crate::sched::current_thread().expect("sleep without a current thread");
        self.enqueue(current);
        drop(guard);
        crate::sched::schedule();
    }

    /// Blocks unless `ready` turns true after the thread has committed to
    /// the queue. For conditions without their own lock: a wake racing the
    /// commit leaves the thread runnable, and the re-check prevents a sleep
    /// that nothing would end.
    #[cfg(target_os = "none")]
    pub fn sleep_unless(&self, ready: &dyn Fn() -> bool) {
        use alloc::sync::Arc;

        let current = crate::sched::current_thread().expect("sleep without a current thread");
        self.enqueue(current.clone());
        if ready() {
            // The condition fired between the caller's check and our
            // commit; withdraw and keep running.
            let mut waiters = self.waiters.lock();
            if let Some(pos) = waiters.iter().position(|t| Arc::ptr_eq(t, &current)) {
                waiters.remove(pos);
            }
            drop(waiters);
            current.set_state(ThreadState::Running);
            return;
        }
        crate::sched::schedule();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Process;
    use crate::proc::thread::Thread;
    use crate::sched;

    fn noop(_: usize) {}

    #[test]
    fn wake_one_unblocks_exactly_one_in_fifo_order() {
        let _serial = crate::sched::test_sync::lock();
        let process = Process::new_kernel_for_tests("waiters");
        let a = Thread::create(&process, noop, 0);
        let b = Thread::create(&process, noop, 1);

        let queue = WaitQueue::new();
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        assert_eq!(a.state(), ThreadState::Blocked);
        assert_eq!(queue.len(), 2);

        assert!(queue.wake_one());
        assert_eq!(a.state(), ThreadState::Ready);
        assert_eq!(b.state(), ThreadState::Blocked);
        assert_eq!(queue.len(), 1);

        sched::test_drain_ready();
    }

    #[test]
    fn wake_all_loses_no_thread() {
        let _serial = crate::sched::test_sync::lock();
        let process = Process::new_kernel_for_tests("broadcast");
        let queue = WaitQueue::new();
        let threads: alloc::vec::Vec<_> =
            (0..5).map(|i| Thread::create(&process, noop, i)).collect();
        for t in &threads {
            queue.enqueue(t.clone());
        }

        assert_eq!(queue.wake_all(), 5);
        assert!(queue.is_empty());
        for t in &threads {
            assert_eq!(t.state(), ThreadState::Ready);
        }

        sched::test_drain_ready();
    }

    #[test]
    fn wake_on_empty_queue_is_noop() {
        let queue = WaitQueue::new();
        assert!(!queue.wake_one());
        assert_eq!(queue.wake_all(), 0);
    }
}
