//! Processes: pid, name, cwd, capability table, address space, VMAs,
//! threads, and exit state.
//!
//! The kernel process is pid 0 and has no user pagemap; it owns handles
//! created from kernel context before any userspace exists. A process is
//! destroyed only after its last thread has been reaped.

pub mod exec;
pub mod thread;
pub mod vma;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use delta_core::sync::SpinLock;
use delta_syscall::{Error, InfoTopic, ProcessBasicInfo, copy_name};

use crate::cap::HandleTable;
use crate::mm::vmm::Pagemap;
use crate::obj::{KernelObject, ObjectType};
use crate::sched::wait::WaitQueue;
use crate::proc::thread::ThreadRef;
use crate::proc::vma::VmaList;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessState {
    /// Created, not yet started.
    Ready = 0,
    /// Has runnable threads.
    Running = 1,
    /// All threads blocked.
    Blocked = 2,
    /// Torn down.
    Dead = 3,
    /// Exited, not yet reaped by a waiter.
    Zombie = 4,
}

impl ProcessState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Blocked,
            4 => Self::Zombie,
            _ => Self::Dead,
        }
    }
}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// State behind the process lock: the thread list and the handle table are
/// serialized here, as are the VMAs and the cwd.
struct ProcessInner {
    cwd: String,
    handles: HandleTable,
    vmas: VmaList,
    threads: Vec<ThreadRef>,
}

/// A process.
pub struct Process {
    /// Process id; 0 is the kernel process.
    pub pid: u64,
    /// Parent process id (0 for init and the kernel).
    pub parent_pid: u64,
    /// Human-readable name.
    pub name: String,
    state: AtomicU32,
    /// User pagemap; `None` for the kernel process.
    pagemap: SpinLock<Option<Pagemap>>,
    inner: SpinLock<ProcessInner>,
    exit_code: AtomicI64,
    /// Woken when the process exits.
    pub exit_wait: WaitQueue,
}

impl Process {
    fn alloc(name: &str, pid: u64, parent_pid: u64, pagemap: Option<Pagemap>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            parent_pid,
            name: name.to_string(),
            state: AtomicU32::new(ProcessState::Ready as u32),
            pagemap: SpinLock::new(pagemap),
            inner: SpinLock::new(ProcessInner {
                cwd: String::from("/"),
                handles: HandleTable::new(),
                vmas: VmaList::new(),
                threads: Vec::new(),
            }),
            exit_code: AtomicI64::new(0),
            exit_wait: WaitQueue::new(),
        })
    }

    /// Creates a kernel-side process (no user pagemap) and registers it.
    pub fn create(name: &str, parent_pid: u64) -> Arc<Self> {
        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let process = Self::alloc(name, pid, parent_pid, None);
        register(&process);
        process
    }

    /// Creates a suspended user process with a fresh pagemap.
    ///
    /// The pagemap's upper half aliases the kernel's; the process starts
    /// with no threads and is started explicitly.
    #[cfg(target_os = "none")]
    pub fn create_user(name: &str, parent_pid: u64) -> Result<Arc<Self>, Error> {
        use crate::mm::{pmm, vmm};

        let pagemap = vmm::with_vmm(|vmm| {
            // SAFETY: The kernel root is valid for the life of the system
            // and the PMM hands out unused frames.
            unsafe {
                Pagemap::new_user(vmm.kernel_root(), vmm.mapper(), &mut || pmm::alloc(1))
            }
        })
        .ok_or(Error::ResourceExhausted)?;

        let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        let process = Self::alloc(name, pid, parent_pid, Some(pagemap));
        register(&process);
        Ok(process)
    }

    /// Test constructor: a kernel-style process, registered like any other.
    #[cfg(any(test, not(target_os = "none")))]
    pub fn new_kernel_for_tests(name: &str) -> Arc<Self> {
        let process = Self::alloc(name, NEXT_PID.fetch_add(1, Ordering::Relaxed), 0, None);
        register(&process);
        process
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Updates the lifecycle state.
    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// The recorded exit code (meaningful once `Zombie` or `Dead`).
    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Root of the user pagemap, if any.
    pub fn pagemap_root(&self) -> Option<delta_core::addr::PhysAddr> {
        self.pagemap.lock().as_ref().map(Pagemap::root)
    }

    /// Whether this is a user process.
    pub fn is_user(&self) -> bool {
        self.pagemap.lock().is_some()
    }

    /// Runs `f` with the handle table locked.
    pub fn with_handles<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        f(&mut self.inner.lock().handles)
    }

    /// Runs `f` with the VMA list locked.
    pub fn with_vmas<R>(&self, f: impl FnOnce(&mut VmaList) -> R) -> R {
        f(&mut self.inner.lock().vmas)
    }

    /// The current working directory.
    pub fn cwd(&self) -> String {
        self.inner.lock().cwd.clone()
    }

    /// Replaces the current working directory.
    pub fn set_cwd(&self, cwd: &str) {
        self.inner.lock().cwd = cwd.to_string();
    }

    /// Links a freshly created thread into the thread list.
    pub(crate) fn link_thread(&self, thread: ThreadRef) {
        self.inner.lock().threads.push(thread);
    }

    /// Unlinks a reaped thread; returns how many threads remain.
    pub(crate) fn unlink_thread(&self, thread: &ThreadRef) -> usize {
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| !Arc::ptr_eq(t, thread));
        inner.threads.len()
    }

    /// Number of live threads.
    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }

    /// Records the exit code, marks the process a zombie, and wakes waiters.
    pub fn note_exit(&self, code: i64) {
        self.exit_code.store(code, Ordering::Release);
        self.set_state(ProcessState::Zombie);
        self.exit_wait.wake_all();
    }

    /// Approximate resident memory: the sum of VMA lengths.
    fn memory_usage(&self) -> u64 {
        self.inner.lock().vmas.iter().map(|v| v.length).sum()
    }
}

impl KernelObject for Process {
    fn obj_type(&self) -> ObjectType {
        ObjectType::Process
    }

    fn get_info(&self, topic: InfoTopic, buf: &mut [u8]) -> Result<usize, Error> {
        match topic {
            InfoTopic::ProcessBasic => {
                let mut info = ProcessBasicInfo {
                    pid: self.pid as u32,
                    parent_pid: self.parent_pid as u32,
                    status: self.state() as u32,
                    memory_usage: self.memory_usage(),
                    ..ProcessBasicInfo::default()
                };
                copy_name(&mut info.name, &self.name);
                crate::obj::write_info_struct(buf, &info)
            }
            _ => Err(Error::Unsupported),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Global process table
// ---------------------------------------------------------------------------

static PROCESSES: SpinLock<Vec<Arc<Process>>> = SpinLock::new(Vec::new());

static KERNEL_PROCESS: SpinLock<Option<Arc<Process>>> = SpinLock::new(None);

/// Creates the kernel process (pid 0). Called once during boot.
///
/// # Panics
///
/// Panics on double initialization.
pub fn init() {
    let process = Process::alloc("kernel", 0, 0, None);
    process.set_state(ProcessState::Running);
    register(&process);
    let mut kernel = KERNEL_PROCESS.lock();
    assert!(kernel.is_none(), "process table already initialized");
    *kernel = Some(process);
}

/// The kernel process (pid 0).
///
/// # Panics
///
/// Panics before [`init`].
pub fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS
        .lock()
        .clone()
        .expect("process table not initialized")
}

/// The process the calling thread belongs to; the kernel process when no
/// thread is scheduled yet.
pub fn current() -> Arc<Process> {
    match crate::sched::current_thread() {
        Some(thread) => thread.process.clone(),
        None => kernel_process(),
    }
}

fn register(process: &Arc<Process>) {
    PROCESSES.lock().push(process.clone());
}

fn unregister(process: &Arc<Process>) {
    PROCESSES.lock().retain(|p| !Arc::ptr_eq(p, process));
}

/// Finds a process by pid.
pub fn find(pid: u64) -> Option<Arc<Process>> {
    PROCESSES.lock().iter().find(|p| p.pid == pid).cloned()
}

/// Runs `f` over a snapshot of all processes.
///
/// The snapshot is taken under the table lock but `f` runs outside it, so
/// callbacks may take per-process locks freely.
pub fn for_each(mut f: impl FnMut(&Arc<Process>)) {
    let snapshot: Vec<Arc<Process>> = PROCESSES.lock().clone();
    for process in &snapshot {
        f(process);
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Destroys a process: wakes exit waiters, drops every handle, releases
/// anonymous VMA frames, tears down the user pagemap, and unlinks the
/// process from the table.
///
/// Called from the reaper once the last thread is gone; the record itself
/// is freed when the final reference drops.
pub fn destroy(process: &Arc<Process>) {
    process.set_state(ProcessState::Dead);
    process.exit_wait.wake_all();

    // Drop every capability.
    process.with_handles(HandleTable::clear);

    // Release the address space.
    let vmas = process.with_vmas(VmaList::drain);
    let pagemap = process.pagemap.lock().take();

    #[cfg(target_os = "none")]
    release_address_space(vmas, pagemap);
    #[cfg(not(target_os = "none"))]
    {
        // Host builds have no page tables; dropping the VMAs releases the
        // backing object references.
        drop(vmas);
        drop(pagemap);
    }

    unregister(process);
}

/// Frees anonymous VMA frames through the pagemap walk, then the lower-half
/// paging structures. Backed VMAs only drop their object reference — the
/// object owns the pages.
#[cfg(target_os = "none")]
fn release_address_space(vmas: Vec<vma::Vma>, pagemap: Option<Pagemap>) {
    use delta_core::addr::PAGE_SIZE;

    let Some(pagemap) = pagemap else {
        return;
    };

    crate::mm::vmm::with_vmm(|vmm| {
        let root = pagemap.root();
        for area in &vmas {
            if area.backing.is_some() {
                continue;
            }
            // Anonymous memory: this VMA owns its frames.
            let pages = (area.length as usize).div_ceil(PAGE_SIZE);
            for i in 0..pages {
                let v = area.start + (i * PAGE_SIZE) as u64;
                // SAFETY: The pagemap is no longer loaded on any CPU.
                let phys = unsafe { vmm.mapper().translate_addr(root, v) };
                if let Some(phys) = phys {
                    // SAFETY: As above; the frame becomes unreferenced.
                    unsafe { vmm.unmap_range(root, v, 1) };
                    crate::mm::pmm::free(phys.align_down(PAGE_SIZE as u64), 1);
                }
            }
        }
        drop(vmas);

        // SAFETY: No CPU has this pagemap loaded; only table frames are
        // freed, leaf ownership was settled above.
        unsafe {
            pagemap.destroy_user(vmm.mapper(), &mut |frame| crate::mm::pmm::free(frame, 1));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::ObjectRef;
    use delta_syscall::Rights;

    struct Dummy;
    impl KernelObject for Dummy {
        fn obj_type(&self) -> ObjectType {
            ObjectType::Device
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn destroy_drops_handle_references() {
        let process = Process::new_kernel_for_tests("victim");
        let obj: ObjectRef = Arc::new(Dummy);
        let baseline = Arc::strong_count(&obj);

        process
            .with_handles(|t| t.grant(obj.clone(), Rights::READ))
            .unwrap();
        assert_eq!(Arc::strong_count(&obj), baseline + 1);

        destroy(&process);
        assert_eq!(Arc::strong_count(&obj), baseline);
        assert_eq!(process.state(), ProcessState::Dead);
    }

    #[test]
    fn note_exit_records_code_and_state() {
        let process = Process::new_kernel_for_tests("exiting");
        process.note_exit(42);
        assert_eq!(process.exit_code(), 42);
        assert_eq!(process.state(), ProcessState::Zombie);
    }

    #[test]
    fn get_info_reports_basics() {
        let process = Process::new_kernel_for_tests("stat-me");
        let mut buf = [0u8; size_of::<ProcessBasicInfo>()];
        let n = process
            .get_info(InfoTopic::ProcessBasic, &mut buf)
            .unwrap();
        assert_eq!(n, size_of::<ProcessBasicInfo>());
        // pid is the first field.
        let pid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(pid as u64, process.pid);
    }
}
