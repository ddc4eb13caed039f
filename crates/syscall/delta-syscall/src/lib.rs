//! Single source of truth for the DeltaOS syscall ABI.
//!
//! Shared between the kernel and userspace: syscall numbers, the error
//! taxonomy with its stable negative codes, capability rights bits, object
//! types, object-info topics and their `#[repr(C)]` structures, aux-vector
//! tags, and the kernel-side [`SyscallHandler`] trait with its
//! [`dispatch`] function.

#![cfg_attr(not(test), no_std)]

mod dispatch;
mod error;
mod info;
mod rights;

pub use dispatch::{SyscallHandler, dispatch};
pub use error::Error;
pub use info::{
    ChannelRecvResult, InfoTopic, KmemStats, ProcessBasicInfo, SystemStats, ThreadStats,
    TimeStats, copy_name,
};
pub use rights::Rights;

// ---------------------------------------------------------------------------
// Syscall numbers
// ---------------------------------------------------------------------------

/// Terminate the calling process.
pub const SYS_EXIT: usize = 0;
/// Return the calling process id.
pub const SYS_GETPID: usize = 1;
/// Yield the CPU to another thread.
pub const SYS_YIELD: usize = 2;
/// Write bytes to the kernel debug log.
pub const SYS_DEBUG_WRITE: usize = 3;
/// Load and start an executable; returns the child pid.
pub const SYS_SPAWN: usize = 4;
/// Resolve a namespace path to a handle with requested rights.
pub const SYS_GET_OBJ: usize = 5;
/// Read from a handle at its current offset.
pub const SYS_HANDLE_READ: usize = 6;
/// Write to a handle at its current offset.
pub const SYS_HANDLE_WRITE: usize = 7;
/// Reposition a handle's offset.
pub const SYS_HANDLE_SEEK: usize = 8;

/// Close a handle.
pub const SYS_HANDLE_CLOSE: usize = 32;
/// Duplicate a handle with equal or reduced rights.
pub const SYS_HANDLE_DUP: usize = 33;
/// Create a channel; returns two endpoint handles.
pub const SYS_CHANNEL_CREATE: usize = 34;
/// Send a message on a channel endpoint.
pub const SYS_CHANNEL_SEND: usize = 35;
/// Blocking receive of message data only.
pub const SYS_CHANNEL_RECV: usize = 36;
/// Create a virtual memory object; returns a handle.
pub const SYS_VMO_CREATE: usize = 37;
/// Read from a VMO at an explicit offset.
pub const SYS_VMO_READ: usize = 38;
/// Write to a VMO at an explicit offset.
pub const SYS_VMO_WRITE: usize = 39;
/// Map a VMO into the calling address space.
pub const SYS_VMO_MAP: usize = 40;
/// Unmap a previously mapped VMO range.
pub const SYS_VMO_UNMAP: usize = 41;
/// Register a handle's object under a namespace path.
pub const SYS_NS_REGISTER: usize = 42;
/// Get file status by path.
pub const SYS_STAT: usize = 43;
/// Non-blocking receive of message data only.
pub const SYS_CHANNEL_TRY_RECV: usize = 44;
/// Blocking receive including transferred handles.
pub const SYS_CHANNEL_RECV_MSG: usize = 45;
/// Non-blocking receive including transferred handles.
pub const SYS_CHANNEL_TRY_RECV_MSG: usize = 46;
/// Block until a child process exits; returns its exit code.
pub const SYS_WAIT: usize = 47;

/// Create a suspended process; returns a process handle.
pub const SYS_PROCESS_CREATE: usize = 50;
/// Inject a local handle into a suspended child.
pub const SYS_HANDLE_GRANT: usize = 51;
/// Start the initial thread of a suspended process.
pub const SYS_PROCESS_START: usize = 52;
/// Resize a resizable VMO.
pub const SYS_VMO_RESIZE: usize = 53;
/// Read directory entries through a handle.
pub const SYS_READDIR: usize = 54;
/// Change the current working directory.
pub const SYS_CHDIR: usize = 55;
/// Get the current working directory.
pub const SYS_GETCWD: usize = 56;
/// Timer ticks since boot.
pub const SYS_GET_TICKS: usize = 57;
/// Get file status by handle.
pub const SYS_FSTAT: usize = 60;
/// Topic-based object introspection.
pub const SYS_OBJECT_GET_INFO: usize = 63;

/// One past the highest valid syscall number.
pub const SYS_MAX: usize = 256;

// ---------------------------------------------------------------------------
// ABI limits
// ---------------------------------------------------------------------------

/// Handle value representing "no handle".
pub const INVALID_HANDLE: i32 = -1;

/// Maximum channel message payload in bytes.
pub const CHANNEL_MAX_MSG_SIZE: usize = 4096;

/// Maximum handles attached to one channel message.
pub const CHANNEL_MAX_MSG_HANDLES: usize = 64;

/// Bounded depth of each endpoint's message queue.
pub const CHANNEL_MSG_QUEUE_SIZE: usize = 16;

/// Maximum executable size accepted by `spawn`.
pub const SPAWN_MAX_FILE_SIZE: usize = 32 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Seek modes
// ---------------------------------------------------------------------------

/// Seek relative to the start of the object.
pub const SEEK_SET: usize = 0;
/// Seek relative to the current offset.
pub const SEEK_CUR: usize = 1;
/// Seek relative to the object size (from `stat`).
pub const SEEK_END: usize = 2;

// ---------------------------------------------------------------------------
// VMO flags
// ---------------------------------------------------------------------------

/// The VMO may be resized after creation.
pub const VMO_FLAG_RESIZABLE: u32 = 1 << 0;

// ---------------------------------------------------------------------------
// Aux vector tags (userspace startup)
// ---------------------------------------------------------------------------

/// End of the aux vector.
pub const AT_NULL: u64 = 0;
/// Address of the program headers.
pub const AT_PHDR: u64 = 3;
/// Size of one program header entry.
pub const AT_PHENT: u64 = 4;
/// Number of program headers.
pub const AT_PHNUM: u64 = 5;
/// System page size.
pub const AT_PAGESZ: u64 = 6;
/// Base address of the dynamic interpreter.
pub const AT_BASE: u64 = 7;
/// Program entry point.
pub const AT_ENTRY: u64 = 9;
/// Address of 16 random bytes.
pub const AT_RANDOM: u64 = 25;

/// One aux vector entry as laid out on the user stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct AuxvEntry {
    /// Entry tag (`AT_*`).
    pub a_type: u64,
    /// Entry value.
    pub a_val: u64,
}

// ---------------------------------------------------------------------------
// Stat / dirent (generic object interface)
// ---------------------------------------------------------------------------

/// Object status as returned by `stat` / `fstat`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    /// Object type tag (one of the `ObjectType` discriminants).
    pub obj_type: u32,
    /// Padding for alignment.
    pub _pad: u32,
    /// Size in bytes, where meaningful.
    pub size: u64,
}

/// Maximum directory entry name length including the NUL terminator.
pub const DIRENT_NAME_MAX: usize = 64;

/// One directory entry as filled by `readdir`.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Dirent {
    /// NUL-terminated entry name.
    pub name: [u8; DIRENT_NAME_MAX],
    /// Object type tag of the entry.
    pub entry_type: u32,
    /// Padding for alignment.
    pub _pad: u32,
}

impl Default for Dirent {
    fn default() -> Self {
        Self {
            name: [0; DIRENT_NAME_MAX],
            entry_type: 0,
            _pad: 0,
        }
    }
}

impl Dirent {
    /// Sets the entry name, truncating to the fixed buffer.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(DIRENT_NAME_MAX - 1);
        self.name[..len].copy_from_slice(&bytes[..len]);
        self.name[len] = 0;
    }

    /// Returns the entry name up to the NUL terminator.
    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIRENT_NAME_MAX);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}
