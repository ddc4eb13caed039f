//! Kernel objects.
//!
//! Every resource userspace can hold a handle to implements [`KernelObject`].
//! Reference counting is `Arc`: handle tables, the namespace, channel
//! messages, and VMAs each hold one clone; the close operation is the
//! concrete type's `Drop` and runs exactly once when the last clone goes.
//! Objects embedded in larger records (channel endpoints, the VMO header)
//! release their resources on drop without freeing the containing record —
//! the container dies when its own owners are gone.

pub mod info;
pub mod klog;
pub mod ns;

use alloc::sync::Arc;
use core::any::Any;

use delta_syscall::{Dirent, Error, InfoTopic, Stat};

/// Object type tags, stable across the ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectType {
    /// Regular file exposed by a filesystem service.
    File = 1,
    /// Directory.
    Dir = 2,
    /// Device node.
    Device = 3,
    /// Byte pipe.
    Pipe = 4,
    /// The system introspection object.
    System = 5,
    /// A process.
    Process = 6,
    /// A thread.
    Thread = 7,
    /// A channel endpoint.
    Channel = 8,
    /// A virtual memory object.
    Vmo = 9,
    /// A network socket (owned by the network service).
    Socket = 10,
    /// Kernel-provided info object (the ring log).
    Info = 11,
    /// Synthetic namespace directory.
    NsDir = 12,
}

/// A reference-counted kernel object handle.
pub type ObjectRef = Arc<dyn KernelObject>;

/// The polymorphic object interface.
///
/// Every operation is optional; the defaults return
/// [`Error::Unsupported`]. Offsets are explicit so the per-handle file
/// position stays in the handle table, not the object.
pub trait KernelObject: Send + Sync + 'static {
    /// The object's type tag.
    fn obj_type(&self) -> ObjectType;

    /// Reads up to `buf.len()` bytes at `offset`. Short reads at EOF.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        let _ = (buf, offset);
        Err(Error::Unsupported)
    }

    /// Writes up to `buf.len()` bytes at `offset`.
    fn write(&self, buf: &[u8], offset: u64) -> Result<usize, Error> {
        let _ = (buf, offset);
        Err(Error::Unsupported)
    }

    /// Finds a child by name, returning a new reference.
    fn lookup(&self, name: &str) -> Result<ObjectRef, Error> {
        let _ = name;
        Err(Error::Unsupported)
    }

    /// Fills `entries` starting at `*index`; advances `*index` past the
    /// returned entries and reports how many were filled.
    fn readdir(&self, entries: &mut [Dirent], index: &mut u32) -> Result<usize, Error> {
        let _ = (entries, index);
        Err(Error::Unsupported)
    }

    /// Returns object status.
    fn stat(&self) -> Result<Stat, Error> {
        Err(Error::Unsupported)
    }

    /// Topic-based introspection; fills `buf` and returns the byte count.
    fn get_info(&self, topic: InfoTopic, buf: &mut [u8]) -> Result<usize, Error> {
        let _ = (topic, buf);
        Err(Error::Unsupported)
    }

    /// Downcast support for kernel code that needs the concrete type
    /// (channel endpoints, VMOs, processes).
    fn as_any(&self) -> &dyn Any;
}

/// Serializes a `#[repr(C)]` info structure into a caller buffer.
///
/// Fails with [`Error::InvalidArgument`] when the buffer is too small,
/// mirroring the get-info contract.
pub fn write_info_struct<T: Copy>(buf: &mut [u8], value: &T) -> Result<usize, Error> {
    let size = size_of::<T>();
    if buf.len() < size {
        return Err(Error::InvalidArgument);
    }
    // SAFETY: T is Copy and #[repr(C)] by convention of the info structs;
    // reading its bytes is always valid.
    let bytes = unsafe { core::slice::from_raw_parts(value as *const T as *const u8, size) };
    buf[..size].copy_from_slice(bytes);
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl KernelObject for Null {
        fn obj_type(&self) -> ObjectType {
            ObjectType::Device
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn defaults_are_unsupported() {
        let obj = Null;
        assert_eq!(obj.read(&mut [0u8; 4], 0), Err(Error::Unsupported));
        assert_eq!(obj.write(&[0u8; 4], 0), Err(Error::Unsupported));
        assert!(obj.lookup("x").is_err());
        assert!(obj.stat().is_err());
    }

    #[test]
    fn refcount_via_arc() {
        let obj: ObjectRef = Arc::new(Null);
        assert_eq!(Arc::strong_count(&obj), 1);
        let extra = obj.clone();
        assert_eq!(Arc::strong_count(&obj), 2);
        drop(extra);
        assert_eq!(Arc::strong_count(&obj), 1);
    }

    #[test]
    fn write_info_struct_checks_space() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Pair {
            a: u32,
            b: u32,
        }
        let value = Pair { a: 1, b: 2 };
        let mut small = [0u8; 4];
        assert!(write_info_struct(&mut small, &value).is_err());
        let mut big = [0u8; 16];
        assert_eq!(write_info_struct(&mut big, &value), Ok(8));
        assert_eq!(&big[..4], &1u32.to_le_bytes());
    }
}
