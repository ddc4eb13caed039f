//! Ring-buffered kernel log, exposed in the namespace as `$kernel/log`.
//!
//! Every log line is mirrored into a fixed ring; readers address the
//! retained window by offset through the generic object `read` op, so `cat
//! $kernel/log` works like any file.

use alloc::sync::Arc;
use core::any::Any;

use delta_core::sync::IrqSpinLock;
use delta_syscall::{Error, Stat};

use super::{KernelObject, ObjectType};

/// Ring capacity in bytes.
pub const KLOG_SIZE: usize = 16384;

struct RingState {
    buf: [u8; KLOG_SIZE],
    /// Next write position.
    head: usize,
    /// Bytes of valid data (saturates at the capacity).
    len: usize,
}

/// The ring buffer. Writable from any context, including inside interrupt
/// handlers, hence the IRQ lock.
pub struct KernelLog {
    state: IrqSpinLock<RingState>,
}

impl KernelLog {
    /// Creates an empty ring.
    pub const fn new() -> Self {
        Self {
            state: IrqSpinLock::new(RingState {
                buf: [0; KLOG_SIZE],
                head: 0,
                len: 0,
            }),
        }
    }

    /// Appends bytes, overwriting the oldest data when full.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        for &b in bytes {
            let head = state.head;
            state.buf[head] = b;
            state.head = (head + 1) % KLOG_SIZE;
            if state.len < KLOG_SIZE {
                state.len += 1;
            }
        }
    }

    /// Copies retained data starting at `offset` into `out`.
    ///
    /// Offset 0 is the oldest retained byte. Returns the bytes copied;
    /// short reads past the end.
    pub fn read_at(&self, out: &mut [u8], offset: usize) -> usize {
        let state = self.state.lock();
        if offset >= state.len {
            return 0;
        }
        let n = out.len().min(state.len - offset);
        let tail = (state.head + KLOG_SIZE - state.len) % KLOG_SIZE;
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = state.buf[(tail + offset + i) % KLOG_SIZE];
        }
        n
    }

    /// Bytes of retained data.
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    /// Whether nothing has been logged yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KernelLog {
    fn default() -> Self {
        Self::new()
    }
}

/// The global ring shared by the logger sink and the namespace object.
pub static KLOG: KernelLog = KernelLog::new();

/// The `$kernel/log` object: read-only view of [`KLOG`].
pub struct KlogObject;

impl KlogObject {
    /// Creates the object; the boot path registers it in the namespace.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl KernelObject for KlogObject {
    fn obj_type(&self) -> ObjectType {
        ObjectType::Info
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        Ok(KLOG.read_at(buf, offset as usize))
    }

    fn stat(&self) -> Result<Stat, Error> {
        Ok(Stat {
            obj_type: ObjectType::File as u32,
            _pad: 0,
            size: KLOG.len() as u64,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_in_order() {
        let ring = KernelLog::new();
        ring.write_bytes(b"hello ");
        ring.write_bytes(b"world");
        let mut out = [0u8; 16];
        let n = ring.read_at(&mut out, 0);
        assert_eq!(&out[..n], b"hello world");
    }

    #[test]
    fn offset_reads_and_eof() {
        let ring = KernelLog::new();
        ring.write_bytes(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(ring.read_at(&mut out, 2), 4);
        assert_eq!(&out, b"cdef");
        assert_eq!(ring.read_at(&mut out, 6), 0);
        assert_eq!(ring.read_at(&mut out, 100), 0);
    }

    #[test]
    fn wraps_and_keeps_newest() {
        let ring = KernelLog::new();
        // Overfill by 8 bytes.
        let chunk = [b'x'; 1024];
        for _ in 0..KLOG_SIZE / 1024 {
            ring.write_bytes(&chunk);
        }
        ring.write_bytes(b"ABCDEFGH");
        assert_eq!(ring.len(), KLOG_SIZE);

        // The last 8 bytes of the window are the newest data.
        let mut out = [0u8; 8];
        let n = ring.read_at(&mut out, KLOG_SIZE - 8);
        assert_eq!(&out[..n], b"ABCDEFGH");
        // The oldest byte is an 'x' (the 8 displaced bytes are gone).
        let mut first = [0u8; 1];
        ring.read_at(&mut first, 0);
        assert_eq!(first[0], b'x');
    }
}
