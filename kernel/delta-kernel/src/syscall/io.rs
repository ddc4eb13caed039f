//! Debug output syscall.

use delta_syscall::Error;

use super::userptr::UserSlice;

/// Longest single debug write.
const DEBUG_WRITE_MAX: usize = 4096;

pub(super) fn sys_debug_write(buf: usize, len: usize) -> Result<isize, Error> {
    if len > DEBUG_WRITE_MAX {
        return Err(Error::InvalidArgument);
    }
    let slice = UserSlice::new(buf, len)?;
    // SAFETY: The range was validated against the user half.
    let bytes = unsafe { slice.as_slice() };

    // Mirror into the ring log and the console sinks.
    crate::obj::klog::KLOG.write_bytes(bytes);
    if let Ok(text) = core::str::from_utf8(bytes) {
        delta_core::kprint!("{}", text);
    }
    Ok(len as isize)
}
