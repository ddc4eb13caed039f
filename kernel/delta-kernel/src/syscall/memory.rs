//! VMO syscalls.

use delta_core::addr::VirtAddr;
use delta_syscall::{Error, Rights};

use super::userptr::{USER_ADDR_MAX, UserSlice};
use crate::mm::vmo;

pub(super) fn sys_vmo_create(size: usize, flags: usize, rights: usize) -> Result<isize, Error> {
    let process = crate::proc::current();
    let rights = Rights::from_bits_truncate(rights as u32);
    let handle = vmo::create(&process, size, flags as u32, rights)?;
    Ok(handle as isize)
}

pub(super) fn sys_vmo_read(
    handle: usize,
    buf: usize,
    len: usize,
    offset: usize,
) -> Result<isize, Error> {
    let slice = UserSlice::new(buf, len)?;
    let process = crate::proc::current();
    // SAFETY: The range was validated against the user half.
    let n = vmo::read(
        &process,
        handle as i32,
        unsafe { slice.as_mut_slice() },
        offset as u64,
    )?;
    Ok(n as isize)
}

pub(super) fn sys_vmo_write(
    handle: usize,
    buf: usize,
    len: usize,
    offset: usize,
) -> Result<isize, Error> {
    let slice = UserSlice::new(buf, len)?;
    let process = crate::proc::current();
    // SAFETY: The range was validated against the user half.
    let n = vmo::write(
        &process,
        handle as i32,
        unsafe { slice.as_slice() },
        offset as u64,
    )?;
    Ok(n as isize)
}

pub(super) fn sys_vmo_map(
    handle: usize,
    vaddr_hint: usize,
    offset: usize,
    len: usize,
    map_rights: usize,
) -> Result<isize, Error> {
    if vaddr_hint >= USER_ADDR_MAX {
        return Err(Error::InvalidArgument);
    }
    let hint = if vaddr_hint == 0 {
        None
    } else {
        Some(VirtAddr::new(vaddr_hint as u64))
    };

    let process = crate::proc::current();
    let rights = Rights::from_bits_truncate(map_rights as u32);
    let vaddr = vmo::map(&process, handle as i32, hint, offset, len, rights)?;
    Ok(vaddr.as_u64() as isize)
}

pub(super) fn sys_vmo_unmap(vaddr: usize, len: usize) -> Result<isize, Error> {
    if vaddr == 0 || vaddr >= USER_ADDR_MAX {
        return Err(Error::InvalidArgument);
    }
    let process = crate::proc::current();
    vmo::unmap(&process, VirtAddr::new(vaddr as u64), len)?;
    Ok(0)
}

pub(super) fn sys_vmo_resize(handle: usize, new_size: usize) -> Result<isize, Error> {
    let process = crate::proc::current();
    vmo::resize(&process, handle as i32, new_size)?;
    Ok(0)
}
