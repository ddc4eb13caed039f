//! Handle and namespace syscalls.

use alloc::vec;

use delta_syscall::{
    Dirent, Error, Rights, SEEK_CUR, SEEK_END, SEEK_SET, Stat,
};

use super::userptr::{UserPtr, UserSlice, read_user_cstr};
use crate::obj::ns;

pub(super) fn sys_get_obj(path_ptr: usize, rights: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let path = unsafe { read_user_cstr(path_ptr)? };
    let rights = Rights::from_bits_truncate(rights as u32);

    let process = crate::proc::current();
    let obj = ns::open_path(&path, &process.cwd())?;
    let handle = process.with_handles(|t| t.grant(obj, rights))?;
    Ok(handle as isize)
}

pub(super) fn sys_handle_read(handle: usize, buf: usize, len: usize) -> Result<isize, Error> {
    let handle = handle as i32;
    let slice = UserSlice::new(buf, len)?;
    let process = crate::proc::current();

    process.with_handles(|t| t.check_rights(handle, Rights::READ))?;
    let (obj, offset) = process.with_handles(|t| {
        let entry = t.get(handle)?;
        Ok::<_, Error>((entry.obj.clone(), entry.offset))
    })?;

    // SAFETY: The range was validated; the current address space maps it.
    let n = obj.read(unsafe { slice.as_mut_slice() }, offset)?;
    process.with_handles(|t| {
        if let Ok(entry) = t.get_mut(handle) {
            entry.offset += n as u64;
        }
    });
    Ok(n as isize)
}

pub(super) fn sys_handle_write(handle: usize, buf: usize, len: usize) -> Result<isize, Error> {
    let handle = handle as i32;
    let slice = UserSlice::new(buf, len)?;
    let process = crate::proc::current();

    process.with_handles(|t| t.check_rights(handle, Rights::WRITE))?;
    let (obj, offset) = process.with_handles(|t| {
        let entry = t.get(handle)?;
        Ok::<_, Error>((entry.obj.clone(), entry.offset))
    })?;

    // SAFETY: The range was validated; the current address space maps it.
    let n = obj.write(unsafe { slice.as_slice() }, offset)?;
    process.with_handles(|t| {
        if let Ok(entry) = t.get_mut(handle) {
            entry.offset += n as u64;
        }
    });
    Ok(n as isize)
}

pub(super) fn sys_handle_seek(handle: usize, offset: usize, whence: usize) -> Result<isize, Error> {
    let handle = handle as i32;
    let offset = offset as i64;
    let process = crate::proc::current();

    let size = match whence {
        SEEK_END => {
            let obj = process.with_handles(|t| t.object(handle))?;
            obj.stat()?.size
        }
        SEEK_SET | SEEK_CUR => 0,
        _ => return Err(Error::InvalidArgument),
    };

    process.with_handles(|t| {
        let entry = t.get_mut(handle)?;
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => entry.offset as i64,
            _ => size as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(Error::InvalidArgument);
        }
        entry.offset = target as u64;
        Ok(entry.offset as isize)
    })
}

pub(super) fn sys_handle_close(handle: usize) -> Result<isize, Error> {
    let process = crate::proc::current();
    process.with_handles(|t| t.close(handle as i32))?;
    Ok(0)
}

pub(super) fn sys_handle_dup(handle: usize, new_rights: usize) -> Result<isize, Error> {
    let process = crate::proc::current();
    let rights = Rights::from_bits_truncate(new_rights as u32);
    let new = process.with_handles(|t| t.duplicate(handle as i32, rights))?;
    Ok(new as isize)
}

pub(super) fn sys_ns_register(path_ptr: usize, handle: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let path = unsafe { read_user_cstr(path_ptr)? };
    let process = crate::proc::current();
    let obj = process.with_handles(|t| t.object(handle as i32))?;
    ns::register(&path, obj)?;
    Ok(0)
}

pub(super) fn sys_stat(path_ptr: usize, stat_out: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let path = unsafe { read_user_cstr(path_ptr)? };
    let out = UserPtr::<Stat>::new(stat_out)?;

    let process = crate::proc::current();
    let obj = ns::open_path(&path, &process.cwd())?;
    let stat = obj.stat()?;
    // SAFETY: The pointer was validated and the mapping is current.
    unsafe { out.write(stat) };
    Ok(0)
}

pub(super) fn sys_fstat(handle: usize, stat_out: usize) -> Result<isize, Error> {
    let out = UserPtr::<Stat>::new(stat_out)?;
    let process = crate::proc::current();
    let obj = process.with_handles(|t| t.object(handle as i32))?;
    let stat = obj.stat()?;
    // SAFETY: The pointer was validated and the mapping is current.
    unsafe { out.write(stat) };
    Ok(0)
}

pub(super) fn sys_readdir(handle: usize, entries: usize, count: usize) -> Result<isize, Error> {
    const READDIR_MAX: usize = 128;

    let handle = handle as i32;
    let count = count.min(READDIR_MAX);
    let slice = UserSlice::new(entries, count * size_of::<Dirent>())?;

    let process = crate::proc::current();
    let (obj, offset) = process.with_handles(|t| {
        let entry = t.get(handle)?;
        Ok::<_, Error>((entry.obj.clone(), entry.offset))
    })?;

    // The handle offset doubles as the directory iteration cursor.
    let mut kernel_entries = vec![Dirent::default(); count];
    let mut index = offset as u32;
    let filled = obj.readdir(&mut kernel_entries, &mut index)?;

    // SAFETY: The output range was validated.
    let out = unsafe { slice.as_mut_slice() };
    for (i, entry) in kernel_entries[..filled].iter().enumerate() {
        let bytes = unsafe {
            core::slice::from_raw_parts(
                entry as *const Dirent as *const u8,
                size_of::<Dirent>(),
            )
        };
        out[i * size_of::<Dirent>()..(i + 1) * size_of::<Dirent>()].copy_from_slice(bytes);
    }

    process.with_handles(|t| {
        if let Ok(entry) = t.get_mut(handle) {
            entry.offset = index as u64;
        }
    });
    Ok(filled as isize)
}

pub(super) fn sys_chdir(path_ptr: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let path = unsafe { read_user_cstr(path_ptr)? };
    let process = crate::proc::current();

    let full = ns::absolutize(&path, &process.cwd())?;
    // The target must resolve to something directory-shaped.
    let obj = ns::open_path(&full, "/")?;
    match obj.stat() {
        Ok(stat) if stat.obj_type == crate::obj::ObjectType::Dir as u32
            || stat.obj_type == crate::obj::ObjectType::NsDir as u32 => {}
        Ok(_) => return Err(Error::InvalidArgument),
        Err(_) => return Err(Error::InvalidArgument),
    }
    process.set_cwd(&full);
    Ok(0)
}

pub(super) fn sys_getcwd(buf: usize, buf_len: usize) -> Result<isize, Error> {
    let process = crate::proc::current();
    let cwd = process.cwd();
    if buf_len < cwd.len() + 1 {
        return Err(Error::InvalidArgument);
    }
    let slice = UserSlice::new(buf, cwd.len() + 1)?;
    // SAFETY: The range was validated.
    let out = unsafe { slice.as_mut_slice() };
    out[..cwd.len()].copy_from_slice(cwd.as_bytes());
    out[cwd.len()] = 0;
    Ok(cwd.len() as isize)
}

pub(super) fn sys_object_get_info(
    handle: usize,
    topic: usize,
    buf: usize,
    len: usize,
) -> Result<isize, Error> {
    let handle = handle as i32;
    let topic = delta_syscall::InfoTopic::from_raw(topic as u32)
        .ok_or(Error::InvalidArgument)?;
    let slice = UserSlice::new(buf, len)?;

    let process = crate::proc::current();
    process.with_handles(|t| t.check_rights(handle, Rights::GET_INFO))?;
    let obj = process.with_handles(|t| t.object(handle))?;

    // SAFETY: The range was validated.
    let n = obj.get_info(topic, unsafe { slice.as_mut_slice() })?;
    Ok(n as isize)
}
