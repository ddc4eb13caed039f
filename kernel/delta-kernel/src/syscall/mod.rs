//! Syscall dispatch.
//!
//! The assembly entry stub calls [`syscall_dispatch`] with the syscall
//! number and six raw arguments; routing happens through the
//! [`SyscallHandler`] trait from `delta-syscall`. Every handler validates
//! its own user pointers and operates against the current process.

pub mod userptr;

#[cfg(target_os = "none")]
mod channel;
#[cfg(target_os = "none")]
mod io;
#[cfg(target_os = "none")]
mod memory;
#[cfg(target_os = "none")]
mod object;
#[cfg(target_os = "none")]
mod process;

#[cfg(target_os = "none")]
use delta_syscall::{SyscallHandler, dispatch};

/// Converts a kernel result into the signed syscall return value.
#[cfg(target_os = "none")]
fn ret(result: Result<isize, delta_syscall::Error>) -> isize {
    match result {
        Ok(v) => v,
        Err(e) => e.to_ret(),
    }
}

/// Kernel syscall handler: one thin method per syscall, each delegating to
/// the owning subsystem.
#[cfg(target_os = "none")]
struct DeltaDispatch;

#[cfg(target_os = "none")]
impl SyscallHandler for DeltaDispatch {
    fn sys_exit(&self, status: usize) -> isize {
        process::sys_exit(status)
    }

    fn sys_getpid(&self) -> isize {
        process::sys_getpid()
    }

    fn sys_yield(&self) -> isize {
        process::sys_yield()
    }

    fn sys_debug_write(&self, buf: usize, len: usize) -> isize {
        ret(io::sys_debug_write(buf, len))
    }

    fn sys_spawn(&self, path_ptr: usize, argc: usize, argv_ptr: usize) -> isize {
        ret(process::sys_spawn(path_ptr, argc, argv_ptr))
    }

    fn sys_wait(&self, pid: usize) -> isize {
        ret(process::sys_wait(pid))
    }

    fn sys_process_create(&self, name_ptr: usize) -> isize {
        ret(process::sys_process_create(name_ptr))
    }

    fn sys_handle_grant(&self, proc_handle: usize, local_handle: usize, rights: usize) -> isize {
        ret(process::sys_handle_grant(proc_handle, local_handle, rights))
    }

    fn sys_process_start(&self, proc_handle: usize, entry: usize, stack: usize) -> isize {
        ret(process::sys_process_start(proc_handle, entry, stack))
    }

    fn sys_get_obj(&self, path_ptr: usize, rights: usize) -> isize {
        ret(object::sys_get_obj(path_ptr, rights))
    }

    fn sys_handle_read(&self, handle: usize, buf: usize, len: usize) -> isize {
        ret(object::sys_handle_read(handle, buf, len))
    }

    fn sys_handle_write(&self, handle: usize, buf: usize, len: usize) -> isize {
        ret(object::sys_handle_write(handle, buf, len))
    }

    fn sys_handle_seek(&self, handle: usize, offset: usize, whence: usize) -> isize {
        ret(object::sys_handle_seek(handle, offset, whence))
    }

    fn sys_handle_close(&self, handle: usize) -> isize {
        ret(object::sys_handle_close(handle))
    }

    fn sys_handle_dup(&self, handle: usize, new_rights: usize) -> isize {
        ret(object::sys_handle_dup(handle, new_rights))
    }

    fn sys_ns_register(&self, path_ptr: usize, handle: usize) -> isize {
        ret(object::sys_ns_register(path_ptr, handle))
    }

    fn sys_channel_create(&self, ep0_out: usize, ep1_out: usize) -> isize {
        ret(channel::sys_channel_create(ep0_out, ep1_out))
    }

    fn sys_channel_send(
        &self,
        handle: usize,
        data: usize,
        len: usize,
        handles_ptr: usize,
        handle_count: usize,
    ) -> isize {
        ret(channel::sys_channel_send(
            handle,
            data,
            len,
            handles_ptr,
            handle_count,
        ))
    }

    fn sys_channel_recv(&self, handle: usize, buf: usize, buf_len: usize) -> isize {
        ret(channel::sys_channel_recv(handle, buf, buf_len, true))
    }

    fn sys_channel_try_recv(&self, handle: usize, buf: usize, buf_len: usize) -> isize {
        ret(channel::sys_channel_recv(handle, buf, buf_len, false))
    }

    fn sys_channel_recv_msg(
        &self,
        handle: usize,
        buf: usize,
        buf_len: usize,
        handles_out: usize,
        handles_cap: usize,
        result_out: usize,
    ) -> isize {
        ret(channel::sys_channel_recv_msg(
            handle,
            buf,
            buf_len,
            handles_out,
            handles_cap,
            result_out,
            true,
        ))
    }

    fn sys_channel_try_recv_msg(
        &self,
        handle: usize,
        buf: usize,
        buf_len: usize,
        handles_out: usize,
        handles_cap: usize,
        result_out: usize,
    ) -> isize {
        ret(channel::sys_channel_recv_msg(
            handle,
            buf,
            buf_len,
            handles_out,
            handles_cap,
            result_out,
            false,
        ))
    }

    fn sys_vmo_create(&self, size: usize, flags: usize, rights: usize) -> isize {
        ret(memory::sys_vmo_create(size, flags, rights))
    }

    fn sys_vmo_read(&self, handle: usize, buf: usize, len: usize, offset: usize) -> isize {
        ret(memory::sys_vmo_read(handle, buf, len, offset))
    }

    fn sys_vmo_write(&self, handle: usize, buf: usize, len: usize, offset: usize) -> isize {
        ret(memory::sys_vmo_write(handle, buf, len, offset))
    }

    fn sys_vmo_map(
        &self,
        handle: usize,
        vaddr_hint: usize,
        offset: usize,
        len: usize,
        map_rights: usize,
    ) -> isize {
        ret(memory::sys_vmo_map(handle, vaddr_hint, offset, len, map_rights))
    }

    fn sys_vmo_unmap(&self, vaddr: usize, len: usize) -> isize {
        ret(memory::sys_vmo_unmap(vaddr, len))
    }

    fn sys_vmo_resize(&self, handle: usize, new_size: usize) -> isize {
        ret(memory::sys_vmo_resize(handle, new_size))
    }

    fn sys_stat(&self, path_ptr: usize, stat_out: usize) -> isize {
        ret(object::sys_stat(path_ptr, stat_out))
    }

    fn sys_fstat(&self, handle: usize, stat_out: usize) -> isize {
        ret(object::sys_fstat(handle, stat_out))
    }

    fn sys_readdir(&self, handle: usize, entries: usize, count: usize) -> isize {
        ret(object::sys_readdir(handle, entries, count))
    }

    fn sys_chdir(&self, path_ptr: usize) -> isize {
        ret(object::sys_chdir(path_ptr))
    }

    fn sys_getcwd(&self, buf: usize, buf_len: usize) -> isize {
        ret(object::sys_getcwd(buf, buf_len))
    }

    fn sys_get_ticks(&self) -> isize {
        crate::time::ticks() as isize
    }

    fn sys_object_get_info(&self, handle: usize, topic: usize, buf: usize, len: usize) -> isize {
        ret(object::sys_object_get_info(handle, topic, buf, len))
    }
}

#[cfg(target_os = "none")]
static DISPATCH: DeltaDispatch = DeltaDispatch;

/// Syscall entry, called from the assembly stub with the number and six
/// arguments. Unknown numbers fail with `Unsupported`.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn syscall_dispatch(
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    dispatch(&DISPATCH, nr, a0, a1, a2, a3, a4, a5)
}
