//! Kernel-side syscall dispatch.
//!
//! The kernel implements [`SyscallHandler`] and routes every numbered entry
//! through [`dispatch`]. Arguments arrive as raw machine words; each handler
//! is responsible for validating its own pointers and sizes. Unknown numbers
//! return `-Error::Unsupported.code()`.

use crate::{Error, SYS_MAX};

/// One method per syscall; implemented by the kernel's dispatch object.
#[allow(missing_docs, reason = "method names mirror the documented SYS_* constants")]
pub trait SyscallHandler {
    fn sys_exit(&self, status: usize) -> isize;
    fn sys_getpid(&self) -> isize;
    fn sys_yield(&self) -> isize;
    fn sys_debug_write(&self, buf: usize, len: usize) -> isize;
    fn sys_spawn(&self, path_ptr: usize, argc: usize, argv_ptr: usize) -> isize;
    fn sys_wait(&self, pid: usize) -> isize;
    fn sys_process_create(&self, name_ptr: usize) -> isize;
    fn sys_handle_grant(&self, proc_handle: usize, local_handle: usize, rights: usize) -> isize;
    fn sys_process_start(&self, proc_handle: usize, entry: usize, stack: usize) -> isize;

    fn sys_get_obj(&self, path_ptr: usize, rights: usize) -> isize;
    fn sys_handle_read(&self, handle: usize, buf: usize, len: usize) -> isize;
    fn sys_handle_write(&self, handle: usize, buf: usize, len: usize) -> isize;
    fn sys_handle_seek(&self, handle: usize, offset: usize, whence: usize) -> isize;
    fn sys_handle_close(&self, handle: usize) -> isize;
    fn sys_handle_dup(&self, handle: usize, new_rights: usize) -> isize;
    fn sys_ns_register(&self, path_ptr: usize, handle: usize) -> isize;

    fn sys_channel_create(&self, ep0_out: usize, ep1_out: usize) -> isize;
    fn sys_channel_send(
        &self,
        handle: usize,
        data: usize,
        len: usize,
        handles_ptr: usize,
        handle_count: usize,
    ) -> isize;
    fn sys_channel_recv(&self, handle: usize, buf: usize, buf_len: usize) -> isize;
    fn sys_channel_try_recv(&self, handle: usize, buf: usize, buf_len: usize) -> isize;
    fn sys_channel_recv_msg(
        &self,
        handle: usize,
        buf: usize,
        buf_len: usize,
        handles_out: usize,
        handles_cap: usize,
        result_out: usize,
    ) -> isize;
    fn sys_channel_try_recv_msg(
        &self,
        handle: usize,
        buf: usize,
        buf_len: usize,
        handles_out: usize,
        handles_cap: usize,
        result_out: usize,
    ) -> isize;

    fn sys_vmo_create(&self, size: usize, flags: usize, rights: usize) -> isize;
    fn sys_vmo_read(&self, handle: usize, buf: usize, len: usize, offset: usize) -> isize;
    fn sys_vmo_write(&self, handle: usize, buf: usize, len: usize, offset: usize) -> isize;
    fn sys_vmo_map(
        &self,
        handle: usize,
        vaddr_hint: usize,
        offset: usize,
        len: usize,
        map_rights: usize,
    ) -> isize;
    fn sys_vmo_unmap(&self, vaddr: usize, len: usize) -> isize;
    fn sys_vmo_resize(&self, handle: usize, new_size: usize) -> isize;

    fn sys_stat(&self, path_ptr: usize, stat_out: usize) -> isize;
    fn sys_fstat(&self, handle: usize, stat_out: usize) -> isize;
    fn sys_readdir(&self, handle: usize, entries: usize, count: usize) -> isize;
    fn sys_chdir(&self, path_ptr: usize) -> isize;
    fn sys_getcwd(&self, buf: usize, buf_len: usize) -> isize;

    fn sys_get_ticks(&self) -> isize;
    fn sys_object_get_info(&self, handle: usize, topic: usize, buf: usize, len: usize) -> isize;
}

/// Routes syscall `nr` with six raw arguments to the handler.
pub fn dispatch<H: SyscallHandler>(
    h: &H,
    nr: usize,
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> isize {
    use crate as abi;

    if nr >= SYS_MAX {
        return Error::Unsupported.to_ret();
    }

    match nr {
        abi::SYS_EXIT => h.sys_exit(a0),
        abi::SYS_GETPID => h.sys_getpid(),
        abi::SYS_YIELD => h.sys_yield(),
        abi::SYS_DEBUG_WRITE => h.sys_debug_write(a0, a1),
        abi::SYS_SPAWN => h.sys_spawn(a0, a1, a2),
        abi::SYS_WAIT => h.sys_wait(a0),
        abi::SYS_PROCESS_CREATE => h.sys_process_create(a0),
        abi::SYS_HANDLE_GRANT => h.sys_handle_grant(a0, a1, a2),
        abi::SYS_PROCESS_START => h.sys_process_start(a0, a1, a2),

        abi::SYS_GET_OBJ => h.sys_get_obj(a0, a1),
        abi::SYS_HANDLE_READ => h.sys_handle_read(a0, a1, a2),
        abi::SYS_HANDLE_WRITE => h.sys_handle_write(a0, a1, a2),
        abi::SYS_HANDLE_SEEK => h.sys_handle_seek(a0, a1, a2),
        abi::SYS_HANDLE_CLOSE => h.sys_handle_close(a0),
        abi::SYS_HANDLE_DUP => h.sys_handle_dup(a0, a1),
        abi::SYS_NS_REGISTER => h.sys_ns_register(a0, a1),

        abi::SYS_CHANNEL_CREATE => h.sys_channel_create(a0, a1),
        abi::SYS_CHANNEL_SEND => h.sys_channel_send(a0, a1, a2, a3, a4),
        abi::SYS_CHANNEL_RECV => h.sys_channel_recv(a0, a1, a2),
        abi::SYS_CHANNEL_TRY_RECV => h.sys_channel_try_recv(a0, a1, a2),
        abi::SYS_CHANNEL_RECV_MSG => h.sys_channel_recv_msg(a0, a1, a2, a3, a4, a5),
        abi::SYS_CHANNEL_TRY_RECV_MSG => h.sys_channel_try_recv_msg(a0, a1, a2, a3, a4, a5),

        abi::SYS_VMO_CREATE => h.sys_vmo_create(a0, a1, a2),
        abi::SYS_VMO_READ => h.sys_vmo_read(a0, a1, a2, a3),
        abi::SYS_VMO_WRITE => h.sys_vmo_write(a0, a1, a2, a3),
        abi::SYS_VMO_MAP => h.sys_vmo_map(a0, a1, a2, a3, a4),
        abi::SYS_VMO_UNMAP => h.sys_vmo_unmap(a0, a1),
        abi::SYS_VMO_RESIZE => h.sys_vmo_resize(a0, a1),

        abi::SYS_STAT => h.sys_stat(a0, a1),
        abi::SYS_FSTAT => h.sys_fstat(a0, a1),
        abi::SYS_READDIR => h.sys_readdir(a0, a1, a2),
        abi::SYS_CHDIR => h.sys_chdir(a0),
        abi::SYS_GETCWD => h.sys_getcwd(a0, a1),

        abi::SYS_GET_TICKS => h.sys_get_ticks(),
        abi::SYS_OBJECT_GET_INFO => h.sys_object_get_info(a0, a1, a2, a3),

        _ => Error::Unsupported.to_ret(),
    }
}
