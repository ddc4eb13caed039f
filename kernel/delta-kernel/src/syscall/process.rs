//! Process lifecycle syscalls.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use delta_core::addr::VirtAddr;
use delta_syscall::{Error, Rights};

use super::userptr::{UserPtr, read_user_cstr};
use crate::proc::thread::Thread;
use crate::proc::{self, Process, ProcessState, exec};

/// Most argv entries accepted by spawn.
const SPAWN_ARGV_MAX: usize = 64;

pub(super) fn sys_exit(status: usize) -> isize {
    let process = proc::current();
    process.note_exit(status as i64);
    crate::sched::exit();
}

pub(super) fn sys_getpid() -> isize {
    proc::current().pid as isize
}

pub(super) fn sys_yield() -> isize {
    crate::sched::yield_now();
    0
}

pub(super) fn sys_spawn(path_ptr: usize, argc: usize, argv_ptr: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let path = unsafe { read_user_cstr(path_ptr)? };

    let argc = argc.min(SPAWN_ARGV_MAX);
    let mut argv_strings: Vec<String> = Vec::with_capacity(argc);
    if argc > 0 {
        for i in 0..argc {
            let slot = UserPtr::<u64>::new(argv_ptr + i * 8)?;
            // SAFETY: The slot address was validated; the argv array lives
            // in the caller's address space.
            let str_ptr = unsafe { slot.read() } as usize;
            // SAFETY: As above for the string bytes.
            argv_strings.push(unsafe { read_user_cstr(str_ptr)? });
        }
    }
    let argv_refs: Vec<&str> = argv_strings.iter().map(String::as_str).collect();

    let pid = exec::spawn(&path, &argv_refs)?;
    Ok(pid as isize)
}

pub(super) fn sys_wait(pid: usize) -> Result<isize, Error> {
    let code = exec::wait(pid as u64)?;
    Ok(code as isize)
}

pub(super) fn sys_process_create(name_ptr: usize) -> Result<isize, Error> {
    // SAFETY: The string pages belong to the current user address space.
    let name = unsafe { read_user_cstr(name_ptr)? };
    let parent = proc::current();

    let child = Process::create_user(&name, parent.pid)?;
    // The creator gets a process handle it can configure and start.
    let handle = parent.with_handles(|t| {
        t.grant(
            child.clone(),
            Rights::DUPLICATE | Rights::TRANSFER | Rights::GET_INFO | Rights::WAIT,
        )
    })?;
    Ok(handle as isize)
}

/// Resolves a process handle back to the process record.
fn process_of(caller: &Arc<Process>, handle: i32) -> Result<Arc<Process>, Error> {
    let obj = caller.with_handles(|t| t.object(handle))?;
    let pid = obj
        .as_any()
        .downcast_ref::<Process>()
        .ok_or(Error::InvalidArgument)?
        .pid;
    proc::find(pid).ok_or(Error::NotFound)
}

pub(super) fn sys_handle_grant(
    proc_handle: usize,
    local_handle: usize,
    rights: usize,
) -> Result<isize, Error> {
    let caller = proc::current();
    let target = process_of(&caller, proc_handle as i32)?;
    if target.state() != ProcessState::Ready {
        // Injection is how a parent configures a suspended child; a
        // running child manages its own table.
        return Err(Error::BadState);
    }

    let (obj, entry_rights) = caller.with_handles(|t| {
        let entry = t.get(local_handle as i32)?;
        Ok::<_, Error>((entry.obj.clone(), entry.rights))
    })?;
    // The child never receives more authority than the parent held.
    let granted = entry_rights.reduce(Rights::from_bits_truncate(rights as u32));

    let handle = target.with_handles(|t| t.grant(obj, granted))?;
    Ok(handle as isize)
}

pub(super) fn sys_process_start(
    proc_handle: usize,
    entry: usize,
    stack: usize,
) -> Result<isize, Error> {
    let caller = proc::current();
    let target = process_of(&caller, proc_handle as i32)?;
    if target.state() != ProcessState::Ready {
        return Err(Error::BadState);
    }
    if entry >= super::userptr::USER_ADDR_MAX || stack > super::userptr::USER_ADDR_MAX {
        return Err(Error::InvalidArgument);
    }

    target.set_state(ProcessState::Running);
    let thread = Thread::create_user(
        &target,
        VirtAddr::new(entry as u64),
        VirtAddr::new(stack as u64),
    );
    crate::sched::add(thread);
    Ok(0)
}
