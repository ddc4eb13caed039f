//! Channel syscalls.

use delta_syscall::{CHANNEL_MAX_MSG_HANDLES, ChannelRecvResult, Error, Rights};

use super::userptr::{UserPtr, UserSlice};
use crate::ipc::channel;

/// Rights granted on freshly created endpoints.
fn endpoint_rights() -> Rights {
    Rights::READ | Rights::WRITE | Rights::TRANSFER | Rights::DUPLICATE | Rights::WAIT
}

pub(super) fn sys_channel_create(ep0_out: usize, ep1_out: usize) -> Result<isize, Error> {
    let out0 = UserPtr::<i32>::new(ep0_out)?;
    let out1 = UserPtr::<i32>::new(ep1_out)?;

    let process = crate::proc::current();
    let (h0, h1) = channel::create(&process, endpoint_rights())?;
    // SAFETY: Both pointers were validated against the user range.
    unsafe {
        out0.write(h0);
        out1.write(h1);
    }
    Ok(0)
}

pub(super) fn sys_channel_send(
    handle: usize,
    data: usize,
    len: usize,
    handles_ptr: usize,
    handle_count: usize,
) -> Result<isize, Error> {
    if handle_count > CHANNEL_MAX_MSG_HANDLES {
        return Err(Error::InvalidArgument);
    }
    let data_slice = UserSlice::new(data, len)?;
    let handles_slice = UserSlice::new(handles_ptr, handle_count * size_of::<i32>())?;

    let process = crate::proc::current();

    // Copy arguments out of user memory before any table mutation.
    // SAFETY: Both ranges were validated.
    let payload = unsafe { data_slice.as_slice() };
    let mut attached = [0i32; CHANNEL_MAX_MSG_HANDLES];
    if handle_count > 0 {
        // SAFETY: As above.
        let raw = unsafe { handles_slice.as_slice() };
        for (i, chunk) in raw.chunks_exact(4).enumerate() {
            attached[i] = i32::from_le_bytes(chunk.try_into().unwrap());
        }
    }

    channel::send(&process, handle as i32, payload, &attached[..handle_count])?;
    Ok(0)
}

pub(super) fn sys_channel_recv(
    handle: usize,
    buf: usize,
    buf_len: usize,
    blocking: bool,
) -> Result<isize, Error> {
    let slice = UserSlice::new(buf, buf_len)?;
    let process = crate::proc::current();

    let message = if blocking {
        channel::recv(&process, handle as i32)?
    } else {
        channel::try_recv(&process, handle as i32)?
    };

    // Data-only receive: objects the caller has no way to name are
    // released rather than silently parked in its table.
    let n = message.data.len().min(buf_len);
    // SAFETY: The output range was validated.
    unsafe { slice.as_mut_slice()[..n].copy_from_slice(&message.data[..n]) };
    Ok(n as isize)
}

pub(super) fn sys_channel_recv_msg(
    handle: usize,
    buf: usize,
    buf_len: usize,
    handles_out: usize,
    handles_cap: usize,
    result_out: usize,
    blocking: bool,
) -> Result<isize, Error> {
    let data_slice = UserSlice::new(buf, buf_len)?;
    let handles_slice = UserSlice::new(handles_out, handles_cap * size_of::<i32>())?;
    let result_ptr = UserPtr::<ChannelRecvResult>::new(result_out)?;

    let process = crate::proc::current();
    let mut message = if blocking {
        channel::recv(&process, handle as i32)?
    } else {
        channel::try_recv(&process, handle as i32)?
    };

    if message.objects.len() > handles_cap {
        // Not enough room to hand over the carried handles; the caller
        // loses the message otherwise, so fail loudly. The objects drop
        // with the message.
        return Err(Error::InvalidArgument);
    }

    let granted = channel::grant_received(&process, &mut message)?;

    let n = message.data.len().min(buf_len);
    // SAFETY: All output ranges were validated.
    unsafe {
        data_slice.as_mut_slice()[..n].copy_from_slice(&message.data[..n]);
        let out = handles_slice.as_mut_slice();
        for (i, &h) in granted.iter().enumerate() {
            out[i * 4..(i + 1) * 4].copy_from_slice(&h.to_le_bytes());
        }
        result_ptr.write(ChannelRecvResult {
            data_len: n as u64,
            handle_count: granted.len() as u32,
            sender_pid: message.sender_pid,
        });
    }
    Ok(n as isize)
}
