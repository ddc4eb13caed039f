//! Channels: paired endpoints with bounded message queues and handle
//! transfer.
//!
//! Both endpoints live against one shared channel record; a single IRQ lock
//! covers both queues and both closed flags. Data crosses by copy; attached
//! handles MOVE — they leave the sender's table during send and materialize
//! in the receiver's table at receive, with the channel holding the object
//! references in between. Transfer is destructive for the sender even when
//! the send subsequently fails (peer closed, queue full): the recorded
//! references are dropped, not restored.
//!
//! An endpoint may instead register a kernel-side handler; a send then
//! dequeues its own message and dispatches it synchronously outside the
//! channel lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use delta_core::sync::IrqSpinLock;
use delta_syscall::{
    CHANNEL_MAX_MSG_HANDLES, CHANNEL_MAX_MSG_SIZE, CHANNEL_MSG_QUEUE_SIZE, Error, Rights,
};

use crate::obj::{KernelObject, ObjectRef, ObjectType};
use crate::proc::Process;
use crate::sched::wait::WaitQueue;

/// A message in flight. The channel owns one reference per carried object
/// until the message is received or the endpoint closes.
pub struct Message {
    /// Copied payload; ownership passes to the receiver.
    pub data: Vec<u8>,
    /// Transferred objects with the rights they carried.
    pub objects: Vec<(ObjectRef, Rights)>,
    /// Pid of the sender (0 for the kernel).
    pub sender_pid: u32,
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("data", &self.data)
            .field("objects", &self.objects.len())
            .field("sender_pid", &self.sender_pid)
            .finish()
    }
}

/// Non-owning view of an endpoint handed to kernel-side handlers, with just
/// enough surface to answer on the channel.
pub struct HandlerRef {
    channel: Arc<Channel>,
    id: usize,
}

impl HandlerRef {
    /// Sends towards the peer. Objects are referenced, not moved — the
    /// kernel caller keeps its own references.
    pub fn reply(&self, data: &[u8], objects: &[(ObjectRef, Rights)]) -> Result<(), Error> {
        let message = Message {
            data: data.to_vec(),
            objects: objects.to_vec(),
            sender_pid: 0,
        };
        enqueue_to_peer(&self.channel, self.id, message)
    }

    /// Whether the peer endpoint has been closed.
    pub fn peer_closed(&self) -> bool {
        self.channel.state.lock().closed[1 - self.id]
    }
}

/// Kernel-side synchronous message handler.
pub type Handler = Arc<dyn Fn(&HandlerRef, Message) + Send + Sync>;

struct ChannelState {
    queues: [VecDeque<Message>; 2],
    closed: [bool; 2],
    handlers: [Option<Handler>; 2],
}

/// The shared record behind a pair of endpoints. Freed when the second
/// endpoint drops its reference.
pub struct Channel {
    state: IrqSpinLock<ChannelState>,
    waiters: [WaitQueue; 2],
}

impl Channel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: IrqSpinLock::new(ChannelState {
                queues: [VecDeque::new(), VecDeque::new()],
                closed: [false, false],
                handlers: [None, None],
            }),
            waiters: [WaitQueue::new(), WaitQueue::new()],
        })
    }
}

/// One end of a channel. Implements [`KernelObject`]; dropping the last
/// handle reference runs the close semantics.
pub struct Endpoint {
    channel: Arc<Channel>,
    id: usize,
}

impl KernelObject for Endpoint {
    fn obj_type(&self) -> ObjectType {
        ObjectType::Channel
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // Mark this end closed and free our pending queue; carried object
        // references drop with the messages.
        let drained = {
            let mut state = self.channel.state.lock();
            state.closed[self.id] = true;
            state.handlers[self.id] = None;
            core::mem::take(&mut state.queues[self.id])
        };
        // Wake every waiter on both ends so blocked receivers observe the
        // close instead of sleeping forever.
        self.channel.waiters[0].wake_all();
        self.channel.waiters[1].wake_all();
        drop(drained);
    }
}

/// Resolves a handle to its channel and endpoint id.
fn endpoint_of(process: &Arc<Process>, handle: i32) -> Result<(Arc<Channel>, usize), Error> {
    let obj = process.with_handles(|t| t.object(handle))?;
    let endpoint = obj
        .as_any()
        .downcast_ref::<Endpoint>()
        .ok_or(Error::InvalidArgument)?;
    Ok((endpoint.channel.clone(), endpoint.id))
}

/// Creates a channel and grants both endpoint handles to `process`.
pub fn create(process: &Arc<Process>, rights: Rights) -> Result<(i32, i32), Error> {
    let channel = Channel::new();
    let ep0: ObjectRef = Arc::new(Endpoint {
        channel: channel.clone(),
        id: 0,
    });
    let ep1: ObjectRef = Arc::new(Endpoint { channel, id: 1 });

    process.with_handles(|table| {
        let h0 = table.grant(ep0, rights)?;
        match table.grant(ep1, rights) {
            Ok(h1) => Ok((h0, h1)),
            Err(e) => {
                let _ = table.close(h0);
                Err(e)
            }
        }
    })
}

/// Registers a kernel-side handler on the endpoint behind `handle`.
pub fn set_handler(
    process: &Arc<Process>,
    handle: i32,
    handler: Handler,
) -> Result<(), Error> {
    let (channel, id) = endpoint_of(process, handle)?;
    channel.state.lock().handlers[id] = Some(handler);
    Ok(())
}

/// Removes the kernel-side handler on the endpoint behind `handle`.
pub fn clear_handler(process: &Arc<Process>, handle: i32) -> Result<(), Error> {
    let (channel, id) = endpoint_of(process, handle)?;
    channel.state.lock().handlers[id] = None;
    Ok(())
}

/// Sends a message on `handle`.
///
/// Handle attachment is validate-then-commit: every attached handle is
/// checked for existence and the TRANSFER right before any is removed.
/// Once removed they stay removed — a later failure drops the recorded
/// references rather than restoring the sender's table.
pub fn send(
    process: &Arc<Process>,
    handle: i32,
    data: &[u8],
    attached: &[i32],
) -> Result<(), Error> {
    if data.len() > CHANNEL_MAX_MSG_SIZE {
        return Err(Error::InvalidArgument);
    }
    if attached.len() > CHANNEL_MAX_MSG_HANDLES {
        return Err(Error::InvalidArgument);
    }

    let (channel, id) = endpoint_of(process, handle)?;

    // Move the attached handles out of the sender. Both passes run under
    // one acquisition of the process lock.
    let objects = process.with_handles(|table| {
        for &h in attached {
            table.check_rights(h, Rights::TRANSFER)?;
        }
        let mut objects = Vec::with_capacity(attached.len());
        for &h in attached {
            let entry = table.take(h)?;
            objects.push((entry.obj, entry.rights));
        }
        Ok::<_, Error>(objects)
    })?;

    let message = Message {
        data: data.to_vec(),
        objects,
        sender_pid: process.pid as u32,
    };
    enqueue_to_peer(&channel, id, message)
}

/// Queues `message` towards the peer of endpoint `from_id`, waking one
/// receiver or dispatching to a registered handler.
fn enqueue_to_peer(
    channel: &Arc<Channel>,
    from_id: usize,
    message: Message,
) -> Result<(), Error> {
    let peer = 1 - from_id;

    let handler_dispatch = {
        let mut state = channel.state.lock();
        if state.closed[peer] {
            drop(state);
            // The message drops after the lock: a carried object's close
            // (an endpoint of this very channel, say) may need it.
            return Err(Error::PeerClosed);
        }
        if state.queues[peer].len() >= CHANNEL_MSG_QUEUE_SIZE {
            drop(state);
            return Err(Error::QueueFull);
        }
        state.queues[peer].push_back(message);

        // A kernel handler consumes the message immediately instead of
        // leaving it queued; dispatch happens outside the lock.
        match state.handlers[peer].clone() {
            Some(handler) => {
                let msg = state.queues[peer].pop_back().expect("just pushed");
                Some((handler, msg))
            }
            None => None,
        }
    };

    match handler_dispatch {
        Some((handler, msg)) => {
            let handler_ref = HandlerRef {
                channel: channel.clone(),
                id: peer,
            };
            handler(&handler_ref, msg);
        }
        None => {
            channel.waiters[peer].wake_one();
        }
    }
    Ok(())
}

/// Receives the next message on `handle`.
///
/// Blocks until a message arrives or the peer closes with an empty queue.
pub fn recv(process: &Arc<Process>, handle: i32) -> Result<Message, Error> {
    recv_inner(process, handle, true)
}

/// Non-blocking receive; [`Error::WouldBlock`] when the queue is empty.
pub fn try_recv(process: &Arc<Process>, handle: i32) -> Result<Message, Error> {
    recv_inner(process, handle, false)
}

fn recv_inner(process: &Arc<Process>, handle: i32, blocking: bool) -> Result<Message, Error> {
    let (channel, my_id) = endpoint_of(process, handle)?;

    loop {
        let mut state = channel.state.lock();
        if let Some(message) = state.queues[my_id].pop_front() {
            return Ok(message);
        }
        if state.closed[1 - my_id] {
            return Err(Error::PeerClosed);
        }
        if !blocking {
            return Err(Error::WouldBlock);
        }

        // Commit to the wait queue before the channel lock drops so a
        // concurrent sender's wake cannot slip between check and sleep.
        #[cfg(target_os = "none")]
        channel.waiters[my_id].sleep_releasing(state);
        #[cfg(not(target_os = "none"))]
        {
            drop(state);
            return Err(Error::WouldBlock);
        }
    }
}

/// Grants the received message's objects into `process`, returning the new
/// handle values.
///
/// On a grant failure every handle granted so far is closed and the
/// remaining references drop; the message data is unaffected.
pub fn grant_received(
    process: &Arc<Process>,
    message: &mut Message,
) -> Result<Vec<i32>, Error> {
    let objects = core::mem::take(&mut message.objects);
    process.with_handles(|table| {
        let mut handles = Vec::with_capacity(objects.len());
        for (obj, rights) in objects {
            match table.grant(obj, rights) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    for &h in &handles {
                        let _ = table.close(h);
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    })
}

/// Whether the peer endpoint of `handle` has been closed.
pub fn peer_closed(process: &Arc<Process>, handle: i32) -> Result<bool, Error> {
    let (channel, id) = endpoint_of(process, handle)?;
    let closed = channel.state.lock().closed[1 - id];
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::KernelObject;
    use crate::proc::Process;

    struct FileLike;
    impl KernelObject for FileLike {
        fn obj_type(&self) -> ObjectType {
            ObjectType::File
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn default_rights() -> Rights {
        Rights::READ | Rights::WRITE | Rights::TRANSFER | Rights::DUPLICATE
    }

    #[test]
    fn echo_round_trip() {
        let process = Process::new_kernel_for_tests("echo");
        let (h0, h1) = create(&process, default_rights()).unwrap();
        assert_ne!(h0, h1);

        send(&process, h0, b"hello", &[]).unwrap();
        let msg = try_recv(&process, h1).unwrap();
        assert_eq!(msg.data, b"hello");
        assert_eq!(msg.sender_pid, process.pid as u32);
        assert!(msg.objects.is_empty());
    }

    #[test]
    fn recv_direction_is_per_endpoint() {
        let process = Process::new_kernel_for_tests("direction");
        let (h0, h1) = create(&process, default_rights()).unwrap();
        send(&process, h0, b"ping", &[]).unwrap();
        // The sender's own endpoint has nothing queued.
        assert_eq!(try_recv(&process, h0).unwrap_err(), Error::WouldBlock);
        assert!(try_recv(&process, h1).is_ok());
    }

    #[test]
    fn handle_transfer_moves_and_preserves_refcount() {
        let process = Process::new_kernel_for_tests("transfer");
        let (h0, h1) = create(&process, default_rights()).unwrap();

        let file: ObjectRef = Arc::new(FileLike);
        let baseline = Arc::strong_count(&file);
        let fh = process
            .with_handles(|t| t.grant(file.clone(), Rights::READ | Rights::TRANSFER))
            .unwrap();
        assert_eq!(Arc::strong_count(&file), baseline + 1);

        send(&process, h0, b"take this", &[fh]).unwrap();
        // MOVE semantics: the sender's slot is gone...
        assert!(process.with_handles(|t| t.get(fh).is_err()));
        // ...and the channel carries the reference meanwhile.
        assert_eq!(Arc::strong_count(&file), baseline + 1);

        let mut msg = try_recv(&process, h1).unwrap();
        assert_eq!(msg.objects.len(), 1);
        let granted = grant_received(&process, &mut msg).unwrap();
        assert_eq!(granted.len(), 1);

        // The receiver's handle refers to the same object with the rights
        // that were attached; net refcount change over the transit is zero.
        let entry_rights = process
            .with_handles(|t| t.get(granted[0]).map(|e| e.rights))
            .unwrap();
        assert_eq!(entry_rights, Rights::READ | Rights::TRANSFER);
        assert_eq!(Arc::strong_count(&file), baseline + 1);

        process.with_handles(|t| t.close(granted[0])).unwrap();
        assert_eq!(Arc::strong_count(&file), baseline);
    }

    #[test]
    fn transfer_without_right_fails_before_any_removal() {
        let process = Process::new_kernel_for_tests("no-transfer");
        let (h0, _h1) = create(&process, default_rights()).unwrap();

        let file: ObjectRef = Arc::new(FileLike);
        let ok = process
            .with_handles(|t| t.grant(file.clone(), Rights::READ | Rights::TRANSFER))
            .unwrap();
        let bad = process
            .with_handles(|t| t.grant(file.clone(), Rights::READ))
            .unwrap();

        assert_eq!(
            send(&process, h0, b"x", &[ok, bad]).unwrap_err(),
            Error::PermissionDenied
        );
        // Validate-then-commit: neither handle left the table.
        assert!(process.with_handles(|t| t.get(ok).is_ok()));
        assert!(process.with_handles(|t| t.get(bad).is_ok()));
    }

    #[test]
    fn send_to_closed_peer_drops_transferred_objects() {
        let process = Process::new_kernel_for_tests("peer-gone");
        let (h0, h1) = create(&process, default_rights()).unwrap();
        process.with_handles(|t| t.close(h1)).unwrap();

        let file: ObjectRef = Arc::new(FileLike);
        let baseline = Arc::strong_count(&file);
        let fh = process
            .with_handles(|t| t.grant(file.clone(), Rights::TRANSFER))
            .unwrap();

        assert_eq!(
            send(&process, h0, b"doomed", &[fh]).unwrap_err(),
            Error::PeerClosed
        );
        // Transfer is destructive even on failure: the sender's handle is
        // gone and the channel's reference was dropped with the message.
        assert!(process.with_handles(|t| t.get(fh).is_err()));
        assert_eq!(Arc::strong_count(&file), baseline);
    }

    #[test]
    fn bounded_queue_reports_full() {
        let process = Process::new_kernel_for_tests("full");
        let (h0, _h1) = create(&process, default_rights()).unwrap();
        for _ in 0..CHANNEL_MSG_QUEUE_SIZE {
            send(&process, h0, b"fill", &[]).unwrap();
        }
        assert_eq!(
            send(&process, h0, b"overflow", &[]).unwrap_err(),
            Error::QueueFull
        );
    }

    #[test]
    fn recv_after_close_drains_then_reports_peer_closed() {
        let process = Process::new_kernel_for_tests("drain");
        let (h0, h1) = create(&process, default_rights()).unwrap();
        send(&process, h0, b"last words", &[]).unwrap();
        process.with_handles(|t| t.close(h0)).unwrap();

        // The queued message is still delivered...
        assert_eq!(try_recv(&process, h1).unwrap().data, b"last words");
        // ...then the closed peer shows through.
        assert_eq!(try_recv(&process, h1).unwrap_err(), Error::PeerClosed);
        assert!(peer_closed(&process, h1).unwrap());
    }

    #[test]
    fn closing_endpoint_frees_pending_messages() {
        let process = Process::new_kernel_for_tests("close-pending");
        let (h0, h1) = create(&process, default_rights()).unwrap();

        let file: ObjectRef = Arc::new(FileLike);
        let baseline = Arc::strong_count(&file);
        let fh = process
            .with_handles(|t| t.grant(file.clone(), Rights::TRANSFER))
            .unwrap();
        send(&process, h0, b"pending", &[fh]).unwrap();

        // Closing the receiving endpoint drains its queue and drops the
        // carried reference.
        process.with_handles(|t| t.close(h1)).unwrap();
        assert_eq!(Arc::strong_count(&file), baseline);
    }

    #[test]
    fn kernel_handler_consumes_and_replies() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let process = Process::new_kernel_for_tests("handler");
        let (h0, h1) = create(&process, default_rights()).unwrap();

        static SEEN: AtomicUsize = AtomicUsize::new(0);
        set_handler(
            &process,
            h1,
            Arc::new(|reply_to, msg| {
                assert_eq!(msg.data, b"to-kernel");
                SEEN.fetch_add(1, Ordering::Relaxed);
                reply_to.reply(b"from-kernel", &[]).unwrap();
            }),
        )
        .unwrap();

        send(&process, h0, b"to-kernel", &[]).unwrap();
        assert_eq!(SEEN.load(Ordering::Relaxed), 1);
        // Handled synchronously: nothing left queued on the handler's end.
        assert_eq!(try_recv(&process, h1).unwrap_err(), Error::WouldBlock);
        // The reply landed on the caller's end.
        assert_eq!(try_recv(&process, h0).unwrap().data, b"from-kernel");
        assert_eq!(try_recv(&process, h0).unwrap_err(), Error::WouldBlock);
    }
}
