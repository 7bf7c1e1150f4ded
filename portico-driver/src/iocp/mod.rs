//! Completion-port driver.
//!
//! One thread drives submissions and completions; four wakeup sources funnel
//! into its port dequeue: overlapped kernel I/O, the timer queue, worker
//! threads finishing blocking operations, and event-source notifications.

use std::{
    io,
    mem::size_of,
    ptr::NonNull,
    sync::Arc,
    task::{Poll, Wake, Waker},
    time::{Duration, Instant},
};

use portico_log::{error, scope, trace};
use socket2::{Socket, Type};
use windows_sys::Win32::{
    Foundation::{
        ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF, ERROR_NO_DATA, ERROR_OPERATION_ABORTED, GENERIC_READ,
        GENERIC_WRITE,
    },
    Networking::WinSock::{WSACleanup, WSAStartup, SOCKADDR, SOCKADDR_STORAGE, WSABUF, WSADATA, WSAMSG},
    Storage::FileSystem::{
        ReOpenFile, FILE_FLAG_OVERLAPPED, FILE_READ_DATA, FILE_SHARE_DELETE, FILE_SHARE_READ,
        FILE_SHARE_WRITE, FILE_WRITE_DATA,
    },
    System::{
        JobObjects::{
            AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
            SetInformationJobObject, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
            JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS, JOB_OBJECT_MSG_EXIT_PROCESS,
        },
        Threading::{GetExitCodeProcess, INFINITE},
        IO::OVERLAPPED,
    },
};

use crate::{
    event::Waiter,
    key::{Id, Key},
    op::{
        Completion, CompletionMode, Link, Op, OpKind, OpOutput, RawFd, Request, Summary,
        Termination,
    },
    pool::DynamicThreadPool,
    syscall,
    table::{FinishRecord, FinishedList, Lifecycle, OpRuntime, OpTable},
    timer::TimerQueue,
    Builder,
};

mod cp;
mod op;

use cp::{Dequeued, Port};

/// Per-operation I/O context: the overlapped record the kernel writes, the
/// slot identity used to recover the operation from a dequeued completion,
/// any cleanup handle the driver owns on behalf of the operation, and the
/// transferred byte count of a successful submission.
///
/// The overlapped record must stay the first field: its address is what the
/// port hands back, and the identity is read from the memory right behind it.
#[repr(C)]
pub(crate) struct IoContext {
    overlapped: OVERLAPPED,
    id_word: u64,
    pub owned: OwnedCleanup,
    pub transferred: u32,
}

impl IoContext {
    pub fn new() -> Self {
        Self {
            overlapped: unsafe { std::mem::zeroed() },
            id_word: 0,
            owned: OwnedCleanup::None,
            transferred: 0,
        }
    }

    pub fn set_id(&mut self, id: Id) {
        self.id_word = id.to_word();
    }

    pub fn optr(&mut self) -> *mut OVERLAPPED {
        &mut self.overlapped as _
    }

    /// Write the file offset into the overlapped record. Without a caller
    /// offset both halves carry the sentinel; the kernel then resolves the
    /// position itself when the I/O executes (writes land at end of file).
    fn set_offset(&mut self, offset: Option<u64>) {
        const OFFSET_SENTINEL: u32 = 0xFFFF_FFFF;
        match offset {
            Some(offset) => {
                self.overlapped.Anonymous.Anonymous.Offset = (offset & 0xFFFF_FFFF) as _;
                self.overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as _;
            }
            None => {
                self.overlapped.Anonymous.Anonymous.Offset = OFFSET_SENTINEL;
                self.overlapped.Anonymous.Anonymous.OffsetHigh = OFFSET_SENTINEL;
            }
        }
    }

    /// Recover the slot identity from a dequeued overlapped pointer.
    ///
    /// # Safety
    ///
    /// `optr` must point at the `overlapped` field of a live `IoContext`.
    unsafe fn id_from_optr(optr: *mut OVERLAPPED) -> Id {
        Id::from_word((*optr.cast::<IoContext>()).id_word)
    }
}

/// Cleanup handle owned by the driver on behalf of one operation: the
/// overlapped re-open of a caller handle, or the job object watching a child
/// process. Released exactly once, on completion drain or on a successful
/// cancel.
pub(crate) enum OwnedCleanup {
    None,
    Handle(RawFd),
    Job(RawFd),
}

impl OwnedCleanup {
    pub fn handle(&self) -> Option<RawFd> {
        match self {
            Self::None => None,
            Self::Handle(h) | Self::Job(h) => Some(*h),
        }
    }

    pub fn release(&mut self) {
        match std::mem::replace(self, Self::None) {
            Self::None => {}
            Self::Handle(h) | Self::Job(h) => {
                let res = unsafe { windows_sys::Win32::Foundation::CloseHandle(h as _) };
                // A failed close means the handle was corrupted or double
                // closed; leaking here would hide the violation.
                assert_ne!(res, 0, "failed to close owned cleanup handle");
            }
        }
    }
}

impl Drop for OwnedCleanup {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accept scratch sized for two socket addresses plus the 16 bytes the
/// kernel requires per address record.
#[repr(C, align(8))]
pub(crate) struct AcceptScratch {
    pub buf: [u8; op::ACCEPT_BUFFER_SIZE],
}

pub(crate) struct MsgScratch {
    pub wsabuf: WSABUF,
    pub msg: WSAMSG,
    pub addr: SOCKADDR_STORAGE,
}

/// Backend scratch of one operation.
pub(crate) enum Scratch {
    None,
    Stream { wsabuf: WSABUF, flags: u32 },
    Accept(Box<AcceptScratch>),
    Msg(Box<MsgScratch>),
}

/// Resources produced while the operation ran, waiting for completion drain.
pub(crate) enum Staged {
    None,
    Accepted(Socket),
    Created(Socket),
    Term(Termination),
}

struct PortWaker {
    port: Arc<Port>,
    id: Id,
}

impl Wake for PortWaker {
    fn wake(self: Arc<Self>) {
        self.port.post(Key::EventSource(self.id)).ok();
    }
}

/// Finish path handed to worker threads: record the result, then wake the
/// driver thread through the port.
#[derive(Clone)]
struct RemoteFinisher {
    finished: FinishedList,
    port: Arc<Port>,
}

impl RemoteFinisher {
    fn finish(&self, id: Id, error: Option<io::Error>) {
        self.finished.lock().unwrap().push(FinishRecord { id, error });
        self.port.post(Key::Nop).ok();
    }
}

struct SendPtr(NonNull<OpRuntime>);

// SAFETY: the runtime box is stable and exclusively owned by the worker
// between dispatch and its finish record draining.
unsafe impl Send for SendPtr {}

fn aborted() -> io::Error {
    io::Error::from_raw_os_error(ERROR_OPERATION_ABORTED as _)
}

/// The submission/completion engine.
pub struct Driver {
    port: Arc<Port>,
    table: OpTable,
    timers: TimerQueue,
    pool: DynamicThreadPool,
    /// At least one slot finished inline this iteration; skip the blocking
    /// dequeue and drain instead.
    signaled: bool,
}

impl Driver {
    const SHUTDOWN_HORIZON: Duration = Duration::from_secs(5);

    /// Create a driver with the default configuration.
    pub fn new() -> io::Result<Self> {
        Builder::new().build()
    }

    /// Create a [`Builder`] to configure the driver.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn with_builder(builder: &Builder) -> io::Result<Self> {
        scope!("new", ?builder);
        let mut data: WSADATA = unsafe { std::mem::zeroed() };
        syscall!(SOCKET, WSAStartup(0x202, &mut data))?;
        let port = Arc::new(Port::new(1)?);
        Ok(Self {
            port,
            table: OpTable::with_capacity(builder.capacity),
            timers: TimerQueue::new(),
            pool: DynamicThreadPool::new(
                builder.thread_pool_limit,
                builder.thread_pool_idle_timeout,
                builder.thread_name.clone(),
            ),
            signaled: false,
        })
    }

    /// Number of operations that have been queued and not yet drained.
    pub fn pending(&self) -> usize {
        self.table.live()
    }

    /// Whether no operation is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Allocate slots for a batch of requests. The operations start on the
    /// next [`complete`](Self::complete) call; submission errors are reported
    /// through the completion records, never from this method.
    pub fn queue(&mut self, requests: impl IntoIterator<Item = Request>) -> io::Result<Vec<Id>> {
        let requests: Vec<Request> = requests.into_iter().collect();
        if matches!(requests.last(), Some(r) if r.link == Link::Next) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "link flag on the last request of a batch",
            ));
        }
        let mut ids = Vec::with_capacity(requests.len());
        let mut link_from: Option<Id> = None;
        for req in requests {
            let id = self.table.insert(req.op, req.user_data);
            trace!("queued {id:?}");
            if let Some(prev) = link_from.take() {
                self.table.link_pair(prev, id);
            }
            if req.link == Link::Next {
                link_from = Some(id);
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Advisory cancellation. `true` means the operation is already finished
    /// with the cancellation error; `false` means the caller waits for the
    /// natural completion, which may itself carry the cancellation error when
    /// the kernel aborts the I/O.
    pub fn cancel(&mut self, id: Id) -> bool {
        scope!("cancel", ?id);
        let (state, kind) = match self.table.lookup(id) {
            Some(run) => (run.state, run.kind()),
            None => return false,
        };
        match state {
            Lifecycle::Finished => false,
            Lifecycle::Queued => {
                self.finish_local(id, Some(aborted()));
                true
            }
            Lifecycle::InFlight => self.cancel_in_flight(id, kind),
        }
    }

    fn cancel_in_flight(&mut self, id: Id, kind: OpKind) -> bool {
        match kind {
            OpKind::Read | OpKind::Write | OpKind::ReadVectored | OpKind::WriteVectored => {
                if let Some(run) = self.table.lookup(id) {
                    if let Some(handle) = run.ctx.owned.handle() {
                        let optr = run.ctx.optr();
                        // The port delivers the aborted completion; freeing
                        // the slot now would race the kernel's final write.
                        op::try_cancel_io(handle, optr);
                    }
                }
                false
            }
            OpKind::Accept
            | OpKind::Recv
            | OpKind::Send
            | OpKind::RecvMsg
            | OpKind::SendMsg => {
                if let Some(run) = self.table.lookup(id) {
                    let fd = match &run.op {
                        Op::Accept(op) => op.fd,
                        Op::Recv(op) => op.fd,
                        Op::Send(op) => op.fd,
                        Op::RecvMsg(op) => op.fd,
                        Op::SendMsg(op) => op.fd,
                        _ => return false,
                    };
                    let optr = run.ctx.optr();
                    op::try_cancel_io(fd, optr);
                }
                false
            }
            OpKind::ChildExit => {
                if let Some(run) = self.table.lookup(id) {
                    // Closing the job ends the port association.
                    run.ctx.owned.release();
                }
                self.finish_local(id, Some(aborted()));
                true
            }
            OpKind::Timeout | OpKind::LinkTimeout => {
                if self.timers.disarm(id.to_word()) {
                    self.finish_local(id, Some(aborted()));
                    true
                } else {
                    false
                }
            }
            OpKind::WaitEventSource => {
                let source = match self.table.lookup(id) {
                    Some(run) => match &run.op {
                        Op::WaitEventSource(w) => w.source.clone(),
                        _ => return false,
                    },
                    None => return false,
                };
                if source.remove_waiter(id.to_word()) {
                    self.finish_local(id, Some(aborted()));
                    true
                } else {
                    // A concurrent notify already consumed the waiter; its
                    // port message finishes the operation.
                    false
                }
            }
            // Blocking operations finish when the underlying call returns.
            _ => false,
        }
    }

    /// Run the completion loop once. Returns after at least one completion
    /// was reported to `handler`, or immediately in non-blocking mode.
    pub fn complete(
        &mut self,
        mode: CompletionMode,
        mut handler: impl FnMut(Completion),
    ) -> io::Result<Summary> {
        scope!("complete", ?mode);
        let mut summary = Summary::default();
        loop {
            self.submit_queued();
            let now = Instant::now();
            while let Some(word) = self.timers.pop_due(now) {
                self.finish_local(Id::from_word(word), None);
            }
            let wait_bound = match self.timers.next_delay(Instant::now()) {
                Some(delay) => delay.as_nanos().div_ceil(1_000_000).min(INFINITE as u128) as u32,
                None => INFINITE,
            };
            let timeout = if self.signaled {
                0
            } else {
                match mode {
                    CompletionMode::Blocking => wait_bound,
                    CompletionMode::NonBlocking => 0,
                }
            };
            if let Some(deq) = self.port.dequeue(timeout)? {
                self.route(deq)?;
            }
            while self.signaled {
                self.signaled = false;
                self.drain(&mut handler, &mut summary);
            }
            if summary.num_completed > 0 || mode == CompletionMode::NonBlocking {
                return Ok(summary);
            }
        }
    }

    fn submit_queued(&mut self) {
        while let Some(id) = self.table.take_queued() {
            match self.table.lookup(id) {
                Some(run) if run.state == Lifecycle::Queued => {
                    run.state = Lifecycle::InFlight;
                }
                _ => continue,
            }
            self.start(id);
        }
    }

    fn start(&mut self, id: Id) {
        let Some(mut ptr) = self.table.runtime_ptr(id) else {
            return;
        };
        // The driver thread exclusively owns an in-flight runtime until it is
        // handed to a worker thread or finished.
        let run = unsafe { ptr.as_mut() };
        match run.kind() {
            OpKind::Read | OpKind::Write | OpKind::ReadVectored | OpKind::WriteVectored => {
                self.start_rw(id, run)
            }
            OpKind::Accept => self.start_accept(id, run),
            OpKind::Recv | OpKind::Send => self.start_stream(id, run),
            OpKind::RecvMsg | OpKind::SendMsg => self.start_msg(id, run),
            OpKind::Timeout => {
                if let Op::Timeout(op) = &run.op {
                    self.timers.schedule(id.to_word(), op.delay);
                }
            }
            OpKind::LinkTimeout => {
                if let Op::LinkTimeout(op) = &run.op {
                    self.timers.schedule(id.to_word(), op.delay);
                }
            }
            OpKind::ChildExit => self.start_child_exit(id, run),
            OpKind::WaitEventSource => self.start_wait_event(id, run),
            OpKind::NotifyEventSource | OpKind::CloseEventSource => {
                // These never block; run them on the calling thread.
                let res = op::execute_blocking(run);
                self.finish_direct(run, id, res.err());
            }
            OpKind::Poll => {
                self.finish_direct(
                    run,
                    id,
                    Some(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "poll is not supported by this backend",
                    )),
                );
            }
            OpKind::Fsync
            | OpKind::ShutdownSocket
            | OpKind::CloseFile
            | OpKind::CloseSocket
            | OpKind::Socket => self.start_blocking(id, run),
        }
    }

    fn start_rw(&mut self, id: Id, run: &mut OpRuntime) {
        let kind = run.kind();
        let writing = matches!(kind, OpKind::Write | OpKind::WriteVectored);
        let (fd, offset) = match &run.op {
            Op::Read(op) => (op.fd, op.offset),
            Op::Write(op) => (op.fd, op.offset),
            Op::ReadVectored(op) => (op.fd, op.offset),
            Op::WriteVectored(op) => (op.fd, op.offset),
            _ => return,
        };
        let empty = match &run.op {
            Op::ReadVectored(op) => op.buffers.is_empty(),
            Op::WriteVectored(op) => op.buffers.is_empty(),
            _ => false,
        };
        if empty {
            run.ctx.transferred = 0;
            self.finish_direct(run, id, None);
            return;
        }
        let access = match op::file_access_mask(fd) {
            Ok(access) => access,
            Err(e) => return self.finish_direct(run, id, Some(e)),
        };
        if writing && access & FILE_WRITE_DATA == 0 {
            return self.finish_direct(run, id, Some(op::not_open_for_writing()));
        }
        if !writing && access & FILE_READ_DATA == 0 {
            return self.finish_direct(run, id, Some(op::not_open_for_reading()));
        }
        let desired = if writing { GENERIC_WRITE } else { GENERIC_READ };
        let dup = match syscall!(
            HANDLE,
            ReOpenFile(
                fd as _,
                desired,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                FILE_FLAG_OVERLAPPED,
            )
        ) {
            Ok(handle) => handle as RawFd,
            Err(e) => return self.finish_direct(run, id, Some(e)),
        };
        run.ctx.owned = OwnedCleanup::Handle(dup);
        if let Err(e) = self.port.associate_handle(dup) {
            return self.finish_direct(run, id, Some(e));
        }
        run.ctx.set_offset(offset);
        let optr = run.ctx.optr();
        let res = unsafe {
            match &mut run.op {
                Op::Read(op) => op::submit_read(dup, &mut op.buffer, optr),
                Op::Write(op) => op::submit_write(dup, &op.buffer, optr),
                Op::ReadVectored(op) => op::submit_read(dup, &mut op.buffers[0], optr),
                Op::WriteVectored(op) => op::submit_write(dup, &op.buffers[0], optr),
                _ => return,
            }
        };
        self.settle(run, id, res);
    }

    fn start_accept(&mut self, id: Id, run: &mut OpRuntime) {
        let fd = match &run.op {
            Op::Accept(op) => op.fd,
            _ => return,
        };
        if let Err(e) = self.port.associate_socket(fd) {
            return self.finish_direct(run, id, Some(e));
        }
        let domain = match op::socket_family(fd) {
            Ok(domain) => domain,
            Err(e) => return self.finish_direct(run, id, Some(e)),
        };
        let socket = match Socket::new(domain, Type::STREAM, None) {
            Ok(socket) => socket,
            Err(e) => return self.finish_direct(run, id, Some(e)),
        };
        let accept_raw = crate::op::AsRawFd::as_raw_fd(&socket);
        run.scratch = Scratch::Accept(Box::new(AcceptScratch {
            buf: [0; op::ACCEPT_BUFFER_SIZE],
        }));
        run.staged = Staged::Accepted(socket);
        let buf = match &mut run.scratch {
            Scratch::Accept(scratch) => scratch.buf.as_mut_ptr(),
            _ => return,
        };
        let optr = run.ctx.optr();
        let res = unsafe { op::submit_accept(fd, accept_raw, buf, optr) };
        self.settle(run, id, res);
    }

    fn start_stream(&mut self, id: Id, run: &mut OpRuntime) {
        let fd = match &run.op {
            Op::Recv(op) => op.fd,
            Op::Send(op) => op.fd,
            _ => return,
        };
        if let Err(e) = self.port.associate_socket(fd) {
            return self.finish_direct(run, id, Some(e));
        }
        let receiving = matches!(run.kind(), OpKind::Recv);
        let wsabuf = match &mut run.op {
            Op::Recv(op) => WSABUF {
                len: op.buffer.len() as u32,
                buf: op.buffer.as_mut_ptr(),
            },
            Op::Send(op) => WSABUF {
                len: op.buffer.len() as u32,
                buf: op.buffer.as_ptr() as *mut u8,
            },
            _ => return,
        };
        run.scratch = Scratch::Stream { wsabuf, flags: 0 };
        let optr = run.ctx.optr();
        let res = unsafe {
            match &mut run.scratch {
                Scratch::Stream { wsabuf, flags } => {
                    if receiving {
                        op::submit_recv(fd, wsabuf, flags, optr)
                    } else {
                        op::submit_send(fd, wsabuf, optr)
                    }
                }
                _ => return,
            }
        };
        self.settle(run, id, res);
    }

    fn start_msg(&mut self, id: Id, run: &mut OpRuntime) {
        let fd = match &run.op {
            Op::RecvMsg(op) => op.fd,
            Op::SendMsg(op) => op.fd,
            _ => return,
        };
        if let Err(e) = self.port.associate_socket(fd) {
            return self.finish_direct(run, id, Some(e));
        }
        let receiving = matches!(run.kind(), OpKind::RecvMsg);
        let mut scratch = Box::new(MsgScratch {
            wsabuf: match &mut run.op {
                Op::RecvMsg(op) => WSABUF {
                    len: op.buffer.len() as u32,
                    buf: op.buffer.as_mut_ptr(),
                },
                Op::SendMsg(op) => WSABUF {
                    len: op.buffer.len() as u32,
                    buf: op.buffer.as_ptr() as *mut u8,
                },
                _ => return,
            },
            msg: unsafe { std::mem::zeroed() },
            addr: unsafe { std::mem::zeroed() },
        });
        scratch.msg.lpBuffers = &mut scratch.wsabuf;
        scratch.msg.dwBufferCount = 1;
        match &run.op {
            Op::RecvMsg(_) => {
                scratch.msg.name = std::ptr::addr_of_mut!(scratch.addr).cast::<SOCKADDR>();
                scratch.msg.namelen = size_of::<SOCKADDR_STORAGE>() as _;
            }
            Op::SendMsg(op) => {
                if let Some(addr) = &op.addr {
                    scratch.msg.name = addr.as_ptr() as *mut SOCKADDR;
                    scratch.msg.namelen = addr.len();
                }
            }
            _ => return,
        }
        run.scratch = Scratch::Msg(scratch);
        let msg = match &mut run.scratch {
            Scratch::Msg(scratch) => std::ptr::addr_of_mut!(scratch.msg),
            _ => return,
        };
        let optr = run.ctx.optr();
        let res = unsafe {
            if receiving {
                op::submit_recv_msg(fd, msg, optr)
            } else {
                op::submit_send_msg(fd, msg, optr)
            }
        };
        self.settle(run, id, res);
    }

    fn start_child_exit(&mut self, id: Id, run: &mut OpRuntime) {
        let child = match &run.op {
            Op::ChildExit(op) => op.child,
            _ => return,
        };
        let job = match syscall!(PTR, CreateJobObjectW(std::ptr::null(), std::ptr::null())) {
            Ok(job) => job as RawFd,
            Err(e) => return self.finish_direct(run, id, Some(e)),
        };
        // From here on the job is released by the context's owned cleanup.
        run.ctx.owned = OwnedCleanup::Job(job);
        if let Err(e) = syscall!(BOOL, AssignProcessToJobObject(job as _, child as _)) {
            return self.finish_direct(run, id, Some(e));
        }
        let assoc = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: Key::ChildExit(id).to_word() as _,
            CompletionPort: std::os::windows::io::AsRawHandle::as_raw_handle(&*self.port) as _,
        };
        if let Err(e) = syscall!(
            BOOL,
            SetInformationJobObject(
                job as _,
                JobObjectAssociateCompletionPortInformation,
                std::ptr::addr_of!(assoc).cast(),
                size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as _,
            )
        ) {
            return self.finish_direct(run, id, Some(e));
        }
    }

    fn start_wait_event(&mut self, id: Id, run: &mut OpRuntime) {
        let source = match &run.op {
            Op::WaitEventSource(op) => op.source.clone(),
            _ => return,
        };
        if source.try_wait() {
            return self.finish_direct(run, id, None);
        }
        let waker = Waker::from(Arc::new(PortWaker {
            port: self.port.clone(),
            id,
        }));
        let registered = source.add_waiter(Waiter {
            word: id.to_word(),
            waker,
        });
        if !registered {
            // A notification arrived between the try-wait and the
            // registration; it was consumed on our behalf.
            self.finish_direct(run, id, None);
        }
    }

    fn start_blocking(&mut self, id: Id, run: &mut OpRuntime) {
        if self.pool.is_disabled() {
            let res = op::execute_blocking(run);
            return self.finish_direct(run, id, res.err());
        }
        let finisher = RemoteFinisher {
            finished: self.table.finished_handle(),
            port: self.port.clone(),
        };
        let ptr = SendPtr(NonNull::from(&mut *run));
        let job = move || {
            let ptr = ptr;
            // SAFETY: the slot stays in the table until the finish record
            // pushed below is drained.
            let run = unsafe { &mut *ptr.0.as_ptr() };
            let res = op::execute_blocking(run);
            finisher.finish(id, res.err());
        };
        if let Err(e) = self.pool.spawn(job) {
            self.finish_direct(run, id, Some(e));
        }
    }

    fn settle(&mut self, run: &mut OpRuntime, id: Id, res: Poll<io::Result<usize>>) {
        match res {
            Poll::Pending => {}
            Poll::Ready(Ok(transferred)) => {
                run.ctx.transferred = transferred as u32;
                self.finish_direct(run, id, None);
            }
            Poll::Ready(Err(e)) => self.finish_direct(run, id, Some(e)),
        }
    }

    /// Finish a slot whose runtime borrow is still held by the caller.
    fn finish_direct(&mut self, run: &mut OpRuntime, id: Id, error: Option<io::Error>) {
        if run.state != Lifecycle::Finished {
            run.state = Lifecycle::Finished;
            self.table.push_record(id, error);
            self.signaled = true;
        }
    }

    /// Finish a slot by identity, dropping the completion when the slot is
    /// gone or already finished.
    fn finish_local(&mut self, id: Id, error: Option<io::Error>) {
        if self.table.mark_finished(id) {
            self.table.push_record(id, error);
            self.signaled = true;
        }
    }

    fn route(&mut self, deq: Dequeued) -> io::Result<()> {
        match deq.key {
            Key::Nop => self.signaled = true,
            Key::Shutdown => {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "completion port is shutting down",
                ))
            }
            Key::EventSource(id) => self.finish_local(id, None),
            Key::ChildExit(id) => self.route_child_exit(id, deq.transferred),
            Key::Overlapped => self.route_overlapped(deq),
        }
        Ok(())
    }

    fn route_child_exit(&mut self, id: Id, message: u32) {
        // The job reports every lifecycle event; only process exits matter.
        if message != JOB_OBJECT_MSG_EXIT_PROCESS && message != JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS
        {
            return;
        }
        let term = match self.table.lookup(id) {
            Some(run) if run.state == Lifecycle::InFlight => {
                let child = match &run.op {
                    Op::ChildExit(op) => op.child,
                    _ => return,
                };
                let mut code = 0u32;
                let term = match syscall!(BOOL, GetExitCodeProcess(child as _, &mut code)) {
                    Ok(_) => Termination::Exited(code),
                    Err(_) => Termination::Unknown,
                };
                run.staged = Staged::Term(term);
                true
            }
            _ => false,
        };
        if term {
            self.finish_local(id, None);
        }
    }

    fn route_overlapped(&mut self, deq: Dequeued) {
        if deq.optr.is_null() {
            return;
        }
        let id = unsafe { IoContext::id_from_optr(deq.optr) };
        let finish = match self.table.lookup(id) {
            // The slot raced with cancellation and is gone or already
            // finished; drop the completion.
            None => return,
            Some(run) if run.state != Lifecycle::InFlight => return,
            Some(run) => match deq.result {
                Ok(()) => {
                    run.ctx.transferred = deq.transferred;
                    None
                }
                Err(e) => match e.raw_os_error().map(|code| code as u32) {
                    Some(ERROR_HANDLE_EOF) | Some(ERROR_BROKEN_PIPE) | Some(ERROR_NO_DATA) => {
                        run.ctx.transferred = 0;
                        None
                    }
                    _ => Some(e),
                },
            },
        };
        self.finish_local(id, finish);
    }

    fn drain(&mut self, handler: &mut dyn FnMut(Completion), summary: &mut Summary) {
        loop {
            let records = self.table.take_finished();
            if records.is_empty() {
                return;
            }
            for FinishRecord { id, error } in records {
                // Worker-produced records have not transitioned the slot yet.
                self.table.mark_finished(id);
                let Some(mut run) = self.table.release(id) else {
                    continue;
                };
                let result = finalize(&mut run, error);
                let completed_ok = result.is_ok();
                let kind = run.kind();
                let companion = run.companion;
                let OpRuntime { op, user_data, .. } = *run;
                summary.num_completed += 1;
                if !completed_ok {
                    summary.num_errors += 1;
                }
                handler(Completion {
                    id,
                    user_data,
                    op,
                    result,
                });
                if let Some(companion) = companion {
                    self.enforce_link(kind, completed_ok, companion);
                }
            }
        }
    }

    /// Link-timeout pairing: a fired link timeout cancels its partner, and a
    /// completed partner disarms its link timeout.
    fn enforce_link(&mut self, finished: OpKind, finished_ok: bool, companion: Id) {
        let companion_kind = match self.table.lookup(companion) {
            Some(run) => run.kind(),
            None => return,
        };
        if companion_kind == OpKind::LinkTimeout || (finished == OpKind::LinkTimeout && finished_ok)
        {
            self.cancel(companion);
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Quiesce: cancel everything in flight and drain the port until all
        // slots resolve. Runtimes the kernel may still write to after the
        // horizon are abandoned, not freed.
        for id in self.table.live_ids() {
            self.cancel(id);
        }
        let deadline = Instant::now() + Self::SHUTDOWN_HORIZON;
        while !self.table.is_empty() && Instant::now() < deadline {
            let now = Instant::now();
            while let Some(word) = self.timers.pop_due(now) {
                self.finish_local(Id::from_word(word), None);
            }
            match self.port.dequeue(50) {
                Ok(Some(deq)) => {
                    if self.route(deq).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }
            let mut summary = Summary::default();
            while self.signaled {
                self.signaled = false;
                self.drain(&mut |_| {}, &mut summary);
            }
        }
        let abandoned = self.table.abandon_remaining();
        if abandoned > 0 {
            error!("abandoning {abandoned} unresolved operations at driver teardown");
        }
        syscall!(SOCKET, WSACleanup()).ok();
    }
}

fn finalize(run: &mut OpRuntime, error: Option<io::Error>) -> io::Result<OpOutput> {
    // Owned cleanup is released on every path.
    run.ctx.owned.release();
    match error {
        Some(e) => {
            // The allocated accept socket is closed when the operation failed.
            if let Staged::Accepted(socket) = std::mem::replace(&mut run.staged, Staged::None) {
                drop(socket);
            }
            Err(e)
        }
        None => Ok(match run.kind() {
            OpKind::Read
            | OpKind::Write
            | OpKind::ReadVectored
            | OpKind::WriteVectored
            | OpKind::Recv
            | OpKind::Send
            | OpKind::RecvMsg
            | OpKind::SendMsg => OpOutput::Bytes(run.ctx.transferred as usize),
            OpKind::Accept => {
                let socket = match std::mem::replace(&mut run.staged, Staged::None) {
                    Staged::Accepted(socket) => socket,
                    _ => unreachable!("accept completed without an allocated socket"),
                };
                let listener = match &run.op {
                    Op::Accept(op) => op.fd,
                    _ => unreachable!(),
                };
                op::update_accept_context(listener, &socket).ok();
                let peer = match &run.scratch {
                    Scratch::Accept(scratch) => {
                        op::extract_peer_addr(listener, scratch.buf.as_ptr()).ok()
                    }
                    _ => None,
                };
                OpOutput::Accepted { socket, peer }
            }
            OpKind::Socket => match std::mem::replace(&mut run.staged, Staged::None) {
                Staged::Created(socket) => OpOutput::Created(socket),
                _ => unreachable!("socket operation completed without a socket"),
            },
            OpKind::ChildExit => match std::mem::replace(&mut run.staged, Staged::None) {
                Staged::Term(term) => OpOutput::Term(term),
                _ => OpOutput::Term(Termination::Unknown),
            },
            _ => OpOutput::Unit,
        }),
    }
}
