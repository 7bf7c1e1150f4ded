//! Operation descriptors and completion records.
//!
//! An [`Op`] owns everything the kernel may touch while the operation is in
//! flight (buffers, addresses, the event source handle). The descriptor is
//! handed back to the caller inside the [`Completion`], so buffers filled by
//! a read are recovered from there.

use std::{io, sync::Arc, time::Duration};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{event::EventSource, Id};

/// On windows, handle and socket are in the same size.
/// Both of them could be attached to an IOCP.
/// Therefore, both could be seen as fd.
pub type RawFd = std::os::windows::io::RawHandle;

/// Extracts raw fds.
pub trait AsRawFd {
    /// Extracts the raw fd.
    fn as_raw_fd(&self) -> RawFd;
}

impl AsRawFd for RawFd {
    fn as_raw_fd(&self) -> RawFd {
        *self
    }
}

impl AsRawFd for std::fs::File {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawHandle::as_raw_handle(self)
    }
}

impl AsRawFd for std::process::Child {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawHandle::as_raw_handle(self)
    }
}

impl AsRawFd for socket2::Socket {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawSocket::as_raw_socket(self) as _
    }
}

impl AsRawFd for std::net::TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawSocket::as_raw_socket(self) as _
    }
}

impl AsRawFd for std::net::TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawSocket::as_raw_socket(self) as _
    }
}

impl AsRawFd for std::net::UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        std::os::windows::io::AsRawSocket::as_raw_socket(self) as _
    }
}

bitflags::bitflags! {
    /// Readiness interest of a [`PollFd`] operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Positional read into an owned buffer.
///
/// With `offset: None` the overlapped record carries the offset sentinel and
/// the kernel resolves the file position when the read executes.
#[derive(Debug)]
pub struct Read {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub offset: Option<u64>,
}

/// Positional write from an owned buffer.
///
/// With `offset: None` the overlapped record carries the offset sentinel;
/// the kernel then appends at end of file.
#[derive(Debug)]
pub struct Write {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub offset: Option<u64>,
}

/// Vectored read. Only the first buffer is submitted per operation; callers
/// wanting full scatter semantics issue follow-up operations.
#[derive(Debug)]
pub struct ReadVectored {
    pub fd: RawFd,
    pub buffers: Vec<Vec<u8>>,
    pub offset: Option<u64>,
}

/// Vectored write. Only the first buffer is submitted per operation.
#[derive(Debug)]
pub struct WriteVectored {
    pub fd: RawFd,
    pub buffers: Vec<Vec<u8>>,
    pub offset: Option<u64>,
}

/// Accept a connection on a listening socket.
#[derive(Debug)]
pub struct Accept {
    pub fd: RawFd,
}

/// Receive from a connected socket.
#[derive(Debug)]
pub struct Recv {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
}

/// Send on a connected socket.
#[derive(Debug)]
pub struct Send {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
}

/// Message-style receive. The source address is consumed internally; the
/// completion reports the transferred byte count.
#[derive(Debug)]
pub struct RecvMsg {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
}

/// Message-style send, optionally addressed.
#[derive(Debug)]
pub struct SendMsg {
    pub fd: RawFd,
    pub buffer: Vec<u8>,
    pub addr: Option<SockAddr>,
}

/// Complete successfully after `delay`.
#[derive(Debug)]
pub struct Timeout {
    pub delay: Duration,
}

/// Like [`Timeout`], but bound to the preceding linked operation: if the
/// timer fires first the linked operation is cancelled, and if the linked
/// operation completes first the timer is cancelled.
#[derive(Debug)]
pub struct LinkTimeout {
    pub delay: Duration,
}

/// Wait for a process to exit. `child` is borrowed for the lifetime of the
/// operation.
#[derive(Debug)]
pub struct ChildExit {
    pub child: RawFd,
}

/// Consume one notification from an event source.
#[derive(Debug)]
pub struct WaitEventSource {
    pub source: Arc<EventSource>,
}

/// Post one notification to an event source.
#[derive(Debug)]
pub struct NotifyEventSource {
    pub source: Arc<EventSource>,
}

/// Release a handle to an event source. Dropping the last handle checks the
/// waiter-list invariant.
#[derive(Debug)]
pub struct CloseEventSource {
    source: Option<Arc<EventSource>>,
}

impl CloseEventSource {
    pub fn new(source: Arc<EventSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    pub(crate) fn take(&mut self) -> Option<Arc<EventSource>> {
        self.source.take()
    }
}

/// Flush file buffers to stable storage.
#[derive(Debug)]
pub struct Fsync {
    pub fd: RawFd,
}

/// Shut down one or both directions of a socket.
#[derive(Debug)]
pub struct ShutdownSocket {
    pub fd: RawFd,
    pub how: std::net::Shutdown,
}

/// Close a file handle. Ownership of the handle passes to the operation.
#[derive(Debug)]
pub struct CloseFile {
    pub fd: RawFd,
}

/// Close a socket. Ownership of the socket passes to the operation.
#[derive(Debug)]
pub struct CloseSocket {
    pub fd: RawFd,
}

/// Create a socket.
#[derive(Debug)]
pub struct CreateSocket {
    pub domain: Domain,
    pub ty: Type,
    pub protocol: Option<Protocol>,
}

/// Readiness poll. Not supported by this backend.
#[derive(Debug)]
pub struct PollFd {
    pub fd: RawFd,
    pub interest: Interest,
}

/// An asynchronous operation descriptor.
#[derive(Debug)]
pub enum Op {
    Read(Read),
    Write(Write),
    ReadVectored(ReadVectored),
    WriteVectored(WriteVectored),
    Accept(Accept),
    Recv(Recv),
    Send(Send),
    RecvMsg(RecvMsg),
    SendMsg(SendMsg),
    Timeout(Timeout),
    LinkTimeout(LinkTimeout),
    ChildExit(ChildExit),
    WaitEventSource(WaitEventSource),
    NotifyEventSource(NotifyEventSource),
    CloseEventSource(CloseEventSource),
    Fsync(Fsync),
    ShutdownSocket(ShutdownSocket),
    CloseFile(CloseFile),
    CloseSocket(CloseSocket),
    Socket(CreateSocket),
    Poll(PollFd),
}

/// Discriminant of [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    ReadVectored,
    WriteVectored,
    Accept,
    Recv,
    Send,
    RecvMsg,
    SendMsg,
    Timeout,
    LinkTimeout,
    ChildExit,
    WaitEventSource,
    NotifyEventSource,
    CloseEventSource,
    Fsync,
    ShutdownSocket,
    CloseFile,
    CloseSocket,
    Socket,
    Poll,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Read(_) => OpKind::Read,
            Self::Write(_) => OpKind::Write,
            Self::ReadVectored(_) => OpKind::ReadVectored,
            Self::WriteVectored(_) => OpKind::WriteVectored,
            Self::Accept(_) => OpKind::Accept,
            Self::Recv(_) => OpKind::Recv,
            Self::Send(_) => OpKind::Send,
            Self::RecvMsg(_) => OpKind::RecvMsg,
            Self::SendMsg(_) => OpKind::SendMsg,
            Self::Timeout(_) => OpKind::Timeout,
            Self::LinkTimeout(_) => OpKind::LinkTimeout,
            Self::ChildExit(_) => OpKind::ChildExit,
            Self::WaitEventSource(_) => OpKind::WaitEventSource,
            Self::NotifyEventSource(_) => OpKind::NotifyEventSource,
            Self::CloseEventSource(_) => OpKind::CloseEventSource,
            Self::Fsync(_) => OpKind::Fsync,
            Self::ShutdownSocket(_) => OpKind::ShutdownSocket,
            Self::CloseFile(_) => OpKind::CloseFile,
            Self::CloseSocket(_) => OpKind::CloseSocket,
            Self::Socket(_) => OpKind::Socket,
            Self::Poll(_) => OpKind::Poll,
        }
    }
}

/// Linking of a request to the one that follows it in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Link {
    #[default]
    None,
    /// Bind the next request of the batch to this one. Used to pair an
    /// operation with its [`LinkTimeout`].
    Next,
}

/// A queued operation together with caller context.
#[derive(Debug)]
pub struct Request {
    pub op: Op,
    pub user_data: usize,
    pub link: Link,
}

impl Request {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            user_data: 0,
            link: Link::None,
        }
    }

    pub fn user_data(mut self, user_data: usize) -> Self {
        self.user_data = user_data;
        self
    }

    /// Bind the next request of the batch to this one.
    pub fn link_next(mut self) -> Self {
        self.link = Link::Next;
        self
    }
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(u32),
    /// The exit code could not be read back from the kernel.
    Unknown,
}

/// Success payload of a completion.
#[derive(Debug)]
pub enum OpOutput {
    /// Transferred byte count of a data-moving operation.
    Bytes(usize),
    /// Accepted connection and, when available, the peer address.
    Accepted {
        socket: Socket,
        peer: Option<SockAddr>,
    },
    /// Socket created by [`CreateSocket`].
    Created(Socket),
    /// Exit report of a [`ChildExit`] operation.
    Term(Termination),
    /// No additional payload.
    Unit,
}

/// A drained completion record. The descriptor is returned to the caller;
/// ownership of any resource it produced (the accepted or created socket)
/// transfers with the record.
#[derive(Debug)]
pub struct Completion {
    pub id: Id,
    pub user_data: usize,
    pub op: Op,
    pub result: io::Result<OpOutput>,
}

/// Wait behavior of [`Driver::complete`](crate::Driver::complete).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Wait until at least one completion can be reported.
    Blocking,
    /// Drain whatever is ready and return.
    NonBlocking,
}

/// Completion counters of one `complete` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub num_completed: usize,
    pub num_errors: usize,
}
