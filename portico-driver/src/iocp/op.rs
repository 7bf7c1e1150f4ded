//! Win32 submission primitives and the blocking executor.

use std::{io, mem::size_of, ptr::null_mut, task::Poll};

use once_cell::sync::OnceCell;
use socket2::{Domain, SockAddr, Socket};
use windows_sys::{
    core::GUID,
    Wdk::Storage::FileSystem::{
        FileAccessInformation, NtQueryInformationFile, FILE_ACCESS_INFORMATION,
    },
    Win32::{
        Foundation::{
            CloseHandle, GetLastError, RtlNtStatusToDosError, ERROR_BROKEN_PIPE, ERROR_HANDLE_EOF,
            ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_NO_DATA, ERROR_PIPE_CONNECTED,
            ERROR_PIPE_NOT_CONNECTED, STATUS_SUCCESS,
        },
        Networking::WinSock::{
            closesocket, getsockname, setsockopt, shutdown, WSAIoctl, WSARecv, WSASend, WSASendMsg,
            LPFN_ACCEPTEX, LPFN_GETACCEPTEXSOCKADDRS, LPFN_WSARECVMSG, SD_BOTH, SD_RECEIVE,
            SD_SEND, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_STORAGE, SOL_SOCKET,
            SO_UPDATE_ACCEPT_CONTEXT, WSABUF, WSAID_ACCEPTEX, WSAID_GETACCEPTEXSOCKADDRS,
            WSAID_WSARECVMSG, WSAMSG,
        },
        Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile},
        System::IO::{CancelIoEx, IO_STATUS_BLOCK, OVERLAPPED},
    },
};

use super::Staged;
use crate::{
    op::{Op, RawFd},
    syscall,
    table::OpRuntime,
};

#[inline]
fn winapi_result(transferred: u32) -> Poll<io::Result<usize>> {
    let error = unsafe { GetLastError() };
    assert_ne!(error, 0);
    match error {
        ERROR_IO_PENDING => Poll::Pending,
        ERROR_IO_INCOMPLETE
        | ERROR_HANDLE_EOF
        | ERROR_BROKEN_PIPE
        | ERROR_PIPE_CONNECTED
        | ERROR_PIPE_NOT_CONNECTED
        | ERROR_NO_DATA => Poll::Ready(Ok(transferred as _)),
        _ => Poll::Ready(Err(io::Error::from_raw_os_error(error as _))),
    }
}

#[inline]
fn win32_result(res: i32, transferred: u32) -> Poll<io::Result<usize>> {
    if res == 0 {
        winapi_result(transferred)
    } else {
        Poll::Ready(Ok(transferred as _))
    }
}

#[inline]
fn winsock_result(res: i32, transferred: u32) -> Poll<io::Result<usize>> {
    if res != 0 {
        winapi_result(transferred)
    } else {
        Poll::Ready(Ok(transferred as _))
    }
}

/// Request cancellation of an overlapped operation. Returns whether the
/// cancel request was accepted by the kernel.
pub(super) fn try_cancel_io(handle: RawFd, optr: *mut OVERLAPPED) -> bool {
    syscall!(BOOL, CancelIoEx(handle as _, optr)).is_ok()
}

fn get_wsa_fn<F>(handle: RawFd, fguid: GUID) -> io::Result<Option<F>> {
    let mut fptr = None;
    let mut returned = 0;
    syscall!(
        SOCKET,
        WSAIoctl(
            handle as _,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            std::ptr::addr_of!(fguid).cast(),
            size_of::<GUID>() as _,
            std::ptr::addr_of_mut!(fptr).cast(),
            size_of::<F>() as _,
            &mut returned,
            null_mut(),
            None,
        )
    )?;
    Ok(fptr)
}

static ACCEPT_EX: OnceCell<LPFN_ACCEPTEX> = OnceCell::new();
static GET_ADDRS: OnceCell<LPFN_GETACCEPTEXSOCKADDRS> = OnceCell::new();
static WSA_RECV_MSG: OnceCell<LPFN_WSARECVMSG> = OnceCell::new();

pub(super) const ACCEPT_ADDR_BUFFER_SIZE: usize = size_of::<SOCKADDR_STORAGE>() + 16;
pub(super) const ACCEPT_BUFFER_SIZE: usize = ACCEPT_ADDR_BUFFER_SIZE * 2;

pub(super) fn not_open_for_reading() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "handle is not open for reading")
}

pub(super) fn not_open_for_writing() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "handle is not open for writing")
}

/// Access mask granted to the handle at open time.
pub(super) fn file_access_mask(fd: RawFd) -> io::Result<u32> {
    let mut info: FILE_ACCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let mut iosb: IO_STATUS_BLOCK = unsafe { std::mem::zeroed() };
    let status = unsafe {
        NtQueryInformationFile(
            fd as _,
            &mut iosb,
            std::ptr::addr_of_mut!(info).cast(),
            size_of::<FILE_ACCESS_INFORMATION>() as _,
            FileAccessInformation,
        )
    };
    if status != STATUS_SUCCESS {
        let error = unsafe { RtlNtStatusToDosError(status) };
        return Err(io::Error::from_raw_os_error(error as _));
    }
    Ok(info.AccessFlags)
}

/// Address family of a bound socket.
pub(super) fn socket_family(fd: RawFd) -> io::Result<Domain> {
    let mut storage: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
    let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
    syscall!(
        SOCKET,
        getsockname(
            fd as _,
            std::ptr::addr_of_mut!(storage).cast::<SOCKADDR>(),
            &mut len,
        )
    )?;
    Ok(Domain::from(storage.ss_family as i32))
}

pub(super) unsafe fn submit_read(
    handle: RawFd,
    buf: &mut [u8],
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let mut transferred = 0;
    let res = ReadFile(
        handle as _,
        buf.as_mut_ptr() as _,
        buf.len() as _,
        &mut transferred,
        optr,
    );
    win32_result(res, transferred)
}

pub(super) unsafe fn submit_write(
    handle: RawFd,
    buf: &[u8],
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let mut transferred = 0;
    let res = WriteFile(
        handle as _,
        buf.as_ptr() as _,
        buf.len() as _,
        &mut transferred,
        optr,
    );
    win32_result(res, transferred)
}

pub(super) unsafe fn submit_accept(
    listener: RawFd,
    accept_socket: RawFd,
    buf: *mut u8,
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let accept_fn = match ACCEPT_EX.get_or_try_init(|| get_wsa_fn(listener, WSAID_ACCEPTEX)) {
        Ok(f) => match f {
            Some(f) => *f,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot retrieve AcceptEx",
                )))
            }
        },
        Err(e) => return Poll::Ready(Err(e)),
    };
    let mut received = 0;
    let res = accept_fn(
        listener as _,
        accept_socket as _,
        buf.cast(),
        0,
        ACCEPT_ADDR_BUFFER_SIZE as _,
        ACCEPT_ADDR_BUFFER_SIZE as _,
        &mut received,
        optr,
    );
    win32_result(res, received)
}

/// Let the accepted socket inherit the listener's context, so that
/// `getpeername` and `shutdown` work on it.
pub(super) fn update_accept_context(listener: RawFd, accepted: &Socket) -> io::Result<()> {
    let listener = listener as usize;
    syscall!(
        SOCKET,
        setsockopt(
            crate::op::AsRawFd::as_raw_fd(accepted) as _,
            SOL_SOCKET as _,
            SO_UPDATE_ACCEPT_CONTEXT as _,
            std::ptr::addr_of!(listener).cast(),
            size_of::<usize>() as _,
        )
    )?;
    Ok(())
}

/// Extract the peer address the kernel wrote into the accept scratch buffer.
pub(super) fn extract_peer_addr(listener: RawFd, buf: *const u8) -> io::Result<SockAddr> {
    let get_addrs_fn = GET_ADDRS
        .get_or_try_init(|| get_wsa_fn(listener, WSAID_GETACCEPTEXSOCKADDRS))?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot retrieve GetAcceptExSockAddrs",
            )
        })?;
    let mut local_addr: *mut SOCKADDR = null_mut();
    let mut local_addr_len = 0;
    let mut remote_addr: *mut SOCKADDR = null_mut();
    let mut remote_addr_len = 0;
    unsafe {
        get_addrs_fn(
            buf.cast(),
            0,
            ACCEPT_ADDR_BUFFER_SIZE as _,
            ACCEPT_ADDR_BUFFER_SIZE as _,
            &mut local_addr,
            &mut local_addr_len,
            &mut remote_addr,
            &mut remote_addr_len,
        );
    }
    if remote_addr.is_null() || remote_addr_len <= 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no peer address in accept buffer",
        ));
    }
    let ((), addr) = unsafe {
        SockAddr::try_init(|storage, len| {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    remote_addr.cast::<u8>().cast_const(),
                    storage.cast::<u8>(),
                    remote_addr_len as usize,
                );
                *len = remote_addr_len;
            }
            Ok(())
        })
    }?;
    Ok(addr)
}

pub(super) unsafe fn submit_recv(
    sock: RawFd,
    wsabuf: *mut WSABUF,
    flags: *mut u32,
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let mut received = 0;
    let res = WSARecv(sock as _, wsabuf, 1, &mut received, flags, optr, None);
    winsock_result(res, received)
}

pub(super) unsafe fn submit_send(
    sock: RawFd,
    wsabuf: *const WSABUF,
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let mut sent = 0;
    let res = WSASend(sock as _, wsabuf, 1, &mut sent, 0, optr, None);
    winsock_result(res, sent)
}

pub(super) unsafe fn submit_recv_msg(
    sock: RawFd,
    msg: *mut WSAMSG,
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    // `WSARecvMsg` is only reachable through the extension-function ioctl;
    // the pointer is resolved once per process.
    let recv_msg = match WSA_RECV_MSG.get_or_try_init(|| get_wsa_fn(sock, WSAID_WSARECVMSG)) {
        Ok(f) => match f {
            Some(f) => *f,
            None => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot retrieve WSARecvMsg",
                )))
            }
        },
        Err(e) => return Poll::Ready(Err(e)),
    };
    let mut received = 0;
    let res = recv_msg(sock as _, msg, &mut received, optr, None);
    winsock_result(res, received)
}

pub(super) unsafe fn submit_send_msg(
    sock: RawFd,
    msg: *const WSAMSG,
    optr: *mut OVERLAPPED,
) -> Poll<io::Result<usize>> {
    let mut sent = 0;
    let res = WSASendMsg(sock as _, msg, 0, &mut sent, optr, None);
    winsock_result(res, sent)
}

/// Run a non-port-eligible operation to its first terminal result, busy
/// retrying a would-block condition.
pub(crate) fn execute_blocking(run: &mut OpRuntime) -> io::Result<()> {
    loop {
        match execute_blocking_once(run) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
            res => return res,
        }
    }
}

fn execute_blocking_once(run: &mut OpRuntime) -> io::Result<()> {
    match &mut run.op {
        Op::Fsync(op) => {
            syscall!(BOOL, FlushFileBuffers(op.fd as _))?;
        }
        Op::CloseFile(op) => {
            syscall!(BOOL, CloseHandle(op.fd as _))?;
        }
        Op::CloseSocket(op) => {
            syscall!(SOCKET, closesocket(op.fd as _))?;
        }
        Op::ShutdownSocket(op) => {
            let how = match op.how {
                std::net::Shutdown::Write => SD_SEND,
                std::net::Shutdown::Read => SD_RECEIVE,
                std::net::Shutdown::Both => SD_BOTH,
            };
            syscall!(SOCKET, shutdown(op.fd as _, how as _))?;
        }
        Op::Socket(op) => {
            let socket = Socket::new(op.domain, op.ty, op.protocol)?;
            run.staged = Staged::Created(socket);
        }
        Op::NotifyEventSource(op) => {
            op.source.notify();
        }
        Op::CloseEventSource(op) => {
            drop(op.take());
        }
        _ => unreachable!("operation is not executed on the blocking path"),
    }
    Ok(())
}
