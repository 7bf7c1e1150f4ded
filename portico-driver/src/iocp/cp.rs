//! Completion port wrapper.

use std::{
    io,
    os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle},
    ptr::null_mut,
};

use portico_log::trace;
use windows_sys::Win32::{
    Foundation::{ERROR_INVALID_PARAMETER, INVALID_HANDLE_VALUE, WAIT_TIMEOUT},
    Storage::FileSystem::SetFileCompletionNotificationModes,
    System::{
        WindowsProgramming::{FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, FILE_SKIP_SET_EVENT_ON_HANDLE},
        IO::{
            CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
            OVERLAPPED,
        },
    },
};

use crate::{op::RawFd, syscall, Key};

/// One dequeued port completion.
pub(crate) struct Dequeued {
    pub key: Key,
    pub transferred: u32,
    pub optr: *mut OVERLAPPED,
    /// Port-level status of the completion; `Err` carries the raw transport
    /// error of a failed overlapped operation.
    pub result: io::Result<()>,
}

/// The native port handle plus the number of dequeuer threads it was sized
/// for. The thread count only matters at teardown, where one shutdown message
/// per dequeuer is posted.
pub(crate) struct Port {
    handle: OwnedHandle,
    num_threads: u32,
}

impl Port {
    pub fn new(num_threads: u32) -> io::Result<Self> {
        let port = syscall!(
            PTR,
            CreateIoCompletionPort(INVALID_HANDLE_VALUE, null_mut(), 0, num_threads)
        )?;
        trace!("new iocp handle: {port:?}");
        Ok(Self {
            handle: unsafe { OwnedHandle::from_raw_handle(port as RawHandle) },
            num_threads,
        })
    }

    fn raw(&self) -> RawHandle {
        self.handle.as_raw_handle()
    }

    /// Associate a file handle with the port under the overlapped key.
    ///
    /// Synchronously completed operations on the handle do not enqueue a port
    /// completion; their result is reported inline by the submitter.
    pub fn associate_handle(&self, fd: RawFd) -> io::Result<()> {
        syscall!(
            BOOL,
            SetFileCompletionNotificationModes(
                fd as _,
                (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as _
            )
        )?;
        match syscall!(
            PTR,
            CreateIoCompletionPort(fd as _, self.raw() as _, Key::Overlapped.to_word(), 0)
        ) {
            Ok(_) => Ok(()),
            // Re-association of an already associated handle reports success.
            Err(e) if e.raw_os_error() == Some(ERROR_INVALID_PARAMETER as _) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Associate a socket with the port. Sockets are handle-sized on Windows,
    /// so this shares the file-handle path.
    pub fn associate_socket(&self, sock: RawFd) -> io::Result<()> {
        self.associate_handle(sock)
    }

    /// Enqueue a zero-byte completion carrying `key`.
    pub fn post(&self, key: Key) -> io::Result<()> {
        syscall!(
            BOOL,
            PostQueuedCompletionStatus(self.raw() as _, 0, key.to_word(), null_mut())
        )?;
        Ok(())
    }

    /// Dequeue a single completion, waiting at most `timeout_ms`. Returns
    /// `None` on timeout.
    pub fn dequeue(&self, timeout_ms: u32) -> io::Result<Option<Dequeued>> {
        let mut transferred = 0u32;
        let mut key_word = 0usize;
        let mut optr: *mut OVERLAPPED = null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.raw() as _,
                &mut transferred,
                &mut key_word,
                &mut optr,
                timeout_ms,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if optr.is_null() {
                // The dequeue itself failed; a timeout is not an error.
                return if err.raw_os_error() == Some(WAIT_TIMEOUT as _) {
                    Ok(None)
                } else {
                    Err(err)
                };
            }
            return Ok(Some(Dequeued {
                key: Key::from_word(key_word),
                transferred,
                optr,
                result: Err(err),
            }));
        }
        Ok(Some(Dequeued {
            key: Key::from_word(key_word),
            transferred,
            optr,
            result: Ok(()),
        }))
    }
}

impl AsRawHandle for Port {
    fn as_raw_handle(&self) -> RawHandle {
        self.handle.as_raw_handle()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Some kernels, notably WINE, do not wake blocked dequeuers when the
        // port closes. Post one shutdown message per expected dequeuer.
        for _ in 0..self.num_threads {
            self.post(Key::Shutdown).ok();
        }
    }
}
