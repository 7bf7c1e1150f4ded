//! Completion-port driven batch submission/completion engine.
//!
//! A caller queues a batch of operation descriptors, then drives them with
//! `Driver::complete`. Operations the port can express natively are issued
//! as overlapped I/O; timers, event sources and a dynamic worker pool cover
//! the rest, and every path funnels into the same completion drain.
//!
//! The driver itself only exists on Windows. The support components it is
//! built from (the worker pool, the timer queue, the event source) are
//! portable and usable on their own.

#![deny(rustdoc::broken_intra_doc_links)]

use std::time::Duration;

mod event;
mod key;
mod pool;
mod timer;

pub use event::{EventSource, Waiter};
pub use key::Id;
pub use pool::DynamicThreadPool;
pub use timer::TimerQueue;

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod iocp;
        pub mod op;
        mod table;

        pub(crate) use key::Key;

        pub use iocp::Driver;
        pub use op::{
            AsRawFd, Completion, CompletionMode, Interest, Link, Op, OpKind, OpOutput, RawFd,
            Request, Summary, Termination,
        };
    }
}

/// Helper macro to execute a system call and translate failure into
/// [`std::io::Error`].
#[cfg(windows)]
#[macro_export]
#[doc(hidden)]
macro_rules! syscall {
    (BOOL, $e:expr) => {
        $crate::syscall!($e, == 0)
    };
    (SOCKET, $e:expr) => {
        $crate::syscall!($e, != 0)
    };
    (HANDLE, $e:expr) => {
        $crate::syscall!($e, == ::windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE)
    };
    (PTR, $e:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res.is_null() {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
    ($e:expr, $op:tt $rhs:expr) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { $e };
        if res $op $rhs {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Whether this backend can drive every operation of a batch. Readiness
/// polls cannot be expressed through the completion port.
#[cfg(windows)]
pub fn is_supported<'a>(requests: impl IntoIterator<Item = &'a Request>) -> bool {
    requests
        .into_iter()
        .all(|req| !matches!(req.op, Op::Poll(_)))
}

/// One-shot convenience: build a driver, queue the batch, drain blockingly
/// until every operation completed, and tear the driver down. Returns the
/// number of failed operations.
#[cfg(windows)]
pub fn immediate(
    requests: impl IntoIterator<Item = Request>,
    mut handler: impl FnMut(Completion),
) -> std::io::Result<usize> {
    let mut driver = Driver::new()?;
    driver.queue(requests)?;
    let mut errors = 0;
    while !driver.is_empty() {
        let summary = driver.complete(CompletionMode::Blocking, &mut handler)?;
        errors += summary.num_errors;
    }
    Ok(errors)
}

/// Configuration of a [`Driver`].
#[derive(Debug, Clone)]
pub struct Builder {
    pub(crate) capacity: usize,
    pub(crate) thread_pool_limit: usize,
    pub(crate) thread_pool_idle_timeout: Duration,
    pub(crate) thread_name: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create the builder with default config.
    pub fn new() -> Self {
        Self {
            capacity: 1024,
            thread_pool_limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_pool_idle_timeout: DynamicThreadPool::DEFAULT_IDLE_TIMEOUT,
            thread_name: None,
        }
    }

    /// Initial slot reservation of the operation table. The table grows past
    /// it on demand. The default value is 1024.
    pub fn capacity(&mut self, capacity: usize) -> &mut Self {
        self.capacity = capacity;
        self
    }

    /// Thread number limit of the worker pool. With a limit of zero the pool
    /// is disabled and blocking operations run inline on the driver thread.
    pub fn thread_pool_limit(&mut self, value: usize) -> &mut Self {
        self.thread_pool_limit = value;
        self
    }

    /// How long an idle worker thread lingers before it retires.
    pub fn thread_pool_idle_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.thread_pool_idle_timeout = timeout;
        self
    }

    /// Name given to worker threads.
    pub fn thread_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Build the [`Driver`].
    #[cfg(windows)]
    pub fn build(&self) -> std::io::Result<Driver> {
        Driver::with_builder(self)
    }
}
