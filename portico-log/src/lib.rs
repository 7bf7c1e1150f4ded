//! Logging facade of the portico workspace.
//!
//! The macros below forward to [`tracing`] when the `enable_log` feature is
//! on and expand to nothing otherwise, so instrumented code carries no
//! tracing machinery in default builds. Driver code goes through this crate
//! only, never through `tracing` directly.

#[cfg(feature = "enable_log")]
#[doc(hidden)]
pub use ::tracing;

/// Open a trace-level span covering the rest of the enclosing scope.
///
/// ```
/// let id = 7;
/// portico_log::scope!("start", ?id);
/// ```
#[cfg(feature = "enable_log")]
#[macro_export]
macro_rules! scope {
    ($name:expr $(, $($fields:tt)+)?) => {
        let _scope = $crate::tracing::trace_span!(target: module_path!(), $name $(, $($fields)+)?)
            .entered();
    };
}

#[cfg(not(feature = "enable_log"))]
#[macro_export]
macro_rules! scope {
    ($($args:tt)*) => {};
}

#[cfg(feature = "enable_log")]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::tracing::trace!($($arg)*) };
}

#[cfg(not(feature = "enable_log"))]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "enable_log")]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "enable_log"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "enable_log")]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "enable_log"))]
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "enable_log")]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::tracing::error!($($arg)*) };
}

#[cfg(not(feature = "enable_log"))]
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {};
}
