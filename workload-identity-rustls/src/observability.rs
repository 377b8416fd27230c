//! Crate-internal logging facade.
//!
//! Records go to `tracing` when that feature is on, otherwise to `log` when the
//! `logging` feature is on. With neither, the macros expand to nothing.

macro_rules! emit {
    ($level:ident, $($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        {
            tracing::$level!($($arg)*);
        }
        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        {
            log::$level!($($arg)*);
        }
        #[cfg(not(any(feature = "tracing", feature = "logging")))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

macro_rules! debug {
    ($($arg:tt)*) => { $crate::observability::emit!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { $crate::observability::emit!(info, $($arg)*) };
}

macro_rules! warn_ {
    ($($arg:tt)*) => { $crate::observability::emit!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { $crate::observability::emit!(error, $($arg)*) };
}

#[allow(unused_imports)]
pub(crate) use {debug, emit, error, info, warn_ as warn};
