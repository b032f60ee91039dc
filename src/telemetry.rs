//! Logging macros that compile to `tracing` events when the `tracing`
//! feature is enabled and to nothing otherwise.

macro_rules! sandbox_debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::debug!($($arg)*);
    }};
}

macro_rules! sandbox_info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::info!($($arg)*);
    }};
}

macro_rules! sandbox_warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::warn!($($arg)*);
    }};
}

pub(crate) use sandbox_debug;
pub(crate) use sandbox_info;
pub(crate) use sandbox_warn;
