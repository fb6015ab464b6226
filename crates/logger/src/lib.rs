//! Leveled logger for utilkit.
//!
//! A [`Logger`] prints `<timestamp> [LEVEL] message` lines for every message at
//! or above its threshold. Loggers are explicit handles; [`Logger::default_logger`]
//! is a process-wide instance for simple programs.
//!
//! The other utilkit crates log through `tracing`. [`LoggerLayer`] bridges the
//! two, so an application can level all of them with one `Logger`:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use utilkit_logger::{init_with_logger, LogLevel, Logger};
//!
//! let logger = Arc::new(Logger::new(LogLevel::Debug));
//! init_with_logger(logger.clone()).expect("subscriber already installed");
//! utilkit_logger::info!(logger, "listening on {}", "0.0.0.0:9000");
//! ```

mod error;
mod layer;
mod level;
mod logger;
pub mod testing;

pub use error::{LoggerError, Result};
pub use layer::{init_tracing, init_with_logger, LoggerLayer};
pub use level::LogLevel;
pub use logger::{level, set_level, Logger, Sink};

#[macro_export]
macro_rules! trace {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::LogLevel::Trace, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::LogLevel::Debug, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::LogLevel::Info, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! warn {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::LogLevel::Warn, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($arg:tt)+) => {
        $logger.log($crate::LogLevel::Error, format_args!($($arg)+))
    };
}
