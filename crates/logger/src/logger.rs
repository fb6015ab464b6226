use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::level::LogLevel;

/// Output sink for a [`Logger`].
pub type Sink = Box<dyn Write + Send>;

/// Timestamp prefix written before the level tag, e.g. `2024/01/23 01:23:23`.
const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// A logger that only prints messages at or above its configured level.
///
/// Every line has the form `<timestamp> [TAG] message`. The level, the
/// output and the timestamp prefix can all be changed through a shared
/// reference, so one logger can be handed to several components as
/// `Arc<Logger>`.
pub struct Logger {
    level: AtomicU8,
    timestamps: AtomicBool,
    out: Mutex<Sink>,
}

static DEFAULT_LOGGER: OnceLock<Logger> = OnceLock::new();

impl Logger {
    /// Create a logger writing to stdout.
    pub fn new(level: LogLevel) -> Self {
        Self::with_output(level, io::stdout())
    }

    /// Create a logger writing to the given sink.
    pub fn with_output<W: Write + Send + 'static>(level: LogLevel, out: W) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
            timestamps: AtomicBool::new(true),
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Process-wide logger used when no explicit handle is passed around.
    ///
    /// Starts at `Info`, writing to stdout.
    pub fn default_logger() -> &'static Logger {
        DEFAULT_LOGGER.get_or_init(|| Logger::new(LogLevel::Info))
    }

    pub fn set_output<W: Write + Send + 'static>(&self, out: W) {
        let mut guard = self.out.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Box::new(out);
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Toggle the timestamp prefix.
    pub fn set_timestamps(&self, enabled: bool) {
        self.timestamps.store(enabled, Ordering::Relaxed);
    }

    /// Whether a message at `level` would be printed.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level() <= level
    }

    /// Print a formatted message at `level` if the logger lets it through.
    ///
    /// Write failures are swallowed: logging never fails the caller.
    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let line = self.format_line(level, args);
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }

    pub fn trace(&self, msg: impl fmt::Display) {
        self.log(LogLevel::Trace, format_args!("{msg}"));
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        self.log(LogLevel::Debug, format_args!("{msg}"));
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.log(LogLevel::Info, format_args!("{msg}"));
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.log(LogLevel::Warn, format_args!("{msg}"));
    }

    pub fn error(&self, msg: impl fmt::Display) {
        self.log(LogLevel::Error, format_args!("{msg}"));
    }

    /// Print at `Fatal` and terminate the process with exit status 1.
    ///
    /// Does nothing at all when the logger is set above `Fatal`.
    pub fn fatal(&self, msg: impl fmt::Display) {
        if !self.enabled(LogLevel::Fatal) {
            return;
        }
        self.log(LogLevel::Fatal, format_args!("{msg}"));
        std::process::exit(1);
    }

    /// Print at `Panic`, then panic with `"[PANIC] <msg>"`.
    pub fn panic(&self, msg: impl fmt::Display) {
        if !self.enabled(LogLevel::Panic) {
            return;
        }
        let msg = msg.to_string();
        self.log(LogLevel::Panic, format_args!("{msg}"));
        panic!("[{}] {}", LogLevel::Panic.tag(), msg);
    }

    fn format_line(&self, level: LogLevel, args: fmt::Arguments<'_>) -> String {
        let mut line = String::new();
        if self.timestamps.load(Ordering::Relaxed) {
            line.push_str(&chrono::Local::now().format(TIMESTAMP_FORMAT).to_string());
            line.push(' ');
        }
        line.push('[');
        line.push_str(level.tag());
        line.push_str("] ");
        line.push_str(&args.to_string());
        if !line.ends_with('\n') {
            line.push('\n');
        }
        line
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("timestamps", &self.timestamps.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Set the level of [`Logger::default_logger`].
pub fn set_level(level: LogLevel) {
    Logger::default_logger().set_level(level);
}

/// Level of [`Logger::default_logger`].
pub fn level() -> LogLevel {
    Logger::default_logger().level()
}
