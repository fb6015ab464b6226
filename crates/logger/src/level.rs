use std::fmt;
use std::str::FromStr;

use crate::error::LoggerError;

/// Severity of a log line, ordered from the most verbose to the most severe.
///
/// A logger configured at a given level prints every message whose level is
/// greater than or equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
    Panic = 6,
}

impl LogLevel {
    /// All levels, from `Trace` to `Panic`.
    pub const ALL: [LogLevel; 7] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
        LogLevel::Panic,
    ];

    /// Upper-case tag written in front of every message, e.g. `[WARN]`.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Panic => "PANIC",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            5 => Self::Fatal,
            _ => Self::Panic,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "Trace",
            Self::Debug => "Debug",
            Self::Info => "Info",
            Self::Warn => "Warn",
            Self::Error => "Error",
            Self::Fatal => "Fatal",
            Self::Panic => "Panic",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "panic" => Ok(Self::Panic),
            _ => Err(LoggerError::UnknownLevel(s.to_string())),
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        if level == tracing::Level::TRACE {
            Self::Trace
        } else if level == tracing::Level::DEBUG {
            Self::Debug
        } else if level == tracing::Level::INFO {
            Self::Info
        } else if level == tracing::Level::WARN {
            Self::Warn
        } else {
            Self::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_display() {
        let names: Vec<String> = LogLevel::ALL.iter().map(|l| l.to_string()).collect();
        assert_eq!(
            names,
            vec!["Trace", "Debug", "Info", "Warn", "Error", "Fatal", "Panic"]
        );
    }

    #[test]
    fn test_level_tags() {
        assert_eq!(LogLevel::Trace.tag(), "TRACE");
        assert_eq!(LogLevel::Warn.tag(), "WARN");
        assert_eq!(LogLevel::Panic.tag(), "PANIC");
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert!(LogLevel::Fatal < LogLevel::Panic);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!(" warning ".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("panic".parse::<LogLevel>().unwrap(), LogLevel::Panic);

        let err = "verbose".parse::<LogLevel>().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_level_u8_roundtrip() {
        for level in LogLevel::ALL {
            assert_eq!(LogLevel::from_u8(level as u8), level);
        }
    }

    #[test]
    fn test_level_from_tracing() {
        assert_eq!(LogLevel::from(tracing::Level::TRACE), LogLevel::Trace);
        assert_eq!(LogLevel::from(tracing::Level::INFO), LogLevel::Info);
        assert_eq!(LogLevel::from(tracing::Level::ERROR), LogLevel::Error);
    }
}
