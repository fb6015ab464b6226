use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),

    #[error("Invalid log filter directive: {0}")]
    InvalidFilter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

pub type Result<T> = std::result::Result<T, LoggerError>;
