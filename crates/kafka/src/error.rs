use thiserror::Error;

/// Misconfiguration detected before any connection is attempted.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "consumer group partition assignor should be one of sticky, round-robin or range, but got: {0}"
    )]
    UnknownAssignor(String),

    #[error("Invalid Kafka version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Invalid initial offset '{0}': expected earliest (-2) or newest (-1)")]
    InvalidOffset(String),

    #[error("Channel buffer size must be at least 1")]
    ZeroChannelBufferSize,

    #[error("At least one broker address is required")]
    NoBrokers,

    #[error("At least one topic is required")]
    NoTopics,

    #[error("Consumer group id must not be empty")]
    EmptyGroup,

    #[error("Invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Create consumer group client failed: {0}")]
    Connect(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Handler error: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("Consumer group is already running; shut it down before connecting again")]
    AlreadyRunning,

    #[error("Consumer group stopped before its first session: {0}")]
    NotReady(String),

    #[error("Consumer group client is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
