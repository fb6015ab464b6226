use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::assignor::Assignor;
use crate::error::ConfigError;
use crate::group_consumer::GroupConsumer;
use crate::version::KafkaVersion;

pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLIENT_ID: &str = "utilkit";

/// Where a group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StartOffset {
    Earliest,
    #[default]
    Newest,
}

impl StartOffset {
    /// Broker sentinel for the oldest available offset.
    pub const EARLIEST_RAW: i64 = -2;
    /// Broker sentinel for the next offset to be produced.
    pub const NEWEST_RAW: i64 = -1;

    pub fn from_raw(raw: i64) -> Result<Self, ConfigError> {
        match raw {
            Self::EARLIEST_RAW => Ok(StartOffset::Earliest),
            Self::NEWEST_RAW => Ok(StartOffset::Newest),
            other => Err(ConfigError::InvalidOffset(other.to_string())),
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            StartOffset::Earliest => Self::EARLIEST_RAW,
            StartOffset::Newest => Self::NEWEST_RAW,
        }
    }

    /// Value for librdkafka's `auto.offset.reset`.
    pub fn auto_offset_reset(&self) -> &'static str {
        match self {
            StartOffset::Earliest => "earliest",
            StartOffset::Newest => "latest",
        }
    }
}

impl fmt::Display for StartOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOffset::Earliest => f.write_str("earliest"),
            StartOffset::Newest => f.write_str("newest"),
        }
    }
}

impl FromStr for StartOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" | "oldest" | "smallest" => Ok(StartOffset::Earliest),
            "newest" | "latest" | "largest" => Ok(StartOffset::Newest),
            other => other
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidOffset(s.to_string()))
                .and_then(Self::from_raw),
        }
    }
}

/// Snapshot of a [`GroupConsumer`]'s settings, handed to a
/// [`Connector`](crate::Connector) when connecting.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub brokers: Vec<String>,
    pub group: String,
    pub topics: Vec<String>,
    pub assignor: Assignor,
    pub offset: StartOffset,
    pub version: KafkaVersion,
    pub channel_buffer_size: usize,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub client_id: String,
}

impl GroupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() || self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::NoBrokers);
        }
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.group.is_empty() {
            return Err(ConfigError::EmptyGroup);
        }
        if self.channel_buffer_size == 0 {
            return Err(ConfigError::ZeroChannelBufferSize);
        }
        Ok(())
    }

    /// Comma-separated broker list.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

fn default_assignor() -> String {
    Assignor::default().name().to_string()
}

fn default_offset() -> String {
    StartOffset::default().to_string()
}

fn default_version() -> String {
    KafkaVersion::DEFAULT.to_string()
}

fn default_channel_buffer_size() -> usize {
    DEFAULT_CHANNEL_BUFFER_SIZE
}

fn default_session_timeout_ms() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_millis() as u64
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
}

/// Declarative consumer settings, read from command-line flags and the
/// environment or from a TOML document.
#[derive(Debug, Clone, Parser, Deserialize)]
#[command(about = "Kafka consumer group settings")]
pub struct ConsumerArgs {
    /// Kafka brokers (host:port), comma separated
    #[arg(long = "broker", env = "KAFKA_BROKERS", value_delimiter = ',', required = true)]
    pub brokers: Vec<String>,

    /// Topics to consume, comma separated
    #[arg(long = "topic", env = "KAFKA_TOPICS", value_delimiter = ',', required = true)]
    pub topics: Vec<String>,

    /// Consumer group ID
    #[arg(long, env = "KAFKA_GROUP")]
    pub group: String,

    /// Partition assignor: sticky, round-robin or range
    #[arg(long, env = "KAFKA_ASSIGNOR", default_value = "range")]
    #[serde(default = "default_assignor")]
    pub assignor: String,

    /// Initial offset when the group has no committed offset: earliest or newest
    #[arg(long, env = "KAFKA_OFFSET", default_value = "newest")]
    #[serde(default = "default_offset")]
    pub offset: String,

    /// Broker protocol version
    #[arg(long, env = "KAFKA_VERSION", default_value = KafkaVersion::DEFAULT)]
    #[serde(default = "default_version")]
    pub version: String,

    /// Capacity of each partition's message channel
    #[arg(long, default_value_t = DEFAULT_CHANNEL_BUFFER_SIZE)]
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Group session timeout in milliseconds
    #[arg(long, default_value_t = default_session_timeout_ms())]
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Timeout for the initial broker connection in milliseconds
    #[arg(long, default_value_t = default_connect_timeout_ms())]
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConsumerArgs {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Build a [`GroupConsumer`] from these settings.
    pub fn into_consumer(self) -> Result<GroupConsumer, ConfigError> {
        let mut consumer =
            GroupConsumer::new(self.brokers, self.topics, self.group, &self.assignor)?;
        consumer.set_offset(self.offset.parse()?);
        consumer.set_version(&self.version)?;
        consumer.set_channel_buffer_size(self.channel_buffer_size);
        consumer.set_session_timeout(Duration::from_millis(self.session_timeout_ms));
        consumer.set_connect_timeout(Duration::from_millis(self.connect_timeout_ms));
        Ok(consumer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GroupConfig {
        GroupConfig {
            brokers: vec!["localhost:9092".to_string()],
            group: "g".to_string(),
            topics: vec!["t".to_string()],
            assignor: Assignor::Range,
            offset: StartOffset::Newest,
            version: KafkaVersion::default(),
            channel_buffer_size: 1,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }

    #[test]
    fn test_start_offset_parse() {
        assert_eq!("earliest".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("Oldest".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("-2".parse::<StartOffset>().unwrap(), StartOffset::Earliest);
        assert_eq!("latest".parse::<StartOffset>().unwrap(), StartOffset::Newest);
        assert_eq!("-1".parse::<StartOffset>().unwrap(), StartOffset::Newest);
        assert!(matches!(
            "42".parse::<StartOffset>(),
            Err(ConfigError::InvalidOffset(_))
        ));
        assert!("middle".parse::<StartOffset>().is_err());
        assert_eq!(StartOffset::Earliest.as_raw(), -2);
        assert_eq!(StartOffset::Newest.auto_offset_reset(), "latest");
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut c = config();
        c.channel_buffer_size = 0;
        assert!(matches!(c.validate(), Err(ConfigError::ZeroChannelBufferSize)));

        let mut c = config();
        c.brokers.clear();
        assert!(matches!(c.validate(), Err(ConfigError::NoBrokers)));

        let mut c = config();
        c.topics.clear();
        assert!(matches!(c.validate(), Err(ConfigError::NoTopics)));

        let mut c = config();
        c.group.clear();
        assert!(matches!(c.validate(), Err(ConfigError::EmptyGroup)));
    }

    #[test]
    fn test_args_from_cli() {
        let args = ConsumerArgs::try_parse_from([
            "consumer",
            "--broker",
            "a:9092,b:9092",
            "--topic",
            "orders",
            "--group",
            "billing",
            "--assignor",
            "sticky",
            "--offset",
            "earliest",
        ])
        .unwrap();
        assert_eq!(args.brokers, vec!["a:9092", "b:9092"]);
        assert_eq!(args.version, "3.7.0");
        assert_eq!(args.channel_buffer_size, 1000);

        let consumer = args.into_consumer().unwrap();
        assert_eq!(consumer.assignor(), Assignor::Sticky);
        assert_eq!(consumer.offset(), StartOffset::Earliest);
        assert_eq!(consumer.group(), "billing");
    }

    #[test]
    fn test_args_from_toml() {
        let args = ConsumerArgs::from_toml_str(
            r#"
            brokers = ["localhost:9092"]
            topics = ["events", "orders"]
            group = "reporting"
            assignor = "round-robin"
            version = "0.10.2.1"
            channel_buffer_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(args.offset, "newest");
        assert_eq!(args.session_timeout_ms, 10_000);

        let consumer = args.into_consumer().unwrap();
        assert_eq!(consumer.assignor(), Assignor::RoundRobin);
        assert_eq!(consumer.version().to_string(), "0.10.2.1");
        assert_eq!(consumer.channel_buffer_size(), 16);
        assert_eq!(consumer.topics(), ["events", "orders"]);
    }

    #[test]
    fn test_args_bad_values() {
        let args = ConsumerArgs::from_toml_str(
            r#"
            brokers = ["localhost:9092"]
            topics = ["t"]
            group = "g"
            assignor = "fair"
            "#,
        )
        .unwrap();
        assert!(matches!(
            args.into_consumer(),
            Err(ConfigError::UnknownAssignor(ref s)) if s == "fair"
        ));

        assert!(matches!(
            ConsumerArgs::from_toml_str("brokers = 1"),
            Err(ConfigError::Toml(_))
        ));
    }
}
