//! Kafka consumer group wrapper.
//!
//! [`GroupConsumer`] holds a group's settings and three session callbacks
//! (setup, cleanup, consume claim). [`GroupConsumer::connect`] joins the group
//! on a background task and returns a [`Shutdown`] handle once the first
//! session is up; the task keeps rejoining after every rebalance until the
//! handle shuts it down or the client fails.
//!
//! Features:
//!
//! - Partition assignors: sticky, round-robin and range
//! - Pluggable group clients: rdkafka ([`RdKafkaConnector`], the default) or
//!   the in-process [`MemoryBroker`]
//! - Offset marking and committing through the [`Session`]
//! - Settings from code, command-line flags or TOML ([`ConsumerArgs`])
//!
//! ```no_run
//! use utilkit_kafka::GroupConsumer;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut consumer = GroupConsumer::new(["localhost:9092"], ["events"], "reporting", "sticky")?;
//! consumer.set_consume_claim_fn(|session, mut claim| async move {
//!     while let Some(message) = claim.recv().await {
//!         println!("{}/{}@{}", message.topic, message.partition, message.offset);
//!         session.mark_message(&message)?;
//!     }
//!     Ok(())
//! });
//!
//! let shutdown = consumer.connect().await?;
//! tokio::signal::ctrl_c().await?;
//! shutdown.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod assignor;

/// Seam between the consumer and a group client implementation
pub mod client;
pub mod config;

/// rdkafka-backed group client
pub mod consumer;
pub mod error;
pub mod group_consumer;
pub mod handler;

/// In-process broker for tests and embedding
pub mod memory;
pub mod message;
pub mod session;
pub mod version;

// Re-export main types for easy access
pub use assignor::{Assignment, Assignor};
pub use client::{Connector, GroupClient};
pub use config::{ConsumerArgs, GroupConfig, StartOffset};
pub use consumer::RdKafkaConnector;
pub use error::{ConfigError, Error, Result};
pub use group_consumer::{GroupConsumer, Shutdown};
pub use handler::{Callbacks, ConsumerGroupHandler};
pub use memory::MemoryBroker;
pub use message::Message;
pub use session::{Claim, OffsetCommitter, Session};
pub use version::KafkaVersion;
