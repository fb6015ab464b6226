//! The seam between [`GroupConsumer`](crate::GroupConsumer) and a concrete
//! consumer-group implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::GroupConfig;
use crate::error::Result;
use crate::handler::ConsumerGroupHandler;

/// A connected consumer-group client.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Join the group for `topics` and run one session through `handler`.
    ///
    /// Returns `Ok` when the session ends normally (rebalance or `cancel`),
    /// `Err` when joining, the setup callback, or the session itself failed.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Leave the group and release the connection.
    async fn close(&self) -> Result<()>;
}

/// Opens [`GroupClient`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails when the brokers cannot be reached; no retry.
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn GroupClient>>;
}
