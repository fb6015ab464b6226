//! [`GroupConsumer`]: owns a consumer group's settings and callbacks and runs
//! its consumption loop on a background task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::assignor::Assignor;
use crate::client::{Connector, GroupClient};
use crate::config::{
    GroupConfig, StartOffset, DEFAULT_CHANNEL_BUFFER_SIZE, DEFAULT_CLIENT_ID,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_SESSION_TIMEOUT,
};
use crate::consumer::RdKafkaConnector;
use crate::error::{ConfigError, Error, Result};
use crate::handler::{Callbacks, ConsumerGroupHandler};
use crate::session::{Claim, Session};
use crate::version::KafkaVersion;

/// A consumer group member with user supplied session callbacks.
///
/// Settings are snapshotted by [`connect`](GroupConsumer::connect); changing
/// them afterwards only affects the next connect.
pub struct GroupConsumer {
    brokers: Vec<String>,
    topics: Vec<String>,
    group: String,
    assignor: Assignor,
    offset: StartOffset,
    version: KafkaVersion,
    channel_buffer_size: usize,
    session_timeout: Duration,
    connect_timeout: Duration,
    client_id: String,
    callbacks: Callbacks,
    connector: Arc<dyn Connector>,
    running: Arc<AtomicBool>,
}

impl GroupConsumer {
    /// `assignor` is one of `sticky`, `round-robin` (or `roundrobin`) and
    /// `range`.
    pub fn new<B, T>(
        brokers: B,
        topics: T,
        group: impl Into<String>,
        assignor: &str,
    ) -> std::result::Result<Self, ConfigError>
    where
        B: IntoIterator,
        B::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        let brokers: Vec<String> = brokers.into_iter().map(Into::into).collect();
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let group = group.into();
        if brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if group.is_empty() {
            return Err(ConfigError::EmptyGroup);
        }

        Ok(Self {
            brokers,
            topics,
            group,
            assignor: assignor.parse()?,
            offset: StartOffset::Newest,
            version: KafkaVersion::parse(KafkaVersion::DEFAULT)?,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            callbacks: Callbacks::default(),
            connector: Arc::new(RdKafkaConnector),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn assignor(&self) -> Assignor {
        self.assignor
    }

    pub fn offset(&self) -> StartOffset {
        self.offset
    }

    pub fn version(&self) -> KafkaVersion {
        self.version
    }

    pub fn channel_buffer_size(&self) -> usize {
        self.channel_buffer_size
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether a consumption loop started by [`connect`](Self::connect) is
    /// still active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_offset(&mut self, offset: StartOffset) {
        self.offset = offset;
    }

    pub fn set_version(&mut self, version: &str) -> std::result::Result<(), ConfigError> {
        self.version = KafkaVersion::parse(version)?;
        Ok(())
    }

    /// Capacity of each claim's message channel. Zero is rejected by
    /// [`connect`](Self::connect).
    pub fn set_channel_buffer_size(&mut self, size: usize) {
        self.channel_buffer_size = size;
    }

    pub fn set_session_timeout(&mut self, timeout: Duration) {
        self.session_timeout = timeout;
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn set_client_id(&mut self, client_id: impl Into<String>) {
        self.client_id = client_id.into();
    }

    /// Called once per session, before any claim is delivered.
    pub fn set_setup_fn<F, Fut>(&mut self, f: F)
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.setup = Some(Callbacks::session_fn(f));
    }

    /// Called once per session after all claims have returned.
    pub fn set_cleanup_fn<F, Fut>(&mut self, f: F)
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.cleanup = Some(Callbacks::session_fn(f));
    }

    /// Called once per assigned partition per session. Must drain the claim
    /// until `recv` returns `None` or the session is done.
    pub fn set_consume_claim_fn<F, Fut>(&mut self, f: F)
    where
        F: Fn(Session, Claim) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.callbacks.consume_claim = Some(Callbacks::claim_fn(f));
    }

    /// Use `connector` instead of the rdkafka client.
    pub fn set_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connector = connector;
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.set_connector(connector);
        self
    }

    /// Snapshot of the current settings.
    pub fn config(&self) -> GroupConfig {
        GroupConfig {
            brokers: self.brokers.clone(),
            group: self.group.clone(),
            topics: self.topics.clone(),
            assignor: self.assignor,
            offset: self.offset,
            version: self.version,
            channel_buffer_size: self.channel_buffer_size,
            session_timeout: self.session_timeout,
            connect_timeout: self.connect_timeout,
            client_id: self.client_id.clone(),
        }
    }

    /// Connect to the group and start consuming on a background task.
    ///
    /// Returns once the first session has been set up. If the loop stops
    /// before that, the client is closed and the failure is returned.
    pub async fn connect(&self) -> Result<Shutdown> {
        let config = self.config();
        config.validate()?;

        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        // Clears the flag if connecting fails or this future is dropped
        // before a `Shutdown` owns it.
        let guard = RunningGuard(Some(self.running.as_ref()));

        let client = self.connector.connect(&config).await?;
        debug!("consumer group client for {} created", config.group);

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handler = Arc::new(ReadyHandler {
            callbacks: self.callbacks.clone(),
            ready: Mutex::new(Some(ready_tx)),
        });
        let span = info_span!("group_consumer", group = %config.group);
        let worker = tokio::spawn(
            run_worker(
                Arc::clone(&client),
                config.topics.clone(),
                handler,
                cancel.clone(),
            )
            .instrument(span),
        );

        let mut shutdown = Shutdown {
            cancel,
            worker: Some(worker),
            client,
            running: Arc::clone(&self.running),
            group: config.group.clone(),
        };
        guard.disarm();

        let reason = match ready_rx.await {
            Ok(Ok(())) => {
                info!("kafka consumer group {} set up and running", config.group);
                return Ok(shutdown);
            }
            Ok(Err(reason)) => reason,
            Err(_) => "consumer loop exited".to_string(),
        };

        shutdown.stop().await;
        Err(Error::NotReady(reason))
    }
}

impl std::fmt::Debug for GroupConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConsumer")
            .field("brokers", &self.brokers)
            .field("topics", &self.topics)
            .field("group", &self.group)
            .field("assignor", &self.assignor)
            .field("offset", &self.offset)
            .field("version", &self.version)
            .field("channel_buffer_size", &self.channel_buffer_size)
            .field("callbacks", &self.callbacks)
            .field("running", &self.is_running())
            .finish()
    }
}

struct RunningGuard<'a>(Option<&'a AtomicBool>);

impl RunningGuard<'_> {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(running) = self.0 {
            running.store(false, Ordering::Release);
        }
    }
}

type Readiness = oneshot::Sender<std::result::Result<(), String>>;

/// Wraps the user callbacks, logging each step and signalling readiness
/// after the first successful setup.
struct ReadyHandler {
    callbacks: Callbacks,
    ready: Mutex<Option<Readiness>>,
}

impl ReadyHandler {
    fn signal(&self, outcome: std::result::Result<(), String>) {
        let sender = match self.ready.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

#[async_trait]
impl ConsumerGroupHandler for ReadyHandler {
    async fn setup(&self, session: &Session) -> anyhow::Result<()> {
        debug!("setup");
        self.callbacks.setup(session).await?;
        self.signal(Ok(()));
        Ok(())
    }

    async fn cleanup(&self, session: &Session) -> anyhow::Result<()> {
        debug!("cleanup");
        self.callbacks.cleanup(session).await
    }

    async fn consume_claim(&self, session: Session, claim: Claim) -> anyhow::Result<()> {
        debug!("consume claim");
        self.callbacks.consume_claim(session, claim).await
    }
}

async fn run_worker(
    client: Arc<dyn GroupClient>,
    topics: Vec<String>,
    handler: Arc<ReadyHandler>,
    cancel: CancellationToken,
) {
    loop {
        let session_handler: Arc<dyn ConsumerGroupHandler> = handler.clone();
        if let Err(e) = client.consume(&topics, session_handler, cancel.clone()).await {
            error!("Error from consumer: {e}");
            handler.signal(Err(e.to_string()));
            cancel.cancel();
            return;
        }
        if cancel.is_cancelled() {
            debug!("cancel connect: consumer loop cancelled");
            return;
        }
        info!("consumer group session ended, rejoining");
        tokio::task::yield_now().await;
    }
}

/// Stops a running [`GroupConsumer`] loop.
///
/// [`shutdown`](Shutdown::shutdown) waits for the loop to exit and then
/// closes the client. Dropping the handle instead cancels the loop and closes
/// the client in the background.
#[must_use = "dropping the handle stops the consumer group"]
pub struct Shutdown {
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    client: Arc<dyn GroupClient>,
    running: Arc<AtomicBool>,
    group: String,
}

impl Shutdown {
    pub async fn shutdown(mut self) {
        info!("kafka close");
        self.stop().await;
    }

    /// Whether the consumption loop has exited, by cancellation or error.
    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Some(worker) => worker.is_finished(),
            None => true,
        }
    }

    /// Token cancelled when the loop stops, whether by shutdown or because
    /// the client failed. Cancelling it stops the loop but does not close the
    /// client; call [`shutdown`](Shutdown::shutdown) for that.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("consumer group {} loop panicked: {e}", self.group);
            }
            close_client(self.client.as_ref(), &self.group).await;
            self.running.store(false, Ordering::Release);
        }
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.cancel.cancel();
        let client = Arc::clone(&self.client);
        let running = Arc::clone(&self.running);
        let group = std::mem::take(&mut self.group);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = worker.await;
                    close_client(client.as_ref(), &group).await;
                    running.store(false, Ordering::Release);
                });
            }
            Err(_) => {
                warn!("shutdown handle for {group} dropped outside a runtime; client not closed");
                worker.abort();
                running.store(false, Ordering::Release);
            }
        }
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("group", &self.group)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn close_client(client: &dyn GroupClient, group: &str) {
    if let Err(e) = client.close().await {
        error!("Error closing client for {group}: {e}");
    }
}
