//! rdkafka-backed group client.
//!
//! Each `consume` call waits for the group's next assignment (which may be
//! empty), splits one queue per assigned partition and pumps it into that
//! partition's claim. Messages fetched onto the main queue before the split
//! are drained first and delivered ahead of the partition queue. The main
//! queue keeps being polled so rebalance events are served; a new assignment
//! or a change in the assigned set ends the session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    CommitMode, Consumer as RdkafkaConsumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message as RdkafkaMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Connector, GroupClient};
use crate::config::{GroupConfig, StartOffset};
use crate::error::{Error, Result};
use crate::handler::ConsumerGroupHandler;
use crate::message::Message;
use crate::session::{Claim, OffsetCommitter, Session};

/// How long a single poll of the main queue may block.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for more leftovers when draining the main queue.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// librdkafka refuses connection setup timeouts below one second.
const MIN_CONNECT_TIMEOUT_MS: u128 = 1000;

type GroupStreamConsumer = StreamConsumer<TracingContext>;

/// Routes librdkafka's own logs and errors into `tracing`, and counts the
/// assignments the group coordinator hands this member.
#[derive(Debug, Default)]
pub struct TracingContext {
    assignments: AtomicU64,
}

impl TracingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assignments received so far, empty ones included.
    pub fn assignments(&self) -> u64 {
        self.assignments.load(Ordering::Acquire)
    }
}

impl ClientContext for TracingContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(target: "librdkafka", "{fac}: {log_message}"),
            RDKafkaLogLevel::Warning => warn!(target: "librdkafka", "{fac}: {log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", "{fac}: {log_message}")
            }
            RDKafkaLogLevel::Debug => debug!(target: "librdkafka", "{fac}: {log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "librdkafka", "{error}: {reason}");
    }
}

impl ConsumerContext for TracingContext {
    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                debug!("assigned {} partitions", tpl.count());
                self.assignments.fetch_add(1, Ordering::AcqRel);
            }
            Rebalance::Revoke(tpl) => debug!("revoked {} partitions", tpl.count()),
            Rebalance::Error(e) => error!("rebalance failed: {e}"),
        }
    }
}

/// Map a group configuration onto librdkafka properties.
pub fn client_config(config: &GroupConfig) -> ClientConfig {
    let connect_timeout_ms = config
        .connect_timeout
        .as_millis()
        .max(MIN_CONNECT_TIMEOUT_MS);
    // Brokers before 0.10 cannot answer ApiVersion requests.
    let api_version_request = config.version.major() > 0 || config.version.minor() >= 10;

    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.group)
        .set("client.id", &config.client_id)
        .set(
            "partition.assignment.strategy",
            config.assignor.rdkafka_strategy(),
        )
        .set("auto.offset.reset", config.offset.auto_offset_reset())
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        )
        .set(
            "socket.connection.setup.timeout.ms",
            connect_timeout_ms.to_string(),
        )
        .set("api.version.request", api_version_request.to_string())
        .set("broker.version.fallback", config.version.to_string())
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false");
    client_config
}

/// Opens rdkafka consumers. The default connector of
/// [`GroupConsumer`](crate::GroupConsumer).
#[derive(Debug, Clone, Copy, Default)]
pub struct RdKafkaConnector;

#[async_trait]
impl Connector for RdKafkaConnector {
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn GroupClient>> {
        let consumer: GroupStreamConsumer = client_config(config)
            .create_with_context(TracingContext::new())
            .map_err(|e| Error::Connect(format!("Failed to create consumer: {e}")))?;
        let consumer = Arc::new(consumer);

        // Creating a consumer never touches the network; ask for metadata so
        // unreachable brokers fail here.
        let client = Arc::clone(&consumer);
        let timeout = config.connect_timeout;
        tokio::task::spawn_blocking(move || client.fetch_metadata(None, timeout).map(|_| ()))
            .await
            .map_err(|e| Error::Connect(format!("metadata request task failed: {e}")))?
            .map_err(|e| {
                Error::Connect(format!(
                    "brokers {} unreachable: {e}",
                    config.bootstrap_servers()
                ))
            })?;
        info!("connected to {}", config.bootstrap_servers());

        Ok(Arc::new(RdKafkaClient {
            consumer,
            member_id: config.client_id.clone(),
            start_offset: config.offset,
            channel_buffer_size: config.channel_buffer_size,
            subscription: Mutex::new(None),
            sessions: AtomicI32::new(0),
            joined: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

struct RdKafkaClient {
    consumer: Arc<GroupStreamConsumer>,
    member_id: String,
    start_offset: StartOffset,
    channel_buffer_size: usize,
    subscription: Mutex<Option<Vec<String>>>,
    sessions: AtomicI32,
    /// Assignment count the last session started from.
    joined: AtomicU64,
    closed: AtomicBool,
}

type Partition = (String, i32);

impl RdKafkaClient {
    fn ensure_subscribed(&self, topics: &[String]) -> Result<()> {
        let mut current = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_deref() == Some(topics) {
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| Error::Consumer(format!("Failed to subscribe to topics: {e}")))?;
        debug!("subscribed to {names:?}");
        *current = Some(topics.to_vec());
        Ok(())
    }

    fn assigned(&self) -> Result<BTreeSet<Partition>> {
        let tpl = self.consumer.assignment()?;
        Ok(tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect())
    }

    /// Current fetch position of a partition, or the start offset sentinel
    /// when nothing has been fetched yet.
    fn position(&self, topic: &str, partition: i32) -> i64 {
        self.consumer
            .position()
            .ok()
            .and_then(|tpl| {
                tpl.find_partition(topic, partition)
                    .and_then(|e| e.offset().to_raw())
            })
            .filter(|offset| *offset >= 0)
            .unwrap_or_else(|| self.start_offset.as_raw())
    }

    /// Poll the main queue for up to one interval. Messages arriving there
    /// belong to partitions whose queue has not been split yet.
    async fn poll_main_queue(&self) -> Result<Option<Message>> {
        match tokio::time::timeout(POLL_INTERVAL, self.consumer.recv()).await {
            Ok(Ok(msg)) => Ok(Some(owned_message(&msg))),
            Ok(Err(e)) => Err(Error::Kafka(e)),
            Err(_) => Ok(None),
        }
    }

    fn assignments(&self) -> u64 {
        self.consumer.context().assignments()
    }

    /// Wait for the next assignment, which is empty when the group has more
    /// members than partitions. Returns `None` if `cancel` fires first.
    async fn await_assignment(
        &self,
        cancel: &CancellationToken,
        pending: &mut BTreeMap<Partition, Vec<Message>>,
    ) -> Result<Option<(u64, BTreeSet<Partition>)>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let assignments = self.assignments();
            if assignments != self.joined.load(Ordering::Acquire) {
                self.joined.store(assignments, Ordering::Release);
                return Ok(Some((assignments, self.assigned()?)));
            }
            if let Some(message) = self.poll_main_queue().await? {
                buffer(pending, message);
            }
        }
    }

    /// Move whatever is left on the main queue into `pending`. Called after
    /// the partition queues are split, so nothing new lands there for them.
    async fn drain_main_queue(
        &self,
        pending: &mut BTreeMap<Partition, Vec<Message>>,
    ) -> Result<()> {
        while let Ok(received) = tokio::time::timeout(DRAIN_INTERVAL, self.consumer.recv()).await {
            let message = received?;
            buffer(pending, owned_message(&message));
        }
        Ok(())
    }
}

fn buffer(pending: &mut BTreeMap<Partition, Vec<Message>>, message: Message) {
    pending
        .entry((message.topic.clone(), message.partition))
        .or_default()
        .push(message);
}

#[async_trait]
impl GroupClient for RdKafkaClient {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.ensure_subscribed(topics)?;

        let mut pending = BTreeMap::new();
        let Some((joined, assigned)) = self.await_assignment(&cancel, &mut pending).await? else {
            return Ok(());
        };

        let generation = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;
        let mut claimed: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for (topic, partition) in &assigned {
            claimed.entry(topic.clone()).or_default().push(*partition);
        }
        let token = cancel.child_token();
        let committer = Arc::new(RdKafkaCommitter {
            consumer: Arc::clone(&self.consumer),
        });
        let session = Session::new(
            self.member_id.clone(),
            generation,
            claimed,
            token.clone(),
            committer.clone(),
        );
        info!(
            "session {generation} started with {} partitions",
            assigned.len()
        );

        if let Err(e) = handler.setup(&session).await {
            token.cancel();
            return Err(Error::Handler(e));
        }

        let mut queues = Vec::with_capacity(assigned.len());
        for (topic, partition) in &assigned {
            match self.consumer.split_partition_queue(topic, *partition) {
                Some(queue) => queues.push((topic.clone(), *partition, queue)),
                None => warn!("no queue for {topic}/{partition}; skipping claim"),
            }
        }
        if !queues.is_empty() {
            if let Err(e) = self.drain_main_queue(&mut pending).await {
                token.cancel();
                return Err(e);
            }
        }

        let mut senders = BTreeMap::new();
        let mut pumps = JoinSet::new();
        let mut claims = JoinSet::new();
        for (topic, partition, queue) in queues {
            let (tx, rx) = mpsc::channel(self.channel_buffer_size);
            let buffered = pending
                .remove(&(topic.clone(), partition))
                .unwrap_or_default();
            let initial_offset = match buffered.first() {
                Some(message) => message.offset,
                None => self.position(&topic, partition),
            };
            let high_water_mark = Arc::new(AtomicI64::new(initial_offset));
            senders.insert((topic.clone(), partition), tx.clone());
            pumps.spawn(pump_partition(
                queue,
                buffered,
                tx,
                Arc::clone(&high_water_mark),
                token.clone(),
            ));

            let claim = Claim::new(
                topic.clone(),
                partition,
                initial_offset,
                high_water_mark,
                rx,
            );
            let handler = Arc::clone(&handler);
            let session = session.clone();
            let token = token.clone();
            claims.spawn(async move {
                let result = handler.consume_claim(session, claim).await;
                // The first claim to return ends the session.
                token.cancel();
                (topic, partition, result)
            });
        }

        let mut failure = None;
        while !token.is_cancelled() {
            match self.poll_main_queue().await {
                Ok(Some(message)) => {
                    // Fetched during the drain window; may trail newer
                    // offsets from the partition queue.
                    if let Some(tx) = senders.get(&(message.topic.clone(), message.partition)) {
                        debug!(
                            "late main queue message {}/{}@{}",
                            message.topic, message.partition, message.offset
                        );
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tx.send(message) => {}
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            if self.assignments() != joined {
                info!("new assignment, ending session {generation}");
                break;
            }
            match self.assigned() {
                Ok(now) if now != assigned => {
                    info!("assignment changed, ending session {generation}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        token.cancel();
        drop(senders);

        while let Some(outcome) = claims.join_next().await {
            match outcome {
                Ok((_, _, Ok(()))) => {}
                Ok((topic, partition, Err(e))) => {
                    error!("consume claim {topic}/{partition} failed: {e:#}");
                }
                Err(e) => error!("consume claim task failed: {e}"),
            }
        }
        while pumps.join_next().await.is_some() {}

        let cleanup = handler.cleanup(&session).await;
        if let Err(e) = committer.commit() {
            debug!("commit at end of session {generation}: {e}");
        }
        if let Some(e) = failure {
            return Err(e);
        }
        cleanup.map_err(Error::Handler)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.consumer.unsubscribe();
        debug!("consumer {} unsubscribed", self.member_id);
        Ok(())
    }
}

async fn pump_partition(
    queue: StreamPartitionQueue<TracingContext>,
    buffered: Vec<Message>,
    tx: mpsc::Sender<Message>,
    high_water_mark: Arc<AtomicI64>,
    session: CancellationToken,
) {
    for message in buffered {
        high_water_mark.fetch_max(message.offset + 1, Ordering::AcqRel);
        tokio::select! {
            _ = session.cancelled() => return,
            sent = tx.send(message) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
    loop {
        let message = tokio::select! {
            _ = session.cancelled() => return,
            received = queue.recv() => match received {
                Ok(msg) => owned_message(&msg),
                Err(e) => {
                    error!("partition queue error: {e}");
                    session.cancel();
                    return;
                }
            },
        };
        high_water_mark.fetch_max(message.offset + 1, Ordering::AcqRel);
        tokio::select! {
            _ = session.cancelled() => return,
            sent = tx.send(message) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

struct RdKafkaCommitter {
    consumer: Arc<GroupStreamConsumer>,
}

impl OffsetCommitter for RdKafkaCommitter {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        self.consumer.store_offsets(&tpl)?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.consumer.commit_consumer_state(CommitMode::Sync)?;
        Ok(())
    }
}

fn owned_message<M: RdkafkaMessage>(msg: &M) -> Message {
    let headers = msg
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h.value.map(<[u8]>::to_vec).unwrap_or_default();
                    (h.key.to_string(), value)
                })
                .collect()
        })
        .unwrap_or_default();
    Message {
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(|k| k.to_vec()),
        payload: msg.payload().map(|p| p.to_vec()),
        timestamp: msg.timestamp().to_millis(),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GroupConsumer;

    #[test]
    fn test_client_config_mapping() {
        let mut consumer =
            GroupConsumer::new(["a:9092", "b:9092"], ["orders"], "billing", "sticky").unwrap();
        consumer.set_offset(crate::StartOffset::Earliest);
        let config = client_config(&consumer.config());

        assert_eq!(config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(config.get("group.id"), Some("billing"));
        assert_eq!(
            config.get("partition.assignment.strategy"),
            Some("cooperative-sticky")
        );
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("api.version.request"), Some("true"));
        assert_eq!(config.get("broker.version.fallback"), Some("3.7.0"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_empty_assignment_counts_as_join() {
        let context = TracingContext::new();
        let mut tpl = TopicPartitionList::new();
        context.post_rebalance(&Rebalance::Revoke(&tpl));
        assert_eq!(context.assignments(), 0);

        context.post_rebalance(&Rebalance::Assign(&tpl));
        assert_eq!(context.assignments(), 1);

        tpl.add_partition("orders", 0);
        context.post_rebalance(&Rebalance::Assign(&tpl));
        assert_eq!(context.assignments(), 2);
    }

    #[test]
    fn test_client_config_old_broker() {
        let mut consumer = GroupConsumer::new(["a:9092"], ["t"], "g", "range").unwrap();
        consumer.set_version("0.9.0.1").unwrap();
        consumer.set_connect_timeout(Duration::from_millis(10));
        let config = client_config(&consumer.config());
        assert_eq!(config.get("api.version.request"), Some("false"));
        assert_eq!(config.get("partition.assignment.strategy"), Some("range"));
        assert_eq!(
            config.get("socket.connection.setup.timeout.ms"),
            Some("1000")
        );
    }
}
