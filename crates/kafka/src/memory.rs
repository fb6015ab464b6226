//! In-process broker implementing the group protocol.
//!
//! [`MemoryBroker`] keeps topics, group membership, generations and committed
//! offsets in memory and assigns partitions with [`Assignor::assign`]. It
//! plugs into [`GroupConsumer`](crate::GroupConsumer) as a [`Connector`], so
//! a consumer group can run without a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignor::{Assignment, Assignor};
use crate::client::{Connector, GroupClient};
use crate::config::{GroupConfig, StartOffset};
use crate::error::{Error, Result};
use crate::handler::ConsumerGroupHandler;
use crate::message::Message;
use crate::session::{Claim, OffsetCommitter, Session};

#[derive(Debug, Clone)]
struct Record {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct Member {
    topics: BTreeSet<String>,
    session: Option<CancellationToken>,
}

#[derive(Debug, Default)]
struct GroupState {
    generation: i32,
    members: BTreeMap<String, Member>,
    assignment: Assignment,
    committed: BTreeMap<(String, i32), i64>,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    fail_next_consume: Option<String>,
    topics: BTreeMap<String, Vec<Vec<Record>>>,
    groups: BTreeMap<String, GroupState>,
    joins: usize,
    closes: usize,
}

impl BrokerState {
    fn partition_counts(&self) -> BTreeMap<String, i32> {
        self.topics
            .iter()
            .map(|(topic, partitions)| (topic.clone(), partitions.len() as i32))
            .collect()
    }

    /// Recompute the group's assignment and end every running session so
    /// members pick up the new generation.
    fn rebalance(&mut self, group: &str, assignor: Assignor) {
        let partitions = self.partition_counts();
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        let subscriptions: BTreeMap<String, BTreeSet<String>> = state
            .members
            .iter()
            .map(|(id, member)| (id.clone(), member.topics.clone()))
            .collect();
        state.assignment = assignor.assign(&subscriptions, &partitions, &state.assignment);
        state.generation += 1;
        for member in state.members.values_mut() {
            if let Some(session) = member.session.take() {
                session.cancel();
            }
        }
        debug!(
            "group {group} rebalanced to generation {} with {} members",
            state.generation,
            state.members.len()
        );
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    changed: watch::Sender<u64>,
    next_member: AtomicU64,
}

/// Cloneable handle to an in-memory broker; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    reachable: true,
                    fail_next_consume: None,
                    topics: BTreeMap::new(),
                    groups: BTreeMap::new(),
                    joins: 0,
                    closes: 0,
                }),
                changed,
                next_member: AtomicU64::new(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.shared.changed.send_modify(|version| *version += 1);
    }

    /// Create `topic` with `partitions` partitions. Existing topics keep
    /// their data but may grow.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state();
        let entry = state.topics.entry(topic.to_string()).or_default();
        while (entry.len() as i32) < partitions {
            entry.push(Vec::new());
        }
    }

    /// Append a record and return its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        self.produce_with_key(topic, partition, None, payload)
    }

    pub fn produce_with_key(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<i64> {
        let offset = {
            let mut state = self.state();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(usize::try_from(partition).ok()?))
                .ok_or_else(|| {
                    Error::Consumer(format!("unknown topic partition {topic}/{partition}"))
                })?;
            log.push(Record {
                key,
                payload: payload.into(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            });
            log.len() as i64 - 1
        };
        self.notify();
        Ok(offset)
    }

    /// Make `connect` (and subsequent `consume` calls) fail while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Fail the next `consume` call of any client with `reason`.
    pub fn fail_next_consume(&self, reason: impl Into<String>) {
        self.state().fail_next_consume = Some(reason.into());
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .groups
            .get(group)?
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Offset the next produced record of the partition will get.
    pub fn high_water_mark(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = self.state();
        let log = state.topics.get(topic)?.get(usize::try_from(partition).ok()?)?;
        Some(log.len() as i64)
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.state()
            .groups
            .get(group)
            .map_or(0, |state| state.members.len())
    }

    pub fn generation(&self, group: &str) -> i32 {
        self.state()
            .groups
            .get(group)
            .map_or(0, |state| state.generation)
    }

    /// Current assignment of the group's members.
    pub fn assignment(&self, group: &str) -> Assignment {
        self.state()
            .groups
            .get(group)
            .map(|state| state.assignment.clone())
            .unwrap_or_default()
    }

    /// Number of sessions started across all groups.
    pub fn join_count(&self) -> usize {
        self.state().joins
    }

    /// Number of clients closed.
    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    fn read(&self, topic: &str, partition: i32, offset: i64) -> (Option<Message>, i64) {
        let state = self.state();
        let Some(log) = state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(usize::try_from(partition).ok()?))
        else {
            return (None, 0);
        };
        let high_water_mark = log.len() as i64;
        let message = usize::try_from(offset)
            .ok()
            .and_then(|index| log.get(index))
            .map(|record| Message {
                topic: topic.to_string(),
                partition,
                offset,
                key: record.key.clone(),
                payload: Some(record.payload.clone()),
                timestamp: Some(record.timestamp),
                headers: Vec::new(),
            });
        (message, high_water_mark)
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryBroker")
            .field("topics", &state.partition_counts())
            .field("groups", &state.groups.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, config: &GroupConfig) -> Result<Arc<dyn GroupClient>> {
        if !self.state().reachable {
            return Err(Error::Connect(format!(
                "client has run out of available brokers to talk to: {}",
                config.bootstrap_servers()
            )));
        }
        let n = self.shared.next_member.fetch_add(1, Ordering::Relaxed);
        let member_id = format!("{}-{n}", config.client_id);
        debug!("memory client {member_id} connected for group {}", config.group);
        Ok(Arc::new(MemoryClient {
            broker: self.clone(),
            member_id,
            group: config.group.clone(),
            assignor: config.assignor,
            offset: config.offset,
            channel_buffer_size: config.channel_buffer_size,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    broker: MemoryBroker,
    member_id: String,
    group: String,
    assignor: Assignor,
    offset: StartOffset,
    channel_buffer_size: usize,
    closed: AtomicBool,
}

/// What a member needs to run one session.
struct Joined {
    generation: i32,
    claims: Vec<(String, i32, i64)>,
}

impl MemoryClient {
    fn join(&self, topics: &[String], session: &CancellationToken) -> Result<Joined> {
        let mut state = self.broker.state();
        if !state.reachable {
            return Err(Error::Consumer("broker unreachable".to_string()));
        }
        if let Some(reason) = state.fail_next_consume.take() {
            return Err(Error::Consumer(reason));
        }

        let wanted: BTreeSet<String> = topics.iter().cloned().collect();
        let group = state.groups.entry(self.group.clone()).or_default();
        let needs_rebalance = match group.members.get(&self.member_id) {
            Some(member) => member.topics != wanted,
            None => true,
        };
        if needs_rebalance {
            group.members.entry(self.member_id.clone()).or_default().topics = wanted;
            state.rebalance(&self.group, self.assignor);
        }
        state.joins += 1;

        let logs: BTreeMap<(String, i32), i64> = state
            .topics
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .iter()
                    .enumerate()
                    .map(move |(p, log)| ((topic.clone(), p as i32), log.len() as i64))
            })
            .collect();

        let group = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| Error::Consumer(format!("group {} vanished", self.group)))?;
        if let Some(member) = group.members.get_mut(&self.member_id) {
            member.session = Some(session.clone());
        }
        let owned = group
            .assignment
            .get(&self.member_id)
            .cloned()
            .unwrap_or_default();
        let claims = owned
            .into_iter()
            .map(|(topic, partition)| {
                let key = (topic.clone(), partition);
                let start = match group.committed.get(&key) {
                    Some(&committed) => committed,
                    None => match self.offset {
                        StartOffset::Earliest => 0,
                        StartOffset::Newest => logs.get(&key).copied().unwrap_or(0),
                    },
                };
                (topic, partition, start)
            })
            .collect();

        Ok(Joined {
            generation: group.generation,
            claims,
        })
    }

    fn end_session(&self, session: &CancellationToken) {
        session.cancel();
        let mut state = self.broker.state();
        if let Some(member) = state
            .groups
            .get_mut(&self.group)
            .and_then(|group| group.members.get_mut(&self.member_id))
        {
            member.session = None;
        }
    }
}

#[async_trait]
impl GroupClient for MemoryClient {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let token = cancel.child_token();
        let joined = self.join(topics, &token)?;

        let mut claimed: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        for (topic, partition, _) in &joined.claims {
            claimed.entry(topic.clone()).or_default().push(*partition);
        }
        let committer = Arc::new(MemoryCommitter {
            broker: self.broker.clone(),
            group: self.group.clone(),
            marks: Mutex::new(BTreeMap::new()),
        });
        let session = Session::new(
            self.member_id.clone(),
            joined.generation,
            claimed,
            token.clone(),
            committer.clone(),
        );
        info!(
            "member {} joined group {} at generation {} with {} claims",
            self.member_id,
            self.group,
            joined.generation,
            joined.claims.len()
        );

        if let Err(e) = handler.setup(&session).await {
            self.end_session(&token);
            return Err(Error::Handler(e));
        }

        let mut pumps = JoinSet::new();
        let mut claims = JoinSet::new();
        for (topic, partition, start) in joined.claims {
            let (tx, rx) = mpsc::channel(self.channel_buffer_size);
            let high_water_mark = Arc::new(AtomicI64::new(start));
            pumps.spawn(pump(
                self.broker.clone(),
                topic.clone(),
                partition,
                start,
                Arc::clone(&high_water_mark),
                tx,
                token.clone(),
            ));
            let claim = Claim::new(topic.clone(), partition, start, high_water_mark, rx);
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

        if claims.is_empty() {
            token.cancelled().await;
        }
        while let Some(outcome) = claims.join_next().await {
            match outcome {
                Ok((_, _, Ok(()))) => {}
                Ok((topic, partition, Err(e))) => {
                    error!("consume claim {topic}/{partition} failed: {e:#}");
                }
                Err(e) => error!("consume claim task failed: {e}"),
            }
        }
        self.end_session(&token);
        while pumps.join_next().await.is_some() {}

        let cleanup = handler.cleanup(&session).await;
        if let Err(e) = committer.commit() {
            warn!("commit for group {} failed: {e}", self.group);
        }
        cleanup.map_err(Error::Handler)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        let mut state = self.broker.state();
        state.closes += 1;
        let left = state
            .groups
            .get_mut(&self.group)
            .and_then(|group| group.members.remove(&self.member_id))
            .is_some();
        if left {
            state.rebalance(&self.group, self.assignor);
        }
        debug!("memory client {} closed", self.member_id);
        Ok(())
    }
}

async fn pump(
    broker: MemoryBroker,
    topic: String,
    partition: i32,
    mut offset: i64,
    high_water_mark: Arc<AtomicI64>,
    tx: mpsc::Sender<Message>,
    session: CancellationToken,
) {
    let mut changed = broker.shared.changed.subscribe();
    loop {
        let (message, hwm) = broker.read(&topic, partition, offset);
        high_water_mark.store(hwm, Ordering::Release);
        match message {
            Some(message) => {
                tokio::select! {
                    _ = session.cancelled() => return,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                offset += 1;
            }
            None => {
                tokio::select! {
                    _ = session.cancelled() => return,
                    res = changed.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

struct MemoryCommitter {
    broker: MemoryBroker,
    group: String,
    marks: Mutex<BTreeMap<(String, i32), i64>>,
}

impl OffsetCommitter for MemoryCommitter {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let mark = marks.entry((topic.to_string(), partition)).or_insert(offset);
        // Marks only move forward.
        if offset > *mark {
            *mark = offset;
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let marks = self
            .marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut state = self.broker.state();
        let group = state.groups.entry(self.group.clone()).or_default();
        for (key, offset) in marks {
            let committed = group.committed.entry(key).or_insert(offset);
            if offset > *committed {
                *committed = offset;
            }
        }
        Ok(())
    }
}
