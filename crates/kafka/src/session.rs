//! Per-join session state handed to the handler callbacks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::Message;

/// Backend hook for offset bookkeeping within a session.
pub trait OffsetCommitter: Send + Sync {
    /// Record `offset` as the next offset to read for the partition.
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Push marked offsets to the coordinator now.
    fn commit(&self) -> Result<()>;
}

/// One stable partition assignment.
///
/// Cloning is cheap; every clone observes the same cancellation.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    member_id: String,
    generation_id: i32,
    claims: BTreeMap<String, Vec<i32>>,
    cancel: CancellationToken,
    committer: Arc<dyn OffsetCommitter>,
}

impl Session {
    pub fn new(
        member_id: impl Into<String>,
        generation_id: i32,
        claims: BTreeMap<String, Vec<i32>>,
        cancel: CancellationToken,
        committer: Arc<dyn OffsetCommitter>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                member_id: member_id.into(),
                generation_id,
                claims,
                cancel,
                committer,
            }),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.inner.member_id
    }

    pub fn generation_id(&self) -> i32 {
        self.inner.generation_id
    }

    /// Topic to partitions assigned in this session.
    pub fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.inner.claims
    }

    /// Resolves once the session ends (rebalance, shutdown or error).
    pub async fn done(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Mark `message` as processed; the committed offset becomes
    /// `message.offset + 1`.
    pub fn mark_message(&self, message: &Message) -> Result<()> {
        self.mark_offset(&message.topic, message.partition, message.offset + 1)
    }

    pub fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.inner.committer.mark_offset(topic, partition, offset)
    }

    pub fn commit(&self) -> Result<()> {
        self.inner.committer.commit()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("member_id", &self.inner.member_id)
            .field("generation_id", &self.inner.generation_id)
            .field("claims", &self.inner.claims)
            .finish()
    }
}

/// Messages of one partition for the duration of a session.
#[derive(Debug)]
pub struct Claim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    high_water_mark: Arc<AtomicI64>,
    messages: mpsc::Receiver<Message>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        high_water_mark: Arc<AtomicI64>,
        messages: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            high_water_mark,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the claim started from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Offset the next produced message will get, as last seen.
    pub fn high_water_mark(&self) -> i64 {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Next message, or `None` once the session has ended and the buffered
    /// messages are drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }
}
