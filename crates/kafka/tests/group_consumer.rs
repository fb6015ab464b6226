//! GroupConsumer life-cycle tests against the in-memory broker.
//!
//! Covers readiness, claim delivery, offset commits, shutdown, failure
//! reporting and rebalancing between two members of one group.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};
use utilkit_kafka::{
    ConfigError, Connector, Error, GroupClient, GroupConfig, GroupConsumer, MemoryBroker,
    Message, StartOffset,
};

const WAIT: Duration = Duration::from_secs(5);
const GROUP: &str = "billing";
const TOPIC: &str = "orders";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("utilkit_kafka=debug")
        .try_init()
        .ok();
}

fn broker(partitions: i32) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, partitions);
    broker
}

fn consumer(broker: &MemoryBroker, assignor: &str) -> GroupConsumer {
    GroupConsumer::new(["memory:9092"], [TOPIC], GROUP, assignor)
        .unwrap()
        .with_connector(Arc::new(broker.clone()))
}

/// (generation, partition) of every claim handed out.
type Claims = Arc<Mutex<Vec<(i32, i32)>>>;

/// Install a claim callback that records the claim and drains it, marking
/// every message.
fn drain_claims(consumer: &mut GroupConsumer) -> (Claims, Arc<Mutex<Vec<Message>>>) {
    let claims: Claims = Arc::default();
    let received: Arc<Mutex<Vec<Message>>> = Arc::default();
    let (c, r) = (Arc::clone(&claims), Arc::clone(&received));
    consumer.set_consume_claim_fn(move |session, mut claim| {
        let claims = Arc::clone(&c);
        let received = Arc::clone(&r);
        async move {
            claims
                .lock()
                .unwrap()
                .push((session.generation_id(), claim.partition()));
            while let Some(message) = claim.recv().await {
                session.mark_message(&message)?;
                received.lock().unwrap().push(message);
            }
            Ok(())
        }
    });
    (claims, received)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_connect_returns_after_first_join() {
    init_tracing();
    let broker = broker(2);
    let mut consumer = consumer(&broker, "range");
    let setups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&setups);
    consumer.set_setup_fn(move |_session| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    drain_claims(&mut consumer);

    let shutdown = assert_ok!(consumer.connect().await);
    assert!(setups.load(Ordering::SeqCst) >= 1);
    assert!(broker.join_count() >= 1);
    assert_eq!(broker.member_count(GROUP), 1);
    assert!(consumer.is_running());
    assert!(!shutdown.is_finished());

    timeout(WAIT, shutdown.shutdown()).await.unwrap();
    assert_eq!(broker.close_count(), 1);
    assert_eq!(broker.member_count(GROUP), 0);
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_default_callbacks_hold_the_session() {
    init_tracing();
    let broker = broker(2);
    let consumer = consumer(&broker, "range");

    let shutdown = consumer.connect().await.unwrap();
    let joins = broker.join_count();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.join_count(), joins);
    assert!(!shutdown.is_finished());

    timeout(WAIT, shutdown.shutdown()).await.unwrap();
    assert_eq!(broker.close_count(), 1);
}

/// Never finishes connecting.
struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _config: &GroupConfig) -> utilkit_kafka::Result<Arc<dyn GroupClient>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_abandoned_connect_does_not_block_the_next() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    consumer.set_connector(Arc::new(StalledConnector));

    assert_err!(timeout(Duration::from_millis(50), consumer.connect()).await);
    assert!(!consumer.is_running());

    consumer.set_connector(Arc::new(broker.clone()));
    let shutdown = assert_ok!(consumer.connect().await);
    shutdown.shutdown().await;
    assert_eq!(broker.close_count(), 1);
}

#[tokio::test]
async fn test_claim_runs_once_per_partition() {
    init_tracing();
    let broker = broker(4);
    let mut consumer = consumer(&broker, "round-robin");
    let (claims, _) = drain_claims(&mut consumer);

    let shutdown = consumer.connect().await.unwrap();
    eventually("four claims", || claims.lock().unwrap().len() == 4).await;
    shutdown.shutdown().await;

    let claims = claims.lock().unwrap().clone();
    let mut per_generation: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
    for (generation, partition) in claims {
        per_generation.entry(generation).or_default().push(partition);
    }
    assert_eq!(per_generation.len(), 1);
    for partitions in per_generation.values_mut() {
        partitions.sort();
        assert_eq!(*partitions, vec![0, 1, 2, 3]);
    }
}

#[tokio::test]
async fn test_messages_are_delivered_and_committed() {
    init_tracing();
    let broker = broker(1);
    for i in 0..5 {
        broker.produce(TOPIC, 0, format!("early-{i}")).unwrap();
    }

    let mut consumer = consumer(&broker, "sticky");
    consumer.set_offset(StartOffset::Earliest);
    let (_, received) = drain_claims(&mut consumer);

    let shutdown = consumer.connect().await.unwrap();
    broker.produce(TOPIC, 0, "late").unwrap();
    eventually("six messages", || received.lock().unwrap().len() == 6).await;
    shutdown.shutdown().await;

    let received = received.lock().unwrap().clone();
    let offsets: Vec<i64> = received.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(received[0].payload_str(), Some("early-0"));
    assert_eq!(received[5].payload_str(), Some("late"));
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(6));
}

#[tokio::test]
async fn test_newest_offset_skips_existing_messages() {
    init_tracing();
    let broker = broker(1);
    broker.produce(TOPIC, 0, "old").unwrap();

    let mut consumer = consumer(&broker, "range");
    let (_, received) = drain_claims(&mut consumer);
    let shutdown = consumer.connect().await.unwrap();
    broker.produce(TOPIC, 0, "new").unwrap();
    eventually("one message", || !received.lock().unwrap().is_empty()).await;
    shutdown.shutdown().await;

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].offset, 1);
}

#[tokio::test]
async fn test_restart_resumes_from_committed_offset() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    consumer.set_offset(StartOffset::Earliest);
    let (_, received) = drain_claims(&mut consumer);

    broker.produce(TOPIC, 0, "a").unwrap();
    let shutdown = consumer.connect().await.unwrap();
    eventually("first message", || received.lock().unwrap().len() == 1).await;
    shutdown.shutdown().await;

    broker.produce(TOPIC, 0, "b").unwrap();
    let shutdown = consumer.connect().await.unwrap();
    eventually("second message", || received.lock().unwrap().len() == 2).await;
    shutdown.shutdown().await;

    let payloads: Vec<String> = received
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| m.payload_str().map(str::to_string))
        .collect();
    assert_eq!(payloads, vec!["a", "b"]);
}

#[tokio::test]
async fn test_unreachable_brokers_fail_connect() {
    init_tracing();
    let broker = broker(1);
    broker.set_reachable(false);
    let consumer = consumer(&broker, "range");

    let err = assert_err!(consumer.connect().await);
    assert!(matches!(err, Error::Connect(_)), "{err}");
    assert_eq!(broker.join_count(), 0);
    assert_eq!(broker.close_count(), 0);
    assert!(!consumer.is_running());
}

#[tokio::test]
async fn test_consume_failure_is_returned_from_connect() {
    init_tracing();
    let broker = broker(1);
    broker.fail_next_consume("coordinator not available");
    let mut consumer = consumer(&broker, "range");
    drain_claims(&mut consumer);

    let err = timeout(WAIT, consumer.connect()).await.unwrap().unwrap_err();
    match err {
        Error::NotReady(reason) => assert!(reason.contains("coordinator not available")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(broker.close_count(), 1);
    assert!(!consumer.is_running());

    // The failure was one-off; the consumer can connect again.
    let shutdown = consumer.connect().await.unwrap();
    shutdown.shutdown().await;
    assert_eq!(broker.close_count(), 2);
}

#[tokio::test]
async fn test_setup_error_is_returned_from_connect() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    consumer.set_setup_fn(|_session| async { Err(anyhow::anyhow!("schema not loaded")) });

    let err = timeout(WAIT, consumer.connect()).await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::NotReady(ref reason) if reason.contains("schema not loaded")),
        "{err}"
    );
    assert_eq!(broker.close_count(), 1);
}

#[tokio::test]
async fn test_second_connect_is_rejected_while_running() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    drain_claims(&mut consumer);

    let shutdown = consumer.connect().await.unwrap();
    assert!(matches!(
        consumer.connect().await,
        Err(Error::AlreadyRunning)
    ));
    shutdown.shutdown().await;

    let shutdown = consumer.connect().await.unwrap();
    shutdown.shutdown().await;
    assert_eq!(broker.close_count(), 2);
}

#[tokio::test]
async fn test_zero_buffer_is_rejected_before_connecting() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    consumer.set_channel_buffer_size(0);

    let err = consumer.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::ZeroChannelBufferSize)
    ));
    assert_eq!(broker.join_count(), 0);
}

#[tokio::test]
async fn test_cleanup_runs_when_session_ends() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    drain_claims(&mut consumer);
    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleanups);
    consumer.set_cleanup_fn(move |session| {
        let counter = Arc::clone(&counter);
        async move {
            assert!(session.is_done());
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let shutdown = consumer.connect().await.unwrap();
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    shutdown.shutdown().await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_handle_stops_consumer() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    drain_claims(&mut consumer);

    let shutdown = consumer.connect().await.unwrap();
    drop(shutdown);

    eventually("client close", || broker.close_count() == 1).await;
    eventually("consumer stop", || !consumer.is_running()).await;
}

#[tokio::test]
async fn test_rebalance_between_members() {
    init_tracing();
    let broker = broker(4);
    let mut first = consumer(&broker, "range");
    let (first_claims, _) = drain_claims(&mut first);
    let mut second = consumer(&broker, "range");
    let (second_claims, _) = drain_claims(&mut second);

    let first_shutdown = first.connect().await.unwrap();
    assert_eq!(broker.generation(GROUP), 1);

    let second_shutdown = second.connect().await.unwrap();
    assert_eq!(broker.generation(GROUP), 2);
    assert_eq!(broker.member_count(GROUP), 2);
    let assignment = broker.assignment(GROUP);
    assert!(assignment.values().all(|owned| owned.len() == 2));

    // The first member rejoins and claims its half in generation 2.
    eventually("first member rejoin", || {
        first_claims
            .lock()
            .unwrap()
            .iter()
            .filter(|(generation, _)| *generation == 2)
            .count()
            == 2
    })
    .await;
    eventually("second member claims", || second_claims.lock().unwrap().len() == 2).await;

    let mut all: Vec<i32> = first_claims
        .lock()
        .unwrap()
        .iter()
        .chain(second_claims.lock().unwrap().iter())
        .filter(|(generation, _)| *generation == 2)
        .map(|(_, partition)| *partition)
        .collect();
    all.sort();
    assert_eq!(all, vec![0, 1, 2, 3]);

    // Once the second member leaves, the first owns every partition again.
    second_shutdown.shutdown().await;
    assert_eq!(broker.generation(GROUP), 3);
    let assignment = broker.assignment(GROUP);
    assert_eq!(assignment.len(), 1);
    assert!(assignment.values().all(|owned| owned.len() == 4));

    first_shutdown.shutdown().await;
    assert_eq!(broker.close_count(), 2);
}

#[tokio::test]
async fn test_failure_after_rejoin_stops_loop() {
    init_tracing();
    let broker = broker(1);
    let mut consumer = consumer(&broker, "range");
    // Returning from the claim ends the session, so the loop rejoins.
    consumer.set_consume_claim_fn(|_session, mut claim| async move {
        claim.recv().await;
        Ok(())
    });

    let shutdown = consumer.connect().await.unwrap();
    let stopped = shutdown.cancellation_token();
    broker.set_reachable(false);
    broker.produce(TOPIC, 0, "last").unwrap();

    timeout(WAIT, stopped.cancelled()).await.unwrap();
    eventually("loop exit", || shutdown.is_finished()).await;
    // The client stays open until shutdown.
    assert_eq!(broker.close_count(), 0);
    assert!(consumer.is_running());

    shutdown.shutdown().await;
    assert_eq!(broker.close_count(), 1);
    assert!(!consumer.is_running());
}
