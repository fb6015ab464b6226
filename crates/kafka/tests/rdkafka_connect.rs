use std::time::Duration;

use utilkit_kafka::{Error, GroupConsumer};

#[tokio::test]
async fn test_unreachable_cluster_fails_connect() {
    tracing_subscriber::fmt()
        .with_env_filter("utilkit_kafka=debug")
        .try_init()
        .ok();

    // Nothing listens on port 1.
    let mut consumer = GroupConsumer::new(["127.0.0.1:1"], ["events"], "reachability", "range").unwrap();
    consumer.set_connect_timeout(Duration::from_secs(1));

    let err = tokio::time::timeout(Duration::from_secs(30), consumer.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Connect(_)), "{err}");
    assert!(!consumer.is_running());
}
