use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use utilkit_kafka::{GroupConsumer, StartOffset};

/// Example running several members of one consumer group in a process
///
/// This example shows how to:
/// 1. Create group consumers sharing a group id
/// 2. Drain every claimed partition and mark processed messages
/// 3. Connect them and let the group spread the partitions
/// 4. Shut every member down on Ctrl+C
///
/// To run this example:
/// 1. Start Kafka with Docker
///   docker run -d --name kafka -p 9092:9092 apache/kafka:latest
/// 2. Run the example
///   cargo run --example multi_consumer

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run_main().await {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {e:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<()> {
    let processed_count = Arc::new(AtomicU64::new(0));

    let mut shutdowns = Vec::new();
    for i in 0..3 {
        let mut consumer =
            GroupConsumer::new(["localhost:9092"], ["user-events"], "example-group", "sticky")?;
        consumer.set_offset(StartOffset::Earliest);
        consumer.set_client_id(format!("example-{i}"));

        let counter = Arc::clone(&processed_count);
        consumer.set_consume_claim_fn(move |session, mut claim| {
            let counter = Arc::clone(&counter);
            async move {
                while let Some(message) = claim.recv().await {
                    println!(
                        "[Consumer {i} / Partition {}] offset {}: {}",
                        message.partition,
                        message.offset,
                        message.payload_str().unwrap_or("<binary>")
                    );
                    session.mark_message(&message)?;

                    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if count % 100 == 0 {
                        println!("Processed {count} messages total");
                    }
                }
                Ok(())
            }
        });

        shutdowns.push(consumer.connect().await?);
        println!("Consumer {i} joined the group");
    }

    println!("Consumers running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    for shutdown in shutdowns {
        shutdown.shutdown().await;
    }
    println!(
        "Stopped after {} messages",
        processed_count.load(Ordering::SeqCst)
    );
    Ok(())
}
