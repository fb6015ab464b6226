//! Command-line interface for utilkit
//!
//! # Usage Examples
//!
//! ```bash
//! # Join a consumer group and print every message
//! utilkit consume --broker localhost:9092 --topic events --group reporting \
//!   --assignor sticky --offset earliest
//!
//! # Consumer settings from TOML
//! utilkit consume-config consumer.toml
//!
//! # Forward a socket to stdout, or stdin to a socket
//! utilkit listen tcp 0.0.0.0:9000
//! utilkit send udp 127.0.0.1:9000
//!
//! # Render a template
//! utilkit render report.tmpl --data report.json
//! ```
//!
//! `--log-level` routes all output through the leveled logger; without it
//! `RUST_LOG` controls a plain `tracing` subscriber.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utilkit::kafka::{ConsumerArgs, GroupConsumer};
use utilkit::logger::{LogLevel, Logger};
use utilkit::socket::Network;
use utilkit::templater::FuncMap;

#[derive(Parser)]
#[command(name = "utilkit")]
#[command(about = "Kafka consumer groups, raw socket forwarding and text templates")]
#[command(long_about = None)]
struct Cli {
    /// Route logs through the leveled logger at this level (Trace..Panic)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a consumer group and print every message
    Consume(ConsumerArgs),

    /// Like `consume`, with settings read from a TOML file
    ConsumeConfig {
        /// TOML file with the consumer settings
        path: PathBuf,
    },

    /// Listen on a socket and print every chunk received
    Listen {
        /// tcp, udp or unix
        network: Network,

        /// host:port, or a socket path for unix
        address: String,
    },

    /// Send every stdin line to a socket
    Send {
        /// tcp, udp or unix
        network: Network,

        /// host:port, or a socket path for unix
        address: String,
    },

    /// Render a template file to stdout
    Render {
        /// Template file
        template: PathBuf,

        /// JSON file with the template data
        #[arg(long, value_name = "PATH")]
        data: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    match cli.log_level {
        Some(level) => utilkit::logger::init_with_logger(Arc::new(Logger::new(level)))?,
        None => utilkit::logger::init_tracing("info")?,
    }

    match cli.command {
        Commands::Consume(args) => consume(args.into_consumer()?).await,
        Commands::ConsumeConfig { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            consume(ConsumerArgs::from_toml_str(&text)?.into_consumer()?).await
        }
        Commands::Listen { network, address } => listen(network, &address).await,
        Commands::Send { network, address } => send(network, &address).await,
        Commands::Render { template, data } => render(&template, data.as_deref()),
    }
}

async fn consume(mut consumer: GroupConsumer) -> anyhow::Result<()> {
    consumer.set_consume_claim_fn(|session, mut claim| async move {
        while let Some(message) = claim.recv().await {
            println!(
                "{}/{}@{}: {}",
                message.topic,
                message.partition,
                message.offset,
                message.payload_str().unwrap_or("<binary>")
            );
            session.mark_message(&message)?;
        }
        Ok(())
    });

    let shutdown = consumer.connect().await?;
    info!("consuming {:?} as {}", consumer.topics(), consumer.group());

    let stopped = shutdown.cancellation_token();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = stopped.cancelled() => {}
    }
    shutdown.shutdown().await;
    Ok(())
}

async fn listen(network: Network, address: &str) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let cancel = CancellationToken::new();
    let server = {
        let cancel = cancel.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            match network {
                Network::Tcp => utilkit::socket::run_tcp_server(&address, tx, cancel).await,
                Network::Udp => utilkit::socket::run_udp_server(&address, tx, cancel).await,
                #[cfg(unix)]
                Network::Unix => utilkit::socket::run_unix_server(&address, tx, cancel).await,
                #[cfg(not(unix))]
                Network::Unix => Err(utilkit::socket::SocketError::UnsupportedNetwork(
                    network.to_string(),
                )),
            }
        })
    };

    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => println!("{}", String::from_utf8_lossy(&chunk)),
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    cancel.cancel();
    server.await??;
    Ok(())
}

async fn send(network: Network, address: &str) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let cancel = CancellationToken::new();
    let client = {
        let address = address.to_string();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { utilkit::socket::run_socket_client(network, &address, rx, cancel).await },
        )
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(Bytes::from(format!("{line}\n"))).await.is_err() {
            break;
        }
    }
    drop(tx);
    client.await??;
    Ok(())
}

fn render(template: &std::path::Path, data: Option<&std::path::Path>) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(template)
        .with_context(|| format!("Failed to read {}", template.display()))?;
    let data: serde_json::Value = match data {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw).context("Invalid template data")?
        }
        None => serde_json::Value::Null,
    };

    let mut funcs = FuncMap::new();
    funcs
        .insert_str_fn("ToUpper", |s| s.to_uppercase())
        .insert_str_fn("ToLower", |s| s.to_lowercase());

    let name = template.display().to_string();
    let out = utilkit::templater::render_text(&name, &text, &data, &funcs)?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_consume() {
        let cli = Cli::try_parse_from([
            "utilkit",
            "--log-level",
            "debug",
            "consume",
            "--broker",
            "localhost:9092",
            "--topic",
            "events",
            "--group",
            "reporting",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        match cli.command {
            Commands::Consume(args) => {
                assert_eq!(args.group, "reporting");
                assert_eq!(args.assignor, "range");
            }
            _ => panic!("expected consume"),
        }
    }

    #[test]
    fn test_parse_listen() {
        let cli = Cli::try_parse_from(["utilkit", "listen", "udp", "0.0.0.0:9000"]).unwrap();
        assert!(cli.log_level.is_none());
        match cli.command {
            Commands::Listen { network, address } => {
                assert_eq!(network, Network::Udp);
                assert_eq!(address, "0.0.0.0:9000");
            }
            _ => panic!("expected listen"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_network() {
        assert!(Cli::try_parse_from(["utilkit", "send", "sctp", "x:1"]).is_err());
    }
}
