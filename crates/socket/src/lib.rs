//! Raw socket helpers.
//!
//! Listeners ([`TcpServer`], [`UdpServer`], `UnixServer`) forward every chunk
//! they read onto a `tokio::sync::mpsc` channel; [`run_socket_client`] does the
//! reverse and writes every chunk from a channel to a dialed socket. There is
//! no framing: chunks are whatever a single read returned, at most
//! [`READ_BUFFER_SIZE`] bytes.
//!
//! All loops stop when their `CancellationToken` fires.

mod client;
mod error;
mod network;
mod server;

pub use client::run_socket_client;
pub use error::{Result, SocketError};
pub use network::Network;
pub use server::{run_tcp_server, run_udp_server, TcpServer, UdpServer, READ_BUFFER_SIZE};

#[cfg(unix)]
pub use server::{run_unix_server, UnixServer};
