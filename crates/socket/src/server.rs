//! Listeners that forward every chunk they receive onto a channel.
//!
//! Each listener is bound first (so callers can bind port 0 and read back the
//! address) and then driven by `run` until its cancellation token fires.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, SocketError};

/// Size of the read buffer for every socket read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// TCP listener; every accepted connection is read on its own task.
pub struct TcpServer {
    listener: TcpListener,
    address: String,
}

impl TcpServer {
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| SocketError::Listen {
                network: "tcp",
                address: address.to_string(),
                source,
            })?;
        debug!("tcp listen build");
        Ok(Self {
            listener,
            address: address.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run(self, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()> {
        info!("listen: <{}>", self.local_addr()?);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted tcp connection from {peer}");
                    tokio::spawn(forward_stream(
                        stream,
                        peer.to_string(),
                        format!("tcp:{}", self.address),
                        tx.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => error!("connect tcp:{} failed: {e}", self.address),
            }
        }
        debug!("tcp listener on {} stopped", self.address);
        Ok(())
    }
}

/// UDP listener forwarding each datagram.
pub struct UdpServer {
    socket: UdpSocket,
    address: String,
}

impl UdpServer {
    pub async fn bind(address: &str) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|source| SocketError::Listen {
                network: "udp",
                address: address.to_string(),
                source,
            })?;
        Ok(Self {
            socket,
            address: address.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive datagrams until `cancel` fires or the receiver side is dropped.
    pub async fn run(self, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()> {
        info!("listen: <{}>", self.local_addr()?);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((n, peer)) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    info!("received data from {peer}");
                    debug!("received data from {peer}: {data:?}");
                    if tx.send(data).await.is_err() {
                        debug!("udp:{} receiver dropped, stopping", self.address);
                        break;
                    }
                }
                Err(e) => error!("listen udp:{} data failed: {e}", self.address),
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
pub use unix::UnixServer;

#[cfg(unix)]
mod unix {
    use std::path::{Path, PathBuf};

    use bytes::Bytes;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, error, info, warn};

    use super::forward_stream;
    use crate::error::{Result, SocketError};

    /// Unix domain stream listener. The socket file is removed when `run`
    /// returns.
    pub struct UnixServer {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixServer {
        pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            let listener = UnixListener::bind(&path).map_err(|source| SocketError::Listen {
                network: "unix",
                address: path.display().to_string(),
                source,
            })?;
            debug!("unix listen build");
            Ok(Self { listener, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub async fn run(self, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Result<()> {
            let address = self.path.display().to_string();
            info!("listen: <{address}>");
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(forward_stream(
                            stream,
                            address.clone(),
                            format!("unix:{address}"),
                            tx.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => error!("connect unix:{address} failed: {e}"),
                }
            }
            drop(self.listener);
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("failed to remove unix socket {address}: {e}");
            }
            Ok(())
        }
    }
}

/// Read a stream in [`READ_BUFFER_SIZE`] chunks and forward exactly the bytes
/// read. Ends on EOF, on a read error, on cancellation, or when the receiver
/// is gone.
async fn forward_stream<R>(
    mut stream: R,
    peer: String,
    listener: String,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                info!("received data from {peer}");
                debug!("received data from {peer}: {data:?}");
                if tx.send(data).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("listen {listener} data failed: {e}");
                break;
            }
        }
    }
    debug!("connection from {peer} closed");
}

/// Listen on a TCP address and forward received bytes to `tx`.
pub async fn run_tcp_server(
    address: &str,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    TcpServer::bind(address).await?.run(tx, cancel).await
}

/// Listen on a UDP address and forward received datagrams to `tx`.
pub async fn run_udp_server(
    address: &str,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    UdpServer::bind(address).await?.run(tx, cancel).await
}

/// Listen on a Unix domain socket path and forward received bytes to `tx`.
#[cfg(unix)]
pub async fn run_unix_server(
    path: &str,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    UnixServer::bind(path)?.run(tx, cancel).await
}
