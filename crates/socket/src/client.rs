use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, SocketError};
use crate::network::Network;

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Connection {
    async fn dial(network: Network, address: &str) -> std::io::Result<Self> {
        match network {
            Network::Tcp => Ok(Self::Tcp(TcpStream::connect(address).await?)),
            Network::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(address).await?;
                Ok(Self::Udp(socket))
            }
            #[cfg(unix)]
            Network::Unix => Ok(Self::Unix(tokio::net::UnixStream::connect(address).await?)),
            #[cfg(not(unix))]
            Network::Unix => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    fn remote(&self) -> String {
        let addr = match self {
            Self::Tcp(s) => s.peer_addr().map(|a| a.to_string()),
            Self::Udp(s) => s.peer_addr().map(|a| a.to_string()),
            #[cfg(unix)]
            Self::Unix(s) => s.peer_addr().map(|a| {
                a.as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            }),
        };
        addr.unwrap_or_else(|_| "unknown".to_string())
    }

    async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(data).await,
            Self::Udp(s) => s.send(data).await.map(|_| ()),
            #[cfg(unix)]
            Self::Unix(s) => s.write_all(data).await,
        }
    }
}

/// Dial `network`/`address` and write every chunk received on `rx`.
///
/// Write failures are logged and the next chunk is tried. Returns once `rx`
/// is closed or `cancel` fires; fails only if the dial itself fails.
pub async fn run_socket_client(
    network: Network,
    address: &str,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut conn = Connection::dial(network, address)
        .await
        .map_err(|source| SocketError::Dial {
            network: network.as_str(),
            address: address.to_string(),
            source,
        })?;
    info!("dial: <{}>", conn.remote());

    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            data = rx.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        if let Err(e) = conn.send(&data).await {
            error!("send data to {network}:{address} failed: {e}");
            debug!("send data to {network}:{address} failed: {e}: {data:?}");
        }
    }
    debug!("socket client for {network}:{address} stopped");
    Ok(())
}
