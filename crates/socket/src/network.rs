use std::fmt;
use std::str::FromStr;

use crate::error::SocketError;

/// Transport used by [`run_socket_client`](crate::run_socket_client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
    /// Unix domain stream socket; `address` is a filesystem path.
    Unix,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Self::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Self::Udp),
            "unix" => Ok(Self::Unix),
            other => Err(SocketError::UnsupportedNetwork(other.to_string())),
        }
    }
}
