use thiserror::Error;

#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to listen on {network}:{address}: {source}")]
    Listen {
        network: &'static str,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {network}:{address}: {source}")]
    Dial {
        network: &'static str,
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported network: {0} (expected tcp, udp or unix)")]
    UnsupportedNetwork(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SocketError>;
