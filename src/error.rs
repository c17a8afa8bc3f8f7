use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the crate
///
/// Every variant is terminal for the connection run that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to load private key {}: {source}", .path.display())]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse private key {}: {source}", .path.display())]
    KeyParse {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to accept incoming connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to handshake: {0}")]
    Handshake(#[source] russh::Error),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("SSH session ended with errors: {0}")]
    Transport(#[source] russh::Error),

    #[error("could not accept new channel {channel}")]
    ChannelAccept { channel: u64 },

    #[error("sftp server completed with errors on channel {channel}: {source}")]
    SubsystemServe {
        channel: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("channel handler aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
