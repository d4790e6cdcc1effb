use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum KsError {
    /// Handshake, authentication, or channel failure reported by the
    /// remote-shell client. Displayed verbatim to the peer.
    #[error("{0}")]
    RemoteShell(String),

    /// Shell channel is gone or refused the operation.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type KsResult<T> = Result<T, KsError>;
