use {switchboard_protocol::ProtocolError, switchboard_store::StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is already restarting")]
    AlreadyRestarting(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid session id: {0}")]
    InvalidId(#[from] switchboard_common::InvalidSessionId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
