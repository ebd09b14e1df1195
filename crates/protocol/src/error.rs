#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("request '{0}' timed out")]
    RequestTimeout(String),
    #[error("connection closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
