use thiserror::Error;

#[derive(Error, Debug)]
pub enum DashError {
    #[error("Realtime connection is not available")]
    ConnectionUnavailable,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Server reported failure: {0}")]
    Server(String),

    #[error("Malformed packet: {0}")]
    Codec(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid server URL: {0}")]
    Url(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DashError>;
