use room_common::handshake::HandshakeError;
use room_common::muxrpc::MuxError;
use thiserror::Error;

/// Errors that end a single connection.
#[derive(Error, Debug)]
pub enum RoomsError {
    /// The configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
    /// The secret handshake failed. The reason is never sent to the peer.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The peer did not finish the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The authenticated peer may not use this room.
    #[error("refused: {0}")]
    Refused(&'static str),
    /// A previous session for the same key did not shut down in time.
    #[error("would ghost connection")]
    WouldGhost,
    /// The muxrpc session failed.
    #[error("session error: {0}")]
    Session(#[from] MuxError),
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
