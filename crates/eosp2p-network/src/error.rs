//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote side closed the stream.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Handshake could not be produced or sent.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Peer was explicitly closed and cannot be restarted.
    #[error("Peer closed: {0}")]
    PeerClosed(String),

    /// Peer has no live transport.
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    /// Failure while sending a message to a peer.
    #[error("write msg to {address}: {source}")]
    Send {
        address: String,
        #[source]
        source: Box<NetworkError>,
    },

    /// A loop mailbox is closed (client stopped).
    #[error("Mailbox closed")]
    MailboxClosed,

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding error.
    #[error("Encoding error: {0}")]
    Encode(String),
}

impl NetworkError {
    /// Wrap an error with the address of the peer it occurred on.
    pub fn at_peer(self, address: impl Into<String>) -> Self {
        NetworkError::Send {
            address: address.into(),
            source: Box::new(self),
        }
    }

    /// Whether this error means the remote end closed the stream.
    pub fn is_eof(&self) -> bool {
        match self {
            NetworkError::ConnectionClosed => true,
            NetworkError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            NetworkError::Send { source, .. } => source.is_eof(),
            _ => false,
        }
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
