//! Sync error types.

use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] eosp2p_network::NetworkError),

    /// The sync peer went away before the request was sent.
    #[error("Sync peer closed: {0}")]
    PeerClosed(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
