//! # eosp2p-sync
//!
//! Irreversible-block synchronization driven by the peer networking core.
//!
//! This crate provides:
//! - [`IrreversibleSync`], a sync collaborator that requests blocks from the
//!   designated sync peer in fixed-size batches until the local head reaches
//!   the peer's last irreversible block
//! - [`SyncProgress`], the batch bookkeeping behind it

mod error;
mod progress;
mod sync;

pub use error::{SyncError, SyncResult};
pub use progress::SyncProgress;
pub use sync::{IrreversibleSync, SyncConfig, SyncState};

/// Number of blocks requested per sync request.
pub const SYNC_BATCH_SIZE: u32 = 100;
