//! # eosp2p-tests
//!
//! Integration tests for the peer networking core.
//!
//! This crate provides:
//! - Client scenario tests over in-memory connections (handler registry,
//!   peer lifecycle, sync-peer selection, shutdown)
//! - Sync tests driving `IrreversibleSync` against a scripted remote
//! - Property-based tests for the handler registry and frame decoding

pub mod harness;


#[cfg(test)]
mod sync_tests;


pub use harness::*;
