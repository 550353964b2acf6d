//! Sync tests.
//!
//! Drive `IrreversibleSync` through a real client against a scripted remote
//! that plays the sync peer.

use crate::harness::*;
use eosp2p_network::{
    Checksum256, Client, HandshakeMessage, Message, MessageType, PeerConfig, StaticChain,
    SyncRequestMessage,
};
use eosp2p_sync::{IrreversibleSync, SyncConfig, SyncState};
use std::sync::Arc;

struct SyncFixture {
    client: Client,
    sync: Arc<IrreversibleSync>,
    remotes: Remotes,
}

fn start_syncing(head: u32, batch_size: u32) -> SyncFixture {
    let chain = Arc::new(StaticChain::genesis(Checksum256([3u8; 32])));
    chain.set_head(head, Checksum256::default(), head, Checksum256::default());
    let sync = Arc::new(IrreversibleSync::new(SyncConfig { batch_size }, chain.clone()));

    let (dialer, remotes) = MemoryDialer::new();
    let client = Client::builder(test_config(true))
        .dialer(dialer)
        .chain(chain)
        .sync(sync.clone())
        .start();

    SyncFixture {
        client,
        sync,
        remotes,
    }
}

/// The remote's handshake: ours, with the remote's chain positions.
fn remote_handshake(ours: &HandshakeMessage, lib: u32) -> Message {
    let mut handshake = ours.clone();
    handshake.node_id = Checksum256([9u8; 32]);
    handshake.agent = "remote".to_string();
    handshake.last_irreversible_block_num = lib;
    handshake.head_num = lib + 10;
    Message::Handshake(handshake)
}

async fn expect_sync_request(remote: &mut RemoteEnd) -> (u32, u32) {
    match remote.recv_kind(MessageType::SyncRequest).await.message {
        Message::SyncRequest(SyncRequestMessage {
            start_block,
            end_block,
        }) => (start_block, end_block),
        other => panic!("expected sync request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_syncs_to_remote_irreversible_block() {
    let mut f = start_syncing(0, 2);
    f.client.new_peer(PeerConfig::new("peer:sync")).await.unwrap();
    let mut remote = f.remotes.next_for("peer:sync").await;
    let ours = remote.expect_handshake().await;
    remote.send(remote_handshake(&ours, 3)).await;

    assert_eq!(expect_sync_request(&mut remote).await, (1, 2));
    remote.send(signed_block(b"1")).await;
    remote.send(signed_block(b"2")).await;

    assert_eq!(expect_sync_request(&mut remote).await, (3, 3));
    remote.send(signed_block(b"3")).await;

    let snapshot = wait_for_snapshot(&f.client, "sync to finish", |s| !s.need_sync).await;
    assert!(snapshot.sync_peer.is_none());
    assert_eq!(f.sync.state(), SyncState::Synchronized { head: 3 });
    assert!(f.sync.is_synced());

    f.client.shutdown();
    f.client.stopped().await;
}

#[tokio::test]
async fn test_already_synced_finishes_at_once() {
    let mut f = start_syncing(50, 10);
    f.client.new_peer(PeerConfig::new("peer:sync")).await.unwrap();
    let mut remote = f.remotes.next_for("peer:sync").await;
    let ours = remote.expect_handshake().await;
    assert_eq!(ours.head_num, 50);

    remote.send(remote_handshake(&ours, 40)).await;

    wait_for_snapshot(&f.client, "sync to finish", |s| !s.need_sync).await;
    assert_eq!(f.sync.state(), SyncState::Synchronized { head: 50 });

    f.client.shutdown();
    f.client.stopped().await;
}

#[tokio::test]
async fn test_waits_for_remote_handshake() {
    let mut f = start_syncing(0, 5);
    f.client.new_peer(PeerConfig::new("peer:sync")).await.unwrap();
    let mut remote = f.remotes.next_for("peer:sync").await;
    remote.expect_handshake().await;

    wait_until("sync peer selected", || {
        matches!(f.sync.state(), SyncState::AwaitingHandshake { .. })
    })
    .await;
    assert_eq!(
        f.sync.state(),
        SyncState::AwaitingHandshake {
            peer: "peer:sync".to_string()
        }
    );

    f.client.shutdown();
    f.client.stopped().await;
}

#[tokio::test]
async fn test_blocks_from_other_peers_are_ignored() {
    let mut f = start_syncing(0, 2);
    f.client.new_peer(PeerConfig::new("peer:sync")).await.unwrap();
    let mut sync_remote = f.remotes.next_for("peer:sync").await;
    let ours = sync_remote.expect_handshake().await;
    sync_remote.send(remote_handshake(&ours, 2)).await;
    assert_eq!(expect_sync_request(&mut sync_remote).await, (1, 2));

    f.client.new_peer(PeerConfig::new("peer:other")).await.unwrap();
    let mut other = f.remotes.next_for("peer:other").await;
    other.expect_handshake().await;
    other.send(signed_block(b"x")).await;
    other.send(signed_block(b"y")).await;

    sync_remote.send(signed_block(b"1")).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(f.client.snapshot().await.unwrap().need_sync);
    assert!(!f.sync.is_synced());

    sync_remote.send(signed_block(b"2")).await;
    wait_for_snapshot(&f.client, "sync to finish", |s| !s.need_sync).await;
    assert_eq!(f.sync.state(), SyncState::Synchronized { head: 2 });

    f.client.shutdown();
    f.client.stopped().await;
}
