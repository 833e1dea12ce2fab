use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

use ohmc_p2p_core::{handles::BanPeer, PeerId, ServiceFlags};
use ohmc_test_utils::{
    chain::MockChain,
    data::{block, build_chain, build_chain_from, genesis, spend},
    notifier::RecordingNotifier,
    peer::{get_blocks_requests, get_headers_requests, requested_blocks, requested_txs, MockPeer},
    txpool::MockTxPool,
};
use ohmc_types::{
    chain::{BehaviorFlags, ChainError},
    txpool::TxDesc,
    Block, BoxError, Checkpoint, InvVect, ZERO_HASH,
};

use super::{commands::SyncEvent, SyncManager};
use crate::{
    constants::{LONG_BAN, MEDIUM_BAN},
    FeeEstimator, SyncManagerBuilder, SyncManagerConfig, SyncManagerError, SyncManagerHandle,
};

struct TestNode {
    handle: SyncManagerHandle,
    chain: MockChain,
    txpool: MockTxPool,
    notifier: RecordingNotifier,
}

fn spawn_node(config: SyncManagerConfig, chain: MockChain) -> TestNode {
    let txpool = MockTxPool::new();
    let notifier = RecordingNotifier::new();

    let (handle, _) =
        SyncManagerBuilder::new(config, chain.clone(), txpool.clone(), notifier.clone()).spawn();

    TestNode {
        handle,
        chain,
        txpool,
        notifier,
    }
}

fn unrequested_blocks_config() -> SyncManagerConfig {
    SyncManagerConfig {
        accept_unrequested_blocks: true,
        ..Default::default()
    }
}

fn checkpoint_at(blocks: &[Block], height: u64) -> Checkpoint {
    Checkpoint {
        height,
        hash: blocks[usize::try_from(height).unwrap() - 1].hash(),
    }
}

fn hashes(blocks: &[Block]) -> Vec<[u8; 32]> {
    blocks.iter().map(Block::hash).collect()
}

fn block_invs(blocks: &[Block]) -> Vec<InvVect> {
    blocks.iter().map(|b| InvVect::block(b.hash())).collect()
}

impl TestNode {
    async fn connect(&self, peer: &MockPeer) {
        self.handle.new_peer(peer.client.clone()).await.unwrap();
    }

    /// Waits for every event queued so far to be handled, returning the sync peer.
    async fn sync_peer(&self) -> Option<PeerId> {
        self.handle.sync_peer_id().await.unwrap()
    }

    async fn send_block(&self, peer: &MockPeer, block: &Block) {
        self.handle
            .queue_block(peer.id(), Arc::new(block.clone()))
            .await
            .unwrap()
            .await
            .unwrap();
    }

    async fn send_headers(&self, peer: &MockPeer, blocks: &[Block]) {
        self.handle
            .queue_headers(peer.id(), blocks.iter().map(|b| b.header).collect())
            .await
            .unwrap();
    }

    async fn send_tx(&self, peer: &MockPeer, tx: &ohmc_types::Transaction) {
        self.handle
            .queue_tx(peer.id(), Arc::new(tx.clone()))
            .await
            .unwrap()
            .await
            .unwrap();
    }
}

/// Builds a sync manager that is driven from the test task, so its state can be checked between
/// events.
fn mock_manager(config: SyncManagerConfig, chain: MockChain) -> SyncManager<MockChain, MockTxPool> {
    let best = chain.best();
    let mut manager = SyncManager::new(
        config,
        chain,
        MockTxPool::new(),
        Box::new(RecordingNotifier::new()),
        None,
        CancellationToken::new(),
    );
    manager.reset_header_state(best);
    manager
}

fn block_event(peer: &MockPeer, block: &Block) -> SyncEvent {
    SyncEvent::BlockReceived {
        peer: peer.id(),
        block: Arc::new(block.clone()),
        done_tx: oneshot::channel().0,
    }
}

fn headers_event(peer: &MockPeer, blocks: &[Block]) -> SyncEvent {
    SyncEvent::HeadersReceived {
        peer: peer.id(),
        headers: blocks.iter().map(|b| b.header).collect(),
    }
}

impl SyncManager<MockChain, MockTxPool> {
    /// Handles one event the way the run loop does.
    async fn step(&mut self, event: SyncEvent) -> Result<(), BoxError> {
        let res = self.handle_event(event).await;
        self.settle().await.unwrap();
        res
    }

    /// Runs one stall check the way the run loop does.
    async fn stall_tick(&mut self) {
        self.handle_stall_sample().await.unwrap();
        self.settle().await.unwrap();
    }

    /// Checks every in-flight block is tracked by exactly the peer it was requested from.
    fn assert_requests_consistent(&self) {
        for (hash, owner) in &self.requested_blocks {
            assert!(self.peers[owner].requested_blocks.contains(hash));
        }

        for (id, state) in &self.peers {
            for hash in &state.requested_blocks {
                assert_eq!(self.requested_blocks.get(hash), Some(id));
            }
        }
    }
}

//---------------------------------------------------------------------------------------------------- Sync peer

#[tokio::test]
async fn sync_peer_selected_on_connect() {
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let mut peer = MockPeer::new(1, 10);

    node.connect(&peer).await;

    assert_eq!(node.sync_peer().await, Some(peer.id()));
    assert_eq!(
        get_blocks_requests(&peer.drain_requests()),
        vec![(vec![genesis().hash()], ZERO_HASH)]
    );
}

#[tokio::test]
async fn no_sync_peer_when_caught_up() {
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(SyncManagerConfig::default(), chain);

    let mut level = MockPeer::new(1, 0);
    let light = MockPeer::with_services(2, 10, ServiceFlags::BLOOM, 8);

    node.connect(&level).await;
    node.connect(&light).await;

    assert_eq!(node.sync_peer().await, None);
    assert!(level.drain_requests().is_empty());
}

#[tokio::test]
async fn sync_peer_replaced_on_disconnect() {
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let a = MockPeer::new(1, 10);
    let mut b = MockPeer::new(2, 8);

    node.connect(&a).await;
    node.connect(&b).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));
    assert!(b.drain_requests().is_empty());

    node.handle.done_peer(a.id()).await.unwrap();

    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert_eq!(
        get_blocks_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], ZERO_HASH)]
    );

    // A second disconnect message for the same peer is ignored.
    node.handle.done_peer(a.id()).await.unwrap();
    assert_eq!(node.sync_peer().await, Some(b.id()));
}

#[tokio::test]
async fn full_request_channel_disconnects() {
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let blocks = build_chain(2);
    // Room for the `getblocks` request only.
    let peer = MockPeer::with_services(1, 2, ServiceFlags::NETWORK, 1);

    node.connect(&peer).await;
    assert_eq!(node.sync_peer().await, Some(peer.id()));

    node.handle
        .queue_inv(peer.id(), block_invs(&blocks))
        .await
        .unwrap();

    assert_eq!(node.sync_peer().await, None);
    assert!(peer.is_closed());
    assert_eq!(peer.ban(), None);
}

#[tokio::test]
async fn rescan_starts_sync() {
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(SyncManagerConfig::default(), chain);
    let mut peer = MockPeer::new(1, 0);

    node.connect(&peer).await;
    assert_eq!(node.sync_peer().await, None);

    node.chain.set_current(false);
    node.handle.request_rescan().await.unwrap();

    assert_eq!(node.sync_peer().await, Some(peer.id()));
    assert_eq!(get_blocks_requests(&peer.drain_requests()).len(), 1);
}

#[tokio::test]
async fn idle_sync_peer_replaced_by_higher_peer() {
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 0);
    let mut b = MockPeer::new(2, 10);

    node.connect(&a).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));
    a.drain_requests();

    node.connect(&b).await;

    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert_eq!(
        get_blocks_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], ZERO_HASH)]
    );
    assert!(a.drain_requests().is_empty());
    assert!(!a.is_closed());
}

#[tokio::test(start_paused = true)]
async fn caught_up_sync_peer_replaced_on_tick() {
    let config = SyncManagerConfig::default();
    let wait = config.stall_tick_interval + Duration::from_secs(1);
    let blocks = build_chain(1);
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 0);
    let mut b = MockPeer::new(2, 10);

    node.connect(&a).await;
    node.handle
        .queue_inv(a.id(), block_invs(&blocks))
        .await
        .unwrap();
    node.sync_peer().await;
    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));

    // Kept while it has a block in flight.
    node.connect(&b).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));
    assert!(b.drain_requests().is_empty());

    node.send_block(&a, &blocks[0]).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));

    tokio::time::sleep(wait).await;

    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert_eq!(
        get_blocks_requests(&b.drain_requests()),
        vec![(vec![blocks[0].hash(), genesis().hash()], ZERO_HASH)]
    );
    assert!(!a.is_closed());
}

//---------------------------------------------------------------------------------------------------- Headers-first

#[tokio::test]
async fn headers_first_then_blocks_first() {
    let blocks = build_chain(8);
    let config = SyncManagerConfig {
        checkpoints: vec![checkpoint_at(&blocks, 5)],
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut peer = MockPeer::new(1, 8);

    node.connect(&peer).await;
    node.sync_peer().await;
    assert_eq!(
        get_headers_requests(&peer.drain_requests()),
        vec![(vec![genesis().hash()], blocks[4].hash())]
    );

    node.send_headers(&peer, &blocks[..5]).await;
    node.sync_peer().await;
    assert_eq!(node.chain.processed_headers(), hashes(&blocks[..5]));
    assert_eq!(
        requested_blocks(&peer.drain_requests()),
        hashes(&blocks[..5])
    );

    for b in &blocks[..5] {
        node.send_block(&peer, b).await;
    }

    // Past the last checkpoint, blocks are fetched one announcement at a time.
    assert_eq!(
        get_blocks_requests(&peer.drain_requests()),
        vec![(vec![blocks[4].hash()], ZERO_HASH)]
    );

    node.handle
        .queue_inv(peer.id(), block_invs(&blocks[5..]))
        .await
        .unwrap();
    node.sync_peer().await;
    assert_eq!(
        requested_blocks(&peer.drain_requests()),
        hashes(&blocks[5..])
    );

    for b in &blocks[5..] {
        node.send_block(&peer, b).await;
    }

    let expected = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| {
            let flags = if i < 5 {
                BehaviorFlags::FAST_ADD
            } else {
                BehaviorFlags::NONE
            };
            (b.hash(), flags)
        })
        .collect::<Vec<_>>();

    assert_eq!(node.chain.processed_blocks_with_flags(), expected);
    assert_eq!(node.chain.best().height, 8);
}

#[tokio::test]
async fn headers_requested_in_batches() {
    let blocks = build_chain(6);
    let config = SyncManagerConfig {
        checkpoints: vec![checkpoint_at(&blocks, 6)],
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut peer = MockPeer::new(1, 6);

    node.connect(&peer).await;
    node.sync_peer().await;
    peer.drain_requests();

    node.send_headers(&peer, &blocks[..3]).await;
    node.sync_peer().await;

    let requests = peer.drain_requests();
    assert_eq!(
        get_headers_requests(&requests),
        vec![(vec![blocks[2].hash()], blocks[5].hash())]
    );
    // No blocks until the checkpoint's header arrives.
    assert!(requested_blocks(&requests).is_empty());

    node.send_headers(&peer, &blocks[3..]).await;
    node.sync_peer().await;
    assert_eq!(requested_blocks(&peer.drain_requests()), hashes(&blocks));
}

#[tokio::test]
async fn checkpoint_mismatch_bans_peer() {
    let blocks = build_chain(5);
    let config = SyncManagerConfig {
        checkpoints: vec![Checkpoint {
            height: 3,
            hash: [9; 32],
        }],
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let a = MockPeer::new(1, 5);
    let mut b = MockPeer::new(2, 5);

    node.connect(&a).await;
    node.send_headers(&a, &blocks).await;

    assert_eq!(node.sync_peer().await, None);
    assert_eq!(a.ban(), Some(BanPeer(MEDIUM_BAN)));
    assert!(node.chain.processed_headers().is_empty());

    // The header cursor did not move.
    node.connect(&b).await;
    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert_eq!(
        get_headers_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], [9; 32])]
    );
}

#[tokio::test]
async fn unrequested_headers_disconnect() {
    let blocks = build_chain(2);
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let a = MockPeer::new(1, 2);
    let b = MockPeer::new(2, 2);

    node.connect(&a).await;
    node.connect(&b).await;
    node.send_headers(&b, &blocks).await;

    assert_eq!(node.sync_peer().await, Some(a.id()));
    assert!(b.is_closed());
    assert_eq!(b.ban(), None);
    assert!(!a.is_closed());
}

#[tokio::test]
async fn not_found_blocks_requested_elsewhere() {
    let blocks = build_chain(5);
    let config = SyncManagerConfig {
        checkpoints: vec![checkpoint_at(&blocks, 5)],
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 5);
    let mut b = MockPeer::new(2, 5);

    node.connect(&a).await;
    node.connect(&b).await;
    node.send_headers(&a, &blocks).await;
    node.sync_peer().await;

    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));
    assert!(b.drain_requests().is_empty());

    node.handle
        .queue_not_found(a.id(), vec![InvVect::block(blocks[0].hash())])
        .await
        .unwrap();
    node.sync_peer().await;

    assert!(a.drain_requests().is_empty());
    assert_eq!(
        requested_blocks(&b.drain_requests()),
        vec![blocks[0].hash()]
    );
}

#[tokio::test]
async fn in_flight_blocks_move_to_new_sync_peer() {
    let blocks = build_chain(5);
    let config = SyncManagerConfig {
        checkpoints: vec![checkpoint_at(&blocks, 5)],
        ..Default::default()
    };
    let mut manager = mock_manager(config, MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 5);
    let mut b = MockPeer::new(2, 5);

    manager
        .step(SyncEvent::PeerConnected(a.client.clone()))
        .await
        .unwrap();
    manager
        .step(SyncEvent::PeerConnected(b.client.clone()))
        .await
        .unwrap();
    manager.step(headers_event(&a, &blocks)).await.unwrap();

    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));
    assert_eq!(manager.requested_blocks.len(), 5);
    manager.assert_requests_consistent();

    manager
        .step(SyncEvent::PeerDisconnected(a.id()))
        .await
        .unwrap();

    assert_eq!(manager.sync_peer, Some(b.id()));
    assert!(manager.requested_blocks.is_empty());
    manager.assert_requests_consistent();
    assert_eq!(
        get_headers_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], blocks[4].hash())]
    );

    manager.step(headers_event(&b, &blocks)).await.unwrap();

    assert_eq!(requested_blocks(&b.drain_requests()), hashes(&blocks));
    assert!(manager.requested_blocks.values().all(|peer| *peer == b.id()));
    manager.assert_requests_consistent();
}

#[tokio::test(start_paused = true)]
async fn stalled_peer_blocks_released() {
    let blocks = build_chain(5);
    let config = SyncManagerConfig {
        checkpoints: vec![checkpoint_at(&blocks, 5)],
        ..Default::default()
    };
    let wait = config.stall_timeout + Duration::from_secs(1);
    let mut manager = mock_manager(config, MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 5);
    let mut b = MockPeer::new(2, 5);

    manager
        .step(SyncEvent::PeerConnected(a.client.clone()))
        .await
        .unwrap();
    manager
        .step(SyncEvent::PeerConnected(b.client.clone()))
        .await
        .unwrap();
    manager.step(headers_event(&a, &blocks)).await.unwrap();
    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));

    // The first block arrives, the rest never do.
    manager.step(block_event(&a, &blocks[0])).await.unwrap();
    manager.stall_tick().await;
    assert_eq!(manager.sync_peer, Some(a.id()));

    tokio::time::advance(wait).await;
    manager.stall_tick().await;

    assert!(a.is_closed());
    assert_eq!(a.ban(), None);
    assert_eq!(manager.sync_peer, Some(b.id()));
    assert!(manager.requested_blocks.is_empty());
    manager.assert_requests_consistent();
    assert_eq!(
        get_headers_requests(&b.drain_requests()),
        vec![(vec![blocks[0].hash(), genesis().hash()], blocks[4].hash())]
    );

    manager.step(headers_event(&b, &blocks[1..])).await.unwrap();

    assert_eq!(requested_blocks(&b.drain_requests()), hashes(&blocks[1..]));
    manager.assert_requests_consistent();
}

//---------------------------------------------------------------------------------------------------- Blocks

#[tokio::test]
async fn unrequested_block_disconnects() {
    let blocks = build_chain(1);
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));
    let peer = MockPeer::new(1, 1);

    node.connect(&peer).await;
    node.send_block(&peer, &blocks[0]).await;

    assert!(peer.is_closed());
    assert!(node.chain.processed_blocks().is_empty());
}

#[tokio::test]
async fn duplicate_block_is_not_relayed() {
    let blocks = build_chain(1);
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(unrequested_blocks_config(), chain);
    let peer = MockPeer::new(1, 1);

    node.connect(&peer).await;
    node.send_block(&peer, &blocks[0]).await;

    assert_eq!(node.notifier.relayed_blocks(), hashes(&blocks));
    assert_eq!(
        node.notifier.height_updates(),
        vec![(blocks[0].hash(), 1, peer.id())]
    );

    node.send_block(&peer, &blocks[0]).await;

    assert_eq!(node.notifier.relayed_blocks(), hashes(&blocks));
    assert_eq!(node.chain.processed_blocks(), hashes(&blocks));
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn orphans_connected_when_parent_arrives() {
    let blocks = build_chain(5);
    let node = spawn_node(unrequested_blocks_config(), MockChain::new(&genesis()));
    let mut peer = MockPeer::new(1, 5);

    node.connect(&peer).await;
    node.sync_peer().await;
    peer.drain_requests();

    node.send_block(&peer, &blocks[2]).await;

    // The missing parents are asked for, up to the orphan.
    assert_eq!(
        get_blocks_requests(&peer.drain_requests()),
        vec![(vec![genesis().hash()], blocks[2].hash())]
    );

    for b in [&blocks[4], &blocks[3], &blocks[1]] {
        node.send_block(&peer, b).await;
    }
    assert!(node.chain.processed_blocks().is_empty());

    node.send_block(&peer, &blocks[0]).await;

    assert_eq!(node.chain.processed_blocks(), hashes(&blocks));
    assert_eq!(node.chain.best().height, 5);
}

#[tokio::test]
async fn invalid_orphan_bans_supplier() {
    let blocks = build_chain(2);
    let chain = MockChain::new(&genesis());
    chain.mark_invalid_block(blocks[1].hash());
    let node = spawn_node(unrequested_blocks_config(), chain);
    let a = MockPeer::new(1, 2);
    let b = MockPeer::new(2, 2);

    node.connect(&a).await;
    node.connect(&b).await;

    node.send_block(&b, &blocks[1]).await;
    node.send_block(&a, &blocks[0]).await;

    assert_eq!(node.chain.processed_blocks(), vec![blocks[0].hash()]);
    assert_eq!(b.ban(), Some(BanPeer(LONG_BAN)));
    assert_eq!(a.ban(), None);
}

#[tokio::test]
async fn block_from_other_peer_clears_request() {
    let blocks = build_chain(1);
    let mut manager = mock_manager(unrequested_blocks_config(), MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 1);
    let b = MockPeer::new(2, 1);

    manager
        .step(SyncEvent::PeerConnected(a.client.clone()))
        .await
        .unwrap();
    manager
        .step(SyncEvent::PeerConnected(b.client.clone()))
        .await
        .unwrap();
    manager
        .step(SyncEvent::InvReceived {
            peer: a.id(),
            inv: block_invs(&blocks),
        })
        .await
        .unwrap();

    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));
    assert_eq!(
        manager.requested_blocks.get(&blocks[0].hash()),
        Some(&a.id())
    );

    manager.step(block_event(&b, &blocks[0])).await.unwrap();

    assert!(manager.requested_blocks.is_empty());
    assert!(manager.peers[&a.id()].requested_blocks.is_empty());
    manager.assert_requests_consistent();
    assert!(!b.is_closed());
}

#[tokio::test]
async fn orphans_kept_when_chain_fails() {
    let parent = build_chain(1);
    let left = build_chain_from(&parent[0], 1, 1, 1);
    let right = build_chain_from(&parent[0], 1, 1, 2);

    let chain = MockChain::new(&genesis());
    chain.fail_block_once(left[0].hash());
    let mut manager = mock_manager(unrequested_blocks_config(), chain.clone());
    let peer = MockPeer::new(1, 2);

    manager
        .step(SyncEvent::PeerConnected(peer.client.clone()))
        .await
        .unwrap();
    manager.step(block_event(&peer, &left[0])).await.unwrap();
    manager.step(block_event(&peer, &right[0])).await.unwrap();
    assert_eq!(manager.orphans.len(), 2);

    assert!(manager.step(block_event(&peer, &parent[0])).await.is_err());

    assert!(chain.contains(&parent[0].hash()));
    assert!(manager.orphans.has(&left[0].hash()));
    assert!(manager.orphans.has(&right[0].hash()));

    // Once received again they are connected.
    manager.step(block_event(&peer, &left[0])).await.unwrap();
    manager.step(block_event(&peer, &right[0])).await.unwrap();

    assert!(manager.orphans.is_empty());
    assert_eq!(
        chain.processed_blocks(),
        vec![parent[0].hash(), left[0].hash(), right[0].hash()]
    );
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn requested_blocks_capped() {
    let blocks = build_chain(5);
    let config = SyncManagerConfig {
        max_requested_blocks: 2,
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut peer = MockPeer::new(1, 5);

    node.connect(&peer).await;
    node.sync_peer().await;
    peer.drain_requests();

    node.handle
        .queue_inv(peer.id(), block_invs(&blocks))
        .await
        .unwrap();
    node.sync_peer().await;

    assert_eq!(
        requested_blocks(&peer.drain_requests()),
        hashes(&blocks[..2])
    );
}

#[derive(Debug, Clone)]
struct FailingEstimator {
    registered: Arc<AtomicUsize>,
    fail_on: usize,
}

impl FeeEstimator for FailingEstimator {
    fn register_block(&mut self, _: &Block) -> Result<(), BoxError> {
        let count = self.registered.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.fail_on {
            return Err("estimator out of sync".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn connected_block_housekeeping() {
    let tx = spend([1; 32], 0);
    let b1 = block(genesis().hash(), 1, 0, vec![tx.clone()]);
    let b2 = block(b1.hash(), 2, 0, vec![]);
    let b3 = block(b2.hash(), 3, 0, vec![]);

    let chain = MockChain::new(&genesis());
    let txpool = MockTxPool::new();
    let notifier = RecordingNotifier::new();
    let registered = Arc::new(AtomicUsize::new(0));

    let orphan_tx = TxDesc::new(Arc::new(spend([2; 32], 0)), 1, 10);
    txpool.accept_orphans_on_next_block(vec![orphan_tx.clone()]);

    let (handle, _) = SyncManagerBuilder::new(
        unrequested_blocks_config(),
        chain.clone(),
        txpool.clone(),
        notifier.clone(),
    )
    .with_fee_estimator(FailingEstimator {
        registered: Arc::clone(&registered),
        fail_on: 2,
    })
    .spawn();

    let peer = MockPeer::new(1, 3);
    handle.new_peer(peer.client.clone()).await.unwrap();

    for b in [&b1, &b2, &b3] {
        handle
            .queue_block(peer.id(), Arc::new(b.clone()))
            .await
            .unwrap()
            .await
            .unwrap();
    }

    assert_eq!(
        txpool.connected_blocks(),
        vec![b1.hash(), b2.hash(), b3.hash()]
    );
    // The coinbase is never announced as confirmed.
    assert_eq!(notifier.confirmed_txs(), vec![tx.hash()]);
    assert_eq!(notifier.announced_txs(), vec![orphan_tx.hash]);
    // The estimator is dropped after it fails.
    assert_eq!(registered.load(Ordering::SeqCst), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn blocks_commit_once_in_any_order(order in Just((0..12_usize).collect::<Vec<_>>()).prop_shuffle()) {
        tokio_test::block_on(async {
            let blocks = build_chain(12);
            let node = spawn_node(unrequested_blocks_config(), MockChain::new(&genesis()));
            let peer = MockPeer::new(1, 12);

            node.connect(&peer).await;

            for i in order {
                node.send_block(&peer, &blocks[i]).await;
            }

            assert_eq!(node.chain.processed_blocks(), hashes(&blocks));
            assert!(!peer.is_closed());
        });
    }
}

//---------------------------------------------------------------------------------------------------- Transactions

#[tokio::test]
async fn rejected_tx_not_requested_again() {
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(SyncManagerConfig::default(), chain);
    let mut peer = MockPeer::new(1, 0);

    let good = spend([1; 32], 0);
    let bad = spend([2; 32], 0);
    node.txpool.reject_for_policy(bad.hash());

    node.connect(&peer).await;
    node.handle
        .queue_inv(
            peer.id(),
            vec![InvVect::tx(good.hash()), InvVect::tx(bad.hash())],
        )
        .await
        .unwrap();
    node.sync_peer().await;
    assert_eq!(
        requested_txs(&peer.drain_requests()),
        vec![good.hash(), bad.hash()]
    );

    node.send_tx(&peer, &good).await;
    node.send_tx(&peer, &bad).await;
    assert_eq!(node.notifier.announced_txs(), vec![good.hash()]);

    node.handle
        .queue_inv(peer.id(), vec![InvVect::tx(bad.hash())])
        .await
        .unwrap();
    node.sync_peer().await;
    assert!(peer.drain_requests().is_empty());

    // Sending it anyway does not reach the pool.
    node.send_tx(&peer, &bad).await;
    assert_eq!(node.txpool.processed_txs(), vec![good.hash(), bad.hash()]);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn invalid_tx_bans_peer() {
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(SyncManagerConfig::default(), chain);
    let peer = MockPeer::new(1, 0);

    let bad = spend([3; 32], 0);
    node.txpool.reject_for_rule(bad.hash());

    node.connect(&peer).await;
    node.send_tx(&peer, &bad).await;

    assert_eq!(peer.ban(), Some(BanPeer(LONG_BAN)));
    assert!(!node.txpool.contains(&bad.hash()));
}

//---------------------------------------------------------------------------------------------------- Stalls

#[tokio::test(start_paused = true)]
async fn stalled_sync_peer_replaced() {
    let config = SyncManagerConfig::default();
    let wait = config.stall_timeout + config.stall_tick_interval + Duration::from_secs(1);
    let node = spawn_node(config, MockChain::new(&genesis()));
    let a = MockPeer::new(1, 10);
    let mut b = MockPeer::new(2, 10);

    node.connect(&a).await;
    node.connect(&b).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));

    tokio::time::sleep(wait).await;

    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert!(a.is_closed());
    assert_eq!(
        get_blocks_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], ZERO_HASH)]
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_sync_peer_with_blocks_in_flight_disconnected() {
    let config = SyncManagerConfig::default();
    let wait = config.stall_timeout + config.stall_tick_interval + Duration::from_secs(1);
    let blocks = build_chain(1);
    let node = spawn_node(config, MockChain::new(&genesis()));
    let mut a = MockPeer::new(1, 0);
    let mut b = MockPeer::new(2, 1);

    node.connect(&a).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));
    node.handle
        .queue_inv(a.id(), block_invs(&blocks))
        .await
        .unwrap();
    node.sync_peer().await;
    assert_eq!(requested_blocks(&a.drain_requests()), hashes(&blocks));

    node.connect(&b).await;
    assert_eq!(node.sync_peer().await, Some(a.id()));

    tokio::time::sleep(wait).await;

    assert!(a.is_closed());
    assert_eq!(a.ban(), None);
    assert_eq!(node.sync_peer().await, Some(b.id()));
    assert_eq!(
        get_blocks_requests(&b.drain_requests()),
        vec![(vec![genesis().hash()], ZERO_HASH)]
    );

    // The block is no longer in flight, so it can be asked for again.
    node.handle
        .queue_inv(b.id(), block_invs(&blocks))
        .await
        .unwrap();
    node.sync_peer().await;
    assert_eq!(requested_blocks(&b.drain_requests()), hashes(&blocks));
}

#[tokio::test]
async fn zero_stall_tick_interval() {
    let config = SyncManagerConfig {
        stall_tick_interval: Duration::ZERO,
        ..Default::default()
    };
    let node = spawn_node(config, MockChain::new(&genesis()));
    let peer = MockPeer::new(1, 10);

    node.connect(&peer).await;

    assert_eq!(node.sync_peer().await, Some(peer.id()));
}

#[tokio::test(start_paused = true)]
async fn idle_sync_peer_kept() {
    let config = SyncManagerConfig::default();
    let wait = config.stall_timeout * 2;
    let node = spawn_node(config, MockChain::new(&genesis()));
    let peer = MockPeer::new(1, 0);

    node.connect(&peer).await;
    assert_eq!(node.sync_peer().await, Some(peer.id()));

    tokio::time::sleep(wait).await;

    // Nothing was expected from the peer, so it did not stall.
    assert_eq!(node.sync_peer().await, Some(peer.id()));
    assert!(!peer.is_closed());
}

//---------------------------------------------------------------------------------------------------- Commands

#[tokio::test]
async fn process_block_command() {
    let blocks = build_chain(3);
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));

    let process = |b: &Block| {
        node.handle
            .process_block(Arc::new(b.clone()), BehaviorFlags::NONE)
    };

    assert!(!process(&blocks[0]).await.unwrap());
    assert!(matches!(
        process(&blocks[0]).await,
        Err(SyncManagerError::Chain(ChainError::Duplicate))
    ));
    assert!(process(&blocks[2]).await.unwrap());
    assert!(!process(&blocks[1]).await.unwrap());

    assert_eq!(node.chain.processed_blocks(), hashes(&blocks));
}

#[tokio::test]
async fn is_current_follows_sync_peer() {
    let chain = MockChain::new(&genesis());
    chain.set_current(true);
    let node = spawn_node(SyncManagerConfig::default(), chain);

    assert!(node.handle.is_current().await.unwrap());

    let peer = MockPeer::new(1, 10);
    node.connect(&peer).await;

    assert_eq!(node.sync_peer().await, Some(peer.id()));
    assert!(!node.handle.is_current().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn pause_blocks_events() {
    let node = spawn_node(SyncManagerConfig::default(), MockChain::new(&genesis()));

    let guard = node.handle.pause().await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_secs(1), node.handle.sync_peer_id())
            .await
            .is_err()
    );

    drop(guard);
    assert_eq!(node.sync_peer().await, None);
}

#[tokio::test]
async fn stops_on_shutdown() {
    let shutdown = tokio_util::sync::CancellationToken::new();
    let (handle, task) = SyncManagerBuilder::new(
        SyncManagerConfig::default(),
        MockChain::new(&genesis()),
        MockTxPool::new(),
        RecordingNotifier::new(),
    )
    .with_shutdown_token(shutdown.clone())
    .spawn();

    shutdown.cancel();
    task.await.unwrap();

    assert!(matches!(
        handle.sync_peer_id().await,
        Err(SyncManagerError::ManagerStopped)
    ));
}

//---------------------------------------------------------------------------------------------------- Logging

#[derive(Debug, Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn logs_go_to_injected_dispatch() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .finish();

    let (handle, _) = SyncManagerBuilder::new(
        SyncManagerConfig::default(),
        MockChain::new(&genesis()),
        MockTxPool::new(),
        RecordingNotifier::new(),
    )
    .with_tracing_dispatch(Dispatch::new(subscriber))
    .spawn();

    let peer = MockPeer::new(1, 10);
    handle.new_peer(peer.client.clone()).await.unwrap();
    handle.sync_peer_id().await.unwrap();

    let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(logs.contains("New valid peer"));
    assert!(logs.contains("sync_manager"));
}
