// Restart recovery: state written before a crash is honoured after reopening

mod common;

use bitcoin::Amount;
use chrono::{TimeDelta, Utc};
use common::{Engine, add_share, mine_matured_pool_block};
use dmpool::error::PayoutError;
use dmpool::payout::PayoutStatus;
use dmpool::shares::MemoryShareStore;
use dmpool::test_utils::{FakeNode, MINER_ADDRESSES, SendBehavior};
use std::sync::Arc;

#[tokio::test]
async fn test_credited_block_not_credited_again_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(FakeNode::new());
    let shares = Arc::new(MemoryShareStore::new());

    let block_time = Utc::now() - TimeDelta::hours(1);
    add_share(&shares, MINER_ADDRESSES[0], 3, block_time - TimeDelta::minutes(5)).await;
    add_share(&shares, MINER_ADDRESSES[1], 1, block_time - TimeDelta::minutes(5)).await;
    mine_matured_pool_block(&node, block_time);

    let before = {
        let engine = Engine::open(dir.path(), node.clone(), shares.clone()).await;
        let report = engine.distributor.run_once().await.unwrap();
        assert_eq!(report.blocks_credited, vec![1]);
        engine.store.read(|s| s.balances.clone()).await
    };

    // Cursor and processed flag survive, so nothing is scanned twice
    let engine = Engine::open(dir.path(), node.clone(), shares.clone()).await;
    let cursor = engine.store.read(|s| s.cursor.last_processed_height).await;
    assert_eq!(cursor, Some(1));
    let report = engine.distributor.run_once().await.unwrap();
    assert!(report.blocks_credited.is_empty());
    assert_eq!(engine.store.read(|s| s.balances.clone()).await, before);

    // Rewinding the cursor still cannot double-credit a processed block
    engine
        .store
        .transact(|s| {
            s.cursor.last_processed_height = None;
            Ok::<_, dmpool::store::StoreError>(())
        })
        .await
        .unwrap();
    let report = engine.distributor.run_once().await.unwrap();
    assert!(report.blocks_credited.is_empty());
    assert_eq!(engine.store.read(|s| s.balances.clone()).await, before);
}

#[tokio::test]
async fn test_crash_between_crediting_and_marking_processed() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(FakeNode::new());
    let shares = Arc::new(MemoryShareStore::new());

    let block_time = Utc::now() - TimeDelta::hours(1);
    add_share(&shares, MINER_ADDRESSES[0], 3, block_time - TimeDelta::minutes(5)).await;
    add_share(&shares, MINER_ADDRESSES[1], 1, block_time - TimeDelta::minutes(5)).await;
    let height = mine_matured_pool_block(&node, block_time);

    // 618_750_000 distributable after the 1% fee, split 3:1
    let first_credit = 464_062_500;
    {
        let engine = Engine::open(dir.path(), node.clone(), shares.clone()).await;
        engine
            .store
            .transact(|s| {
                s.apply_block_credit(height, MINER_ADDRESSES[0], first_credit, Utc::now())?;
                Ok::<_, dmpool::error::LedgerError>(())
            })
            .await
            .unwrap();
    }

    let engine = Engine::open(dir.path(), node.clone(), shares.clone()).await;
    let (processed_blocks, cursor) = engine
        .store
        .read(|s| (s.blocks.len(), s.cursor.last_processed_height))
        .await;
    assert_eq!(processed_blocks, 0);
    assert_eq!(cursor, None);
    assert_eq!(engine.balance(MINER_ADDRESSES[0]).await, first_credit);

    let report = engine.distributor.run_once().await.unwrap();
    assert_eq!(report.blocks_credited, vec![height]);
    assert_eq!(engine.balance(MINER_ADDRESSES[0]).await, first_credit);
    assert_eq!(engine.balance(MINER_ADDRESSES[1]).await, 154_687_500);

    let engine = Engine::open(dir.path(), node, shares).await;
    let report = engine.distributor.run_once().await.unwrap();
    assert!(report.blocks_credited.is_empty());
    assert_eq!(engine.balance(MINER_ADDRESSES[0]).await, first_credit);
}

#[tokio::test]
async fn test_lost_broadcast_reconciled_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(FakeNode::new());
    let shares = Arc::new(MemoryShareStore::new());

    let block_time = Utc::now() - TimeDelta::hours(1);
    add_share(&shares, MINER_ADDRESSES[0], 1, block_time - TimeDelta::minutes(5)).await;
    mine_matured_pool_block(&node, block_time);
    node.fund_wallet(Amount::from_sat(1_000_000_000));

    let payout_id = {
        let engine = Engine::open(dir.path(), node.clone(), shares.clone()).await;
        engine.distributor.run_once().await.unwrap();

        // The node takes the transaction but the response never arrives
        node.set_send_behavior(SendBehavior::AcceptThenTimeout);
        let balance = engine.balance(MINER_ADDRESSES[0]).await;
        let payout = engine
            .payouts
            .create_payout(MINER_ADDRESSES[0], balance)
            .await
            .unwrap();
        let err = engine.payouts.broadcast(payout.id).await.unwrap_err();
        assert!(matches!(err, PayoutError::BroadcastUnknown { .. }));
        payout.id
    };
    assert_eq!(node.send_calls(), 1);

    node.set_send_behavior(SendBehavior::Accept);
    let engine = Engine::open(dir.path(), node.clone(), shares).await;
    let pending = engine.payouts.get_payout(payout_id).await.unwrap();
    assert_eq!(pending.status, PayoutStatus::Pending);
    assert!(pending.txid.is_some());

    let report = engine.payouts.reconcile_pending().await;
    assert_eq!(report.reconciled, 1);
    assert_eq!(node.send_calls(), 1);

    let payout = engine.payouts.get_payout(payout_id).await.unwrap();
    assert_eq!(payout.status, PayoutStatus::Broadcast);
    assert_eq!(payout.txid, pending.txid);
    assert_eq!(engine.balance(MINER_ADDRESSES[0]).await, 0);

    // Nothing left for a scheduled run to pay
    let run = engine.payouts.run_payouts().await;
    assert_eq!(run.created, 0);
    assert_eq!(node.send_calls(), 1);
}
