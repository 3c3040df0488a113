//! Expiry, refunds, retries and rejected deployments

mod common;

use common::{Harness, EXPIRES_AT, SECRET, SOURCE_TIMELOCK, START};
use htlc_swap_relayer::chain::{
    ChainHandle, ChainManager, ChainSide, DeployParams, EscrowBatch, EscrowSnapshot, GatewayError,
    LedgerGateway, NewEscrow, SimulatedLedger, TxRef,
};
use htlc_swap_relayer::coordination::{CoordinationEngine, ManualClock};
use htlc_swap_relayer::escrow::{EscrowError, EscrowStatus, Secret};
use htlc_swap_relayer::events::OrderEventKind;
use htlc_swap_relayer::order::OrderStatus;
use htlc_swap_relayer::state::MemoryStateStore;

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

mock! {
    pub Gateway {}

    #[async_trait]
    impl LedgerGateway for Gateway {
        fn chain_id(&self) -> String;
        async fn fetch_new_escrows(&self, since: u64) -> Result<EscrowBatch, GatewayError>;
        async fn get_escrow_state(&self, escrow_ref: &str) -> Result<EscrowSnapshot, GatewayError>;
        async fn deploy_destination_escrow(&self, params: &DeployParams) -> Result<String, GatewayError>;
        async fn withdraw(&self, escrow_ref: &str, secret: &Secret) -> Result<TxRef, GatewayError>;
        async fn partial_withdraw(
            &self,
            escrow_ref: &str,
            secret: &Secret,
            amount: u128,
        ) -> Result<TxRef, GatewayError>;
        async fn cancel(&self, escrow_ref: &str) -> Result<TxRef, GatewayError>;
        async fn current_block_time(&self) -> Result<u64, GatewayError>;
    }
}

#[tokio::test]
async fn test_expired_order_refunds_both_legs_once() {
    let h = Harness::new().await;
    let order_id = h.open_active("expire", false, None).await;
    h.drive_to(&order_id, OrderStatus::Matched, 3).await;

    assert!(h.engine.sweep_timeouts_once().await.is_empty());
    h.clock.set(EXPIRES_AT);
    assert_eq!(h.engine.sweep_timeouts_once().await, vec![order_id.clone()]);
    assert_eq!(h.order(&order_id).await.status, OrderStatus::Expired);

    // Neither timelock has passed on chain yet
    let progress = h.engine.cancel_order(&order_id).await.unwrap();
    assert!(!progress.source_done && !progress.destination_done);

    let destination_ref = h.order(&order_id).await.destination_escrow_ref.unwrap();
    let destination_timelock = h.destination.escrow(&destination_ref).await.unwrap().timelock;
    h.destination.set_block_time(destination_timelock).await;

    // Sweeps refund what they can; the source leg still waits
    assert_eq!(h.engine.sweep_refunds_once().await, 0);
    let order = h.order(&order_id).await;
    assert!(order.refund.destination_done && !order.refund.source_done);

    h.source.set_block_time(SOURCE_TIMELOCK).await;
    let progress = h.engine.cancel_order(&order_id).await.unwrap();
    assert!(progress.is_complete());

    // Again: nothing left to do, nothing sent
    let again = h.engine.cancel_order(&order_id).await.unwrap();
    assert_eq!(again, progress);
    assert_eq!(h.engine.sweep_refunds_once().await, 0);

    assert_eq!(h.source.escrow(&order_id).await.unwrap().status, EscrowStatus::Cancelled);
    assert_eq!(
        h.destination.escrow(&destination_ref).await.unwrap().status,
        EscrowStatus::Cancelled
    );

    let order = h.order(&order_id).await;
    assert_eq!(order.status, OrderStatus::Expired);
    let refunds = h
        .state
        .events_for(&order_id)
        .await
        .into_iter()
        .filter(|e| matches!(e.kind, OrderEventKind::Refunded { .. }))
        .count();
    assert_eq!(refunds, 2);
}

#[tokio::test]
async fn test_unmatched_order_expires_and_cancel_is_idempotent() {
    let h = Harness::new().await;
    let order_id = h.open("unmatched", false, None).await;
    assert_eq!(h.engine.ingest_once().await.unwrap(), vec![OrderStatus::Active]);
    // The source leg is never linked, so the order cannot match
    h.engine.reconcile_once().await;
    assert_eq!(h.order(&order_id).await.status, OrderStatus::Active);

    h.clock.set(EXPIRES_AT);
    assert_eq!(h.engine.sweep_timeouts_once().await, vec![order_id.clone()]);
    let order = h.order(&order_id).await;
    assert_eq!(order.status, OrderStatus::Expired);

    let destination_ref = order.destination_escrow_ref.unwrap();
    let destination_timelock = h.destination.escrow(&destination_ref).await.unwrap().timelock;
    h.destination.set_block_time(destination_timelock).await;
    h.source.set_block_time(SOURCE_TIMELOCK).await;

    let first = h.engine.cancel_order(&order_id).await.unwrap();
    assert!(first.is_complete());
    let second = h.engine.cancel_order(&order_id).await.unwrap();
    assert_eq!(first, second);

    assert_eq!(h.source.escrow(&order_id).await.unwrap().status, EscrowStatus::Cancelled);
    assert_eq!(
        h.destination.escrow(&destination_ref).await.unwrap().status,
        EscrowStatus::Cancelled
    );
    assert_eq!(h.order(&order_id).await.status, OrderStatus::Expired);
}

#[tokio::test]
async fn test_lasting_source_rollback_fails_order_with_reason() {
    let h = Harness::new().await;
    let order_id = h.open_active("rollback", false, None).await;
    h.drive_to(&order_id, OrderStatus::Matched, 3).await;
    let before_claim = h.source.escrow(&order_id).await.unwrap();

    h.engine.reveal_secret(&order_id, &SECRET.to_hex()).await.unwrap();
    // Claim, then observe it
    h.engine.reconcile_once().await;
    h.engine.reconcile_once().await;
    let order = h.order(&order_id).await;
    assert_eq!(order.status, OrderStatus::Matched);
    assert_eq!(order.total_filled(), 100);

    h.source.reorg(&order_id, before_claim).await.unwrap();
    h.engine.reconcile_once().await;
    assert_eq!(h.order(&order_id).await.status, OrderStatus::Matched);

    // The rolled back state is now canonical and contradicts the recorded fill
    let order = h.drive_to(&order_id, OrderStatus::Failed, 3).await;
    assert!(order.last_error.unwrap().contains("below the 100 already recorded"));
    for _ in 0..5 {
        h.engine.reconcile_once().await;
    }

    let reorgs = h
        .state
        .events_for(&order_id)
        .await
        .into_iter()
        .filter(|e| matches!(e.kind, OrderEventKind::ReorgDetected { .. }))
        .count();
    assert_eq!(reorgs, 1);
}

#[tokio::test]
async fn test_claimed_orders_do_not_expire() {
    let h = Harness::new().await;
    let order_id = h.open_active("claimed", false, None).await;
    h.drive_to(&order_id, OrderStatus::Matched, 3).await;

    h.engine.reveal_secret(&order_id, &SECRET.to_hex()).await.unwrap();
    // Sends the source claim
    h.engine.reconcile_once().await;
    assert!(h.order(&order_id).await.reveal_started());

    h.clock.set(EXPIRES_AT + 1);
    assert!(h.engine.sweep_timeouts_once().await.is_empty());
    h.drive_to(&order_id, OrderStatus::Completed, 6).await;
}

#[tokio::test]
async fn test_only_expired_orders_can_be_cancelled() {
    let h = Harness::new().await;
    let order_id = h.open_active("early", false, None).await;
    assert_err!(h.engine.cancel_order(&order_id).await);
    assert_err!(h.engine.cancel_order("unknown").await);
    // Still live, so the maker can authorise the reveal
    assert_ok!(h.engine.reveal_secret(&order_id, &SECRET.to_hex()).await);
}

#[tokio::test]
async fn test_order_expired_before_activation_fails() {
    let h = Harness::new().await;
    h.open("late", false, None).await;
    h.clock.set(EXPIRES_AT);

    assert_eq!(h.engine.ingest_once().await.unwrap(), vec![OrderStatus::Failed]);
    assert_eq!(h.destination.escrow_count().await, 0);
}

#[tokio::test]
async fn test_transient_deploy_failures_exhaust_retries() {
    let h = Harness::new().await;
    let order_id = h.open("flaky", false, None).await;
    let snapshot = h.source.get_escrow_state(&order_id).await.unwrap();

    let attempts = h.engine.config().max_retries + 1;
    for _ in 0..attempts {
        h.destination
            .inject_fault(GatewayError::Unavailable("maintenance".into()))
            .await;
    }

    let status = h
        .engine
        .process_new_order(NewEscrow {
            side: ChainSide::A,
            snapshot,
        })
        .await
        .unwrap();
    assert_eq!(status, Some(OrderStatus::Failed));

    let order = h.order(&order_id).await;
    assert_eq!(order.retry_count, attempts);
    assert!(order.last_error.unwrap().contains("maintenance"));
    assert_eq!(h.destination.escrow_count().await, 0);

    let failures = h
        .state
        .events_for(&order_id)
        .await
        .into_iter()
        .filter(|e| matches!(e.kind, OrderEventKind::CommandFailed { .. }))
        .count();
    assert_eq!(failures as u32, attempts);
}

#[tokio::test]
async fn test_transient_deploy_failure_recovers() {
    let h = Harness::new().await;
    let order_id = h.open("blip", false, None).await;
    h.destination
        .inject_fault(GatewayError::Timeout(std::time::Duration::from_secs(1)))
        .await;
    let snapshot = h.source.get_escrow_state(&order_id).await.unwrap();

    let status = h
        .engine
        .process_new_order(NewEscrow {
            side: ChainSide::A,
            snapshot,
        })
        .await
        .unwrap();
    assert_eq!(status, Some(OrderStatus::Active));

    let order = h.order(&order_id).await;
    assert_eq!(order.retry_count, 0);
    assert!(order.last_error.is_none());
}

#[tokio::test]
async fn test_rejected_deployment_is_not_retried() {
    let source = Arc::new(SimulatedLedger::new("chain-a", START));

    let mut destination = MockGateway::new();
    destination
        .expect_chain_id()
        .returning(|| "chain-b".to_string());
    destination
        .expect_get_escrow_state()
        .returning(|escrow_ref| Err(GatewayError::NotFound(escrow_ref.to_string())));
    destination
        .expect_deploy_destination_escrow()
        .times(1)
        .returning(|_| Err(GatewayError::Rejected(EscrowError::InvalidAmount("zero".into()))));

    let chains = ChainManager::new(
        ChainHandle::new(ChainSide::A, "alpha", source.clone(), 0),
        ChainHandle::new(ChainSide::B, "beta", Arc::new(destination), 0),
    )
    .unwrap();
    let engine = CoordinationEngine::new(
        Arc::new(chains),
        Arc::new(MemoryStateStore::new()),
        common::test_config(),
        Arc::new(ManualClock::new(START)),
    )
    .await
    .unwrap();

    let order_id = source.open_swap(common::swap("rejected", false, None)).await.unwrap();
    let snapshot = source.get_escrow_state(&order_id).await.unwrap();

    let status = engine
        .process_new_order(NewEscrow {
            side: ChainSide::A,
            snapshot,
        })
        .await
        .unwrap();
    assert_eq!(status, Some(OrderStatus::Failed));

    let order = engine.get_order(&order_id).await.unwrap();
    assert!(order.last_error.unwrap().contains("zero"));
    assert!(engine.active_orders().await.is_empty());
}

#[tokio::test]
async fn test_escrow_for_another_chain_is_rejected() {
    let h = Harness::new().await;
    let order_id = h.open("elsewhere", false, None).await;
    let mut snapshot = h.source.get_escrow_state(&order_id).await.unwrap();
    snapshot.escrow.counterparty_chain_id = Some("chain-z".into());

    let result = h
        .engine
        .ingest(NewEscrow {
            side: ChainSide::A,
            snapshot,
        })
        .await;
    assert!(result.is_err());
    assert!(h.engine.get_order(&order_id).await.is_none());
}

#[tokio::test]
async fn test_state_outage_does_not_stop_reconciliation() {
    let h = Harness::new().await;
    let order_id = h.open_active("outage", false, None).await;

    h.state.set_unavailable(true);
    h.drive_to(&order_id, OrderStatus::Matched, 3).await;
    h.state.set_unavailable(false);

    // The next successful save carries the newer copy
    h.engine.reveal_secret(&order_id, &SECRET.to_hex()).await.unwrap();
    h.drive_to(&order_id, OrderStatus::Completed, 8).await;
    let stats = htlc_swap_relayer::state::StateStore::get_stats(h.state.as_ref())
        .await
        .unwrap();
    assert_eq!(stats.orders_by_status.get("completed"), Some(&1));
}
