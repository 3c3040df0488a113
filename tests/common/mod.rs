//! Shared fixtures: two simulated ledgers, an in-memory state store and a
//! manual clock wired into one engine

#![allow(dead_code)]

use htlc_swap_relayer::auction::AuctionParams;
use htlc_swap_relayer::chain::{ChainHandle, ChainManager, ChainSide, OpenSwap, SimulatedLedger};
use htlc_swap_relayer::config::RelayerConfig;
use htlc_swap_relayer::coordination::{CoordinationEngine, ManualClock};
use htlc_swap_relayer::escrow::{hash_secret, Secret};
use htlc_swap_relayer::order::{AssetInfo, Order, OrderStatus, SwapTerms};
use htlc_swap_relayer::state::MemoryStateStore;

use std::sync::Arc;

pub const START: u64 = 1_000;
pub const SOURCE_TIMELOCK: u64 = 10_000;
pub const EXPIRES_AT: u64 = 5_000;
pub const SECRET: Secret = Secret([42u8; 32]);

pub struct Harness {
    pub engine: Arc<CoordinationEngine>,
    pub source: Arc<SimulatedLedger>,
    pub destination: Arc<SimulatedLedger>,
    pub state: Arc<MemoryStateStore>,
    pub clock: Arc<ManualClock>,
}

pub fn test_config() -> RelayerConfig {
    RelayerConfig {
        retry_delay_ms: 1,
        max_retry_delay_ms: 10,
        gateway_timeout_ms: 1_000,
        ..RelayerConfig::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: RelayerConfig) -> Self {
        let source = Arc::new(SimulatedLedger::new("chain-a", START));
        let destination = Arc::new(SimulatedLedger::new("chain-b", START).with_auto_fund(true));
        Self::from_parts(source, destination, Arc::new(MemoryStateStore::new()), config).await
    }

    /// A fresh engine over existing ledgers and state, as after a restart
    pub async fn from_parts(
        source: Arc<SimulatedLedger>,
        destination: Arc<SimulatedLedger>,
        state: Arc<MemoryStateStore>,
        config: RelayerConfig,
    ) -> Self {
        let chains = ChainManager::new(
            ChainHandle::new(ChainSide::A, "alpha", source.clone(), 0),
            ChainHandle::new(ChainSide::B, "beta", destination.clone(), 0),
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let engine = CoordinationEngine::new(Arc::new(chains), state.clone(), config, clock.clone())
            .await
            .unwrap();

        Self {
            engine: Arc::new(engine),
            source,
            destination,
            state,
            clock,
        }
    }

    /// Open a maker escrow on the source ledger. Returns the order id.
    pub async fn open(&self, salt: &str, partial: bool, auction: Option<AuctionParams>) -> String {
        self.source.open_swap(swap(salt, partial, auction)).await.unwrap()
    }

    /// Ingest and activate, then link the source leg to its counterpart
    /// the way the escrow factory does
    pub async fn open_active(&self, salt: &str, partial: bool, auction: Option<AuctionParams>) -> String {
        let order_id = self.open(salt, partial, auction).await;
        let statuses = self.engine.ingest_once().await.unwrap();
        assert_eq!(statuses, vec![OrderStatus::Active]);

        let order = self.order(&order_id).await;
        let destination_ref = order.destination_escrow_ref.clone().unwrap();
        self.source.confirm_source(&order_id, &destination_ref).await.unwrap();
        order_id
    }

    pub async fn order(&self, order_id: &str) -> Order {
        self.engine.get_order(order_id).await.unwrap()
    }

    /// Reconcile until the order reaches `status`, at most `ticks` times
    pub async fn drive_to(&self, order_id: &str, status: OrderStatus, ticks: usize) -> Order {
        for _ in 0..ticks {
            let order = self.order(order_id).await;
            if order.status == status {
                return order;
            }
            self.engine.reconcile_once().await;
        }
        let order = self.order(order_id).await;
        assert_eq!(order.status, status, "order stuck: {:?}", order.last_error);
        order
    }
}

/// 100 CRO on chain-a for 50 ETH on chain-b
pub fn swap(salt: &str, partial: bool, auction: Option<AuctionParams>) -> OpenSwap {
    OpenSwap {
        maker: "maker".into(),
        taker: None,
        secret_hash: hash_secret(&SECRET),
        timelock: SOURCE_TIMELOCK,
        allow_partial_fill: partial,
        minimum_fill_amount: if partial { 10 } else { 0 },
        counterparty_chain_id: "chain-b".into(),
        terms: SwapTerms {
            source_asset: AssetInfo {
                symbol: "CRO".into(),
                address: "basecro".into(),
                amount: 100,
                decimals: 8,
            },
            destination_asset: AssetInfo {
                symbol: "ETH".into(),
                address: "0x0".into(),
                amount: 50,
                decimals: 18,
            },
            auction,
            expires_at: EXPIRES_AT,
        },
        salt: salt.into(),
    }
}

pub fn auction() -> AuctionParams {
    AuctionParams {
        start_price: 1_000,
        end_price: 500,
        start_time: START,
        duration: 1_000,
    }
}
