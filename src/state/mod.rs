//! State persistence
//!
//! Handles:
//! - Order snapshots for restart recovery
//! - Ingestion cursors per chain
//! - The order event trail
//!
//! The secret vault is never persisted. A secret reaches storage only as
//! part of an order, after its source withdraw was observed on chain.

mod manager;
mod memory;

pub use manager::PgStateStore;
pub use memory::MemoryStateStore;

use crate::error::RelayerResult;
use crate::events::OrderEvent;
use crate::order::Order;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Persisted statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub orders_by_status: BTreeMap<String, u64>,
    pub events_recorded: u64,
    pub cursors: BTreeMap<String, u64>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn run_migrations(&self) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()>;

    /// Every persisted order, terminal ones included
    async fn load_orders(&self) -> RelayerResult<Vec<Order>>;

    /// Upsert by order id. A copy older than the stored one is ignored.
    async fn save_order(&self, order: &Order) -> RelayerResult<()>;

    /// Ingestion cursor for a chain, zero if never saved
    async fn load_cursor(&self, chain_id: &str) -> RelayerResult<u64>;

    async fn save_cursor(&self, chain_id: &str, cursor: u64) -> RelayerResult<()>;

    async fn append_event(&self, event: &OrderEvent) -> RelayerResult<()>;

    async fn get_stats(&self) -> RelayerResult<StateStats>;
}
