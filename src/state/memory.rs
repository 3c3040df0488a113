//! In-memory state store, used when no database is configured

use super::{StateStats, StateStore};
use crate::error::{RelayerError, RelayerResult};
use crate::events::OrderEvent;
use crate::order::Order;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStateStore {
    orders: DashMap<String, Order>,
    cursors: DashMap<String, u64>,
    events: RwLock<Vec<OrderEvent>>,
    unavailable: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as a lost database connection would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Events recorded for one order, oldest first
    pub async fn events_for(&self, order_id: &str) -> Vec<OrderEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn saved_order(&self, order_id: &str) -> Option<Order> {
        self.orders.get(order_id).map(|o| o.clone())
    }

    fn check(&self) -> RelayerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayerError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn run_migrations(&self) -> RelayerResult<()> {
        self.check()
    }

    async fn health_check(&self) -> RelayerResult<()> {
        self.check()
    }

    async fn load_orders(&self) -> RelayerResult<Vec<Order>> {
        self.check()?;
        let mut orders: Vec<Order> = self.orders.iter().map(|e| e.value().clone()).collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn save_order(&self, order: &Order) -> RelayerResult<()> {
        self.check()?;
        let stale = self
            .orders
            .get(&order.order_id)
            .map(|stored| stored.updated_at > order.updated_at)
            .unwrap_or(false);
        if !stale {
            self.orders.insert(order.order_id.clone(), order.clone());
        }
        Ok(())
    }

    async fn load_cursor(&self, chain_id: &str) -> RelayerResult<u64> {
        self.check()?;
        Ok(self.cursors.get(chain_id).map(|c| *c).unwrap_or(0))
    }

    async fn save_cursor(&self, chain_id: &str, cursor: u64) -> RelayerResult<()> {
        self.check()?;
        self.cursors.insert(chain_id.to_string(), cursor);
        Ok(())
    }

    async fn append_event(&self, event: &OrderEvent) -> RelayerResult<()> {
        self.check()?;
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn get_stats(&self) -> RelayerResult<StateStats> {
        self.check()?;
        let mut stats = StateStats::default();
        for order in self.orders.iter() {
            *stats
                .orders_by_status
                .entry(order.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        stats.events_recorded = self.events.read().await.len() as u64;
        for cursor in self.cursors.iter() {
            stats.cursors.insert(cursor.key().clone(), *cursor.value());
        }
        Ok(stats)
    }
}
