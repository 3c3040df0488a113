//! Order store - the registry of in-flight orders
//!
//! Non-terminal orders live in a hot map, each behind its own lock, so a
//! slow reconciliation of one order never blocks the others. Terminal
//! orders move to an archive and are never deleted. Order ids are the hex
//! source escrow id, which makes the store the dedup point for escrows
//! that are ingested more than once.

use crate::error::{RelayerError, RelayerResult};
use crate::order::{Order, OrderId, OrderStatus};

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Already known, with its current status
    Duplicate(OrderStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active: usize,
    pub archived: usize,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct OrderStore {
    active: RwLock<HashMap<OrderId, Arc<Mutex<Order>>>>,
    archive: RwLock<HashMap<OrderId, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new order unless one with the same id exists anywhere
    pub async fn insert(&self, order: Order) -> InsertOutcome {
        let existing = {
            let mut active = self.active.write().await;
            match active.get(&order.order_id) {
                Some(entry) => Some(entry.clone()),
                None => {
                    // Checked under the active write lock: archiving writes the
                    // archive before it removes from the hot map.
                    if let Some(archived) = self.archive.read().await.get(&order.order_id) {
                        return InsertOutcome::Duplicate(archived.status);
                    }
                    debug!("Order {} inserted as {}", order.order_id, order.status);
                    active.insert(order.order_id.clone(), Arc::new(Mutex::new(order)));
                    None
                }
            }
        };

        match existing {
            Some(entry) => InsertOutcome::Duplicate(entry.lock().await.status),
            None => InsertOutcome::Inserted,
        }
    }

    /// Put back a persisted order on restart, replacing whatever is there
    pub async fn restore(&self, order: Order) {
        let id = order.order_id.clone();
        if order.status.is_terminal() {
            self.active.write().await.remove(&id);
            self.archive.write().await.insert(id, order);
        } else {
            self.archive.write().await.remove(&id);
            self.active
                .write()
                .await
                .insert(id, Arc::new(Mutex::new(order)));
        }
    }

    pub async fn contains(&self, order_id: &str) -> bool {
        if self.active.read().await.contains_key(order_id) {
            return true;
        }
        self.archive.read().await.contains_key(order_id)
    }

    /// Copy of an order, hot or archived
    pub async fn get(&self, order_id: &str) -> Option<Order> {
        let entry = self.active.read().await.get(order_id).cloned();
        if let Some(entry) = entry {
            return Some(entry.lock().await.clone());
        }
        self.archive.read().await.get(order_id).cloned()
    }

    pub async fn active_ids(&self) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn active_orders(&self) -> Vec<Order> {
        let entries: Vec<Arc<Mutex<Order>>> =
            self.active.read().await.values().cloned().collect();
        let mut orders = Vec::with_capacity(entries.len());
        for entry in entries {
            orders.push(entry.lock().await.clone());
        }
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Mutate one active order under its lock.
    ///
    /// `f` works on a copy; nothing is committed unless it returns `Ok`. An
    /// order left terminal by `f` is moved to the archive before the lock
    /// is released. Returns `f`'s value and the committed order.
    pub async fn update<T, F>(&self, order_id: &str, f: F) -> RelayerResult<(T, Order)>
    where
        F: FnOnce(&mut Order) -> RelayerResult<T>,
    {
        let entry = self
            .active
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        let mut guard = entry.lock().await;
        // Archived between the lookup and the lock
        if guard.status.is_terminal() {
            return Err(RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            });
        }

        let mut working = guard.clone();
        let value = f(&mut working)?;
        working.updated_at = Utc::now();
        *guard = working.clone();

        if working.status.is_terminal() {
            self.archive
                .write()
                .await
                .insert(order_id.to_string(), working.clone());
            self.active.write().await.remove(order_id);
            debug!("Order {} archived as {}", order_id, working.status);
        }

        Ok((value, working))
    }

    /// Move `expected -> next` only if the order is still at `expected`
    pub async fn compare_and_swap_status(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> RelayerResult<Order> {
        let ((), order) = self
            .update(order_id, |order| {
                if order.status != expected {
                    return Err(RelayerError::StaleStatus {
                        order_id: order.order_id.clone(),
                        expected,
                        actual: order.status,
                    });
                }
                order.transition(next)?;
                Ok(())
            })
            .await?;
        Ok(order)
    }

    /// Mutate bookkeeping on an archived order. Status must not change.
    pub async fn update_archived<T, F>(&self, order_id: &str, f: F) -> RelayerResult<(T, Order)>
    where
        F: FnOnce(&mut Order) -> RelayerResult<T>,
    {
        let mut archive = self.archive.write().await;
        let stored = archive
            .get_mut(order_id)
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;

        let mut working = stored.clone();
        let value = f(&mut working)?;
        if working.status != stored.status {
            return Err(RelayerError::InvalidStateTransition {
                from: stored.status,
                to: working.status,
            });
        }
        working.updated_at = Utc::now();
        *stored = working.clone();
        Ok((value, working))
    }

    /// Expired orders whose legs are not all refunded yet
    pub async fn refund_candidates(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .archive
            .read()
            .await
            .values()
            .filter(|o| o.status == OrderStatus::Expired && !o.refund.is_complete())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    /// Count orders by status across the hot map and the archive
    pub async fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for status in OrderStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }

        for order in self.active_orders().await {
            stats.active += 1;
            *stats
                .by_status
                .entry(order.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        let archive = self.archive.read().await;
        stats.archived = archive.len();
        for order in archive.values() {
            *stats
                .by_status
                .entry(order.status.as_str().to_string())
                .or_insert(0) += 1;
        }

        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::{ChainSide, EscrowSnapshot};
    use crate::escrow::{hash_secret, Escrow, EscrowId, EscrowParams, Secret};
    use crate::order::{AssetInfo, SwapTerms};

    pub(crate) fn sample_order(seed: u8) -> Order {
        let mut escrow = Escrow::new(EscrowParams {
            id: EscrowId([seed; 32]),
            maker: "maker".into(),
            taker: None,
            secret_hash: hash_secret(&Secret([7u8; 32])),
            timelock: 10_000,
            expected_amount: 100,
            allow_partial_fill: true,
            minimum_fill_amount: 10,
            counterparty_chain_id: Some("chain-b".into()),
        })
        .unwrap();
        escrow.fund(100).unwrap();
        let snapshot = EscrowSnapshot {
            chain_id: "chain-a".into(),
            escrow_ref: escrow.id.to_hex(),
            escrow,
            confirmations: 5,
            terms: Some(SwapTerms {
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
                auction: None,
                expires_at: 5_000,
            }),
        };
        Order::from_source_snapshot(&snapshot, ChainSide::A, "chain-b").unwrap()
    }

    #[tokio::test]
    async fn test_insert_dedups_by_escrow_id() {
        let store = OrderStore::new();
        let order = sample_order(1);
        assert_eq!(store.insert(order.clone()).await, InsertOutcome::Inserted);
        assert_eq!(
            store.insert(order).await,
            InsertOutcome::Duplicate(OrderStatus::Pending)
        );
        assert_eq!(store.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_update_commits_nothing() {
        let store = OrderStore::new();
        let order = sample_order(1);
        let id = order.order_id.clone();
        store.insert(order).await;

        let result: RelayerResult<((), Order)> = store
            .update(&id, |o| {
                o.retry_count = 9;
                Err(RelayerError::Internal("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(&id).await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_terminal_orders_move_to_archive() {
        let store = OrderStore::new();
        let order = sample_order(1);
        let id = order.order_id.clone();
        store.insert(order.clone()).await;

        store
            .compare_and_swap_status(&id, OrderStatus::Pending, OrderStatus::Failed)
            .await
            .unwrap();
        assert!(store.active_ids().await.is_empty());
        assert_eq!(store.get(&id).await.unwrap().status, OrderStatus::Failed);
        assert_eq!(
            store.insert(order).await,
            InsertOutcome::Duplicate(OrderStatus::Failed)
        );
        assert!(store.update(&id, |_| Ok(())).await.is_err());

        let stats = store.stats().await;
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.by_status["failed"], 1);
        assert_eq!(stats.by_status["pending"], 0);
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_one_winner() {
        let store = Arc::new(OrderStore::new());
        let order = sample_order(3);
        let id = order.order_id.clone();
        store.insert(order).await;
        store
            .compare_and_swap_status(&id, OrderStatus::Pending, OrderStatus::Active)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = id.clone();
            let next = if i % 2 == 0 {
                OrderStatus::Matched
            } else {
                OrderStatus::Expired
            };
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap_status(&id, OrderStatus::Active, next)
                    .await
                    .is_ok()
            }));
        }

        let wins = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_refund_candidates_and_archived_updates() {
        let store = OrderStore::new();
        let mut order = sample_order(4);
        order.status = OrderStatus::Expired;
        let id = order.order_id.clone();
        store.restore(order).await;
        assert_eq!(store.refund_candidates().await.len(), 1);

        store
            .update_archived(&id, |o| {
                o.refund.source_done = true;
                o.refund.destination_done = true;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.refund_candidates().await.is_empty());

        let changed = store
            .update_archived(&id, |o| {
                o.status = OrderStatus::Completed;
                Ok(())
            })
            .await;
        assert!(changed.is_err());
    }
}
