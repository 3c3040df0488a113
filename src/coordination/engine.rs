//! Main coordination engine for cross-chain swap orchestration

use super::clock::Clock;
use super::reconcile::ReconcilePolicy;
use super::vault::SecretVault;
use crate::chain::{ChainManager, ChainSide, EscrowListener, NewEscrow};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::escrow::Secret;
use crate::events::{OrderEvent, OrderEventKind};
use crate::fill::{resolver_amount, FillLedger, FillRequest};
use crate::order::{Leg, Order, OrderId, OrderStatus, RefundProgress};
use crate::state::StateStore;
use crate::store::{OrderStore, StoreStats};
use crate::tx::CommandSender;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Finality-cache entries kept per chain between cleanups
const FINALITY_CACHE_LIMIT: usize = 10_000;

/// How often caches are trimmed
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Cross-chain swap coordination engine
pub struct CoordinationEngine {
    pub(super) store: Arc<OrderStore>,
    pub(super) chains: Arc<ChainManager>,
    pub(super) sender: Arc<CommandSender>,
    pub(super) state: Arc<dyn StateStore>,
    pub(super) vault: SecretVault,
    pub(super) config: RelayerConfig,
    pub(super) clock: Arc<dyn Clock>,
    /// Distinguishes this process in logs and status across restarts
    run_id: Uuid,
    /// One per side
    listeners: Vec<Arc<EscrowListener>>,
    /// Taken by `run`
    pub(super) new_order_rx: Mutex<Option<mpsc::Receiver<NewEscrow>>>,
    shutdown: watch::Sender<bool>,
}

/// Snapshot of the engine for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub instance_id: String,
    pub run_id: String,
    pub chains: Vec<String>,
    pub cursors: BTreeMap<String, u64>,
    pub block_times: BTreeMap<String, u64>,
    pub active_orders: usize,
    pub secrets_held: usize,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub active: usize,
    pub archived: usize,
    pub pending: usize,
}

impl CoordinationEngine {
    /// Create a new coordination engine.
    ///
    /// Ingestion cursors are loaded from `state`; orders are not, see
    /// [`CoordinationEngine::restore`].
    pub async fn new(
        chains: Arc<ChainManager>,
        state: Arc<dyn StateStore>,
        config: RelayerConfig,
        clock: Arc<dyn Clock>,
    ) -> RelayerResult<Self> {
        let store = Arc::new(OrderStore::new());
        let sender = Arc::new(CommandSender::new(chains.clone(), config.gateway_timeout()));
        let (new_order_tx, new_order_rx) = mpsc::channel(config.new_order_channel_capacity);

        let mut listeners = Vec::with_capacity(2);
        for side in ChainSide::BOTH {
            let listener = EscrowListener::new(
                side,
                chains.chain_id(side)?,
                sender.clone(),
                state.clone(),
                store.clone(),
                new_order_tx.clone(),
                config.ingest_interval(),
            )
            .await?;
            listeners.push(Arc::new(listener));
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            store,
            chains,
            sender,
            state,
            vault: SecretVault::new(),
            config,
            clock,
            run_id: Uuid::new_v4(),
            listeners,
            new_order_rx: Mutex::new(Some(new_order_rx)),
            shutdown,
        })
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn config(&self) -> &RelayerConfig {
        &self.config
    }

    pub fn listener(&self, side: ChainSide) -> Option<&Arc<EscrowListener>> {
        self.listeners.iter().find(|l| l.side() == side)
    }

    /// Load persisted orders back into the store after a restart
    pub async fn restore(&self) -> RelayerResult<RestoreSummary> {
        let orders = self.state.load_orders().await?;
        let mut summary = RestoreSummary::default();

        for order in orders {
            if order.status.is_terminal() {
                summary.archived += 1;
            } else {
                summary.active += 1;
                if order.status == OrderStatus::Pending {
                    summary.pending += 1;
                }
            }
            self.store.restore(order).await;
        }

        crate::metrics::set_active_orders(self.store.active_count().await);
        info!(
            "Restored {} active ({} pending) and {} archived orders",
            summary.active, summary.pending, summary.archived
        );
        Ok(summary)
    }

    /// Main coordination loop. Returns once every task has stopped.
    pub async fn run(self: Arc<Self>) -> RelayerResult<()> {
        let new_order_rx = self.new_order_rx.lock().await.take().ok_or_else(|| {
            RelayerError::Internal("coordination engine is already running".to_string())
        })?;

        // Activations interrupted by a restart
        let pending: Vec<OrderId> = self
            .store
            .active_orders()
            .await
            .into_iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .map(|o| o.order_id)
            .collect();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for listener in &self.listeners {
            let listener = listener.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move { listener.run(shutdown).await }));
        }

        handles.push(tokio::spawn(
            self.clone().run_new_order_worker(new_order_rx, pending),
        ));

        handles.push(self.spawn_periodic("reconcile", self.config.reconcile_interval(), |engine| async move {
            engine.reconcile_once().await;
        }));

        handles.push(self.spawn_periodic("price refresh", self.config.price_refresh_interval(), |engine| async move {
            engine.refresh_prices_once().await;
        }));

        handles.push(self.spawn_periodic("timeout sweep", self.config.timeout_sweep_interval(), |engine| async move {
            engine.sweep_timeouts_once().await;
            engine.sweep_refunds_once().await;
        }));

        handles.push(self.spawn_periodic("cleanup", CLEANUP_INTERVAL, |engine| async move {
            engine.cleanup().await;
        }));

        info!("Coordination engine started (run {})", self.run_id);

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Coordination task panicked: {}", e);
            }
        }

        info!("Coordination engine stopped");
        Ok(())
    }

    /// Signal every task to finish its current unit of work and stop
    pub fn stop(&self) {
        info!("Coordination engine shutdown initiated");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => tick(engine.clone()).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("{} loop stopped", name);
        })
    }

    /// Sole consumer of the new-order channel and sole inserter into the store
    async fn run_new_order_worker(
        self: Arc<Self>,
        mut new_orders: mpsc::Receiver<NewEscrow>,
        pending: Vec<OrderId>,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_reconciliations.max(1)));
        let mut activations = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        for order_id in pending {
            self.spawn_activation(&mut activations, &permits, order_id);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                received = new_orders.recv() => match received {
                    Some(new_escrow) => match self.ingest(new_escrow).await {
                        Ok(Some(order_id)) => self.spawn_activation(&mut activations, &permits, order_id),
                        Ok(None) => {}
                        Err(e) => warn!("New escrow rejected: {}", e),
                    },
                    None => break,
                },
                Some(_) = activations.join_next(), if !activations.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        // In-flight activations run to completion
        while activations.join_next().await.is_some() {}
        debug!("new-order worker stopped");
    }

    fn spawn_activation(self: &Arc<Self>, activations: &mut JoinSet<()>, permits: &Arc<Semaphore>, order_id: OrderId) {
        let engine = self.clone();
        let permits = permits.clone();
        activations.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = engine.activate(&order_id).await {
                warn!("Activation of order {} failed: {}", order_id, e);
            }
        });
    }

    /// Trim caches that only grow
    pub async fn cleanup(&self) {
        for side in ChainSide::BOTH {
            if let Ok(finality) = self.chains.finality(side) {
                finality.cleanup_cache(FINALITY_CACHE_LIMIT);
            }
        }

        for order_id in self.vault.order_ids() {
            let live = self
                .store
                .get(&order_id)
                .await
                .map(|o| !o.status.is_terminal())
                .unwrap_or(false);
            if !live {
                self.vault.forget(&order_id);
            }
        }
    }

    // Operator and resolver operations

    /// Hand the coordinator a maker-authorised secret, as hex
    pub async fn reveal_secret(&self, order_id: &str, secret_hex: &str) -> RelayerResult<()> {
        let secret: Secret = secret_hex
            .parse()
            .map_err(|e| RelayerError::Validation(format!("secret: {}", e)))?;
        let order = self.require_order(order_id).await?;
        self.vault.reveal(&order, secret)?;
        info!("Secret accepted for order {}", order_id);
        Ok(())
    }

    /// Queue a resolver fill. Validated against the last observed
    /// remainder; the chain has the final word.
    pub async fn request_fill(&self, order_id: &str, amount: u128) -> RelayerResult<FillRequest> {
        let order = self.require_order(order_id).await?;
        let now = self.chain_time(order.direction.source_side());

        let (request, order) = self
            .store
            .update(order_id, |o| {
                if !matches!(o.status, OrderStatus::Active | OrderStatus::Matched) {
                    return Err(RelayerError::Validation(format!(
                        "order {} is {} and cannot be filled",
                        o.order_id, o.status
                    )));
                }
                if let Some(pending) = &o.pending_fill {
                    return Err(RelayerError::Validation(format!(
                        "a fill of {} is already pending",
                        pending.amount
                    )));
                }

                let ledger = match (&o.partial_fill, &o.source_escrow) {
                    (Some(ledger), _) => ledger.clone(),
                    (None, Some(escrow)) => FillLedger::from_escrow(escrow),
                    (None, None) => {
                        return Err(RelayerError::Validation(format!(
                            "order {} has no observed source escrow",
                            o.order_id
                        )))
                    }
                };
                ledger
                    .validate_fill(amount)
                    .map_err(|e| RelayerError::Validation(e.to_string()))?;

                let (price, owed) = match &o.auction {
                    Some(auction) => {
                        let price = auction.current_price(now);
                        let owed = resolver_amount(amount, price, auction.params.start_price)
                            .map_err(|e| RelayerError::Validation(e.to_string()))?;
                        (price, owed)
                    }
                    None => (0, amount),
                };

                let request = FillRequest {
                    amount,
                    price,
                    resolver_amount: owed,
                    requested_at: Utc::now(),
                };
                o.pending_fill = Some(request.clone());
                Ok(request)
            })
            .await?;

        self.persist(&order).await;
        info!(
            "Fill of {} requested on order {} at price {}",
            request.amount, order_id, request.price
        );
        Ok(request)
    }

    /// Refund the legs of an expired order. Idempotent.
    pub async fn cancel_order(&self, order_id: &str) -> RelayerResult<RefundProgress> {
        let order = self.require_order(order_id).await?;
        if order.status != OrderStatus::Expired {
            return Err(RelayerError::Validation(format!(
                "order {} is {}; only expired orders are refunded",
                order_id, order.status
            )));
        }
        self.refund_order(order_id).await
    }

    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        self.store.get(order_id).await
    }

    pub async fn active_orders(&self) -> Vec<Order> {
        self.store.active_orders().await
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }

    pub async fn status(&self) -> EngineStatus {
        let mut cursors = BTreeMap::new();
        let mut block_times = BTreeMap::new();
        for listener in &self.listeners {
            let side = listener.side();
            let Ok(chain_id) = self.chains.chain_id(side) else {
                continue;
            };
            cursors.insert(chain_id.clone(), listener.cursor().await);
            if let Some(block_time) = self.chains.last_block_time(side) {
                block_times.insert(chain_id, block_time);
            }
        }

        EngineStatus {
            instance_id: self.config.instance_id.clone(),
            run_id: self.run_id.to_string(),
            chains: self.chains.connected_chains(),
            cursors,
            block_times,
            active_orders: self.store.active_count().await,
            secrets_held: self.vault.len(),
            shutting_down: self.is_shutting_down(),
        }
    }

    // Shared helpers for the worker, reconciliation and sweeps

    pub(super) async fn require_order(&self, order_id: &str) -> RelayerResult<Order> {
        self.store
            .get(order_id)
            .await
            .ok_or_else(|| RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    /// Last block time seen on a side, falling back to the local clock
    pub(super) fn chain_time(&self, side: ChainSide) -> u64 {
        self.chains
            .last_block_time(side)
            .unwrap_or_else(|| self.clock.now())
    }

    pub(super) fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            max_retries: self.config.max_retries,
            pending_command_timeout_secs: self.config.pending_command_timeout_secs,
            relay_destination_withdraw: self.config.relay_destination_withdraw,
        }
    }

    /// Save a committed order. Persistence failures never block coordination.
    pub(super) async fn persist(&self, order: &Order) {
        if let Err(e) = self.state.save_order(order).await {
            warn!("Failed to persist order {}: {}", order.order_id, e);
        }
    }

    pub(super) async fn append_events(&self, order_id: &str, kinds: Vec<OrderEventKind>) {
        for kind in kinds {
            let event = OrderEvent::new(order_id, kind);
            crate::metrics::record_order_event(&event);
            if let OrderEventKind::StatusChanged { to, .. } = &event.kind {
                crate::metrics::record_status_transition(*to);
            }
            if event.requires_attention() {
                warn!("Order {} needs attention: {:?}", order_id, event.kind);
            }
            if let Err(e) = self.state.append_event(&event).await {
                warn!("Failed to record {} event for order {}: {}", event.name(), order_id, e);
            }
        }
    }

    /// Persist a committed order with the events that explain it
    pub(super) async fn record(&self, order: &Order, kinds: Vec<OrderEventKind>) {
        self.persist(order).await;
        self.append_events(&order.order_id, kinds).await;
        if order.status.is_terminal() {
            self.vault.forget(&order.order_id);
            for leg in [Leg::Source, Leg::Destination] {
                if let (Some(escrow_ref), Ok(finality)) =
                    (order.escrow_ref(leg), self.chains.finality(order.side(leg)))
                {
                    finality.forget(escrow_ref);
                }
            }
        }
        crate::metrics::set_active_orders(self.store.active_count().await);
    }

    /// Fail an order whose observed state broke an invariant
    pub(super) async fn quarantine(&self, order_id: &str, reason: String) {
        error!("Quarantining order {}: {}", order_id, reason);
        let result = self
            .store
            .update(order_id, |o| {
                let mut events = vec![OrderEventKind::Quarantined {
                    reason: reason.clone(),
                }];
                fail_with(o, format!("quarantined: {}", reason), &mut events)?;
                Ok(events)
            })
            .await;

        match result {
            Ok((events, order)) => self.record(&order, events).await,
            Err(e) => warn!("Could not quarantine order {}: {}", order_id, e),
        }
    }
}

/// Transition and note it in `events`
pub(super) fn move_to(
    order: &mut Order,
    next: OrderStatus,
    reason: Option<String>,
    events: &mut Vec<OrderEventKind>,
) -> RelayerResult<()> {
    let from = order.status;
    if order.transition(next)? {
        info!("Order {}: {} -> {}", order.order_id, from, next);
        if next.is_terminal() {
            order.pending_fill = None;
            order.next_attempt_at = None;
        }
        events.push(OrderEventKind::StatusChanged {
            from,
            to: next,
            reason,
        });
    }
    Ok(())
}

pub(super) fn fail_with(
    order: &mut Order,
    reason: String,
    events: &mut Vec<OrderEventKind>,
) -> RelayerResult<()> {
    let from = order.status;
    if order.fail(reason.clone())? {
        warn!("Order {}: {} -> failed: {}", order.order_id, from, reason);
        order.pending_fill = None;
        order.next_attempt_at = None;
        events.push(OrderEventKind::StatusChanged {
            from,
            to: OrderStatus::Failed,
            reason: Some(reason),
        });
    }
    Ok(())
}
