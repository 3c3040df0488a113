//! New-order worker: turns maker escrows into active orders
//!
//! Ingestion inserts a pending order keyed by the source escrow id.
//! Activation then deploys the destination escrow, or adopts one that a
//! previous attempt already put on chain, and moves the order to `Active`.

use super::engine::{fail_with, move_to, CoordinationEngine};
use crate::chain::{ChainSide, DeployParams, GatewayError, NewEscrow};
use crate::error::{RelayerError, RelayerResult};
use crate::escrow::EscrowStatus;
use crate::events::OrderEventKind;
use crate::order::{CommandKind, Leg, Order, OrderId, OrderStatus};
use crate::store::InsertOutcome;
use crate::tx::retry_transient;

use tracing::{debug, info, warn};

impl CoordinationEngine {
    /// Register a discovered maker escrow as a pending order.
    ///
    /// Returns the order id when the order is new and still needs
    /// activation, `None` when the escrow was already known.
    pub async fn ingest(&self, new_escrow: NewEscrow) -> RelayerResult<Option<OrderId>> {
        let NewEscrow { side, snapshot } = new_escrow;
        let destination_chain_id = self.chains.chain_id(side.other())?;
        let escrow = &snapshot.escrow;

        if escrow.counterparty_chain_id.as_deref() != Some(destination_chain_id.as_str()) {
            return Err(RelayerError::Validation(format!(
                "escrow {} targets chain {:?}, not {}",
                snapshot.escrow_ref, escrow.counterparty_chain_id, destination_chain_id
            )));
        }
        if !matches!(
            escrow.status,
            EscrowStatus::Funded | EscrowStatus::SourceConfirmed
        ) {
            return Err(RelayerError::Validation(format!(
                "escrow {} is {}, not open for a swap",
                snapshot.escrow_ref,
                escrow.status.as_str()
            )));
        }

        let order = Order::from_source_snapshot(&snapshot, side, &destination_chain_id)?;
        let order_id = order.order_id.clone();

        match self.store.insert(order.clone()).await {
            InsertOutcome::Inserted => {
                info!(
                    "Order {} ingested from chain {}: {} {} for {} {}",
                    order_id,
                    snapshot.chain_id,
                    order.source_asset.amount,
                    order.source_asset.symbol,
                    order.destination_asset.amount,
                    order.destination_asset.symbol
                );
                self.record(
                    &order,
                    vec![OrderEventKind::Ingested {
                        chain_id: snapshot.chain_id.clone(),
                        escrow_ref: snapshot.escrow_ref.clone(),
                    }],
                )
                .await;
                Ok(Some(order_id))
            }
            InsertOutcome::Duplicate(status) => {
                debug!("Escrow {} already tracked as {} order", snapshot.escrow_ref, status);
                Ok(None)
            }
        }
    }

    /// Ingest one escrow and, if it is new, activate it in place
    pub async fn process_new_order(&self, new_escrow: NewEscrow) -> RelayerResult<Option<OrderStatus>> {
        match self.ingest(new_escrow).await? {
            Some(order_id) => self.activate(&order_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Poll both listeners once and activate whatever they found.
    ///
    /// Only for callers that do not run the engine loop; with `run` active
    /// the worker owns the channel.
    pub async fn ingest_once(&self) -> RelayerResult<Vec<OrderStatus>> {
        let mut receiver = self.new_order_rx.lock().await;
        let receiver = receiver.as_mut().ok_or_else(|| {
            RelayerError::Internal("new-order channel is owned by the running engine".to_string())
        })?;

        for side in ChainSide::BOTH {
            if let Some(listener) = self.listener(side) {
                listener.poll_once().await?;
            }
        }

        let mut statuses = Vec::new();
        while let Ok(new_escrow) = receiver.try_recv() {
            match self.process_new_order(new_escrow).await {
                Ok(Some(status)) => statuses.push(status),
                Ok(None) => {}
                Err(e) => warn!("New escrow rejected: {}", e),
            }
        }
        Ok(statuses)
    }

    /// Deploy or adopt the destination escrow of a pending order
    pub async fn activate(&self, order_id: &str) -> RelayerResult<OrderStatus> {
        let order = self.require_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Ok(order.status);
        }

        if order.expires_at <= self.clock.now() {
            return self
                .fail_pending(order_id, "expired before activation".to_string())
                .await;
        }

        let params = match self.deploy_params(&order) {
            Ok(params) => params,
            Err(e) => return self.fail_pending(order_id, e.to_string()).await,
        };
        let side = order.direction.destination_side();
        let attempts = self.config.max_retries.saturating_add(1);

        let deployed = retry_transient(
            |attempt| self.deploy_attempt(order_id, side, &params, attempt),
            attempts,
            self.config.retry_delay(),
            self.config.max_retry_delay(),
        )
        .await;

        let (escrow_ref, adopted) = match deployed {
            Ok(deployed) => deployed,
            Err(e) if e.is_retryable() => {
                return self
                    .fail_pending(
                        order_id,
                        format!("destination deployment failed after {} attempts: {}", attempts, e),
                    )
                    .await
            }
            Err(e) => {
                return self
                    .fail_pending(order_id, format!("destination deployment failed: {}", e))
                    .await
            }
        };

        let (events, order) = self
            .store
            .update(order_id, |o| {
                let mut events = vec![OrderEventKind::DestinationDeployed {
                    escrow_ref: escrow_ref.clone(),
                    adopted,
                }];
                o.destination_escrow_ref = Some(escrow_ref.clone());
                o.retry_count = 0;
                o.last_error = None;
                move_to(o, OrderStatus::Active, None, &mut events)?;
                Ok(events)
            })
            .await?;
        self.record(&order, events).await;
        Ok(order.status)
    }

    /// Destination leg terms: same hashlock, shorter timelock, destination amount
    pub(super) fn deploy_params(&self, order: &Order) -> RelayerResult<DeployParams> {
        let margin = self.config.destination_timelock_margin_secs;
        let timelock = order
            .timelock
            .checked_sub(margin)
            .filter(|t| *t > 0)
            .ok_or_else(|| {
                RelayerError::Validation(format!(
                    "source timelock {} leaves no room for a {}s destination margin",
                    order.timelock, margin
                ))
            })?;

        let destination_side = order.direction.destination_side();
        if let Some(now) = self.chains.last_block_time(destination_side) {
            if timelock <= now {
                return Err(RelayerError::Validation(format!(
                    "destination timelock {} is already past on chain {}",
                    timelock, order.destination_chain_id
                )));
            }
        }

        let counterparty_escrow_ref = order.source_escrow_ref.clone().ok_or_else(|| {
            RelayerError::Validation(format!("order {} has no source escrow", order.order_id))
        })?;

        Ok(DeployParams {
            order_id: order.order_id.clone(),
            maker: order.maker.clone(),
            taker: order.taker.clone(),
            secret_hash: order.secret_hash,
            timelock,
            expected_amount: order.destination_asset.amount,
            allow_partial_fill: order.is_partial(),
            // Shares of partial source fills may be arbitrarily small
            minimum_fill_amount: 0,
            counterparty_chain_id: order.source_chain_id.clone(),
            counterparty_escrow_ref,
        })
    }

    async fn deploy_attempt(
        &self,
        order_id: &str,
        side: ChainSide,
        params: &DeployParams,
        attempt: u32,
    ) -> RelayerResult<(String, bool)> {
        match self.deploy_or_adopt(side, params).await {
            Ok(deployed) => Ok(deployed),
            Err(e) => {
                let error = e.to_string();
                let updated = self
                    .store
                    .update(order_id, |o| {
                        o.retry_count = attempt;
                        o.last_error = Some(error.clone());
                        Ok(vec![OrderEventKind::CommandFailed {
                            leg: Leg::Destination,
                            kind: CommandKind::DeployDestination,
                            error: error.clone(),
                            retry_count: attempt,
                        }])
                    })
                    .await;
                if let Ok((events, order)) = updated {
                    self.record(&order, events).await;
                }
                Err(e)
            }
        }
    }

    /// A destination escrow that already exists for this order is adopted
    /// instead of deployed twice
    async fn deploy_or_adopt(&self, side: ChainSide, params: &DeployParams) -> RelayerResult<(String, bool)> {
        let predicted = params.predicted_escrow_id().to_hex();

        match self.sender.escrow_state(side, &predicted).await {
            Ok(existing) => {
                if existing.escrow.secret_hash != params.secret_hash {
                    return Err(RelayerError::InvariantViolation {
                        order_id: params.order_id.clone(),
                        reason: format!("escrow {} exists with a different hashlock", predicted),
                    });
                }
                info!(
                    "Adopting destination escrow {} already on chain for order {}",
                    existing.escrow_ref, params.order_id
                );
                return Ok((existing.escrow_ref, true));
            }
            Err(RelayerError::Gateway {
                source: GatewayError::NotFound(_),
                ..
            }) => {}
            Err(e) => return Err(e),
        }

        let escrow_ref = self.sender.deploy_destination(side, params).await?;
        Ok((escrow_ref, false))
    }

    async fn fail_pending(&self, order_id: &str, reason: String) -> RelayerResult<OrderStatus> {
        let (events, order) = self
            .store
            .update(order_id, |o| {
                let mut events = Vec::new();
                fail_with(o, reason.clone(), &mut events)?;
                Ok(events)
            })
            .await?;
        self.record(&order, events).await;
        Ok(order.status)
    }
}
