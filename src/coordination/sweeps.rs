//! Periodic sweeps: auction prices, order expiry and refunds

use super::engine::{move_to, CoordinationEngine};
use crate::chain::GatewayError;
use crate::error::{RelayerError, RelayerResult};
use crate::escrow::EscrowError;
use crate::events::OrderEventKind;
use crate::order::{Leg, Order, OrderId, OrderStatus, RefundProgress};
use crate::tx::ChainCommand;

use tracing::{debug, info, warn};

/// Result of one refund attempt on one leg
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefundStep {
    /// Nothing left to refund; the tx ref if this attempt sent the cancel
    Done(Option<String>),
    /// Timelock not reached on that chain
    Wait,
}

impl CoordinationEngine {
    /// Recompute the auction price of every unsealed order.
    ///
    /// Prices are taken at the source chain's last known block time and
    /// only ever move down. Returns how many orders changed.
    pub async fn refresh_prices_once(&self) -> usize {
        let mut updated = 0;

        for order in self.store.active_orders().await {
            if !order.has_active_auction() {
                continue;
            }
            let now = self.chain_time(order.direction.source_side());

            let result = self
                .store
                .update(&order.order_id, |o| {
                    let Some(auction) = o.auction.as_ref().filter(|a| !a.is_sealed()) else {
                        return Ok(None);
                    };
                    let price = auction.current_price(now);
                    match o.current_price {
                        Some(current) if price >= current => Ok(None),
                        _ => {
                            o.current_price = Some(price);
                            Ok(Some(price))
                        }
                    }
                })
                .await;

            match result {
                Ok((Some(price), order)) => {
                    debug!("Order {} price now {}", order.order_id, price);
                    self.persist(&order).await;
                    updated += 1;
                }
                Ok((None, _)) => {}
                Err(e) => debug!("Price refresh skipped order {}: {}", order.order_id, e),
            }
        }

        updated
    }

    /// Expire `Active` and `Matched` orders past their deadline whose
    /// secret reveal has not started
    pub async fn sweep_timeouts_once(&self) -> Vec<OrderId> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for order in self.store.active_orders().await {
            if !expirable(&order, now) {
                continue;
            }

            let result = self
                .store
                .update(&order.order_id, |o| {
                    // Re-checked under the lock: a claim may have started meanwhile
                    if !expirable(o, now) {
                        return Ok(None);
                    }
                    let mut events = Vec::new();
                    let reason = format!("expired at {}", o.expires_at);
                    move_to(o, OrderStatus::Expired, Some(reason), &mut events)?;
                    o.pending_command = None;
                    Ok(Some(events))
                })
                .await;

            match result {
                Ok((Some(events), order)) => {
                    self.record(&order, events).await;
                    expired.push(order.order_id);
                }
                Ok((None, _)) => {}
                Err(e) => debug!("Timeout sweep skipped order {}: {}", order.order_id, e),
            }
        }

        if !expired.is_empty() {
            info!("Expired {} orders", expired.len());
        }
        expired
    }

    /// Try to refund every expired order that still has locked funds.
    /// Returns how many orders are now fully refunded.
    pub async fn sweep_refunds_once(&self) -> usize {
        let mut completed = 0;
        for order in self.store.refund_candidates().await {
            match self.refund_order(&order.order_id).await {
                Ok(progress) if progress.is_complete() => completed += 1,
                Ok(_) => {}
                Err(e) => warn!("Refund of order {} failed: {}", order.order_id, e),
            }
        }
        completed
    }

    /// Cancel whichever legs of an expired order are past their timelock
    pub(super) async fn refund_order(&self, order_id: &str) -> RelayerResult<RefundProgress> {
        let order = self.require_order(order_id).await?;
        if order.status != OrderStatus::Expired {
            return Err(RelayerError::Validation(format!(
                "order {} is {}, not expired",
                order_id, order.status
            )));
        }

        let mut progress = order.refund.clone();
        if progress.is_complete() {
            return Ok(progress);
        }

        let mut events = Vec::new();
        for leg in [Leg::Source, Leg::Destination] {
            let done = match leg {
                Leg::Source => &mut progress.source_done,
                Leg::Destination => &mut progress.destination_done,
            };
            if *done {
                continue;
            }
            match self.refund_leg(&order, leg).await {
                Ok(RefundStep::Done(tx_ref)) => {
                    *done = true;
                    events.push(OrderEventKind::Refunded { leg, tx_ref });
                }
                Ok(RefundStep::Wait) => {}
                Err(e) => warn!(
                    "Refund of order {} {} leg failed: {}",
                    order_id,
                    leg.as_str(),
                    e
                ),
            }
        }

        if events.is_empty() {
            return Ok(progress);
        }

        let (progress, order) = self
            .store
            .update_archived(order_id, |o| {
                o.refund.source_done |= progress.source_done;
                o.refund.destination_done |= progress.destination_done;
                Ok(o.refund.clone())
            })
            .await?;
        self.record(&order, events).await;
        if progress.is_complete() {
            info!("Order {} fully refunded", order_id);
        }
        Ok(progress)
    }

    async fn refund_leg(&self, order: &Order, leg: Leg) -> RelayerResult<RefundStep> {
        // A leg that was never deployed holds nothing
        let Some(escrow_ref) = order.escrow_ref(leg) else {
            return Ok(RefundStep::Done(None));
        };
        let side = order.side(leg);

        let snapshot = match self.sender.escrow_state(side, escrow_ref).await {
            Ok(snapshot) => snapshot,
            Err(RelayerError::Gateway {
                source: GatewayError::NotFound(_),
                ..
            }) => return Ok(RefundStep::Done(None)),
            Err(e) => return Err(e),
        };
        if snapshot.escrow.status.is_terminal() {
            return Ok(RefundStep::Done(None));
        }

        let block_time = self.sender.block_time(side).await?;
        if block_time < snapshot.escrow.timelock {
            debug!(
                "Order {}: {} refund waits for timelock {} (chain time {})",
                order.order_id,
                leg.as_str(),
                snapshot.escrow.timelock,
                block_time
            );
            return Ok(RefundStep::Wait);
        }

        let command = ChainCommand::Cancel {
            escrow_ref: escrow_ref.to_string(),
        };
        match self.sender.execute(side, &command).await {
            Ok(tx_ref) => {
                info!(
                    "Order {}: {} leg refunded in {}",
                    order.order_id,
                    leg.as_str(),
                    tx_ref
                );
                Ok(RefundStep::Done(Some(tx_ref)))
            }
            Err(RelayerError::Gateway { chain_id, source }) => match source {
                GatewayError::NotFound(_)
                | GatewayError::Rejected(EscrowError::AlreadyCancelled)
                | GatewayError::Rejected(EscrowError::AlreadyWithdrawn) => Ok(RefundStep::Done(None)),
                GatewayError::Rejected(EscrowError::TimelockNotExpired { .. }) => Ok(RefundStep::Wait),
                other => Err(RelayerError::gateway(chain_id, other)),
            },
            Err(e) => Err(e),
        }
    }
}

fn expirable(order: &Order, now: u64) -> bool {
    matches!(order.status, OrderStatus::Active | OrderStatus::Matched)
        && order.expires_at <= now
        && !order.reveal_started()
}
