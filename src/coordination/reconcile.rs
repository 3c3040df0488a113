//! Reconciliation: compare each active order with both ledgers and act
//!
//! A tick runs in three phases for every order:
//! 1. Observe both legs and their finality, outside any lock.
//! 2. Under the order's lock, mirror final observations into the order and
//!    decide the next step with [`plan_reconciliation`].
//! 3. Send the planned chain command, if any, and record the outcome.
//!
//! Only reorg-safe observations move an order. A leg that went backwards
//! skips the tick, and waits until the rolled back state is final.

use super::engine::{fail_with, move_to, CoordinationEngine};
use crate::chain::{Finality, GatewayError};
use crate::error::{ErrorClass, RelayerError, RelayerResult};
use crate::escrow::{verify_secret, Escrow, EscrowError, EscrowStatus, Secret};
use crate::events::OrderEventKind;
use crate::fill::{destination_share, resolver_amount, FillRecord};
use crate::order::{CommandKind, Leg, Order, OrderStatus, PendingCommand};
use crate::tx::{backoff_delay, ChainCommand};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

/// One leg as seen this tick
#[derive(Debug, Clone)]
pub struct LegObservation {
    pub escrow: Escrow,
    pub is_final: bool,
    /// That chain's time when observed
    pub block_time: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub source: Option<LegObservation>,
    pub destination: Option<LegObservation>,
    /// Coordinator clock
    pub now: u64,
    pub vault_secret: Option<Secret>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub max_retries: u32,
    pub pending_command_timeout_secs: u64,
    pub relay_destination_withdraw: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegCommand {
    pub leg: Leg,
    pub command: ChainCommand,
}

/// What one tick should do with an order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub next_status: Option<OrderStatus>,
    /// Seal the auction at this source-chain time
    pub seal_auction_at: Option<u64>,
    pub command: Option<LegCommand>,
    pub fail_reason: Option<String>,
    pub wait_reason: Option<String>,
}

impl ReconcilePlan {
    fn wait(reason: impl Into<String>) -> Self {
        Self {
            wait_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            fail_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    fn advance(status: OrderStatus) -> Self {
        Self {
            next_status: Some(status),
            ..Default::default()
        }
    }

    fn send(leg: Leg, command: ChainCommand) -> Self {
        Self {
            command: Some(LegCommand { leg, command }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped,
    Waiting,
    Advanced(OrderStatus),
    CommandSent(CommandKind),
    Retrying,
    Failed,
    Quarantined,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub advanced: usize,
    pub commands: usize,
    pub retrying: usize,
    pub failed: usize,
    pub quarantined: usize,
}

/// Mirror the final leg snapshots into `order`.
///
/// Records newly observed fills, captures the secret once the source claim
/// is on chain and clears a pending command whose effect is visible.
/// An `Err` is an invariant breach and the order must be quarantined.
pub fn apply_observation(
    order: &mut Order,
    observation: &Observation,
    policy: &ReconcilePolicy,
) -> Result<Vec<OrderEventKind>, String> {
    let mut events = Vec::new();

    if let Some(destination) = &observation.destination {
        let escrow = &destination.escrow;
        escrow
            .check_invariants()
            .map_err(|r| format!("destination escrow: {}", r))?;
        if escrow.secret_hash != order.secret_hash {
            return Err("destination escrow is locked by a different hash".to_string());
        }
        if destination.is_final {
            order.destination_escrow = Some(escrow.clone());
        }
    }

    if let Some(source) = &observation.source {
        let escrow = &source.escrow;
        escrow
            .check_invariants()
            .map_err(|r| format!("source escrow: {}", r))?;
        if escrow.secret_hash != order.secret_hash {
            return Err("source escrow is locked by a different hash".to_string());
        }
        if let (Some(linked), Some(ours)) = (&escrow.counterparty_escrow_ref, &order.destination_escrow_ref) {
            if linked != ours {
                return Err(format!(
                    "source escrow is linked to {}, not to {}",
                    linked, ours
                ));
            }
        }

        if source.is_final {
            let recorded = order.total_filled();
            if escrow.filled_amount < recorded {
                return Err(format!(
                    "source filled {} is below the {} already recorded",
                    escrow.filled_amount, recorded
                ));
            }
            if let Some(ledger) = order.partial_fill.as_mut() {
                ledger.mirror(escrow).map_err(|e| e.to_string())?;
            }

            let delta = escrow.filled_amount - recorded;
            if delta > 0 {
                let (price, owed) = fill_terms(order, delta, source.block_time)?;
                order.fills.push(FillRecord {
                    amount: delta,
                    price,
                    resolver_amount: owed,
                    observed_at: Utc::now(),
                });
                order.pending_fill = None;
                crate::metrics::record_fill(&order.source_chain_id);
                events.push(OrderEventKind::FillRecorded {
                    amount: delta,
                    price,
                    resolver_amount: owed,
                });
            }

            if order.secret.is_none() && escrow.filled_amount > 0 {
                let candidate = escrow
                    .revealed_secret
                    .clone()
                    .or_else(|| observation.vault_secret.clone());
                match candidate {
                    Some(secret) if verify_secret(&secret, &order.secret_hash) => {
                        order.secret = Some(secret);
                        events.push(OrderEventKind::SecretObserved);
                    }
                    Some(_) => return Err("revealed secret does not open the hashlock".to_string()),
                    None => {}
                }
            }

            order.source_escrow = Some(escrow.clone());
        }
    }

    if let Some(pending) = order.pending_command.clone() {
        let mirrored = match pending.leg {
            Leg::Source => order.source_escrow.as_ref(),
            Leg::Destination => order.destination_escrow.as_ref(),
        };
        if mirrored.map(|e| command_observed(&pending, e)).unwrap_or(false) {
            debug!(
                "Order {}: {} {} observed on chain",
                order.order_id,
                pending.kind.as_str(),
                pending.tx_ref
            );
            order.pending_command = None;
            order.retry_count = 0;
            order.last_error = None;
        } else if observation.now
            >= pending
                .submitted_at
                .saturating_add(policy.pending_command_timeout_secs)
        {
            let error = format!(
                "{} {} not observed within {}s",
                pending.kind.as_str(),
                pending.tx_ref,
                policy.pending_command_timeout_secs
            );
            order.pending_command = None;
            order.retry_count += 1;
            order.last_error = Some(error.clone());
            events.push(OrderEventKind::CommandFailed {
                leg: pending.leg,
                kind: pending.kind,
                error,
                retry_count: order.retry_count,
            });
        }
    }

    Ok(events)
}

/// Price and resolver amount for a fill observed on chain
fn fill_terms(order: &Order, amount: u128, source_time: u64) -> Result<(u128, u128), String> {
    let Some(auction) = &order.auction else {
        return Ok((0, amount));
    };
    let price = match (auction.winning_price, &order.pending_fill) {
        (Some(winning), _) => winning,
        (None, Some(request)) => request.price,
        (None, None) => auction.current_price(source_time),
    };
    if let Some(previous) = order.fills.last() {
        if price > previous.price {
            return Err(format!(
                "auction price moved upward: {} after {}",
                price, previous.price
            ));
        }
    }
    let owed = resolver_amount(amount, price, auction.params.start_price).map_err(|e| e.to_string())?;
    Ok((price, owed))
}

fn command_observed(pending: &PendingCommand, escrow: &Escrow) -> bool {
    if escrow.status.is_terminal() {
        return true;
    }
    match pending.kind {
        CommandKind::PartialWithdraw => {
            escrow.filled_amount
                >= pending
                    .baseline_filled
                    .saturating_add(pending.amount.unwrap_or(0))
        }
        CommandKind::Withdraw | CommandKind::Cancel => false,
        CommandKind::DeployDestination => true,
    }
}

/// Decide the next step for an order whose observations are mirrored.
///
/// Pure: the same order and observation always give the same plan.
pub fn plan_reconciliation(
    order: &Order,
    observation: &Observation,
    policy: &ReconcilePolicy,
) -> ReconcilePlan {
    if order.retry_count > policy.max_retries {
        return ReconcilePlan::fail(format!(
            "retries exhausted: {}",
            order.last_error.as_deref().unwrap_or("unknown error")
        ));
    }
    if !matches!(order.status, OrderStatus::Active | OrderStatus::Matched) {
        return ReconcilePlan::wait(format!("order is {}", order.status));
    }
    if let Some(pending) = &order.pending_command {
        return ReconcilePlan::wait(format!(
            "awaiting {} {}",
            pending.kind.as_str(),
            pending.tx_ref
        ));
    }

    let (Some(source), Some(destination)) = (&observation.source, &observation.destination) else {
        return ReconcilePlan::wait("a leg is not deployed");
    };
    if !source.is_final || !destination.is_final {
        return ReconcilePlan::wait("awaiting confirmations");
    }

    if source.escrow.status == EscrowStatus::Cancelled {
        return plan_source_cancelled(order, source, destination, policy);
    }

    match order.status {
        OrderStatus::Active => plan_match(order, source, destination),
        _ => plan_settlement(order, source, destination, observation, policy),
    }
}

/// `Active -> Matched` once both legs are funded, linked and unexpired
fn plan_match(order: &Order, source: &LegObservation, destination: &LegObservation) -> ReconcilePlan {
    let (s, d) = (&source.escrow, &destination.escrow);

    if !s.status.is_claimable() || !d.status.is_claimable() {
        return ReconcilePlan::wait(format!(
            "legs are {} and {}",
            s.status.as_str(),
            d.status.as_str()
        ));
    }
    if source.block_time >= s.timelock || destination.block_time >= d.timelock {
        return ReconcilePlan::wait("a timelock has passed; left to the timeout sweep");
    }
    if s.counterparty_escrow_ref.is_none() || d.counterparty_escrow_ref.is_none() {
        return ReconcilePlan::wait("legs are not cross-referenced yet");
    }

    ReconcilePlan {
        next_status: Some(OrderStatus::Matched),
        seal_auction_at: order.has_active_auction().then_some(source.block_time),
        ..Default::default()
    }
}

fn plan_settlement(
    order: &Order,
    source: &LegObservation,
    destination: &LegObservation,
    observation: &Observation,
    policy: &ReconcilePolicy,
) -> ReconcilePlan {
    let (s, d) = (&source.escrow, &destination.escrow);

    if s.status == EscrowStatus::Withdrawn && d.status == EscrowStatus::Withdrawn {
        return ReconcilePlan::advance(OrderStatus::Completed);
    }

    // Nothing claimed yet: the first source claim reveals the secret
    let Some(secret) = order.secret.clone() else {
        let Some(secret) = observation.vault_secret.clone() else {
            return ReconcilePlan::wait("awaiting the maker's secret");
        };
        return claim_source(order, source, secret);
    };

    if policy.relay_destination_withdraw && !d.status.is_terminal() {
        let owed = if s.status == EscrowStatus::Withdrawn {
            d.expected_amount
        } else {
            match destination_share(s.filled_amount, s.deposited_amount, d.expected_amount) {
                Ok(owed) => owed,
                Err(e) => return ReconcilePlan::fail(format!("destination share: {}", e)),
            }
        };
        if owed > d.filled_amount {
            if destination.block_time >= d.timelock {
                return ReconcilePlan::fail(format!(
                    "destination timelock passed with {} of {} unsettled",
                    owed - d.filled_amount,
                    owed
                ));
            }
            if let Some(plan) = settle_destination(order, d, owed, &secret) {
                return plan;
            }
        }
    }

    if s.status.is_claimable() {
        if source.block_time >= s.timelock {
            // Nobody took the rest in time; give it back to the maker
            return match &order.source_escrow_ref {
                Some(escrow_ref) => ReconcilePlan::send(
                    Leg::Source,
                    ChainCommand::Cancel {
                        escrow_ref: escrow_ref.clone(),
                    },
                ),
                None => ReconcilePlan::fail("source escrow reference missing"),
            };
        }
        if order.pending_fill.is_some() {
            return claim_source(order, source, secret);
        }
        return ReconcilePlan::wait("awaiting a fill request");
    }

    if s.status == EscrowStatus::Withdrawn && !policy.relay_destination_withdraw {
        return ReconcilePlan::wait("awaiting the counterparty's destination claim");
    }
    ReconcilePlan::wait("settling")
}

/// Source claim with the secret: the requested fill, or everything
fn claim_source(order: &Order, source: &LegObservation, secret: Secret) -> ReconcilePlan {
    let s = &source.escrow;
    if source.block_time >= s.timelock {
        return ReconcilePlan::wait("source timelock passed before the claim");
    }
    if !s.status.is_claimable() {
        return ReconcilePlan::wait(format!("source escrow is {}", s.status.as_str()));
    }
    let Some(escrow_ref) = order.source_escrow_ref.clone() else {
        return ReconcilePlan::fail("source escrow reference missing");
    };

    if !order.is_partial() {
        return ReconcilePlan::send(Leg::Source, ChainCommand::Withdraw { escrow_ref, secret });
    }
    match &order.pending_fill {
        Some(fill) => ReconcilePlan::send(
            Leg::Source,
            ChainCommand::PartialWithdraw {
                escrow_ref,
                secret,
                amount: fill.amount,
            },
        ),
        None => ReconcilePlan::wait("awaiting a fill request"),
    }
}

/// Claim on the destination leg up to `owed`
fn settle_destination(order: &Order, d: &Escrow, owed: u128, secret: &Secret) -> Option<ReconcilePlan> {
    if !d.status.is_claimable() {
        return None;
    }
    let escrow_ref = order.destination_escrow_ref.clone()?;

    let command = if owed >= d.expected_amount {
        ChainCommand::Withdraw {
            escrow_ref,
            secret: secret.clone(),
        }
    } else if d.allow_partial_fill {
        ChainCommand::PartialWithdraw {
            escrow_ref,
            secret: secret.clone(),
            amount: owed - d.filled_amount,
        }
    } else {
        return None;
    };
    Some(ReconcilePlan::send(Leg::Destination, command))
}

/// The maker's remainder was refunded: settle what was filled, then close
fn plan_source_cancelled(
    order: &Order,
    source: &LegObservation,
    destination: &LegObservation,
    policy: &ReconcilePolicy,
) -> ReconcilePlan {
    let (s, d) = (&source.escrow, &destination.escrow);
    if s.filled_amount == 0 || !policy.relay_destination_withdraw {
        return ReconcilePlan::advance(OrderStatus::Cancelled);
    }

    let owed = match destination_share(s.filled_amount, s.deposited_amount, d.expected_amount) {
        Ok(owed) => owed,
        Err(e) => return ReconcilePlan::fail(format!("destination share: {}", e)),
    };
    if d.filled_amount >= owed {
        return ReconcilePlan::advance(OrderStatus::Cancelled);
    }

    let Some(secret) = &order.secret else {
        return ReconcilePlan::wait("awaiting the revealed secret");
    };
    if destination.block_time < d.timelock {
        if let Some(plan) = settle_destination(order, d, owed, secret) {
            return plan;
        }
    }
    ReconcilePlan::fail(format!(
        "source cancelled with destination share {} unsettled ({} claimed)",
        owed, d.filled_amount
    ))
}

/// Commit the decided step to the order under its lock
fn commit_plan(order: &mut Order, plan: &ReconcilePlan, events: &mut Vec<OrderEventKind>) -> RelayerResult<()> {
    if let Some(reason) = &plan.fail_reason {
        return fail_with(order, reason.clone(), events);
    }

    if let Some(at) = plan.seal_auction_at {
        if let Some(auction) = order.auction.as_mut() {
            let mut winning = auction.seal(at).map_err(|e| RelayerError::InvariantViolation {
                order_id: order.order_id.clone(),
                reason: e.to_string(),
            })?;
            // Never seal above a price already quoted
            if let Some(quoted) = order.current_price {
                if winning > quoted {
                    winning = quoted;
                    auction.winning_price = Some(quoted);
                }
            }
            order.current_price = Some(winning);
            events.push(OrderEventKind::AuctionSealed {
                winning_price: winning,
            });

            // A fill queued before the match is requoted at the sealed price
            if let Some(request) = order.pending_fill.as_mut() {
                if request.price != winning {
                    let owed = resolver_amount(request.amount, winning, auction.params.start_price)
                        .map_err(|e| RelayerError::InvariantViolation {
                            order_id: order.order_id.clone(),
                            reason: e.to_string(),
                        })?;
                    debug!(
                        "Order {}: pending fill of {} requoted from {} to {}",
                        order.order_id, request.amount, request.price, winning
                    );
                    request.price = winning;
                    request.resolver_amount = owed;
                }
            }
        }
    }

    if let Some(next) = plan.next_status {
        move_to(order, next, None, events)?;
    }

    if let Some(planned) = &plan.command {
        let claims_source = planned.leg == Leg::Source
            && matches!(
                planned.command.kind(),
                CommandKind::Withdraw | CommandKind::PartialWithdraw
            );
        if claims_source && order.reveal_started_at.is_none() {
            order.reveal_started_at = Some(Utc::now());
        }
    }
    Ok(())
}

impl CoordinationEngine {
    /// Reconcile every active order once, bounded in concurrency
    pub async fn reconcile_once(&self) -> ReconcileSummary {
        let ids = self.store.active_ids().await;
        let limit = self.config.max_concurrent_reconciliations.max(1);

        let outcomes: Vec<_> = stream::iter(ids)
            .map(|order_id| async move {
                let outcome = self.reconcile_order(&order_id).await;
                (order_id, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let mut summary = ReconcileSummary::default();
        for (order_id, outcome) in outcomes {
            summary.examined += 1;
            match outcome {
                Ok(ReconcileOutcome::Advanced(_)) => summary.advanced += 1,
                Ok(ReconcileOutcome::CommandSent(_)) => summary.commands += 1,
                Ok(ReconcileOutcome::Retrying) => summary.retrying += 1,
                Ok(ReconcileOutcome::Failed) => summary.failed += 1,
                Ok(ReconcileOutcome::Quarantined) => summary.quarantined += 1,
                Ok(ReconcileOutcome::Skipped | ReconcileOutcome::Waiting) => {}
                Err(e) => warn!("Reconciliation of order {} failed: {}", order_id, e),
            }
        }

        if summary.advanced + summary.commands + summary.failed + summary.quarantined > 0 {
            debug!("Reconciliation tick: {:?}", summary);
        }
        summary
    }

    /// Observe, decide and act for one order
    pub async fn reconcile_order(&self, order_id: &str) -> RelayerResult<ReconcileOutcome> {
        let Some(order) = self.store.get(order_id).await else {
            return Ok(ReconcileOutcome::Skipped);
        };
        if !matches!(order.status, OrderStatus::Active | OrderStatus::Matched) {
            return Ok(ReconcileOutcome::Skipped);
        }
        let now = self.clock.now();
        if order.next_attempt_at.map(|at| now < at).unwrap_or(false) {
            return Ok(ReconcileOutcome::Skipped);
        }

        let observation = match self.observe(&order, now).await {
            Ok(Some(observation)) => observation,
            Ok(None) => return Ok(ReconcileOutcome::Waiting),
            Err(RelayerError::Gateway {
                chain_id,
                source: GatewayError::NotFound(escrow_ref),
            }) => {
                self.quarantine(
                    order_id,
                    format!("escrow {} disappeared from chain {}", escrow_ref, chain_id),
                )
                .await;
                return Ok(ReconcileOutcome::Quarantined);
            }
            Err(e) => {
                warn!("Order {}: observation failed: {}", order_id, e);
                return Ok(ReconcileOutcome::Waiting);
            }
        };

        let observed_status = order.status;
        let policy = self.policy();
        let applied = self
            .store
            .update(order_id, |o| {
                if o.status != observed_status {
                    return Err(RelayerError::StaleStatus {
                        order_id: o.order_id.clone(),
                        expected: observed_status,
                        actual: o.status,
                    });
                }
                let mut events = apply_observation(o, &observation, &policy).map_err(|reason| {
                    RelayerError::InvariantViolation {
                        order_id: o.order_id.clone(),
                        reason,
                    }
                })?;
                let plan = plan_reconciliation(o, &observation, &policy);
                commit_plan(o, &plan, &mut events)?;
                Ok((plan, events))
            })
            .await;

        let ((plan, events), order) = match applied {
            Ok(applied) => applied,
            Err(e) if e.is_conflict() => return Ok(ReconcileOutcome::Skipped),
            Err(RelayerError::InvariantViolation { reason, .. }) => {
                self.quarantine(order_id, reason).await;
                return Ok(ReconcileOutcome::Quarantined);
            }
            Err(e) => return Err(e),
        };
        self.record(&order, events).await;

        if order.status == OrderStatus::Failed {
            return Ok(ReconcileOutcome::Failed);
        }
        if order.status != observed_status {
            return Ok(ReconcileOutcome::Advanced(order.status));
        }
        match plan.command {
            Some(planned) => self.send_command(&order, planned).await,
            None => {
                if let Some(reason) = &plan.wait_reason {
                    debug!("Order {} waiting: {}", order_id, reason);
                }
                Ok(ReconcileOutcome::Waiting)
            }
        }
    }

    /// Read both legs. `None` means a leg just regressed and the tick is skipped.
    async fn observe(&self, order: &Order, now: u64) -> RelayerResult<Option<Observation>> {
        let mut observation = Observation {
            now,
            vault_secret: self.vault.get(&order.order_id),
            ..Default::default()
        };

        for leg in [Leg::Source, Leg::Destination] {
            let Some(escrow_ref) = order.escrow_ref(leg) else {
                continue;
            };
            let side = order.side(leg);
            let snapshot = self.sender.escrow_state(side, escrow_ref).await?;
            let block_time = self.sender.block_time(side).await?;

            let finality = self.chains.finality(side)?.assess(&snapshot);
            if let Finality::Regressed { .. } = finality {
                warn!(
                    "Order {}: {} leg regressed on chain {}; skipping tick",
                    order.order_id,
                    leg.as_str(),
                    snapshot.chain_id
                );
                self.append_events(&order.order_id, vec![OrderEventKind::ReorgDetected { leg }])
                    .await;
                return Ok(None);
            }

            let view = LegObservation {
                escrow: snapshot.escrow,
                is_final: finality.is_final(),
                block_time,
            };
            match leg {
                Leg::Source => observation.source = Some(view),
                Leg::Destination => observation.destination = Some(view),
            }
        }

        Ok(Some(observation))
    }

    async fn send_command(&self, order: &Order, planned: LegCommand) -> RelayerResult<ReconcileOutcome> {
        let side = order.side(planned.leg);
        let kind = planned.command.kind();
        let baseline_filled = match planned.leg {
            Leg::Source => order.source_escrow.as_ref(),
            Leg::Destination => order.destination_escrow.as_ref(),
        }
        .map(|e| e.filled_amount)
        .unwrap_or(0);

        info!(
            "Order {}: sending {} to {} escrow {}",
            order.order_id,
            kind.as_str(),
            planned.leg.as_str(),
            planned.command.escrow_ref()
        );

        match self.sender.execute(side, &planned.command).await {
            Ok(tx_ref) => {
                let submitted_at = self.clock.now();
                let (events, order) = self
                    .store
                    .update(&order.order_id, |o| {
                        o.pending_command = Some(PendingCommand {
                            leg: planned.leg,
                            kind,
                            tx_ref: tx_ref.clone(),
                            amount: planned.command.amount(),
                            baseline_filled,
                            submitted_at,
                        });
                        o.next_attempt_at = None;
                        Ok(vec![OrderEventKind::CommandSubmitted {
                            leg: planned.leg,
                            kind,
                            tx_ref: tx_ref.clone(),
                            amount: planned.command.amount(),
                        }])
                    })
                    .await?;
                self.record(&order, events).await;
                Ok(ReconcileOutcome::CommandSent(kind))
            }
            Err(e) => self.command_failed(&order.order_id, &planned, e).await,
        }
    }

    async fn command_failed(
        &self,
        order_id: &str,
        planned: &LegCommand,
        error: RelayerError,
    ) -> RelayerResult<ReconcileOutcome> {
        let kind = planned.command.kind();
        let escrow_error = match &error {
            RelayerError::Gateway { source, .. } => source.escrow_error().cloned(),
            _ => None,
        };

        // Already done by someone else; the next observation picks it up
        let already_done = matches!(
            (kind, &escrow_error),
            (
                CommandKind::Withdraw | CommandKind::PartialWithdraw,
                Some(EscrowError::AlreadyWithdrawn)
            ) | (CommandKind::Cancel, Some(EscrowError::AlreadyCancelled))
        );
        if already_done {
            debug!("Order {}: {} was already applied", order_id, kind.as_str());
            return Ok(ReconcileOutcome::Waiting);
        }

        let now = self.clock.now();
        let message = error.to_string();
        let class = error.class();
        let max_retries = self.config.max_retries;
        let (base, cap) = (self.config.retry_delay(), self.config.max_retry_delay());

        let ((outcome, events), order) = self
            .store
            .update(order_id, |o| {
                let mut events = Vec::new();
                let outcome = match (class, &escrow_error) {
                    (ErrorClass::ChainTransient, _) => {
                        o.retry_count += 1;
                        o.last_error = Some(message.clone());
                        events.push(OrderEventKind::CommandFailed {
                            leg: planned.leg,
                            kind,
                            error: message.clone(),
                            retry_count: o.retry_count,
                        });
                        if o.retry_count > max_retries {
                            fail_with(
                                o,
                                format!(
                                    "{} failed after {} retries: {}",
                                    kind.as_str(),
                                    max_retries,
                                    message
                                ),
                                &mut events,
                            )?;
                            ReconcileOutcome::Failed
                        } else {
                            let delay = backoff_delay(o.retry_count - 1, base, cap);
                            o.next_attempt_at = Some(now + delay.as_secs());
                            ReconcileOutcome::Retrying
                        }
                    }
                    // A stale fill request: drop it, keep the order
                    (
                        _,
                        Some(EscrowError::InsufficientRemaining { .. } | EscrowError::BelowMinimumFill { .. }),
                    ) if kind == CommandKind::PartialWithdraw && planned.leg == Leg::Source => {
                        o.pending_fill = None;
                        o.last_error = Some(message.clone());
                        events.push(OrderEventKind::CommandFailed {
                            leg: planned.leg,
                            kind,
                            error: message.clone(),
                            retry_count: o.retry_count,
                        });
                        ReconcileOutcome::Waiting
                    }
                    // Precondition not met yet
                    (
                        _,
                        Some(EscrowError::TimelockNotExpired { .. } | EscrowError::SourceNotConfirmed),
                    ) => {
                        o.last_error = Some(message.clone());
                        ReconcileOutcome::Waiting
                    }
                    _ => {
                        events.push(OrderEventKind::CommandFailed {
                            leg: planned.leg,
                            kind,
                            error: message.clone(),
                            retry_count: o.retry_count,
                        });
                        fail_with(
                            o,
                            format!("{} rejected: {}", kind.as_str(), message),
                            &mut events,
                        )?;
                        ReconcileOutcome::Failed
                    }
                };
                Ok((outcome, events))
            })
            .await?;

        self.record(&order, events).await;
        if outcome == ReconcileOutcome::Retrying {
            warn!(
                "Order {}: {} failed ({}), retry {}/{}",
                order_id,
                kind.as_str(),
                message,
                order.retry_count,
                max_retries
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::{Auction, AuctionParams};
    use crate::escrow::{hash_secret, EscrowId, EscrowParams};
    use crate::store::tests::sample_order;

    const SECRET: [u8; 32] = [7u8; 32];

    fn policy() -> ReconcilePolicy {
        ReconcilePolicy {
            max_retries: 3,
            pending_command_timeout_secs: 60,
            relay_destination_withdraw: true,
        }
    }

    fn leg(escrow: Escrow, block_time: u64) -> LegObservation {
        LegObservation {
            escrow,
            is_final: true,
            block_time,
        }
    }

    fn destination_escrow(amount: u128, partial: bool) -> Escrow {
        let mut escrow = Escrow::new(EscrowParams {
            id: EscrowId([9u8; 32]),
            maker: "maker".into(),
            taker: None,
            secret_hash: hash_secret(&Secret(SECRET)),
            timelock: 6_400,
            expected_amount: amount,
            allow_partial_fill: partial,
            minimum_fill_amount: 0,
            counterparty_chain_id: Some("chain-a".into()),
        })
        .unwrap();
        escrow.fund(amount).unwrap();
        escrow.confirm_source("source").unwrap();
        escrow
    }

    /// A matched-ready order with both legs funded and linked
    fn ready() -> (Order, Observation) {
        let mut order = sample_order(1);
        order.status = OrderStatus::Active;
        order.destination_escrow_ref = Some("dest".into());
        let mut source = order.source_escrow.clone().unwrap();
        source.confirm_source("dest").unwrap();
        let observation = Observation {
            source: Some(leg(source, 1_000)),
            destination: Some(leg(destination_escrow(50, true), 1_000)),
            now: 1_000,
            vault_secret: None,
        };
        (order, observation)
    }

    #[test]
    fn test_active_order_matches_and_seals() {
        let (mut order, observation) = ready();
        order.auction = Some(
            Auction::new(AuctionParams {
                start_price: 1_000,
                end_price: 500,
                start_time: 0,
                duration: 2_000,
            })
            .unwrap(),
        );
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.next_status, Some(OrderStatus::Matched));
        assert_eq!(plan.seal_auction_at, Some(1_000));

        let mut events = Vec::new();
        commit_plan(&mut order, &plan, &mut events).unwrap();
        assert_eq!(order.auction.as_ref().unwrap().winning_price, Some(750));
        assert_eq!(order.status, OrderStatus::Matched);
    }

    #[test]
    fn test_sealing_requotes_a_queued_fill() {
        let (mut order, mut observation) = ready();
        order.auction = Some(
            Auction::new(AuctionParams {
                start_price: 1_000,
                end_price: 500,
                start_time: 0,
                duration: 2_000,
            })
            .unwrap(),
        );
        order.pending_fill = Some(crate::fill::FillRequest {
            amount: 60,
            price: 1_000,
            resolver_amount: 60,
            requested_at: Utc::now(),
        });

        let plan = plan_reconciliation(&order, &observation, &policy());
        let mut events = Vec::new();
        commit_plan(&mut order, &plan, &mut events).unwrap();
        let pending = order.pending_fill.as_ref().unwrap();
        assert_eq!((pending.price, pending.resolver_amount), (750, 45));

        // The chain fill is charged at the sealed price, whatever time it lands
        let source = &mut observation.source.as_mut().unwrap().escrow;
        source.partial_withdraw(&Secret(SECRET), 60, 1_500).unwrap();
        observation.source.as_mut().unwrap().block_time = 1_500;
        apply_observation(&mut order, &observation, &policy()).unwrap();
        let fill = &order.fills[0];
        assert_eq!((fill.amount, fill.price, fill.resolver_amount), (60, 750, 45));
    }

    #[test]
    fn test_fill_priced_above_the_last_one_is_an_invariant_breach() {
        let (mut order, mut observation) = ready();
        order.auction = Some(
            Auction::new(AuctionParams {
                start_price: 1_000,
                end_price: 500,
                start_time: 0,
                duration: 2_000,
            })
            .unwrap(),
        );
        order.fills.push(FillRecord {
            amount: 10,
            price: 600,
            resolver_amount: 6,
            observed_at: Utc::now(),
        });
        let source = &mut observation.source.as_mut().unwrap().escrow;
        source.partial_withdraw(&Secret(SECRET), 40, 1_000).unwrap();

        let err = apply_observation(&mut order, &observation, &policy()).unwrap_err();
        assert!(err.contains("moved upward"));
    }

    #[test]
    fn test_unlinked_legs_wait() {
        let (order, mut observation) = ready();
        observation.source.as_mut().unwrap().escrow.counterparty_escrow_ref = None;
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert!(plan.next_status.is_none());
        assert!(plan.wait_reason.is_some());
    }

    #[test]
    fn test_unfinal_legs_wait() {
        let (order, mut observation) = ready();
        observation.destination.as_mut().unwrap().is_final = false;
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.wait_reason.as_deref(), Some("awaiting confirmations"));
    }

    #[test]
    fn test_partial_claim_needs_secret_and_fill_request() {
        let (mut order, mut observation) = ready();
        order.status = OrderStatus::Matched;

        let plan = plan_reconciliation(&order, &observation, &policy());
        assert!(plan.command.is_none());

        observation.vault_secret = Some(Secret(SECRET));
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.wait_reason.as_deref(), Some("awaiting a fill request"));

        order.pending_fill = Some(crate::fill::FillRequest {
            amount: 60,
            price: 0,
            resolver_amount: 60,
            requested_at: Utc::now(),
        });
        let plan = plan_reconciliation(&order, &observation, &policy());
        let planned = plan.command.unwrap();
        assert_eq!(planned.leg, Leg::Source);
        assert_eq!(planned.command.amount(), Some(60));

        let plan = plan_reconciliation(&order, &observation, &policy());
        let mut events = Vec::new();
        commit_plan(&mut order, &plan, &mut events).unwrap();
        assert!(order.reveal_started());
    }

    #[test]
    fn test_observed_fill_is_recorded_and_secret_captured() {
        let (mut order, mut observation) = ready();
        order.status = OrderStatus::Matched;
        let source = &mut observation.source.as_mut().unwrap().escrow;
        source.partial_withdraw(&Secret(SECRET), 60, 1_000).unwrap();

        let events = apply_observation(&mut order, &observation, &policy()).unwrap();
        assert_eq!(order.total_filled(), 60);
        assert_eq!(order.secret, Some(Secret(SECRET)));
        assert_eq!(order.partial_fill.as_ref().unwrap().remaining_amount, 40);
        assert!(events.contains(&OrderEventKind::SecretObserved));

        // Applying the same observation twice records nothing new
        let again = apply_observation(&mut order, &observation, &policy()).unwrap();
        assert!(again.is_empty());
        assert_eq!(order.fills.len(), 1);
    }

    #[test]
    fn test_destination_share_follows_source_fill() {
        let (mut order, mut observation) = ready();
        order.status = OrderStatus::Matched;
        let source = &mut observation.source.as_mut().unwrap().escrow;
        source.partial_withdraw(&Secret(SECRET), 60, 1_000).unwrap();
        apply_observation(&mut order, &observation, &policy()).unwrap();

        let plan = plan_reconciliation(&order, &observation, &policy());
        let planned = plan.command.unwrap();
        assert_eq!(planned.leg, Leg::Destination);
        // 60% of 50
        assert_eq!(planned.command.amount(), Some(30));
    }

    #[test]
    fn test_both_withdrawn_completes() {
        let (mut order, mut observation) = ready();
        order.status = OrderStatus::Matched;
        order.secret = Some(Secret(SECRET));
        observation
            .source
            .as_mut()
            .unwrap()
            .escrow
            .withdraw(&Secret(SECRET), 1_000)
            .unwrap();
        observation
            .destination
            .as_mut()
            .unwrap()
            .escrow
            .withdraw(&Secret(SECRET), 1_000)
            .unwrap();
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.next_status, Some(OrderStatus::Completed));
    }

    #[test]
    fn test_wrong_hash_is_an_invariant_breach() {
        let (mut order, mut observation) = ready();
        observation.destination.as_mut().unwrap().escrow.secret_hash = hash_secret(&Secret([1u8; 32]));
        assert!(apply_observation(&mut order, &observation, &policy()).is_err());
    }

    #[test]
    fn test_unobserved_command_times_out_as_a_retry() {
        let (mut order, mut observation) = ready();
        order.status = OrderStatus::Matched;
        order.pending_command = Some(PendingCommand {
            leg: Leg::Source,
            kind: CommandKind::Withdraw,
            tx_ref: "tx-1".into(),
            amount: None,
            baseline_filled: 0,
            submitted_at: 990,
        });

        apply_observation(&mut order, &observation, &policy()).unwrap();
        assert!(order.pending_command.is_some());

        observation.now = 1_050;
        let events = apply_observation(&mut order, &observation, &policy()).unwrap();
        assert!(order.pending_command.is_none());
        assert_eq!(order.retry_count, 1);
        assert!(matches!(events[0], OrderEventKind::CommandFailed { .. }));
    }

    #[test]
    fn test_exhausted_retries_fail_the_order() {
        let (mut order, observation) = ready();
        order.retry_count = 4;
        order.last_error = Some("node down".into());
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.fail_reason.as_deref(), Some("retries exhausted: node down"));
    }

    #[test]
    fn test_cancelled_source_without_fills_cancels_order() {
        let (order, mut observation) = ready();
        observation.source.as_mut().unwrap().escrow.cancel(20_000).unwrap();
        let plan = plan_reconciliation(&order, &observation, &policy());
        assert_eq!(plan.next_status, Some(OrderStatus::Cancelled));
    }
}
