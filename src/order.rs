//! Order model and its status state machine

use crate::auction::Auction;
use crate::chain::{ChainSide, EscrowSnapshot};
use crate::error::{RelayerError, RelayerResult};
use crate::escrow::{Escrow, Secret, SecretHash};
use crate::fill::{FillLedger, FillRecord, FillRequest};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrderId = String;

/// Which ledger holds the maker's locked funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub fn from_source(side: ChainSide) -> Self {
        match side {
            ChainSide::A => Direction::AToB,
            ChainSide::B => Direction::BToA,
        }
    }

    pub fn source_side(&self) -> ChainSide {
        match self {
            Direction::AToB => ChainSide::A,
            Direction::BToA => ChainSide::B,
        }
    }

    pub fn destination_side(&self) -> ChainSide {
        self.source_side().other()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Active,
    Matched,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        OrderStatus::Pending,
        OrderStatus::Active,
        OrderStatus::Matched,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Expired,
        OrderStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Active => "active",
            OrderStatus::Matched => "matched",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    /// Allowed edges of the order state machine
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Active) => true,
            (Active, Matched) | (Active, Expired) | (Active, Cancelled) => true,
            (Matched, Completed) | (Matched, Expired) | (Matched, Cancelled) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub symbol: String,
    /// Contract address or native denom
    pub address: String,
    pub amount: u128,
    pub decimals: u8,
}

/// Swap intent carried by a maker's source escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTerms {
    pub source_asset: AssetInfo,
    pub destination_asset: AssetInfo,
    pub auction: Option<crate::auction::AuctionParams>,
    /// Unix seconds after which an unmatched order is abandoned
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Source,
    Destination,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Source => "source",
            Leg::Destination => "destination",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    DeployDestination,
    Withdraw,
    PartialWithdraw,
    Cancel,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::DeployDestination => "deploy_destination",
            CommandKind::Withdraw => "withdraw",
            CommandKind::PartialWithdraw => "partial_withdraw",
            CommandKind::Cancel => "cancel",
        }
    }
}

/// A chain command accepted by a gateway but not yet observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub leg: Leg,
    pub kind: CommandKind,
    pub tx_ref: String,
    pub amount: Option<u128>,
    /// Escrow filled amount when the command was sent
    pub baseline_filled: u128,
    pub submitted_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundProgress {
    pub source_done: bool,
    pub destination_done: bool,
}

impl RefundProgress {
    pub fn is_complete(&self) -> bool {
        self.source_done && self.destination_done
    }
}

/// The coordinator's unit of work: one swap intent across two ledgers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub direction: Direction,
    pub status: OrderStatus,
    pub maker: String,
    pub taker: Option<String>,
    pub secret_hash: SecretHash,
    /// Set only once the source withdraw has been observed on chain
    pub secret: Option<Secret>,
    pub timelock: u64,
    pub source_chain_id: String,
    pub destination_chain_id: String,
    pub source_asset: AssetInfo,
    pub destination_asset: AssetInfo,
    pub source_escrow_ref: Option<String>,
    pub destination_escrow_ref: Option<String>,
    /// Last observed copies; refreshed by reconciliation only
    pub source_escrow: Option<Escrow>,
    pub destination_escrow: Option<Escrow>,
    pub auction: Option<Auction>,
    pub current_price: Option<u128>,
    pub partial_fill: Option<FillLedger>,
    pub pending_fill: Option<FillRequest>,
    pub fills: Vec<FillRecord>,
    pub pending_command: Option<PendingCommand>,
    pub reveal_started_at: Option<DateTime<Utc>>,
    pub refund: RefundProgress,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: u64,
}

impl Order {
    /// Build a pending order from a maker's source escrow.
    ///
    /// The order id is the source escrow id, so re-ingesting the same
    /// escrow always yields the same order.
    pub fn from_source_snapshot(
        snapshot: &EscrowSnapshot,
        source_side: ChainSide,
        destination_chain_id: &str,
    ) -> RelayerResult<Self> {
        let escrow = &snapshot.escrow;
        let terms = snapshot.terms.as_ref().ok_or_else(|| {
            RelayerError::Validation(format!("escrow {} carries no swap terms", escrow.id))
        })?;

        if terms.source_asset.amount == 0 || terms.destination_asset.amount == 0 {
            return Err(RelayerError::Validation(format!(
                "escrow {} has a zero asset amount",
                escrow.id
            )));
        }
        if terms.source_asset.amount != escrow.expected_amount {
            return Err(RelayerError::Validation(format!(
                "escrow {} expects {} but terms offer {}",
                escrow.id, escrow.expected_amount, terms.source_asset.amount
            )));
        }

        let auction = match terms.auction {
            Some(params) => Some(
                Auction::new(params).map_err(|e| RelayerError::Validation(e.to_string()))?,
            ),
            None => None,
        };

        let partial_fill = escrow
            .allow_partial_fill
            .then(|| FillLedger::from_escrow(escrow));
        let now = Utc::now();

        Ok(Self {
            order_id: escrow.id.to_hex(),
            direction: Direction::from_source(source_side),
            status: OrderStatus::Pending,
            maker: escrow.maker.clone(),
            taker: escrow.taker.clone(),
            secret_hash: escrow.secret_hash,
            secret: None,
            timelock: escrow.timelock,
            source_chain_id: snapshot.chain_id.clone(),
            destination_chain_id: destination_chain_id.to_string(),
            source_asset: terms.source_asset.clone(),
            destination_asset: terms.destination_asset.clone(),
            source_escrow_ref: Some(escrow.id.to_hex()),
            destination_escrow_ref: None,
            source_escrow: Some(escrow.clone()),
            destination_escrow: None,
            current_price: auction.as_ref().map(|a| a.params.start_price),
            auction,
            partial_fill,
            pending_fill: None,
            fills: Vec::new(),
            pending_command: None,
            reveal_started_at: None,
            refund: RefundProgress::default(),
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            expires_at: terms.expires_at,
        })
    }

    /// Move along an allowed edge. Re-applying the current status is a no-op.
    pub fn transition(&mut self, next: OrderStatus) -> RelayerResult<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(true)
    }

    /// Terminal failure with a recorded reason
    pub fn fail(&mut self, reason: impl Into<String>) -> RelayerResult<bool> {
        self.last_error = Some(reason.into());
        self.pending_command = None;
        self.transition(OrderStatus::Failed)
    }

    pub fn has_active_auction(&self) -> bool {
        self.auction.as_ref().map(|a| !a.is_sealed()).unwrap_or(false)
    }

    /// The secret-reveal point: a source claim was issued or observed
    pub fn reveal_started(&self) -> bool {
        self.reveal_started_at.is_some() || self.secret.is_some()
    }

    pub fn is_partial(&self) -> bool {
        self.partial_fill
            .as_ref()
            .map(|p| p.allow_partial_fill)
            .unwrap_or(false)
    }

    pub fn escrow_ref(&self, leg: Leg) -> Option<&str> {
        match leg {
            Leg::Source => self.source_escrow_ref.as_deref(),
            Leg::Destination => self.destination_escrow_ref.as_deref(),
        }
    }

    pub fn side(&self, leg: Leg) -> ChainSide {
        match leg {
            Leg::Source => self.direction.source_side(),
            Leg::Destination => self.direction.destination_side(),
        }
    }

    pub fn total_filled(&self) -> u128 {
        self.fills.iter().map(|f| f.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Matched));
        assert!(Active.can_transition_to(Expired));
        assert!(Matched.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Expired.can_transition_to(Active));
        assert!(!Active.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("bogus"), None);
    }

    #[test]
    fn test_direction_sides() {
        assert_eq!(Direction::AToB.source_side(), ChainSide::A);
        assert_eq!(Direction::AToB.destination_side(), ChainSide::B);
        assert_eq!(Direction::from_source(ChainSide::B), Direction::BToA);
    }
}
