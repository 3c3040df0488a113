//! Order audit trail
//!
//! Every status transition, chain command and quarantine is appended as an
//! [`OrderEvent`]. Events are never rewritten; together with the archived
//! orders they are the record of what the relayer did and why.

use crate::order::{CommandKind, Leg, OrderId, OrderStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Externally tagged: serde buffers internally tagged and flattened
// content without u128 support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    /// Maker escrow picked up by ingestion
    Ingested { chain_id: String, escrow_ref: String },

    DestinationDeployed { escrow_ref: String, adopted: bool },

    StatusChanged {
        from: OrderStatus,
        to: OrderStatus,
        reason: Option<String>,
    },

    AuctionSealed { winning_price: u128 },

    CommandSubmitted {
        leg: Leg,
        kind: CommandKind,
        tx_ref: String,
        amount: Option<u128>,
    },

    CommandFailed {
        leg: Leg,
        kind: CommandKind,
        error: String,
        retry_count: u32,
    },

    /// The preimage became public on the source leg
    SecretObserved,

    FillRecorded {
        amount: u128,
        price: u128,
        resolver_amount: u128,
    },

    Quarantined { reason: String },

    Refunded { leg: Leg, tx_ref: Option<String> },

    /// Observation skipped because a leg went backwards
    ReorgDetected { leg: Leg },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub kind: OrderEventKind,
    pub at: DateTime<Utc>,
}

impl OrderEvent {
    pub fn new(order_id: impl Into<OrderId>, kind: OrderEventKind) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            at: Utc::now(),
        }
    }

    pub fn status_changed(order_id: &str, from: OrderStatus, to: OrderStatus, reason: Option<String>) -> Self {
        Self::new(order_id, OrderEventKind::StatusChanged { from, to, reason })
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            OrderEventKind::Ingested { .. } => "ingested",
            OrderEventKind::DestinationDeployed { .. } => "destination_deployed",
            OrderEventKind::StatusChanged { .. } => "status_changed",
            OrderEventKind::AuctionSealed { .. } => "auction_sealed",
            OrderEventKind::CommandSubmitted { .. } => "command_submitted",
            OrderEventKind::CommandFailed { .. } => "command_failed",
            OrderEventKind::SecretObserved => "secret_observed",
            OrderEventKind::FillRecorded { .. } => "fill_recorded",
            OrderEventKind::Quarantined { .. } => "quarantined",
            OrderEventKind::Refunded { .. } => "refunded",
            OrderEventKind::ReorgDetected { .. } => "reorg_detected",
        }
    }

    /// Check if this event needs an operator's attention
    pub fn requires_attention(&self) -> bool {
        match &self.kind {
            OrderEventKind::Quarantined { .. } | OrderEventKind::ReorgDetected { .. } => true,
            OrderEventKind::StatusChanged { to, .. } => *to == OrderStatus::Failed,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = OrderEvent::status_changed("abc", OrderStatus::Active, OrderStatus::Matched, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["order_id"], "abc");
        assert_eq!(json["kind"]["status_changed"]["to"], "matched");
    }

    #[test]
    fn test_large_amounts_survive_text_round_trip() {
        let event = OrderEvent::new(
            "abc",
            OrderEventKind::FillRecorded {
                amount: u128::MAX,
                price: 10u128.pow(30),
                resolver_amount: 1,
            },
        );
        let text = serde_json::to_string(&event).unwrap();
        let back: OrderEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_attention_events() {
        assert!(OrderEvent::new("a", OrderEventKind::Quarantined { reason: "x".into() })
            .requires_attention());
        assert!(
            OrderEvent::status_changed("a", OrderStatus::Matched, OrderStatus::Failed, None)
                .requires_attention()
        );
        assert!(!OrderEvent::new("a", OrderEventKind::SecretObserved).requires_attention());
    }
}
