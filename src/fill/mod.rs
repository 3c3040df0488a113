//! Partial-fill accounting
//!
//! The escrow on chain is authoritative; [`FillLedger`] is the order's
//! cached mirror of it, refreshed on every reconciliation pass, plus the
//! validation a fill request must pass before it is ever sent to a chain.

use crate::escrow::Escrow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FillError {
    #[error("fill amount must be positive")]
    ZeroAmount,

    #[error("fill of {requested} exceeds remaining {remaining}")]
    ExceedsRemaining { requested: u128, remaining: u128 },

    #[error("fill of {requested} below minimum {minimum} and does not exhaust remaining {remaining}")]
    BelowMinimum {
        requested: u128,
        minimum: u128,
        remaining: u128,
    },

    #[error("order does not allow partial fills; only the full remaining {remaining} can be filled")]
    NotPartial { remaining: u128 },

    #[error("price {price} above start price {start_price}")]
    PriceAboveStart { price: u128, start_price: u128 },

    #[error("arithmetic overflow computing settlement")]
    Overflow,

    #[error("inconsistent fill state: {0}")]
    Inconsistent(String),
}

/// Cached fill counters for one order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillLedger {
    pub allow_partial_fill: bool,
    pub minimum_fill_amount: u128,
    pub total_amount: u128,
    pub filled_amount: u128,
    pub remaining_amount: u128,
}

impl FillLedger {
    pub fn from_escrow(escrow: &Escrow) -> Self {
        Self {
            allow_partial_fill: escrow.allow_partial_fill,
            minimum_fill_amount: escrow.minimum_fill_amount,
            total_amount: escrow.deposited_amount,
            filled_amount: escrow.filled_amount,
            remaining_amount: escrow.remaining_amount,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_amount == 0
    }

    /// Reject, never clamp, a fill the escrow would refuse
    pub fn validate_fill(&self, amount: u128) -> Result<(), FillError> {
        if amount == 0 {
            return Err(FillError::ZeroAmount);
        }
        if amount > self.remaining_amount {
            return Err(FillError::ExceedsRemaining {
                requested: amount,
                remaining: self.remaining_amount,
            });
        }
        if !self.allow_partial_fill && amount != self.remaining_amount {
            return Err(FillError::NotPartial {
                remaining: self.remaining_amount,
            });
        }
        if amount < self.minimum_fill_amount && amount != self.remaining_amount {
            return Err(FillError::BelowMinimum {
                requested: amount,
                minimum: self.minimum_fill_amount,
                remaining: self.remaining_amount,
            });
        }
        Ok(())
    }

    /// Refresh from the authoritative escrow. Returns the newly filled
    /// amount since the previous mirror.
    pub fn mirror(&mut self, escrow: &Escrow) -> Result<u128, FillError> {
        if escrow.filled_amount < self.filled_amount {
            return Err(FillError::Inconsistent(format!(
                "filled amount went backwards: {} -> {}",
                self.filled_amount, escrow.filled_amount
            )));
        }
        if escrow.filled_amount > escrow.expected_amount {
            return Err(FillError::Inconsistent(format!(
                "filled {} exceeds expected {}",
                escrow.filled_amount, escrow.expected_amount
            )));
        }

        let delta = escrow.filled_amount - self.filled_amount;
        self.total_amount = escrow.deposited_amount;
        self.filled_amount = escrow.filled_amount;
        self.remaining_amount = escrow.remaining_amount;
        Ok(delta)
    }
}

/// A resolver's request to take part of an order at the auction price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRequest {
    pub amount: u128,
    pub price: u128,
    pub resolver_amount: u128,
    pub requested_at: DateTime<Utc>,
}

/// A fill observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub amount: u128,
    pub price: u128,
    pub resolver_amount: u128,
    pub observed_at: DateTime<Utc>,
}

/// `floor(fill_amount * price / start_price)`, never more than `fill_amount`
pub fn resolver_amount(fill_amount: u128, price: u128, start_price: u128) -> Result<u128, FillError> {
    if start_price == 0 || price > start_price {
        return Err(FillError::PriceAboveStart { price, start_price });
    }
    let product = fill_amount.checked_mul(price).ok_or(FillError::Overflow)?;
    Ok(product / start_price)
}

/// Destination amount owed for `filled` out of `source_total`, floored
pub fn destination_share(filled: u128, source_total: u128, destination_total: u128) -> Result<u128, FillError> {
    if source_total == 0 {
        return Ok(0);
    }
    if filled >= source_total {
        return Ok(destination_total);
    }
    let product = destination_total
        .checked_mul(filled)
        .ok_or(FillError::Overflow)?;
    Ok(product / source_total)
}
