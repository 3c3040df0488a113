//! Dutch-auction pricing
//!
//! Integer-only price decay so that every caller computing the price for
//! the same `(params, now)` gets the same value. The fractional part of
//! the decay is always rounded toward `end_price`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuctionError {
    #[error("invalid auction parameters: {0}")]
    InvalidParams(String),

    #[error("auction already sealed at {winning_price}")]
    AlreadySealed { winning_price: u128 },
}

/// Linear Dutch-auction schedule. Times are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionParams {
    pub start_price: u128,
    pub end_price: u128,
    pub start_time: u64,
    pub duration: u64,
}

impl AuctionParams {
    pub fn validate(&self) -> Result<(), AuctionError> {
        if self.start_price == 0 {
            return Err(AuctionError::InvalidParams("start price must be positive".to_string()));
        }
        if self.start_price < self.end_price {
            return Err(AuctionError::InvalidParams(format!(
                "start price {} below end price {}",
                self.start_price, self.end_price
            )));
        }
        if self.duration == 0 {
            return Err(AuctionError::InvalidParams("duration must be positive".to_string()));
        }
        Ok(())
    }

    pub fn end_time(&self) -> u64 {
        self.start_time.saturating_add(self.duration)
    }
}

/// Price at `now`.
///
/// `start_price` until the auction starts, `end_price` from
/// `start_time + duration` on, and in between
/// `start_price - ceil((start_price - end_price) * elapsed / duration)`.
pub fn price(params: &AuctionParams, now: u64) -> u128 {
    if now <= params.start_time {
        return params.start_price;
    }
    let elapsed = now - params.start_time;
    if elapsed >= params.duration {
        return params.end_price;
    }

    let span = params.start_price.saturating_sub(params.end_price);
    let duration = params.duration as u128;
    let elapsed = elapsed as u128;

    // span * elapsed / duration without overflowing u128:
    // (q * duration + r) * elapsed / duration = q * elapsed + r * elapsed / duration
    let q = span / duration;
    let r = span % duration;
    let exact = q * elapsed + (r * elapsed) / duration;
    let decay = if (r * elapsed) % duration == 0 {
        exact
    } else {
        exact + 1
    };

    params.start_price.saturating_sub(decay).max(params.end_price)
}

/// An auction attached to an order; sealed once a claim fixes the price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auction {
    pub params: AuctionParams,
    pub winning_price: Option<u128>,
    pub sealed_at: Option<u64>,
}

impl Auction {
    pub fn new(params: AuctionParams) -> Result<Self, AuctionError> {
        params.validate()?;
        Ok(Self {
            params,
            winning_price: None,
            sealed_at: None,
        })
    }

    pub fn is_sealed(&self) -> bool {
        self.winning_price.is_some()
    }

    /// Winning price once sealed, otherwise the schedule price
    pub fn current_price(&self, now: u64) -> u128 {
        self.winning_price.unwrap_or_else(|| price(&self.params, now))
    }

    /// Fix the price at `now`. Sealing twice is an error.
    pub fn seal(&mut self, now: u64) -> Result<u128, AuctionError> {
        if let Some(winning_price) = self.winning_price {
            return Err(AuctionError::AlreadySealed { winning_price });
        }
        let winning = price(&self.params, now);
        self.winning_price = Some(winning);
        self.sealed_at = Some(now);
        Ok(winning)
    }
}
