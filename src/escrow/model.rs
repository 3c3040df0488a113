//! Escrow record and its transition rules

use super::hashlock::{verify_secret, EscrowId, Secret, SecretHash};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of a single escrow leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Created,
    Funded,
    SourceConfirmed,
    PartiallyWithdrawn,
    Withdrawn,
    Cancelled,
    Expired,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Created => "created",
            EscrowStatus::Funded => "funded",
            EscrowStatus::SourceConfirmed => "source_confirmed",
            EscrowStatus::PartiallyWithdrawn => "partially_withdrawn",
            EscrowStatus::Withdrawn => "withdrawn",
            EscrowStatus::Cancelled => "cancelled",
            EscrowStatus::Expired => "expired",
        }
    }

    /// `Withdrawn` and `Cancelled` never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Withdrawn | EscrowStatus::Cancelled)
    }

    /// A claim with the secret may be attempted from these states
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            EscrowStatus::SourceConfirmed | EscrowStatus::PartiallyWithdrawn
        )
    }

    /// Monotone progress rank. A lower rank observed after a higher one
    /// means the chain rolled back.
    pub fn rank(&self) -> u8 {
        match self {
            EscrowStatus::Created => 0,
            EscrowStatus::Funded => 1,
            EscrowStatus::SourceConfirmed => 2,
            EscrowStatus::PartiallyWithdrawn | EscrowStatus::Expired => 3,
            EscrowStatus::Withdrawn | EscrowStatus::Cancelled => 4,
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of an escrow transition
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowError {
    #[error("operation {operation} is not legal from status {status}")]
    InvalidState {
        operation: String,
        status: EscrowStatus,
    },

    #[error("secret does not match hashlock")]
    InvalidSecret,

    #[error("timelock expired at {timelock}, now {now}")]
    TimelockExpired { timelock: u64, now: u64 },

    #[error("timelock not expired until {timelock}, now {now}")]
    TimelockNotExpired { timelock: u64, now: u64 },

    #[error("requested {requested} exceeds remaining {remaining}")]
    InsufficientRemaining { requested: u128, remaining: u128 },

    #[error("fill of {requested} is below minimum {minimum}")]
    BelowMinimumFill { requested: u128, minimum: u128 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("escrow does not allow partial fills")]
    PartialFillNotAllowed,

    #[error("escrow already withdrawn")]
    AlreadyWithdrawn,

    #[error("escrow already cancelled")]
    AlreadyCancelled,

    #[error("counterparty escrow not confirmed")]
    SourceNotConfirmed,

    #[error("funding amount {amount} does not match expected {expected}")]
    AmountMismatch { amount: u128, expected: u128 },
}

/// Immutable parameters of a new escrow
#[derive(Debug, Clone)]
pub struct EscrowParams {
    pub id: EscrowId,
    pub maker: String,
    pub taker: Option<String>,
    pub secret_hash: SecretHash,
    pub timelock: u64,
    pub expected_amount: u128,
    pub allow_partial_fill: bool,
    pub minimum_fill_amount: u128,
    pub counterparty_chain_id: Option<String>,
}

/// One chain-side custody record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub maker: String,
    pub taker: Option<String>,
    pub secret_hash: SecretHash,
    pub timelock: u64,
    pub expected_amount: u128,
    pub deposited_amount: u128,
    pub filled_amount: u128,
    pub remaining_amount: u128,
    pub allow_partial_fill: bool,
    pub minimum_fill_amount: u128,
    pub counterparty_chain_id: Option<String>,
    pub counterparty_escrow_ref: Option<String>,
    pub status: EscrowStatus,
    /// Preimage published by the first successful claim
    pub revealed_secret: Option<Secret>,
}

impl Escrow {
    /// Create an unfunded escrow
    pub fn new(params: EscrowParams) -> Result<Self, EscrowError> {
        if params.expected_amount == 0 {
            return Err(EscrowError::InvalidAmount(
                "expected amount must be positive".to_string(),
            ));
        }
        if params.minimum_fill_amount > params.expected_amount {
            return Err(EscrowError::InvalidAmount(format!(
                "minimum fill {} exceeds expected amount {}",
                params.minimum_fill_amount, params.expected_amount
            )));
        }

        Ok(Self {
            id: params.id,
            maker: params.maker,
            taker: params.taker,
            secret_hash: params.secret_hash,
            timelock: params.timelock,
            expected_amount: params.expected_amount,
            deposited_amount: 0,
            filled_amount: 0,
            remaining_amount: 0,
            allow_partial_fill: params.allow_partial_fill,
            minimum_fill_amount: params.minimum_fill_amount,
            counterparty_chain_id: params.counterparty_chain_id,
            counterparty_escrow_ref: None,
            status: EscrowStatus::Created,
            revealed_secret: None,
        })
    }

    /// Lock funds. Full orders must deposit exactly the expected amount,
    /// partial orders at least the minimum fill.
    pub fn fund(&mut self, amount: u128) -> Result<(), EscrowError> {
        self.require_status("fund", &[EscrowStatus::Created])?;

        if amount == 0 {
            return Err(EscrowError::InvalidAmount("deposit must be positive".to_string()));
        }

        if self.allow_partial_fill {
            if amount < self.minimum_fill_amount {
                return Err(EscrowError::BelowMinimumFill {
                    requested: amount,
                    minimum: self.minimum_fill_amount,
                });
            }
            if amount > self.expected_amount {
                return Err(EscrowError::AmountMismatch {
                    amount,
                    expected: self.expected_amount,
                });
            }
        } else if amount != self.expected_amount {
            return Err(EscrowError::AmountMismatch {
                amount,
                expected: self.expected_amount,
            });
        }

        self.deposited_amount = amount;
        self.remaining_amount = amount;
        self.status = EscrowStatus::Funded;
        Ok(())
    }

    /// Record the paired escrow on the other ledger. Claims are illegal
    /// until this has happened.
    pub fn confirm_source(&mut self, counterparty_ref: &str) -> Result<(), EscrowError> {
        self.require_status("confirm_source", &[EscrowStatus::Funded])?;

        if counterparty_ref.trim().is_empty() {
            return Err(EscrowError::SourceNotConfirmed);
        }

        self.counterparty_escrow_ref = Some(counterparty_ref.to_string());
        self.status = EscrowStatus::SourceConfirmed;
        Ok(())
    }

    /// Claim everything that is left. Returns the amount released.
    pub fn withdraw(&mut self, secret: &Secret, now: u64) -> Result<u128, EscrowError> {
        self.check_claim("withdraw", secret, now)?;

        let amount = self.remaining_amount;
        self.filled_amount += amount;
        self.remaining_amount = 0;
        self.status = EscrowStatus::Withdrawn;
        self.revealed_secret = Some(secret.clone());
        Ok(amount)
    }

    /// Claim part of the remainder
    pub fn partial_withdraw(
        &mut self,
        secret: &Secret,
        amount: u128,
        now: u64,
    ) -> Result<(), EscrowError> {
        self.reject_terminal()?;
        if !self.allow_partial_fill {
            return Err(EscrowError::PartialFillNotAllowed);
        }
        self.check_claim("partial_withdraw", secret, now)?;

        if amount == 0 {
            return Err(EscrowError::InvalidAmount("fill must be positive".to_string()));
        }
        if amount > self.remaining_amount {
            return Err(EscrowError::InsufficientRemaining {
                requested: amount,
                remaining: self.remaining_amount,
            });
        }
        if amount < self.minimum_fill_amount && amount != self.remaining_amount {
            return Err(EscrowError::BelowMinimumFill {
                requested: amount,
                minimum: self.minimum_fill_amount,
            });
        }

        self.filled_amount += amount;
        self.remaining_amount -= amount;
        self.status = if self.remaining_amount > 0 {
            EscrowStatus::PartiallyWithdrawn
        } else {
            EscrowStatus::Withdrawn
        };
        self.revealed_secret = Some(secret.clone());
        Ok(())
    }

    /// Refund whatever is still locked to the depositor. Legal only at or
    /// after the timelock. Returns the refunded amount.
    pub fn cancel(&mut self, now: u64) -> Result<u128, EscrowError> {
        self.reject_terminal()?;

        if now < self.timelock {
            return Err(EscrowError::TimelockNotExpired {
                timelock: self.timelock,
                now,
            });
        }

        let refund = self.remaining_amount;
        self.remaining_amount = 0;
        self.status = EscrowStatus::Cancelled;
        Ok(refund)
    }

    /// Flag a non-terminal escrow whose timelock has passed. Informational:
    /// funds only move through `cancel`.
    pub fn mark_expired(&mut self, now: u64) -> bool {
        if !self.status.is_terminal() && now >= self.timelock {
            self.status = EscrowStatus::Expired;
            return true;
        }
        false
    }

    /// Accounting invariants that must hold for every observed snapshot
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.remaining_amount > self.expected_amount {
            return Err(format!(
                "remaining {} exceeds expected {}",
                self.remaining_amount, self.expected_amount
            ));
        }
        if self.filled_amount > self.expected_amount {
            return Err(format!(
                "filled {} exceeds expected {}",
                self.filled_amount, self.expected_amount
            ));
        }
        let funded = self.status != EscrowStatus::Created;
        let settled = if self.status == EscrowStatus::Cancelled {
            self.filled_amount <= self.deposited_amount
        } else {
            self.filled_amount + self.remaining_amount == self.deposited_amount
        };
        if funded && !settled {
            return Err(format!(
                "filled {} + remaining {} != deposited {}",
                self.filled_amount, self.remaining_amount, self.deposited_amount
            ));
        }
        Ok(())
    }

    fn check_claim(&self, operation: &str, secret: &Secret, now: u64) -> Result<(), EscrowError> {
        self.reject_terminal()?;
        match self.status {
            EscrowStatus::SourceConfirmed | EscrowStatus::PartiallyWithdrawn => {}
            EscrowStatus::Funded => return Err(EscrowError::SourceNotConfirmed),
            EscrowStatus::Expired => {
                return Err(EscrowError::TimelockExpired {
                    timelock: self.timelock,
                    now,
                })
            }
            status => {
                return Err(EscrowError::InvalidState {
                    operation: operation.to_string(),
                    status,
                })
            }
        }

        if !verify_secret(secret, &self.secret_hash) {
            return Err(EscrowError::InvalidSecret);
        }

        // Claims strictly before expiry; the expiry instant belongs to refunds.
        if now >= self.timelock {
            return Err(EscrowError::TimelockExpired {
                timelock: self.timelock,
                now,
            });
        }
        Ok(())
    }

    fn reject_terminal(&self) -> Result<(), EscrowError> {
        match self.status {
            EscrowStatus::Withdrawn => Err(EscrowError::AlreadyWithdrawn),
            EscrowStatus::Cancelled => Err(EscrowError::AlreadyCancelled),
            _ => Ok(()),
        }
    }

    fn require_status(&self, operation: &str, allowed: &[EscrowStatus]) -> Result<(), EscrowError> {
        self.reject_terminal()?;
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EscrowError::InvalidState {
                operation: operation.to_string(),
                status: self.status,
            })
        }
    }
}
