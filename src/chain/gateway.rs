//! Ledger gateway boundary
//!
//! Each chain adapter implements [`LedgerGateway`]. The coordinator only
//! ever sees these snapshot and command types, never chain SDK objects.

use crate::escrow::{compute_escrow_id, Escrow, EscrowError, EscrowId, Secret, SecretHash};
use crate::order::SwapTerms;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Reference to a submitted chain transaction
pub type TxRef = String;

/// The two ledgers a swap spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainSide {
    A,
    B,
}

impl ChainSide {
    pub const BOTH: [ChainSide; 2] = [ChainSide::A, ChainSide::B];

    pub fn other(&self) -> ChainSide {
        match self {
            ChainSide::A => ChainSide::B,
            ChainSide::B => ChainSide::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainSide::A => "a",
            ChainSide::B => "b",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("escrow {0} not found")]
    NotFound(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("rejected by chain: {0}")]
    Rejected(#[from] EscrowError),

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_)
                | GatewayError::NonceConflict(_)
                | GatewayError::Timeout(_)
                | GatewayError::DeploymentFailed(_)
        )
    }

    pub fn escrow_error(&self) -> Option<&EscrowError> {
        match self {
            GatewayError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

/// An escrow as currently observed on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowSnapshot {
    pub chain_id: String,
    pub escrow_ref: String,
    pub escrow: Escrow,
    /// Blocks built on top of the last change to this escrow
    pub confirmations: u64,
    /// Present on maker escrows that open a swap
    pub terms: Option<SwapTerms>,
}

/// One page of newly created escrows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscrowBatch {
    pub snapshots: Vec<EscrowSnapshot>,
    pub next_cursor: u64,
}

/// Parameters for the destination leg of a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    pub order_id: String,
    pub maker: String,
    pub taker: Option<String>,
    pub secret_hash: SecretHash,
    pub timelock: u64,
    pub expected_amount: u128,
    pub allow_partial_fill: bool,
    pub minimum_fill_amount: u128,
    pub counterparty_chain_id: String,
    pub counterparty_escrow_ref: String,
}

impl DeployParams {
    /// Id the escrow will have once deployed
    pub fn predicted_escrow_id(&self) -> EscrowId {
        compute_escrow_id(
            &self.maker,
            self.taker.as_deref(),
            &self.secret_hash,
            self.timelock,
            self.order_id.as_bytes(),
        )
    }
}

/// Capability every chain adapter provides to the coordinator
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Chain identifier as used in escrow cross-references
    fn chain_id(&self) -> String;

    /// Escrows created since `since`. Safe to call repeatedly with the same cursor.
    async fn fetch_new_escrows(&self, since: u64) -> Result<EscrowBatch, GatewayError>;

    async fn get_escrow_state(&self, escrow_ref: &str) -> Result<EscrowSnapshot, GatewayError>;

    async fn deploy_destination_escrow(&self, params: &DeployParams) -> Result<String, GatewayError>;

    async fn withdraw(&self, escrow_ref: &str, secret: &Secret) -> Result<TxRef, GatewayError>;

    async fn partial_withdraw(
        &self,
        escrow_ref: &str,
        secret: &Secret,
        amount: u128,
    ) -> Result<TxRef, GatewayError>;

    async fn cancel(&self, escrow_ref: &str) -> Result<TxRef, GatewayError>;

    /// This chain's notion of now, unix seconds
    async fn current_block_time(&self) -> Result<u64, GatewayError>;
}
