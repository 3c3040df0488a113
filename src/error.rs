//! Error types for the swap relayer

use crate::chain::GatewayError;
use crate::order::OrderStatus;

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Gateway error on chain {chain_id}: {source}")]
    Gateway {
        chain_id: String,
        #[source]
        source: GatewayError,
    },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    #[error("Order {order_id} changed concurrently: expected {expected}, found {actual}")]
    StaleStatus {
        order_id: String,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("Invariant violated for order {order_id}: {reason}")]
    InvariantViolation { order_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes driving the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any chain call
    Validation,
    /// Timeout, unreachable node, nonce conflict: retried with backoff
    ChainTransient,
    /// The chain refused the command: not retried
    ChainPermanent,
    /// Store corruption or invariant breach: the order is quarantined
    Internal,
}

impl RelayerError {
    pub fn gateway(chain_id: impl Into<String>, source: GatewayError) -> Self {
        RelayerError::Gateway {
            chain_id: chain_id.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RelayerError::Validation(_) | RelayerError::Config(_) => ErrorClass::Validation,
            RelayerError::Gateway { source, .. } => {
                if source.is_transient() {
                    ErrorClass::ChainTransient
                } else {
                    ErrorClass::ChainPermanent
                }
            }
            RelayerError::Database(_) | RelayerError::StaleStatus { .. } => {
                ErrorClass::ChainTransient
            }
            RelayerError::OrderNotFound { .. }
            | RelayerError::InvalidStateTransition { .. } => ErrorClass::Validation,
            RelayerError::InvariantViolation { .. }
            | RelayerError::Serialization(_)
            | RelayerError::Shutdown
            | RelayerError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::ChainTransient
    }

    /// Lost a race with another writer; the caller should simply move on
    pub fn is_conflict(&self) -> bool {
        matches!(self, RelayerError::StaleStatus { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InvariantViolation { .. } | RelayerError::Internal(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
