//! Maker-authorised secrets awaiting their on-chain reveal
//!
//! Held in memory only. A secret leaves the vault exactly once, as the
//! argument of a source-leg claim.

use crate::error::{RelayerError, RelayerResult};
use crate::escrow::{verify_secret, Secret};
use crate::order::{Order, OrderId};

use dashmap::DashMap;

#[derive(Default)]
pub struct SecretVault {
    secrets: DashMap<OrderId, Secret>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a secret for a live order if it opens the order's hashlock
    pub fn reveal(&self, order: &Order, secret: Secret) -> RelayerResult<()> {
        if order.status.is_terminal() {
            return Err(RelayerError::Validation(format!(
                "order {} is {} and no longer accepts a secret",
                order.order_id, order.status
            )));
        }
        if !verify_secret(&secret, &order.secret_hash) {
            return Err(RelayerError::Validation(format!(
                "secret does not match hash {}",
                order.secret_hash
            )));
        }
        self.secrets.insert(order.order_id.clone(), secret);
        Ok(())
    }

    pub fn get(&self, order_id: &str) -> Option<Secret> {
        self.secrets.get(order_id).map(|s| s.clone())
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.secrets.contains_key(order_id)
    }

    pub fn forget(&self, order_id: &str) {
        self.secrets.remove(order_id);
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.secrets.iter().map(|e| e.key().clone()).collect()
    }
}
