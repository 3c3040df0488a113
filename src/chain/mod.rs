//! Chain module - the two ledgers a swap spans
//!
//! This module provides:
//! - The [`LedgerGateway`] capability each chain adapter implements
//! - Escrow-creation polling with persisted cursors
//! - Confirmation depth and reorg regression tracking
//! - An in-process simulated ledger

pub mod finality;
pub mod gateway;
pub mod listener;
pub mod simulated;

pub use finality::{Finality, FinalityTracker};
pub use gateway::{
    ChainSide, DeployParams, EscrowBatch, EscrowSnapshot, GatewayError, LedgerGateway, TxRef,
};
pub use listener::{EscrowListener, NewEscrow, PollOutcome};
pub use simulated::{OpenSwap, SimulatedLedger};

use crate::config::{ChainKind, Settings};
use crate::error::{RelayerError, RelayerResult};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// One configured ledger
pub struct ChainHandle {
    pub side: ChainSide,
    pub chain_id: String,
    pub name: String,
    pub gateway: Arc<dyn LedgerGateway>,
    pub finality: Arc<FinalityTracker>,
}

impl ChainHandle {
    pub fn new(
        side: ChainSide,
        name: impl Into<String>,
        gateway: Arc<dyn LedgerGateway>,
        confirmation_blocks: u64,
    ) -> Self {
        let chain_id = gateway.chain_id();
        Self {
            side,
            finality: Arc::new(FinalityTracker::new(chain_id.clone(), confirmation_blocks)),
            chain_id,
            name: name.into(),
            gateway,
        }
    }
}

/// Manages both ledgers of the swap pair
pub struct ChainManager {
    handles: DashMap<ChainSide, Arc<ChainHandle>>,
    /// Last block time observed per side
    block_times: DashMap<ChainSide, u64>,
}

impl ChainManager {
    pub fn new(a: ChainHandle, b: ChainHandle) -> RelayerResult<Self> {
        if a.side != ChainSide::A || b.side != ChainSide::B {
            return Err(RelayerError::Config(
                "chain handles must be given as side a then side b".to_string(),
            ));
        }
        if a.chain_id == b.chain_id {
            return Err(RelayerError::Config(format!(
                "both sides use chain id {}",
                a.chain_id
            )));
        }

        let handles = DashMap::new();
        for handle in [a, b] {
            info!(
                "Chain {} ({}) registered as side {}",
                handle.name, handle.chain_id, handle.side
            );
            handles.insert(handle.side, Arc::new(handle));
        }

        Ok(Self {
            handles,
            block_times: DashMap::new(),
        })
    }

    /// Build gateways for the configured chains
    pub fn from_settings(settings: &Settings) -> RelayerResult<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        let mut built = Vec::with_capacity(2);
        for side in ChainSide::BOTH {
            let config = settings.chain(side).ok_or_else(|| {
                RelayerError::Config(format!("chain {} is not configured", side))
            })?;
            let gateway: Arc<dyn LedgerGateway> = match config.kind {
                ChainKind::Simulated => {
                    warn!(
                        "Chain {} uses the simulated ledger; no real funds move",
                        config.name
                    );
                    Arc::new(SimulatedLedger::new(config.chain_id.clone(), now))
                }
            };
            built.push(ChainHandle::new(
                side,
                config.name.clone(),
                gateway,
                config.confirmation_blocks,
            ));
        }

        let b = built.pop();
        let a = built.pop();
        match (a, b) {
            (Some(a), Some(b)) => Self::new(a, b),
            _ => Err(RelayerError::Config("two chains are required".to_string())),
        }
    }

    pub fn handle(&self, side: ChainSide) -> RelayerResult<Arc<ChainHandle>> {
        self.handles
            .get(&side)
            .map(|h| h.clone())
            .ok_or_else(|| RelayerError::Config(format!("chain side {} not registered", side)))
    }

    pub fn gateway(&self, side: ChainSide) -> RelayerResult<Arc<dyn LedgerGateway>> {
        Ok(self.handle(side)?.gateway.clone())
    }

    pub fn finality(&self, side: ChainSide) -> RelayerResult<Arc<FinalityTracker>> {
        Ok(self.handle(side)?.finality.clone())
    }

    pub fn chain_id(&self, side: ChainSide) -> RelayerResult<String> {
        Ok(self.handle(side)?.chain_id.clone())
    }

    pub fn side_of_chain(&self, chain_id: &str) -> Option<ChainSide> {
        self.handles
            .iter()
            .find(|h| h.value().chain_id == chain_id)
            .map(|h| *h.key())
    }

    pub fn record_block_time(&self, side: ChainSide, block_time: u64) {
        self.block_times
            .entry(side)
            .and_modify(|t| *t = (*t).max(block_time))
            .or_insert(block_time);
    }

    pub fn last_block_time(&self, side: ChainSide) -> Option<u64> {
        self.block_times.get(&side).map(|t| *t)
    }

    /// Health check for both chains
    pub async fn health_check(&self, timeout: Duration) -> Vec<(ChainSide, String, bool)> {
        let mut results = Vec::new();

        for side in ChainSide::BOTH {
            let Ok(handle) = self.handle(side) else {
                continue;
            };
            let healthy =
                match tokio::time::timeout(timeout, handle.gateway.current_block_time()).await {
                    Ok(Ok(block_time)) => {
                        self.record_block_time(side, block_time);
                        true
                    }
                    Ok(Err(e)) => {
                        warn!("Chain {} unhealthy: {}", handle.chain_id, e);
                        false
                    }
                    Err(_) => {
                        warn!("Chain {} health check timed out", handle.chain_id);
                        false
                    }
                };
            crate::metrics::record_chain_health(&handle.chain_id, healthy);
            results.push((side, handle.chain_id.clone(), healthy));
        }

        results
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<String> {
        ChainSide::BOTH
            .iter()
            .filter_map(|side| self.handles.get(side).map(|h| h.chain_id.clone()))
            .collect()
    }
}
