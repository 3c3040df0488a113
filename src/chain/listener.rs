//! Escrow-creation poller feeding the new-order channel

use super::gateway::{ChainSide, EscrowSnapshot};
use crate::error::{RelayerError, RelayerResult};
use crate::state::StateStore;
use crate::store::OrderStore;
use crate::tx::CommandSender;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// A maker escrow discovered on one side, not yet an order
#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub side: ChainSide,
    pub snapshot: EscrowSnapshot,
}

/// What a single poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub fetched: usize,
    pub forwarded: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub cursor: u64,
}

/// Polls one ledger for newly created escrows
pub struct EscrowListener {
    side: ChainSide,
    chain_id: String,
    sender: Arc<CommandSender>,
    state: Arc<dyn StateStore>,
    orders: Arc<OrderStore>,
    new_orders: mpsc::Sender<NewEscrow>,
    /// Next creation-log position to fetch from
    cursor: RwLock<u64>,
    poll_interval: Duration,
}

impl EscrowListener {
    /// Create a listener resuming from the persisted cursor
    pub async fn new(
        side: ChainSide,
        chain_id: String,
        sender: Arc<CommandSender>,
        state: Arc<dyn StateStore>,
        orders: Arc<OrderStore>,
        new_orders: mpsc::Sender<NewEscrow>,
        poll_interval: Duration,
    ) -> RelayerResult<Self> {
        let cursor = state.load_cursor(&chain_id).await?;
        info!("Chain {} ingestion resuming at cursor {}", chain_id, cursor);

        Ok(Self {
            side,
            chain_id,
            sender,
            state,
            orders,
            new_orders,
            cursor: RwLock::new(cursor),
            poll_interval,
        })
    }

    pub fn side(&self) -> ChainSide {
        self.side
    }

    pub async fn cursor(&self) -> u64 {
        *self.cursor.read().await
    }

    /// Fetch once and forward every new maker escrow.
    ///
    /// The cursor only advances when nothing was dropped, so escrows that
    /// did not fit in the channel are fetched again next time.
    pub async fn poll_once(&self) -> RelayerResult<PollOutcome> {
        let cursor = *self.cursor.read().await;
        let batch = self.sender.fetch_new_escrows(self.side, cursor).await?;

        let mut outcome = PollOutcome {
            fetched: batch.snapshots.len(),
            cursor,
            ..Default::default()
        };

        for snapshot in batch.snapshots {
            if snapshot.terms.is_none() {
                outcome.skipped += 1;
                continue;
            }
            let order_id = snapshot.escrow.id.to_hex();
            if self.orders.contains(&order_id).await {
                debug!("Chain {}: escrow {} already known", self.chain_id, order_id);
                outcome.skipped += 1;
                continue;
            }

            match self.new_orders.try_send(NewEscrow {
                side: self.side,
                snapshot,
            }) {
                Ok(()) => {
                    outcome.forwarded += 1;
                    crate::metrics::record_order_ingested(&self.chain_id);
                }
                Err(TrySendError::Full(dropped)) => {
                    warn!(
                        "Chain {}: new-order channel full, dropping escrow {}",
                        self.chain_id, dropped.snapshot.escrow_ref
                    );
                    crate::metrics::record_channel_drop(&self.chain_id);
                    outcome.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => return Err(RelayerError::Shutdown),
            }
        }

        if outcome.dropped == 0 && batch.next_cursor != cursor {
            *self.cursor.write().await = batch.next_cursor;
            outcome.cursor = batch.next_cursor;
            if let Err(e) = self.state.save_cursor(&self.chain_id, batch.next_cursor).await {
                warn!("Failed to save cursor for chain {}: {}", self.chain_id, e);
            }
        }

        if outcome.fetched > 0 {
            debug!(
                "Chain {}: fetched {}, forwarded {}, skipped {}, dropped {}",
                self.chain_id, outcome.fetched, outcome.forwarded, outcome.skipped, outcome.dropped
            );
        }
        Ok(outcome)
    }

    /// Poll until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(_) => {}
                        Err(RelayerError::Shutdown) => break,
                        Err(e) => warn!("Ingestion poll failed on chain {}: {}", self.chain_id, e),
                    }
                }
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Chain {} listener stopped", self.chain_id);
    }
}
