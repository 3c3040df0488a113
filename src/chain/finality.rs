//! Confirmation depth and rollback detection for escrow observations
//!
//! An escrow state is only acted on once enough blocks sit on top of its
//! last change. The tracker also remembers the furthest progress seen for
//! each escrow; a snapshot showing less progress means the chain
//! reorganised and the observation is not trusted until it is itself final.

use super::gateway::EscrowSnapshot;
use crate::escrow::EscrowStatus;

use dashmap::DashMap;
use tracing::{debug, warn};

/// Outcome of checking one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    Final,
    Pending { have: u64, need: u64 },
    Regressed { from: EscrowStatus, to: EscrowStatus },
}

impl Finality {
    pub fn is_final(&self) -> bool {
        matches!(self, Finality::Final)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    status: EscrowStatus,
    filled_amount: u128,
}

impl Progress {
    fn of(snapshot: &EscrowSnapshot) -> Self {
        Self {
            status: snapshot.escrow.status,
            filled_amount: snapshot.escrow.filled_amount,
        }
    }

    fn is_behind(&self, other: &Progress) -> bool {
        self.status.rank() < other.status.rank() || self.filled_amount < other.filled_amount
    }
}

/// Tracks finality for escrows on one chain
pub struct FinalityTracker {
    chain_id: String,
    confirmation_blocks: u64,
    /// escrow_ref -> furthest progress observed
    seen: DashMap<String, Progress>,
    /// escrow_ref -> state it rolled back to, until that state is final
    rollbacks: DashMap<String, Progress>,
}

impl FinalityTracker {
    pub fn new(chain_id: impl Into<String>, confirmation_blocks: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            confirmation_blocks,
            seen: DashMap::new(),
            rollbacks: DashMap::new(),
        }
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
    }

    /// Check a snapshot and record its progress if it moved forward.
    ///
    /// A rollback is reported as `Regressed` once. The rolled back state
    /// then waits out the confirmation depth like any other change and,
    /// once final, replaces the recorded progress.
    pub fn assess(&self, snapshot: &EscrowSnapshot) -> Finality {
        let current = Progress::of(snapshot);
        let escrow_ref = &snapshot.escrow_ref;

        if let Some(previous) = self.seen.get(escrow_ref).map(|p| *p) {
            if current.is_behind(&previous) {
                let known = self.rollbacks.get(escrow_ref).map(|p| *p);
                if known != Some(current) {
                    warn!(
                        "Reorg detected on chain {}: escrow {} went from {} to {}",
                        self.chain_id, escrow_ref, previous.status, current.status
                    );
                    crate::metrics::record_reorg(&self.chain_id);
                    self.rollbacks.insert(escrow_ref.clone(), current);
                    return Finality::Regressed {
                        from: previous.status,
                        to: current.status,
                    };
                }
                if snapshot.confirmations < self.confirmation_blocks {
                    return Finality::Pending {
                        have: snapshot.confirmations,
                        need: self.confirmation_blocks,
                    };
                }
                warn!(
                    "Escrow {} on chain {} is final at {} after a reorg; rebasing",
                    escrow_ref, self.chain_id, current.status
                );
            }
        }

        self.rollbacks.remove(escrow_ref);
        self.seen.insert(escrow_ref.clone(), current);

        if snapshot.confirmations < self.confirmation_blocks {
            debug!(
                "Escrow {} has {} / {} confirmations on chain {}",
                escrow_ref, snapshot.confirmations, self.confirmation_blocks, self.chain_id
            );
            return Finality::Pending {
                have: snapshot.confirmations,
                need: self.confirmation_blocks,
            };
        }

        Finality::Final
    }

    /// Forget an escrow once its order is archived
    pub fn forget(&self, escrow_ref: &str) {
        self.seen.remove(escrow_ref);
        self.rollbacks.remove(escrow_ref);
    }

    pub fn tracked_count(&self) -> usize {
        self.seen.len()
    }

    /// Clear old entries (call periodically)
    pub fn cleanup_cache(&self, max_entries: usize) {
        if self.seen.len() > max_entries {
            let settled: Vec<String> = self
                .seen
                .iter()
                .filter(|e| e.value().status.is_terminal())
                .map(|e| e.key().clone())
                .collect();
            for key in settled {
                self.seen.remove(&key);
            }
        }
    }
}
