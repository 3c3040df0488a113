//! Coordination engine for cross-chain swap orchestration
//!
//! The coordination engine:
//! 1. Ingests maker escrows from both ledgers as pending orders
//! 2. Deploys the matching destination escrow for each order
//! 3. Reconciles every active order against both ledgers
//! 4. Drives auction prices, expiry and refunds

pub mod clock;
pub mod engine;
pub mod reconcile;
mod sweeps;
pub mod vault;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{CoordinationEngine, EngineStatus, RestoreSummary};
pub use reconcile::{
    apply_observation, plan_reconciliation, LegCommand, LegObservation, Observation,
    ReconcileOutcome, ReconcilePlan, ReconcilePolicy, ReconcileSummary,
};
pub use vault::SecretVault;
