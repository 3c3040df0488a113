//! Escrow model shared by both ledger sides
//!
//! Pure data and state-transition rules for a single HTLC escrow leg:
//! - Hashlock primitives (secret, digest, deterministic escrow id)
//! - Funding, source confirmation, full and partial withdraw, refund
//!
//! Nothing in here performs I/O. Every transition either succeeds or
//! returns a typed [`EscrowError`].

mod hashlock;
mod model;

pub use hashlock::{compute_escrow_id, hash_secret, verify_secret, EscrowId, Secret, SecretHash};
pub use model::{Escrow, EscrowError, EscrowParams, EscrowStatus};
