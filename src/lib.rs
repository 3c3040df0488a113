//! HTLC Swap Relayer library
//!
//! Coordinates hash-time-locked swaps between two ledgers: ingests maker
//! escrows, deploys their counterparts, runs the Dutch auction, tracks
//! partial fills and settles or refunds both legs.

pub mod api;
pub mod auction;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod escrow;
pub mod events;
pub mod fill;
pub mod metrics;
pub mod order;
pub mod state;
pub mod store;
pub mod tx;

pub use error::{RelayerError, RelayerResult};
