//! In-process ledger backed by the escrow model
//!
//! Behaves like a chain from the coordinator's point of view: a block
//! clock, block height for confirmation depth, an append-only creation
//! log for cursors, and typed rejections straight from [`Escrow`]. Faults
//! and latency can be injected to exercise the retry and timeout paths.

use super::gateway::{DeployParams, EscrowBatch, EscrowSnapshot, GatewayError, LedgerGateway, TxRef};
use crate::escrow::{compute_escrow_id, Escrow, EscrowError, EscrowParams, Secret, SecretHash};
use crate::order::SwapTerms;

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A maker opening a swap on this ledger
#[derive(Debug, Clone)]
pub struct OpenSwap {
    pub maker: String,
    pub taker: Option<String>,
    pub secret_hash: SecretHash,
    pub timelock: u64,
    pub allow_partial_fill: bool,
    pub minimum_fill_amount: u128,
    pub counterparty_chain_id: String,
    pub terms: SwapTerms,
    pub salt: String,
}

struct Entry {
    escrow: Escrow,
    terms: Option<SwapTerms>,
    changed_at_height: u64,
}

struct LedgerState {
    escrows: HashMap<String, Entry>,
    creation_log: Vec<String>,
    block_time: u64,
    height: u64,
    tx_counter: u64,
    faults: VecDeque<GatewayError>,
    latency: Option<Duration>,
    auto_fund_destinations: bool,
}

impl LedgerState {
    fn touch(&mut self, escrow_ref: &str) {
        self.height += 1;
        if let Some(entry) = self.escrows.get_mut(escrow_ref) {
            entry.changed_at_height = self.height;
        }
    }

    fn next_tx(&mut self, chain_id: &str) -> TxRef {
        self.tx_counter += 1;
        format!("{}-tx-{}", chain_id, self.tx_counter)
    }

    fn entry_mut(&mut self, escrow_ref: &str) -> Result<&mut Entry, GatewayError> {
        self.escrows
            .get_mut(escrow_ref)
            .ok_or_else(|| GatewayError::NotFound(escrow_ref.to_string()))
    }
}

pub struct SimulatedLedger {
    chain_id: String,
    state: Mutex<LedgerState>,
}

impl SimulatedLedger {
    pub fn new(chain_id: impl Into<String>, block_time: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            state: Mutex::new(LedgerState {
                escrows: HashMap::new(),
                creation_log: Vec::new(),
                block_time,
                height: 0,
                tx_counter: 0,
                faults: VecDeque::new(),
                latency: None,
                auto_fund_destinations: false,
            }),
        }
    }

    /// Have a resolver fund and confirm every destination escrow on deployment
    pub fn with_auto_fund(mut self, enabled: bool) -> Self {
        self.state.get_mut().auto_fund_destinations = enabled;
        self
    }

    /// Create and fund a maker escrow carrying swap terms. Returns its ref.
    pub async fn open_swap(&self, swap: OpenSwap) -> Result<String, EscrowError> {
        let id = compute_escrow_id(
            &swap.maker,
            swap.taker.as_deref(),
            &swap.secret_hash,
            swap.timelock,
            swap.salt.as_bytes(),
        );
        let amount = swap.terms.source_asset.amount;
        let mut escrow = Escrow::new(EscrowParams {
            id,
            maker: swap.maker,
            taker: swap.taker,
            secret_hash: swap.secret_hash,
            timelock: swap.timelock,
            expected_amount: amount,
            allow_partial_fill: swap.allow_partial_fill,
            minimum_fill_amount: swap.minimum_fill_amount,
            counterparty_chain_id: Some(swap.counterparty_chain_id),
        })?;
        escrow.fund(amount)?;

        let escrow_ref = id.to_hex();
        let mut state = self.state.lock().await;
        state.escrows.insert(
            escrow_ref.clone(),
            Entry {
                escrow,
                terms: Some(swap.terms),
                changed_at_height: 0,
            },
        );
        state.creation_log.push(escrow_ref.clone());
        state.touch(&escrow_ref);
        Ok(escrow_ref)
    }

    /// Record the paired escrow, as the escrow factory would after verifying it
    pub async fn confirm_source(&self, escrow_ref: &str, counterparty_ref: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.entry_mut(escrow_ref)?.escrow.confirm_source(counterparty_ref)?;
        state.touch(escrow_ref);
        Ok(())
    }

    pub async fn fund(&self, escrow_ref: &str, amount: u128) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.entry_mut(escrow_ref)?.escrow.fund(amount)?;
        state.touch(escrow_ref);
        Ok(())
    }

    /// Replace an escrow with an earlier state of itself, as a reorg would
    pub async fn reorg(&self, escrow_ref: &str, escrow: Escrow) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        state.entry_mut(escrow_ref)?.escrow = escrow;
        state.touch(escrow_ref);
        debug!("Chain {}: escrow {} rolled back", self.chain_id, escrow_ref);
        Ok(())
    }

    pub async fn set_block_time(&self, block_time: u64) {
        self.state.lock().await.block_time = block_time;
    }

    pub async fn advance_time(&self, secs: u64) {
        let mut state = self.state.lock().await;
        state.block_time += secs;
        state.height += 1;
    }

    pub async fn mine(&self, blocks: u64) {
        self.state.lock().await.height += blocks;
    }

    /// Fail the next gateway call with `error`
    pub async fn inject_fault(&self, error: GatewayError) {
        self.state.lock().await.faults.push_back(error);
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    pub async fn escrow(&self, escrow_ref: &str) -> Option<Escrow> {
        self.state
            .lock()
            .await
            .escrows
            .get(escrow_ref)
            .map(|e| e.escrow.clone())
    }

    pub async fn escrow_count(&self) -> usize {
        self.state.lock().await.escrows.len()
    }

    /// Pops an injected fault and reads the configured latency
    async fn begin_call(&self) -> Result<(), GatewayError> {
        let (fault, latency) = {
            let mut state = self.state.lock().await;
            (state.faults.pop_front(), state.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn snapshot(&self, state: &LedgerState, escrow_ref: &str) -> Option<EscrowSnapshot> {
        state.escrows.get(escrow_ref).map(|entry| EscrowSnapshot {
            chain_id: self.chain_id.clone(),
            escrow_ref: escrow_ref.to_string(),
            escrow: entry.escrow.clone(),
            confirmations: state.height.saturating_sub(entry.changed_at_height),
            terms: entry.terms.clone(),
        })
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    fn chain_id(&self) -> String {
        self.chain_id.clone()
    }

    async fn fetch_new_escrows(&self, since: u64) -> Result<EscrowBatch, GatewayError> {
        self.begin_call().await?;
        let state = self.state.lock().await;
        let start = (since as usize).min(state.creation_log.len());
        let snapshots = state.creation_log[start..]
            .iter()
            .filter_map(|escrow_ref| self.snapshot(&state, escrow_ref))
            .collect();

        Ok(EscrowBatch {
            snapshots,
            next_cursor: state.creation_log.len() as u64,
        })
    }

    async fn get_escrow_state(&self, escrow_ref: &str) -> Result<EscrowSnapshot, GatewayError> {
        self.begin_call().await?;
        let state = self.state.lock().await;
        self.snapshot(&state, escrow_ref)
            .ok_or_else(|| GatewayError::NotFound(escrow_ref.to_string()))
    }

    async fn deploy_destination_escrow(&self, params: &DeployParams) -> Result<String, GatewayError> {
        self.begin_call().await?;
        let id = params.predicted_escrow_id();
        let escrow_ref = id.to_hex();

        let mut state = self.state.lock().await;
        if state.escrows.contains_key(&escrow_ref) {
            return Err(GatewayError::DeploymentFailed(format!(
                "escrow {} already exists",
                escrow_ref
            )));
        }

        let mut escrow = Escrow::new(EscrowParams {
            id,
            maker: params.maker.clone(),
            taker: params.taker.clone(),
            secret_hash: params.secret_hash,
            timelock: params.timelock,
            expected_amount: params.expected_amount,
            allow_partial_fill: params.allow_partial_fill,
            minimum_fill_amount: params.minimum_fill_amount,
            counterparty_chain_id: Some(params.counterparty_chain_id.clone()),
        })
        .map_err(|e| GatewayError::DeploymentFailed(e.to_string()))?;

        if state.auto_fund_destinations {
            escrow.fund(params.expected_amount)?;
            escrow.confirm_source(&params.counterparty_escrow_ref)?;
        }

        state.escrows.insert(
            escrow_ref.clone(),
            Entry {
                escrow,
                terms: None,
                changed_at_height: 0,
            },
        );
        state.creation_log.push(escrow_ref.clone());
        state.touch(&escrow_ref);
        debug!("Chain {}: deployed destination escrow {}", self.chain_id, escrow_ref);
        Ok(escrow_ref)
    }

    async fn withdraw(&self, escrow_ref: &str, secret: &Secret) -> Result<TxRef, GatewayError> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        let now = state.block_time;
        state.entry_mut(escrow_ref)?.escrow.withdraw(secret, now)?;
        state.touch(escrow_ref);
        Ok(state.next_tx(&self.chain_id))
    }

    async fn partial_withdraw(
        &self,
        escrow_ref: &str,
        secret: &Secret,
        amount: u128,
    ) -> Result<TxRef, GatewayError> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        let now = state.block_time;
        state
            .entry_mut(escrow_ref)?
            .escrow
            .partial_withdraw(secret, amount, now)?;
        state.touch(escrow_ref);
        Ok(state.next_tx(&self.chain_id))
    }

    async fn cancel(&self, escrow_ref: &str) -> Result<TxRef, GatewayError> {
        self.begin_call().await?;
        let mut state = self.state.lock().await;
        let now = state.block_time;
        state.entry_mut(escrow_ref)?.escrow.cancel(now)?;
        state.touch(escrow_ref);
        Ok(state.next_tx(&self.chain_id))
    }

    async fn current_block_time(&self) -> Result<u64, GatewayError> {
        self.begin_call().await?;
        Ok(self.state.lock().await.block_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::{hash_secret, EscrowStatus};
    use crate::order::AssetInfo;

    fn terms(amount: u128) -> SwapTerms {
        SwapTerms {
            source_asset: AssetInfo {
                symbol: "CRO".into(),
                address: "basecro".into(),
                amount,
                decimals: 8,
            },
            destination_asset: AssetInfo {
                symbol: "ETH".into(),
                address: "0x0".into(),
                amount: amount / 2,
                decimals: 18,
            },
            auction: None,
            expires_at: 500,
        }
    }

    fn open(salt: &str) -> OpenSwap {
        OpenSwap {
            maker: "maker".into(),
            taker: None,
            secret_hash: hash_secret(&Secret([9u8; 32])),
            timelock: 1_000,
            allow_partial_fill: false,
            minimum_fill_amount: 0,
            counterparty_chain_id: "chain-b".into(),
            terms: terms(100),
            salt: salt.into(),
        }
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent_per_cursor() {
        let ledger = SimulatedLedger::new("chain-a", 100);
        ledger.open_swap(open("1")).await.unwrap();
        ledger.open_swap(open("2")).await.unwrap();

        let first = ledger.fetch_new_escrows(0).await.unwrap();
        let again = ledger.fetch_new_escrows(0).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.snapshots.len(), 2);
        assert_eq!(first.next_cursor, 2);

        let tail = ledger.fetch_new_escrows(first.next_cursor).await.unwrap();
        assert!(tail.snapshots.is_empty());
    }

    #[tokio::test]
    async fn test_claim_and_refund_follow_block_time() {
        let ledger = SimulatedLedger::new("chain-a", 100);
        let escrow_ref = ledger.open_swap(open("1")).await.unwrap();
        ledger.confirm_source(&escrow_ref, "dst").await.unwrap();

        assert!(matches!(
            ledger.cancel(&escrow_ref).await,
            Err(GatewayError::Rejected(EscrowError::TimelockNotExpired { .. }))
        ));
        assert_eq!(
            ledger.withdraw(&escrow_ref, &Secret([1u8; 32])).await,
            Err(GatewayError::Rejected(EscrowError::InvalidSecret))
        );
        ledger.withdraw(&escrow_ref, &Secret([9u8; 32])).await.unwrap();
        let escrow = ledger.escrow(&escrow_ref).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Withdrawn);
    }

    #[tokio::test]
    async fn test_injected_fault_applies_once() {
        let ledger = SimulatedLedger::new("chain-a", 100);
        ledger
            .inject_fault(GatewayError::Unavailable("maintenance".into()))
            .await;
        assert!(ledger.current_block_time().await.is_err());
        assert_eq!(ledger.current_block_time().await, Ok(100));
    }

    #[tokio::test]
    async fn test_deploy_rejects_duplicates_and_auto_funds() {
        let ledger = SimulatedLedger::new("chain-b", 100).with_auto_fund(true);
        let params = DeployParams {
            order_id: "order".into(),
            maker: "maker".into(),
            taker: None,
            secret_hash: hash_secret(&Secret([9u8; 32])),
            timelock: 900,
            expected_amount: 50,
            allow_partial_fill: false,
            minimum_fill_amount: 0,
            counterparty_chain_id: "chain-a".into(),
            counterparty_escrow_ref: "src".into(),
        };
        let escrow_ref = ledger.deploy_destination_escrow(&params).await.unwrap();
        assert_eq!(escrow_ref, params.predicted_escrow_id().to_hex());
        let snapshot = ledger.get_escrow_state(&escrow_ref).await.unwrap();
        assert_eq!(snapshot.escrow.status, EscrowStatus::SourceConfirmed);
        assert!(snapshot.terms.is_none());

        assert!(matches!(
            ledger.deploy_destination_escrow(&params).await,
            Err(GatewayError::DeploymentFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_confirmations_grow_with_height() {
        let ledger = SimulatedLedger::new("chain-a", 100);
        let escrow_ref = ledger.open_swap(open("1")).await.unwrap();
        assert_eq!(ledger.get_escrow_state(&escrow_ref).await.unwrap().confirmations, 0);
        ledger.mine(5).await;
        assert_eq!(ledger.get_escrow_state(&escrow_ref).await.unwrap().confirmations, 5);
    }
}
