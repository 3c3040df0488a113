//! Command sender: every gateway call bounded by a timeout

use crate::chain::{
    ChainManager, ChainSide, DeployParams, EscrowBatch, EscrowSnapshot, GatewayError, TxRef,
};
use crate::error::{RelayerError, RelayerResult};
use crate::escrow::Secret;
use crate::order::CommandKind;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A state-changing call against one escrow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCommand {
    Withdraw {
        escrow_ref: String,
        secret: Secret,
    },
    PartialWithdraw {
        escrow_ref: String,
        secret: Secret,
        amount: u128,
    },
    Cancel {
        escrow_ref: String,
    },
}

impl ChainCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            ChainCommand::Withdraw { .. } => CommandKind::Withdraw,
            ChainCommand::PartialWithdraw { .. } => CommandKind::PartialWithdraw,
            ChainCommand::Cancel { .. } => CommandKind::Cancel,
        }
    }

    pub fn escrow_ref(&self) -> &str {
        match self {
            ChainCommand::Withdraw { escrow_ref, .. }
            | ChainCommand::PartialWithdraw { escrow_ref, .. }
            | ChainCommand::Cancel { escrow_ref } => escrow_ref,
        }
    }

    pub fn amount(&self) -> Option<u128> {
        match self {
            ChainCommand::PartialWithdraw { amount, .. } => Some(*amount),
            _ => None,
        }
    }
}

/// Issues gateway calls on behalf of the coordinator
pub struct CommandSender {
    chains: Arc<ChainManager>,
    call_timeout: Duration,
}

impl CommandSender {
    pub fn new(chains: Arc<ChainManager>, call_timeout: Duration) -> Self {
        Self {
            chains,
            call_timeout,
        }
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    /// Run one gateway call under the timeout; a timeout is a transient failure
    async fn bounded<T, Fut>(&self, chain_id: &str, operation: &'static str, call: Fut) -> RelayerResult<T>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let started = Instant::now();
        let result = timeout(self.call_timeout, call).await;
        crate::metrics::record_gateway_latency(chain_id, operation, started.elapsed());

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RelayerError::gateway(chain_id, e)),
            Err(_) => {
                warn!(
                    "Gateway call {} on chain {} timed out after {:?}",
                    operation, chain_id, self.call_timeout
                );
                Err(RelayerError::gateway(
                    chain_id,
                    GatewayError::Timeout(self.call_timeout),
                ))
            }
        }
    }

    pub async fn fetch_new_escrows(&self, side: ChainSide, cursor: u64) -> RelayerResult<EscrowBatch> {
        let gateway = self.chains.gateway(side)?;
        let chain_id = gateway.chain_id();
        self.bounded(&chain_id, "fetch_new_escrows", gateway.fetch_new_escrows(cursor))
            .await
    }

    pub async fn escrow_state(&self, side: ChainSide, escrow_ref: &str) -> RelayerResult<EscrowSnapshot> {
        let gateway = self.chains.gateway(side)?;
        let chain_id = gateway.chain_id();
        self.bounded(&chain_id, "get_escrow_state", gateway.get_escrow_state(escrow_ref))
            .await
    }

    /// The chain's current time, also cached on the chain manager
    pub async fn block_time(&self, side: ChainSide) -> RelayerResult<u64> {
        let gateway = self.chains.gateway(side)?;
        let chain_id = gateway.chain_id();
        let block_time = self
            .bounded(&chain_id, "current_block_time", gateway.current_block_time())
            .await?;
        self.chains.record_block_time(side, block_time);
        Ok(block_time)
    }

    pub async fn deploy_destination(&self, side: ChainSide, params: &DeployParams) -> RelayerResult<String> {
        let gateway = self.chains.gateway(side)?;
        let chain_id = gateway.chain_id();
        let kind = CommandKind::DeployDestination;

        match self
            .bounded(&chain_id, kind.as_str(), gateway.deploy_destination_escrow(params))
            .await
        {
            Ok(escrow_ref) => {
                info!(
                    "Deployed destination escrow {} on chain {} for order {}",
                    escrow_ref, chain_id, params.order_id
                );
                crate::metrics::record_command_submitted(&chain_id, kind);
                Ok(escrow_ref)
            }
            Err(e) => {
                crate::metrics::record_command_failed(&chain_id, kind, e.class());
                Err(e)
            }
        }
    }

    /// Submit a withdraw, partial withdraw or cancel
    pub async fn execute(&self, side: ChainSide, command: &ChainCommand) -> RelayerResult<TxRef> {
        let gateway = self.chains.gateway(side)?;
        let chain_id = gateway.chain_id();
        let kind = command.kind();

        let result = match command {
            ChainCommand::Withdraw { escrow_ref, secret } => {
                self.bounded(&chain_id, kind.as_str(), gateway.withdraw(escrow_ref, secret))
                    .await
            }
            ChainCommand::PartialWithdraw {
                escrow_ref,
                secret,
                amount,
            } => {
                self.bounded(
                    &chain_id,
                    kind.as_str(),
                    gateway.partial_withdraw(escrow_ref, secret, *amount),
                )
                .await
            }
            ChainCommand::Cancel { escrow_ref } => {
                self.bounded(&chain_id, kind.as_str(), gateway.cancel(escrow_ref))
                    .await
            }
        };

        match &result {
            Ok(tx_ref) => {
                debug!(
                    "{} on escrow {} accepted by chain {} as {}",
                    kind.as_str(),
                    command.escrow_ref(),
                    chain_id,
                    tx_ref
                );
                crate::metrics::record_command_submitted(&chain_id, kind);
            }
            Err(e) => {
                crate::metrics::record_command_failed(&chain_id, kind, e.class());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainHandle, SimulatedLedger};
    use crate::error::ErrorClass;

    fn sender() -> (CommandSender, Arc<SimulatedLedger>) {
        let a = Arc::new(SimulatedLedger::new("chain-a", 100));
        let b = Arc::new(SimulatedLedger::new("chain-b", 200));
        let chains = ChainManager::new(
            ChainHandle::new(ChainSide::A, "A", a.clone(), 0),
            ChainHandle::new(ChainSide::B, "B", b, 0),
        )
        .unwrap();
        (
            CommandSender::new(Arc::new(chains), Duration::from_millis(50)),
            a,
        )
    }

    #[tokio::test]
    async fn test_block_time_is_cached() {
        let (sender, _) = sender();
        assert_eq!(sender.block_time(ChainSide::B).await.unwrap(), 200);
        assert_eq!(sender.chains().last_block_time(ChainSide::B), Some(200));
    }

    #[tokio::test]
    async fn test_slow_gateway_times_out_as_transient() {
        let (sender, ledger) = sender();
        ledger.set_latency(Some(Duration::from_millis(500))).await;

        let err = sender.block_time(ChainSide::A).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ChainTransient);
        assert!(matches!(
            err,
            RelayerError::Gateway {
                source: GatewayError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_escrow_is_permanent() {
        let (sender, _) = sender();
        let err = sender
            .execute(
                ChainSide::A,
                &ChainCommand::Cancel {
                    escrow_ref: "missing".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ChainPermanent);
    }
}
