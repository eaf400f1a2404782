use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
#[cfg(test)]
use mockall::automock;
use tokio::time::sleep;
use tracing::info;

use crate::common::{
    math,
    types::{EntryPointLike, ProviderLike, UserOperation},
};

// Overhead on gas estimates to account for inaccuracies.
const GAS_ESTIMATE_OVERHEAD_PERCENT: u64 = 10;

/// Interval between inclusion polls after a bundle is broadcast.
const INCLUSION_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The bundle transaction could not be built or broadcast. The batch is
    /// rolled back to the mempool.
    #[error("bundle submission failed: {0:#}")]
    Submission(#[source] anyhow::Error),
    /// The transaction was broadcast but not mined within the wait timeout.
    /// The batch stays committed; the transaction may still land.
    #[error("transaction {tx_hash:?} not included within {timeout:?}")]
    InclusionTimeout { tx_hash: H256, timeout: Duration },
    /// The transaction was mined with a failed status.
    #[error("transaction {tx_hash:?} reverted on chain")]
    Reverted { tx_hash: H256 },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleRelayer: Send + Sync + 'static {
    /// Builds, signs, and broadcasts `handleOps(ops, beneficiary)` with the
    /// given gas estimate and the prevailing base fee plus tip.
    async fn submit(&self, ops: Vec<UserOperation>, gas_estimate: U256)
        -> Result<H256, RelayError>;

    /// Polls for inclusion up to the configured timeout. Returns the block
    /// number on success, or `None` when waiting is disabled.
    async fn wait_until_mined(&self, tx_hash: H256) -> Result<Option<u64>, RelayError>;
}

/// Relays batches to the EntryPoint through a single signing EOA.
///
/// This only works for a private mempool; the bundler is not a block builder
/// and relayed transactions are open to frontrunning.
pub struct Relayer<E: EntryPointLike, P: ProviderLike> {
    entry_point: Arc<E>,
    provider: Arc<P>,
    beneficiary: Address,
    wait_timeout: Duration,
}

impl<E: EntryPointLike, P: ProviderLike> Relayer<E, P> {
    pub fn new(
        entry_point: Arc<E>,
        provider: Arc<P>,
        beneficiary: Address,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            entry_point,
            provider,
            beneficiary,
            wait_timeout,
        }
    }
}

#[async_trait]
impl<E: EntryPointLike, P: ProviderLike> BundleRelayer for Relayer<E, P> {
    async fn submit(
        &self,
        ops: Vec<UserOperation>,
        gas_estimate: U256,
    ) -> Result<H256, RelayError> {
        let gas_fees = self
            .provider
            .suggested_gas_fees()
            .await
            .map_err(RelayError::Submission)?;
        let gas_limit = math::increase_by_percent(gas_estimate, GAS_ESTIMATE_OVERHEAD_PERCENT);

        let tx_hash = self
            .entry_point
            .send_bundle(ops, self.beneficiary, gas_limit, gas_fees)
            .await
            .map_err(RelayError::Submission)?;
        info!("Broadcast bundle transaction {tx_hash:?} with gas limit {gas_limit}");
        metrics::increment_counter!("relayer_bundles_sent");
        Ok(tx_hash)
    }

    async fn wait_until_mined(&self, tx_hash: H256) -> Result<Option<u64>, RelayError> {
        // A zero timeout disables waiting (fire-and-forget).
        if self.wait_timeout.is_zero() {
            return Ok(None);
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let receipt = self
                .provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(RelayError::Submission)?;
            if let Some(receipt) = receipt {
                if receipt.status == Some(1.into()) {
                    let block_number = receipt
                        .block_number
                        .map(|number| number.as_u64())
                        .unwrap_or_default();
                    metrics::increment_counter!("relayer_bundles_mined");
                    return Ok(Some(block_number));
                }
                metrics::increment_counter!("relayer_bundles_reverted");
                return Err(RelayError::Reverted { tx_hash });
            }
            if Instant::now() >= deadline {
                metrics::increment_counter!("relayer_inclusion_timeouts");
                return Err(RelayError::InclusionTimeout {
                    tx_hash,
                    timeout: self.wait_timeout,
                });
            }
            sleep(INCLUSION_POLL_INTERVAL.min(self.wait_timeout)).await;
        }
    }
}
