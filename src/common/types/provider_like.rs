use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    providers::{JsonRpcClient, Middleware, Provider},
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, Filter, Log, Transaction,
        TransactionReceipt, H256, U256, U64,
    },
};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::common::gas::GasFees;

/// The slice of the Ethereum node's RPC surface the bundler depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderLike: Send + Sync + 'static {
    /// Current fee suggestion from the node: prevailing base fee plus tip.
    async fn suggested_gas_fees(&self) -> anyhow::Result<GasFees>;

    /// `eth_estimateGas`, optionally with a state override set.
    async fn estimate_gas(
        &self,
        tx: TypedTransaction,
        state_override: Option<StateOverride>,
    ) -> anyhow::Result<U256>;

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>>;

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>>;

    async fn get_logs(&self, filter: Filter) -> anyhow::Result<Vec<Log>>;
}

#[async_trait]
impl<C> ProviderLike for Provider<C>
where
    C: JsonRpcClient + 'static,
{
    async fn suggested_gas_fees(&self) -> anyhow::Result<GasFees> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .estimate_eip1559_fees(None)
            .await
            .context("should estimate EIP-1559 fees")?;
        Ok(GasFees {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn estimate_gas(
        &self,
        tx: TypedTransaction,
        state_override: Option<StateOverride>,
    ) -> anyhow::Result<U256> {
        match state_override {
            Some(overrides) => self
                .request("eth_estimateGas", (tx, "latest", overrides))
                .await
                .context("should estimate gas with state override"),
            None => Middleware::estimate_gas(self, &tx, None)
                .await
                .context("should estimate gas"),
        }
    }

    async fn get_transaction(&self, hash: H256) -> anyhow::Result<Option<Transaction>> {
        Middleware::get_transaction(self, hash)
            .await
            .context("should fetch transaction")
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> anyhow::Result<Option<TransactionReceipt>> {
        Middleware::get_transaction_receipt(self, hash)
            .await
            .context("should fetch transaction receipt")
    }

    async fn get_logs(&self, filter: Filter) -> anyhow::Result<Vec<Log>> {
        Middleware::get_logs(self, &filter)
            .await
            .context("should fetch logs")
    }
}

/// State override set for `eth_estimateGas` / `eth_call`, keyed by account.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateOverride(pub BTreeMap<Address, AccountOverride>);

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<BTreeMap<H256, H256>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<BTreeMap<H256, H256>>,
}

impl StateOverride {
    /// Overrides the account balance to the maximum uint96 so that gas
    /// estimation is not blocked by lack of funds.
    pub fn with_max_balance(mut self, address: Address) -> Self {
        let max_uint96 = (U256::one() << 96) - 1;
        self.0.entry(address).or_default().balance = Some(max_uint96);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_balance_override() {
        let address = Address::random();
        let overrides = StateOverride::default().with_max_balance(address);
        let expected = (U256::one() << 96) - 1;
        assert_eq!(overrides.0[&address].balance, Some(expected));

        let json = serde_json::to_value(&overrides).unwrap();
        let entry = &json[format!("{address:?}")];
        assert_eq!(
            entry["balance"].as_str().unwrap(),
            format!("{expected:#x}")
        );
    }
}
