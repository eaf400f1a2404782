use std::ops::Deref;

use anyhow::Context;
use async_trait::async_trait;
use ethers::{
    abi::AbiDecode,
    contract::ContractError,
    providers::Middleware,
    types::{transaction::eip2718::TypedTransaction, Address, H256, U256},
};
#[cfg(test)]
use mockall::automock;

use crate::common::{
    contracts::{DepositInfo, FailedOp, IEntryPoint},
    gas::GasFees,
    types::UserOperation,
};

/// Interface to the on-chain EntryPoint used for estimation, submission,
/// and stake lookups.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EntryPointLike: Send + Sync + 'static {
    fn address(&self) -> Address;

    /// Estimates gas for `handleOps(ops, beneficiary)`. Reverts carrying a
    /// `FailedOp(opIndex, reason)` payload are decoded so that callers can
    /// prune the offending operation and retry.
    async fn estimate_handle_ops_gas(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> anyhow::Result<HandleOpsOut>;

    /// Signs and broadcasts `handleOps(ops, beneficiary)` with the given gas
    /// limit and fees, returning the transaction hash.
    async fn send_bundle(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        gas: U256,
        gas_fees: GasFees,
    ) -> anyhow::Result<H256>;

    async fn deposit_info(&self, address: Address) -> anyhow::Result<DepositInfo>;
}

#[derive(Clone, Debug)]
pub enum HandleOpsOut {
    SuccessWithGas(U256),
    FailedOp(usize, String),
}

#[async_trait]
impl<M> EntryPointLike for IEntryPoint<M>
where
    M: Middleware + 'static,
{
    fn address(&self) -> Address {
        self.deref().address()
    }

    async fn estimate_handle_ops_gas(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
    ) -> anyhow::Result<HandleOpsOut> {
        let result = self.handle_ops(ops, beneficiary).estimate_gas().await;
        let error = match result {
            Ok(gas) => return Ok(HandleOpsOut::SuccessWithGas(gas)),
            Err(error) => error,
        };
        if let ContractError::Revert(revert_data) = &error {
            if let Ok(FailedOp { op_index, reason }) = FailedOp::decode(revert_data) {
                return Ok(HandleOpsOut::FailedOp(op_index.as_usize(), reason));
            }
        }
        Err(error).context("should estimate gas for handleOps")?
    }

    async fn send_bundle(
        &self,
        ops: Vec<UserOperation>,
        beneficiary: Address,
        gas: U256,
        gas_fees: GasFees,
    ) -> anyhow::Result<H256> {
        let mut call = self.handle_ops(ops, beneficiary).gas(gas);
        if let TypedTransaction::Eip1559(ref mut tx) = call.tx {
            tx.max_fee_per_gas = Some(gas_fees.max_fee_per_gas);
            tx.max_priority_fee_per_gas = Some(gas_fees.max_priority_fee_per_gas);
        }
        Ok(call
            .send()
            .await
            .context("should send bundle transaction")?
            .tx_hash())
    }

    async fn deposit_info(&self, address: Address) -> anyhow::Result<DepositInfo> {
        self.get_deposit_info(address)
            .call()
            .await
            .context("entry point should return deposit info")
    }
}
