mod error;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
pub use error::EthRpcError;
use ethers::{
    abi::AbiDecode,
    contract::EthEvent,
    types::{
        transaction::eip2718::TypedTransaction, Address, Eip1559TransactionRequest, Filter, Log,
        H256, U256,
    },
};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use tracing::info;

use crate::{
    common::{
        eth::log_to_raw_log,
        gas::calc_pre_verification_gas,
        math, precheck,
        types::{
            IEntryPointCalls, ProviderLike, StateOverride, UserOperation,
            UserOperationEventFilter,
        },
    },
    intents::IntentSink,
    op_pool::{Mempool, RemovalReason},
    rpc::{
        EstimationSettings, GasEstimate, RichUserOperation, RpcAddress, RpcUserOperation,
        UserOperationOptionalGas, UserOperationReceipt,
    },
};

// Estimates leave headroom for the entry point's own bookkeeping.
const GAS_BUFFER_PERCENT: u64 = 10;
const VERIFICATION_GAS_FLOOR: u64 = 40_000;

/// Eth API
#[rpc(server, namespace = "eth")]
pub trait EthApi {
    #[method(name = "sendUserOperation")]
    async fn send_user_operation(&self, op: RpcUserOperation, entry_point: Address)
        -> RpcResult<H256>;

    #[method(name = "estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        op: UserOperationOptionalGas,
        entry_point: Address,
        state_override: Option<StateOverride>,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "getUserOperationByHash")]
    async fn get_user_operation_by_hash(&self, hash: H256) -> RpcResult<Option<RichUserOperation>>;

    #[method(name = "getUserOperationReceipt")]
    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>>;

    #[method(name = "supportedEntryPoints")]
    async fn supported_entry_points(&self) -> RpcResult<Vec<RpcAddress>>;

    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U256>;
}

/// Everything the RPC surface needs for one supported entry point.
pub struct EntryPointStack<M, I> {
    pub address: Address,
    pub mempool: Arc<M>,
    pub intents: Arc<I>,
}

impl<M, I> Clone for EntryPointStack<M, I> {
    fn clone(&self) -> Self {
        Self {
            address: self.address,
            mempool: self.mempool.clone(),
            intents: self.intents.clone(),
        }
    }
}

pub struct EthApi<M, I, P> {
    stacks: Vec<EntryPointStack<M, I>>,
    provider: Arc<P>,
    chain_id: u64,
    precheck_settings: precheck::Settings,
    estimation_settings: EstimationSettings,
}

impl<M, I, P> EthApi<M, I, P>
where
    M: Mempool,
    I: IntentSink,
    P: ProviderLike,
{
    pub fn new(
        stacks: Vec<EntryPointStack<M, I>>,
        provider: Arc<P>,
        chain_id: u64,
        precheck_settings: precheck::Settings,
        estimation_settings: EstimationSettings,
    ) -> Self {
        Self {
            stacks,
            provider,
            chain_id,
            precheck_settings,
            estimation_settings,
        }
    }

    fn stack_for(&self, entry_point: Address) -> Result<&EntryPointStack<M, I>, EthRpcError> {
        self.stacks
            .iter()
            .find(|stack| stack.address == entry_point)
            .ok_or_else(|| {
                EthRpcError::InvalidParams(format!(
                    "entry point {entry_point:?} is not supported"
                ))
            })
    }

    fn entry_point_addresses(&self) -> Vec<Address> {
        self.stacks.iter().map(|stack| stack.address).collect()
    }

    async fn get_user_operation_event_by_hash(&self, hash: H256) -> anyhow::Result<Option<Log>> {
        let filter = Filter::new()
            .address(self.entry_point_addresses())
            .topic0(UserOperationEventFilter::signature())
            .topic1(hash);
        let logs = self.provider.get_logs(filter).await?;
        Ok(logs.into_iter().next())
    }

    fn get_user_operations_from_tx_data(
        &self,
        tx_data: ethers::types::Bytes,
    ) -> anyhow::Result<Vec<UserOperation>> {
        let entry_point_calls = IEntryPointCalls::decode(tx_data)
            .context("should parse tx data as calls to the entry point")?;
        match entry_point_calls {
            IEntryPointCalls::HandleOps(handle_ops_call) => Ok(handle_ops_call.ops),
            _ => anyhow::bail!("tx should contain user operations"),
        }
    }

    /// Estimates the gas of the operation's inner call and of the entry
    /// point executing it, with the sender's balance overridden so that
    /// estimation is not blocked by lack of funds.
    async fn estimate_conventional_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
        overrides: StateOverride,
        pre_verification_gas: U256,
    ) -> anyhow::Result<(U256, U256)> {
        let call_tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(entry_point)
            .to(op.sender)
            .data(op.call_data.clone())
            .into();
        let call_gas = self
            .provider
            .estimate_gas(call_tx, Some(overrides.clone()))
            .await?;

        let handle_ops_data = IEntryPointCalls::HandleOps(crate::common::types::HandleOpsCall {
            ops: vec![op.clone()],
            beneficiary: op.sender,
        });
        let handle_ops_tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(op.sender)
            .to(entry_point)
            .data(ethers::abi::AbiEncode::encode(handle_ops_data))
            .into();
        let total_gas = self
            .provider
            .estimate_gas(handle_ops_tx, Some(overrides))
            .await?;

        let verification_gas = total_gas
            .saturating_sub(call_gas)
            .saturating_sub(pre_verification_gas)
            .max(VERIFICATION_GAS_FLOOR.into());
        Ok((verification_gas, call_gas))
    }
}

#[async_trait]
impl<M, I, P> EthApiServer for EthApi<M, I, P>
where
    M: Mempool,
    I: IntentSink,
    P: ProviderLike,
{
    async fn send_user_operation(
        &self,
        op: RpcUserOperation,
        entry_point: Address,
    ) -> RpcResult<H256> {
        let stack = self.stack_for(entry_point)?;
        let uo: UserOperation = op.into();

        precheck::check_user_operation(&uo, &self.precheck_settings)
            .map_err(EthRpcError::from)?;

        let has_intent = uo.has_intent();
        let hash = stack
            .mempool
            .add_operation(uo.clone())
            .await
            .map_err(EthRpcError::from)?;

        if has_intent {
            if let Err(error) = stack.intents.identify(&uo, hash) {
                // A malformed intent body never stays in the mempool.
                stack
                    .mempool
                    .remove_operation(hash, RemovalReason::InvalidIntent);
                return Err(EthRpcError::from(error))?;
            }
        }

        info!("Accepted user operation {hash:?} from {:?}", uo.sender);
        Ok(hash)
    }

    async fn estimate_user_operation_gas(
        &self,
        op: UserOperationOptionalGas,
        entry_point: Address,
        state_override: Option<StateOverride>,
    ) -> RpcResult<GasEstimate> {
        self.stack_for(entry_point)?;
        let mut uo = op.into_user_operation(&self.estimation_settings);

        // Fill zero fee caps from the node's oracle for more reliable
        // estimations upstream.
        if uo.max_fee_per_gas.is_zero() {
            let fees = self
                .provider
                .suggested_gas_fees()
                .await
                .map_err(EthRpcError::Internal)?;
            uo.max_fee_per_gas = fees.max_fee_per_gas;
            uo.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        }

        let mut overrides = state_override.unwrap_or_default();
        if uo.paymaster().is_none() {
            overrides = overrides.with_max_balance(uo.sender);
        }

        let pre_verification_gas = calc_pre_verification_gas(&uo);

        // An intent's calldata is not final until solved, so there is
        // nothing to simulate yet; answer with the capped limits.
        if uo.has_intent() {
            return Ok(GasEstimate {
                pre_verification_gas,
                verification_gas_limit: uo.verification_gas_limit,
                call_gas_limit: uo.call_gas_limit,
            });
        }

        let (verification_gas, call_gas) = self
            .estimate_conventional_gas(&uo, entry_point, overrides, pre_verification_gas)
            .await
            .map_err(EthRpcError::Internal)?;

        Ok(GasEstimate {
            pre_verification_gas,
            verification_gas_limit: math::increase_by_percent(verification_gas, GAS_BUFFER_PERCENT)
                .min(self.estimation_settings.max_verification_gas.into()),
            call_gas_limit: math::increase_by_percent(call_gas, GAS_BUFFER_PERCENT)
                .min(self.estimation_settings.max_call_gas.into()),
        })
    }

    async fn get_user_operation_by_hash(&self, hash: H256) -> RpcResult<Option<RichUserOperation>> {
        if hash == H256::zero() {
            return Err(EthRpcError::InvalidParams(
                "hash cannot be zero".to_string(),
            ))?;
        }

        let event = self
            .get_user_operation_event_by_hash(hash)
            .await
            .context("should have successfully queried for user op events by hash")
            .map_err(EthRpcError::Internal)?;
        let Some(event) = event else {
            return Ok(None);
        };

        let transaction_hash = event
            .transaction_hash
            .context("tx_hash should be present")
            .map_err(EthRpcError::Internal)?;
        let tx = self
            .provider
            .get_transaction(transaction_hash)
            .await
            .context("should have fetched tx from provider")
            .map_err(EthRpcError::Internal)?
            .context("should have found tx")
            .map_err(EthRpcError::Internal)?;

        let to = match tx.to {
            Some(to) if self.entry_point_addresses().contains(&to) => to,
            _ => {
                return Err(EthRpcError::Internal(anyhow::anyhow!(
                    "tx should have been sent to an entry point"
                )))?
            }
        };

        let decoded = UserOperationEventFilter::decode_log(&log_to_raw_log(event))
            .context("should have decoded user operation event")
            .map_err(EthRpcError::Internal)?;

        let user_operation = self
            .get_user_operations_from_tx_data(tx.input)
            .map_err(EthRpcError::Internal)?
            .into_iter()
            .find(|op| op.sender == decoded.sender && op.nonce == decoded.nonce)
            .context("matching user operation should be found in tx data")
            .map_err(EthRpcError::Internal)?;

        Ok(Some(RichUserOperation {
            user_operation: user_operation.into(),
            entry_point: to.into(),
            block_number: tx
                .block_number
                .map(|n| U256::from(n.as_u64()))
                .unwrap_or_default(),
            block_hash: tx.block_hash.unwrap_or_default(),
            transaction_hash,
        }))
    }

    async fn get_user_operation_receipt(
        &self,
        hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>> {
        if hash == H256::zero() {
            return Err(EthRpcError::InvalidParams(
                "hash cannot be zero".to_string(),
            ))?;
        }

        // Still pooled: a placeholder receipt with nonce "-1" until the
        // operation makes it into a batch.
        if self.stacks.iter().any(|stack| stack.mempool.has_hash(hash)) {
            return Ok(Some(UserOperationReceipt::pending(hash)));
        }

        let event = self
            .get_user_operation_event_by_hash(hash)
            .await
            .map_err(EthRpcError::Internal)?;
        let Some(event) = event else {
            return Ok(None);
        };

        let entry_point = event.address;
        let transaction_hash = event
            .transaction_hash
            .context("tx_hash should be present")
            .map_err(EthRpcError::Internal)?;
        let receipt = self
            .provider
            .get_transaction_receipt(transaction_hash)
            .await
            .map_err(EthRpcError::Internal)?;

        let decoded = UserOperationEventFilter::decode_log(&log_to_raw_log(event.clone()))
            .context("should have decoded user operation event")
            .map_err(EthRpcError::Internal)?;

        Ok(Some(UserOperationReceipt {
            user_op_hash: hash,
            entry_point: Some(entry_point.into()),
            sender: Some(decoded.sender.into()),
            nonce: format!("{:#x}", decoded.nonce),
            paymaster: Some(decoded.paymaster.into()),
            actual_gas_cost: decoded.actual_gas_cost,
            actual_gas_used: decoded.actual_gas_used,
            success: decoded.success,
            logs: vec![event],
            receipt,
        }))
    }

    async fn supported_entry_points(&self) -> RpcResult<Vec<RpcAddress>> {
        Ok(self
            .entry_point_addresses()
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn chain_id(&self) -> RpcResult<U256> {
        Ok(self.chain_id.into())
    }
}
