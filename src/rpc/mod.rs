mod debug;
mod eth;
mod health;
mod metrics;
mod proxy;
mod task;

pub use debug::DebugApi;
pub use eth::{EntryPointStack, EthApi, EthRpcError};
use ethers::{
    types::{Address, Bytes, Log, TransactionReceipt, H160, H256, U256},
    utils::to_checksum,
};
pub use health::HealthChecker;
pub use proxy::MethodProxyLayer;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use task::{Args as RpcTaskArgs, RpcTask};

use crate::{
    common::types::UserOperation,
    op_pool::Reputation,
};

/// Address wrapper that serializes in checksummed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcAddress(H160);

impl Serialize for RpcAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_checksum(&self.0, None))
    }
}

impl<'de> Deserialize<'de> for RpcAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let address = Address::deserialize(deserializer)?;
        Ok(RpcAddress(address))
    }
}

impl From<RpcAddress> for Address {
    fn from(rpc_addr: RpcAddress) -> Self {
        rpc_addr.0
    }
}

impl From<Address> for RpcAddress {
    fn from(addr: Address) -> Self {
        RpcAddress(addr)
    }
}

/// User operation definition for RPC and the solver wire protocol.
/// Numeric fields are hex strings per ERC-4337.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcUserOperation {
    sender: RpcAddress,
    nonce: U256,
    init_code: Bytes,
    call_data: Bytes,
    call_gas_limit: U256,
    verification_gas_limit: U256,
    pre_verification_gas: U256,
    max_fee_per_gas: U256,
    max_priority_fee_per_gas: U256,
    paymaster_and_data: Bytes,
    signature: Bytes,
}

impl From<UserOperation> for RpcUserOperation {
    fn from(op: UserOperation) -> Self {
        RpcUserOperation {
            sender: op.sender.into(),
            nonce: op.nonce,
            init_code: op.init_code,
            call_data: op.call_data,
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: op.paymaster_and_data,
            signature: op.signature,
        }
    }
}

impl From<RpcUserOperation> for UserOperation {
    fn from(def: RpcUserOperation) -> Self {
        UserOperation {
            sender: def.sender.into(),
            nonce: def.nonce,
            init_code: def.init_code,
            call_data: def.call_data,
            call_gas_limit: def.call_gas_limit,
            verification_gas_limit: def.verification_gas_limit,
            pre_verification_gas: def.pre_verification_gas,
            max_fee_per_gas: def.max_fee_per_gas,
            max_priority_fee_per_gas: def.max_priority_fee_per_gas,
            paymaster_and_data: def.paymaster_and_data,
            signature: def.signature,
        }
    }
}

/// User operation with optional gas fields for gas estimation RPC
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationOptionalGas {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub pre_verification_gas: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperationOptionalGas {
    pub fn into_user_operation(self, settings: &EstimationSettings) -> UserOperation {
        UserOperation {
            sender: self.sender,
            nonce: self.nonce,
            init_code: self.init_code,
            call_data: self.call_data,
            paymaster_and_data: self.paymaster_and_data,
            signature: self.signature,
            // If unset, default these to gas limits from settings
            // Cap their values to the gas limits from settings
            verification_gas_limit: self
                .verification_gas_limit
                .unwrap_or_else(|| settings.max_verification_gas.into())
                .min(settings.max_verification_gas.into()),
            call_gas_limit: self
                .call_gas_limit
                .unwrap_or_else(|| settings.max_call_gas.into())
                .min(settings.max_call_gas.into()),
            // These aren't used in gas estimation, set to 0 if unset so that
            // there are no payment attempts during gas estimation
            pre_verification_gas: self.pre_verification_gas.unwrap_or_default(),
            max_fee_per_gas: self.max_fee_per_gas.unwrap_or_default(),
            max_priority_fee_per_gas: self.max_priority_fee_per_gas.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EstimationSettings {
    pub max_verification_gas: u64,
    pub max_call_gas: u64,
}

/// Gas estimate for a user operation
#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
}

/// User operation with additional metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichUserOperation {
    pub user_operation: RpcUserOperation,
    pub entry_point: RpcAddress,
    pub block_number: U256,
    pub block_hash: H256,
    pub transaction_hash: H256,
}

/// User operation receipt. While an operation is still pooled, a placeholder
/// with nonce `"-1"` and no transaction receipt is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    pub user_op_hash: H256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<RpcAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<RpcAddress>,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<RpcAddress>,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub success: bool,
    pub logs: Vec<Log>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
}

impl UserOperationReceipt {
    /// The placeholder receipt for an operation still in the mempool.
    pub fn pending(user_op_hash: H256) -> Self {
        Self {
            user_op_hash,
            entry_point: None,
            sender: None,
            nonce: "-1".to_string(),
            paymaster: None,
            actual_gas_cost: U256::zero(),
            actual_gas_used: U256::zero(),
            success: false,
            logs: vec![],
            receipt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReputation {
    pub address: Address,
    pub ops_seen: U256,
    pub ops_included: U256,
    #[serde(default)]
    pub invalid_intents: U256,
    #[serde(default)]
    pub expired_intents: U256,
    #[serde(default)]
    pub staked: bool,
}

impl From<Reputation> for RpcReputation {
    fn from(reputation: Reputation) -> Self {
        RpcReputation {
            address: reputation.address,
            ops_seen: reputation.ops_seen.into(),
            ops_included: reputation.ops_included.into(),
            invalid_intents: reputation.invalid_intents.into(),
            expired_intents: reputation.expired_intents.into(),
            staked: reputation.staked,
        }
    }
}
