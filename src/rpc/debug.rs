use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ethers::types::{Address, H256};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

use crate::{
    builder::{BundleTrigger, SendBundleResult},
    common::types::BundlingMode,
    op_pool::Mempool,
    rpc::{eth::EthRpcError, RpcReputation, RpcUserOperation},
};

/// Debug API
#[rpc(server, namespace = "debug")]
pub trait DebugApi {
    #[method(name = "bundler_clearState")]
    async fn bundler_clear_state(&self) -> RpcResult<String>;

    #[method(name = "bundler_dumpMempool")]
    async fn bundler_dump_mempool(&self, entry_point: Address) -> RpcResult<Vec<RpcUserOperation>>;

    #[method(name = "bundler_sendBundleNow")]
    async fn bundler_send_bundle_now(&self, entry_point: Address) -> RpcResult<H256>;

    #[method(name = "bundler_setBundlingMode")]
    async fn bundler_set_bundling_mode(&self, mode: String) -> RpcResult<String>;

    #[method(name = "bundler_setReputation")]
    async fn bundler_set_reputation(
        &self,
        reputations: Vec<RpcReputation>,
        entry_point: Address,
    ) -> RpcResult<String>;

    #[method(name = "bundler_dumpReputation")]
    async fn bundler_dump_reputation(&self, entry_point: Address) -> RpcResult<Vec<RpcReputation>>;
}

pub struct DebugApi<M> {
    mempools: HashMap<Address, Arc<M>>,
    triggers: HashMap<Address, BundleTrigger>,
}

impl<M: Mempool> DebugApi<M> {
    pub fn new(mempools: HashMap<Address, Arc<M>>, triggers: HashMap<Address, BundleTrigger>) -> Self {
        Self { mempools, triggers }
    }

    fn mempool(&self, entry_point: Address) -> Result<&Arc<M>, EthRpcError> {
        self.mempools.get(&entry_point).ok_or_else(|| {
            EthRpcError::InvalidParams(format!("entry point {entry_point:?} is not supported"))
        })
    }
}

#[async_trait]
impl<M: Mempool> DebugApiServer for DebugApi<M> {
    async fn bundler_clear_state(&self) -> RpcResult<String> {
        for mempool in self.mempools.values() {
            mempool.clear();
        }
        Ok("ok".to_string())
    }

    async fn bundler_dump_mempool(&self, entry_point: Address) -> RpcResult<Vec<RpcUserOperation>> {
        Ok(self
            .mempool(entry_point)?
            .all_operations(usize::MAX)
            .into_iter()
            .map(|op| op.uo.clone().into())
            .collect())
    }

    async fn bundler_send_bundle_now(&self, entry_point: Address) -> RpcResult<H256> {
        let trigger = self.triggers.get(&entry_point).ok_or_else(|| {
            EthRpcError::InvalidParams(format!("entry point {entry_point:?} is not supported"))
        })?;
        match trigger
            .send_bundle_now()
            .await
            .map_err(EthRpcError::Internal)?
        {
            SendBundleResult::Success { tx_hash, .. } => Ok(tx_hash),
            SendBundleResult::NoOperations => Ok(H256::zero()),
            SendBundleResult::Error(error) => Err(EthRpcError::Internal(error))?,
        }
    }

    async fn bundler_set_bundling_mode(&self, mode: String) -> RpcResult<String> {
        let mode: BundlingMode = mode
            .parse()
            .map_err(|_| EthRpcError::InvalidParams(format!("invalid bundling mode: {mode}")))?;
        for trigger in self.triggers.values() {
            trigger.set_bundling_mode(mode);
        }
        Ok("ok".to_string())
    }

    async fn bundler_set_reputation(
        &self,
        reputations: Vec<RpcReputation>,
        entry_point: Address,
    ) -> RpcResult<String> {
        let mempool = self.mempool(entry_point)?;
        for reputation in reputations {
            mempool.set_reputation(
                reputation.address,
                reputation.ops_seen.as_u64(),
                reputation.ops_included.as_u64(),
                reputation.staked,
            );
        }
        Ok("ok".to_string())
    }

    async fn bundler_dump_reputation(&self, entry_point: Address) -> RpcResult<Vec<RpcReputation>> {
        Ok(self
            .mempool(entry_point)?
            .dump_reputation()
            .into_iter()
            .map(Into::into)
            .collect())
    }
}
