use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{
    error::{MempoolError, MempoolResult},
    pool::PoolInner,
    Mempool, PoolConfig, PoolOperation, RemovalReason,
};
use crate::{
    common::types::{EntryPointLike, SolvedGasFields, UserOperation},
    op_pool::{
        reputation::{Reputation, ReputationManager},
        store::Store,
    },
};

/// User Operation Mempool
///
/// Wrapper around a pool object that implements thread-safety
/// via a RwLock. Safe to call from multiple threads. Methods
/// block on write locks. Pending operations and reputation are
/// persisted through the store and survive restarts.
pub struct UoPool<R: ReputationManager, E: EntryPointLike, S: Store> {
    config: PoolConfig,
    reputation: Arc<R>,
    entry_point_contract: Arc<E>,
    store: Arc<S>,
    state: RwLock<PoolInner>,
}

fn op_key(entry_point: Address, hash: H256) -> Vec<u8> {
    format!("op/{entry_point:?}/{hash:?}").into_bytes()
}

fn op_key_prefix(entry_point: Address) -> Vec<u8> {
    format!("op/{entry_point:?}/").into_bytes()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl<R, E, S> UoPool<R, E, S>
where
    R: ReputationManager,
    E: EntryPointLike,
    S: Store,
{
    pub fn new(
        config: PoolConfig,
        reputation: Arc<R>,
        entry_point_contract: Arc<E>,
        store: Arc<S>,
    ) -> Self {
        let entry_point = config.entry_point;
        Self {
            config,
            reputation,
            entry_point_contract,
            store,
            state: RwLock::new(PoolInner::new(entry_point)),
        }
    }

    /// Re-admits operations persisted by a previous run. In-flight state is
    /// not persisted, so everything restores as pending.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let entries = self
            .store
            .range_by_prefix(&op_key_prefix(self.config.entry_point))?;
        let mut restored = 0;
        let mut state = self.state.write();
        for (key, value) in entries {
            match serde_json::from_slice::<PoolOperation>(&value) {
                Ok(op) => {
                    if state.add_operation(op).is_ok() {
                        restored += 1;
                    }
                }
                Err(error) => {
                    warn!("Dropping unreadable persisted operation: {error:#}");
                    let _ = self.store.delete(&key);
                }
            }
        }
        Ok(restored)
    }

    fn persist(&self, op: &PoolOperation) {
        let key = op_key(self.config.entry_point, op.hash);
        match serde_json::to_vec(op) {
            Ok(value) => {
                if let Err(error) = self.store.put(&key, value) {
                    warn!("Failed to persist operation {:?}: {error:#}", op.hash);
                }
            }
            Err(error) => warn!("Failed to encode operation {:?}: {error:#}", op.hash),
        }
    }

    fn unpersist(&self, hash: H256) {
        if let Err(error) = self
            .store
            .delete(&op_key(self.config.entry_point, hash))
        {
            warn!("Failed to remove persisted operation {hash:?}: {error:#}");
        }
    }
}

#[async_trait]
impl<R, E, S> Mempool for UoPool<R, E, S>
where
    R: ReputationManager,
    E: EntryPointLike,
    S: Store,
{
    fn entry_point(&self) -> Address {
        self.config.entry_point
    }

    async fn add_operation(&self, op: UserOperation) -> MempoolResult<H256> {
        let sender = op.sender;
        let staked = match self.entry_point_contract.deposit_info(sender).await {
            Ok(info) => info.staked,
            Err(error) => {
                // Degrade to the throttled class rather than failing the add.
                warn!("Failed to read deposit info for {sender:?}: {error:#}");
                false
            }
        };
        self.reputation.set_staked(sender, staked);

        if !staked
            && self.state.read().sender_count(sender) >= self.config.max_ops_for_unstaked_sender
        {
            return Err(MempoolError::SenderThrottled(
                self.config.max_ops_for_unstaked_sender,
                sender,
            ));
        }

        let pool_op = PoolOperation {
            hash: op.op_hash(self.config.entry_point, self.config.chain_id),
            is_intent: op.has_intent(),
            solved: false,
            added_at: now_secs(),
            uo: op,
        };

        let added = self.state.write().add_operation(pool_op.clone())?;
        self.reputation.add_seen(sender);
        self.persist(&pool_op);
        if let Some(replaced) = added.replaced {
            self.unpersist(replaced.hash);
        }
        metrics::increment_counter!("op_pool_ops_added");
        Ok(added.hash)
    }

    fn get_operation(&self, hash: H256) -> Option<Arc<PoolOperation>> {
        self.state.read().get(hash)
    }

    fn has_hash(&self, hash: H256) -> bool {
        self.state.read().contains(hash)
    }

    fn ops_by_sender(&self, sender: Address) -> Vec<Arc<PoolOperation>> {
        self.state.read().ops_by_sender(sender)
    }

    fn all_operations(&self, max: usize) -> Vec<Arc<PoolOperation>> {
        self.state.read().best_operations().take(max).collect()
    }

    fn drain_for_batch(&self, max_ops: usize) -> Vec<Arc<PoolOperation>> {
        self.state.write().drain_for_batch(max_ops)
    }

    fn commit_batch(&self, hashes: &[H256]) {
        let removed = self.state.write().commit_batch(hashes);
        for op in removed {
            self.reputation.add_included(op.uo.sender);
            self.unpersist(op.hash);
        }
        metrics::increment_counter!("op_pool_batches_committed");
    }

    fn rollback_batch(&self, hashes: &[H256]) {
        self.state.write().rollback_batch(hashes);
    }

    fn remove_operation(&self, hash: H256, reason: RemovalReason) -> Option<Arc<PoolOperation>> {
        let removed = self.state.write().remove_operation_by_hash(hash)?;
        match &reason {
            RemovalReason::InvalidIntent => self.reputation.add_invalid_intent(removed.uo.sender),
            RemovalReason::Expired if removed.is_intent => {
                self.reputation.add_expired_intent(removed.uo.sender)
            }
            _ => {}
        }
        self.unpersist(hash);
        info!("Removed operation {hash:?}: {reason:?}");
        Some(removed)
    }

    fn apply_solution(
        &self,
        hash: H256,
        solution: Bytes,
        gas: SolvedGasFields,
    ) -> MempoolResult<()> {
        let solved = self.state.write().apply_solution(hash, solution, gas)?;
        self.persist(&solved);
        metrics::increment_counter!("op_pool_solutions_applied");
        Ok(())
    }

    fn remove_expired(&self) -> Vec<H256> {
        let now = now_secs();
        let expired = self
            .state
            .read()
            .expired_hashes(now, self.config.max_op_ttl.as_secs());
        for hash in &expired {
            self.remove_operation(*hash, RemovalReason::Expired);
        }
        expired
    }

    fn clear(&self) {
        let mut state = self.state.write();
        state.clear();
        match self
            .store
            .range_by_prefix(&op_key_prefix(self.config.entry_point))
        {
            Ok(entries) => {
                for (key, _) in entries {
                    let _ = self.store.delete(&key);
                }
            }
            Err(error) => warn!("Failed to clear persisted operations: {error:#}"),
        }
        self.reputation.clear();
    }

    fn dump_reputation(&self) -> Vec<Reputation> {
        self.reputation.dump_reputation()
    }

    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64, staked: bool) {
        self.reputation
            .set_reputation(address, ops_seen, ops_included, staked)
    }
}
