mod error;
mod pool;
pub mod uo_pool;

use std::sync::Arc;

use async_trait::async_trait;
pub use error::*;
use ethers::types::{Address, Bytes, H256};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{
    common::types::{SolvedGasFields, UserOperation},
    op_pool::reputation::Reputation,
};

/// Why an operation was dropped from the pool. Feeds the originating
/// sender's reputation counters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemovalReason {
    /// The operation made `handleOps` gas estimation revert.
    EstimationRevert { reason: String },
    /// The operation or its intent outlived its time-to-live.
    Expired,
    /// The intent body was malformed or the solver marked it invalid.
    InvalidIntent,
}

/// In-memory operation pool for a single entry point.
///
/// Operations are keyed by the hash computed at admission time; that hash is
/// stable across a solution being applied to an intent operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Mempool: Send + Sync + 'static {
    /// Returns the entry point address this pool targets.
    fn entry_point(&self) -> Address;

    /// Adds a validated user operation to the pool, returning its hash.
    async fn add_operation(&self, op: UserOperation) -> MempoolResult<H256>;

    fn get_operation(&self, hash: H256) -> Option<Arc<PoolOperation>>;

    /// True for any operation in either pending or in-flight state.
    fn has_hash(&self, hash: H256) -> bool;

    /// The sender's pending operations in nonce order.
    fn ops_by_sender(&self, sender: Address) -> Vec<Arc<PoolOperation>>;

    /// Every pooled operation, best fees first, up to `max`.
    fn all_operations(&self, max: usize) -> Vec<Arc<PoolOperation>>;

    /// Selects up to `max_ops` operations for a batch, at most one per
    /// sender, ordered by priority fee. Selected operations are marked
    /// in-flight until committed or rolled back.
    fn drain_for_batch(&self, max_ops: usize) -> Vec<Arc<PoolOperation>>;

    /// Removes in-flight operations that landed in a submitted batch.
    fn commit_batch(&self, hashes: &[H256]);

    /// Returns in-flight operations to the pending state.
    fn rollback_batch(&self, hashes: &[H256]);

    /// Unconditional drop, used for expiry and revert-driven pruning.
    fn remove_operation(&self, hash: H256, reason: RemovalReason) -> Option<Arc<PoolOperation>>;

    /// Writes a solver-provided solution into a pooled intent operation.
    /// The operation keeps its admission hash. Fails if the operation is
    /// unknown or was already solved.
    fn apply_solution(
        &self,
        hash: H256,
        solution: Bytes,
        gas: SolvedGasFields,
    ) -> MempoolResult<()>;

    /// Drops pending operations older than the pool's TTL.
    fn remove_expired(&self) -> Vec<H256>;

    /// Debug methods

    /// Clears the mempool
    fn clear(&self);

    /// Dumps the mempool's reputation tracking
    fn dump_reputation(&self) -> Vec<Reputation>;

    /// Overwrites the mempool's reputation for an address
    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64, staked: bool);
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolOperation {
    pub uo: UserOperation,
    /// Hash computed once at admission; the operation's identity everywhere.
    pub hash: H256,
    pub is_intent: bool,
    /// Set when a solution has been applied to an intent operation.
    pub solved: bool,
    /// Admission time, unix seconds.
    pub added_at: u64,
}

impl PoolOperation {
    /// Ready to go on chain: conventional, or an intent with its solution
    /// applied.
    pub fn is_bundle_ready(&self) -> bool {
        !self.is_intent || self.solved
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub entry_point: Address,
    pub chain_id: u64,
    pub max_ops_for_unstaked_sender: usize,
    pub max_op_ttl: std::time::Duration,
}
