use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::{
    common::types::{EntryPointLike, HandleOpsOut, UserOperation},
    intents::{pipeline::IntentPipeline, SolverLike},
    op_pool::{Mempool, PoolOperation, RemovalReason},
};

/// Gas floor assumed per operation when deriving the batch size cap from
/// the batch gas limit.
const MIN_OP_GAS_FLOOR: u64 = 100_000;

#[derive(Debug)]
pub struct Bundle {
    pub ops: Vec<UserOperation>,
    /// Admission hashes of `ops`, same order. Used for commit/rollback.
    pub hashes: Vec<H256>,
    pub gas_estimate: U256,
    /// Operations pruned by estimation reverts, with the revert reason.
    pub rejected: Vec<(H256, String)>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleProposer: Send + Sync + 'static {
    /// Assembles the next batch: drains the mempool, sidelines unsolved
    /// intents, and estimates gas, pruning operations the entry point
    /// reverts on. Returns `None` when nothing is ready to submit.
    async fn make_bundle(&self) -> anyhow::Result<Option<Bundle>>;
}

pub struct BundleProposerImpl<M, E, SL>
where
    M: Mempool,
    E: EntryPointLike,
    SL: SolverLike,
{
    mempool: Arc<M>,
    entry_point: Arc<E>,
    pipeline: Arc<IntentPipeline<M, SL>>,
    beneficiary: Address,
    max_batch_gas_limit: u64,
}

impl<M, E, SL> BundleProposerImpl<M, E, SL>
where
    M: Mempool,
    E: EntryPointLike,
    SL: SolverLike,
{
    pub fn new(
        mempool: Arc<M>,
        entry_point: Arc<E>,
        pipeline: Arc<IntentPipeline<M, SL>>,
        beneficiary: Address,
        max_batch_gas_limit: u64,
    ) -> Self {
        Self {
            mempool,
            entry_point,
            pipeline,
            beneficiary,
            max_batch_gas_limit,
        }
    }

    fn max_ops_per_batch(&self) -> usize {
        (self.max_batch_gas_limit / MIN_OP_GAS_FLOOR).max(1) as usize
    }
}

#[async_trait]
impl<M, E, SL> BundleProposer for BundleProposerImpl<M, E, SL>
where
    M: Mempool,
    E: EntryPointLike,
    SL: SolverLike,
{
    async fn make_bundle(&self) -> anyhow::Result<Option<Bundle>> {
        // TTL housekeeping before selection.
        self.mempool.remove_expired();

        let drained = self.mempool.drain_for_batch(self.max_ops_per_batch());
        if drained.is_empty() {
            return Ok(None);
        }

        let (ready, unsolved): (Vec<Arc<PoolOperation>>, Vec<Arc<PoolOperation>>) =
            drained.into_iter().partition(|op| op.is_bundle_ready());

        // Unsolved intents never ship. Return them to pending and hand them
        // to the pipeline for an opportunistic one-shot solve that must not
        // hold up the conventional path.
        if !unsolved.is_empty() {
            let hashes: Vec<H256> = unsolved.iter().map(|op| op.hash).collect();
            self.mempool.rollback_batch(&hashes);
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move { pipeline.solve_batch(unsolved).await });
        }

        if ready.is_empty() {
            return Ok(None);
        }

        let mut ops = ready;
        let mut rejected = Vec::new();
        let gas_estimate = loop {
            let batch: Vec<UserOperation> = ops.iter().map(|op| op.uo.clone()).collect();
            match self
                .entry_point
                .estimate_handle_ops_gas(batch, self.beneficiary)
                .await
            {
                Ok(HandleOpsOut::SuccessWithGas(gas)) => break gas,
                Ok(HandleOpsOut::FailedOp(index, reason)) => {
                    if index >= ops.len() {
                        let hashes: Vec<H256> = ops.iter().map(|op| op.hash).collect();
                        self.mempool.rollback_batch(&hashes);
                        anyhow::bail!(
                            "entry point reverted with op index {index} out of range ({} ops)",
                            ops.len()
                        );
                    }
                    let offender = ops.remove(index);
                    warn!(
                        "Dropping operation {:?} after estimation revert: {reason}",
                        offender.hash
                    );
                    self.mempool.remove_operation(
                        offender.hash,
                        RemovalReason::EstimationRevert {
                            reason: reason.clone(),
                        },
                    );
                    rejected.push((offender.hash, reason));
                    metrics::increment_counter!("builder_ops_rejected");
                    if ops.is_empty() {
                        return Ok(None);
                    }
                }
                Err(error) => {
                    let hashes: Vec<H256> = ops.iter().map(|op| op.hash).collect();
                    self.mempool.rollback_batch(&hashes);
                    return Err(error);
                }
            }
        };

        Ok(Some(Bundle {
            hashes: ops.iter().map(|op| op.hash).collect(),
            ops: ops.iter().map(|op| op.uo.clone()).collect(),
            gas_estimate,
            rejected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Bytes;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        common::types::MockEntryPointLike,
        intents::{pipeline, solver::MockSolverLike},
        op_pool::MockMempool,
    };

    const MAX_BATCH_GAS: u64 = 25_000_000;

    #[tokio::test]
    async fn empty_pool_yields_no_bundle() {
        let mut mempool = MockMempool::new();
        mempool.expect_remove_expired().returning(Vec::new);
        mempool.expect_drain_for_batch().returning(|_| Vec::new());

        let proposer = create_proposer(mempool, MockEntryPointLike::new());
        assert!(proposer.make_bundle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_size_derived_from_gas_budget() {
        let mut mempool = MockMempool::new();
        mempool.expect_remove_expired().returning(Vec::new);
        mempool
            .expect_drain_for_batch()
            .with(eq((MAX_BATCH_GAS / 100_000) as usize))
            .times(1)
            .returning(|_| Vec::new());

        let proposer = create_proposer(mempool, MockEntryPointLike::new());
        proposer.make_bundle().await.unwrap();
    }

    #[tokio::test]
    async fn unsolved_intents_are_sidelined() {
        let conventional = conventional_op(1);
        let unsolved = unsolved_intent_op(2);
        let unsolved_hash = unsolved.hash;

        let mut mempool = MockMempool::new();
        mempool.expect_remove_expired().returning(Vec::new);
        let drained = vec![conventional.clone(), unsolved.clone()];
        mempool
            .expect_drain_for_batch()
            .return_once(move |_| drained);
        mempool
            .expect_rollback_batch()
            .withf(move |hashes| hashes == [unsolved_hash])
            .times(1)
            .returning(|_| ());

        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_estimate_handle_ops_gas()
            .withf(|ops, _| ops.len() == 1)
            .returning(|_, _| Ok(HandleOpsOut::SuccessWithGas(500_000.into())));

        let proposer = create_proposer(mempool, entry_point);
        let bundle = proposer.make_bundle().await.unwrap().unwrap();
        assert_eq!(bundle.hashes, vec![conventional.hash]);
        assert_eq!(bundle.gas_estimate, 500_000.into());
    }

    #[tokio::test]
    async fn estimation_revert_prunes_exactly_the_offender() {
        let ops: Vec<Arc<PoolOperation>> = (0..3).map(conventional_op).collect();
        let pruned_hash = ops[1].hash;
        let survivors: Vec<H256> = vec![ops[0].hash, ops[2].hash];

        let mut mempool = MockMempool::new();
        mempool.expect_remove_expired().returning(Vec::new);
        let drained = ops.clone();
        mempool
            .expect_drain_for_batch()
            .return_once(move |_| drained);
        mempool
            .expect_remove_operation()
            .withf(move |hash, reason| {
                *hash == pruned_hash
                    && *reason
                        == RemovalReason::EstimationRevert {
                            reason: "AA23 reverted".to_string(),
                        }
            })
            .times(1)
            .returning(|_, _| None);

        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_estimate_handle_ops_gas()
            .withf(|ops, _| ops.len() == 3)
            .times(1)
            .returning(|_, _| Ok(HandleOpsOut::FailedOp(1, "AA23 reverted".to_string())));
        entry_point
            .expect_estimate_handle_ops_gas()
            .withf(|ops, _| ops.len() == 2)
            .times(1)
            .returning(|_, _| Ok(HandleOpsOut::SuccessWithGas(400_000.into())));

        let proposer = create_proposer(mempool, entry_point);
        let bundle = proposer.make_bundle().await.unwrap().unwrap();
        assert_eq!(bundle.hashes, survivors);
        assert_eq!(bundle.rejected.len(), 1);
        assert_eq!(bundle.rejected[0].0, pruned_hash);
        assert_eq!(bundle.rejected[0].1, "AA23 reverted");
    }

    #[tokio::test]
    async fn estimation_error_rolls_back_batch() {
        let op = conventional_op(1);
        let hash = op.hash;

        let mut mempool = MockMempool::new();
        mempool.expect_remove_expired().returning(Vec::new);
        let drained = vec![op];
        mempool
            .expect_drain_for_batch()
            .return_once(move |_| drained);
        mempool
            .expect_rollback_batch()
            .withf(move |hashes| hashes == [hash])
            .times(1)
            .returning(|_| ());

        let mut entry_point = MockEntryPointLike::new();
        entry_point
            .expect_estimate_handle_ops_gas()
            .returning(|_, _| Err(anyhow::anyhow!("node unreachable")));

        let proposer = create_proposer(mempool, entry_point);
        assert!(proposer.make_bundle().await.is_err());
    }

    fn create_proposer(
        mempool: MockMempool,
        entry_point: MockEntryPointLike,
    ) -> BundleProposerImpl<MockMempool, MockEntryPointLike, MockSolverLike> {
        let pipeline_mempool = Arc::new(MockMempool::new());
        // The opportunistic batch-time solve runs detached; a failing solver
        // there must not touch the mempool.
        let mut solver = MockSolverLike::new();
        solver.expect_solve().returning(|_| {
            Err(crate::intents::SolverError::Protocol(
                "solver offline".to_string(),
            ))
        });
        let pipeline = Arc::new(IntentPipeline::new(
            Address::zero(),
            pipeline_mempool,
            Arc::new(solver),
            pipeline::Settings::default(),
        ));
        BundleProposerImpl::new(
            Arc::new(mempool),
            Arc::new(entry_point),
            pipeline,
            Address::random(),
            MAX_BATCH_GAS,
        )
    }

    fn conventional_op(nonce: u64) -> Arc<PoolOperation> {
        let uo = UserOperation {
            sender: Address::random(),
            nonce: nonce.into(),
            ..UserOperation::default()
        };
        Arc::new(PoolOperation {
            hash: uo.op_hash(Address::zero(), 1337),
            uo,
            is_intent: false,
            solved: false,
            added_at: 0,
        })
    }

    fn unsolved_intent_op(nonce: u64) -> Arc<PoolOperation> {
        let uo = UserOperation {
            sender: Address::random(),
            nonce: nonce.into(),
            call_data: Bytes::from(br#"{"kind":"swap"}"#.to_vec()),
            ..UserOperation::default()
        };
        Arc::new(PoolOperation {
            hash: uo.op_hash(Address::zero(), 1337),
            uo,
            is_intent: true,
            solved: false,
            added_at: 0,
        })
    }
}
