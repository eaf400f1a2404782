use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use ethers::types::{Address, H256};
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    queue::KeyedQueue, solver::SolverLike, Intent, ProcessingStatus, SolverBody, UserOperationExt,
    DEFAULT_INTENT_TTL,
};
use crate::{
    common::{handle::Task, types::{SolvedGasFields, UserOperation}},
    op_pool::{Mempool, PoolOperation, RemovalReason},
    rpc::RpcUserOperation,
};

/// Receives intent operations as the RPC frontend admits them.
#[cfg_attr(test, automock)]
pub trait IntentSink: Send + Sync + 'static {
    /// Parses the operation's intent body, binds it to the operation hash,
    /// and queues it for solving. Called after the operation entered the
    /// mempool; on error the caller evicts the operation again.
    fn identify(&self, op: &UserOperation, hash: H256) -> Result<(), IntentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("intent body is malformed: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub tick_interval: Duration,
    pub max_op_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_op_ttl: Duration::from_secs(180),
        }
    }
}

/// Tracks intents for one entry point from identification to a terminal
/// status, dispatching the unsolved queue to the solver once per tick.
///
/// The pipeline holds only operation hashes; the mempool remains the sole
/// owner of operation records and is consulted by hash at reconciliation
/// time. Solver unavailability re-queues intents and is never surfaced to
/// the RPC path.
pub struct IntentPipeline<M: Mempool, SL: SolverLike> {
    entry_point: Address,
    mempool: Arc<M>,
    solver: Arc<SL>,
    unsolved: Mutex<KeyedQueue<Intent>>,
    invalid_intents: AtomicU64,
    settings: Settings,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl<M: Mempool, SL: SolverLike> IntentPipeline<M, SL> {
    pub fn new(entry_point: Address, mempool: Arc<M>, solver: Arc<SL>, settings: Settings) -> Self {
        Self {
            entry_point,
            mempool,
            solver,
            unsolved: Mutex::new(KeyedQueue::new()),
            invalid_intents: AtomicU64::new(0),
            settings,
        }
    }

    pub fn unsolved_count(&self) -> usize {
        self.unsolved.lock().len()
    }

    pub fn invalid_intent_count(&self) -> u64 {
        self.invalid_intents.load(Ordering::Relaxed)
    }

    /// One pipeline round: expire what is overdue, then dispatch the queue.
    pub async fn tick(&self) {
        self.sweep_expired(now_secs());

        let snapshot = self.unsolved.lock().drain();
        if snapshot.is_empty() {
            return;
        }

        // Resolve each queued intent against the mempool. Operations that
        // were dropped or already solved elsewhere leave the pipeline here.
        let mut pending = Vec::new();
        let mut body = SolverBody::default();
        for (hash, mut intent) in snapshot {
            let Some(op) = self.mempool.get_operation(hash) else {
                debug!("Intent {hash:?} no longer pooled, dropping from pipeline");
                continue;
            };
            if op.solved {
                continue;
            }
            intent.status = ProcessingStatus::SentToSolver;
            body.user_ops.push(op.uo.clone().into());
            body.user_ops_ext.push(UserOperationExt {
                original_hash_value: hash,
                processing_status: ProcessingStatus::Received,
            });
            pending.push(intent);
        }
        if pending.is_empty() {
            return;
        }

        match self.solver.solve(body).await {
            Ok(response) => self.reconcile(response, pending),
            Err(error) => {
                // Retried next tick; a failing solver must not drop intents.
                warn!(
                    "Solver dispatch failed, re-queueing {} intents: {error:#}",
                    pending.len()
                );
                metrics::increment_counter!("intents_solver_transport_errors");
                self.requeue_at_head(pending);
            }
        }
    }

    /// One-shot solve used at batch assembly time. Transport errors do not
    /// retry here; the ops stay pooled and the tick path picks them up.
    pub async fn solve_batch(&self, ops: Vec<Arc<PoolOperation>>) {
        let mut body = SolverBody::default();
        for op in &ops {
            if op.solved {
                continue;
            }
            body.user_ops.push(op.uo.clone().into());
            body.user_ops_ext.push(UserOperationExt {
                original_hash_value: op.hash,
                processing_status: ProcessingStatus::Received,
            });
        }
        if body.user_ops.is_empty() {
            return;
        }

        let response = match self.solver.solve(body).await {
            Ok(response) => response,
            Err(error) => {
                warn!("Batch-time solver call failed, intents stay pooled: {error:#}");
                return;
            }
        };

        for (op, ext) in response.user_ops.into_iter().zip(response.user_ops_ext) {
            let hash = ext.original_hash_value;
            match ext.processing_status {
                ProcessingStatus::Solved => self.apply_solved(hash, op.into()),
                ProcessingStatus::Unsolved => {
                    // Stays pooled; the tick queue already tracks it.
                }
                ProcessingStatus::Expired | ProcessingStatus::Received => self.expire(hash),
                ProcessingStatus::Invalid => self.invalidate(hash),
                other => {
                    warn!("Unexpected solver status {other} for intent {hash:?}, dropping");
                    metrics::increment_counter!("intents_protocol_errors");
                    self.invalidate(hash);
                }
            }
        }
    }

    fn reconcile(&self, response: SolverBody, pending: Vec<Intent>) {
        if response.user_ops.len() != response.user_ops_ext.len() {
            warn!("Mismatched solver response, re-queueing intents");
            self.requeue_at_head(pending);
            return;
        }

        let mut pending: std::collections::HashMap<H256, Intent> = pending
            .into_iter()
            .map(|intent| (intent.hash, intent))
            .collect();
        let now = now_secs();

        for (op, ext) in response.user_ops.into_iter().zip(response.user_ops_ext) {
            let hash = ext.original_hash_value;
            let Some(mut intent) = pending.remove(&hash) else {
                warn!("Solver returned unknown intent hash {hash:?}");
                continue;
            };
            if now >= intent.expiration_at {
                self.expire(hash);
                continue;
            }
            match ext.processing_status {
                ProcessingStatus::Solved => self.apply_solved(hash, op.into()),
                ProcessingStatus::Unsolved => {
                    intent.status = ProcessingStatus::Unsolved;
                    self.unsolved.lock().enqueue_head(hash, intent);
                }
                // A reflected request means the solver did not act on it.
                ProcessingStatus::Expired | ProcessingStatus::Received => self.expire(hash),
                ProcessingStatus::Invalid => self.invalidate(hash),
                other => {
                    // Protocol error: the intent and its operation are dropped.
                    warn!("Unknown solver status {other} for intent {hash:?}, dropping");
                    metrics::increment_counter!("intents_protocol_errors");
                    self.invalidate(hash);
                }
            }
        }

        // The solver may answer with a subset; whatever it kept silent on is
        // retried next tick.
        if !pending.is_empty() {
            let mut remainder: Vec<Intent> = pending.into_values().collect();
            for intent in &mut remainder {
                intent.status = ProcessingStatus::Unsolved;
            }
            self.requeue_at_head(remainder);
        }
    }

    fn apply_solved(&self, hash: H256, solved_op: UserOperation) {
        let Some(solution) = solved_op.extract_solution() else {
            warn!("Solver marked {hash:?} solved without an EVM-instructions region, dropping");
            metrics::increment_counter!("intents_protocol_errors");
            self.invalidate(hash);
            return;
        };
        let gas = SolvedGasFields::of(&solved_op);
        match self.mempool.apply_solution(hash, solution, gas) {
            Ok(()) => {
                info!("Applied solution to intent operation {hash:?}");
                metrics::increment_counter!("intents_solved");
            }
            Err(error) => warn!("Failed to apply solution to {hash:?}: {error:#}"),
        }
    }

    fn expire(&self, hash: H256) {
        self.drop_from_queue(hash);
        self.mempool.remove_operation(hash, RemovalReason::Expired);
        metrics::increment_counter!("intents_expired");
    }

    fn invalidate(&self, hash: H256) {
        self.drop_from_queue(hash);
        self.mempool.remove_operation(hash, RemovalReason::InvalidIntent);
        metrics::increment_counter!("intents_invalid");
    }

    fn drop_from_queue(&self, hash: H256) {
        self.unsolved.lock().remove_by_key(hash);
    }

    fn requeue_at_head(&self, intents: Vec<Intent>) {
        let mut queue = self.unsolved.lock();
        for intent in intents.into_iter().rev() {
            if !queue.contains_key(intent.hash) {
                queue.enqueue_head(intent.hash, intent);
            }
        }
    }

    /// Drops every queued intent that outlived its expiration or the global
    /// operation TTL, removing the parent operations from the mempool.
    fn sweep_expired(&self, now: u64) {
        let overdue: Vec<H256> = self
            .unsolved
            .lock()
            .iter()
            .filter(|(_, intent)| {
                now >= intent.expiration_at
                    || now.saturating_sub(intent.created_at) >= self.settings.max_op_ttl.as_secs()
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in overdue {
            info!("Intent {hash:?} expired in queue");
            self.expire(hash);
        }
    }
}

impl<M: Mempool, SL: SolverLike> IntentSink for IntentPipeline<M, SL> {
    fn identify(&self, op: &UserOperation, hash: H256) -> Result<(), IntentError> {
        let mut intent: Intent = serde_json::from_slice(&op.call_data).map_err(|error| {
            self.invalid_intents.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("intents_invalid");
            IntentError::Invalid(error.to_string())
        })?;
        if intent.kind.is_empty() {
            self.invalid_intents.fetch_add(1, Ordering::Relaxed);
            metrics::increment_counter!("intents_invalid");
            return Err(IntentError::Invalid("missing intent kind".to_string()));
        }

        intent.hash = hash;
        intent.status = ProcessingStatus::Received;
        if intent.created_at == 0 {
            intent.created_at = now_secs();
        }
        if intent.expiration_at == 0 {
            intent.expiration_at = intent.created_at + DEFAULT_INTENT_TTL.as_secs();
        }

        info!(
            "Identified {} intent {hash:?} from {} expiring at {}",
            intent.kind, intent.sender, intent.expiration_at
        );
        self.unsolved.lock().enqueue_head(hash, intent);
        metrics::increment_counter!("intents_received");
        Ok(())
    }
}

/// Periodic driver for one entry point's pipeline.
pub struct IntentPipelineTask<M: Mempool, SL: SolverLike> {
    pipeline: Arc<IntentPipeline<M, SL>>,
}

impl<M: Mempool, SL: SolverLike> IntentPipelineTask<M, SL> {
    pub fn new(pipeline: Arc<IntentPipeline<M, SL>>) -> Self {
        Self { pipeline }
    }

    pub fn boxed(self) -> Box<dyn Task> {
        Box::new(self)
    }
}

#[async_trait]
impl<M: Mempool, SL: SolverLike> Task for IntentPipelineTask<M, SL> {
    async fn run(mut self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()> {
        let mut tick = interval(self.pipeline.settings.tick_interval);
        info!(
            "Intent pipeline started for entry point {:?}",
            self.pipeline.entry_point
        );
        loop {
            tokio::select! {
                _ = tick.tick() => self.pipeline.tick().await,
                _ = shutdown_token.cancelled() => {
                    // One final dispatch so queued intents get a last chance.
                    self.pipeline.tick().await;
                    return Ok(());
                }
            }
        }
    }
}
