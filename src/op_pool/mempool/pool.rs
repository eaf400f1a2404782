use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use ethers::types::{Address, Bytes, H256, U256};

use super::{
    error::{MempoolError, MempoolResult},
    PoolOperation,
};
use crate::common::types::{SolvedGasFields, UserOperation, UserOperationId};

/// Pool of user operations for one entry point.
///
/// Maintains a global hash index, a per-sender nonce-ordered sequence, and a
/// fee-ordered view used for batch selection. Not thread safe; the owning
/// pool wraps it in a lock.
#[derive(Debug)]
pub struct PoolInner {
    // Address of the entry point this pool targets
    entry_point: Address,
    // Operations by admission hash
    by_hash: HashMap<H256, OrderedPoolOperation>,
    // Operation hash by (sender, nonce)
    by_id: HashMap<UserOperationId, H256>,
    // Per-sender pending operations in nonce order
    by_sender: HashMap<Address, BTreeMap<U256, H256>>,
    // Best operations, sorted by priority fee
    best: BTreeSet<OrderedPoolOperation>,
    // Operations selected for a batch, awaiting commit or rollback
    in_flight: HashSet<H256>,
    // Submission ID counter
    submission_id: u64,
}

/// Result of adding an operation: its hash and the same-nonce operation it
/// replaced, if any.
#[derive(Debug)]
pub struct AddedOperation {
    pub hash: H256,
    pub replaced: Option<Arc<PoolOperation>>,
}

impl PoolInner {
    pub fn new(entry_point: Address) -> Self {
        Self {
            entry_point,
            by_hash: HashMap::new(),
            by_id: HashMap::new(),
            by_sender: HashMap::new(),
            best: BTreeSet::new(),
            in_flight: HashSet::new(),
            submission_id: 0,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    pub fn add_operation(&mut self, op: PoolOperation) -> MempoolResult<AddedOperation> {
        if self.by_hash.contains_key(&op.hash) {
            return Err(MempoolError::DuplicateHash(op.hash));
        }

        // Same-nonce replacement requires both fee caps strictly higher.
        let mut replaced = None;
        if let Some(&existing_hash) = self.by_id.get(&op.uo.id()) {
            let existing = &self.by_hash[&existing_hash];
            if op.uo.max_priority_fee_per_gas > existing.uo().max_priority_fee_per_gas
                && op.uo.max_fee_per_gas > existing.uo().max_fee_per_gas
            {
                replaced = self.remove_operation_by_hash(existing_hash);
            } else {
                return Err(MempoolError::ReplacementUnderpriced(
                    existing.uo().max_priority_fee_per_gas,
                    existing.uo().max_fee_per_gas,
                ));
            }
        } else if let Some(sender_ops) = self.by_sender.get(&op.uo.sender) {
            if let Some((&tail_nonce, _)) = sender_ops.iter().next_back() {
                if op.uo.nonce <= tail_nonce {
                    return Err(MempoolError::NonceRegression(op.uo.nonce, tail_nonce));
                }
            }
        }

        let hash = op.hash;
        let pool_op = OrderedPoolOperation {
            po: Arc::new(op),
            submission_id: self.next_submission_id(),
        };
        self.by_id.insert(pool_op.uo().id(), hash);
        self.by_sender
            .entry(pool_op.uo().sender)
            .or_default()
            .insert(pool_op.uo().nonce, hash);
        self.best.insert(pool_op.clone());
        self.by_hash.insert(hash, pool_op);

        Ok(AddedOperation { hash, replaced })
    }

    pub fn contains(&self, hash: H256) -> bool {
        self.by_hash.contains_key(&hash)
    }

    pub fn get(&self, hash: H256) -> Option<Arc<PoolOperation>> {
        self.by_hash.get(&hash).map(|op| op.po.clone())
    }

    pub fn sender_count(&self, sender: Address) -> usize {
        self.by_sender.get(&sender).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn ops_by_sender(&self, sender: Address) -> Vec<Arc<PoolOperation>> {
        self.by_sender
            .get(&sender)
            .map(|ops| {
                ops.values()
                    .map(|hash| self.by_hash[hash].po.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn best_operations(&self) -> impl Iterator<Item = Arc<PoolOperation>> {
        self.best.clone().into_iter().map(|v| v.po)
    }

    /// Selects up to `max_ops` operations, one per sender, best priority fee
    /// first. For each selected sender the lowest pending nonce is chosen so
    /// that batches never submit nonces out of order. Senders with an
    /// operation already in flight are skipped entirely.
    pub fn drain_for_batch(&mut self, max_ops: usize) -> Vec<Arc<PoolOperation>> {
        let mut selected = Vec::new();
        let mut seen_senders = HashSet::new();

        for op in &self.best {
            if selected.len() >= max_ops {
                break;
            }
            let sender = op.uo().sender;
            if !seen_senders.insert(sender) {
                continue;
            }
            let Some(sender_ops) = self.by_sender.get(&sender) else {
                continue;
            };
            if sender_ops
                .values()
                .any(|hash| self.in_flight.contains(hash))
            {
                continue;
            }
            if let Some(hash) = sender_ops.values().next() {
                selected.push(self.by_hash[hash].po.clone());
            }
        }

        for op in &selected {
            self.in_flight.insert(op.hash);
        }
        selected
    }

    pub fn commit_batch(&mut self, hashes: &[H256]) -> Vec<Arc<PoolOperation>> {
        hashes
            .iter()
            .filter_map(|hash| self.remove_operation_by_hash(*hash))
            .collect()
    }

    pub fn rollback_batch(&mut self, hashes: &[H256]) {
        for hash in hashes {
            self.in_flight.remove(hash);
        }
    }

    pub fn remove_operation_by_hash(&mut self, hash: H256) -> Option<Arc<PoolOperation>> {
        let op = self.by_hash.remove(&hash)?;
        self.by_id.remove(&op.uo().id());
        if let Some(sender_ops) = self.by_sender.get_mut(&op.uo().sender) {
            sender_ops.remove(&op.uo().nonce);
            if sender_ops.is_empty() {
                self.by_sender.remove(&op.uo().sender);
            }
        }
        self.best.remove(&op);
        self.in_flight.remove(&hash);
        Some(op.po)
    }

    /// Replaces a pooled intent operation's calldata with its solution,
    /// preserving its admission hash and arrival order.
    pub fn apply_solution(
        &mut self,
        hash: H256,
        solution: Bytes,
        gas: SolvedGasFields,
    ) -> MempoolResult<Arc<PoolOperation>> {
        let existing = self
            .by_hash
            .get(&hash)
            .cloned()
            .ok_or(MempoolError::OperationNotFound(hash))?;
        if !existing.po.is_intent {
            return Err(anyhow::anyhow!("operation {hash:?} is not an intent").into());
        }
        if existing.po.solved {
            return Err(MempoolError::AlreadySolved(hash));
        }

        let solved = Arc::new(PoolOperation {
            uo: existing.po.uo.apply_solution(solution, gas),
            solved: true,
            ..(*existing.po).clone()
        });
        let updated = OrderedPoolOperation {
            po: solved.clone(),
            submission_id: existing.submission_id,
        };
        // Re-insert into the fee-ordered view since the solver may have
        // changed the fee fields.
        self.best.remove(&existing);
        self.best.insert(updated.clone());
        self.by_hash.insert(hash, updated);
        Ok(solved)
    }

    /// Hashes of pending operations admitted before the TTL horizon.
    /// In-flight operations are left to their batch outcome.
    pub fn expired_hashes(&self, now_secs: u64, ttl_secs: u64) -> Vec<H256> {
        self.by_hash
            .values()
            .filter(|op| {
                !self.in_flight.contains(&op.po.hash)
                    && op.po.added_at.saturating_add(ttl_secs) <= now_secs
            })
            .map(|op| op.po.hash)
            .collect()
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_id.clear();
        self.by_sender.clear();
        self.best.clear();
        self.in_flight.clear();
    }

    fn next_submission_id(&mut self) -> u64 {
        let id = self.submission_id;
        self.submission_id += 1;
        id
    }
}

/// Wrapper around PoolOperation that adds a submission ID to implement
/// a custom ordering for the best operations
#[derive(Debug, Clone)]
struct OrderedPoolOperation {
    po: Arc<PoolOperation>,
    submission_id: u64,
}

impl OrderedPoolOperation {
    fn uo(&self) -> &UserOperation {
        &self.po.uo
    }
}

impl Eq for OrderedPoolOperation {}

impl Ord for OrderedPoolOperation {
    fn cmp(&self, other: &Self) -> Ordering {
        // Sort by priority fee descending then by submission id ascending
        other
            .uo()
            .max_priority_fee_per_gas
            .cmp(&self.uo().max_priority_fee_per_gas)
            .then_with(|| self.submission_id.cmp(&other.submission_id))
    }
}

impl PartialOrd for OrderedPoolOperation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderedPoolOperation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Bytes;

    use super::*;

    const CHAIN_ID: u64 = 1337;

    #[test]
    fn add_single_op() {
        let mut pool = PoolInner::new(Address::zero());
        let op = create_op(Address::random(), 0, 1);
        let hash = pool.add_operation(op.clone()).unwrap().hash;

        assert!(pool.contains(hash));
        assert_eq!(*pool.get(hash).unwrap(), op);
        assert_eq!(pool.sender_count(op.uo.sender), 1);
    }

    #[test]
    fn duplicate_hash_rejected() {
        let mut pool = PoolInner::new(Address::zero());
        let op = create_op(Address::random(), 0, 1);
        pool.add_operation(op.clone()).unwrap();

        match pool.add_operation(op) {
            Err(MempoolError::DuplicateHash(_)) => {}
            other => panic!("expected DuplicateHash, got {other:?}"),
        }
    }

    #[test]
    fn best_ordered_by_priority_fee_then_arrival() {
        let mut pool = PoolInner::new(Address::zero());
        let ops = vec![
            create_op(Address::random(), 0, 1),
            create_op(Address::random(), 0, 3),
            create_op(Address::random(), 0, 3),
            create_op(Address::random(), 0, 2),
        ];
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        let best: Vec<_> = pool.best_operations().collect();
        assert_eq!(*best[0], ops[1]);
        assert_eq!(*best[1], ops[2]); // tie broken by arrival order
        assert_eq!(*best[2], ops[3]);
        assert_eq!(*best[3], ops[0]);
    }

    #[test]
    fn nonce_regression_rejected() {
        let mut pool = PoolInner::new(Address::zero());
        let sender = Address::random();
        pool.add_operation(create_op(sender, 5, 1)).unwrap();
        pool.add_operation(create_op(sender, 6, 1)).unwrap();

        match pool.add_operation(create_op(sender, 4, 1)) {
            Err(MempoolError::NonceRegression(nonce, tail)) => {
                assert_eq!(nonce, 4.into());
                assert_eq!(tail, 6.into());
            }
            other => panic!("expected NonceRegression, got {other:?}"),
        }
    }

    #[test]
    fn replacement_requires_higher_fees() {
        let mut pool = PoolInner::new(Address::zero());
        let sender = Address::random();
        let original = create_op_with_fees(sender, 5, 10, 100);
        pool.add_operation(original.clone()).unwrap();

        // Only priority fee bumped: rejected.
        match pool.add_operation(create_op_with_fees(sender, 5, 11, 100)) {
            Err(MempoolError::ReplacementUnderpriced(priority, fee)) => {
                assert_eq!(priority, 10.into());
                assert_eq!(fee, 100.into());
            }
            other => panic!("expected ReplacementUnderpriced, got {other:?}"),
        }

        // Both caps strictly higher: replaces.
        let replacement = create_op_with_fees(sender, 5, 11, 101);
        let added = pool.add_operation(replacement.clone()).unwrap();
        assert_eq!(added.replaced.unwrap().hash, original.hash);
        assert_eq!(pool.sender_count(sender), 1);
        assert!(!pool.contains(original.hash));
        assert!(pool.contains(replacement.hash));
    }

    #[test]
    fn drain_selects_lowest_nonce_per_sender() {
        let mut pool = PoolInner::new(Address::zero());
        let sender = Address::random();
        let first = create_op_with_fees(sender, 5, 1, 10);
        let second = create_op_with_fees(sender, 6, 9, 90);
        pool.add_operation(first.clone()).unwrap();
        pool.add_operation(second.clone()).unwrap();

        let batch = pool.drain_for_batch(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].uo.nonce, 5.into());

        // The sender has an op in flight, so the next drain yields nothing.
        assert!(pool.drain_for_batch(1).is_empty());

        pool.commit_batch(&[first.hash]);
        let batch = pool.drain_for_batch(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].uo.nonce, 6.into());
    }

    #[test]
    fn drain_orders_senders_by_priority_fee() {
        let mut pool = PoolInner::new(Address::zero());
        let low = create_op(Address::random(), 0, 1);
        let high = create_op(Address::random(), 0, 5);
        let mid = create_op(Address::random(), 0, 3);
        for op in [&low, &high, &mid] {
            pool.add_operation(op.clone()).unwrap();
        }

        let batch = pool.drain_for_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].hash, high.hash);
        assert_eq!(batch[1].hash, mid.hash);
    }

    #[test]
    fn rollback_returns_ops_to_pending() {
        let mut pool = PoolInner::new(Address::zero());
        let op = create_op(Address::random(), 0, 1);
        pool.add_operation(op.clone()).unwrap();

        let batch = pool.drain_for_batch(10);
        assert_eq!(batch.len(), 1);
        assert!(pool.drain_for_batch(10).is_empty());
        assert!(pool.contains(op.hash));

        pool.rollback_batch(&[op.hash]);
        assert_eq!(pool.drain_for_batch(10).len(), 1);
    }

    #[test]
    fn remove_op() {
        let mut pool = PoolInner::new(Address::zero());
        let ops = vec![
            create_op(Address::random(), 0, 3),
            create_op(Address::random(), 0, 2),
            create_op(Address::random(), 0, 1),
        ];
        for op in &ops {
            pool.add_operation(op.clone()).unwrap();
        }

        assert!(pool.remove_operation_by_hash(ops[0].hash).is_some());
        assert!(!pool.contains(ops[0].hash));
        assert_eq!(pool.best_operations().next().unwrap().hash, ops[1].hash);

        assert!(pool.remove_operation_by_hash(ops[1].hash).is_some());
        assert!(pool.remove_operation_by_hash(ops[2].hash).is_some());
        assert!(pool.best_operations().next().is_none());
        assert!(pool.remove_operation_by_hash(ops[0].hash).is_none());
    }

    #[test]
    fn apply_solution_preserves_hash_and_order() {
        let mut pool = PoolInner::new(Address::zero());
        let intent = create_intent_op(Address::random(), 0, 2);
        let hash = intent.hash;
        pool.add_operation(intent).unwrap();

        let gas = SolvedGasFields {
            call_gas_limit: 90_000.into(),
            verification_gas_limit: 70_000.into(),
            pre_verification_gas: 50_000.into(),
            max_fee_per_gas: 200.into(),
            max_priority_fee_per_gas: 20.into(),
        };
        let solved = pool
            .apply_solution(hash, "0xb61d27f6".parse().unwrap(), gas)
            .unwrap();
        assert!(solved.solved);
        assert_eq!(solved.hash, hash);
        assert_eq!(solved.uo.call_data, "0xb61d27f6".parse::<Bytes>().unwrap());

        // Still reachable under the admission hash with updated fees.
        let fetched = pool.get(hash).unwrap();
        assert_eq!(fetched.uo.max_priority_fee_per_gas, 20.into());

        match pool.apply_solution(hash, "0x00".parse().unwrap(), gas) {
            Err(MempoolError::AlreadySolved(_)) => {}
            other => panic!("expected AlreadySolved, got {other:?}"),
        }
    }

    #[test]
    fn expired_hashes_skip_in_flight() {
        let mut pool = PoolInner::new(Address::zero());
        let old = create_op(Address::random(), 0, 1);
        let in_flight = create_op(Address::random(), 0, 9);
        pool.add_operation(old.clone()).unwrap();
        pool.add_operation(in_flight.clone()).unwrap();
        pool.drain_for_batch(1); // picks the higher-fee op

        let expired = pool.expired_hashes(old.added_at + 200, 180);
        assert_eq!(expired, vec![old.hash]);
    }

    fn create_op(sender: Address, nonce: usize, max_priority_fee_per_gas: usize) -> PoolOperation {
        create_op_with_fees(
            sender,
            nonce,
            max_priority_fee_per_gas,
            max_priority_fee_per_gas * 10,
        )
    }

    fn create_op_with_fees(
        sender: Address,
        nonce: usize,
        max_priority_fee_per_gas: usize,
        max_fee_per_gas: usize,
    ) -> PoolOperation {
        let uo = UserOperation {
            sender,
            nonce: nonce.into(),
            max_priority_fee_per_gas: max_priority_fee_per_gas.into(),
            max_fee_per_gas: max_fee_per_gas.into(),
            ..UserOperation::default()
        };
        let hash = uo.op_hash(Address::zero(), CHAIN_ID);
        PoolOperation {
            uo,
            hash,
            is_intent: false,
            solved: false,
            added_at: 1_700_000_000,
        }
    }

    fn create_intent_op(
        sender: Address,
        nonce: usize,
        max_priority_fee_per_gas: usize,
    ) -> PoolOperation {
        let uo = UserOperation {
            sender,
            nonce: nonce.into(),
            call_data: Bytes::from(br#"{"kind":"swap"}"#.to_vec()),
            max_priority_fee_per_gas: max_priority_fee_per_gas.into(),
            max_fee_per_gas: (max_priority_fee_per_gas * 10).into(),
            ..UserOperation::default()
        };
        let hash = uo.op_hash(Address::zero(), CHAIN_ID);
        PoolOperation {
            uo,
            hash,
            is_intent: true,
            solved: false,
            added_at: 1_700_000_000,
        }
    }
}
