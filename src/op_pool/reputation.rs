use std::{collections::HashMap, sync::Arc, time::Duration};

use ethers::types::Address;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::warn;

use super::store::Store;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Reputation {
    pub address: Address,
    pub ops_seen: u64,
    pub ops_included: u64,
    pub invalid_intents: u64,
    pub expired_intents: u64,
    pub staked: bool,
}

/// Per-sender reputation tracking.
///
/// Interior mutability pattern used as ReputationManagers may
/// need to be thread-safe.
#[cfg_attr(test, automock)]
pub trait ReputationManager: Send + Sync + 'static {
    /// Whether the sender has stake deposited with the entry point. Unstaked
    /// senders are throttled to a fixed number of pending operations.
    fn is_staked(&self, address: Address) -> bool;

    /// Called by the mempool after reading the sender's deposit info.
    fn set_staked(&self, address: Address, staked: bool);

    /// Called by the mempool when an operation is added.
    fn add_seen(&self, address: Address);

    /// Called by the mempool when an operation's batch is committed.
    fn add_included(&self, address: Address);

    /// Called when an intent fails to parse or the solver marks it invalid.
    fn add_invalid_intent(&self, address: Address);

    /// Called when an intent expires before a solution arrives.
    fn add_expired_intent(&self, address: Address);

    /// Called by debug API
    fn dump_reputation(&self) -> Vec<Reputation>;

    /// Called by debug API
    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64, staked: bool);

    fn clear(&self);
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct SenderCounts {
    ops_seen: u64,
    ops_included: u64,
    invalid_intents: u64,
    expired_intents: u64,
    staked: bool,
}

/// Reputation manager with hourly decaying counters, persisted per sender.
pub struct PersistentReputation<S: Store> {
    counts: RwLock<HashMap<Address, SenderCounts>>,
    store: Arc<S>,
}

const REP_KEY_PREFIX: &str = "rep/";

fn rep_key(address: Address) -> Vec<u8> {
    format!("{REP_KEY_PREFIX}{address:?}").into_bytes()
}

impl<S: Store> PersistentReputation<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Loads persisted counters, returning the number of senders restored.
    pub fn restore(&self) -> anyhow::Result<usize> {
        let entries = self.store.range_by_prefix(REP_KEY_PREFIX.as_bytes())?;
        let mut counts = self.counts.write();
        for (key, value) in &entries {
            let address = String::from_utf8_lossy(&key[REP_KEY_PREFIX.len()..])
                .parse::<Address>()
                .map_err(|e| anyhow::anyhow!("bad reputation key: {e}"))?;
            let sender_counts: SenderCounts = serde_json::from_slice(value)?;
            counts.insert(address, sender_counts);
        }
        Ok(entries.len())
    }

    // run the reputation hourly update job
    pub async fn run(&self) {
        let mut tick = interval(Duration::from_secs(60 * 60));
        loop {
            tick.tick().await;
            self.hourly_update();
        }
    }

    fn hourly_update(&self) {
        let mut counts = self.counts.write();
        for count in counts.values_mut() {
            count.ops_seen -= count.ops_seen / 24;
            count.ops_included -= count.ops_included / 24;
            count.invalid_intents -= count.invalid_intents / 24;
            count.expired_intents -= count.expired_intents / 24;
        }
        counts.retain(|_, count| {
            count.staked
                || count.ops_seen > 0
                || count.ops_included > 0
                || count.invalid_intents > 0
                || count.expired_intents > 0
        });
    }

    fn update(&self, address: Address, f: impl FnOnce(&mut SenderCounts)) {
        let mut counts = self.counts.write();
        let count = counts.entry(address).or_default();
        f(count);
        if let Ok(value) = serde_json::to_vec(count) {
            if let Err(error) = self.store.put(&rep_key(address), value) {
                warn!("Failed to persist reputation for {address:?}: {error:#}");
            }
        }
    }
}

impl<S: Store> ReputationManager for PersistentReputation<S> {
    fn is_staked(&self, address: Address) -> bool {
        self.counts
            .read()
            .get(&address)
            .map(|count| count.staked)
            .unwrap_or(false)
    }

    fn set_staked(&self, address: Address, staked: bool) {
        self.update(address, |count| count.staked = staked);
    }

    fn add_seen(&self, address: Address) {
        self.update(address, |count| count.ops_seen += 1);
    }

    fn add_included(&self, address: Address) {
        self.update(address, |count| count.ops_included += 1);
    }

    fn add_invalid_intent(&self, address: Address) {
        self.update(address, |count| count.invalid_intents += 1);
    }

    fn add_expired_intent(&self, address: Address) {
        self.update(address, |count| count.expired_intents += 1);
    }

    fn dump_reputation(&self) -> Vec<Reputation> {
        self.counts
            .read()
            .iter()
            .map(|(address, count)| Reputation {
                address: *address,
                ops_seen: count.ops_seen,
                ops_included: count.ops_included,
                invalid_intents: count.invalid_intents,
                expired_intents: count.expired_intents,
                staked: count.staked,
            })
            .collect()
    }

    fn set_reputation(&self, address: Address, ops_seen: u64, ops_included: u64, staked: bool) {
        self.update(address, |count| {
            count.ops_seen = ops_seen;
            count.ops_included = ops_included;
            count.staked = staked;
        });
    }

    fn clear(&self) {
        let mut counts = self.counts.write();
        for address in counts.keys() {
            if let Err(error) = self.store.delete(&rep_key(*address)) {
                warn!("Failed to clear reputation for {address:?}: {error:#}");
            }
        }
        counts.clear();
    }
}
