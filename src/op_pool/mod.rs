pub mod mempool;
pub mod reputation;
pub mod store;

pub use mempool::{
    uo_pool::UoPool, Mempool, MempoolError, MempoolResult, PoolConfig, PoolOperation,
    RemovalReason,
};
#[cfg(test)]
pub use mempool::MockMempool;
pub use reputation::{PersistentReputation, Reputation, ReputationManager};
pub use store::{RocksDbStore, Store};
