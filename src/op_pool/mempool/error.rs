use ethers::types::{Address, H256, U256};

/// Mempool result type.
pub type MempoolResult<T> = std::result::Result<T, MempoolError>;

/// Mempool error type.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// Some other error occurred
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    /// Operation with the same hash already in pool.
    #[error("Operation already known: {0:?}")]
    DuplicateHash(H256),
    /// Operation nonce is not above the sender's pending tail.
    #[error("Nonce {0} is not above the sender's pending nonce {1}")]
    NonceRegression(U256, U256),
    /// Operation with same sender/nonce already in pool
    /// and the replacement operation has lower gas price.
    #[error("Replacement operation underpriced. Existing priority fee: {0}. Existing fee: {1}")]
    ReplacementUnderpriced(U256, U256),
    /// Unstaked sender already has the maximum number of pending operations.
    #[error("Max operations ({0}) reached for unstaked sender {1:?}")]
    SenderThrottled(usize, Address),
    /// No operation with this hash in the pool.
    #[error("Operation not found: {0:?}")]
    OperationNotFound(H256),
    /// A solution was already applied to this operation.
    #[error("Operation already solved: {0:?}")]
    AlreadySolved(H256),
}
