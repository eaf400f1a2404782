use ethers::types::U256;
use jsonrpsee::{
    core::Error as RpcError,
    types::{
        error::{CallError, INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE},
        ErrorObject,
    },
};
use serde::Serialize;

use crate::{
    common::precheck::PrecheckError,
    intents::IntentError,
    op_pool::MempoolError,
};

// Error codes borrowed from jsonrpsee
// INVALID_REQUEST_CODE = -32600
// INVALID_PARAMS_CODE = -32602
// INTERNAL_ERROR_CODE = -32603

// Custom ERC-4337 error codes
const ENTRYPOINT_VALIDATION_REJECTED_CODE: i32 = -32500;
const THROTTLED_OR_BANNED_CODE: i32 = -32504;
const EXECUTION_REVERTED: i32 = -32521;

/// Error returned by the RPC server eth namespace
#[derive(Debug, thiserror::Error)]
pub enum EthRpcError {
    /// Invalid parameters
    #[error("{0}")]
    InvalidParams(String),
    /// Validation rejected the operation before admission
    #[error("{0}")]
    ValidationRejected(String),
    /// Unstaked sender has too many pending operations
    #[error("sender is throttled: max {0} pending operations for unstaked senders")]
    SenderThrottled(usize),
    /// Replacement underpriced
    #[error("replacement underpriced")]
    ReplacementUnderpriced(ReplacementUnderpricedData),
    /// Operation already known
    #[error("already known")]
    OperationAlreadyKnown,
    /// Execution reverted during estimation
    #[error("{0}")]
    ExecutionReverted(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementUnderpricedData {
    pub current_max_priority_fee: U256,
    pub current_max_fee: U256,
}

impl From<MempoolError> for EthRpcError {
    fn from(error: MempoolError) -> Self {
        match error {
            MempoolError::DuplicateHash(_) => EthRpcError::OperationAlreadyKnown,
            MempoolError::SenderThrottled(max, _) => EthRpcError::SenderThrottled(max),
            MempoolError::NonceRegression(..) => EthRpcError::InvalidParams(error.to_string()),
            MempoolError::ReplacementUnderpriced(current_max_priority_fee, current_max_fee) => {
                EthRpcError::ReplacementUnderpriced(ReplacementUnderpricedData {
                    current_max_priority_fee,
                    current_max_fee,
                })
            }
            MempoolError::OperationNotFound(_) | MempoolError::AlreadySolved(_) => {
                EthRpcError::InvalidParams(error.to_string())
            }
            MempoolError::Other(error) => EthRpcError::Internal(error),
        }
    }
}

impl From<PrecheckError> for EthRpcError {
    fn from(error: PrecheckError) -> Self {
        EthRpcError::ValidationRejected(error.to_string())
    }
}

impl From<IntentError> for EthRpcError {
    fn from(error: IntentError) -> Self {
        EthRpcError::ValidationRejected(error.to_string())
    }
}

impl From<EthRpcError> for RpcError {
    fn from(error: EthRpcError) -> Self {
        let msg = error.to_string();

        match error {
            EthRpcError::InvalidParams(_) => rpc_err(INVALID_PARAMS_CODE, msg),
            EthRpcError::ValidationRejected(_) => {
                rpc_err(ENTRYPOINT_VALIDATION_REJECTED_CODE, msg)
            }
            EthRpcError::SenderThrottled(_) => rpc_err(THROTTLED_OR_BANNED_CODE, msg),
            EthRpcError::ReplacementUnderpriced(data) => {
                rpc_err_with_data(INVALID_PARAMS_CODE, msg, data)
            }
            EthRpcError::OperationAlreadyKnown => rpc_err(INVALID_PARAMS_CODE, msg),
            EthRpcError::ExecutionReverted(_) => rpc_err(EXECUTION_REVERTED, msg),
            EthRpcError::Internal(_) => rpc_err(INTERNAL_ERROR_CODE, msg),
        }
    }
}

fn rpc_err(code: i32, msg: impl Into<String>) -> RpcError {
    create_rpc_err(code, msg, None::<()>)
}

fn rpc_err_with_data<S: Serialize>(code: i32, msg: impl Into<String>, data: S) -> RpcError {
    create_rpc_err(code, msg, Some(data))
}

fn create_rpc_err<S: Serialize>(code: i32, msg: impl Into<String>, data: Option<S>) -> RpcError {
    RpcError::Call(CallError::Custom(ErrorObject::owned(
        code,
        msg.into(),
        data,
    )))
}
