pub mod pipeline;
pub mod queue;
pub mod solver;

use std::time::Duration;

use ethers::types::H256;
use parse_display::Display;
pub use pipeline::{IntentError, IntentPipeline, IntentSink};
#[cfg(test)]
pub use pipeline::MockIntentSink;
pub use queue::KeyedQueue;
use serde::{Deserialize, Serialize};
pub use solver::{SolverClient, SolverError, SolverLike};

use crate::rpc::RpcUserOperation;

/// Fallback intent lifetime when the submitted body carries no
/// `expirationAt`.
pub const DEFAULT_INTENT_TTL: Duration = Duration::from_secs(100);

/// Where an intent stands in the solving lifecycle.
///
/// `Received` and `SentToSolver` are bundler-side states; the solver answers
/// with one of the terminal or retryable states. Anything it returns outside
/// this set deserializes as `Unknown` and is treated as a protocol error.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize, Display)]
pub enum ProcessingStatus {
    #[default]
    Received,
    SentToSolver,
    Solved,
    Unsolved,
    Expired,
    Invalid,
    #[serde(other)]
    Unknown,
}

/// Decoded JSON body of an intent operation.
///
/// Deserialization is lenient the way the solver protocol is: missing fields
/// default, extra fields are ignored, but a type mismatch fails the parse
/// and marks the intent invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub kind: String,
    /// Bound to the parent operation's hash at identification time.
    #[serde(default)]
    pub hash: H256,
    #[serde(default)]
    pub sell_token: String,
    #[serde(default)]
    pub buy_token: String,
    #[serde(default)]
    pub sell_amount: u64,
    #[serde(default)]
    pub buy_amount: u64,
    #[serde(default)]
    pub partially_fillable: bool,
    /// Unix seconds; filled with the admission time when zero.
    #[serde(default)]
    pub created_at: u64,
    /// Unix seconds; filled with `created_at + DEFAULT_INTENT_TTL` when zero.
    #[serde(default)]
    pub expiration_at: u64,
    #[serde(default)]
    pub status: ProcessingStatus,
}

/// Envelope POSTed to and returned by the solver. The solver may answer
/// with a subset, in any order; `userOpsExt[i].originalHashValue` correlates
/// `userOps[i]` back to the pooled operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverBody {
    #[serde(default)]
    pub user_ops: Vec<RpcUserOperation>,
    #[serde(default)]
    pub user_ops_ext: Vec<UserOperationExt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationExt {
    pub original_hash_value: H256,
    pub processing_status: ProcessingStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_parses_swap_body() {
        let body = br#"{
            "sender": "0x0A7199a96fdf0252E09F76545c1eF2be3692F46b",
            "kind": "swap",
            "sellToken": "TokenA",
            "buyToken": "TokenB",
            "sellAmount": 10,
            "buyAmount": 5,
            "partiallyFillable": false,
            "extraField": "ignored"
        }"#;
        let intent: Intent = serde_json::from_slice(body).unwrap();
        assert_eq!(intent.kind, "swap");
        assert_eq!(intent.sell_token, "TokenA");
        assert_eq!(intent.sell_amount, 10);
        assert_eq!(intent.buy_amount, 5);
        assert!(!intent.partially_fillable);
        assert_eq!(intent.created_at, 0);
        assert_eq!(intent.expiration_at, 0);
        assert_eq!(intent.status, ProcessingStatus::Received);
    }

    #[test]
    fn intent_type_mismatch_fails() {
        let body = br#"{"kind": "swap", "sellAmount": "not-a-number"}"#;
        assert!(serde_json::from_slice::<Intent>(body).is_err());
    }

    #[test]
    fn unknown_status_deserializes_as_unknown() {
        let status: ProcessingStatus = serde_json::from_str(r#""Compressed""#).unwrap();
        assert_eq!(status, ProcessingStatus::Unknown);

        let status: ProcessingStatus = serde_json::from_str(r#""SentToSolver""#).unwrap();
        assert_eq!(status, ProcessingStatus::SentToSolver);
    }
}
