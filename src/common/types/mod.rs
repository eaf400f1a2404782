mod entry_point_like;
mod provider_like;

pub use entry_point_like::*;
use ethers::{
    abi::{encode, Token},
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use parse_display::{Display, FromStr};
pub use provider_like::*;
use serde::{Deserialize, Serialize};
use strum::EnumIter;

pub use crate::common::contracts::{
    DepositInfo, FailedOp, HandleOpsCall, IEntryPoint, IEntryPointCalls, IEntryPointEvents,
    UserOperation, UserOperationEventFilter,
};

/// Length of a standard ECDSA signature. Bytes beyond this length on an
/// intent operation's signature are the solver-provided EVM instructions.
pub const ECDSA_SIGNATURE_LENGTH: usize = 65;

/// Unique identifier for a user operation from a given sender
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserOperationId {
    pub sender: Address,
    pub nonce: U256,
}

impl UserOperation {
    /// Hash a user operation with the given entry point and chain ID.
    ///
    /// The hash is used to uniquely identify a user operation in the entry point.
    /// It does not include the signature field.
    pub fn op_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        keccak256(encode(&[
            Token::FixedBytes(keccak256(self.pack()).to_vec()),
            Token::Address(entry_point),
            Token::Uint(chain_id.into()),
        ]))
        .into()
    }

    /// Get the unique identifier for this user operation from its sender
    pub fn id(&self) -> UserOperationId {
        UserOperationId {
            sender: self.sender,
            nonce: self.nonce,
        }
    }

    pub fn factory(&self) -> Option<Address> {
        Self::get_address_from_field(&self.init_code)
    }

    pub fn paymaster(&self) -> Option<Address> {
        Self::get_address_from_field(&self.paymaster_and_data)
    }

    /// Extracts an address from the beginning of a data field
    /// Useful to extract the paymaster address from paymaster_and_data
    /// and the factory address from init_code
    pub fn get_address_from_field(data: &Bytes) -> Option<Address> {
        if data.len() < 20 {
            None
        } else {
            Some(Address::from_slice(&data[..20]))
        }
    }

    pub fn pack(&self) -> Bytes {
        let hash_init_code = keccak256(self.init_code.clone());
        let hash_call_data = keccak256(self.call_data.clone());
        let hash_paymaster_and_data = keccak256(self.paymaster_and_data.clone());

        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(hash_init_code.to_vec()),
            Token::FixedBytes(hash_call_data.to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(hash_paymaster_and_data.to_vec()),
        ])
        .into()
    }

    pub fn max_gas_cost(&self) -> U256 {
        let max_gas = self.call_gas_limit + self.verification_gas_limit + self.pre_verification_gas;
        max_gas * self.max_fee_per_gas
    }

    /// Returns true iff the call data is a well-formed JSON object, i.e. the
    /// operation carries a declarative intent instead of EVM instructions.
    pub fn has_intent(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.call_data)
            .map(|value| value.is_object())
            .unwrap_or(false)
    }

    /// Returns the EVM-instructions region from the signature tail of a
    /// solved intent operation, or `None` when no solution is present.
    pub fn extract_solution(&self) -> Option<Bytes> {
        if self.has_intent() && self.signature.len() > ECDSA_SIGNATURE_LENGTH {
            Some(Bytes::from(
                self.signature[ECDSA_SIGNATURE_LENGTH..].to_vec(),
            ))
        } else {
            None
        }
    }

    /// An intent operation whose solution has been delivered in the
    /// signature tail but not yet applied to the call data.
    pub fn is_solved_intent(&self) -> bool {
        self.extract_solution().is_some()
    }

    pub fn is_unsolved_intent(&self) -> bool {
        self.has_intent() && !self.is_solved_intent()
    }

    pub fn is_conventional(&self) -> bool {
        !self.has_intent()
    }

    /// Produces a new operation with the call data replaced by the solver's
    /// EVM instructions and the gas fields it chose. The sender, nonce,
    /// init code, and the user's original signature are untouched, so the
    /// admission-time hash remains the operation's identity.
    pub fn apply_solution(&self, solution: Bytes, gas: SolvedGasFields) -> UserOperation {
        UserOperation {
            call_data: solution,
            call_gas_limit: gas.call_gas_limit,
            verification_gas_limit: gas.verification_gas_limit,
            pre_verification_gas: gas.pre_verification_gas,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            ..self.clone()
        }
    }
}

/// The five gas/fee fields a solver returns alongside a solution.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SolvedGasFields {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl SolvedGasFields {
    pub fn of(op: &UserOperation) -> Self {
        Self {
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
        }
    }
}

#[derive(Display, FromStr, Debug, Clone, Copy, Eq, PartialEq, EnumIter, Serialize, Deserialize)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BundlingMode {
    Manual,
    Auto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_zeroed() {
        // Testing a user operation hash against the hash generated by the
        // entrypoint contract getUserOpHash() function with entrypoint address
        // at 0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc and chain ID 1337.
        //
        // UserOperation = {
        //     sender: '0x0000000000000000000000000000000000000000',
        //     nonce: 0,
        //     initCode: '0x',
        //     callData: '0x',
        //     callGasLimit: 0,
        //     verificationGasLimit: 0,
        //     preVerificationGas: 0,
        //     maxFeePerGas: 0,
        //     maxPriorityFeePerGas: 0,
        //     paymasterAndData: '0x',
        //     signature: '0x',
        //   }
        //
        // Hash: 0xdca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d
        let operation = UserOperation {
            sender: "0x0000000000000000000000000000000000000000"
                .parse()
                .unwrap(),
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data: Bytes::default(),
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        };
        let entry_point = "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc"
            .parse()
            .unwrap();
        let chain_id = 1337;
        let hash = operation.op_hash(entry_point, chain_id);
        assert_eq!(
            hash,
            "0xdca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn test_hash() {
        // Testing a user operation hash against the hash generated by the
        // entrypoint contract getUserOpHash() function with entrypoint address
        // at 0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc and chain ID 1337.
        //
        // UserOperation = {
        //     sender: '0x1306b01bc3e4ad202612d3843387e94737673f53',
        //     nonce: 8942,
        //     initCode: '0x6942069420694206942069420694206942069420',
        //     callData: '0x0000000000000000000000000000000000000000080085',
        //     callGasLimit: 10000,
        //     verificationGasLimit: 100000,
        //     preVerificationGas: 100,
        //     maxFeePerGas: 99999,
        //     maxPriorityFeePerGas: 9999999,
        //     paymasterAndData:
        //       '0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef',
        //     signature:
        //       '0xda0929f527cded8d0a1eaf2e8861d7f7e2d8160b7b13942f99dd367df4473a',
        //   }
        //
        // Hash: 0x484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1
        let operation = UserOperation {
            sender: "0x1306b01bc3e4ad202612d3843387e94737673f53"
                .parse()
                .unwrap(),
            nonce: 8942.into(),
            init_code: "0x6942069420694206942069420694206942069420"
                .parse()
                .unwrap(),
            call_data: "0x0000000000000000000000000000000000000000080085"
                .parse()
                .unwrap(),
            call_gas_limit: 10000.into(),
            verification_gas_limit: 100000.into(),
            pre_verification_gas: 100.into(),
            max_fee_per_gas: 99999.into(),
            max_priority_fee_per_gas: 9999999.into(),
            paymaster_and_data:
                "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                    .parse()
                    .unwrap(),
            signature: "0xda0929f527cded8d0a1eaf2e8861d7f7e2d8160b7b13942f99dd367df4473a"
                .parse()
                .unwrap(),
        };
        let entry_point = "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc"
            .parse()
            .unwrap();
        let chain_id = 1337;
        let hash = operation.op_hash(entry_point, chain_id);
        assert_eq!(
            hash,
            "0x484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn test_get_address_from_field() {
        let paymaster_and_data: Bytes =
            "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                .parse()
                .unwrap();
        let address = UserOperation::get_address_from_field(&paymaster_and_data).unwrap();
        assert_eq!(
            address,
            "0x0123456789abcdef0123456789abcdef01234567"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn test_has_intent() {
        let intent_op = UserOperation {
            call_data: Bytes::from(
                br#"{"sender":"0x0a71","kind":"swap","sellToken":"TokenA"}"#.to_vec(),
            ),
            ..UserOperation::default()
        };
        assert!(intent_op.has_intent());
        assert!(intent_op.is_unsolved_intent());
        assert!(!intent_op.is_conventional());

        let conventional_op = UserOperation {
            call_data: "0xb61d27f6000000000000000000000000".parse().unwrap(),
            ..UserOperation::default()
        };
        assert!(!conventional_op.has_intent());
        assert!(conventional_op.is_conventional());

        // A bare JSON array is not an intent body.
        let array_op = UserOperation {
            call_data: Bytes::from(b"[1,2,3]".to_vec()),
            ..UserOperation::default()
        };
        assert!(!array_op.has_intent());
    }

    #[test]
    fn test_extract_solution() {
        let mut signature = vec![7_u8; ECDSA_SIGNATURE_LENGTH];
        signature.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let op = UserOperation {
            call_data: Bytes::from(br#"{"kind":"swap"}"#.to_vec()),
            signature: signature.into(),
            ..UserOperation::default()
        };

        assert!(op.is_solved_intent());
        assert_eq!(
            op.extract_solution().unwrap(),
            Bytes::from(vec![0xde, 0xad, 0xbe, 0xef])
        );

        // No tail, no solution.
        let unsolved = UserOperation {
            call_data: Bytes::from(br#"{"kind":"swap"}"#.to_vec()),
            signature: vec![7_u8; ECDSA_SIGNATURE_LENGTH].into(),
            ..UserOperation::default()
        };
        assert!(unsolved.extract_solution().is_none());
        assert!(unsolved.is_unsolved_intent());
    }

    #[test]
    fn test_apply_solution_preserves_identity_fields() {
        let op = UserOperation {
            sender: "0x1306b01bc3e4ad202612d3843387e94737673f53"
                .parse()
                .unwrap(),
            nonce: 11.into(),
            call_data: Bytes::from(br#"{"kind":"swap"}"#.to_vec()),
            signature: vec![7_u8; ECDSA_SIGNATURE_LENGTH].into(),
            ..UserOperation::default()
        };

        let gas = SolvedGasFields {
            call_gas_limit: 150_000.into(),
            verification_gas_limit: 80_000.into(),
            pre_verification_gas: 60_000.into(),
            max_fee_per_gas: 1_000.into(),
            max_priority_fee_per_gas: 100.into(),
        };
        let solved = op.apply_solution("0xb61d27f6".parse().unwrap(), gas);

        assert_eq!(solved.sender, op.sender);
        assert_eq!(solved.nonce, op.nonce);
        assert_eq!(solved.init_code, op.init_code);
        assert_eq!(solved.signature, op.signature);
        assert_eq!(solved.call_data, "0xb61d27f6".parse::<Bytes>().unwrap());
        assert_eq!(solved.call_gas_limit, gas.call_gas_limit);
        assert!(solved.is_conventional());
    }
}
