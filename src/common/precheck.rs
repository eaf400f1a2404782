use ethers::types::U256;

use crate::common::{
    gas::calc_pre_verification_gas,
    types::{UserOperation, ECDSA_SIGNATURE_LENGTH},
};

/// Stateless pre-admission checks on an incoming user operation.
///
/// Intent operations skip the pre-verification gas floor: their calldata is
/// replaced by the solver later, so its serialized size is not yet final.
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    pub max_verification_gas: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_verification_gas: 3_000_000,
        }
    }
}

pub type PrecheckResult = Result<(), PrecheckError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum PrecheckError {
    #[error("validation rejected: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Violations(Vec<PrecheckViolation>),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PrecheckViolation {
    #[error("signature length {0} is below the {ECDSA_SIGNATURE_LENGTH} byte minimum")]
    SignatureTooShort(usize),
    #[error("verificationGasLimit {0} exceeds the maximum of {1}")]
    VerificationGasLimitTooHigh(U256, U256),
    #[error("preVerificationGas {0} is below the expected gas of {1}")]
    PreVerificationGasTooLow(U256, U256),
}

pub fn check_user_operation(op: &UserOperation, settings: &Settings) -> PrecheckResult {
    let mut violations = Vec::new();

    if op.signature.len() < ECDSA_SIGNATURE_LENGTH {
        violations.push(PrecheckViolation::SignatureTooShort(op.signature.len()));
    }

    let max_verification_gas = U256::from(settings.max_verification_gas);
    if op.verification_gas_limit > max_verification_gas {
        violations.push(PrecheckViolation::VerificationGasLimitTooHigh(
            op.verification_gas_limit,
            max_verification_gas,
        ));
    }

    if !op.has_intent() {
        let required_pvg = calc_pre_verification_gas(op);
        if op.pre_verification_gas < required_pvg {
            violations.push(PrecheckViolation::PreVerificationGasTooLow(
                op.pre_verification_gas,
                required_pvg,
            ));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(PrecheckError::Violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::Bytes;

    use super::*;

    fn valid_op() -> UserOperation {
        UserOperation {
            signature: vec![1_u8; ECDSA_SIGNATURE_LENGTH].into(),
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 100_000.into(),
            ..UserOperation::default()
        }
    }

    #[test]
    fn accepts_valid_conventional_op() {
        assert!(check_user_operation(&valid_op(), &Settings::default()).is_ok());
    }

    #[test]
    fn rejects_short_signature() {
        let op = UserOperation {
            signature: vec![1_u8; 10].into(),
            ..valid_op()
        };
        let Err(PrecheckError::Violations(violations)) =
            check_user_operation(&op, &Settings::default())
        else {
            panic!("expected violations");
        };
        assert!(violations.contains(&PrecheckViolation::SignatureTooShort(10)));
    }

    #[test]
    fn rejects_excessive_verification_gas() {
        let op = UserOperation {
            verification_gas_limit: 4_000_000.into(),
            ..valid_op()
        };
        let Err(PrecheckError::Violations(violations)) =
            check_user_operation(&op, &Settings::default())
        else {
            panic!("expected violations");
        };
        assert_eq!(
            violations,
            vec![PrecheckViolation::VerificationGasLimitTooHigh(
                4_000_000.into(),
                3_000_000.into(),
            )]
        );
    }

    #[test]
    fn rejects_low_pre_verification_gas() {
        let op = UserOperation {
            pre_verification_gas: 1.into(),
            ..valid_op()
        };
        let result = check_user_operation(&op, &Settings::default());
        let Err(PrecheckError::Violations(violations)) = result else {
            panic!("expected violations");
        };
        assert!(matches!(
            violations[0],
            PrecheckViolation::PreVerificationGasTooLow(..)
        ));
    }

    #[test]
    fn intent_op_skips_pre_verification_gas_floor() {
        let op = UserOperation {
            call_data: Bytes::from(br#"{"kind":"swap","sellToken":"A"}"#.to_vec()),
            pre_verification_gas: 0.into(),
            ..valid_op()
        };
        assert!(check_user_operation(&op, &Settings::default()).is_ok());
    }
}
