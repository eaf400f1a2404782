use ethers::types::U256;

use crate::common::{math, types::UserOperation};

/// Gas overheads for user operations
/// used in calculating the pre-verification gas
/// see: https://github.com/eth-infinitism/bundler/blob/main/packages/sdk/src/calcPreVerificationGas.ts
#[derive(Clone, Copy, Debug)]
struct GasOverheads {
    pub fixed: U256,
    pub per_user_op: U256,
    pub per_user_op_word: U256,
    pub zero_byte: U256,
    pub non_zero_byte: U256,
    pub bundle_size: U256,
}

impl Default for GasOverheads {
    fn default() -> Self {
        Self {
            fixed: 21000.into(),
            per_user_op: 18300.into(),
            per_user_op_word: 4.into(),
            zero_byte: 4.into(),
            non_zero_byte: 16.into(),
            bundle_size: 1.into(),
        }
    }
}

/// Computes the gas an operation must pre-pay for its own serialization:
/// a linear function of the packed calldata plus a fixed per-op overhead.
pub fn calc_pre_verification_gas(op: &UserOperation) -> U256 {
    let ov = GasOverheads::default();
    let packed = op.pack();
    let length_in_words = (packed.len() + 31) / 32;
    let call_data_cost: U256 = packed
        .iter()
        .map(|&x| {
            if x == 0 {
                ov.zero_byte
            } else {
                ov.non_zero_byte
            }
        })
        .reduce(|a, b| a + b)
        .unwrap_or_default();
    ov.fixed / ov.bundle_size
        + call_data_cost
        + ov.per_user_op
        + ov.per_user_op_word * length_in_words
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasFees {
    pub fn increase_by_percent(self, percent: u64) -> Self {
        Self {
            max_fee_per_gas: math::increase_by_percent(self.max_fee_per_gas, percent),
            max_priority_fee_per_gas: math::increase_by_percent(
                self.max_priority_fee_per_gas,
                percent,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_verification_gas_scales_with_calldata() {
        let small = UserOperation::default();
        let large = UserOperation {
            call_data: vec![0xff_u8; 1024].into(),
            ..UserOperation::default()
        };
        let small_pvg = calc_pre_verification_gas(&small);
        let large_pvg = calc_pre_verification_gas(&large);
        assert!(small_pvg > U256::from(21000 + 18300));
        assert!(large_pvg > small_pvg);
        // 1024 extra non-zero bytes cost at least 16 gas each.
        assert!(large_pvg - small_pvg >= U256::from(1024 * 16));
    }

    #[test]
    fn fee_increase() {
        let fees = GasFees {
            max_fee_per_gas: 100.into(),
            max_priority_fee_per_gas: 10.into(),
        };
        let increased = fees.increase_by_percent(10);
        assert_eq!(increased.max_fee_per_gas, 110.into());
        assert_eq!(increased.max_priority_fee_per_gas, 11.into());
    }
}
