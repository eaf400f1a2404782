use ethers::contract::abigen;

// Inline human-readable ABI covering the slice of the EntryPoint this
// bundler interacts with. The generated `UserOperation` struct is the
// canonical operation type used across the crate.
abigen!(
    IEntryPoint,
    r#"[
        struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
        struct DepositInfo { uint112 deposit; bool staked; uint112 stake; uint32 unstakeDelaySec; uint48 withdrawTime; }
        function handleOps(UserOperation[] ops, address beneficiary)
        function getDepositInfo(address account) view returns (DepositInfo info)
        function balanceOf(address account) view returns (uint256)
        error FailedOp(uint256 opIndex, string reason)
        event UserOperationEvent(bytes32 indexed userOpHash, address indexed sender, address indexed paymaster, uint256 nonce, bool success, uint256 actualGasCost, uint256 actualGasUsed)
    ]"#,
    derives(serde::Deserialize, serde::Serialize)
);
