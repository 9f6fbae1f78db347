//! Contract ABI fragments used by the wallet.
//!
//! Only the surface the wallet actually calls is declared: the ERC-20 core,
//! the burn-and-mint protocol's token messenger and message transmitter, and
//! the intent relayer's spoke pool.

use alloy_sol_types::sol;

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function name() external view returns (string);
        function symbol() external view returns (string);
        function totalSupply() external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);

        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface ITokenMessenger {
        function depositForBurn(
            uint256 amount,
            uint32 destinationDomain,
            bytes32 mintRecipient,
            address burnToken
        ) external returns (uint64 nonce);

        event DepositForBurn(
            uint64 indexed nonce,
            address indexed burnToken,
            uint256 amount,
            address indexed depositor,
            bytes32 mintRecipient,
            uint32 destinationDomain,
            bytes32 destinationTokenMessenger,
            bytes32 destinationCaller
        );
    }
}

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IMessageTransmitter {
        function receiveMessage(bytes message, bytes attestation) external returns (bool success);
        function usedNonces(bytes32 nonce) external view returns (uint256);
        function localDomain() external view returns (uint32);

        event MessageSent(bytes message);
        event MintAndWithdraw(
            address indexed mintRecipient,
            uint256 amount,
            address indexed mintToken
        );
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IV3SpokePool {
        function depositV3(
            address depositor,
            address recipient,
            address inputToken,
            address outputToken,
            uint256 inputAmount,
            uint256 outputAmount,
            uint256 destinationChainId,
            address exclusiveRelayer,
            uint32 quoteTimestamp,
            uint32 fillDeadline,
            uint32 exclusivityDeadline,
            bytes message
        ) external payable;

        event V3FundsDeposited(
            address inputToken,
            address outputToken,
            uint256 inputAmount,
            uint256 outputAmount,
            uint256 indexed destinationChainId,
            uint32 indexed depositId,
            uint32 quoteTimestamp,
            uint32 fillDeadline,
            uint32 exclusivityDeadline,
            address indexed depositor,
            address recipient,
            address exclusiveRelayer,
            bytes message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256, keccak256};
    use alloy_sol_types::{SolCall, SolEvent};

    #[test]
    fn test_message_sent_topic() {
        assert_eq!(
            IMessageTransmitter::MessageSent::SIGNATURE_HASH,
            keccak256(b"MessageSent(bytes)"),
        );
    }

    #[test]
    fn test_transfer_selector() {
        // transfer(address,uint256) -> 0xa9059cbb
        let call = IERC20::transferCall {
            to: Address::ZERO,
            amount: U256::ZERO,
        };
        assert_eq!(&call.abi_encode()[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_deposit_for_burn_encoding() {
        let call = ITokenMessenger::depositForBurnCall {
            amount: U256::from(100_000_000u64),
            destinationDomain: 6,
            mintRecipient: Address::ZERO.into_word(),
            burnToken: Address::ZERO,
        };
        let encoded = call.abi_encode();
        // selector + 4 static words
        assert_eq!(encoded.len(), 4 + 4 * 32);
    }
}
