//! Chain contract ABIs consumed by the relay (§6).
//!
//! One module holds every contract surface the relay talks to, bound with
//! `alloy::sol!` rather than a hand-rolled ABI decoder.

use alloy::sol;

sol! {
    #[derive(Debug)]
    #[sol(rpc)]
    interface IBridge {
        function currentNonce() external view returns (uint256);
        function minSignatures() external view returns (uint256);
        function usedAttestationIds(bytes32 id) external view returns (bool);
        function getCurrentSupplyCap() external view returns (uint256);
        function attestedCantonAssets() external view returns (uint256);
        function paused() external view returns (bool);
        function pause() external;
        function processAttestation(
            Attestation attestation,
            bytes[] calldata signatures
        ) external;
        function hasRole(bytes32 role, address account) external view returns (bool);

        event AttestationReceived(
            bytes32 indexed id,
            uint256 cantonAssets,
            uint256 newSupplyCap,
            uint256 nonce,
            uint256 timestamp
        );
        event BridgeToCantonRequested(
            bytes32 indexed requestId,
            address indexed sender,
            uint256 amount,
            uint256 nonce,
            string cantonRecipient,
            uint256 timestamp
        );
    }

    #[derive(Debug)]
    struct Attestation {
        uint256 nonce;
        uint256 cantonAssets;
        uint256 timestamp;
        bytes32 entropy;
        bytes32 ledgerStateHash;
        uint256 chainId;
    }

    #[derive(Debug)]
    #[sol(rpc)]
    interface IMusdToken {
        function mint(address to, uint256 amount) external;
        function totalSupply() external view returns (uint256);
        function supplyCap() external view returns (uint256);
        function localCapBps() external view returns (uint256);
        function hasRole(bytes32 role, address account) external view returns (bool);
        function grantRole(bytes32 role, address account) external;
    }

    #[derive(Debug)]
    #[sol(rpc)]
    interface ITreasury {
        function deposit(address from, uint256 amount) external;
        function depositToStrategy(address strategy, uint256 amount) external;
        function asset() external view returns (address);
        function usdc() external view returns (address);
        function hasRole(bytes32 role, address account) external view returns (bool);
    }

    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
        function decimals() external view returns (uint8);
    }

    #[derive(Debug)]
    #[sol(rpc)]
    interface IYieldDistributor {
        event CantonYieldBridged(uint256 indexed epoch, uint256 musdAmount, string cantonRecipient);
    }

    #[derive(Debug)]
    #[sol(rpc)]
    interface IEthPoolYieldDistributor {
        event ETHPoolYieldBridged(
            uint256 indexed epoch,
            uint256 yieldUsdc,
            uint256 musdBridged,
            string ethPoolRecipient
        );
    }
}

/// Known mint-time revert selector for `ExceedsLocalCap()`, treated as a
/// soft skip rather than a retry storm (§4.3).
pub const EXCEEDS_LOCAL_CAP_SELECTOR: [u8; 4] = [0x5d, 0x24, 0xff, 0xe1];

/// Role identifiers, computed the same way the contracts compute them
/// (`keccak256` of the role name), used for `hasRole`/`grantRole` calls.
pub fn role_id(name: &str) -> [u8; 32] {
    crate::hash::keccak256(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_local_cap_selector_is_four_bytes() {
        assert_eq!(EXCEEDS_LOCAL_CAP_SELECTOR.len(), 4);
    }

    #[test]
    fn role_id_is_deterministic() {
        assert_eq!(role_id("BRIDGE_MINT_ROLE"), role_id("BRIDGE_MINT_ROLE"));
        assert_ne!(role_id("BRIDGE_MINT_ROLE"), role_id("EMERGENCY_ROLE"));
    }
}
