//! Configuration for the wallet runtime.
//!
//! Everything deserializes from JSON with serde defaults; hosts may also
//! build the structs directly. Private keys enter as [`EvmPrivateKey`]
//! values parsed from hex — the library never reads them from the
//! environment itself.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::approval::ApprovalConfig;
use crate::bridge::BridgeEnvironment;
use crate::chain::{ChainEndpoint, GasSpeed};
use crate::limits::LimitsConfig;

/// A validated EVM private key (32 bytes).
///
/// Parses from 0x-prefixed or bare hex. The wrapper keeps the scalar out of
/// `Debug` output.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn as_b256(&self) -> B256 {
        self.0
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EvmPrivateKey(..)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("invalid evm private key: {e}"))
    }
}

/// One address-book row in the wallet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressBookEntry {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Top-level wallet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Chains the wallet operates on. At least one is required.
    pub chains: Vec<ChainEndpoint>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted: Vec<AddressBookEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<AddressBookEntry>,
    #[serde(default)]
    pub bridge_environment: BridgeEnvironment,
    /// Default pricing tier for submitted transactions.
    #[serde(default)]
    pub gas_speed: GasSpeed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Usd6;

    #[test]
    fn test_private_key_parses_and_redacts() {
        let key: EvmPrivateKey =
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .parse()
                .unwrap();
        assert_eq!(format!("{key:?}"), "EvmPrivateKey(..)");
        assert!("0x1234".parse::<EvmPrivateKey>().is_err());
    }

    #[test]
    fn test_config_from_json_with_defaults() {
        let json = r#"{
            "chains": [
                { "chain_id": 1, "rpc_url": "https://eth.example.com" },
                { "chain_id": 8453, "rpc_url": "https://base.example.com", "confirmations": 2 }
            ],
            "limits": {
                "per_transaction_usd": "100",
                "per_hour_usd": "500",
                "per_day_usd": "2000"
            },
            "approval": { "amount_exceeds": "75" },
            "blocked": [
                { "address": "0x5555555555555555555555555555555555555555", "reason": "phishing" }
            ]
        }"#;
        let config: WalletConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[1].confirmations, 2);
        assert_eq!(
            config.limits.per_transaction_usd,
            Some(Usd6::from_dollars(100))
        );
        assert_eq!(
            config.approval.amount_exceeds,
            Some(Usd6::from_dollars(75))
        );
        assert!(!config.approval.recipient_is_new);
        assert_eq!(config.approval.timeout_secs, 3_600);
        assert_eq!(config.blocked.len(), 1);
        assert_eq!(config.bridge_environment, BridgeEnvironment::Mainnet);
        assert_eq!(config.gas_speed, GasSpeed::Standard);
    }
}
