//! Network definitions and known token deployments.
//!
//! This module defines the supported EVM networks and their chain IDs, and
//! provides statically known stablecoin deployments per network. Every
//! address table is validated when the registry is constructed; a malformed
//! entry fails fast instead of surfacing later as a lost transfer.

use alloy_primitives::Address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

/// Supported EVM networks.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Ethereum mainnet (chain ID 1).
    #[serde(rename = "ethereum")]
    Ethereum,
    /// Sepolia testnet (chain ID 11155111).
    #[serde(rename = "sepolia")]
    Sepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Arbitrum One (chain ID 42161).
    #[serde(rename = "arbitrum")]
    Arbitrum,
    /// OP Mainnet (chain ID 10).
    #[serde(rename = "optimism")]
    Optimism,
    /// Polygon PoS (chain ID 137).
    #[serde(rename = "polygon")]
    Polygon,
    /// Avalanche C-Chain (chain ID 43114).
    #[serde(rename = "avalanche")]
    Avalanche,
}

impl Network {
    /// Return the numeric chain ID associated with the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::Ethereum => 1,
            Network::Sepolia => 11155111,
            Network::Base => 8453,
            Network::BaseSepolia => 84532,
            Network::Arbitrum => 42161,
            Network::Optimism => 10,
            Network::Polygon => 137,
            Network::Avalanche => 43114,
        }
    }

    /// Look a network up by its numeric chain ID.
    pub fn from_chain_id(chain_id: u64) -> Option<Network> {
        Self::variants()
            .iter()
            .copied()
            .find(|n| n.chain_id() == chain_id)
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[
            Network::Ethereum,
            Network::Sepolia,
            Network::Base,
            Network::BaseSepolia,
            Network::Arbitrum,
            Network::Optimism,
            Network::Polygon,
            Network::Avalanche,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Sepolia => "sepolia",
            Network::Base => "base",
            Network::BaseSepolia => "base-sepolia",
            Network::Arbitrum => "arbitrum",
            Network::Optimism => "optimism",
            Network::Polygon => "polygon",
            Network::Avalanche => "avalanche",
        }
    }

    pub fn is_testnet(&self) -> bool {
        matches!(self, Network::Sepolia | Network::BaseSepolia)
    }

    /// Ticker of the native gas currency.
    pub fn native_symbol(&self) -> &'static str {
        match self {
            Network::Polygon => "POL",
            Network::Avalanche => "AVAX",
            _ => "ETH",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A token known to the wallet, with its per-network deployments.
///
/// Two amounts denominate the same token across chains iff they share the
/// same descriptor instance; compare with [`TokenDescriptor::same_token`]
/// rather than by symbol.
#[derive(Debug)]
pub struct TokenDescriptor {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    /// Whether the token is treated as USD at par by the accounting layer.
    pub stablecoin: bool,
    addresses: HashMap<u64, Address>,
}

impl TokenDescriptor {
    /// The token's contract address on the given network, if deployed there.
    pub fn address_on(&self, network: Network) -> Option<Address> {
        self.addresses.get(&network.chain_id()).copied()
    }

    /// Networks this token is deployed on.
    pub fn deployments(&self) -> impl Iterator<Item = Network> + '_ {
        self.addresses.keys().filter_map(|id| Network::from_chain_id(*id))
    }

    /// Identity comparison: same descriptor instance, not same symbol.
    pub fn same_token(a: &Arc<TokenDescriptor>, b: &Arc<TokenDescriptor>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenRegistryError {
    #[error("malformed address {value:?} for {token} on chain {chain_id}: {reason}")]
    MalformedAddress {
        token: String,
        chain_id: u64,
        value: String,
        reason: String,
    },
    #[error("token {0} declares {1} decimals, maximum is {max}", max = crate::units::MAX_DECIMALS)]
    DecimalsOutOfRange(String, u8),
    #[error("duplicate token symbol {0}")]
    DuplicateSymbol(String),
}

/// Source row for a token entry; addresses are unparsed so the registry can
/// validate them at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    #[serde(default)]
    pub stablecoin: bool,
    /// chain id -> hex address.
    pub addresses: Vec<(u64, String)>,
}

/// Registry of token descriptors, validated at construction.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: Vec<Arc<TokenDescriptor>>,
}

impl TokenRegistry {
    /// Build a registry from raw entries, validating every address.
    ///
    /// A mixed-case address must carry a valid EIP-55 checksum; an address of
    /// the wrong length or with non-hex characters is rejected outright.
    pub fn from_entries(entries: Vec<TokenEntry>) -> Result<Self, TokenRegistryError> {
        let mut tokens: Vec<Arc<TokenDescriptor>> = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.decimals > crate::units::MAX_DECIMALS {
                return Err(TokenRegistryError::DecimalsOutOfRange(
                    entry.symbol,
                    entry.decimals,
                ));
            }
            if tokens.iter().any(|t| t.symbol == entry.symbol) {
                return Err(TokenRegistryError::DuplicateSymbol(entry.symbol));
            }
            let mut addresses = HashMap::with_capacity(entry.addresses.len());
            for (chain_id, raw) in &entry.addresses {
                let address = validate_table_address(raw).map_err(|reason| {
                    TokenRegistryError::MalformedAddress {
                        token: entry.symbol.clone(),
                        chain_id: *chain_id,
                        value: raw.clone(),
                        reason,
                    }
                })?;
                addresses.insert(*chain_id, address);
            }
            tokens.push(Arc::new(TokenDescriptor {
                symbol: entry.symbol,
                name: entry.name,
                decimals: entry.decimals,
                stablecoin: entry.stablecoin,
                addresses,
            }));
        }
        Ok(Self { tokens })
    }

    /// The built-in stablecoin tables: USDC everywhere we bridge, plus DAI
    /// and USDT on Ethereum mainnet.
    pub fn builtin() -> Result<Self, TokenRegistryError> {
        Self::from_entries(builtin_entries())
    }

    /// Shared instance of the built-in registry.
    pub fn shared() -> &'static TokenRegistry {
        static BUILTIN: Lazy<TokenRegistry> =
            Lazy::new(|| TokenRegistry::builtin().expect("builtin token tables are valid"));
        &BUILTIN
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<TokenDescriptor>> {
        self.tokens
            .iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
    }

    /// Resolve a symbol to its descriptor and deployment address on a network.
    pub fn resolve(
        &self,
        symbol: &str,
        network: Network,
    ) -> Option<(Arc<TokenDescriptor>, Address)> {
        let token = self.get(symbol)?;
        let address = token.address_on(network)?;
        Some((token, address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TokenDescriptor>> {
        self.tokens.iter()
    }
}

/// Parse and checksum-validate an address-table entry.
fn validate_table_address(raw: &str) -> Result<Address, String> {
    let address = Address::from_str(raw).map_err(|e| e.to_string())?;
    let body = raw.strip_prefix("0x").unwrap_or(raw);
    let mixed_case = body.chars().any(|c| c.is_ascii_uppercase())
        && body.chars().any(|c| c.is_ascii_lowercase());
    if mixed_case && address.to_checksum(None) != format!("0x{body}") {
        return Err("EIP-55 checksum mismatch".to_string());
    }
    Ok(address)
}

fn builtin_entries() -> Vec<TokenEntry> {
    vec![
        TokenEntry {
            symbol: "USDC".into(),
            name: "USD Coin".into(),
            decimals: 6,
            stablecoin: true,
            addresses: vec![
                (1, "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into()),
                (8453, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".into()),
                (42161, "0xaf88d065e77c8cC2239327C5EDb3A432268e5831".into()),
                (10, "0x0b2C639c533813f4Aa9D7837CAf62653d097Ff85".into()),
                (137, "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359".into()),
                (43114, "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E".into()),
                (11155111, "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238".into()),
                (84532, "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into()),
            ],
        },
        TokenEntry {
            symbol: "DAI".into(),
            name: "Dai Stablecoin".into(),
            decimals: 18,
            stablecoin: true,
            addresses: vec![(1, "0x6B175474E89094C44Da98b954EedeAC495271d0F".into())],
        },
        TokenEntry {
            symbol: "USDT".into(),
            name: "Tether USD".into(),
            decimals: 6,
            stablecoin: true,
            addresses: vec![(1, "0xdAC17F958D2ee523a2206206994597C13D831ec7".into())],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_id_roundtrip() {
        for network in Network::variants() {
            assert_eq!(Network::from_chain_id(network.chain_id()), Some(*network));
        }
        assert_eq!(Network::from_chain_id(999_999), None);
    }

    #[test]
    fn test_builtin_registry_validates() {
        let registry = TokenRegistry::builtin().unwrap();
        let usdc = registry.get("usdc").unwrap();
        assert_eq!(usdc.decimals, 6);
        assert!(usdc.stablecoin);
        assert!(usdc.address_on(Network::Base).is_some());
        assert!(usdc.address_on(Network::Ethereum).is_some());

        let dai = registry.get("DAI").unwrap();
        assert_eq!(dai.decimals, 18);
        assert!(dai.address_on(Network::Base).is_none());
    }

    #[test]
    fn test_shared_registry() {
        assert!(TokenRegistry::shared().get("USDC").is_some());
        assert!(TokenRegistry::shared().get("WETH").is_none());
    }

    #[test]
    fn test_malformed_address_fails_fast() {
        let entries = vec![TokenEntry {
            symbol: "BAD".into(),
            name: "Bad Token".into(),
            decimals: 18,
            stablecoin: true,
            // One nibble short.
            addresses: vec![(1, "0x6B175474E89094C44Da98b954EedeAC495271d0".into())],
        }];
        let err = TokenRegistry::from_entries(entries).unwrap_err();
        assert!(matches!(err, TokenRegistryError::MalformedAddress { .. }));
    }

    #[test]
    fn test_bad_checksum_fails_fast() {
        // Valid hex, but the EIP-55 casing is wrong.
        let entries = vec![TokenEntry {
            symbol: "BAD".into(),
            name: "Bad Token".into(),
            decimals: 18,
            stablecoin: true,
            addresses: vec![(1, "0x6b175474E89094C44Da98b954EedeAC495271d0F".into())],
        }];
        let err = TokenRegistry::from_entries(entries).unwrap_err();
        assert!(matches!(err, TokenRegistryError::MalformedAddress { .. }));
    }

    #[test]
    fn test_lowercase_address_accepted() {
        // All-lowercase carries no checksum claim and must be accepted.
        let entries = vec![TokenEntry {
            symbol: "OK".into(),
            name: "Ok Token".into(),
            decimals: 18,
            stablecoin: true,
            addresses: vec![(1, "0x6b175474e89094c44da98b954eedeac495271d0f".into())],
        }];
        assert!(TokenRegistry::from_entries(entries).is_ok());
    }

    #[test]
    fn test_same_token_is_identity() {
        let registry = TokenRegistry::builtin().unwrap();
        let a = registry.get("USDC").unwrap();
        let b = registry.get("USDC").unwrap();
        assert!(TokenDescriptor::same_token(&a, &b));
        let dai = registry.get("DAI").unwrap();
        assert!(!TokenDescriptor::same_token(&a, &dai));
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let mut entries = builtin_entries();
        entries.push(TokenEntry {
            symbol: "USDC".into(),
            name: "Copycat".into(),
            decimals: 6,
            stablecoin: true,
            addresses: vec![],
        });
        assert!(matches!(
            TokenRegistry::from_entries(entries),
            Err(TokenRegistryError::DuplicateSymbol(_))
        ));
    }
}
