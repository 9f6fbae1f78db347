//! Pre-flight validation for bridge transfers.
//!
//! Everything here runs before any chain I/O: chain sanity, destination
//! allow-list, recipient shape, and transfer economics. Checks either fail
//! the transfer or attach a warning to the outcome.

use alloy_primitives::{Address, address};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::bridge::BridgeError;
use crate::bridge::protocol::{BridgeQuote, BridgeRequest};
use crate::networks::Network;
use crate::units::{Usd6, to_usd6};

/// Transfers below this are uneconomical by default: $1.00.
pub const DEFAULT_MIN_BRIDGE_USD: Usd6 = Usd6::from_dollars(1);

/// Gas at or above this share of the transfer value is a warning.
const GAS_WARN_PERCENT: u128 = 10;
/// Gas at or above this share of the transfer value is an error.
const GAS_ERROR_PERCENT: u128 = 50;

/// Common burn sinks that are never legitimate recipients.
const BURN_ADDRESSES: [Address; 2] = [
    Address::ZERO,
    address!("0x000000000000000000000000000000000000dead"),
];

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BridgeValidator {
    min_amount_usd: Usd6,
}

impl Default for BridgeValidator {
    fn default() -> Self {
        Self {
            min_amount_usd: DEFAULT_MIN_BRIDGE_USD,
        }
    }
}

impl BridgeValidator {
    pub fn new(min_amount_usd: Usd6) -> Self {
        Self { min_amount_usd }
    }

    /// Validate a transfer before initiation.
    ///
    /// `supported_chains` is the union of chains the registered adapters can
    /// reach; `quote` supplies the fee side of the economics checks when one
    /// is already available.
    pub fn validate(
        &self,
        request: &BridgeRequest,
        route_supported: bool,
        supported_chains: &[Network],
        allowed_destinations: Option<&BTreeSet<u64>>,
        quote: Option<&BridgeQuote>,
    ) -> Result<ValidationOutcome, BridgeError> {
        let mut outcome = ValidationOutcome::default();

        if request.source == request.destination {
            return Err(BridgeError::SameChain(request.source));
        }

        if let Some(allowed) = allowed_destinations {
            if !allowed.contains(&request.destination.chain_id()) {
                return Err(BridgeError::DestinationNotAllowed {
                    destination: request.destination,
                    allowed: allowed.iter().map(u64::to_string).collect::<Vec<_>>().join(", "),
                });
            }
        }

        if !route_supported {
            return Err(BridgeError::UnsupportedRoute {
                source_chain: request.source,
                destination: request.destination,
                token: request.token.symbol.clone(),
                supported: supported_chains
                    .iter()
                    .map(|n| n.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        if BURN_ADDRESSES.contains(&request.recipient) {
            return Err(BridgeError::InvalidRecipient(format!(
                "{} is a burn address",
                request.recipient
            )));
        }

        let amount_usd = to_usd6(request.amount, request.token.decimals);
        if amount_usd < self.min_amount_usd {
            return Err(BridgeError::AmountTooSmall {
                amount: amount_usd,
                minimum: self.min_amount_usd,
            });
        }

        if let Some(quote) = quote {
            let gas = quote.fees.gas_usd;
            if amount_usd.0 > 0 {
                if gas.0 * 100 >= amount_usd.0 * GAS_ERROR_PERCENT {
                    return Err(BridgeError::GasDisproportionate {
                        gas,
                        amount: amount_usd,
                    });
                }
                if gas.0 * 100 >= amount_usd.0 * GAS_WARN_PERCENT {
                    outcome.warnings.push(format!(
                        "gas ({gas}) is over 10% of the transfer amount ({amount_usd})"
                    ));
                }
            }
        }

        Ok(outcome)
    }
}

/// Parse a recipient string into an address.
///
/// A mixed-case input with a wrong EIP-55 checksum parses anyway but comes
/// back with a warning; the checksum is advisory, not load-bearing.
pub fn parse_recipient(input: &str) -> Result<(Address, Option<String>), BridgeError> {
    let address = Address::from_str(input)
        .map_err(|e| BridgeError::InvalidRecipient(format!("{input}: {e}")))?;
    let body = input.strip_prefix("0x").unwrap_or(input);
    let mixed_case = body.chars().any(|c| c.is_ascii_uppercase())
        && body.chars().any(|c| c.is_ascii_lowercase());
    let warning = if mixed_case && address.to_checksum(None) != format!("0x{body}") {
        Some(format!(
            "address {input} does not match its EIP-55 checksum"
        ))
    } else {
        None
    };
    Ok((address, warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{FeeBreakdown, TimeEstimate};
    use crate::networks::TokenRegistry;
    use alloy_primitives::U256;
    use std::sync::Arc;

    fn request(amount_usdc: u64) -> BridgeRequest {
        let token = TokenRegistry::builtin().unwrap().get("USDC").unwrap();
        BridgeRequest {
            source: Network::Ethereum,
            destination: Network::Base,
            token: Arc::clone(&token),
            amount: U256::from(amount_usdc) * U256::from(1_000_000u64),
            recipient: address!("0x7777777777777777777777777777777777777777"),
            fast: false,
        }
    }

    fn quote_with_gas(gas: Usd6) -> BridgeQuote {
        BridgeQuote {
            protocol: "cctp".into(),
            input_amount: U256::from(100_000_000u64),
            output_amount: U256::from(100_000_000u64),
            fees: FeeBreakdown {
                protocol_usd: Usd6::ZERO,
                gas_usd: gas,
            },
            slippage: None,
            time: TimeEstimate::from_range(780, 1140),
            route_description: "burn and mint".into(),
            expires_at: None,
        }
    }

    fn all_chains() -> Vec<Network> {
        vec![Network::Ethereum, Network::Base, Network::Arbitrum]
    }

    #[test]
    fn test_same_chain_rejected() {
        let mut req = request(100);
        req.destination = Network::Ethereum;
        let err = BridgeValidator::default()
            .validate(&req, true, &all_chains(), None, None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::SameChain(Network::Ethereum)));
    }

    #[test]
    fn test_destination_allowlist_checked_before_route() {
        let req = request(100);
        let allowed: BTreeSet<u64> = [10u64].into_iter().collect();
        // Route support is false too, but the allow-list verdict comes first
        // so no adapter (or chain) is ever consulted.
        let err = BridgeValidator::default()
            .validate(&req, false, &all_chains(), Some(&allowed), None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::DestinationNotAllowed { .. }));
    }

    #[test]
    fn test_unsupported_route_lists_chains() {
        let req = request(100);
        let err = BridgeValidator::default()
            .validate(&req, false, &all_chains(), None, None)
            .unwrap_err();
        match err {
            BridgeError::UnsupportedRoute { supported, .. } => {
                assert!(supported.contains("ethereum"));
                assert!(supported.contains("arbitrum"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_burn_recipient_rejected() {
        let mut req = request(100);
        req.recipient = Address::ZERO;
        assert!(matches!(
            BridgeValidator::default().validate(&req, true, &all_chains(), None, None),
            Err(BridgeError::InvalidRecipient(_))
        ));
        req.recipient = address!("0x000000000000000000000000000000000000dead");
        assert!(matches!(
            BridgeValidator::default().validate(&req, true, &all_chains(), None, None),
            Err(BridgeError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_minimum_amount() {
        let err = BridgeValidator::default()
            .validate(&request(0), true, &all_chains(), None, None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::AmountTooSmall { .. }));
        assert!(
            BridgeValidator::default()
                .validate(&request(1), true, &all_chains(), None, None)
                .is_ok()
        );
    }

    #[test]
    fn test_gas_ratio_warning_and_error() {
        let validator = BridgeValidator::default();
        let req = request(100);
        // 10% of $100 warns.
        let outcome = validator
            .validate(
                &req,
                true,
                &all_chains(),
                None,
                Some(&quote_with_gas(Usd6::from_dollars(10))),
            )
            .unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        // 50% errors.
        let err = validator
            .validate(
                &req,
                true,
                &all_chains(),
                None,
                Some(&quote_with_gas(Usd6::from_dollars(50))),
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::GasDisproportionate { .. }));
        // 5% is fine.
        let outcome = validator
            .validate(
                &req,
                true,
                &all_chains(),
                None,
                Some(&quote_with_gas(Usd6::from_dollars(5))),
            )
            .unwrap();
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_parse_recipient_checksum_warning() {
        // Correct checksum: no warning.
        let (_, warning) =
            parse_recipient("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert!(warning.is_none());
        // Lowercase: no checksum claim, no warning.
        let (_, warning) =
            parse_recipient("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap();
        assert!(warning.is_none());
        // Scrambled case: parses with a warning.
        let (address, warning) =
            parse_recipient("0xA0B86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert_eq!(
            address,
            Address::from_str("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").unwrap()
        );
        assert!(warning.is_some());
        // Not an address at all.
        assert!(parse_recipient("0x1234").is_err());
    }
}
