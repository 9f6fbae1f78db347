//! The wallet-level error taxonomy.
//!
//! Subsystem errors keep their own types; [`WalletError`] flattens them at
//! the facade boundary so hosts match on one enum. Policy refusals carry a
//! remediation hint alongside the structured reason.

use crate::approval::ApprovalError;
use crate::bridge::BridgeError;
use crate::chain::ChainError;
use crate::limits::LimitsError;
use crate::networks::TokenRegistryError;
use crate::policy::AddressPolicyError;
use crate::signer::SignerError;
use crate::units::AmountParseError;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error(transparent)]
    InvalidAmount(#[from] AmountParseError),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("chain {0} is not configured")]
    UnsupportedChain(u64),
    #[error("token {symbol} is not available on {chain}")]
    UnsupportedToken { symbol: String, chain: String },
    #[error(transparent)]
    Registry(#[from] TokenRegistryError),
    #[error(transparent)]
    AddressPolicy(#[from] AddressPolicyError),
    #[error(transparent)]
    Limits(#[from] LimitsError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("operation cancelled")]
    Cancelled,
}

impl WalletError {
    /// A caller-facing suggestion for getting past the error, where one
    /// exists.
    pub fn remediation(&self) -> Option<String> {
        match self {
            WalletError::Limits(error) => Some(error.remediation()),
            WalletError::Approval(ApprovalError::Expired { .. }) => {
                Some("resubmit the action and decide the approval in time".to_string())
            }
            WalletError::Bridge(BridgeError::AmountTooSmall { minimum, .. }) => {
                Some(format!("increase the amount to at least {minimum}"))
            }
            WalletError::Bridge(BridgeError::DestinationNotAllowed { allowed, .. }) => {
                Some(format!("bridge to one of the allowed chains: {allowed}"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::LimitWindow;
    use crate::timestamp::TimestampMs;
    use crate::units::Usd6;

    #[test]
    fn test_limits_remediation_passthrough() {
        let error = WalletError::from(LimitsError::WindowExceeded {
            window: LimitWindow::Hour,
            used: Usd6::from_dollars(450),
            limit: Usd6::from_dollars(500),
            resets_at: TimestampMs(1_000),
        });
        let hint = error.remediation().unwrap();
        assert!(hint.contains("$50"));
        assert!(hint.contains("wait until"));
    }

    #[test]
    fn test_most_errors_have_no_hint() {
        assert!(WalletError::UnsupportedChain(42).remediation().is_none());
    }
}
