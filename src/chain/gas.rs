//! Gas pricing policy.
//!
//! The oracle itself is pure: the [`ChainClient`](crate::chain::ChainClient)
//! feeds it the latest base fee, a fee history, or a legacy gas price, and
//! it turns those into clamped fee parameters. Keeping the arithmetic free
//! of I/O makes the percentile and clamping rules directly testable.

use alloy_rpc_types_eth::FeeHistory;
use serde::{Deserialize, Serialize};

pub const GWEI: u128 = 1_000_000_000;

/// How aggressively to price a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasSpeed {
    Slow,
    #[default]
    Standard,
    Fast,
}

impl GasSpeed {
    /// Index into the fee-history reward percentiles {10, 50, 90}.
    fn percentile_index(&self) -> usize {
        match self {
            GasSpeed::Slow => 0,
            GasSpeed::Standard => 1,
            GasSpeed::Fast => 2,
        }
    }
}

/// Priced fee parameters for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasFees {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

impl GasFees {
    /// The worst-case price per gas unit, used for USD gas estimates.
    pub fn price_ceiling(&self) -> u128 {
        match self {
            GasFees::Legacy { gas_price } => *gas_price,
            GasFees::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Floor for any priced fee component (wei).
    #[serde(default = "gas_defaults::min_gas_price_wei")]
    pub min_gas_price_wei: u128,
    /// Ceiling for any priced fee component (wei).
    #[serde(default = "gas_defaults::max_gas_price_wei")]
    pub max_gas_price_wei: u128,
    /// Percent headroom added to gas-limit estimates.
    #[serde(default = "gas_defaults::gas_limit_headroom_percent")]
    pub gas_limit_headroom_percent: u64,
    /// Blocks of fee history to sample.
    #[serde(default = "gas_defaults::fee_history_blocks")]
    pub fee_history_blocks: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            min_gas_price_wei: gas_defaults::min_gas_price_wei(),
            max_gas_price_wei: gas_defaults::max_gas_price_wei(),
            gas_limit_headroom_percent: gas_defaults::gas_limit_headroom_percent(),
            fee_history_blocks: gas_defaults::fee_history_blocks(),
        }
    }
}

mod gas_defaults {
    use super::GWEI;

    pub fn min_gas_price_wei() -> u128 {
        GWEI
    }

    pub fn max_gas_price_wei() -> u128 {
        500 * GWEI
    }

    pub fn gas_limit_headroom_percent() -> u64 {
        10
    }

    pub fn fee_history_blocks() -> u64 {
        10
    }
}

/// Reward percentiles requested from `eth_feeHistory`.
pub const REWARD_PERCENTILES: [f64; 3] = [10.0, 50.0, 90.0];

#[derive(Debug, Clone)]
pub struct GasOracle {
    config: GasConfig,
}

impl GasOracle {
    pub fn new(config: GasConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GasConfig {
        &self.config
    }

    fn clamp(&self, price: u128) -> u128 {
        price.clamp(self.config.min_gas_price_wei, self.config.max_gas_price_wei)
    }

    /// Add the configured headroom to a gas-limit estimate.
    pub fn pad_gas_limit(&self, estimate: u64) -> u64 {
        let padded =
            u128::from(estimate) * u128::from(100 + self.config.gas_limit_headroom_percent) / 100;
        u64::try_from(padded).unwrap_or(u64::MAX)
    }

    /// Legacy pricing: scale the node's gas price by speed tier.
    ///
    /// Slow shaves 10 percent, fast adds 20; everything stays inside the
    /// configured clamp range.
    pub fn legacy_fees(&self, gas_price: u128, speed: GasSpeed) -> GasFees {
        let scaled = match speed {
            GasSpeed::Slow => gas_price * 90 / 100,
            GasSpeed::Standard => gas_price,
            GasSpeed::Fast => gas_price * 120 / 100,
        };
        GasFees::Legacy {
            gas_price: self.clamp(scaled),
        }
    }

    /// EIP-1559 pricing from a fee history and the latest base fee.
    ///
    /// The priority fee is the per-block reward at the speed's percentile,
    /// taken as the *median* across blocks rather than the mean so a single
    /// outlier block cannot skew the tip. `max_fee = 2 * base + priority`.
    pub fn eip1559_fees(
        &self,
        history: &FeeHistory,
        latest_base_fee: u128,
        speed: GasSpeed,
    ) -> GasFees {
        let index = speed.percentile_index();
        let mut rewards: Vec<u128> = history
            .reward
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|per_block| per_block.get(index).copied())
            .collect();
        rewards.sort_unstable();
        let priority = if rewards.is_empty() {
            self.config.min_gas_price_wei
        } else {
            rewards[rewards.len() / 2]
        };
        let priority = self.clamp(priority);
        let max_fee = self.clamp(2 * latest_base_fee + priority);
        GasFees::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority.min(max_fee),
        }
    }
}
