//! The bridge protocol adapter contract.
//!
//! Each supported transfer protocol implements [`BridgeProtocol`]; the
//! router treats adapters uniformly through this trait plus the protocol's
//! declared finality model. Adapters are registered in a
//! [`ProtocolRegistry`] owned by the router.

use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeError;
use crate::networks::{Network, TokenDescriptor};
use crate::timestamp::TimestampMs;
use crate::units::Usd6;

/// Which deployment universe the bridge endpoints target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeEnvironment {
    #[default]
    Mainnet,
    Testnet,
}

/// Caller-supplied ETH/USD quote used to price gas in the accounting unit.
///
/// Price oracles live outside this crate; a `None` answer prices gas at
/// zero, which simply makes gas constrain nothing.
#[async_trait]
pub trait NativeUsdQuote: Send + Sync {
    async fn quote_eth_usd(&self) -> Option<Usd6>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeSpeedClass {
    Instant,
    Fast,
    Standard,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalityModel {
    /// Burn on the source chain, mint on the destination after an off-chain
    /// attestation.
    Attestation,
    /// A relayer fills on the destination optimistically and settles later.
    Optimistic,
    /// Tokens locked at the source back wrapped mints at the destination.
    LockAndMint,
}

/// Static description of a protocol adapter.
#[derive(Debug, Clone)]
pub struct ProtocolInfo {
    /// Stable lowercase identifier, also used in tracking ids.
    pub name: &'static str,
    pub display_name: &'static str,
    pub supported_tokens: &'static [&'static str],
    pub typical_speed: BridgeSpeedClass,
    pub finality_model: FinalityModel,
    pub has_protocol_fees: bool,
}

/// A transfer the router is asked to carry out.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub source: Network,
    pub destination: Network,
    pub token: Arc<TokenDescriptor>,
    /// Raw token units.
    pub amount: U256,
    pub recipient: Address,
    /// Prefer the protocol's fast path where one exists.
    pub fast: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeBreakdown {
    pub protocol_usd: Usd6,
    pub gas_usd: Usd6,
}

impl FeeBreakdown {
    pub fn total_usd(&self) -> Usd6 {
        self.protocol_usd.saturating_add(self.gas_usd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlippageEstimate {
    pub expected_bps: u32,
    pub max_bps: u32,
}

#[derive(Debug, Clone)]
pub struct TimeEstimate {
    pub min_secs: u64,
    pub max_secs: u64,
    /// Human-readable rendering, e.g. `"13-19 min"`.
    pub display: String,
}

impl TimeEstimate {
    pub fn from_range(min_secs: u64, max_secs: u64) -> Self {
        let display = if max_secs < 120 {
            format!("{min_secs}-{max_secs} s")
        } else {
            format!("{}-{} min", min_secs.div_ceil(60), max_secs.div_ceil(60))
        };
        Self {
            min_secs,
            max_secs,
            display,
        }
    }

    pub fn average_secs(&self) -> u64 {
        (self.min_secs + self.max_secs) / 2
    }
}

/// A priced route offered by one adapter.
#[derive(Debug, Clone)]
pub struct BridgeQuote {
    /// Adapter name, matching [`ProtocolInfo::name`].
    pub protocol: String,
    pub input_amount: U256,
    pub output_amount: U256,
    pub fees: FeeBreakdown,
    pub slippage: Option<SlippageEstimate>,
    pub time: TimeEstimate,
    pub route_description: String,
    pub expires_at: Option<TimestampMs>,
}

/// Result of the source-chain action that starts a transfer.
#[derive(Debug, Clone)]
pub struct InitResult {
    /// Protocol-scoped identifier (message hash, deposit id, ...).
    pub identifier: String,
    pub source_tx: TxHash,
    /// Opaque protocol message emitted on the source chain, if any.
    pub message_bytes: Option<Bytes>,
    /// Protocol-level nonce, if any.
    pub nonce: Option<u64>,
}

/// Adapter-level view of a transfer in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    Pending,
    /// Attestation available; destination action may proceed.
    AttestationReady,
    Completed,
    Expired,
    Failed(String),
}

/// An off-chain attestation for a source-chain event.
#[derive(Debug, Clone)]
pub struct Attestation {
    pub message: Bytes,
    pub attestation: Bytes,
}

#[async_trait]
pub trait BridgeProtocol: Send + Sync {
    fn info(&self) -> &ProtocolInfo;

    fn supported_chains(&self) -> &[Network];

    fn is_route_supported(
        &self,
        source: Network,
        destination: Network,
        token: &TokenDescriptor,
    ) -> bool;

    /// Liveness probe; implementations cache the answer for at least 60 s.
    async fn is_available(&self) -> bool;

    async fn quote(&self, request: &BridgeRequest) -> Result<BridgeQuote, BridgeError>;

    async fn estimate_fees(&self, request: &BridgeRequest) -> Result<FeeBreakdown, BridgeError>;

    /// Perform the source-chain action (burn, deposit, ...).
    async fn initiate(&self, request: &BridgeRequest) -> Result<InitResult, BridgeError>;

    async fn status(&self, identifier: &str) -> Result<AdapterStatus, BridgeError>;

    /// Wait until the protocol's attestation for `identifier` is available.
    ///
    /// Only meaningful for [`FinalityModel::Attestation`] protocols; others
    /// return [`BridgeError::AttestationUnsupported`].
    async fn wait_for_attestation(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Attestation, BridgeError>;

    /// Perform the destination-chain action, if the protocol has one.
    ///
    /// Returns the destination transaction hash, or `None` when the
    /// protocol completes without wallet involvement.
    async fn complete(
        &self,
        request: &BridgeRequest,
        attestation: &Attestation,
    ) -> Result<Option<TxHash>, BridgeError>;

    /// Historical reliability, 0..=100.
    fn reliability_score(&self) -> u8;
}

/// Convert a native gas cost in wei into the USD accounting unit, given an
/// ETH/USD quote. Truncates toward zero.
pub fn wei_to_usd6(wei: u128, eth_usd: Usd6) -> Usd6 {
    let wei = U256::from(wei);
    let usd = wei.saturating_mul(U256::from(eth_usd.0)) / U256::from(10u128.pow(18));
    Usd6(u128::try_from(usd).unwrap_or(u128::MAX))
}

/// Shared probe cache: adapters answer `is_available` from here so the
/// probe runs at most once per TTL.
pub struct AvailabilityCache {
    ttl: Duration,
    state: Mutex<Option<(Instant, bool)>>,
}

impl std::fmt::Debug for AvailabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl AvailabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(None),
        }
    }

    /// Return the cached answer, or run `probe` and cache its result.
    pub async fn get_or_probe<F, Fut>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        {
            let state = self.state.lock().expect("availability lock poisoned");
            if let Some((at, available)) = *state {
                if at.elapsed() < self.ttl {
                    return available;
                }
            }
        }
        let available = probe().await;
        let mut state = self.state.lock().expect("availability lock poisoned");
        *state = Some((Instant::now(), available));
        available
    }
}

/// The set of adapters the router can route across.
#[derive(Default)]
pub struct ProtocolRegistry {
    adapters: Vec<Arc<dyn BridgeProtocol>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.adapters.iter().map(|a| a.info().name).collect();
        f.debug_struct("ProtocolRegistry")
            .field("adapters", &names)
            .finish()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BridgeProtocol>) {
        self.adapters.push(adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BridgeProtocol>> {
        self.adapters
            .iter()
            .find(|a| a.info().name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BridgeProtocol>> {
        self.adapters.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Registry-wide reliability lookup for the route selector.
    pub fn reliability_of(&self, protocol: &str) -> Option<u8> {
        self.get(protocol).map(|a| a.reliability_score())
    }
}
