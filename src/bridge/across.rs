//! Intent-relayer fill-and-settle adapter (Across).
//!
//! The wallet deposits into the source-chain spoke pool with a fee quote
//! from the relayer API; a relayer fills on the destination within seconds
//! and settles against the pool later. The wallet never acts on the
//! destination chain; it only polls the deposit status until `filled` or
//! `expired`.

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::abi::{IERC20, IV3SpokePool};
use crate::bridge::BridgeError;
use crate::bridge::protocol::{
    AdapterStatus, Attestation, AvailabilityCache, BridgeEnvironment, BridgeProtocol,
    BridgeQuote, BridgeRequest, BridgeSpeedClass, FeeBreakdown, FinalityModel, InitResult,
    NativeUsdQuote, ProtocolInfo, TimeEstimate, wei_to_usd6,
};
use crate::bridge::validate::DEFAULT_MIN_BRIDGE_USD;
use crate::chain::{ChainClient, GasSpeed, NonceCoordinator};
use crate::networks::{Network, TokenDescriptor};
use crate::signer::AgentSigner;
use crate::timestamp::TimestampMs;
use crate::units::{Usd6, to_usd6};

const MAINNET_API_BASE: &str = "https://app.across.to/api";
const TESTNET_API_BASE: &str = "https://testnet.across.to/api";

/// Deposit gas budget for quoting, in units.
const DEPOSIT_GAS: u64 = 120_000;
const APPROVE_GAS: u64 = 55_000;

/// How long a fee quote is treated as usable.
const QUOTE_TTL: Duration = Duration::from_secs(300);

const MAINNET_CHAINS: &[Network] = &[
    Network::Ethereum,
    Network::Optimism,
    Network::Polygon,
    Network::Base,
    Network::Arbitrum,
];
const TESTNET_CHAINS: &[Network] = &[Network::Sepolia, Network::BaseSepolia];

#[derive(Debug, Clone)]
pub struct AcrossConfig {
    pub environment: BridgeEnvironment,
    /// Overrides the environment's default relayer API URL.
    pub api_base: Option<Url>,
    pub gas_speed: GasSpeed,
}

impl Default for AcrossConfig {
    fn default() -> Self {
        Self {
            environment: BridgeEnvironment::Mainnet,
            api_base: None,
            gas_speed: GasSpeed::Standard,
        }
    }
}

impl AcrossConfig {
    fn api_base(&self) -> String {
        if let Some(base) = &self.api_base {
            return base.as_str().trim_end_matches('/').to_string();
        }
        match self.environment {
            BridgeEnvironment::Mainnet => MAINNET_API_BASE.to_string(),
            BridgeEnvironment::Testnet => TESTNET_API_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RelayFeeComponent {
    /// Raw token units.
    total: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestedFees {
    total_relay_fee: RelayFeeComponent,
    relayer_gas_fee: RelayFeeComponent,
    lp_fee: RelayFeeComponent,
    /// Quote timestamp, seconds.
    timestamp: String,
    #[serde(default)]
    is_amount_too_low: bool,
    spoke_pool_address: String,
    #[serde(default)]
    exclusive_relayer: Option<String>,
    #[serde(default)]
    exclusivity_deadline: Option<u32>,
    #[serde(default)]
    fill_deadline: Option<String>,
    #[serde(default)]
    estimated_fill_time_sec: Option<u64>,
}

impl SuggestedFees {
    fn total_fee_raw(&self) -> Result<U256, BridgeError> {
        parse_units(&self.total_relay_fee.total)
    }
}

fn parse_units(value: &str) -> Result<U256, BridgeError> {
    U256::from_str_radix(value, 10)
        .map_err(|e| BridgeError::Completion(format!("unparseable fee amount {value:?}: {e}")))
}

#[derive(Debug, Deserialize)]
struct DepositStatus {
    status: String,
}

/// Origin-chain context kept per deposit id so status polls can query the
/// right chain.
#[derive(Debug, Clone, Copy)]
struct DepositOrigin {
    chain_id: u64,
}

pub struct AcrossAdapter {
    info: ProtocolInfo,
    config: AcrossConfig,
    clients: HashMap<u64, Arc<ChainClient>>,
    signer: Arc<AgentSigner>,
    nonces: Arc<NonceCoordinator>,
    native_usd: Option<Arc<dyn NativeUsdQuote>>,
    http: reqwest::Client,
    chains: Vec<Network>,
    deposits: Mutex<HashMap<String, DepositOrigin>>,
    availability: AvailabilityCache,
}

impl std::fmt::Debug for AcrossAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcrossAdapter")
            .field("config", &self.config)
            .field("chains", &self.chains)
            .finish_non_exhaustive()
    }
}

impl AcrossAdapter {
    pub fn new(
        config: AcrossConfig,
        clients: HashMap<u64, Arc<ChainClient>>,
        signer: Arc<AgentSigner>,
        nonces: Arc<NonceCoordinator>,
        native_usd: Option<Arc<dyn NativeUsdQuote>>,
    ) -> Self {
        let universe = match config.environment {
            BridgeEnvironment::Mainnet => MAINNET_CHAINS,
            BridgeEnvironment::Testnet => TESTNET_CHAINS,
        };
        let chains: Vec<Network> = universe
            .iter()
            .copied()
            .filter(|n| clients.contains_key(&n.chain_id()))
            .collect();
        Self {
            info: ProtocolInfo {
                name: "across",
                display_name: "Across",
                supported_tokens: &["USDC"],
                typical_speed: BridgeSpeedClass::Instant,
                finality_model: FinalityModel::Optimistic,
                has_protocol_fees: true,
            },
            config,
            clients,
            signer,
            nonces,
            native_usd,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            chains,
            deposits: Mutex::new(HashMap::new()),
            availability: AvailabilityCache::default(),
        }
    }

    fn client(&self, network: Network) -> Result<&Arc<ChainClient>, BridgeError> {
        self.clients.get(&network.chain_id()).ok_or_else(|| {
            BridgeError::ProtocolUnavailable(format!("across: no chain client for {network}"))
        })
    }

    async fn suggested_fees(&self, request: &BridgeRequest) -> Result<SuggestedFees, BridgeError> {
        let input_token = request.token.address_on(request.source).ok_or_else(|| {
            BridgeError::ProtocolUnavailable(format!(
                "across: {} not deployed on {}",
                request.token.symbol, request.source
            ))
        })?;
        let output_token = request.token.address_on(request.destination).ok_or_else(|| {
            BridgeError::ProtocolUnavailable(format!(
                "across: {} not deployed on {}",
                request.token.symbol, request.destination
            ))
        })?;
        let url = format!(
            "{}/suggested-fees?inputToken={input_token}&outputToken={output_token}\
             &originChainId={}&destinationChainId={}&amount={}&recipient={}",
            self.config.api_base(),
            request.source.chain_id(),
            request.destination.chain_id(),
            request.amount,
            request.recipient,
        );
        let fees: SuggestedFees = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if fees.is_amount_too_low {
            return Err(BridgeError::AmountTooSmall {
                amount: to_usd6(request.amount, request.token.decimals),
                minimum: DEFAULT_MIN_BRIDGE_USD,
            });
        }
        Ok(fees)
    }

    async fn gas_estimate_usd(&self, request: &BridgeRequest) -> Result<Usd6, BridgeError> {
        let Some(oracle) = &self.native_usd else {
            return Ok(Usd6::ZERO);
        };
        let Some(eth_usd) = oracle.quote_eth_usd().await else {
            return Ok(Usd6::ZERO);
        };
        let source = self.client(request.source)?;
        let fees = source.gas_fees(self.config.gas_speed).await?;
        let units = u128::from(DEPOSIT_GAS + APPROVE_GAS);
        Ok(wei_to_usd6(units * fees.price_ceiling(), eth_usd))
    }
}

#[async_trait]
impl BridgeProtocol for AcrossAdapter {
    fn info(&self) -> &ProtocolInfo {
        &self.info
    }

    fn supported_chains(&self) -> &[Network] {
        &self.chains
    }

    fn is_route_supported(
        &self,
        source: Network,
        destination: Network,
        token: &TokenDescriptor,
    ) -> bool {
        source != destination
            && self.chains.contains(&source)
            && self.chains.contains(&destination)
            && self.info.supported_tokens.contains(&token.symbol.as_str())
            && token.address_on(source).is_some()
            && token.address_on(destination).is_some()
    }

    async fn is_available(&self) -> bool {
        self.availability
            .get_or_probe(|| async {
                let url = format!("{}/available-routes", self.config.api_base());
                match self.http.get(&url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(error) => {
                        tracing::warn!(%error, "relayer API probe failed");
                        false
                    }
                }
            })
            .await
    }

    async fn quote(&self, request: &BridgeRequest) -> Result<BridgeQuote, BridgeError> {
        let fees = self.suggested_fees(request).await?;
        let total_fee_raw = fees.total_fee_raw()?;
        let relayer_gas_raw = parse_units(&fees.relayer_gas_fee.total)?;
        let protocol_raw = total_fee_raw.saturating_sub(relayer_gas_raw);
        let fill_secs = fees.estimated_fill_time_sec.unwrap_or(15).max(1);
        Ok(BridgeQuote {
            protocol: self.info.name.to_string(),
            input_amount: request.amount,
            output_amount: request.amount.saturating_sub(total_fee_raw),
            fees: FeeBreakdown {
                // Relayer gas is paid out of the fee, so it is the gas side
                // of the breakdown; our own deposit gas rides on top.
                protocol_usd: to_usd6(protocol_raw, request.token.decimals),
                gas_usd: to_usd6(relayer_gas_raw, request.token.decimals)
                    .saturating_add(self.gas_estimate_usd(request).await?),
            },
            slippage: None,
            time: TimeEstimate::from_range(fill_secs, fill_secs * 4),
            route_description: format!(
                "Deposit on {}, relayer fills on {}",
                request.source, request.destination
            ),
            expires_at: Some(TimestampMs::now() + QUOTE_TTL),
        })
    }

    async fn estimate_fees(&self, request: &BridgeRequest) -> Result<FeeBreakdown, BridgeError> {
        let fees = self.suggested_fees(request).await?;
        let relayer_gas_raw = parse_units(&fees.relayer_gas_fee.total)?;
        let lp_raw = parse_units(&fees.lp_fee.total)?;
        Ok(FeeBreakdown {
            protocol_usd: to_usd6(lp_raw, request.token.decimals),
            gas_usd: to_usd6(relayer_gas_raw, request.token.decimals),
        })
    }

    async fn initiate(&self, request: &BridgeRequest) -> Result<InitResult, BridgeError> {
        let source = self.client(request.source)?;
        let input_token = request.token.address_on(request.source).ok_or_else(|| {
            BridgeError::ProtocolUnavailable("across: input token missing".into())
        })?;
        let output_token = request.token.address_on(request.destination).ok_or_else(|| {
            BridgeError::ProtocolUnavailable("across: output token missing".into())
        })?;
        // Quotes age quickly; always price the deposit off a fresh one.
        let fees = self.suggested_fees(request).await?;
        let spoke_pool = Address::from_str(&fees.spoke_pool_address).map_err(|e| {
            BridgeError::Completion(format!(
                "relayer returned malformed spoke pool {:?}: {e}",
                fees.spoke_pool_address
            ))
        })?;
        let total_fee_raw = fees.total_fee_raw()?;
        let output_amount = request.amount.saturating_sub(total_fee_raw);
        let quote_timestamp: u32 = fees.timestamp.parse().map_err(|_| {
            BridgeError::QuoteExpired(format!("bad quote timestamp {:?}", fees.timestamp))
        })?;
        let fill_deadline: u32 = match &fees.fill_deadline {
            Some(deadline) => deadline.parse().map_err(|_| {
                BridgeError::QuoteExpired(format!("bad fill deadline {deadline:?}"))
            })?,
            // Generous default: four hours from the quote.
            None => quote_timestamp.saturating_add(4 * 3_600),
        };
        let exclusive_relayer = fees
            .exclusive_relayer
            .as_deref()
            .and_then(|s| Address::from_str(s).ok())
            .unwrap_or(Address::ZERO);
        let sender = self.signer.address();

        let erc20 = IERC20::new(input_token, source.provider());
        let allowance = erc20
            .allowance(sender, spoke_pool)
            .call()
            .await
            .map_err(|e| BridgeError::Completion(format!("allowance query failed: {e}")))?;
        if allowance < request.amount {
            tracing::info!(token = %request.token.symbol, %spoke_pool, "approving spoke pool");
            let calldata = IERC20::approveCall {
                spender: spoke_pool,
                amount: request.amount,
            }
            .abi_encode();
            let approval = source
                .submit(
                    &self.signer,
                    &self.nonces,
                    input_token,
                    U256::ZERO,
                    calldata.into(),
                    self.config.gas_speed,
                )
                .await?;
            source.confirm(&self.nonces, &approval).await?;
        }

        let calldata = IV3SpokePool::depositV3Call {
            depositor: sender,
            recipient: request.recipient,
            inputToken: input_token,
            outputToken: output_token,
            inputAmount: request.amount,
            outputAmount: output_amount,
            destinationChainId: U256::from(request.destination.chain_id()),
            exclusiveRelayer: exclusive_relayer,
            quoteTimestamp: quote_timestamp,
            fillDeadline: fill_deadline,
            exclusivityDeadline: fees.exclusivity_deadline.unwrap_or(0),
            message: Bytes::new(),
        }
        .abi_encode();
        let deposit = source
            .submit(
                &self.signer,
                &self.nonces,
                spoke_pool,
                U256::ZERO,
                calldata.into(),
                self.config.gas_speed,
            )
            .await?;
        let receipt = source.confirm(&self.nonces, &deposit).await?;

        let deposit_id = receipt
            .inner
            .logs()
            .iter()
            .filter(|log| {
                log.topic0() == Some(&IV3SpokePool::V3FundsDeposited::SIGNATURE_HASH)
            })
            .find_map(|log| {
                log.log_decode::<IV3SpokePool::V3FundsDeposited>()
                    .ok()
                    .map(|decoded| decoded.inner.data.depositId)
            });
        let identifier = deposit_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| deposit.hash.to_string());
        self.deposits.lock().expect("deposits lock poisoned").insert(
            identifier.clone(),
            DepositOrigin {
                chain_id: request.source.chain_id(),
            },
        );
        tracing::info!(%identifier, tx = %deposit.hash, "deposit confirmed");
        Ok(InitResult {
            identifier,
            source_tx: deposit.hash,
            message_bytes: None,
            nonce: deposit_id.map(u64::from),
        })
    }

    async fn status(&self, identifier: &str) -> Result<AdapterStatus, BridgeError> {
        let origin = {
            let deposits = self.deposits.lock().expect("deposits lock poisoned");
            deposits.get(identifier).copied()
        };
        let Some(origin) = origin else {
            return Ok(AdapterStatus::Pending);
        };
        let url = format!(
            "{}/deposit/status?originChainId={}&depositId={identifier}",
            self.config.api_base(),
            origin.chain_id,
        );
        let status: DepositStatus = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match status.status.to_lowercase().as_str() {
            "filled" => AdapterStatus::Completed,
            "expired" => AdapterStatus::Expired,
            _ => AdapterStatus::Pending,
        })
    }

    async fn wait_for_attestation(
        &self,
        _identifier: &str,
        _cancel: &CancellationToken,
    ) -> Result<Attestation, BridgeError> {
        Err(BridgeError::AttestationUnsupported)
    }

    async fn complete(
        &self,
        _request: &BridgeRequest,
        _attestation: &Attestation,
    ) -> Result<Option<TxHash>, BridgeError> {
        // The relayer fills the destination side; nothing for the wallet to do.
        Ok(None)
    }

    fn reliability_score(&self) -> u8 {
        88
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_base_by_environment() {
        assert_eq!(AcrossConfig::default().api_base(), MAINNET_API_BASE);
        let config = AcrossConfig {
            environment: BridgeEnvironment::Testnet,
            ..Default::default()
        };
        assert_eq!(config.api_base(), TESTNET_API_BASE);
    }

    #[test]
    fn test_suggested_fees_deserialization() {
        let json = r#"{
            "totalRelayFee": { "pct": "260100000000000", "total": "260100" },
            "relayerCapitalFee": { "pct": "30000000000000", "total": "30000" },
            "relayerGasFee": { "pct": "200100000000000", "total": "200100" },
            "lpFee": { "pct": "30000000000000", "total": "30000" },
            "timestamp": "1718816291",
            "isAmountTooLow": false,
            "quoteBlock": "20125999",
            "spokePoolAddress": "0x5c7BCd6E7De5423a257D81B442095A1a6ced35C5",
            "exclusiveRelayer": "0x0000000000000000000000000000000000000000",
            "exclusivityDeadline": 0,
            "fillDeadline": "1718837891",
            "estimatedFillTimeSec": 4
        }"#;
        let fees: SuggestedFees = serde_json::from_str(json).unwrap();
        assert_eq!(fees.total_fee_raw().unwrap(), U256::from(260_100u64));
        assert_eq!(fees.estimated_fill_time_sec, Some(4));
        assert!(!fees.is_amount_too_low);
        assert_eq!(fees.timestamp, "1718816291");
    }

    #[test]
    fn test_parse_units_rejects_garbage() {
        assert!(parse_units("12345").is_ok());
        assert!(parse_units("0x12").is_err());
        assert!(parse_units("-5").is_err());
    }

    #[test]
    fn test_fill_time_estimate() {
        let estimate = TimeEstimate::from_range(4, 16);
        assert_eq!(estimate.display, "4-16 s");
    }
}
