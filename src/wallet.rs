//! The wallet facade.
//!
//! Composes the signer, chain clients, nonce coordinator, limits engine,
//! approval arbiter, and bridge router behind preview/execute/status
//! operations. A send runs: limits check, approval gate, nonce allocation,
//! gas estimate, sign, submit, receipt, accounting commit. The accounting
//! commit lands as soon as the RPC accepts the transaction, before
//! confirmation, so a second spend cannot slip under a limit while the
//! first is in flight.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, TxHash, U256};
use alloy_rpc_types_eth::TransactionRequest;
use alloy_sol_types::SolCall;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::abi::IERC20;
use crate::approval::{
    ApprovalArbiter, ApprovalAuditRecord, ApprovalHandler, ApprovalRequest, GateVerdict,
};
use crate::bridge::{
    BridgeEnvironment, BridgeOutcome, BridgeRequest, BridgeRouter, BridgeStatusView,
    BridgeValidator, NativeUsdQuote, ProtocolRegistry, RoutePreferences, RouteSelection,
    TrackingRegistry, across::AcrossAdapter, across::AcrossConfig, cctp::CctpAdapter,
    cctp::CctpConfig, parse_recipient, protocol::wei_to_usd6,
};
use crate::chain::{ChainClient, ChainError, GasSpeed, NonceCoordinator};
use crate::config::{EvmPrivateKey, WalletConfig};
use crate::error::WalletError;
use crate::limits::{LimitsEngine, SpendKind, SpendingRecord};
use crate::networks::{Network, TokenDescriptor, TokenRegistry};
use crate::policy::AddressPolicy;
use crate::signer::AgentSigner;
use crate::timestamp::TimestampMs;
use crate::units::{Usd6, parse_amount, to_usd6};

/// Gas budgets used for USD gas estimates in policy checks.
const TRANSFER_GAS: u64 = 65_000;
const NATIVE_TRANSFER_GAS: u64 = 21_000;
const NATIVE_DECIMALS: u8 = 18;

/// Result of an executed send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub tx_hash: TxHash,
    pub chain_id: u64,
    pub token_symbol: String,
    pub amount_raw: U256,
    pub amount_usd: Usd6,
    pub recipient: Address,
    pub gas_used: Option<u64>,
}

/// Dry-run view of a send: what it would cost and whether a human would be
/// asked.
#[derive(Debug, Clone)]
pub struct SendPreview {
    pub amount_raw: U256,
    pub amount_usd: Usd6,
    pub gas_limit: u64,
    pub gas_usd: Usd6,
    pub verdict: GateVerdict,
    pub warnings: Vec<String>,
}

/// Dry-run view of a bridge: scored routes plus validation warnings.
#[derive(Debug, Clone)]
pub struct BridgePreview {
    pub amount_raw: U256,
    pub amount_usd: Usd6,
    pub selection: RouteSelection,
    pub warnings: Vec<String>,
}

/// The autonomous agent wallet.
///
/// One instance owns one signer, one chain client per configured chain, one
/// nonce coordinator, one limits engine, one approval arbiter, and one
/// bridge router. All of them live for the wallet's lifetime; none of them
/// are global.
pub struct Wallet {
    signer: Arc<AgentSigner>,
    clients: HashMap<u64, Arc<ChainClient>>,
    nonces: Arc<NonceCoordinator>,
    tokens: TokenRegistry,
    limits: Arc<LimitsEngine>,
    policy: Arc<AddressPolicy>,
    arbiter: Arc<ApprovalArbiter>,
    router: BridgeRouter,
    eth_usd: Option<Arc<dyn NativeUsdQuote>>,
    gas_speed: GasSpeed,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.signer.address())
            .field("chains", &self.clients.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Build a wallet without external hooks.
    pub fn new(config: WalletConfig, key: EvmPrivateKey) -> Result<Self, WalletError> {
        Self::with_hooks(config, key, None, None)
    }

    /// Build a wallet with an approval handler and an ETH/USD quote hook.
    pub fn with_hooks(
        config: WalletConfig,
        key: EvmPrivateKey,
        approval_handler: Option<Arc<dyn ApprovalHandler>>,
        eth_usd: Option<Arc<dyn NativeUsdQuote>>,
    ) -> Result<Self, WalletError> {
        let signer = Arc::new(AgentSigner::from_b256(key.as_b256())?);
        let tokens = TokenRegistry::builtin()?;

        let mut clients = HashMap::with_capacity(config.chains.len());
        for endpoint in &config.chains {
            let network = Network::from_chain_id(endpoint.chain_id)
                .ok_or(WalletError::UnsupportedChain(endpoint.chain_id))?;
            clients.insert(
                endpoint.chain_id,
                Arc::new(ChainClient::new(network, endpoint)),
            );
        }
        if clients.is_empty() {
            return Err(WalletError::UnsupportedChain(0));
        }

        let policy = Arc::new(AddressPolicy::new());
        for entry in &config.trusted {
            policy.trust(entry.address, entry.label.clone())?;
        }
        for entry in &config.blocked {
            policy.block(entry.address, entry.reason.clone())?;
        }

        let arbiter = Arc::new(ApprovalArbiter::new(
            config.approval.clone(),
            Arc::clone(&policy),
            approval_handler,
        ));
        let limits = Arc::new(LimitsEngine::new(config.limits.clone()));
        let nonces = Arc::new(NonceCoordinator::new());

        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(CctpAdapter::new(
            CctpConfig {
                environment: config.bridge_environment,
                gas_speed: config.gas_speed,
                ..Default::default()
            },
            clients.clone(),
            Arc::clone(&signer),
            Arc::clone(&nonces),
            eth_usd.clone(),
        )));
        registry.register(Arc::new(AcrossAdapter::new(
            AcrossConfig {
                environment: config.bridge_environment,
                gas_speed: config.gas_speed,
                ..Default::default()
            },
            clients.clone(),
            Arc::clone(&signer),
            Arc::clone(&nonces),
            eth_usd.clone(),
        )));
        let router = BridgeRouter::new(
            registry,
            Arc::new(TrackingRegistry::new()),
            BridgeValidator::default(),
        );

        Ok(Self {
            signer,
            clients,
            nonces,
            tokens,
            limits,
            policy,
            arbiter,
            router,
            eth_usd,
            gas_speed: config.gas_speed,
            cancel: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    /// Token to cancel in-flight operations (approval waits, attestation
    /// polls). Cancelled operations surface as `Cancelled` without mutating
    /// chain state.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn client(&self, chain_id: u64) -> Result<&Arc<ChainClient>, WalletError> {
        self.clients
            .get(&chain_id)
            .ok_or(WalletError::UnsupportedChain(chain_id))
    }

    fn resolve_token(
        &self,
        network: Network,
        symbol: &str,
    ) -> Result<(Arc<TokenDescriptor>, Address), WalletError> {
        self.tokens
            .resolve(symbol, network)
            .ok_or_else(|| WalletError::UnsupportedToken {
                symbol: symbol.to_string(),
                chain: network.name().to_string(),
            })
    }

    /// Price a gas budget in USD through the external quote, zero without
    /// one.
    async fn gas_usd(&self, client: &ChainClient, gas_units: u64) -> Result<Usd6, WalletError> {
        let Some(oracle) = &self.eth_usd else {
            return Ok(Usd6::ZERO);
        };
        let Some(eth_usd) = oracle.quote_eth_usd().await else {
            return Ok(Usd6::ZERO);
        };
        let fees = client.gas_fees(self.gas_speed).await?;
        Ok(wei_to_usd6(
            u128::from(gas_units) * fees.price_ceiling(),
            eth_usd,
        ))
    }

    /// Engage (and surface) the emergency stop when the native balance sits
    /// below the configured floor. Runs before every execution.
    async fn enforce_emergency_stop(&self, client: &ChainClient) -> Result<(), WalletError> {
        let balance = client.balance(self.signer.address()).await?;
        if self.limits.check_native_balance(balance) {
            return Err(crate::limits::LimitsError::EmergencyStopEngaged.into());
        }
        Ok(())
    }

    fn parse_recipient_logged(&self, input: &str) -> Result<Address, WalletError> {
        let (address, warning) =
            parse_recipient(input).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;
        if let Some(warning) = warning {
            tracing::warn!(%warning, "recipient checksum warning");
        }
        Ok(address)
    }

    /// Preview an ERC-20 send without signing anything.
    pub async fn preview_send(
        &self,
        chain_id: u64,
        symbol: &str,
        amount: &str,
        recipient: &str,
    ) -> Result<SendPreview, WalletError> {
        let client = self.client(chain_id)?;
        let (token, token_address) = self.resolve_token(client.network(), symbol)?;
        let amount_raw = parse_amount(amount, token.decimals)?;
        let (recipient_address, checksum_warning) =
            parse_recipient(recipient).map_err(|e| WalletError::InvalidAddress(e.to_string()))?;

        let calldata = IERC20::transferCall {
            to: recipient_address,
            amount: amount_raw,
        }
        .abi_encode();
        let request = TransactionRequest::default()
            .with_from(self.signer.address())
            .with_to(token_address)
            .with_input(calldata);
        let estimate = client.estimate_gas(&request).await?;
        let gas_limit = client.oracle().pad_gas_limit(estimate);
        let gas_usd = self.gas_usd(client, gas_limit).await?;

        let amount_usd = to_usd6(amount_raw, token.decimals);
        let verdict = self.arbiter.evaluate(recipient_address, amount_usd);
        let mut warnings = Vec::new();
        if let Some(warning) = checksum_warning {
            warnings.push(warning);
        }
        if let Err(error) = self.limits.check(amount_raw, &token, gas_usd, SpendKind::Send) {
            warnings.push(format!("{error} ({})", error.remediation()));
        }
        Ok(SendPreview {
            amount_raw,
            amount_usd,
            gas_limit,
            gas_usd,
            verdict,
            warnings,
        })
    }

    /// Send an ERC-20 token under the full safety envelope.
    pub async fn send_token(
        &self,
        chain_id: u64,
        symbol: &str,
        amount: &str,
        recipient: &str,
    ) -> Result<SendOutcome, WalletError> {
        let client = self.client(chain_id)?;
        let (token, token_address) = self.resolve_token(client.network(), symbol)?;
        let amount_raw = parse_amount(amount, token.decimals)?;
        let recipient_address = self.parse_recipient_logged(recipient)?;

        self.enforce_emergency_stop(client).await?;
        let gas_usd = self.gas_usd(client, TRANSFER_GAS).await?;
        let amount_usd = self
            .limits
            .check(amount_raw, &token, gas_usd, SpendKind::Send)?;

        let details = HashMap::from([
            ("chain".to_string(), json!(client.network().name())),
            ("token".to_string(), json!(token.symbol)),
            ("amount".to_string(), json!(amount)),
        ]);
        self.arbiter
            .gate(
                format!("send {amount} {} to {recipient_address}", token.symbol),
                details,
                amount_usd,
                recipient_address,
                &self.cancel,
            )
            .await?;

        let calldata = IERC20::transferCall {
            to: recipient_address,
            amount: amount_raw,
        }
        .abi_encode();
        let submitted = client
            .submit(
                &self.signer,
                &self.nonces,
                token_address,
                U256::ZERO,
                calldata.into(),
                self.gas_speed,
            )
            .await?;

        // Accepted by the RPC: commit accounting before confirmation.
        self.limits.record(amount_raw, &token, SpendKind::Send);
        self.arbiter.note_successful_send(recipient_address);

        let receipt = client.confirm(&self.nonces, &submitted).await?;
        Ok(SendOutcome {
            tx_hash: submitted.hash,
            chain_id,
            token_symbol: token.symbol.clone(),
            amount_raw,
            amount_usd,
            recipient: recipient_address,
            gas_used: Some(receipt.gas_used),
        })
    }

    /// Send native currency. Its USD value comes from the ETH/USD hook;
    /// without one the transfer counts zero dollars against the limits.
    pub async fn send_native(
        &self,
        chain_id: u64,
        amount: &str,
        recipient: &str,
    ) -> Result<SendOutcome, WalletError> {
        let client = self.client(chain_id)?;
        let amount_raw = parse_amount(amount, NATIVE_DECIMALS)?;
        let recipient_address = self.parse_recipient_logged(recipient)?;

        self.enforce_emergency_stop(client).await?;
        let amount_usd = match &self.eth_usd {
            Some(oracle) => match oracle.quote_eth_usd().await {
                Some(eth_usd) => wei_to_usd6(
                    u128::try_from(amount_raw).unwrap_or(u128::MAX),
                    eth_usd,
                ),
                None => Usd6::ZERO,
            },
            None => Usd6::ZERO,
        };
        let gas_usd = self.gas_usd(client, NATIVE_TRANSFER_GAS).await?;
        self.limits
            .check_usd_at(amount_usd, gas_usd, SpendKind::Send, TimestampMs::now())?;

        let details = HashMap::from([
            ("chain".to_string(), json!(client.network().name())),
            ("amount".to_string(), json!(amount)),
        ]);
        self.arbiter
            .gate(
                format!(
                    "send {amount} {} to {recipient_address}",
                    client.network().native_symbol()
                ),
                details,
                amount_usd,
                recipient_address,
                &self.cancel,
            )
            .await?;

        let submitted = client
            .submit(
                &self.signer,
                &self.nonces,
                recipient_address,
                amount_raw,
                alloy_primitives::Bytes::new(),
                self.gas_speed,
            )
            .await?;

        self.limits.record_usd_at(
            client.network().native_symbol(),
            amount_raw,
            amount_usd,
            SpendKind::Send,
            TimestampMs::now(),
        );
        self.arbiter.note_successful_send(recipient_address);

        let receipt = client.confirm(&self.nonces, &submitted).await?;
        Ok(SendOutcome {
            tx_hash: submitted.hash,
            chain_id,
            token_symbol: client.network().native_symbol().to_string(),
            amount_raw,
            amount_usd,
            recipient: recipient_address,
            gas_used: Some(receipt.gas_used),
        })
    }

    pub async fn native_balance(&self, chain_id: u64) -> Result<U256, WalletError> {
        let client = self.client(chain_id)?;
        Ok(client.balance(self.signer.address()).await?)
    }

    pub async fn token_balance(&self, chain_id: u64, symbol: &str) -> Result<U256, WalletError> {
        let client = self.client(chain_id)?;
        let (_, token_address) = self.resolve_token(client.network(), symbol)?;
        let erc20 = IERC20::new(token_address, client.provider());
        erc20
            .balanceOf(self.signer.address())
            .call()
            .await
            .map_err(|e| {
                WalletError::Chain(ChainError::Rpc {
                    code: None,
                    message: e.to_string(),
                    retryable: false,
                })
            })
    }

    /// The largest amount of `symbol` the current send limits allow, or
    /// `None` when no limit is configured.
    pub fn max_sendable(&self, symbol: &str) -> Result<Option<U256>, WalletError> {
        let token = self
            .tokens
            .get(symbol)
            .ok_or_else(|| WalletError::UnsupportedToken {
                symbol: symbol.to_string(),
                chain: "any".to_string(),
            })?;
        Ok(self.limits.max_sendable(&token))
    }

    fn bridge_request(
        &self,
        source_chain_id: u64,
        destination_chain_id: u64,
        symbol: &str,
        amount: &str,
        recipient: &str,
        fast: bool,
    ) -> Result<BridgeRequest, WalletError> {
        let source = self.client(source_chain_id)?.network();
        let destination = Network::from_chain_id(destination_chain_id)
            .ok_or(WalletError::UnsupportedChain(destination_chain_id))?;
        let (token, _) = self.resolve_token(source, symbol)?;
        let amount_raw = parse_amount(amount, token.decimals)?;
        let recipient_address = self.parse_recipient_logged(recipient)?;
        Ok(BridgeRequest {
            source,
            destination,
            token,
            amount: amount_raw,
            recipient: recipient_address,
            fast,
        })
    }

    fn allowed_destinations(&self) -> Option<&BTreeSet<u64>> {
        self.limits
            .config()
            .bridge
            .as_ref()
            .and_then(|b| b.allowed_destinations.as_ref())
    }

    /// Preview a bridge: validation and scored route selection, no chain
    /// writes.
    pub async fn preview_bridge(
        &self,
        source_chain_id: u64,
        destination_chain_id: u64,
        symbol: &str,
        amount: &str,
        recipient: &str,
        preferences: &RoutePreferences,
    ) -> Result<BridgePreview, WalletError> {
        let request = self.bridge_request(
            source_chain_id,
            destination_chain_id,
            symbol,
            amount,
            recipient,
            false,
        )?;
        self.router
            .validate(&request, self.allowed_destinations(), None)?;
        let selection = self.router.select(&request, preferences).await?;
        let mut warnings = Vec::new();
        if let Some(index) = selection.recommended {
            let outcome = self.router.validate(
                &request,
                self.allowed_destinations(),
                Some(&selection.routes[index].quote),
            )?;
            warnings = outcome.warnings;
        }
        Ok(BridgePreview {
            amount_raw: request.amount,
            amount_usd: to_usd6(request.amount, request.token.decimals),
            selection,
            warnings,
        })
    }

    /// Bridge tokens across chains under the full safety envelope.
    ///
    /// Route discovery, scoring, and validation run before limits and
    /// approval; the source-chain burn runs after; the transfer is tracked
    /// and driven to completion (attestation + mint, or relayer fill).
    pub async fn bridge(
        &self,
        source_chain_id: u64,
        destination_chain_id: u64,
        symbol: &str,
        amount: &str,
        recipient: &str,
        preferences: &RoutePreferences,
    ) -> Result<BridgeOutcome, WalletError> {
        let request = self.bridge_request(
            source_chain_id,
            destination_chain_id,
            symbol,
            amount,
            recipient,
            false,
        )?;
        let client = self.client(source_chain_id)?;

        // Destination allow-list and route sanity come before any chain I/O.
        self.router
            .validate(&request, self.allowed_destinations(), None)?;
        let selection = self.router.select(&request, preferences).await?;
        let index = selection
            .recommended
            .ok_or(WalletError::Bridge(crate::bridge::BridgeError::NoRoute))?;
        let chosen = selection.routes[index].quote.clone();
        tracing::info!(protocol = %chosen.protocol, reason = %selection.reason, "route selected");
        self.router
            .validate(&request, self.allowed_destinations(), Some(&chosen))?;

        self.enforce_emergency_stop(client).await?;
        let amount_usd = self.limits.check(
            request.amount,
            &request.token,
            chosen.fees.gas_usd,
            SpendKind::Bridge,
        )?;

        let details = HashMap::from([
            ("source".to_string(), json!(request.source.name())),
            ("destination".to_string(), json!(request.destination.name())),
            ("token".to_string(), json!(request.token.symbol)),
            ("amount".to_string(), json!(amount)),
            ("protocol".to_string(), json!(chosen.protocol)),
        ]);
        self.arbiter
            .gate(
                format!(
                    "bridge {amount} {} from {} to {}",
                    request.token.symbol, request.source, request.destination
                ),
                details,
                amount_usd,
                request.recipient,
                &self.cancel,
            )
            .await?;

        let started = self
            .router
            .initiate_with(&chosen.protocol, &request, chosen.output_amount)
            .await?;
        // Source chain accepted the burn: commit accounting now.
        self.limits
            .record(request.amount, &request.token, SpendKind::Bridge);

        Ok(self.router.finish(&request, &started, &self.cancel).await?)
    }

    /// Status of a tracked transfer; unknown ids yield the stale-unknown
    /// view.
    pub fn bridge_status(&self, tracking_id: &str) -> BridgeStatusView {
        self.router.status(tracking_id)
    }

    pub fn router(&self) -> &BridgeRouter {
        &self.router
    }

    // Approval passthrough.

    pub fn approve(&self, request_id: &str, decider: &str) -> Result<(), WalletError> {
        Ok(self.arbiter.approve(request_id, decider)?)
    }

    pub fn reject(&self, request_id: &str, decider: &str) -> Result<(), WalletError> {
        Ok(self.arbiter.reject(request_id, decider)?)
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.arbiter.pending_requests()
    }

    pub fn approval_audit(&self) -> Vec<ApprovalAuditRecord> {
        self.arbiter.audit_log()
    }

    // Address policy passthrough.

    pub fn trust_address(&self, address: Address, label: Option<String>) -> Result<(), WalletError> {
        Ok(self.policy.trust(address, label)?)
    }

    pub fn block_address(&self, address: Address, reason: Option<String>) -> Result<(), WalletError> {
        Ok(self.policy.block(address, reason)?)
    }

    // Limits passthrough.

    pub fn is_emergency_stopped(&self) -> bool {
        self.limits.is_stopped()
    }

    /// Operator-gated: clears a previously engaged emergency stop.
    pub fn clear_emergency_stop(&self) {
        self.limits.clear_stop();
    }

    pub fn spending_records(&self) -> Vec<SpendingRecord> {
        self.limits.records()
    }

    pub fn limits(&self) -> &LimitsEngine {
        &self.limits
    }
}
