//! Cross-chain bridge orchestration.
//!
//! The router composes three parts: the [`ProtocolRegistry`] of adapters,
//! the scoring-based route selector ([`routing`]), and the unified two-phase
//! state machine tracked per transfer in the [`TrackingRegistry`].
//!
//! ```text
//!   pending_burn -> burn_confirmed -> attestation_pending
//!        -> attestation_ready -> pending_mint -> completed
//!   (failed reachable from any non-terminal state)
//! ```

pub mod across;
pub mod cctp;
pub mod protocol;
pub mod routing;
pub mod tracking;
pub mod validate;

use alloy_primitives::TxHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainError;
use crate::networks::Network;
use crate::timestamp::TimestampMs;
use crate::units::Usd6;
pub use protocol::{
    AdapterStatus, Attestation, AvailabilityCache, BridgeEnvironment, BridgeProtocol,
    BridgeQuote, BridgeRequest, BridgeSpeedClass, FeeBreakdown, FinalityModel, InitResult,
    NativeUsdQuote, ProtocolInfo, ProtocolRegistry, SlippageEstimate, TimeEstimate,
};
pub use routing::{RoutePreferences, RoutePriority, RouteSelection, ScoredRoute, select_route};
pub use tracking::{
    BridgeMetadata, TrackingComponents, TrackingId, TrackingRegistry, create_tracking_id,
    parse_tracking_id,
};
pub use validate::{BridgeValidator, ValidationOutcome, parse_recipient};

/// Poll cadence while waiting for an intent fill.
const FILL_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long the router waits for an intent fill before failing the transfer.
const FILL_TIMEOUT: Duration = Duration::from_secs(1_800);

/// Position of a transfer in the unified bridge state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    PendingBurn,
    BurnConfirmed,
    AttestationPending,
    AttestationReady,
    PendingMint,
    Completed,
    Failed,
}

impl BridgeStatus {
    /// Coarse progress percentage for display.
    pub fn progress(&self) -> u8 {
        match self {
            BridgeStatus::PendingBurn => 0,
            BridgeStatus::BurnConfirmed => 20,
            BridgeStatus::AttestationPending => 40,
            BridgeStatus::AttestationReady => 60,
            BridgeStatus::PendingMint => 80,
            BridgeStatus::Completed => 100,
            BridgeStatus::Failed => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeStatus::Completed | BridgeStatus::Failed)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            BridgeStatus::PendingBurn => Some(0),
            BridgeStatus::BurnConfirmed => Some(1),
            BridgeStatus::AttestationPending => Some(2),
            BridgeStatus::AttestationReady => Some(3),
            BridgeStatus::PendingMint => Some(4),
            BridgeStatus::Completed => Some(5),
            BridgeStatus::Failed => None,
        }
    }

    /// State only advances; `completed` and `failed` are sinks. Forward
    /// jumps are allowed (intent protocols skip the attestation states).
    pub fn can_transition_to(&self, next: BridgeStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == BridgeStatus::Failed {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl Display for BridgeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BridgeStatus::PendingBurn => "pending_burn",
            BridgeStatus::BurnConfirmed => "burn_confirmed",
            BridgeStatus::AttestationPending => "attestation_pending",
            BridgeStatus::AttestationReady => "attestation_ready",
            BridgeStatus::PendingMint => "pending_mint",
            BridgeStatus::Completed => "completed",
            BridgeStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("source and destination are the same chain ({0})")]
    SameChain(Network),
    #[error(
        "no protocol supports {token} from {source_chain} to {destination}; supported chains: {supported}"
    )]
    UnsupportedRoute {
        source_chain: Network,
        destination: Network,
        token: String,
        supported: String,
    },
    #[error("destination {destination} is not in the allowed set [{allowed}]")]
    DestinationNotAllowed {
        destination: Network,
        allowed: String,
    },
    #[error("no route available for the request")]
    NoRoute,
    #[error("all candidate routes failed: {0}")]
    AllRoutesFailed(String),
    #[error("protocol {0} is currently unavailable")]
    ProtocolUnavailable(String),
    #[error("quote expired: {0}")]
    QuoteExpired(String),
    #[error("slippage {expected_bps} bps exceeds the configured maximum {max_bps} bps")]
    SlippageExceeded { expected_bps: u32, max_bps: u32 },
    #[error("attestation for {identifier} not ready after {waited:?}")]
    AttestationTimeout {
        identifier: String,
        waited: Duration,
    },
    #[error("protocol does not use attestations")]
    AttestationUnsupported,
    #[error("destination-side completion failed: {0}")]
    Completion(String),
    #[error("transfer of {amount} is below the {minimum} economic minimum")]
    AmountTooSmall { amount: Usd6, minimum: Usd6 },
    #[error("gas ({gas}) would consume half or more of the transfer amount ({amount})")]
    GasDisproportionate { gas: Usd6, amount: Usd6 },
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("unknown tracking id {0}")]
    UnknownTracking(String),
    #[error("invalid bridge state transition {from} -> {to}")]
    InvalidTransition {
        from: BridgeStatus,
        to: BridgeStatus,
    },
    #[error("http error{}: {message}", status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("bridge operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BridgeError {
    fn from(error: reqwest::Error) -> Self {
        let status = error.status().map(|s| s.as_u16());
        let retryable =
            error.is_timeout() || error.is_connect() || status.is_some_and(|s| s >= 500);
        BridgeError::Http {
            status,
            message: error.to_string(),
            retryable,
        }
    }
}

/// Caller-facing view of a transfer's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatusView {
    pub tracking_id: String,
    pub status: BridgeStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A transfer whose source-chain phase has completed.
#[derive(Debug, Clone)]
pub struct StartedBridge {
    pub tracking_id: TrackingId,
    pub init: InitResult,
    pub protocol: String,
    /// Expected destination amount from the chosen quote.
    pub output_amount: alloy_primitives::U256,
}

/// Outcome of a completed (or handed-off) bridge execution.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub tracking_id: TrackingId,
    pub protocol: String,
    pub source_tx: TxHash,
    pub destination_tx: Option<TxHash>,
    pub output_amount: alloy_primitives::U256,
}

/// The bridge router: discovers routes, validates, drives the two-phase
/// transfer, and reconciles status.
///
/// A transfer runs in two explicit halves, [`initiate_with`](Self::initiate_with)
/// and [`finish`](Self::finish); the caller sits between them to commit
/// spending accounting the moment the source chain accepts the burn.
pub struct BridgeRouter {
    registry: ProtocolRegistry,
    tracking: Arc<TrackingRegistry>,
    validator: BridgeValidator,
}

impl std::fmt::Debug for BridgeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl BridgeRouter {
    pub fn new(
        registry: ProtocolRegistry,
        tracking: Arc<TrackingRegistry>,
        validator: BridgeValidator,
    ) -> Self {
        Self {
            registry,
            tracking,
            validator,
        }
    }

    pub fn tracking(&self) -> &Arc<TrackingRegistry> {
        &self.tracking
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Union of chains any registered adapter can reach.
    fn supported_chains(&self) -> Vec<Network> {
        let mut chains: Vec<Network> = self
            .registry
            .iter()
            .flat_map(|a| a.supported_chains().iter().copied())
            .collect();
        chains.sort_by_key(Network::chain_id);
        chains.dedup();
        chains
    }

    /// Collect quotes from every available adapter that supports the route.
    pub async fn quotes(&self, request: &BridgeRequest) -> Result<Vec<BridgeQuote>, BridgeError> {
        let mut quotes = Vec::new();
        let mut failures = Vec::new();
        let mut any_supported = false;
        for adapter in self.registry.iter() {
            let info = adapter.info();
            if !adapter.is_route_supported(request.source, request.destination, &request.token) {
                continue;
            }
            any_supported = true;
            if !adapter.is_available().await {
                tracing::warn!(protocol = info.name, "adapter unavailable, skipping");
                failures.push(format!("{}: unavailable", info.name));
                continue;
            }
            match adapter.quote(request).await {
                Ok(quote) => quotes.push(quote),
                Err(error) => {
                    tracing::warn!(protocol = info.name, %error, "quote failed");
                    failures.push(format!("{}: {error}", info.name));
                }
            }
        }
        if !any_supported {
            return Err(BridgeError::UnsupportedRoute {
                source_chain: request.source,
                destination: request.destination,
                token: request.token.symbol.clone(),
                supported: self
                    .supported_chains()
                    .iter()
                    .map(|n| n.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        if quotes.is_empty() {
            return Err(BridgeError::AllRoutesFailed(failures.join("; ")));
        }
        Ok(quotes)
    }

    /// Quote, filter, and rank routes for a request.
    pub async fn select(
        &self,
        request: &BridgeRequest,
        preferences: &RoutePreferences,
    ) -> Result<RouteSelection, BridgeError> {
        let quotes = self.quotes(request).await?;
        let selection = select_route(quotes, preferences, &|name| {
            self.registry.reliability_of(name)
        });
        if selection.recommended.is_none() {
            return Err(BridgeError::NoRoute);
        }
        Ok(selection)
    }

    /// Validate a request against a (possibly absent) quote without
    /// touching any chain.
    pub fn validate(
        &self,
        request: &BridgeRequest,
        allowed_destinations: Option<&BTreeSet<u64>>,
        quote: Option<&BridgeQuote>,
    ) -> Result<ValidationOutcome, BridgeError> {
        let route_supported = self.registry.iter().any(|a| {
            a.is_route_supported(request.source, request.destination, &request.token)
        });
        self.validator.validate(
            request,
            route_supported,
            &self.supported_chains(),
            allowed_destinations,
            quote,
        )
    }

    /// Run the source-chain phase with a specific protocol: initiate, mint
    /// the tracking id, stash metadata, and mark the burn confirmed.
    ///
    /// The caller commits accounting between this and
    /// [`finish`](Self::finish), once the source chain has accepted the
    /// transfer.
    pub async fn initiate_with(
        &self,
        protocol: &str,
        request: &BridgeRequest,
        expected_output: alloy_primitives::U256,
    ) -> Result<StartedBridge, BridgeError> {
        let adapter = self
            .registry
            .get(protocol)
            .ok_or_else(|| BridgeError::ProtocolUnavailable(protocol.to_string()))?;
        let info = adapter.info().clone();

        let init = adapter.initiate(request).await?;
        let tracking_id = self.tracking.create(
            info.name,
            request.source.chain_id(),
            request.destination.chain_id(),
            &init.identifier,
        );
        self.tracking.store_metadata(
            &tracking_id,
            BridgeMetadata {
                protocol_name: info.name.to_string(),
                message_bytes: init.message_bytes.clone(),
                nonce: init.nonce,
                source_domain: cctp::domain_for(request.source),
                destination_domain: cctp::domain_for(request.destination),
                destination_chain_id: request.destination.chain_id(),
                amount_raw: request.amount,
                recipient: request.recipient,
                created_at: TimestampMs::now(),
            },
        );
        // `initiate` returns after the source receipt, so the burn is
        // already confirmed.
        self.tracking.advance(&tracking_id, BridgeStatus::BurnConfirmed)?;
        Ok(StartedBridge {
            tracking_id,
            init,
            protocol: info.name.to_string(),
            output_amount: expected_output,
        })
    }

    /// Drive a started transfer to completion: attestation wait plus mint
    /// for attestation protocols, fill polling for intent protocols.
    pub async fn finish(
        &self,
        request: &BridgeRequest,
        started: &StartedBridge,
        cancel: &CancellationToken,
    ) -> Result<BridgeOutcome, BridgeError> {
        let adapter = self
            .registry
            .get(&started.protocol)
            .ok_or_else(|| BridgeError::ProtocolUnavailable(started.protocol.clone()))?;
        let destination_tx = match adapter.info().finality_model {
            FinalityModel::Attestation => {
                self.run_attestation_phase(
                    adapter.as_ref(),
                    request,
                    &started.tracking_id,
                    &started.init,
                    cancel,
                )
                .await?
            }
            FinalityModel::Optimistic | FinalityModel::LockAndMint => {
                self.await_fill(adapter.as_ref(), &started.tracking_id, &started.init, cancel)
                    .await?
            }
        };

        self.tracking
            .advance(&started.tracking_id, BridgeStatus::Completed)?;
        tracing::info!(tracking = %started.tracking_id, "bridge transfer completed");
        Ok(BridgeOutcome {
            tracking_id: started.tracking_id.clone(),
            protocol: started.protocol.clone(),
            source_tx: started.init.source_tx,
            destination_tx,
            output_amount: started.output_amount,
        })
    }

    /// Attestation-model second phase: wait for the attestation, then mint
    /// on the destination chain.
    async fn run_attestation_phase(
        &self,
        adapter: &dyn BridgeProtocol,
        request: &BridgeRequest,
        tracking_id: &TrackingId,
        init: &InitResult,
        cancel: &CancellationToken,
    ) -> Result<Option<TxHash>, BridgeError> {
        self.tracking
            .advance(tracking_id, BridgeStatus::AttestationPending)?;
        let attestation = match adapter.wait_for_attestation(&init.identifier, cancel).await {
            Ok(attestation) => attestation,
            Err(BridgeError::Cancelled) => {
                // The burn may already be final; keep the tracking entry as
                // it stands so the transfer can be resumed or inspected.
                return Err(BridgeError::Cancelled);
            }
            Err(error) => {
                self.tracking.fail(tracking_id, error.to_string());
                return Err(error);
            }
        };
        self.tracking
            .advance(tracking_id, BridgeStatus::AttestationReady)?;
        self.tracking.advance(tracking_id, BridgeStatus::PendingMint)?;
        match adapter.complete(request, &attestation).await {
            Ok(tx) => Ok(tx),
            Err(error) => {
                self.tracking.fail(tracking_id, error.to_string());
                Err(BridgeError::Completion(error.to_string()))
            }
        }
    }

    /// Intent-model second phase: poll the adapter until the relayer fills
    /// or the deposit expires. No destination action from the wallet.
    async fn await_fill(
        &self,
        adapter: &dyn BridgeProtocol,
        tracking_id: &TrackingId,
        init: &InitResult,
        cancel: &CancellationToken,
    ) -> Result<Option<TxHash>, BridgeError> {
        let deadline = tokio::time::Instant::now() + FILL_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            match adapter.status(&init.identifier).await {
                Ok(AdapterStatus::Completed) => return Ok(None),
                Ok(AdapterStatus::Expired) => {
                    self.tracking.fail(tracking_id, "deposit expired unfilled");
                    return Err(BridgeError::Completion("deposit expired unfilled".into()));
                }
                Ok(AdapterStatus::Failed(detail)) => {
                    self.tracking.fail(tracking_id, detail.clone());
                    return Err(BridgeError::Completion(detail));
                }
                Ok(_) => {}
                Err(error) if matches!(&error, BridgeError::Http { retryable: true, .. }) => {
                    tracing::debug!(%error, "fill status poll failed, retrying");
                }
                Err(error) => {
                    self.tracking.fail(tracking_id, error.to_string());
                    return Err(error);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                self.tracking.fail(tracking_id, "fill wait timed out");
                return Err(BridgeError::Completion("fill wait timed out".into()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(FILL_POLL_INTERVAL) => {}
            }
        }
    }

    /// Status view for any tracking id, including legacy and unknown ones.
    ///
    /// Unknown ids come back as the stale-unknown view: attestation pending
    /// at 40 percent with a "metadata not found" note.
    pub fn status(&self, id: &str) -> BridgeStatusView {
        match self.tracking.status(id) {
            Some((status, note)) => BridgeStatusView {
                tracking_id: id.to_string(),
                status,
                progress: status.progress(),
                message: note,
            },
            None => BridgeStatusView {
                tracking_id: id.to_string(),
                status: BridgeStatus::AttestationPending,
                progress: BridgeStatus::AttestationPending.progress(),
                message: Some("metadata not found".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_values() {
        assert_eq!(BridgeStatus::PendingBurn.progress(), 0);
        assert_eq!(BridgeStatus::BurnConfirmed.progress(), 20);
        assert_eq!(BridgeStatus::AttestationPending.progress(), 40);
        assert_eq!(BridgeStatus::AttestationReady.progress(), 60);
        assert_eq!(BridgeStatus::PendingMint.progress(), 80);
        assert_eq!(BridgeStatus::Completed.progress(), 100);
        assert_eq!(BridgeStatus::Failed.progress(), 0);
    }

    #[test]
    fn test_transitions_only_advance() {
        use BridgeStatus::*;
        assert!(PendingBurn.can_transition_to(BurnConfirmed));
        assert!(PendingBurn.can_transition_to(Completed));
        assert!(BurnConfirmed.can_transition_to(AttestationPending));
        assert!(!AttestationPending.can_transition_to(BurnConfirmed));
        assert!(!AttestationPending.can_transition_to(AttestationPending));
        assert!(AttestationPending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(PendingBurn));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_stale_unknown_status_view() {
        let router = BridgeRouter::new(
            ProtocolRegistry::new(),
            Arc::new(TrackingRegistry::new()),
            BridgeValidator::default(),
        );
        let view = router.status("bridge_cctp_1_0xdeadbeef");
        assert_eq!(view.status, BridgeStatus::AttestationPending);
        assert_eq!(view.progress, 40);
        assert_eq!(view.message.as_deref(), Some("metadata not found"));
    }
}
