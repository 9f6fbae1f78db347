//! JSON-RPC chain access.
//!
//! [`ChainClient`] wraps one EVM endpoint behind the standard `eth_*`
//! surface, applies the gas pricing policy, and runs the build-sign-submit
//! pipeline together with the [`NonceCoordinator`]. Idempotent reads retry
//! up to three times with exponential backoff on retryable transport
//! errors; writes are never retried implicitly.

pub mod gas;
pub mod nonce;

use alloy_consensus::{SignableTransaction, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::{Ethereum, TransactionBuilder, TxSignerSync};
use alloy_primitives::{Address, B256, Bytes, TxHash, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{
    Block, BlockNumberOrTag, FeeHistory, Filter, Log, TransactionReceipt, TransactionRequest,
};
use alloy_transport::TransportError;
use alloy_transport_http::Http;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

use crate::networks::Network;
use crate::signer::AgentSigner;
pub use gas::{GasConfig, GasFees, GasOracle, GasSpeed, REWARD_PERCENTILES};
pub use nonce::{NonceCoordinator, PendingNonceSource};

/// Read retries for retryable transport errors.
const READ_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
/// Receipt poll cadence.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("rpc error{}: {message}", code.map(|c| format!(" {c}")).unwrap_or_default())]
    Rpc {
        code: Option<i64>,
        message: String,
        retryable: bool,
    },
    #[error("transaction {0} not mined within {1:?}")]
    ReceiptTimeout(TxHash, Duration),
    #[error("transaction {0} reverted on chain")]
    Reverted(TxHash),
    #[error("failed to build transaction: {0}")]
    Build(String),
    #[error("failed to sign transaction: {0}")]
    Sign(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Rpc { retryable: true, .. })
    }
}

impl From<TransportError> for ChainError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::ErrorResp(payload) => {
                // -32005 is the conventional "limit exceeded" code.
                let retryable = payload.code == -32005 || payload.code == 429;
                ChainError::Rpc {
                    code: Some(payload.code),
                    message: payload.message.to_string(),
                    retryable,
                }
            }
            // Connection-level failures are worth a retry for reads.
            TransportError::Transport(kind) => ChainError::Rpc {
                code: None,
                message: kind.to_string(),
                retryable: true,
            },
            other => ChainError::Rpc {
                code: None,
                message: other.to_string(),
                retryable: false,
            },
        }
    }
}

/// Per-chain endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub rpc_url: Url,
    #[serde(default = "endpoint_defaults::receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "endpoint_defaults::confirmations")]
    pub confirmations: u64,
    #[serde(default)]
    pub gas: GasConfig,
}

mod endpoint_defaults {
    pub fn receipt_timeout_secs() -> u64 {
        30
    }

    pub fn confirmations() -> u64 {
        1
    }
}

/// A transaction accepted by the RPC but not yet confirmed.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub hash: TxHash,
    pub sender: Address,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fees: GasFees,
}

/// One JSON-RPC endpoint plus the pricing and submission policy for its
/// chain.
#[derive(Debug)]
pub struct ChainClient {
    network: Network,
    provider: RootProvider<Ethereum>,
    oracle: GasOracle,
    receipt_timeout: Duration,
    confirmations: u64,
    /// Whether the chain prices blocks with a base fee; probed once.
    eip1559: OnceCell<bool>,
}

impl ChainClient {
    pub fn new(network: Network, endpoint: &ChainEndpoint) -> Self {
        let transport = Http::new(endpoint.rpc_url.clone());
        let client = RpcClient::new(transport, false);
        Self {
            network,
            provider: RootProvider::new(client),
            oracle: GasOracle::new(endpoint.gas.clone()),
            receipt_timeout: Duration::from_secs(endpoint.receipt_timeout_secs),
            confirmations: endpoint.confirmations,
            eip1559: OnceCell::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn chain_id(&self) -> u64 {
        self.network.chain_id()
    }

    pub fn oracle(&self) -> &GasOracle {
        &self.oracle
    }

    pub fn provider(&self) -> &RootProvider<Ethereum> {
        &self.provider
    }

    /// Retry an idempotent read up to [`READ_RETRIES`] times with
    /// exponential backoff.
    async fn read<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, ChainError>
    where
        F: Fn() -> Fut,
        Fut: IntoFuture<Output = Result<T, TransportError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let error = ChainError::from(error);
                    if attempt >= READ_RETRIES || !error.is_retryable() {
                        return Err(error);
                    }
                    tracing::debug!(chain = %self.network, op, attempt, %error, "retrying read");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    pub async fn remote_chain_id(&self) -> Result<u64, ChainError> {
        self.read("eth_chainId", || self.provider.get_chain_id()).await
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        self.read("eth_blockNumber", || self.provider.get_block_number())
            .await
    }

    pub async fn balance(&self, address: Address) -> Result<U256, ChainError> {
        self.read("eth_getBalance", || self.provider.get_balance(address))
            .await
    }

    pub async fn code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.read("eth_getCode", || self.provider.get_code_at(address))
            .await
    }

    pub async fn gas_price(&self) -> Result<u128, ChainError> {
        self.read("eth_gasPrice", || self.provider.get_gas_price())
            .await
    }

    pub async fn max_priority_fee_per_gas(&self) -> Result<u128, ChainError> {
        self.read("eth_maxPriorityFeePerGas", || {
            self.provider.get_max_priority_fee_per_gas()
        })
        .await
    }

    pub async fn fee_history(&self, blocks: u64) -> Result<FeeHistory, ChainError> {
        self.read("eth_feeHistory", || {
            self.provider
                .get_fee_history(blocks, BlockNumberOrTag::Latest, &REWARD_PERCENTILES)
        })
        .await
    }

    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ChainError> {
        self.read("eth_estimateGas", || self.provider.estimate_gas(tx.clone()))
            .await
    }

    pub async fn call(&self, tx: &TransactionRequest) -> Result<Bytes, ChainError> {
        self.read("eth_call", || self.provider.call(tx.clone())).await
    }

    pub async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.read("eth_getTransactionReceipt", || {
            self.provider.get_transaction_receipt(hash)
        })
        .await
    }

    pub async fn logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        self.read("eth_getLogs", || self.provider.get_logs(filter))
            .await
    }

    pub async fn get_block(&self, tag: BlockNumberOrTag) -> Result<Option<Block>, ChainError> {
        self.read("eth_getBlockByNumber", || {
            self.provider.get_block_by_number(tag)
        })
        .await
    }

    /// Submit raw signed transaction bytes. Never retried.
    pub async fn send_raw(&self, encoded: &[u8]) -> Result<TxHash, ChainError> {
        let pending = self.provider.send_raw_transaction(encoded).await?;
        Ok(*pending.tx_hash())
    }

    /// Whether the chain supports EIP-1559, probed from the latest block and
    /// cached for the client's lifetime.
    pub async fn supports_eip1559(&self) -> Result<bool, ChainError> {
        let supported = self
            .eip1559
            .get_or_try_init(|| async {
                let block = self.get_block(BlockNumberOrTag::Latest).await?;
                let supported = block
                    .as_ref()
                    .is_some_and(|b| b.header.base_fee_per_gas.is_some());
                tracing::debug!(chain = %self.network, supported, "probed EIP-1559 support");
                Ok::<bool, ChainError>(supported)
            })
            .await?;
        Ok(*supported)
    }

    /// Price a transaction for the requested speed tier.
    pub async fn gas_fees(&self, speed: GasSpeed) -> Result<GasFees, ChainError> {
        if self.supports_eip1559().await? {
            let history = self.fee_history(self.oracle.config().fee_history_blocks).await?;
            let latest = self.get_block(BlockNumberOrTag::Latest).await?;
            let base_fee = latest
                .as_ref()
                .and_then(|b| b.header.base_fee_per_gas)
                .map(u128::from)
                .unwrap_or(self.oracle.config().min_gas_price_wei);
            Ok(self.oracle.eip1559_fees(&history, base_fee, speed))
        } else {
            let price = self.gas_price().await?;
            Ok(self.oracle.legacy_fees(price, speed))
        }
    }

    /// Build, sign, and submit a transaction.
    ///
    /// Allocates a nonce, prices gas, pads the gas-limit estimate, signs
    /// inside the signer's key scope, and hands the raw bytes to the RPC.
    /// Any failure between allocation and acceptance resets the nonce
    /// counter. Returns as soon as the RPC accepts the transaction; callers
    /// commit accounting at that point and then [`confirm`](Self::confirm).
    pub async fn submit(
        &self,
        signer: &AgentSigner,
        nonces: &NonceCoordinator,
        to: Address,
        value: U256,
        calldata: Bytes,
        speed: GasSpeed,
    ) -> Result<SubmittedTx, ChainError> {
        let sender = signer.address();
        let nonce = nonces.allocate(self, self.chain_id(), sender).await?;
        match self
            .submit_with_nonce(signer, nonce, to, value, calldata, speed)
            .await
        {
            Ok(submitted) => Ok(submitted),
            Err(error) => {
                // Between allocation and acceptance: resync so the gap heals.
                if let Err(reset_error) = nonces.on_failed(self, self.chain_id(), sender).await {
                    tracing::warn!(chain = %self.network, %sender, %reset_error, "nonce resync failed");
                }
                Err(error)
            }
        }
    }

    async fn submit_with_nonce(
        &self,
        signer: &AgentSigner,
        nonce: u64,
        to: Address,
        value: U256,
        calldata: Bytes,
        speed: GasSpeed,
    ) -> Result<SubmittedTx, ChainError> {
        let sender = signer.address();
        let fees = self.gas_fees(speed).await?;

        let mut request = TransactionRequest::default()
            .with_from(sender)
            .with_to(to)
            .with_value(value)
            .with_input(calldata)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id());
        match fees {
            GasFees::Legacy { gas_price } => {
                request = request.with_gas_price(gas_price);
            }
            GasFees::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                request = request
                    .with_max_fee_per_gas(max_fee_per_gas)
                    .with_max_priority_fee_per_gas(max_priority_fee_per_gas);
            }
        }

        let estimate = self.estimate_gas(&request).await?;
        let gas_limit = self.oracle.pad_gas_limit(estimate);
        request = request.with_gas_limit(gas_limit);

        let mut unsigned = request
            .build_unsigned()
            .map_err(|e| ChainError::Build(e.to_string()))?;
        let signature = signer
            .with_key(|key| key.sign_transaction_sync(&mut unsigned))
            .map_err(|e| ChainError::Sign(e.to_string()))?;
        let envelope: TxEnvelope = unsigned.into_signed(signature).into();
        let encoded = envelope.encoded_2718();

        let hash = self.send_raw(&encoded).await?;
        tracing::info!(chain = %self.network, %sender, nonce, %hash, "transaction accepted");
        Ok(SubmittedTx {
            hash,
            sender,
            nonce,
            gas_limit,
            fees,
        })
    }

    /// Wait for a submitted transaction to be mined and confirmed.
    ///
    /// Polls for the receipt until the configured timeout. A mined-but-
    /// reverted transaction still consumed its nonce, so the counter is
    /// decremented either way; a timeout resets it instead.
    pub async fn confirm(
        &self,
        nonces: &NonceCoordinator,
        submitted: &SubmittedTx,
    ) -> Result<TransactionReceipt, ChainError> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        let receipt = loop {
            if let Some(receipt) = self.receipt(submitted.hash).await? {
                break receipt;
            }
            if tokio::time::Instant::now() >= deadline {
                if let Err(error) = nonces.on_failed(self, self.chain_id(), submitted.sender).await
                {
                    tracing::warn!(chain = %self.network, %error, "nonce resync failed");
                }
                return Err(ChainError::ReceiptTimeout(
                    submitted.hash,
                    self.receipt_timeout,
                ));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        };

        if self.confirmations > 1 {
            if let Some(mined_in) = receipt.block_number {
                let target = mined_in + self.confirmations - 1;
                while self.block_number().await? < target {
                    tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                }
            }
        }

        nonces.on_confirmed(self.chain_id(), submitted.sender).await;
        if !receipt.status() {
            return Err(ChainError::Reverted(submitted.hash));
        }
        tracing::info!(chain = %self.network, hash = %submitted.hash, "transaction confirmed");
        Ok(receipt)
    }
}

#[async_trait]
impl PendingNonceSource for ChainClient {
    async fn pending_transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        self.read("eth_getTransactionCount", || {
            self.provider.get_transaction_count(address).pending()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        let err = ChainError::Rpc {
            code: Some(-32005),
            message: "limit exceeded".into(),
            retryable: true,
        };
        assert!(err.is_retryable());
        let err = ChainError::Rpc {
            code: Some(3),
            message: "execution reverted".into(),
            retryable: false,
        };
        assert!(!err.is_retryable());
        assert!(!ChainError::Reverted(TxHash::ZERO).is_retryable());
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint: ChainEndpoint = serde_json::from_str(
            r#"{"chain_id": 8453, "rpc_url": "https://mainnet.base.org"}"#,
        )
        .unwrap();
        assert_eq!(endpoint.receipt_timeout_secs, 30);
        assert_eq!(endpoint.confirmations, 1);
        assert_eq!(endpoint.gas.min_gas_price_wei, gas::GWEI);
        assert_eq!(endpoint.gas.max_gas_price_wei, 500 * gas::GWEI);
    }
}
