//! Core runtime of an autonomous on-chain agent wallet.
//!
//! This crate lets a policy-driven program move value across EVM-compatible
//! networks under enforced spending constraints, with human-in-the-loop
//! approval, and across chains via burn-and-mint or intent-relayer
//! protocols.
//!
//! # Overview
//!
//! Four subsystems carry most of the weight:
//!
//! - **Transaction lifecycle**: building, signing, submitting, and tracking
//!   EVM transactions under concurrency, with per-sender nonce coordination
//!   ([`chain`]).
//! - **The safety envelope**: windowed USD spending limits, an emergency
//!   stop, address allow/deny lists, and a pending-approval handshake
//!   ([`limits`], [`policy`], [`approval`]).
//! - **Bridge orchestration**: a protocol registry, a scoring-based route
//!   selector, and a two-phase burn/attest/mint state machine ([`bridge`]).
//! - **Stablecoin accounting**: heterogeneous token decimals normalised to
//!   a 6-decimal USD unit for limit enforcement ([`units`]).
//!
//! The [`wallet::Wallet`] facade composes all of them and is the intended
//! entry point.
//!
//! # Modules
//!
//! - [`abi`] — Contract ABI fragments (ERC-20, token messenger, message
//!   transmitter, spoke pool).
//! - [`approval`] — The human-in-the-loop approval arbiter.
//! - [`bridge`] — Protocol adapters, route scoring, tracking ids, and the
//!   unified bridge state machine.
//! - [`chain`] — JSON-RPC chain client, gas pricing policy, and the nonce
//!   coordinator.
//! - [`config`] — Serde-friendly configuration types.
//! - [`error`] — The flattened wallet-level error taxonomy.
//! - [`limits`] — Windowed spending accounting and the emergency stop.
//! - [`networks`] — Known networks and validated token deployments.
//! - [`policy`] — Trusted/blocked address lists.
//! - [`signer`] — Scoped private-key access and ECDSA signing.
//! - [`timestamp`] — Millisecond Unix timestamps.
//! - [`units`] — Fixed-point amount parsing and USD normalisation.
//! - [`wallet`] — The facade composing everything above.
//!
//! # Example
//!
//! ```no_run
//! use agentwallet::config::{EvmPrivateKey, WalletConfig};
//! use agentwallet::wallet::Wallet;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config: WalletConfig =
//!     serde_json::from_str(&std::fs::read_to_string("config.json")?)?;
//! let key: EvmPrivateKey = std::env::var("WALLET_PRIVATE_KEY")?.parse()?;
//! let wallet = Wallet::new(config, key)?;
//!
//! let outcome = wallet
//!     .send_token(8453, "USDC", "25.00", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
//!     .await?;
//! println!("sent in {}", outcome.tx_hash);
//! # Ok(())
//! # }
//! ```

pub mod abi;
pub mod approval;
pub mod bridge;
pub mod chain;
pub mod config;
pub mod error;
pub mod limits;
pub mod networks;
pub mod policy;
pub mod signer;
pub mod timestamp;
pub mod units;
pub mod wallet;

pub use error::WalletError;
pub use wallet::Wallet;
