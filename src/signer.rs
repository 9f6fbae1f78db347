//! Transaction signing with scoped private-key access.
//!
//! The key lives inside [`AgentSigner`] as raw bytes that are zeroised on
//! drop. Callers never receive the key itself; they receive the results of
//! operations run against it through [`AgentSigner::with_key`], which builds
//! a short-lived [`PrivateKeySigner`] for the duration of the closure.

use alloy_primitives::{Address, B256, U256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use zeroize::Zeroize;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The 32 bytes are not a valid secp256k1 scalar.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Raw key material, wiped when the signer is dropped.
struct KeyMaterial([u8; 32]);

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// An ECDSA signature split into its wire components.
///
/// `s` is always in low-s form and signing is deterministic (RFC 6979), so
/// signing the same payload twice yields identical parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParts {
    pub r: U256,
    pub s: U256,
    /// EIP-1559 y-parity bit.
    pub y_parity: bool,
}

impl SignatureParts {
    /// Legacy transaction recovery id: 27 or 28.
    pub fn legacy_v(&self) -> u64 {
        27 + u64::from(self.y_parity)
    }
}

/// Holds one secp256k1 private key and signs on behalf of the wallet.
pub struct AgentSigner {
    key: KeyMaterial,
    address: Address,
}

impl std::fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSigner")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl AgentSigner {
    /// Validate the scalar and derive the signer address.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, SignerError> {
        let address = {
            let signer = PrivateKeySigner::from_bytes(&B256::from(bytes))
                .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
            signer.address()
        };
        Ok(Self {
            key: KeyMaterial(bytes),
            address,
        })
    }

    pub fn from_b256(bytes: B256) -> Result<Self, SignerError> {
        Self::from_bytes(bytes.0)
    }

    /// The address derived from the held key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Run `f` against a short-lived signer built from the held key.
    ///
    /// The closure must not smuggle the signer (or anything derived from the
    /// raw scalar) out of scope; return signatures and addresses, not keys.
    pub fn with_key<R>(&self, f: impl FnOnce(&PrivateKeySigner) -> R) -> R {
        let signer = PrivateKeySigner::from_bytes(&B256::from(self.key.0))
            .expect("key bytes validated at construction");
        f(&signer)
    }

    /// Sign a 32-byte digest, returning `(r, s, y_parity)`.
    pub fn sign_hash(&self, hash: B256) -> Result<SignatureParts, SignerError> {
        let signature = self
            .with_key(|signer| signer.sign_hash_sync(&hash))
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(SignatureParts {
            r: signature.r(),
            s: signature.s(),
            y_parity: signature.v(),
        })
    }
}
