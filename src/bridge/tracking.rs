//! Tracking ids and the bridge metadata registry.
//!
//! A tracking id names one cross-chain transfer for its whole lifetime:
//! `bridge_<protocol>_<source_chain>_<dest_chain>_<identifier>`. The legacy
//! three-segment form without the destination chain still parses; its
//! destination is recovered from stored metadata when available. Underscores
//! inside the identifier belong to the identifier.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use crate::bridge::{BridgeError, BridgeStatus};
use crate::timestamp::TimestampMs;

/// Canonical tracking id string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingId(String);

impl TrackingId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for TrackingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed components of a tracking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingComponents {
    pub protocol: String,
    pub source_chain_id: u64,
    /// `None` for the legacy three-segment form.
    pub destination_chain_id: Option<u64>,
    pub identifier: String,
}

/// Everything the wallet remembers about a transfer, keyed by tracking id.
#[derive(Debug, Clone)]
pub struct BridgeMetadata {
    pub protocol_name: String,
    pub message_bytes: Option<Bytes>,
    pub nonce: Option<u64>,
    pub source_domain: Option<u32>,
    pub destination_domain: Option<u32>,
    pub destination_chain_id: u64,
    pub amount_raw: U256,
    pub recipient: Address,
    pub created_at: TimestampMs,
}

#[derive(Debug)]
struct TrackedEntry {
    status: BridgeStatus,
    metadata: Option<BridgeMetadata>,
    note: Option<String>,
}

/// In-memory registry of transfers and their state-machine position.
///
/// Transitions are linearised per tracking id by the registry mutex; state
/// only ever advances, and `completed`/`failed` are sinks.
#[derive(Debug, Default)]
pub struct TrackingRegistry {
    entries: Mutex<HashMap<String, TrackedEntry>>,
}

/// Build the canonical id for a transfer.
pub fn create_tracking_id(
    protocol: &str,
    source_chain_id: u64,
    destination_chain_id: u64,
    identifier: &str,
) -> TrackingId {
    TrackingId(format!(
        "bridge_{}_{}_{}_{}",
        protocol.to_lowercase(),
        source_chain_id,
        destination_chain_id,
        identifier.to_lowercase(),
    ))
}

/// Parse either the canonical four-segment or the legacy three-segment form.
///
/// When the segment after the source chain parses as a number *and* further
/// segments follow, it is read as the destination chain id; a sole trailing
/// segment (or one starting with `0x`) is the identifier.
pub fn parse_tracking_id(id: &str) -> Option<TrackingComponents> {
    let rest = id.strip_prefix("bridge_")?;
    let segments: Vec<&str> = rest.split('_').collect();
    if segments.len() < 3 {
        return None;
    }
    let protocol = segments[0];
    if protocol.is_empty() {
        return None;
    }
    let source_chain_id: u64 = segments[1].parse().ok()?;
    let tail = &segments[2..];
    let (destination_chain_id, identifier) = if tail.len() >= 2 && !tail[0].starts_with("0x") {
        match tail[0].parse::<u64>() {
            Ok(dest) => (Some(dest), tail[1..].join("_")),
            Err(_) => (None, tail.join("_")),
        }
    } else {
        (None, tail.join("_"))
    };
    if identifier.is_empty() {
        return None;
    }
    Some(TrackingComponents {
        protocol: protocol.to_lowercase(),
        source_chain_id,
        destination_chain_id,
        identifier: identifier.to_lowercase(),
    })
}

impl TrackingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh transfer and return its id.
    pub fn create(
        &self,
        protocol: &str,
        source_chain_id: u64,
        destination_chain_id: u64,
        identifier: &str,
    ) -> TrackingId {
        let id = create_tracking_id(protocol, source_chain_id, destination_chain_id, identifier);
        let mut entries = self.entries.lock().expect("tracking lock poisoned");
        entries.entry(id.as_str().to_string()).or_insert(TrackedEntry {
            status: BridgeStatus::PendingBurn,
            metadata: None,
            note: None,
        });
        id
    }

    /// Parse an id, recovering a legacy form's destination chain from stored
    /// metadata when available.
    pub fn parse(&self, id: &str) -> Option<TrackingComponents> {
        let mut components = parse_tracking_id(id)?;
        if components.destination_chain_id.is_none() {
            let entries = self.entries.lock().expect("tracking lock poisoned");
            if let Some(meta) = entries.get(id).and_then(|e| e.metadata.as_ref()) {
                components.destination_chain_id = Some(meta.destination_chain_id);
            }
        }
        Some(components)
    }

    pub fn store_metadata(&self, id: &TrackingId, metadata: BridgeMetadata) {
        let mut entries = self.entries.lock().expect("tracking lock poisoned");
        let entry = entries
            .entry(id.as_str().to_string())
            .or_insert(TrackedEntry {
                status: BridgeStatus::PendingBurn,
                metadata: None,
                note: None,
            });
        entry.metadata = Some(metadata);
    }

    pub fn metadata(&self, id: &str) -> Option<BridgeMetadata> {
        let entries = self.entries.lock().expect("tracking lock poisoned");
        entries.get(id).and_then(|e| e.metadata.clone())
    }

    pub fn status(&self, id: &str) -> Option<(BridgeStatus, Option<String>)> {
        let entries = self.entries.lock().expect("tracking lock poisoned");
        entries.get(id).map(|e| (e.status, e.note.clone()))
    }

    /// Advance the state machine; rejects regressions and moves out of
    /// terminal states.
    pub fn advance(&self, id: &TrackingId, next: BridgeStatus) -> Result<(), BridgeError> {
        let mut entries = self.entries.lock().expect("tracking lock poisoned");
        let entry = entries
            .get_mut(id.as_str())
            .ok_or_else(|| BridgeError::UnknownTracking(id.as_str().to_string()))?;
        if !entry.status.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: entry.status,
                to: next,
            });
        }
        tracing::debug!(tracking = %id, from = %entry.status, to = %next, "bridge state transition");
        entry.status = next;
        Ok(())
    }

    /// Move a transfer to `failed`, preserving metadata for operator action.
    pub fn fail(&self, id: &TrackingId, note: impl Into<String>) {
        let mut entries = self.entries.lock().expect("tracking lock poisoned");
        if let Some(entry) = entries.get_mut(id.as_str()) {
            if !entry.status.is_terminal() {
                let note = note.into();
                tracing::warn!(tracking = %id, %note, "bridge transfer failed");
                entry.status = BridgeStatus::Failed;
                entry.note = Some(note);
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("tracking lock poisoned");
        entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = create_tracking_id("CCTP", 1, 8453, "0xAbCdEf");
        assert_eq!(id.as_str(), "bridge_cctp_1_8453_0xabcdef");
        let parsed = parse_tracking_id(id.as_str()).unwrap();
        assert_eq!(
            parsed,
            TrackingComponents {
                protocol: "cctp".into(),
                source_chain_id: 1,
                destination_chain_id: Some(8453),
                identifier: "0xabcdef".into(),
            }
        );
    }

    #[test]
    fn test_legacy_parse() {
        let parsed = parse_tracking_id("bridge_cctp_1_0xabc").unwrap();
        assert_eq!(parsed.protocol, "cctp");
        assert_eq!(parsed.source_chain_id, 1);
        assert_eq!(parsed.destination_chain_id, None);
        assert_eq!(parsed.identifier, "0xabc");
    }

    #[test]
    fn test_underscores_belong_to_identifier() {
        let parsed = parse_tracking_id("bridge_across_10_8453_0xdead_beef_1").unwrap();
        assert_eq!(parsed.destination_chain_id, Some(8453));
        assert_eq!(parsed.identifier, "0xdead_beef_1");
    }

    #[test]
    fn test_legacy_numeric_identifier_stays_identifier() {
        // A sole trailing numeric segment is the identifier, not a
        // destination chain.
        let parsed = parse_tracking_id("bridge_across_10_12345").unwrap();
        assert_eq!(parsed.destination_chain_id, None);
        assert_eq!(parsed.identifier, "12345");
    }

    #[test]
    fn test_hex_identifier_never_read_as_destination() {
        let parsed = parse_tracking_id("bridge_cctp_1_0xabc_def").unwrap();
        assert_eq!(parsed.destination_chain_id, None);
        assert_eq!(parsed.identifier, "0xabc_def");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "cctp_1_8453_0xabc",
            "bridge_cctp",
            "bridge_cctp_x_0xabc",
            "bridge__1_0xabc",
            "bridge_cctp_1_",
        ] {
            assert!(parse_tracking_id(bad).is_none(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_registry_fills_legacy_destination_from_metadata() {
        let registry = TrackingRegistry::new();
        let id = registry.create("cctp", 1, 8453, "0xabc");
        registry.store_metadata(
            &id,
            BridgeMetadata {
                protocol_name: "cctp".into(),
                message_bytes: None,
                nonce: None,
                source_domain: Some(0),
                destination_domain: Some(6),
                destination_chain_id: 8453,
                amount_raw: U256::from(1u64),
                recipient: Address::ZERO,
                created_at: TimestampMs(0),
            },
        );
        // The canonical id parses with its own destination.
        assert_eq!(
            registry.parse(id.as_str()).unwrap().destination_chain_id,
            Some(8453)
        );
        // A legacy id with no stored metadata has none.
        assert_eq!(
            registry
                .parse("bridge_cctp_1_0xother")
                .unwrap()
                .destination_chain_id,
            None
        );
    }

    #[test]
    fn test_state_only_advances() {
        let registry = TrackingRegistry::new();
        let id = registry.create("cctp", 1, 8453, "0xabc");
        registry.advance(&id, BridgeStatus::BurnConfirmed).unwrap();
        registry
            .advance(&id, BridgeStatus::AttestationPending)
            .unwrap();
        // Regression is rejected.
        assert!(matches!(
            registry.advance(&id, BridgeStatus::BurnConfirmed),
            Err(BridgeError::InvalidTransition { .. })
        ));
        registry.advance(&id, BridgeStatus::AttestationReady).unwrap();
        registry.advance(&id, BridgeStatus::PendingMint).unwrap();
        registry.advance(&id, BridgeStatus::Completed).unwrap();
        // Completed is a sink.
        assert!(registry.advance(&id, BridgeStatus::Failed).is_err());
    }

    #[test]
    fn test_failed_is_sink_and_preserves_metadata() {
        let registry = TrackingRegistry::new();
        let id = registry.create("cctp", 1, 8453, "0xabc");
        registry.store_metadata(
            &id,
            BridgeMetadata {
                protocol_name: "cctp".into(),
                message_bytes: Some(Bytes::from_static(b"msg")),
                nonce: Some(42),
                source_domain: Some(0),
                destination_domain: Some(6),
                destination_chain_id: 8453,
                amount_raw: U256::from(5u64),
                recipient: Address::ZERO,
                created_at: TimestampMs(0),
            },
        );
        registry.fail(&id, "attestation timed out");
        let (status, note) = registry.status(id.as_str()).unwrap();
        assert_eq!(status, BridgeStatus::Failed);
        assert_eq!(note.as_deref(), Some("attestation timed out"));
        assert!(registry.advance(&id, BridgeStatus::Completed).is_err());
        assert!(registry.metadata(id.as_str()).is_some());
    }
}
