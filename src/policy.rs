//! Address allow/deny lists.
//!
//! A recipient is either trusted, blocked, or unknown. The same address can
//! never sit on both lists; trying to configure that is an error, not a
//! precedence question. At enforcement time the blocklist is consulted
//! first.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::timestamp::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyListKind {
    Trusted,
    Blocked,
}

/// One allow/deny list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPolicyEntry {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub added_at: TimestampMs,
    pub kind: PolicyListKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressPolicyError {
    /// The address already sits on the opposite list.
    #[error("address {address} is already {existing:?}; remove it first")]
    ListConflict {
        address: Address,
        existing: PolicyListKind,
    },
}

#[derive(Debug, Default)]
struct Lists {
    trusted: HashMap<Address, AddressPolicyEntry>,
    blocked: HashMap<Address, AddressPolicyEntry>,
}

/// Thread-safe trusted/blocked address book.
#[derive(Debug, Default)]
pub struct AddressPolicy {
    lists: Mutex<Lists>,
}

impl AddressPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pre-existing entries, rejecting cross-list conflicts.
    pub fn from_entries(
        entries: impl IntoIterator<Item = AddressPolicyEntry>,
    ) -> Result<Self, AddressPolicyError> {
        let policy = Self::new();
        for entry in entries {
            match entry.kind {
                PolicyListKind::Trusted => policy.trust_entry(entry)?,
                PolicyListKind::Blocked => policy.block_entry(entry)?,
            }
        }
        Ok(policy)
    }

    pub fn trust(
        &self,
        address: Address,
        label: Option<String>,
    ) -> Result<(), AddressPolicyError> {
        self.trust_entry(AddressPolicyEntry {
            address,
            label,
            reason: None,
            added_at: TimestampMs::now(),
            kind: PolicyListKind::Trusted,
        })
    }

    pub fn block(
        &self,
        address: Address,
        reason: Option<String>,
    ) -> Result<(), AddressPolicyError> {
        self.block_entry(AddressPolicyEntry {
            address,
            label: None,
            reason,
            added_at: TimestampMs::now(),
            kind: PolicyListKind::Blocked,
        })
    }

    fn trust_entry(&self, entry: AddressPolicyEntry) -> Result<(), AddressPolicyError> {
        let mut lists = self.lists.lock().expect("address policy lock poisoned");
        if lists.blocked.contains_key(&entry.address) {
            return Err(AddressPolicyError::ListConflict {
                address: entry.address,
                existing: PolicyListKind::Blocked,
            });
        }
        lists.trusted.insert(entry.address, entry);
        Ok(())
    }

    fn block_entry(&self, entry: AddressPolicyEntry) -> Result<(), AddressPolicyError> {
        let mut lists = self.lists.lock().expect("address policy lock poisoned");
        if lists.trusted.contains_key(&entry.address) {
            return Err(AddressPolicyError::ListConflict {
                address: entry.address,
                existing: PolicyListKind::Trusted,
            });
        }
        lists.blocked.insert(entry.address, entry);
        Ok(())
    }

    /// Drop an address from whichever list holds it.
    pub fn remove(&self, address: Address) {
        let mut lists = self.lists.lock().expect("address policy lock poisoned");
        lists.trusted.remove(&address);
        lists.blocked.remove(&address);
    }

    pub fn is_blocked(&self, address: Address) -> bool {
        let lists = self.lists.lock().expect("address policy lock poisoned");
        lists.blocked.contains_key(&address)
    }

    pub fn is_trusted(&self, address: Address) -> bool {
        let lists = self.lists.lock().expect("address policy lock poisoned");
        // Blocklist wins; a conflicting insert is impossible, but the
        // enforcement order is part of the contract.
        !lists.blocked.contains_key(&address) && lists.trusted.contains_key(&address)
    }

    pub fn block_reason(&self, address: Address) -> Option<String> {
        let lists = self.lists.lock().expect("address policy lock poisoned");
        lists.blocked.get(&address).and_then(|e| e.reason.clone())
    }

    pub fn entries(&self) -> Vec<AddressPolicyEntry> {
        let lists = self.lists.lock().expect("address policy lock poisoned");
        lists
            .trusted
            .values()
            .chain(lists.blocked.values())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const ALICE: Address = address!("0x1111111111111111111111111111111111111111");
    const MALLORY: Address = address!("0x2222222222222222222222222222222222222222");

    #[test]
    fn test_trust_and_block_disjoint() {
        let policy = AddressPolicy::new();
        policy.trust(ALICE, Some("alice".into())).unwrap();
        policy.block(MALLORY, Some("phishing".into())).unwrap();

        assert!(policy.is_trusted(ALICE));
        assert!(!policy.is_blocked(ALICE));
        assert!(policy.is_blocked(MALLORY));
        assert!(!policy.is_trusted(MALLORY));
    }

    #[test]
    fn test_conflict_is_configuration_error() {
        let policy = AddressPolicy::new();
        policy.trust(ALICE, None).unwrap();
        let err = policy.block(ALICE, None).unwrap_err();
        assert_eq!(
            err,
            AddressPolicyError::ListConflict {
                address: ALICE,
                existing: PolicyListKind::Trusted,
            }
        );

        policy.block(MALLORY, None).unwrap();
        assert!(policy.trust(MALLORY, None).is_err());
    }

    #[test]
    fn test_remove_then_relist() {
        let policy = AddressPolicy::new();
        policy.trust(ALICE, None).unwrap();
        policy.remove(ALICE);
        policy.block(ALICE, None).unwrap();
        assert!(policy.is_blocked(ALICE));
    }

    #[test]
    fn test_case_insensitive_equality() {
        // Addresses parsed from differently-cased hex are the same key.
        let lower: Address = "0x1111111111111111111111111111111111111111"
            .parse()
            .unwrap();
        let policy = AddressPolicy::new();
        policy.block(lower, None).unwrap();
        assert!(policy.is_blocked(ALICE));
    }
}
