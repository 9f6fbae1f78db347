//! Human-in-the-loop approval gate.
//!
//! Before any chain-writing action, the arbiter decides whether the action
//! may proceed, is refused outright, or must wait for an out-of-band human
//! decision. A pending approval is a map entry plus a oneshot waiter; the
//! caller suspends on the waiter until `approve`/`reject` is invoked or the
//! request times out into `Expired`. Expiry runs on its own timer and is
//! independent of caller cancellation.

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::policy::AddressPolicy;
use crate::timestamp::TimestampMs;
use crate::units::Usd6;

/// Default time a request may stay pending: 60 minutes.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Require approval above this USD value, trusted recipients included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_exceeds: Option<Usd6>,
    /// Require approval for recipients with no prior successful send.
    #[serde(default)]
    pub recipient_is_new: bool,
    #[serde(default = "approval_defaults::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            amount_exceeds: None,
            recipient_is_new: false,
            timeout_secs: approval_defaults::default_timeout_secs(),
        }
    }
}

impl ApprovalConfig {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

mod approval_defaults {
    pub fn default_timeout_secs() -> u64 {
        super::DEFAULT_APPROVAL_TIMEOUT.as_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A request surfaced to the external approval handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub summary: String,
    pub details: HashMap<String, serde_json::Value>,
    pub amount_usd: Usd6,
    pub recipient: Address,
    pub created_at: TimestampMs,
    pub state: ApprovalState,
}

/// One audited decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAuditRecord {
    pub request_id: String,
    pub at: TimestampMs,
    pub state: ApprovalState,
    /// Tag of whoever resolved the request; `"timeout"` for expiry.
    pub decider: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("recipient {address} is blocked{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    RecipientBlocked {
        address: Address,
        reason: Option<String>,
    },
    #[error("approval {id} was rejected by {decider}")]
    Rejected { id: String, decider: String },
    #[error("approval {id} expired without a decision")]
    Expired { id: String },
    #[error("no pending approval with id {0}")]
    Unknown(String),
    #[error("approval {id} already resolved as {state:?}")]
    AlreadyResolved { id: String, state: ApprovalState },
    #[error("approval wait cancelled")]
    Cancelled,
}

/// Notified when a new request becomes pending. Hosts forward this to a
/// dashboard, chat bot, or wherever the human sits.
pub trait ApprovalHandler: Send + Sync {
    fn on_request(&self, request: &ApprovalRequest);
}

/// Outcome of the pre-flight policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    /// Proceed without human involvement.
    Bypass,
    /// Refused outright; never shown to a human.
    Blocked { reason: Option<String> },
    /// A human must decide.
    ApprovalRequired,
}

#[derive(Debug, Clone)]
enum Decision {
    Approved { decider: String },
    Rejected { decider: String },
}

struct PendingApproval {
    request: ApprovalRequest,
    decision_tx: Option<oneshot::Sender<Decision>>,
}

/// Decides whether actions need human approval and suspends callers until
/// resolution.
pub struct ApprovalArbiter {
    config: ApprovalConfig,
    policy: Arc<AddressPolicy>,
    handler: Option<Arc<dyn ApprovalHandler>>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    seen_recipients: Mutex<HashSet<Address>>,
    audit: Mutex<Vec<ApprovalAuditRecord>>,
    seq: AtomicU64,
}

impl std::fmt::Debug for ApprovalArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalArbiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ApprovalArbiter {
    pub fn new(
        config: ApprovalConfig,
        policy: Arc<AddressPolicy>,
        handler: Option<Arc<dyn ApprovalHandler>>,
    ) -> Self {
        Self {
            config,
            policy,
            handler,
            pending: Mutex::new(HashMap::new()),
            seen_recipients: Mutex::new(HashSet::new()),
            audit: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Pure policy evaluation; no state change, no waiting.
    pub fn evaluate(&self, recipient: Address, amount_usd: Usd6) -> GateVerdict {
        if self.policy.is_blocked(recipient) {
            return GateVerdict::Blocked {
                reason: self.policy.block_reason(recipient),
            };
        }
        let exceeds = self
            .config
            .amount_exceeds
            .is_some_and(|ceiling| amount_usd > ceiling);
        if self.policy.is_trusted(recipient) {
            if exceeds {
                return GateVerdict::ApprovalRequired;
            }
            return GateVerdict::Bypass;
        }
        let unseen = {
            let seen = self.seen_recipients.lock().expect("seen lock poisoned");
            !seen.contains(&recipient)
        };
        if exceeds || (self.config.recipient_is_new && unseen) {
            GateVerdict::ApprovalRequired
        } else {
            GateVerdict::Bypass
        }
    }

    /// Gate an action: evaluate policy and, when required, wait for a human.
    ///
    /// Returns `Ok(())` once the action may proceed. The wait ends on
    /// `approve`, `reject`, expiry, or caller cancellation; an expired or
    /// cancelled wait leaves the chain untouched.
    pub async fn gate(
        &self,
        summary: impl Into<String>,
        details: HashMap<String, serde_json::Value>,
        amount_usd: Usd6,
        recipient: Address,
        cancel: &CancellationToken,
    ) -> Result<(), ApprovalError> {
        match self.evaluate(recipient, amount_usd) {
            GateVerdict::Bypass => return Ok(()),
            GateVerdict::Blocked { reason } => {
                return Err(ApprovalError::RecipientBlocked {
                    address: recipient,
                    reason,
                });
            }
            GateVerdict::ApprovalRequired => {}
        }

        let (id, rx) = self.create_request(summary.into(), details, amount_usd, recipient);
        tracing::info!(%id, %recipient, amount = %amount_usd, "approval requested");

        tokio::select! {
            _ = cancel.cancelled() => {
                // The request stays pending and expires on its own timer.
                Err(ApprovalError::Cancelled)
            }
            outcome = tokio::time::timeout(self.config.timeout(), rx) => match outcome {
                Ok(Ok(Decision::Approved { decider })) => {
                    tracing::info!(%id, %decider, "approval granted");
                    Ok(())
                }
                Ok(Ok(Decision::Rejected { decider })) => {
                    tracing::warn!(%id, %decider, "approval rejected");
                    Err(ApprovalError::Rejected { id, decider })
                }
                // Sender dropped without a decision; treat as expiry.
                Ok(Err(_)) => Err(ApprovalError::Expired { id }),
                Err(_) => {
                    self.expire(&id);
                    Err(ApprovalError::Expired { id })
                }
            },
        }
    }

    fn create_request(
        &self,
        summary: String,
        details: HashMap<String, serde_json::Value>,
        amount_usd: Usd6,
        recipient: Address,
    ) -> (String, oneshot::Receiver<Decision>) {
        let created_at = TimestampMs::now();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("appr_{}_{seq}", created_at.as_millis());
        let request = ApprovalRequest {
            id: id.clone(),
            summary,
            details,
            amount_usd,
            recipient,
            created_at,
            state: ApprovalState::Pending,
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(
                id.clone(),
                PendingApproval {
                    request: request.clone(),
                    decision_tx: Some(tx),
                },
            );
        }
        if let Some(handler) = &self.handler {
            handler.on_request(&request);
        }
        (id, rx)
    }

    pub fn approve(&self, id: &str, decider: &str) -> Result<(), ApprovalError> {
        self.resolve(
            id,
            ApprovalState::Approved,
            Decision::Approved {
                decider: decider.to_string(),
            },
            decider,
        )
    }

    pub fn reject(&self, id: &str, decider: &str) -> Result<(), ApprovalError> {
        self.resolve(
            id,
            ApprovalState::Rejected,
            Decision::Rejected {
                decider: decider.to_string(),
            },
            decider,
        )
    }

    fn resolve(
        &self,
        id: &str,
        state: ApprovalState,
        decision: Decision,
        decider: &str,
    ) -> Result<(), ApprovalError> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let entry = pending
            .get_mut(id)
            .ok_or_else(|| ApprovalError::Unknown(id.to_string()))?;
        if entry.request.state != ApprovalState::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id: id.to_string(),
                state: entry.request.state,
            });
        }
        entry.request.state = state;
        if let Some(tx) = entry.decision_tx.take() {
            // The waiter may be gone (cancelled caller); the state transition
            // and audit entry still stand.
            let _ = tx.send(decision);
        }
        drop(pending);
        self.push_audit(id, state, decider);
        Ok(())
    }

    fn expire(&self, id: &str) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if let Some(entry) = pending.get_mut(id) {
            if entry.request.state == ApprovalState::Pending {
                entry.request.state = ApprovalState::Expired;
                entry.decision_tx = None;
                drop(pending);
                self.push_audit(id, ApprovalState::Expired, "timeout");
            }
        }
    }

    fn push_audit(&self, id: &str, state: ApprovalState, decider: &str) {
        self.audit
            .lock()
            .expect("audit lock poisoned")
            .push(ApprovalAuditRecord {
                request_id: id.to_string(),
                at: TimestampMs::now(),
                state,
                decider: decider.to_string(),
            });
    }

    /// Requests still awaiting a decision.
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending
            .values()
            .filter(|p| p.request.state == ApprovalState::Pending)
            .map(|p| p.request.clone())
            .collect()
    }

    pub fn request(&self, id: &str) -> Option<ApprovalRequest> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.get(id).map(|p| p.request.clone())
    }

    /// Record that a send to `recipient` was accepted by the chain, so the
    /// recipient no longer counts as new.
    pub fn note_successful_send(&self, recipient: Address) {
        self.seen_recipients
            .lock()
            .expect("seen lock poisoned")
            .insert(recipient);
    }

    pub fn audit_log(&self) -> Vec<ApprovalAuditRecord> {
        self.audit.lock().expect("audit lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::sync::Arc;

    const RECIPIENT: Address = address!("0x3333333333333333333333333333333333333333");
    const TRUSTED: Address = address!("0x4444444444444444444444444444444444444444");
    const BLOCKED: Address = address!("0x5555555555555555555555555555555555555555");

    fn arbiter(config: ApprovalConfig) -> ApprovalArbiter {
        let policy = Arc::new(AddressPolicy::new());
        policy.trust(TRUSTED, None).unwrap();
        policy.block(BLOCKED, Some("known scam".into())).unwrap();
        ApprovalArbiter::new(config, policy, None)
    }

    fn threshold_config(dollars: u64) -> ApprovalConfig {
        ApprovalConfig {
            amount_exceeds: Some(Usd6::from_dollars(dollars)),
            recipient_is_new: false,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_evaluate_blocklist_first() {
        let arbiter = arbiter(threshold_config(75));
        assert!(matches!(
            arbiter.evaluate(BLOCKED, Usd6::from_dollars(1)),
            GateVerdict::Blocked { .. }
        ));
    }

    #[test]
    fn test_evaluate_threshold() {
        let arbiter = arbiter(threshold_config(75));
        assert_eq!(
            arbiter.evaluate(RECIPIENT, Usd6::from_dollars(50)),
            GateVerdict::Bypass
        );
        assert_eq!(
            arbiter.evaluate(RECIPIENT, Usd6::from_dollars(80)),
            GateVerdict::ApprovalRequired
        );
    }

    #[test]
    fn test_trusted_bypasses_until_threshold() {
        let arbiter = arbiter(threshold_config(75));
        assert_eq!(
            arbiter.evaluate(TRUSTED, Usd6::from_dollars(50)),
            GateVerdict::Bypass
        );
        // The amount ceiling applies to trusted recipients too.
        assert_eq!(
            arbiter.evaluate(TRUSTED, Usd6::from_dollars(80)),
            GateVerdict::ApprovalRequired
        );
    }

    #[test]
    fn test_new_recipient_policy() {
        let config = ApprovalConfig {
            amount_exceeds: None,
            recipient_is_new: true,
            timeout_secs: 5,
        };
        let arbiter = arbiter(config);
        assert_eq!(
            arbiter.evaluate(RECIPIENT, Usd6::from_dollars(1)),
            GateVerdict::ApprovalRequired
        );
        arbiter.note_successful_send(RECIPIENT);
        assert_eq!(
            arbiter.evaluate(RECIPIENT, Usd6::from_dollars(1)),
            GateVerdict::Bypass
        );
    }

    #[tokio::test]
    async fn test_gate_approved() {
        let arbiter = Arc::new(arbiter(threshold_config(75)));
        let waiter = Arc::clone(&arbiter);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            waiter
                .gate(
                    "send 80 USDC",
                    HashMap::new(),
                    Usd6::from_dollars(80),
                    RECIPIENT,
                    &cancel,
                )
                .await
        });
        // Let the request land in the pending map.
        tokio::task::yield_now().await;
        let pending = loop {
            let pending = arbiter.pending_requests();
            if !pending.is_empty() {
                break pending;
            }
            tokio::task::yield_now().await;
        };
        arbiter.approve(&pending[0].id, "operator").unwrap();
        handle.await.unwrap().unwrap();

        let audit = arbiter.audit_log();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].state, ApprovalState::Approved);
        assert_eq!(audit[0].decider, "operator");
    }

    #[tokio::test]
    async fn test_gate_rejected() {
        let arbiter = Arc::new(arbiter(threshold_config(75)));
        let waiter = Arc::clone(&arbiter);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(async move {
            waiter
                .gate(
                    "send 80 USDC",
                    HashMap::new(),
                    Usd6::from_dollars(80),
                    RECIPIENT,
                    &cancel,
                )
                .await
        });
        let pending = loop {
            let pending = arbiter.pending_requests();
            if !pending.is_empty() {
                break pending;
            }
            tokio::task::yield_now().await;
        };
        arbiter.reject(&pending[0].id, "operator").unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ApprovalError::Rejected { .. }));
        // A second resolution attempt fails.
        assert!(matches!(
            arbiter.approve(&arbiter.audit_log()[0].request_id, "operator"),
            Err(ApprovalError::AlreadyResolved { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_expires() {
        let arbiter = Arc::new(arbiter(threshold_config(75)));
        let cancel = CancellationToken::new();
        let err = arbiter
            .gate(
                "send 80 USDC",
                HashMap::new(),
                Usd6::from_dollars(80),
                RECIPIENT,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Expired { .. }));
        let audit = arbiter.audit_log();
        assert_eq!(audit[0].state, ApprovalState::Expired);
        assert_eq!(audit[0].decider, "timeout");
        // The expired request can no longer be approved.
        assert!(matches!(
            arbiter.approve(&audit[0].request_id, "operator"),
            Err(ApprovalError::AlreadyResolved { .. })
        ));
    }

    #[tokio::test]
    async fn test_gate_cancelled() {
        let arbiter = Arc::new(arbiter(threshold_config(75)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = arbiter
            .gate(
                "send 80 USDC",
                HashMap::new(),
                Usd6::from_dollars(80),
                RECIPIENT,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ApprovalError::Cancelled);
        // The request is still pending and resolvable.
        assert_eq!(arbiter.pending_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_blocked_never_pending() {
        let arbiter = arbiter(threshold_config(75));
        let cancel = CancellationToken::new();
        let err = arbiter
            .gate(
                "send 1 USDC",
                HashMap::new(),
                Usd6::from_dollars(1),
                BLOCKED,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::RecipientBlocked { .. }));
        assert!(arbiter.pending_requests().is_empty());
    }
}
