//! Windowed spending limits and the emergency stop.
//!
//! All checks operate on USD-normalised amounts ([`Usd6`]). Spending records
//! are append-only; a record is committed once the RPC has accepted the
//! transaction, never mutated afterwards, and garbage-collected only once it
//! falls out of the longest configured window.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Mutex;
use std::time::Duration;

use crate::networks::TokenDescriptor;
use crate::timestamp::TimestampMs;
use crate::units::{Usd6, from_usd6, to_usd6};

/// Rolling accounting windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitWindow {
    Hour,
    Day,
    Week,
}

impl LimitWindow {
    pub fn duration(&self) -> Duration {
        match self {
            LimitWindow::Hour => Duration::from_secs(3_600),
            LimitWindow::Day => Duration::from_secs(86_400),
            LimitWindow::Week => Duration::from_secs(604_800),
        }
    }

    fn duration_ms(&self) -> u64 {
        self.duration().as_millis() as u64
    }
}

impl Display for LimitWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LimitWindow::Hour => "hour",
            LimitWindow::Day => "day",
            LimitWindow::Week => "week",
        };
        write!(f, "{name}")
    }
}

/// What kind of value movement a record accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendKind {
    Send,
    Bridge,
}

/// One committed spend.
#[derive(Debug, Clone)]
pub struct SpendingRecord {
    pub token_symbol: String,
    pub raw_amount: U256,
    pub usd: Usd6,
    pub at: TimestampMs,
    pub kind: SpendKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyStopConfig {
    /// Native balance floor (wei). Falling below engages the stop.
    pub min_balance_required: U256,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeLimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_transaction_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day_usd: Option<Usd6>,
    /// Destination chain ids a bridge may target. `None` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_destinations: Option<BTreeSet<u64>>,
}

/// Swap limits are carried for configuration completeness; swap execution
/// itself lives outside this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwapLimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_transaction_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slippage_bps: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_transaction_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_week_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency_stop: Option<EmergencyStopConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeLimitsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<SwapLimitsConfig>,
}

impl LimitsConfig {
    fn windows_for(&self, kind: SpendKind) -> Vec<(LimitWindow, Usd6)> {
        match kind {
            SpendKind::Send => [
                (LimitWindow::Hour, self.per_hour_usd),
                (LimitWindow::Day, self.per_day_usd),
                (LimitWindow::Week, self.per_week_usd),
            ]
            .into_iter()
            .filter_map(|(w, limit)| limit.map(|l| (w, l)))
            .collect(),
            SpendKind::Bridge => self
                .bridge
                .as_ref()
                .and_then(|b| b.per_day_usd)
                .map(|l| vec![(LimitWindow::Day, l)])
                .unwrap_or_default(),
        }
    }

    fn per_transaction_for(&self, kind: SpendKind) -> Option<Usd6> {
        match kind {
            SpendKind::Send => self.per_transaction_usd,
            SpendKind::Bridge => self.bridge.as_ref().and_then(|b| b.per_transaction_usd),
        }
    }

    /// Horizon past which records can never influence a check again.
    fn retention_ms(&self) -> u64 {
        let configured = [
            self.per_hour_usd.map(|_| LimitWindow::Hour),
            self.per_day_usd.map(|_| LimitWindow::Day),
            self.per_week_usd.map(|_| LimitWindow::Week),
            self.bridge
                .as_ref()
                .and_then(|b| b.per_day_usd)
                .map(|_| LimitWindow::Day),
        ]
        .into_iter()
        .flatten()
        .map(|w| w.duration_ms())
        .max();
        configured.unwrap_or_else(|| LimitWindow::Week.duration_ms())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitsError {
    #[error("emergency stop engaged; spending is disabled until it is cleared")]
    EmergencyStopEngaged,
    #[error("per-transaction limit exceeded: {amount} + {gas} gas > {limit}")]
    PerTransactionExceeded {
        amount: Usd6,
        gas: Usd6,
        limit: Usd6,
    },
    #[error("{window} window exceeded: {used} already spent of {limit}")]
    WindowExceeded {
        window: LimitWindow,
        used: Usd6,
        limit: Usd6,
        resets_at: TimestampMs,
    },
}

impl LimitsError {
    /// A caller-facing suggestion for getting the action through.
    pub fn remediation(&self) -> String {
        match self {
            LimitsError::EmergencyStopEngaged => {
                "top up the native balance and clear the emergency stop".to_string()
            }
            LimitsError::PerTransactionExceeded { gas, limit, .. } => {
                let headroom = limit.saturating_sub(*gas);
                format!("reduce amount to at most {headroom}")
            }
            LimitsError::WindowExceeded {
                used,
                limit,
                resets_at,
                ..
            } => {
                let headroom = limit.saturating_sub(*used);
                format!("reduce amount to at most {headroom}, or wait until {resets_at}")
            }
        }
    }
}

#[derive(Debug, Default)]
struct LimitsState {
    records: VecDeque<SpendingRecord>,
    stopped: bool,
}

/// The spending-limit engine. One instance per wallet, shared behind `Arc`.
#[derive(Debug)]
pub struct LimitsEngine {
    config: LimitsConfig,
    state: Mutex<LimitsState>,
}

impl LimitsEngine {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimitsState::default()),
        }
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// Check a candidate spend without committing anything.
    ///
    /// Gas counts against the per-transaction ceiling only, never against
    /// windowed usage. Returns the USD-normalised amount on success.
    pub fn check(
        &self,
        raw_amount: U256,
        token: &TokenDescriptor,
        gas_usd: Usd6,
        kind: SpendKind,
    ) -> Result<Usd6, LimitsError> {
        self.check_at(raw_amount, token, gas_usd, kind, TimestampMs::now())
    }

    pub fn check_at(
        &self,
        raw_amount: U256,
        token: &TokenDescriptor,
        gas_usd: Usd6,
        kind: SpendKind,
        now: TimestampMs,
    ) -> Result<Usd6, LimitsError> {
        let amount_usd = to_usd6(raw_amount, token.decimals);
        self.check_usd_at(amount_usd, gas_usd, kind, now)?;
        Ok(amount_usd)
    }

    /// Check an already USD-normalised amount. Used directly for native
    /// transfers, whose USD value comes from an external quote.
    pub fn check_usd_at(
        &self,
        amount_usd: Usd6,
        gas_usd: Usd6,
        kind: SpendKind,
        now: TimestampMs,
    ) -> Result<(), LimitsError> {
        let state = self.state.lock().expect("limits lock poisoned");
        if state.stopped {
            return Err(LimitsError::EmergencyStopEngaged);
        }

        if let Some(limit) = self.config.per_transaction_for(kind) {
            if amount_usd.saturating_add(gas_usd) > limit {
                return Err(LimitsError::PerTransactionExceeded {
                    amount: amount_usd,
                    gas: gas_usd,
                    limit,
                });
            }
        }

        for (window, limit) in self.config.windows_for(kind) {
            let cutoff = now.saturating_sub_millis(window.duration_ms());
            let mut used = Usd6::ZERO;
            let mut oldest: Option<TimestampMs> = None;
            for record in state.records.iter() {
                if record.kind == kind && record.at >= cutoff {
                    used = used.saturating_add(record.usd);
                    oldest = Some(oldest.map_or(record.at, |o: TimestampMs| o.min(record.at)));
                }
            }
            if used.saturating_add(amount_usd) > limit {
                let resets_at = oldest
                    .map(|o| TimestampMs(o.0 + window.duration_ms()))
                    .unwrap_or(now);
                return Err(LimitsError::WindowExceeded {
                    window,
                    used,
                    limit,
                    resets_at,
                });
            }
        }
        Ok(())
    }

    /// Commit a spend. Also garbage-collects records past the retention
    /// horizon; committed records are never otherwise touched.
    pub fn record(&self, raw_amount: U256, token: &TokenDescriptor, kind: SpendKind) {
        self.record_at(raw_amount, token, kind, TimestampMs::now());
    }

    pub fn record_at(
        &self,
        raw_amount: U256,
        token: &TokenDescriptor,
        kind: SpendKind,
        now: TimestampMs,
    ) {
        self.record_usd_at(
            &token.symbol,
            raw_amount,
            to_usd6(raw_amount, token.decimals),
            kind,
            now,
        );
    }

    /// Commit a spend whose USD value was computed externally.
    pub fn record_usd_at(
        &self,
        token_symbol: &str,
        raw_amount: U256,
        usd: Usd6,
        kind: SpendKind,
        now: TimestampMs,
    ) {
        let mut state = self.state.lock().expect("limits lock poisoned");
        let cutoff = now.saturating_sub_millis(self.config.retention_ms());
        while state.records.front().is_some_and(|r| r.at < cutoff) {
            state.records.pop_front();
        }
        state.records.push_back(SpendingRecord {
            token_symbol: token_symbol.to_string(),
            raw_amount,
            usd,
            at: now,
            kind,
        });
    }

    /// USD spent within the window ending at `now`.
    pub fn spent_in_window(&self, window: LimitWindow, kind: SpendKind, now: TimestampMs) -> Usd6 {
        let state = self.state.lock().expect("limits lock poisoned");
        let cutoff = now.saturating_sub_millis(window.duration_ms());
        state
            .records
            .iter()
            .filter(|r| r.kind == kind && r.at >= cutoff)
            .fold(Usd6::ZERO, |acc, r| acc.saturating_add(r.usd))
    }

    /// The largest raw amount of `token` the send limits currently allow,
    /// or `None` when no send limit is configured.
    pub fn max_sendable(&self, token: &TokenDescriptor) -> Option<U256> {
        self.max_sendable_at(token, TimestampMs::now())
    }

    pub fn max_sendable_at(&self, token: &TokenDescriptor, now: TimestampMs) -> Option<U256> {
        let mut headroom: Option<Usd6> = self.config.per_transaction_usd;
        for (window, limit) in self.config.windows_for(SpendKind::Send) {
            let used = self.spent_in_window(window, SpendKind::Send, now);
            let remaining = limit.saturating_sub(used);
            headroom = Some(headroom.map_or(remaining, |h| h.min(remaining)));
        }
        headroom.map(|usd| from_usd6(usd, token.decimals))
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("limits lock poisoned").stopped
    }

    /// Engage the stop if the sender's native balance fell below the
    /// configured floor. Returns whether the engine is stopped afterwards.
    pub fn check_native_balance(&self, balance: U256) -> bool {
        let mut state = self.state.lock().expect("limits lock poisoned");
        if let Some(stop) = &self.config.emergency_stop {
            if balance < stop.min_balance_required && !state.stopped {
                tracing::warn!(
                    %balance,
                    required = %stop.min_balance_required,
                    "native balance below floor, engaging emergency stop"
                );
                state.stopped = true;
            }
        }
        state.stopped
    }

    pub fn engage_stop(&self) {
        self.state.lock().expect("limits lock poisoned").stopped = true;
    }

    /// Operator-gated: the stop never clears on its own.
    pub fn clear_stop(&self) {
        let mut state = self.state.lock().expect("limits lock poisoned");
        if state.stopped {
            tracing::info!("emergency stop cleared");
            state.stopped = false;
        }
    }

    pub fn records(&self) -> Vec<SpendingRecord> {
        self.state
            .lock()
            .expect("limits lock poisoned")
            .records
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::TokenRegistry;
    use std::sync::Arc;

    fn usdc() -> Arc<TokenDescriptor> {
        TokenRegistry::builtin().unwrap().get("USDC").unwrap()
    }

    fn usdc_raw(dollars: u64) -> U256 {
        U256::from(dollars) * U256::from(1_000_000u64)
    }

    fn engine(config: LimitsConfig) -> LimitsEngine {
        LimitsEngine::new(config)
    }

    fn scenario_config() -> LimitsConfig {
        LimitsConfig {
            per_transaction_usd: Some(Usd6::from_dollars(100)),
            per_hour_usd: Some(Usd6::from_dollars(500)),
            per_day_usd: Some(Usd6::from_dollars(2_000)),
            ..Default::default()
        }
    }

    #[test]
    fn test_within_limits() {
        let engine = engine(scenario_config());
        let now = TimestampMs(1_000_000);
        let usd = engine
            .check_at(usdc_raw(50), &usdc(), Usd6::ZERO, SpendKind::Send, now)
            .unwrap();
        assert_eq!(usd, Usd6::from_dollars(50));
        engine.record_at(usdc_raw(50), &usdc(), SpendKind::Send, now);
        assert_eq!(
            engine.spent_in_window(LimitWindow::Hour, SpendKind::Send, now),
            Usd6::from_dollars(50)
        );
        assert_eq!(
            engine.spent_in_window(LimitWindow::Day, SpendKind::Send, now),
            Usd6::from_dollars(50)
        );
    }

    #[test]
    fn test_per_transaction_includes_gas() {
        let engine = engine(scenario_config());
        let now = TimestampMs(1_000_000);
        // $99 + $2 gas breaches the $100 ceiling.
        let err = engine
            .check_at(
                usdc_raw(99),
                &usdc(),
                Usd6::from_dollars(2),
                SpendKind::Send,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, LimitsError::PerTransactionExceeded { .. }));
        assert!(err.remediation().contains("$98"));
    }

    #[test]
    fn test_hour_window_exceeded() {
        let engine = engine(scenario_config());
        let token = usdc();
        let now = TimestampMs(10 * 3_600_000);
        // Prior sends in the same hour totalling $450.
        engine.record_at(usdc_raw(100), &token, SpendKind::Send, TimestampMs(now.0 - 3_000_000));
        engine.record_at(usdc_raw(100), &token, SpendKind::Send, TimestampMs(now.0 - 2_000_000));
        engine.record_at(usdc_raw(100), &token, SpendKind::Send, TimestampMs(now.0 - 1_500_000));
        engine.record_at(usdc_raw(100), &token, SpendKind::Send, TimestampMs(now.0 - 1_000_000));
        engine.record_at(usdc_raw(50), &token, SpendKind::Send, TimestampMs(now.0 - 500_000));

        let err = engine
            .check_at(usdc_raw(51), &token, Usd6::ZERO, SpendKind::Send, now)
            .unwrap_err();
        match err {
            LimitsError::WindowExceeded {
                window,
                used,
                limit,
                resets_at,
            } => {
                assert_eq!(window, LimitWindow::Hour);
                assert_eq!(used, Usd6::from_dollars(450));
                assert_eq!(limit, Usd6::from_dollars(500));
                // Oldest in-window record plus one hour.
                assert_eq!(resets_at, TimestampMs(now.0 - 3_000_000 + 3_600_000));
            }
            other => panic!("expected WindowExceeded, got {other:?}"),
        }
        // A $50 send still fits.
        assert!(
            engine
                .check_at(usdc_raw(50), &token, Usd6::ZERO, SpendKind::Send, now)
                .is_ok()
        );
    }

    #[test]
    fn test_check_is_idempotent() {
        let engine = engine(scenario_config());
        let now = TimestampMs(1_000_000);
        let first = engine.check_at(usdc_raw(80), &usdc(), Usd6::ZERO, SpendKind::Send, now);
        let second = engine.check_at(usdc_raw(80), &usdc(), Usd6::ZERO, SpendKind::Send, now);
        assert_eq!(first, second);
    }

    #[test]
    fn test_commit_reduces_remaining_exactly() {
        let engine = engine(scenario_config());
        let token = usdc();
        let now = TimestampMs(1_000_000);
        let before = engine.max_sendable_at(&token, now).unwrap();
        engine.record_at(usdc_raw(30), &token, SpendKind::Send, now);
        let after = engine.max_sendable_at(&token, now).unwrap();
        // Headroom was per-tx bound ($100); window headroom shrank by $30
        // but stays above per-tx, so max sendable is unchanged here.
        assert_eq!(before, after);
        assert_eq!(
            engine.spent_in_window(LimitWindow::Hour, SpendKind::Send, now),
            Usd6::from_dollars(30)
        );
    }

    #[test]
    fn test_max_sendable_window_bound() {
        let config = LimitsConfig {
            per_transaction_usd: Some(Usd6::from_dollars(1_000)),
            per_hour_usd: Some(Usd6::from_dollars(500)),
            ..Default::default()
        };
        let engine = engine(config);
        let token = usdc();
        let now = TimestampMs(1_000_000);
        engine.record_at(usdc_raw(450), &token, SpendKind::Send, now);
        assert_eq!(
            engine.max_sendable_at(&token, now).unwrap(),
            usdc_raw(50),
        );
    }

    #[test]
    fn test_unlimited_when_unconfigured() {
        let engine = engine(LimitsConfig::default());
        assert_eq!(engine.max_sendable(&usdc()), None);
        assert!(
            engine
                .check(usdc_raw(1_000_000), &usdc(), Usd6::ZERO, SpendKind::Send)
                .is_ok()
        );
    }

    #[test]
    fn test_bridge_limits_separate_from_send() {
        let config = LimitsConfig {
            per_hour_usd: Some(Usd6::from_dollars(100)),
            bridge: Some(BridgeLimitsConfig {
                per_transaction_usd: Some(Usd6::from_dollars(500)),
                per_day_usd: Some(Usd6::from_dollars(1_000)),
                allowed_destinations: None,
            }),
            ..Default::default()
        };
        let engine = engine(config);
        let token = usdc();
        let now = TimestampMs(1_000_000);
        // A $400 bridge passes even though the send hour limit is $100.
        assert!(
            engine
                .check_at(usdc_raw(400), &token, Usd6::ZERO, SpendKind::Bridge, now)
                .is_ok()
        );
        engine.record_at(usdc_raw(400), &token, SpendKind::Bridge, now);
        engine.record_at(usdc_raw(400), &token, SpendKind::Bridge, now);
        // Bridge day window now holds $800; $300 more breaches $1000.
        let err = engine
            .check_at(usdc_raw(300), &token, Usd6::ZERO, SpendKind::Bridge, now)
            .unwrap_err();
        assert!(matches!(
            err,
            LimitsError::WindowExceeded {
                window: LimitWindow::Day,
                ..
            }
        ));
        // Send accounting saw none of it.
        assert_eq!(
            engine.spent_in_window(LimitWindow::Hour, SpendKind::Send, now),
            Usd6::ZERO
        );
    }

    #[test]
    fn test_emergency_stop() {
        let config = LimitsConfig {
            emergency_stop: Some(EmergencyStopConfig {
                min_balance_required: U256::from(1_000_000u64),
            }),
            ..Default::default()
        };
        let engine = engine(config);
        assert!(!engine.check_native_balance(U256::from(2_000_000u64)));
        assert!(engine.check_native_balance(U256::from(999u64)));
        let err = engine
            .check(usdc_raw(1), &usdc(), Usd6::ZERO, SpendKind::Send)
            .unwrap_err();
        assert_eq!(err, LimitsError::EmergencyStopEngaged);
        // Recovered balance alone does not clear the stop.
        assert!(engine.check_native_balance(U256::from(2_000_000u64)));
        engine.clear_stop();
        assert!(!engine.is_stopped());
    }

    #[test]
    fn test_gc_respects_longest_window() {
        let config = LimitsConfig {
            per_hour_usd: Some(Usd6::from_dollars(100)),
            per_week_usd: Some(Usd6::from_dollars(1_000)),
            ..Default::default()
        };
        let engine = engine(config);
        let token = usdc();
        let day_ms = 86_400_000u64;
        let start = TimestampMs(10 * day_ms);
        engine.record_at(usdc_raw(10), &token, SpendKind::Send, start);
        // Two days later: out of the hour window, still in the week window.
        let later = TimestampMs(start.0 + 2 * day_ms);
        engine.record_at(usdc_raw(10), &token, SpendKind::Send, later);
        assert_eq!(engine.records().len(), 2);
        // Eight days after the first record it ages out of retention.
        let week_later = TimestampMs(start.0 + 8 * day_ms);
        engine.record_at(usdc_raw(10), &token, SpendKind::Send, week_later);
        assert_eq!(engine.records().len(), 2);
    }
}
