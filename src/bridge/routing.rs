//! Route selection: filter candidate quotes, score them, recommend one.
//!
//! Scores are computed on four 0-100 components and combined with a weight
//! table keyed by the caller's priority. Scoring runs in `f64`; accounting
//! values never do.

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::BridgeQuote;
use crate::units::Usd6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutePriority {
    #[default]
    Cost,
    Speed,
    Reliability,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutePreferences {
    #[serde(default)]
    pub priority: RoutePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_usd: Option<Usd6>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time_minutes: Option<u64>,
    /// When non-empty, only these protocols are considered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

/// Component scores, each in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub cost: f64,
    pub speed: f64,
    pub reliability: f64,
    pub liquidity: f64,
}

#[derive(Debug, Clone)]
pub struct ScoredRoute {
    pub quote: BridgeQuote,
    pub breakdown: ScoreBreakdown,
    pub score: f64,
}

/// Outcome of route selection: quotes ranked best-first, plus the pick and
/// why.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    pub routes: Vec<ScoredRoute>,
    /// Index into `routes`; `None` when nothing survived filtering.
    pub recommended: Option<usize>,
    pub reason: String,
    /// What the pick saves over the runner-up on the priority dimension,
    /// omitted when negligible.
    pub savings: Option<String>,
}

/// Weight rows: (cost, speed, reliability, liquidity).
fn weights(priority: RoutePriority) -> (f64, f64, f64, f64) {
    match priority {
        RoutePriority::Cost => (0.50, 0.15, 0.25, 0.10),
        RoutePriority::Speed => (0.15, 0.50, 0.25, 0.10),
        RoutePriority::Reliability => (0.20, 0.15, 0.50, 0.15),
    }
}

fn score_quote(
    quote: &BridgeQuote,
    priority: RoutePriority,
    reliability_of: &dyn Fn(&str) -> Option<u8>,
) -> (ScoreBreakdown, f64) {
    let fee = quote.fees.total_usd().as_f64();
    let cost = 100.0 * (1.0 - (fee / 100.0).min(1.0));
    let avg_secs = quote.time.average_secs() as f64;
    let speed = 100.0 * (1.0 - (avg_secs / 3600.0).min(1.0));
    let reliability = f64::from(reliability_of(&quote.protocol).unwrap_or(80)).clamp(0.0, 100.0);
    // Liquidity is a hook for a depth check; everything passes today.
    let liquidity = 100.0;
    let (wc, ws, wr, wl) = weights(priority);
    let total = cost * wc + speed * ws + reliability * wr + liquidity * wl;
    (
        ScoreBreakdown {
            cost,
            speed,
            reliability,
            liquidity,
        },
        total,
    )
}

fn matches_name(list: &[String], name: &str) -> bool {
    list.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// Filter, score, rank, and recommend.
///
/// Ties are deterministic: higher score first, then protocol name
/// lexicographically.
pub fn select_route(
    quotes: Vec<BridgeQuote>,
    preferences: &RoutePreferences,
    reliability_of: &dyn Fn(&str) -> Option<u8>,
) -> RouteSelection {
    let mut routes: Vec<ScoredRoute> = quotes
        .into_iter()
        .filter(|quote| {
            if let Some(max_fee) = preferences.max_fee_usd {
                if quote.fees.total_usd() > max_fee {
                    return false;
                }
            }
            if let Some(max_minutes) = preferences.max_time_minutes {
                if quote.time.max_secs > max_minutes * 60 {
                    return false;
                }
            }
            if matches_name(&preferences.excluded, &quote.protocol) {
                return false;
            }
            if !preferences.preferred.is_empty()
                && !matches_name(&preferences.preferred, &quote.protocol)
            {
                return false;
            }
            true
        })
        .map(|quote| {
            let (breakdown, score) = score_quote(&quote, preferences.priority, reliability_of);
            ScoredRoute {
                quote,
                breakdown,
                score,
            }
        })
        .collect();

    routes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.quote.protocol.cmp(&b.quote.protocol))
    });

    if routes.is_empty() {
        return RouteSelection {
            routes,
            recommended: None,
            reason: "no route matches the given preferences".to_string(),
            savings: None,
        };
    }

    let winner = &routes[0];
    let reason = match preferences.priority {
        RoutePriority::Cost => format!(
            "{} is the cheapest viable route ({} total fees)",
            winner.quote.protocol,
            winner.quote.fees.total_usd()
        ),
        RoutePriority::Speed => format!(
            "{} is the fastest viable route ({})",
            winner.quote.protocol, winner.quote.time.display
        ),
        RoutePriority::Reliability => format!(
            "{} is the most reliable viable route ({:.0}/100)",
            winner.quote.protocol, winner.breakdown.reliability
        ),
    };
    let savings = routes
        .get(1)
        .and_then(|runner_up| savings_over(winner, runner_up, preferences.priority));

    RouteSelection {
        routes,
        recommended: Some(0),
        reason,
        savings,
    }
}

/// Savings of the winner over the runner-up on the priority dimension.
/// Negligible differences ( < $0.01, < 60 s, < 5 points) yield `None`.
fn savings_over(
    winner: &ScoredRoute,
    runner_up: &ScoredRoute,
    priority: RoutePriority,
) -> Option<String> {
    match priority {
        RoutePriority::Cost => {
            let saved = runner_up
                .quote
                .fees
                .total_usd()
                .saturating_sub(winner.quote.fees.total_usd());
            if saved < Usd6::from_cents(1) {
                return None;
            }
            Some(format!("{saved} less than {}", runner_up.quote.protocol))
        }
        RoutePriority::Speed => {
            let saved = runner_up
                .quote
                .time
                .average_secs()
                .saturating_sub(winner.quote.time.average_secs());
            if saved < 60 {
                return None;
            }
            Some(format!(
                "{} min faster than {}",
                saved.div_ceil(60),
                runner_up.quote.protocol
            ))
        }
        RoutePriority::Reliability => {
            let saved = winner.breakdown.reliability - runner_up.breakdown.reliability;
            if saved < 5.0 {
                return None;
            }
            Some(format!(
                "{saved:.0} points more reliable than {}",
                runner_up.quote.protocol
            ))
        }
    }
}
