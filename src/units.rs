//! Fixed-point token amounts and USD normalisation.
//!
//! Every on-chain amount is a non-negative integer interpreted against a
//! per-token `decimals` field; nothing here ever touches floating point.
//! Stablecoin amounts normalise to [`Usd6`], a canonical 6-decimal USD unit
//! used by the limits engine and the bridge router.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use std::fmt;
use std::fmt::Display;

/// Maximum supported token `decimals`.
pub const MAX_DECIMALS: u8 = 36;

/// Number of decimals in the canonical USD accounting unit.
pub const USD_DECIMALS: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    /// The input is not a plain non-negative decimal literal.
    #[error("invalid amount: {0:?}")]
    Invalid(String),
    /// The value does not fit into 256 bits.
    #[error("amount out of range: {0:?}")]
    Overflow(String),
    /// The token declares more decimals than the supported maximum.
    #[error("token decimals {0} exceed the supported maximum of {MAX_DECIMALS}")]
    DecimalsOutOfRange(u8),
}

fn pow10(exp: u8) -> U256 {
    U256::from(10).pow(U256::from(exp))
}

/// Parses a human-readable decimal literal into raw token units.
///
/// Accepts digits with an optional single `.`; commas are stripped
/// (`"1,000.50"`). Scientific notation, signs, empty input and a bare `"."`
/// are rejected. Fractional digits beyond `decimals` are truncated, never
/// rounded.
///
/// # Example
///
/// ```
/// use agentwallet::units::parse_amount;
/// use alloy_primitives::U256;
///
/// let raw = parse_amount("10.50", 6).unwrap();
/// assert_eq!(raw, U256::from(10_500_000u64));
/// ```
pub fn parse_amount(input: &str, decimals: u8) -> Result<U256, AmountParseError> {
    if decimals > MAX_DECIMALS {
        return Err(AmountParseError::DecimalsOutOfRange(decimals));
    }
    let cleaned: String = input.chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() || cleaned == "." {
        return Err(AmountParseError::Invalid(input.to_string()));
    }
    let mut parts = cleaned.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    if frac_part.contains('.') {
        return Err(AmountParseError::Invalid(input.to_string()));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(AmountParseError::Invalid(input.to_string()));
    }

    let mut value = U256::ZERO;
    for c in int_part.chars() {
        let digit = U256::from(c as u64 - '0' as u64);
        value = value
            .checked_mul(U256::from(10))
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| AmountParseError::Overflow(input.to_string()))?;
    }
    value = value
        .checked_mul(pow10(decimals))
        .ok_or_else(|| AmountParseError::Overflow(input.to_string()))?;

    // Truncate fractional digits beyond the token's precision.
    let mut frac = U256::ZERO;
    let kept = frac_part.len().min(decimals as usize);
    for c in frac_part[..kept].chars() {
        frac = frac * U256::from(10) + U256::from(c as u64 - '0' as u64);
    }
    if kept < decimals as usize {
        frac *= pow10(decimals - kept as u8);
    }
    value
        .checked_add(frac)
        .ok_or_else(|| AmountParseError::Overflow(input.to_string()))
}

/// Formats raw token units back into a decimal literal.
///
/// The output never carries a trailing dot or trailing fractional zeros and
/// is always a valid input to [`parse_amount`] for the same `decimals`.
pub fn format_amount(raw: U256, decimals: u8) -> String {
    if decimals == 0 {
        return raw.to_string();
    }
    let digits = raw.to_string();
    let decimals = decimals as usize;
    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits)
    } else {
        digits
    };
    let split = padded.len() - decimals;
    let int_part = &padded[..split];
    let frac_part = padded[split..].trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// An amount in the canonical 6-decimal USD accounting unit.
///
/// `1_000_000` is one dollar. Values saturate at `u128::MAX` on conversion
/// from raw token amounts, which preserves monotonicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Usd6(pub u128);

impl Usd6 {
    pub const ZERO: Usd6 = Usd6(0);

    /// A whole-dollar amount.
    pub const fn from_dollars(dollars: u64) -> Self {
        Usd6(dollars as u128 * 1_000_000)
    }

    /// A whole-cent amount.
    pub const fn from_cents(cents: u64) -> Self {
        Usd6(cents as u128 * 10_000)
    }

    pub fn checked_add(self, rhs: Usd6) -> Option<Usd6> {
        self.0.checked_add(rhs.0).map(Usd6)
    }

    pub fn saturating_add(self, rhs: Usd6) -> Usd6 {
        Usd6(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Usd6) -> Usd6 {
        Usd6(self.0.saturating_sub(rhs.0))
    }

    /// Lossy conversion for scoring and display ratios. Never used for
    /// accounting.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 1e6
    }
}

impl Display for Usd6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capped = i128::try_from(self.0).unwrap_or(i128::MAX);
        let mut value = Decimal::from_i128_with_scale(capped, 6).normalize();
        if value.scale() < 2 {
            value.rescale(2);
        }
        write!(f, "${value}")
    }
}

impl std::str::FromStr for Usd6 {
    type Err = AmountParseError;

    /// Parses a dollar amount such as `"100"`, `"$0.01"` or `"1,000.50"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('$');
        let raw = parse_amount(trimmed, USD_DECIMALS)?;
        Ok(Usd6(
            u128::try_from(raw).map_err(|_| AmountParseError::Overflow(s.to_string()))?,
        ))
    }
}

impl serde::Serialize for Usd6 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_amount(U256::from(self.0), USD_DECIMALS))
    }
}

impl<'de> serde::Deserialize<'de> for Usd6 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalises a raw stablecoin amount to [`Usd6`].
///
/// `raw * 10^(6 - decimals)` when `decimals <= 6`, else integer division by
/// `10^(decimals - 6)` truncating toward zero. Saturates at `u128::MAX`.
pub fn to_usd6(raw: U256, decimals: u8) -> Usd6 {
    let scaled = if decimals <= USD_DECIMALS {
        raw.saturating_mul(pow10(USD_DECIMALS - decimals))
    } else {
        raw / pow10(decimals - USD_DECIMALS)
    };
    Usd6(u128::try_from(scaled).unwrap_or(u128::MAX))
}

/// Converts a USD-6 amount back into raw token units, rounding down.
///
/// Inverse of [`to_usd6`] up to truncation; used to turn remaining USD
/// headroom into a maximum sendable raw amount.
pub fn from_usd6(usd: Usd6, decimals: u8) -> U256 {
    let value = U256::from(usd.0);
    if decimals >= USD_DECIMALS {
        value.saturating_mul(pow10(decimals - USD_DECIMALS))
    } else {
        value / pow10(USD_DECIMALS - decimals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_number() {
        assert_eq!(parse_amount("100", 6).unwrap(), U256::from(100_000_000u64));
    }

    #[test]
    fn test_parse_with_decimals() {
        assert_eq!(parse_amount("1.50", 6).unwrap(), U256::from(1_500_000u64));
    }

    #[test]
    fn test_parse_strips_commas() {
        assert_eq!(
            parse_amount("1,000.25", 6).unwrap(),
            U256::from(1_000_250_000u64)
        );
    }

    #[test]
    fn test_parse_truncates_excess_precision() {
        // The 7th fractional digit is dropped, not rounded.
        assert_eq!(
            parse_amount("1.9999999", 6).unwrap(),
            U256::from(1_999_999u64)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", ".", "1e6", "1E6", "-5", "+5", "1.2.3", "abc", "1.5x"] {
            assert!(parse_amount(bad, 6).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_parse_zero_decimals() {
        assert_eq!(parse_amount("42", 0).unwrap(), U256::from(42u64));
        assert_eq!(parse_amount("42.9", 0).unwrap(), U256::from(42u64));
    }

    #[test]
    fn test_parse_rejects_decimals_out_of_range() {
        assert!(matches!(
            parse_amount("1", 37),
            Err(AmountParseError::DecimalsOutOfRange(37))
        ));
    }

    #[test]
    fn test_format_trims_trailing_zeros() {
        assert_eq!(format_amount(U256::from(10_500_000u64), 6), "10.5");
        assert_eq!(format_amount(U256::from(10_000_000u64), 6), "10");
        assert_eq!(format_amount(U256::ZERO, 6), "0");
        assert_eq!(format_amount(U256::from(1u64), 6), "0.000001");
    }

    #[test]
    fn test_roundtrip_law() {
        // parse(format(x, d), d) == x across decimal bases and magnitudes.
        let samples: &[u128] = &[
            0,
            1,
            999_999,
            1_000_000,
            123_456_789_012_345_678,
            u128::MAX,
        ];
        for &decimals in &[0u8, 2, 6, 18, 36] {
            for &sample in samples {
                let raw = U256::from(sample);
                let text = format_amount(raw, decimals);
                assert_eq!(
                    parse_amount(&text, decimals).unwrap(),
                    raw,
                    "roundtrip failed for {sample} at {decimals} decimals"
                );
            }
        }
        // Beyond u128: a value near 10^(36+18).
        let big = U256::from(10).pow(U256::from(54)) - U256::from(7);
        let text = format_amount(big, 36);
        assert_eq!(parse_amount(&text, 36).unwrap(), big);
    }

    #[test]
    fn test_to_usd6_shift_up() {
        // 2-decimal token: $12.34 -> 12_340_000.
        assert_eq!(to_usd6(U256::from(1_234u64), 2), Usd6(12_340_000));
    }

    #[test]
    fn test_to_usd6_truncates_down() {
        // 18-decimal token: 1.9999999... truncates toward zero at 6 decimals.
        let raw = U256::from(1_999_999_999_999_999_999u128);
        assert_eq!(to_usd6(raw, 18), Usd6(1_999_999));
    }

    #[test]
    fn test_to_usd6_monotonic() {
        let pairs = [(0u64, 1u64), (999_999, 1_000_000), (5, 500)];
        for decimals in [2u8, 6, 18] {
            for (a, b) in pairs {
                assert!(to_usd6(U256::from(a), decimals) <= to_usd6(U256::from(b), decimals));
            }
        }
    }

    #[test]
    fn test_from_usd6_rounds_down() {
        // $1.50 in a 0-decimal token is 1 unit.
        assert_eq!(from_usd6(Usd6(1_500_000), 0), U256::from(1u64));
        assert_eq!(from_usd6(Usd6(1_500_000), 6), U256::from(1_500_000u64));
        assert_eq!(
            from_usd6(Usd6(1_500_000), 18),
            U256::from(1_500_000_000_000_000_000u128)
        );
    }

    #[test]
    fn test_usd6_parse() {
        assert_eq!("100".parse::<Usd6>().unwrap(), Usd6::from_dollars(100));
        assert_eq!("$0.01".parse::<Usd6>().unwrap(), Usd6::from_cents(1));
        assert_eq!("1,000.50".parse::<Usd6>().unwrap(), Usd6(1_000_500_000));
        assert!("nope".parse::<Usd6>().is_err());
    }

    #[test]
    fn test_usd6_serde() {
        let json = serde_json::to_string(&Usd6(1_500_000)).unwrap();
        assert_eq!(json, "\"1.5\"");
        let back: Usd6 = serde_json::from_str("\"250.75\"").unwrap();
        assert_eq!(back, Usd6(250_750_000));
    }

    #[test]
    fn test_usd6_display() {
        assert_eq!(Usd6::from_dollars(12).to_string(), "$12.00");
        assert_eq!(Usd6(12_340_000).to_string(), "$12.34");
        assert_eq!(Usd6(1).to_string(), "$0.000001");
        assert_eq!(Usd6::ZERO.to_string(), "$0.00");
    }
}
