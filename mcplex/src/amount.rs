//! Human-readable currency amounts and markup arithmetic.
//!
//! Prices throughout the gateway are dollar strings such as `"$0.01"`.
//! [`Money`] parses and renders those strings, converts them to atomic
//! USDC units (6 decimals), and supports the fixed/percent markup math
//! used when the gateway re-prices a paid upstream for its own clients.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of decimals in the USDC token (1 USDC = 10⁶ atomic units).
pub const USDC_DECIMALS: u32 = 6;

/// Atomic-unit string used when a price cannot be parsed ($0.01).
pub const FALLBACK_ATOMIC_UNITS: &str = "10000";

/// Errors produced while parsing amounts or markups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The string was not a recognizable dollar amount.
    #[error("invalid money amount: {0:?}")]
    InvalidMoney(String),
    /// The string was not a recognizable markup (`"20%"` or `"$0.05"`).
    #[error("invalid markup: {0:?}")]
    InvalidMarkup(String),
    /// Negative amounts are never valid prices.
    #[error("negative amount: {0:?}")]
    Negative(String),
}

/// A non-negative dollar amount.
///
/// Parsed from strings like `"$0.01"`, `"0.10"`, or `"free"` (zero).
/// Serialized back as a `$`-prefixed string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Money(Decimal);

impl Money {
    /// The zero amount.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Creates a money value from a raw decimal.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Negative`] for negative inputs.
    pub fn from_decimal(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() {
            return Err(AmountError::Negative(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Returns the underlying decimal dollar value.
    #[must_use]
    pub const fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Returns `true` for a zero amount.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Converts to atomic USDC units: `floor(dollars × 10⁶)` rendered as a
    /// decimal string with no leading zeros (`"$0.01"` → `"10000"`).
    #[must_use]
    pub fn atomic_units(&self) -> String {
        let scaled = (self.0 * Decimal::from(10u64.pow(USDC_DECIMALS))).trunc();
        scaled.to_u128().map_or_else(
            || FALLBACK_ATOMIC_UNITS.to_owned(),
            |units| units.to_string(),
        )
    }

    /// Renders with exactly six fractional digits, e.g. `"$0.120000"`.
    ///
    /// This is the format used for client-facing marked-up prices.
    #[must_use]
    pub fn format_six(&self) -> String {
        format!("${:.6}", self.0)
    }
}

impl FromStr for Money {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("free") {
            return Ok(Self::ZERO);
        }
        let bare = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
        let value = Decimal::from_str(bare)
            .map_err(|_| AmountError::InvalidMoney(s.to_owned()))?;
        if value.is_sign_negative() {
            return Err(AmountError::Negative(s.to_owned()));
        }
        Ok(Self(value))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Lenient conversion of a dollar string to atomic USDC units.
///
/// Malformed input falls back to [`FALLBACK_ATOMIC_UNITS`] ($0.01), which
/// is the wire behavior expected by payment challenges.
#[must_use]
pub fn atomic(money: &str) -> String {
    money
        .parse::<Money>()
        .map_or_else(|_| FALLBACK_ATOMIC_UNITS.to_owned(), |m| m.atomic_units())
}

/// A markup applied by the gateway on top of a downstream price.
///
/// Either a percentage (`"20%"`) or a fixed dollar surcharge (`"$0.05"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Markup {
    /// Percentage markup; `Percent(20)` means × 1.20.
    Percent(Decimal),
    /// Fixed dollar amount added to the downstream price.
    Fixed(Money),
}

impl FromStr for Markup {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(pct) = trimmed.strip_suffix('%') {
            let value = Decimal::from_str(pct.trim())
                .map_err(|_| AmountError::InvalidMarkup(s.to_owned()))?;
            if value.is_sign_negative() {
                return Err(AmountError::Negative(s.to_owned()));
            }
            return Ok(Self::Percent(value));
        }
        trimmed
            .parse::<Money>()
            .map(Self::Fixed)
            .map_err(|_| AmountError::InvalidMarkup(s.to_owned()))
    }
}

impl fmt::Display for Markup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(p) => write!(f, "{p}%"),
            Self::Fixed(m) => write!(f, "{m}"),
        }
    }
}

impl Serialize for Markup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Markup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Computes the client-facing price for a marked-up upstream.
///
/// Percent markup `"20%"` yields `downstream × 1.20`; fixed markup
/// `"$0.05"` yields `downstream + 0.05`. The result is rounded to six
/// decimal places (USDC precision).
#[must_use]
pub fn compute_markup_price(downstream: Money, markup: &Markup) -> Money {
    let raw = match markup {
        Markup::Percent(pct) => {
            downstream.as_decimal() * (Decimal::ONE + pct / Decimal::ONE_HUNDRED)
        }
        Markup::Fixed(fixed) => downstream.as_decimal() + fixed.as_decimal(),
    };
    Money(raw.round_dp(USDC_DECIMALS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dollar_strings() {
        assert_eq!("$0.01".parse::<Money>().unwrap().atomic_units(), "10000");
        assert_eq!("0.10".parse::<Money>().unwrap().atomic_units(), "100000");
        assert_eq!("$1".parse::<Money>().unwrap().atomic_units(), "1000000");
        assert_eq!("free".parse::<Money>().unwrap(), Money::ZERO);
        assert_eq!("$0.00".parse::<Money>().unwrap(), Money::ZERO);
    }

    #[test]
    fn rejects_garbage_and_negatives() {
        assert!("abc".parse::<Money>().is_err());
        assert!("$-1".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
    }

    #[test]
    fn atomic_floors_sub_unit_precision() {
        // One atomic unit is $0.000001; anything below floors away.
        assert_eq!("$0.0000019".parse::<Money>().unwrap().atomic_units(), "1");
        assert_eq!("$0.0000001".parse::<Money>().unwrap().atomic_units(), "0");
    }

    #[test]
    fn lenient_atomic_defaults_on_malformed_input() {
        assert_eq!(atomic("$0.01"), "10000");
        assert_eq!(atomic("not a price"), FALLBACK_ATOMIC_UNITS);
        assert_eq!(atomic(""), FALLBACK_ATOMIC_UNITS);
        assert_eq!(atomic("0"), "0");
    }

    #[test]
    fn percent_markup() {
        let downstream: Money = "$0.10".parse().unwrap();
        let markup: Markup = "20%".parse().unwrap();
        assert_eq!(
            compute_markup_price(downstream, &markup).format_six(),
            "$0.120000"
        );
    }

    #[test]
    fn fixed_markup() {
        let downstream: Money = "$0.10".parse().unwrap();
        let markup: Markup = "$0.05".parse().unwrap();
        assert_eq!(
            compute_markup_price(downstream, &markup).format_six(),
            "$0.150000"
        );
    }

    #[test]
    fn markup_rounds_to_six_decimals() {
        let downstream: Money = "$0.0000015".parse().unwrap();
        let markup: Markup = "10%".parse().unwrap();
        // 0.00000165 rounds to 0.000002 at 6 dp (banker's rounding midpoint-free here).
        assert_eq!(
            compute_markup_price(downstream, &markup).format_six(),
            "$0.000002"
        );
    }

    #[test]
    fn money_serde_round_trip() {
        let m: Money = "$0.25".parse().unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"$0.25\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
