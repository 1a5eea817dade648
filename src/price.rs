// =============================================================================
// Price Codec — decimal strings <-> fixed-point integers (scale 10^8)
// =============================================================================
//
// OKX transmits every price and size as a decimal string.  We store them as
// `i64` scaled by 10^8.  Parsing scales the decimal digits directly in integer
// arithmetic, so no value ever passes through an `f64` on its way to storage.
// Digits beyond the eighth fractional place are truncated toward zero.
// =============================================================================

use std::fmt;
use std::ops::{Add, Sub};

use crate::error::PriceError;

/// Number of fractional digits carried by [`Price`].
pub const DECIMALS: usize = 8;

/// Fixed-point scale factor (10^8).
pub const SCALE: i64 = 100_000_000;

/// A price, size or volume in fixed-point representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(i64);

impl Price {
    /// Wrap an already-scaled raw value (e.g. read back from the database).
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// The scaled integer as stored.
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Parse a decimal string such as `"97338.7"` or `"-0.00000001"`.
    pub fn parse(text: &str) -> Result<Self, PriceError> {
        let malformed = || PriceError::Parse {
            input: text.to_string(),
        };
        let overflow = || PriceError::Overflow {
            input: text.to_string(),
        };

        let s = text.trim();
        let (negative, unsigned) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(malformed());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(malformed());
        }

        let mut value: i64 = 0;
        for b in int_part.bytes() {
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(b - b'0')))
                .ok_or_else(overflow)?;
        }
        value = value.checked_mul(SCALE).ok_or_else(overflow)?;

        let kept = &frac_part[..frac_part.len().min(DECIMALS)];
        let mut frac: i64 = 0;
        for b in kept.bytes() {
            frac = frac * 10 + i64::from(b - b'0');
        }
        for _ in kept.len()..DECIMALS {
            frac *= 10;
        }
        value = value.checked_add(frac).ok_or_else(overflow)?;

        Ok(Self(if negative { -value } else { value }))
    }

    pub fn checked_add(self, other: Price) -> Result<Price, PriceError> {
        self.0
            .checked_add(other.0)
            .map(Price)
            .ok_or(PriceError::ArithmeticOverflow)
    }

    pub fn checked_sub(self, other: Price) -> Result<Price, PriceError> {
        self.0
            .checked_sub(other.0)
            .map(Price)
            .ok_or(PriceError::ArithmeticOverflow)
    }

    /// Multiply by an integer factor.
    pub fn multiply(self, factor: i64) -> Result<Price, PriceError> {
        self.0
            .checked_mul(factor)
            .map(Price)
            .ok_or(PriceError::ArithmeticOverflow)
    }

    /// Integer division by `divisor`, truncating toward zero.
    pub fn divide(self, divisor: i64) -> Result<Price, PriceError> {
        if divisor == 0 {
            return Err(PriceError::DivisionByZero);
        }
        self.0
            .checked_div(divisor)
            .map(Price)
            .ok_or(PriceError::ArithmeticOverflow)
    }

    /// Display-only conversion. Never use the result for stored or compared
    /// values.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }
}

impl Add for Price {
    type Output = Price;

    fn add(self, rhs: Price) -> Price {
        Price(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Price;

    fn sub(self, rhs: Price) -> Price {
        Price(self.0 - rhs.0)
    }
}

impl std::str::FromStr for Price {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Price::parse(s)
    }
}

/// Exact decimal rendering with trailing zeros trimmed (`97338.7`, `95680`).
impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = SCALE as u64;
        let int_part = abs / scale;
        let frac_part = abs % scale;
        if frac_part == 0 {
            return write!(f, "{sign}{int_part}");
        }
        let frac = format!("{frac_part:0width$}", width = DECIMALS);
        write!(f, "{sign}{int_part}.{}", frac.trim_end_matches('0'))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_representative_exchange_values() {
        assert_eq!(Price::parse("97338.7").unwrap().raw(), 9_733_870_000_000);
        assert_eq!(Price::parse("95680").unwrap().raw(), 9_568_000_000_000);
        assert_eq!(Price::parse("3706.88063172").unwrap().raw(), 370_688_063_172);
        assert_eq!(Price::parse("0.00000001").unwrap().raw(), 1);
        assert_eq!(Price::parse(".5").unwrap().raw(), 50_000_000);
        assert_eq!(Price::parse("-1.25").unwrap().raw(), -125_000_000);
    }

    #[test]
    fn round_trip_within_tolerance() {
        for s in ["97338.7", "102074.2", "6877.12302248", "0.1", "28649.09520794"] {
            let expected: f64 = s.parse().unwrap();
            let got = Price::parse(s).unwrap().to_f64();
            assert!((got - expected).abs() <= 1e-8, "{s}: {got} vs {expected}");
        }
    }

    #[test]
    fn extra_fraction_digits_truncate() {
        // 358669057.793862051 has nine fractional digits.
        let p = Price::parse("358669057.793862051").unwrap();
        assert_eq!(p.raw(), 35_866_905_779_386_205);
    }

    #[test]
    fn exact_scaling_beats_float_multiplication() {
        // 0.29 * 1e8 in f64 is 28999999.999999996.
        assert_eq!(Price::parse("0.29").unwrap().raw(), 29_000_000);
    }

    #[test]
    fn malformed_text_is_rejected() {
        for bad in ["", ".", "abc", "1.2.3", "12a", "--1", "1e5", " - "] {
            assert!(
                matches!(Price::parse(bad), Err(PriceError::Parse { .. })),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(matches!(
            Price::parse("92233720369"),
            Err(PriceError::Overflow { .. })
        ));
        assert!(matches!(
            Price::parse("99999999999999999999"),
            Err(PriceError::Overflow { .. })
        ));
    }

    #[test]
    fn arithmetic_is_exact() {
        let a = Price::parse("0.1").unwrap();
        let b = Price::parse("0.2").unwrap();
        assert_eq!(a + b, Price::parse("0.3").unwrap());
        assert_eq!(b - a, a);
        assert_eq!(a.multiply(3).unwrap(), Price::parse("0.3").unwrap());
        assert_eq!(Price::parse("1").unwrap().divide(4).unwrap().raw(), 25_000_000);
        assert_eq!(a.checked_add(b).unwrap().raw(), 30_000_000);
    }

    #[test]
    fn divide_by_zero_fails() {
        assert_eq!(
            Price::parse("1").unwrap().divide(0),
            Err(PriceError::DivisionByZero)
        );
    }

    #[test]
    fn overflowing_arithmetic_is_reported() {
        let max = Price::from_raw(i64::MAX);
        assert_eq!(max.multiply(2), Err(PriceError::ArithmeticOverflow));
        assert_eq!(
            max.checked_add(Price::from_raw(1)),
            Err(PriceError::ArithmeticOverflow)
        );
    }

    #[test]
    fn display_is_exact_and_trimmed() {
        assert_eq!(Price::parse("97338.70").unwrap().to_string(), "97338.7");
        assert_eq!(Price::parse("95680").unwrap().to_string(), "95680");
        assert_eq!(Price::parse("-0.00000001").unwrap().to_string(), "-0.00000001");
    }
}
