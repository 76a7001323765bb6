//! Fixed-point money type.
//!
//! # Motivation
//!
//! Every monetary amount in the engine (booking values, earnings, payouts,
//! invoice totals) is a `rust_decimal::Decimal` quantised to two decimal
//! places (minor units). Passing a bare `Decimal` around for money is
//! error-prone: it mixes freely with rates (unbounded scale) and lets an
//! unrounded product leak into storage.
//!
//! `Money` wraps the `Decimal` so the type system prevents:
//! - Implicit construction from a raw `Decimal` (no `From<Decimal>` impl).
//! - Storing an amount with more than two decimal places.
//!
//! # Rounding
//!
//! Quantisation is **half-up** (`RoundingStrategy::MidpointAwayFromZero`):
//! `0.125 -> 0.13`, `-0.125 -> -0.13`. Rounding happens only when a value is
//! constructed from an arbitrary decimal (`from_decimal`, `mul_rate`);
//! addition and subtraction of two `Money` values are exact.
//!
//! # Arithmetic
//!
//! - `Add`, `Sub`, `Neg`, `AddAssign`, `SubAssign`, `Sum` are closed over
//!   `Money`; like the underlying `Decimal` operators they panic on overflow.
//! - `checked_add` / `checked_sub` / `mul_rate` return `None` on overflow;
//!   callers must handle this explicitly.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Number of decimal places carried by every `Money` value.
pub const MONEY_SCALE: u32 = 2;

/// A monetary amount quantised to minor units (two decimal places).
///
/// # Construction
///
/// Use [`Money::from_decimal`] (rounds half-up), [`Money::from_minor_units`]
/// or [`Money::parse`]. Deserialisation accepts only values that are already
/// exact at two decimal places.
///
/// # Retrieval
///
/// Use [`Money::amount`] for the `Decimal` value and
/// [`Money::to_minor_units`] when crossing the payment-rail boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Zero monetary amount.
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Quantise an arbitrary decimal to minor units, rounding half-up.
    pub fn from_decimal(value: Decimal) -> Money {
        Money(quantize(value))
    }

    /// Construct from an integer count of minor units (e.g. cents).
    pub fn from_minor_units(minor: i64) -> Money {
        Money(Decimal::new(minor, MONEY_SCALE))
    }

    /// Parse a decimal string such as `"100.00"` or `"12.5"`.
    ///
    /// Inputs with more than two decimal places are rounded half-up.
    pub fn parse(s: &str) -> Result<Money> {
        let d = Decimal::from_str(s.trim()).with_context(|| format!("invalid money amount: {s}"))?;
        Ok(Money::from_decimal(d))
    }

    /// The quantised decimal value.
    #[inline]
    pub fn amount(self) -> Decimal {
        self.0
    }

    /// Integer minor units, as sent to the payment rail.
    ///
    /// Returns `None` if the amount does not fit an `i64`.
    pub fn to_minor_units(self) -> Option<i64> {
        let mut d = self.0;
        d.rescale(MONEY_SCALE);
        i64::try_from(d.mantissa()).ok()
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    /// Multiply by a rate (a plain fraction, e.g. `0.10` for 10%) and
    /// quantise the product half-up. `None` on overflow.
    pub fn mul_rate(self, rate: Decimal) -> Option<Money> {
        self.0.checked_mul(rate).map(Money::from_decimal)
    }

    /// Divide by another amount, yielding an unrounded ratio.
    /// `None` when `rhs` is zero.
    pub fn ratio_to(self, rhs: Money) -> Option<Decimal> {
        if rhs.is_zero() {
            return None;
        }
        self.0.checked_div(rhs.0)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// `true` if this amount is strictly greater than zero.
    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// `true` if this amount is strictly negative.
    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < Decimal::ZERO
    }
}

fn quantize(value: Decimal) -> Decimal {
    let mut d = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    d.rescale(MONEY_SCALE);
    d
}

impl TryFrom<Decimal> for Money {
    type Error = anyhow::Error;

    /// Strict conversion: rejects values that would need rounding.
    fn try_from(value: Decimal) -> Result<Self> {
        let q = quantize(value);
        if q != value {
            return Err(anyhow!(
                "money amount {value} has more than {MONEY_SCALE} decimal places"
            ));
        }
        Ok(Money(q))
    }
}

impl From<Money> for Decimal {
    fn from(m: Money) -> Decimal {
        m.0
    }
}

// ---------------------------------------------------------------------------
// Arithmetic operators (closed over Money)
// ---------------------------------------------------------------------------

impl Add for Money {
    type Output = Money;
    #[inline]
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    #[inline]
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    #[inline]
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = self.0;
        d.rescale(MONEY_SCALE);
        write!(f, "{d}")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_is_additive_identity() {
        let a = Money::parse("42.00").unwrap();
        assert_eq!(a + Money::ZERO, a);
        assert_eq!(Money::ZERO + a, a);
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(Money::from_decimal(dec!(0.125)).amount(), dec!(0.13));
        assert_eq!(Money::from_decimal(dec!(0.124)).amount(), dec!(0.12));
        assert_eq!(Money::from_decimal(dec!(-0.125)).amount(), dec!(-0.13));
        assert_eq!(Money::from_decimal(dec!(2.675)).amount(), dec!(2.68));
    }

    #[test]
    fn mul_rate_percentage_of_booking() {
        let booking = Money::parse("1000").unwrap();
        let earned = booking.mul_rate(dec!(0.10)).unwrap();
        assert_eq!(earned.to_string(), "100.00");
    }

    #[test]
    fn mul_rate_overflow_returns_none() {
        let huge = Money::from_decimal(Decimal::MAX / dec!(1000));
        assert_eq!(huge.mul_rate(dec!(100000)), None);
    }

    #[test]
    fn minor_units_roundtrip() {
        let m = Money::from_minor_units(12_345);
        assert_eq!(m.to_string(), "123.45");
        assert_eq!(m.to_minor_units(), Some(12_345));
        assert_eq!(Money::parse("100").unwrap().to_minor_units(), Some(10_000));
    }

    #[test]
    fn sub_is_exact() {
        let a = Money::parse("80.00").unwrap();
        let b = Money::parse("30.00").unwrap();
        assert_eq!(a - b, Money::parse("50").unwrap());
        assert_eq!((a - b) + b, a);
    }

    #[test]
    fn display_always_two_places() {
        assert_eq!(Money::ZERO.to_string(), "0.00");
        assert_eq!(Money::parse("7.5").unwrap().to_string(), "7.50");
        assert_eq!(Money::parse("-2.75").unwrap().to_string(), "-2.75");
    }

    #[test]
    fn strict_try_from_rejects_sub_cent_values() {
        assert!(Money::try_from(dec!(1.005)).is_err());
        assert!(Money::try_from(dec!(1.5)).is_ok());
    }

    #[test]
    fn serde_uses_strings_and_rejects_sub_cent() {
        let m = Money::parse("19.99").unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"19.99\"");
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(serde_json::from_str::<Money>("\"0.001\"").is_err());
    }

    #[test]
    fn sum_of_amounts() {
        let total: Money = ["70", "80", "0.01"]
            .iter()
            .map(|s| Money::parse(s).unwrap())
            .sum();
        assert_eq!(total.to_string(), "150.01");
    }

    #[test]
    fn sign_predicates() {
        assert!(Money::parse("0.01").unwrap().is_positive());
        assert!(Money::parse("-0.01").unwrap().is_negative());
        assert!(Money::ZERO.is_zero());
        assert!(!Money::ZERO.is_positive());
    }

    #[test]
    fn ratio_to_zero_is_none() {
        assert_eq!(Money::parse("5").unwrap().ratio_to(Money::ZERO), None);
        assert_eq!(
            Money::parse("25").unwrap().ratio_to(Money::parse("1000").unwrap()),
            Some(dec!(0.025))
        );
    }
}
