//! # Money
//!
//! Amounts are held in the smallest currency unit (cents). The service runs in
//! a single currency, so there is no currency tag on the value itself.

use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, Sub};

/// ISO 4217 code sent to the payment gateway
pub const CURRENCY: &str = "usd";

/// Largest decimal amount `Money::from_decimal` accepts. Cents stay exact in
/// an `f64` well past this.
pub const MAX_DECIMAL: f64 = 1.0e12;

/// Amount in cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Create from cents
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Create from a decimal amount (e.g. `12.99`), rounding to the nearest cent.
    ///
    /// Returns `None` for NaN, infinities and amounts beyond `MAX_DECIMAL`.
    pub fn from_decimal(amount: f64) -> Option<Self> {
        if !amount.is_finite() || amount.abs() > MAX_DECIMAL {
            return None;
        }
        Some(Self((amount * 100.0).round() as i64))
    }

    pub fn cents(&self) -> i64 {
        self.0
    }

    /// Get the decimal amount
    pub fn as_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Multiply by a quantity, saturating at the `i64` bounds
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(i64::from(quantity)))
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_times(self, quantity: u32) -> Option<Money> {
        self.0.checked_mul(i64::from(quantity)).map(Money)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Format for display (e.g., "$10.00")
    pub fn display(&self) -> String {
        if self.0 < 0 {
            format!("-${:.2}", self.as_decimal().abs())
        } else {
            format!("${:.2}", self.as_decimal())
        }
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_conversion() {
        assert_eq!(Money::from_decimal(10.99).unwrap().cents(), 1099);
        assert_eq!(Money::from_decimal(0.5).unwrap().cents(), 50);
        assert_eq!(Money::from_cents(2800).as_decimal(), 28.0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(2999).display(), "$29.99");
        assert_eq!(Money::from_cents(-150).display(), "-$1.50");
    }

    #[test]
    fn test_arithmetic() {
        let total: Money = [Money::from_cents(1000).times(2), Money::from_cents(500)]
            .into_iter()
            .sum();
        assert_eq!(total, Money::from_cents(2500));
        assert_eq!(total - Money::from_cents(500), Money::from_cents(2000));
    }

    #[test]
    fn test_decimal_out_of_range() {
        assert_eq!(Money::from_decimal(1e17), None);
        assert_eq!(Money::from_decimal(-1e17), None);
        assert_eq!(Money::from_decimal(f64::NAN), None);
        assert_eq!(Money::from_decimal(f64::INFINITY), None);
        assert_eq!(
            Money::from_decimal(MAX_DECIMAL).map(|m| m.cents()),
            Some(100_000_000_000_000)
        );
    }

    #[test]
    fn test_arithmetic_does_not_overflow() {
        let huge = Money::from_cents(i64::MAX);

        assert_eq!(huge + Money::from_cents(1), huge);
        assert_eq!(Money::from_cents(i64::MIN) - Money::from_cents(1), Money::from_cents(i64::MIN));
        assert_eq!(huge.times(u32::MAX), huge);
        assert_eq!(huge.checked_add(Money::from_cents(1)), None);
        assert_eq!(huge.checked_times(2), None);
        assert_eq!(Money::from_cents(250).checked_times(4), Some(Money::from_cents(1000)));
        assert!(!huge.display().is_empty());
        assert!(!Money::from_cents(i64::MIN).display().is_empty());
    }
}
