//! Value Objects for checkout

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Money value object. Amounts are tax-inclusive unless stated otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount, currency: currency.to_uppercase() } }
    pub fn eur(amount: Decimal) -> Self { Self::new(amount, "EUR") }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn is_positive(&self) -> bool { self.amount > Decimal::ZERO }
    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        if self.currency != other.currency { return Err(MoneyError::CurrencyMismatch); }
        Ok(Money::new(self.amount + other.amount, &self.currency))
    }
    pub fn multiply(&self, qty: u32) -> Money { Money::new(self.amount * Decimal::from(qty), &self.currency) }
}

impl Default for Money { fn default() -> Self { Self::zero("EUR") } }

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:.2} {}", self.amount, self.currency) }
}

#[derive(Debug, Clone, PartialEq, Eq)] pub enum MoneyError { CurrencyMismatch }
impl std::error::Error for MoneyError {}
impl fmt::Display for MoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Currency mismatch") }
}

/// Quantity of one order line; never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Option<Self> { if value == 0 { None } else { Some(Self(value)) } }
    pub fn value(&self) -> u32 { self.0 }
    pub fn signed(&self) -> i64 { i64::from(self.0) }
}

impl TryFrom<u32> for Quantity {
    type Error = &'static str;
    fn try_from(value: u32) -> Result<Self, Self::Error> { Self::new(value).ok_or("quantity must be at least 1") }
}

impl From<Quantity> for u32 { fn from(q: Quantity) -> u32 { q.0 } }

/// Parcel weight in kilograms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Weight(Decimal);

impl Weight {
    pub fn kg(value: Decimal) -> Self { Self(value.max(Decimal::ZERO)) }
    pub fn zero() -> Self { Self(Decimal::ZERO) }
    pub fn as_kg(&self) -> Decimal { self.0 }
    /// Whole grams, truncated. Tariff bands are expressed in grams.
    pub fn to_grams(&self) -> u32 {
        (self.0 * Decimal::ONE_THOUSAND).trunc().to_u32().unwrap_or(u32::MAX)
    }
    pub fn times(&self, qty: Quantity) -> Weight { Weight(self.0 * Decimal::from(qty.value())) }
    pub fn plus(&self, other: Weight) -> Weight { Weight(self.0 + other.0) }
}

/// VAT rate as a fraction, e.g. 0.20.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRate(Decimal);

impl VatRate {
    pub fn new(rate: Decimal) -> Option<Self> { if rate.is_sign_negative() { None } else { Some(Self(rate)) } }
    pub fn rate(&self) -> Decimal { self.0 }
    pub fn apply(&self, net: Decimal) -> Decimal { net * (Decimal::ONE + self.0) }
    /// Tax portion already included in a tax-inclusive amount.
    pub fn included_in(&self, gross: Decimal) -> Decimal {
        (gross - gross / (Decimal::ONE + self.0)).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }
}

impl Default for VatRate { fn default() -> Self { Self(Decimal::new(20, 2)) } }

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_money_add() {
        let a = Money::eur(Decimal::new(1000, 2));
        let b = Money::eur(Decimal::new(500, 2));
        assert_eq!(a.add(&b).unwrap().amount(), Decimal::new(1500, 2));
        assert_eq!(a.add(&Money::new(Decimal::ONE, "USD")), Err(MoneyError::CurrencyMismatch));
    }
    #[test]
    fn test_quantity_rejects_zero() {
        assert!(Quantity::new(0).is_none());
        assert!(serde_json::from_str::<Quantity>("0").is_err());
        assert_eq!(serde_json::from_str::<Quantity>("3").unwrap().value(), 3);
    }
    #[test]
    fn test_weight_grams_truncate() {
        assert_eq!(Weight::kg(Decimal::new(12345, 4)).to_grams(), 1234);
        assert_eq!(Weight::kg(Decimal::new(5, 1)).times(Quantity::new(2).unwrap()).to_grams(), 1000);
    }
    #[test]
    fn test_vat() {
        let vat = VatRate::default();
        assert_eq!(vat.apply(Decimal::new(1000, 2)), Decimal::new(1200, 2));
        assert_eq!(vat.included_in(Decimal::new(1200, 2)), Decimal::new(200, 2));
    }
}
