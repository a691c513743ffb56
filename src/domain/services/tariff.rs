//! Shipping tariff lookup
//!
//! A tariff row is a band: (country, mode, max weight in grams) → price
//! excluding tax. A parcel takes the lightest band that still holds it.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use crate::domain::value_objects::{Money, VatRate, Weight};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TariffRow {
    pub country_code: String,
    pub mode_code: String,
    pub weight_max_g: u32,
    pub price_ex_tax: Decimal,
}

#[derive(Clone, Debug, Default)]
pub struct TariffTable {
    rows: Vec<TariffRow>,
}

impl TariffTable {
    pub fn new(rows: impl IntoIterator<Item = TariffRow>) -> Self {
        let mut rows: Vec<TariffRow> = rows.into_iter().map(|mut r| { r.country_code = r.country_code.to_uppercase(); r }).collect();
        rows.sort_by(|a, b| {
            (a.country_code.as_str(), a.mode_code.as_str(), a.weight_max_g)
                .cmp(&(b.country_code.as_str(), b.mode_code.as_str(), b.weight_max_g))
        });
        Self { rows }
    }

    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    /// Price excluding tax of the smallest band with `weight_max_g >= weight_grams`.
    pub fn rate(&self, weight_grams: u32, mode_code: &str, country_code: &str) -> Result<Decimal, TariffError> {
        let country = country_code.to_uppercase();
        self.rows.iter()
            .filter(|r| r.country_code == country && r.mode_code == mode_code)
            .find(|r| r.weight_max_g >= weight_grams)
            .map(|r| r.price_ex_tax)
            .ok_or(TariffError::NoTariffFound { country, mode: mode_code.to_string(), weight_grams })
    }

    /// Tax-inclusive shipping cost, rounded to the cent.
    pub fn quote(&self, weight: Weight, mode_code: &str, country_code: &str, vat: VatRate, currency: &str) -> Result<Money, TariffError> {
        let net = self.rate(weight.to_grams(), mode_code, country_code)?;
        let gross = vat.apply(net).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Ok(Money::new(gross, currency))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TariffError { NoTariffFound { country: String, mode: String, weight_grams: u32 } }
impl std::error::Error for TariffError {}
impl fmt::Display for TariffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTariffFound { country, mode, weight_grams } =>
                write!(f, "No tariff for {}/{} at {} g", country, mode, weight_grams),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(country: &str, mode: &str, max: u32, cents: i64) -> TariffRow {
        TariffRow { country_code: country.into(), mode_code: mode.into(), weight_max_g: max, price_ex_tax: Decimal::new(cents, 2) }
    }

    fn table() -> TariffTable {
        TariffTable::new(vec![
            row("FR", "pr", 1000, 450), row("FR", "pr", 500, 390), row("FR", "pr", 2000, 590),
            row("FR", "locker", 1000, 350), row("BE", "pr", 1000, 650),
        ])
    }

    #[test]
    fn test_smallest_band_that_fits() {
        let t = table();
        assert_eq!(t.rate(300, "pr", "FR").unwrap(), Decimal::new(390, 2));
        assert_eq!(t.rate(500, "pr", "fr").unwrap(), Decimal::new(390, 2));
        assert_eq!(t.rate(501, "pr", "FR").unwrap(), Decimal::new(450, 2));
        assert_eq!(t.rate(800, "locker", "FR").unwrap(), Decimal::new(350, 2));
    }

    #[test]
    fn test_no_band() {
        let t = table();
        assert_eq!(t.rate(2001, "pr", "FR"), Err(TariffError::NoTariffFound { country: "FR".into(), mode: "pr".into(), weight_grams: 2001 }));
        assert!(t.rate(100, "pr", "DE").is_err());
    }

    #[test]
    fn test_quote_applies_vat() {
        let cost = table().quote(Weight::kg(Decimal::new(75, 2)), "pr", "FR", VatRate::default(), "EUR").unwrap();
        assert_eq!(cost, Money::eur(Decimal::new(540, 2)));
    }
}
