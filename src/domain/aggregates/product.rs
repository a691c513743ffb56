//! Product Aggregate (inventory side only)

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the stock for an order line lives: on the variant when the line has
/// one, on the product otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StockTarget {
    Product(Uuid),
    Variant(Uuid),
}

impl StockTarget {
    pub fn for_line(product_id: Uuid, variant_id: Option<Uuid>) -> Self {
        match variant_id {
            Some(variant) => StockTarget::Variant(variant),
            None => StockTarget::Product(product_id),
        }
    }
}

/// Applies a signed delta to a stock level. Never goes below zero: overselling
/// is absorbed rather than rejected.
pub fn apply_stock_delta(level: i64, delta: i64) -> i64 { level.saturating_add(delta).max(0) }

#[derive(Clone, Debug)]
pub struct Product {
    id: Uuid,
    name: String,
    stock: i64,
    variants: Vec<Variant>,
}

#[derive(Clone, Debug)] pub struct Variant { pub id: Uuid, pub name: String, pub stock: i64 }

impl Product {
    pub fn create(name: impl Into<String>, stock: i64) -> Self {
        Self { id: Uuid::new_v4(), name: name.into(), stock: stock.max(0), variants: vec![] }
    }

    pub fn with_variant(mut self, name: impl Into<String>, stock: i64) -> Self {
        self.variants.push(Variant { id: Uuid::new_v4(), name: name.into(), stock: stock.max(0) });
        self
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn name(&self) -> &str { &self.name }
    pub fn stock(&self) -> i64 { self.stock }
    pub fn variants(&self) -> &[Variant] { &self.variants }
    pub fn variant(&self, id: Uuid) -> Option<&Variant> { self.variants.iter().find(|v| v.id == id) }

    pub fn stock_of(&self, target: StockTarget) -> Option<i64> {
        match target {
            StockTarget::Product(id) if id == self.id => Some(self.stock),
            StockTarget::Variant(id) => self.variant(id).map(|v| v.stock),
            _ => None,
        }
    }

    /// Returns false when the target does not belong to this product.
    pub fn adjust_stock(&mut self, target: StockTarget, delta: i64) -> bool {
        match target {
            StockTarget::Product(id) if id == self.id => { self.stock = apply_stock_delta(self.stock, delta); true }
            StockTarget::Variant(id) => match self.variants.iter_mut().find(|v| v.id == id) {
                Some(v) => { v.stock = apply_stock_delta(v.stock, delta); true }
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_stock_floors_at_zero() {
        assert_eq!(apply_stock_delta(3, -5), 0);
        assert_eq!(apply_stock_delta(0, 4), 4);
    }
    #[test]
    fn test_variant_holds_its_own_stock() {
        let mut p = Product::create("Bague", 10).with_variant("Taille 52", 2);
        let variant = p.variants()[0].id;
        assert!(p.adjust_stock(StockTarget::Variant(variant), -1));
        assert_eq!(p.stock_of(StockTarget::Variant(variant)), Some(1));
        assert_eq!(p.stock(), 10);
        assert!(!p.adjust_stock(StockTarget::Variant(Uuid::new_v4()), -1));
    }
}
