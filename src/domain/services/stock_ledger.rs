//! Stock ledger
//!
//! Turns an order into signed inventory deltas. It does not know whether an
//! order's stock was already taken: the `stock_reserved` flag on the order is
//! the caller's business.

use serde::{Deserialize, Serialize};
use crate::domain::aggregates::{Order, StockTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    pub target: StockTarget,
    pub delta: i64,
}

pub struct StockLedger;

impl StockLedger {
    /// One negative delta per line item. Applied with a floor at zero.
    pub fn decrement(order: &Order) -> Vec<StockAdjustment> { Self::adjustments(order, -1) }

    /// Exact inverse of [`StockLedger::decrement`], uncapped.
    pub fn increment(order: &Order) -> Vec<StockAdjustment> { Self::adjustments(order, 1) }

    fn adjustments(order: &Order, sign: i64) -> Vec<StockAdjustment> {
        order.items().iter()
            .map(|item| StockAdjustment { target: item.stock_target(), delta: sign * item.quantity.signed() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Cart, CartItem};
    use crate::domain::value_objects::{Money, Weight};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[test]
    fn test_variant_wins_over_product() {
        let (product, variant, plain) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut cart = Cart::new("tok", "EUR");
        cart.add_item(CartItem { product_id: Some(product), variant_id: Some(variant), name: "Bague T52".into(), quantity: 2, unit_price: Money::eur(Decimal::TEN), unit_weight: Weight::zero() });
        cart.add_item(CartItem { product_id: Some(plain), variant_id: None, name: "Chaîne".into(), quantity: 1, unit_price: Money::eur(Decimal::TEN), unit_weight: Weight::zero() });
        let order = Order::from_cart(&cart).unwrap();

        let down = StockLedger::decrement(&order);
        assert_eq!(down, vec![
            StockAdjustment { target: StockTarget::Variant(variant), delta: -2 },
            StockAdjustment { target: StockTarget::Product(plain), delta: -1 },
        ]);
        let up = StockLedger::increment(&order);
        assert!(down.iter().zip(&up).all(|(d, u)| d.target == u.target && d.delta == -u.delta));
    }
}
