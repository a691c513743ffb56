//! Cart Aggregate
//!
//! Only the read side matters here: a cart is the snapshot an order is built
//! from. Prices and weights are whatever the cart holds at conversion time.

use uuid::Uuid;
use crate::domain::value_objects::{Money, Weight};

#[derive(Clone, Debug)]
pub struct Cart {
    token: String,
    items: Vec<CartItem>,
    currency: String,
}

#[derive(Clone, Debug)]
pub struct CartItem {
    /// `None` when the product was removed from the catalog after being carted.
    pub product_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Money,
    pub unit_weight: Weight,
}

impl CartItem {
    pub fn is_orderable(&self) -> bool { self.product_id.is_some() && self.quantity > 0 }
}

impl Cart {
    pub fn new(token: impl Into<String>, currency: &str) -> Self {
        Self { token: token.into(), items: vec![], currency: currency.to_uppercase() }
    }

    pub fn token(&self) -> &str { &self.token }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn items(&self) -> &[CartItem] { &self.items }

    pub fn add_item(&mut self, item: CartItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.product_id == item.product_id && i.variant_id == item.variant_id) {
            existing.quantity += item.quantity;
        } else {
            self.items.push(item);
        }
    }

    pub fn orderable_items(&self) -> impl Iterator<Item = &CartItem> { self.items.iter().filter(|i| i.is_orderable()) }
}
