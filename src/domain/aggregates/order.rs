//! Order Aggregate
//!
//! Owns the status graph, the tax-inclusive total and the `stock_reserved`
//! flag. Side effects (stock writes, gateway calls, notifications) belong to
//! the state machine; the aggregate only decides what is allowed and records
//! what happened as events.
//!
//! ```text
//! created ──▶ paid ──▶ shipped ──▶ completed
//!    │          │         │
//!    └──────────┴─────────┴──▶ cancelled
//! ```
//!
//! A store-pickup order may also go `created ──▶ shipped` when it is settled
//! at the counter.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::aggregates::cart::Cart;
use crate::domain::aggregates::payment::{PaymentRecord, UnknownValue};
use crate::domain::aggregates::product::StockTarget;
use crate::domain::events::{DomainEvent, OrderEvent, PaymentEvent};
use crate::domain::value_objects::{Money, Quantity, Weight};

#[derive(Clone, Debug)]
pub struct Order {
    id: Uuid,
    cart_token: Option<String>,
    status: OrderStatus,
    currency: String,
    items: Vec<OrderItem>,
    shipping_method: Option<ShippingMethod>,
    shipping_cost: Money,
    shipping_info: Option<ShippingInfo>,
    total_weight: Weight,
    total: Money,
    stock_reserved: bool,
    payments: Vec<PaymentRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

/// Everything a storage adapter needs to rebuild an order.
#[derive(Clone, Debug)]
pub struct OrderParts {
    pub id: Uuid,
    pub cart_token: Option<String>,
    pub status: OrderStatus,
    pub currency: String,
    pub items: Vec<OrderItem>,
    pub shipping_method: Option<ShippingMethod>,
    pub shipping_cost: Money,
    pub shipping_info: Option<ShippingInfo>,
    pub total_weight: Weight,
    pub stock_reserved: bool,
    pub payments: Vec<PaymentRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of a cart line, copied by value when the order is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: Quantity,
    pub unit_price: Money,
    pub unit_weight: Weight,
}

impl OrderItem {
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity.value()) }
    pub fn line_weight(&self) -> Weight { self.unit_weight.times(self.quantity) }
    pub fn stock_target(&self) -> StockTarget { StockTarget::for_line(self.product_id, self.variant_id) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Created, Paid, Shipped, Completed, Cancelled }

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created", Self::Paid => "paid", Self::Shipped => "shipped",
            Self::Completed => "completed", Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created), "paid" => Ok(Self::Paid), "shipped" => Ok(Self::Shipped),
            "completed" => Ok(Self::Completed), "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Carrier { MondialRelay, Colissimo }

impl Carrier {
    pub fn as_str(&self) -> &'static str {
        match self { Self::MondialRelay => "mondial_relay", Self::Colissimo => "colissimo" }
    }
}

impl FromStr for Carrier {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mondial_relay" => Ok(Self::MondialRelay),
            "colissimo" => Ok(Self::Colissimo),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// Encoded as `pickup` or `<carrier>/<mode>`, e.g. `mondial_relay/pr`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ShippingMethod {
    /// Collected at the shop, paid online or at the counter.
    StorePickup,
    Carrier { carrier: Carrier, mode: String },
}

impl ShippingMethod {
    pub fn is_store_pickup(&self) -> bool { matches!(self, Self::StorePickup) }
    /// Tariff mode code, `None` for store pickup which is free.
    pub fn tariff_mode(&self) -> Option<&str> {
        match self { Self::StorePickup => None, Self::Carrier { mode, .. } => Some(mode) }
    }
}

impl fmt::Display for ShippingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorePickup => f.write_str("pickup"),
            Self::Carrier { carrier, mode } => write!(f, "{}/{}", carrier.as_str(), mode),
        }
    }
}

impl FromStr for ShippingMethod {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "pickup" { return Ok(Self::StorePickup); }
        let (carrier, mode) = s.split_once('/').ok_or_else(|| UnknownValue(s.to_string()))?;
        if mode.trim().is_empty() { return Err(UnknownValue(s.to_string())); }
        Ok(Self::Carrier { carrier: carrier.parse()?, mode: mode.trim().to_string() })
    }
}

impl TryFrom<String> for ShippingMethod {
    type Error = UnknownValue;
    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<ShippingMethod> for String { fn from(m: ShippingMethod) -> String { m.to_string() } }

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
    pub phone: Option<String>,
}

impl Contact {
    pub fn full_name(&self) -> String { format!("{} {}", self.first_name, self.last_name).trim().to_string() }
}

/// The relay point or locker a parcel is sent to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupPointRef {
    pub id: String,
    pub name: String,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub country: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub contact: Contact,
    pub pickup_point: Option<PickupPointRef>,
}

impl Order {
    /// Snapshots every orderable cart line. Lines whose product is gone or
    /// whose quantity is zero are dropped.
    pub fn from_cart(cart: &Cart) -> Result<Self, OrderError> {
        let items: Vec<OrderItem> = cart.orderable_items().filter_map(|line| {
            Some(OrderItem {
                id: Uuid::new_v4(),
                product_id: line.product_id?,
                variant_id: line.variant_id,
                name: line.name.clone(),
                quantity: Quantity::new(line.quantity)?,
                unit_price: line.unit_price.clone(),
                unit_weight: line.unit_weight,
            })
        }).collect();
        if items.is_empty() { return Err(OrderError::EmptyCart); }
        if items.iter().any(|i| i.unit_price.currency() != cart.currency()) { return Err(OrderError::CurrencyMismatch); }

        let now = Utc::now();
        let mut order = Self {
            id: Uuid::now_v7(), cart_token: Some(cart.token().to_string()), status: OrderStatus::Created,
            currency: cart.currency().to_string(), items, shipping_method: None,
            shipping_cost: Money::zero(cart.currency()), shipping_info: None, total_weight: Weight::zero(),
            total: Money::zero(cart.currency()), stock_reserved: false, payments: vec![],
            created_at: now, updated_at: now, events: vec![],
        };
        order.recalculate();
        order.raise_event(OrderEvent::Created { order_id: order.id, total: order.total.amount() });
        Ok(order)
    }

    pub fn restore(parts: OrderParts) -> Self {
        let mut order = Self {
            id: parts.id, cart_token: parts.cart_token, status: parts.status, currency: parts.currency,
            items: parts.items, shipping_method: parts.shipping_method, shipping_cost: parts.shipping_cost,
            shipping_info: parts.shipping_info, total_weight: parts.total_weight,
            total: Money::default(), stock_reserved: parts.stock_reserved, payments: parts.payments,
            created_at: parts.created_at, updated_at: parts.updated_at, events: vec![],
        };
        order.total = order.computed_total();
        order
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn cart_token(&self) -> Option<&str> { self.cart_token.as_deref() }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn shipping_method(&self) -> Option<&ShippingMethod> { self.shipping_method.as_ref() }
    pub fn shipping_cost(&self) -> &Money { &self.shipping_cost }
    pub fn shipping_info(&self) -> Option<&ShippingInfo> { self.shipping_info.as_ref() }
    pub fn total_weight(&self) -> Weight { self.total_weight }
    pub fn total(&self) -> &Money { &self.total }
    pub fn stock_reserved(&self) -> bool { self.stock_reserved }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn is_store_pickup(&self) -> bool { self.shipping_method.as_ref().map_or(false, ShippingMethod::is_store_pickup) }
    pub fn can_be_deleted(&self) -> bool { matches!(self.status, OrderStatus::Created | OrderStatus::Cancelled) }

    pub fn subtotal(&self) -> Money {
        self.items.iter().fold(Money::zero(&self.currency), |acc, i| acc.add(&i.line_total()).unwrap_or(acc))
    }

    /// Replaces the shipping selection as a whole: a pickup point that is not
    /// supplied again is cleared, never carried over.
    pub fn attach_shipping(&mut self, method: ShippingMethod, cost: Money, info: Option<ShippingInfo>) -> Result<(), OrderError> {
        if self.status != OrderStatus::Created { return Err(OrderError::NotEditable(self.status)); }
        if cost.currency() != self.currency { return Err(OrderError::CurrencyMismatch); }
        if cost.amount().is_sign_negative() { return Err(OrderError::NegativeShippingCost); }
        self.shipping_method = Some(method);
        self.shipping_cost = cost;
        self.shipping_info = info;
        self.recalculate();
        self.raise_event(OrderEvent::ShippingAttached {
            order_id: self.id, shipping_cost: self.shipping_cost.amount(), total: self.total.amount(),
        });
        Ok(())
    }

    /// Moves a `created` order to `paid`. Orders already past `paid` are left
    /// where they are; returns whether the status changed.
    pub fn mark_paid(&mut self) -> Result<bool, OrderError> {
        match self.status {
            OrderStatus::Created => { self.set_status(OrderStatus::Paid); Ok(true) }
            OrderStatus::Paid | OrderStatus::Shipped | OrderStatus::Completed => Ok(false),
            OrderStatus::Cancelled => Err(OrderError::InvalidTransition { from: self.status, to: OrderStatus::Paid }),
        }
    }

    /// `shipped` again is a no-op. A `created` order can only skip to
    /// `shipped` when it is collected at the shop.
    pub fn ship(&mut self) -> Result<bool, OrderError> {
        match self.status {
            OrderStatus::Shipped => Ok(false),
            OrderStatus::Paid => { self.set_shipped(); Ok(true) }
            OrderStatus::Created if self.is_store_pickup() => { self.set_shipped(); Ok(true) }
            OrderStatus::Created => Err(OrderError::NotPickup),
            from => Err(OrderError::InvalidTransition { from, to: OrderStatus::Shipped }),
        }
    }

    pub fn complete(&mut self) -> Result<bool, OrderError> {
        match self.status {
            OrderStatus::Completed => Ok(false),
            OrderStatus::Shipped => { self.set_status(OrderStatus::Completed); Ok(true) }
            from => Err(OrderError::InvalidTransition { from, to: OrderStatus::Completed }),
        }
    }

    pub fn cancel(&mut self) -> Result<bool, OrderError> {
        match self.status {
            OrderStatus::Cancelled => Ok(false),
            OrderStatus::Completed => Err(OrderError::InvalidTransition { from: self.status, to: OrderStatus::Cancelled }),
            _ => {
                self.set_status(OrderStatus::Cancelled);
                self.raise_event(OrderEvent::Cancelled { order_id: self.id });
                Ok(true)
            }
        }
    }

    /// Flips `stock_reserved` on. Returns false if it already was, in which
    /// case the caller must not touch inventory.
    pub fn mark_stock_reserved(&mut self) -> bool {
        if self.stock_reserved { return false; }
        self.stock_reserved = true;
        self.touch();
        self.raise_event(OrderEvent::StockReserved { order_id: self.id });
        true
    }

    pub fn mark_stock_released(&mut self) -> bool {
        if !self.stock_reserved { return false; }
        self.stock_reserved = false;
        self.touch();
        self.raise_event(OrderEvent::StockReleased { order_id: self.id });
        true
    }

    pub fn record_confirmation(&mut self) {
        let pickup = self.is_store_pickup();
        self.raise_event(OrderEvent::Confirmed { order_id: self.id, pickup });
    }

    pub fn payments(&self) -> &[PaymentRecord] { &self.payments }
    pub fn payments_mut(&mut self) -> &mut [PaymentRecord] { &mut self.payments }
    pub fn add_payment(&mut self, payment: PaymentRecord) { self.payments.push(payment); self.touch(); }
    pub fn total_paid(&self) -> Money {
        self.payments.iter().filter(|p| p.is_paid()).fold(Money::zero(&self.currency), |acc, p| acc.add(&p.amount).unwrap_or(acc))
    }
    pub fn remaining_amount(&self) -> Money {
        let remaining = self.total.amount() - self.total_paid().amount();
        Money::new(remaining.max(Decimal::ZERO), &self.currency)
    }

    /// Storage adapters reattach the payment rows they load separately.
    pub(crate) fn set_payments(&mut self, payments: Vec<PaymentRecord>) { self.payments = payments; }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    pub(crate) fn raise_event(&mut self, e: OrderEvent) { self.events.push(DomainEvent::Order(e)); }
    pub(crate) fn raise_payment_event(&mut self, e: PaymentEvent) { self.events.push(DomainEvent::Payment(e)); }

    fn set_shipped(&mut self) {
        self.set_status(OrderStatus::Shipped);
        let pickup = self.is_store_pickup();
        self.raise_event(OrderEvent::Shipped { order_id: self.id, pickup });
    }

    fn set_status(&mut self, to: OrderStatus) {
        let from = self.status;
        self.status = to;
        self.touch();
        self.raise_event(OrderEvent::StatusChanged { order_id: self.id, from, to });
    }

    fn computed_total(&self) -> Money { self.subtotal().add(&self.shipping_cost).unwrap_or_else(|_| self.subtotal()) }

    fn recalculate(&mut self) {
        self.total_weight = self.items.iter().fold(Weight::zero(), |acc, i| acc.plus(i.line_weight()));
        self.total = self.computed_total();
        self.touch();
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    EmptyCart,
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    NotEditable(OrderStatus),
    NotPickup,
    CurrencyMismatch,
    NegativeShippingCost,
}
impl std::error::Error for OrderError {}
impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCart => write!(f, "Cart has no orderable items"),
            Self::InvalidTransition { from, to } => write!(f, "Cannot move order from {} to {}", from, to),
            Self::NotEditable(status) => write!(f, "Order is {} and can no longer be edited", status),
            Self::NotPickup => write!(f, "Order is not a store pickup"),
            Self::CurrencyMismatch => write!(f, "Currency mismatch"),
            Self::NegativeShippingCost => write!(f, "Shipping cost cannot be negative"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::cart::CartItem;

    fn cart(qty: u32) -> Cart {
        let mut cart = Cart::new("tok-1", "EUR");
        cart.add_item(CartItem {
            product_id: Some(Uuid::new_v4()), variant_id: None, name: "Boucles".into(), quantity: qty,
            unit_price: Money::eur(Decimal::new(1000, 2)), unit_weight: Weight::kg(Decimal::new(5, 1)),
        });
        cart
    }

    fn relay() -> ShippingMethod { ShippingMethod::Carrier { carrier: Carrier::MondialRelay, mode: "pr".into() } }

    #[test]
    fn test_total_includes_shipping() {
        let mut order = Order::from_cart(&cart(2)).unwrap();
        assert_eq!(order.total().amount(), Decimal::new(2000, 2));
        assert_eq!(order.total_weight().to_grams(), 1000);
        order.attach_shipping(relay(), Money::eur(Decimal::new(500, 2)), None).unwrap();
        assert_eq!(order.total().amount(), Decimal::new(2500, 2));
    }

    #[test]
    fn test_empty_cart_rejected() {
        let mut c = Cart::new("tok", "EUR");
        c.add_item(CartItem { product_id: None, variant_id: None, name: "Gone".into(), quantity: 1, unit_price: Money::eur(Decimal::ONE), unit_weight: Weight::zero() });
        assert_eq!(Order::from_cart(&c).unwrap_err(), OrderError::EmptyCart);
    }

    #[test]
    fn test_status_graph() {
        let mut order = Order::from_cart(&cart(1)).unwrap();
        assert_eq!(order.ship(), Err(OrderError::NotPickup));
        assert!(order.mark_paid().unwrap());
        assert!(!order.mark_paid().unwrap());
        assert!(order.ship().unwrap());
        assert!(!order.ship().unwrap());
        assert!(!order.mark_paid().unwrap());
        assert_eq!(order.status(), OrderStatus::Shipped);
        assert!(order.complete().unwrap());
        assert!(order.cancel().is_err());
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut order = Order::from_cart(&cart(1)).unwrap();
        assert!(order.cancel().unwrap());
        assert_eq!(order.mark_paid(), Err(OrderError::InvalidTransition { from: OrderStatus::Cancelled, to: OrderStatus::Paid }));
        assert!(!order.cancel().unwrap());
    }

    #[test]
    fn test_pickup_can_skip_to_shipped() {
        let mut order = Order::from_cart(&cart(1)).unwrap();
        order.attach_shipping(ShippingMethod::StorePickup, Money::zero("EUR"), None).unwrap();
        order.take_events();
        assert!(order.ship().unwrap());
        assert!(order.take_events().contains(&DomainEvent::Order(OrderEvent::Shipped { order_id: order.id(), pickup: true })));
    }

    #[test]
    fn test_shipping_replaced_wholesale() {
        let mut order = Order::from_cart(&cart(1)).unwrap();
        let point = PickupPointRef { id: "012345".into(), name: "Tabac".into(), address: "1 rue".into(), postal_code: "75001".into(), city: "Paris".into(), country: None };
        order.attach_shipping(relay(), Money::eur(Decimal::new(490, 2)), Some(ShippingInfo { contact: Contact::default(), pickup_point: Some(point) })).unwrap();
        order.attach_shipping(relay(), Money::eur(Decimal::new(490, 2)), Some(ShippingInfo { contact: Contact::default(), pickup_point: None })).unwrap();
        assert!(order.shipping_info().unwrap().pickup_point.is_none());
        order.mark_paid().unwrap();
        assert_eq!(order.attach_shipping(relay(), Money::eur(Decimal::ONE), None), Err(OrderError::NotEditable(OrderStatus::Paid)));
    }

    #[test]
    fn test_stock_flag_flips_once() {
        let mut order = Order::from_cart(&cart(1)).unwrap();
        assert!(order.mark_stock_reserved());
        assert!(!order.mark_stock_reserved());
        assert!(order.mark_stock_released());
        assert!(!order.mark_stock_released());
    }

    #[test]
    fn test_shipping_method_codes() {
        assert_eq!("pickup".parse::<ShippingMethod>().unwrap(), ShippingMethod::StorePickup);
        assert_eq!("mondial_relay/locker".parse::<ShippingMethod>().unwrap().tariff_mode(), Some("locker"));
        assert!("colissimo/".parse::<ShippingMethod>().is_err());
        assert_eq!(relay().to_string(), "mondial_relay/pr");
    }
}
