//! Notification adapters.
//!
//! `NatsNotifier` publishes one JSON message per notification on
//! `<prefix>.<kind>` (e.g. `checkout.notifications.invoice`); the mailer
//! subscribes there and renders the templates. `LogNotifier` only traces.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{Order, OrderStatus};
use crate::ports::{Notification, NotificationError, NotificationPort};

/// Everything a template needs, loaded up front.
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub kind: Notification,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub email: Option<&'a str>,
    pub customer: Option<String>,
    pub shipping_method: Option<String>,
    pub pickup_point: Option<&'a str>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    pub currency: &'a str,
    pub items: Vec<PayloadLine<'a>>,
}

#[derive(Debug, Serialize)]
pub struct PayloadLine<'a> {
    pub name: &'a str,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl<'a> NotificationPayload<'a> {
    pub fn build(kind: Notification, order: &'a Order) -> Self {
        let info = order.shipping_info();
        Self {
            kind,
            order_id: order.id(),
            status: order.status(),
            email: info.map(|i| i.contact.email.as_str()).filter(|e| !e.is_empty()),
            customer: info.map(|i| i.contact.full_name()).filter(|n| !n.is_empty()),
            shipping_method: order.shipping_method().map(|m| m.to_string()),
            pickup_point: info.and_then(|i| i.pickup_point.as_ref()).map(|p| p.name.as_str()),
            subtotal: order.subtotal().amount(),
            shipping_cost: order.shipping_cost().amount(),
            total: order.total().amount(),
            currency: order.currency(),
            items: order.items().iter()
                .map(|i| PayloadLine { name: &i.name, quantity: i.quantity.value(), unit_price: i.unit_price.amount() })
                .collect(),
        }
    }
}

pub struct NatsNotifier {
    client: async_nats::Client,
    prefix: String,
}

impl NatsNotifier {
    pub fn new(client: async_nats::Client, prefix: impl Into<String>) -> Self { Self { client, prefix: prefix.into() } }

    async fn publish(&self, kind: Notification, order: &Order) -> Result<(), NotificationError> {
        let payload = NotificationPayload::build(kind, order);
        let body = serde_json::to_vec(&payload).map_err(|e| NotificationError::Payload(e.to_string()))?;
        let subject = format!("{}.{}", self.prefix, kind.as_str());
        self.client.publish(subject, body.into()).await.map_err(|e| NotificationError::Transport(e.to_string()))?;
        tracing::debug!(order_id = %order.id(), kind = kind.as_str(), "Notification published");
        Ok(())
    }
}

#[async_trait]
impl NotificationPort for NatsNotifier {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), NotificationError> { self.publish(Notification::OrderConfirmation, order).await }
    async fn send_pickup_confirmation(&self, order: &Order) -> Result<(), NotificationError> { self.publish(Notification::PickupConfirmation, order).await }
    async fn send_shipping_notification(&self, order: &Order) -> Result<(), NotificationError> { self.publish(Notification::Shipping, order).await }
    async fn send_admin_notification(&self, order: &Order) -> Result<(), NotificationError> { self.publish(Notification::Admin, order).await }
    async fn send_invoice_notification(&self, order: &Order) -> Result<(), NotificationError> { self.publish(Notification::Invoice, order).await }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    fn log(&self, kind: Notification, order: &Order) -> Result<(), NotificationError> {
        let payload = NotificationPayload::build(kind, order);
        tracing::info!(
            order_id = %payload.order_id,
            kind = kind.as_str(),
            email = payload.email.unwrap_or("-"),
            total = %payload.total,
            "Notification"
        );
        Ok(())
    }
}

#[async_trait]
impl NotificationPort for LogNotifier {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), NotificationError> { self.log(Notification::OrderConfirmation, order) }
    async fn send_pickup_confirmation(&self, order: &Order) -> Result<(), NotificationError> { self.log(Notification::PickupConfirmation, order) }
    async fn send_shipping_notification(&self, order: &Order) -> Result<(), NotificationError> { self.log(Notification::Shipping, order) }
    async fn send_admin_notification(&self, order: &Order) -> Result<(), NotificationError> { self.log(Notification::Admin, order) }
    async fn send_invoice_notification(&self, order: &Order) -> Result<(), NotificationError> { self.log(Notification::Invoice, order) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Cart, CartItem, Contact, ShippingInfo, ShippingMethod};
    use crate::domain::value_objects::{Money, Weight};

    #[test]
    fn test_payload_carries_contact_and_lines() {
        let mut cart = Cart::new("tok", "EUR");
        cart.add_item(CartItem {
            product_id: Some(Uuid::new_v4()), variant_id: None, name: "Bracelet".into(), quantity: 2,
            unit_price: Money::eur(Decimal::new(1250, 2)), unit_weight: Weight::zero(),
        });
        let mut order = Order::from_cart(&cart).unwrap();
        let contact = Contact { email: "ana@example.com".into(), first_name: "Ana".into(), last_name: "Lopes".into(), ..Contact::default() };
        order.attach_shipping(ShippingMethod::StorePickup, Money::zero("EUR"), Some(ShippingInfo { contact, pickup_point: None })).unwrap();

        let payload = NotificationPayload::build(Notification::PickupConfirmation, &order);
        assert_eq!(payload.email, Some("ana@example.com"));
        assert_eq!(payload.customer.as_deref(), Some("Ana Lopes"));
        assert_eq!(payload.shipping_method.as_deref(), Some("pickup"));
        assert_eq!(payload.total, Decimal::new(2500, 2));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "pickup_confirmation");
        assert_eq!(json["items"][0]["quantity"], 2);
    }
}
