//! Customer and back-office notifications.
//!
//! Delivery is fire-and-forget from the core's point of view: a failure is
//! logged and never undoes or blocks the operation that triggered it.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use crate::domain::aggregates::Order;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification payload could not be built: {0}")]
    Payload(String),
}

#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn send_order_confirmation(&self, order: &Order) -> Result<(), NotificationError>;
    async fn send_pickup_confirmation(&self, order: &Order) -> Result<(), NotificationError>;
    async fn send_shipping_notification(&self, order: &Order) -> Result<(), NotificationError>;
    async fn send_admin_notification(&self, order: &Order) -> Result<(), NotificationError>;
    async fn send_invoice_notification(&self, order: &Order) -> Result<(), NotificationError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notification {
    OrderConfirmation,
    PickupConfirmation,
    Shipping,
    Admin,
    Invoice,
}

impl Notification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderConfirmation => "order_confirmation",
            Self::PickupConfirmation => "pickup_confirmation",
            Self::Shipping => "shipping",
            Self::Admin => "admin",
            Self::Invoice => "invoice",
        }
    }

    pub async fn deliver(&self, port: &dyn NotificationPort, order: &Order) -> Result<(), NotificationError> {
        match self {
            Self::OrderConfirmation => port.send_order_confirmation(order).await,
            Self::PickupConfirmation => port.send_pickup_confirmation(order).await,
            Self::Shipping => port.send_shipping_notification(order).await,
            Self::Admin => port.send_admin_notification(order).await,
            Self::Invoice => port.send_invoice_notification(order).await,
        }
    }
}
