//! Domain events
//!
//! Raised by the aggregates only when something actually changed, so a replayed
//! command produces no events and, downstream, no notifications.
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{OrderStatus, PaymentMethod};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Order(OrderEvent),
    Payment(PaymentEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created { order_id: Uuid, total: Decimal },
    ShippingAttached { order_id: Uuid, shipping_cost: Decimal, total: Decimal },
    /// The customer-facing "your order is confirmed" moment: online payment
    /// succeeded, or a pickup was reserved or settled at the counter.
    Confirmed { order_id: Uuid, pickup: bool },
    StatusChanged { order_id: Uuid, from: OrderStatus, to: OrderStatus },
    Shipped { order_id: Uuid, pickup: bool },
    StockReserved { order_id: Uuid },
    StockReleased { order_id: Uuid },
    Cancelled { order_id: Uuid },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    Succeeded { order_id: Uuid, method: PaymentMethod, transaction_id: String },
    Superseded { order_id: Uuid, method: PaymentMethod },
    Refunded { order_id: Uuid, method: PaymentMethod, transaction_id: String },
}

impl DomainEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            DomainEvent::Order(e) => match e {
                OrderEvent::Created { order_id, .. }
                | OrderEvent::ShippingAttached { order_id, .. }
                | OrderEvent::Confirmed { order_id, .. }
                | OrderEvent::StatusChanged { order_id, .. }
                | OrderEvent::Shipped { order_id, .. }
                | OrderEvent::StockReserved { order_id }
                | OrderEvent::StockReleased { order_id }
                | OrderEvent::Cancelled { order_id } => *order_id,
            },
            DomainEvent::Payment(e) => match e {
                PaymentEvent::Succeeded { order_id, .. }
                | PaymentEvent::Superseded { order_id, .. }
                | PaymentEvent::Refunded { order_id, .. } => *order_id,
            },
        }
    }
}
