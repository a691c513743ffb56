//! OpenSASE Checkout
//!
//! Order lifecycle for a small shop: cart snapshot, shipping, payment through
//! Stripe, PayPal or the shop counter, stock reservation and cancellation
//! with refunds.
//!
//! ## Features
//! - Order state machine (`created → paid → shipped → completed`, `cancelled`)
//! - One authoritative payment attempt per order and method
//! - Exactly-once stock reservation, tracked explicitly on the order
//! - Shipping tariff bands and carrier pickup points
//! - Postgres and in-memory storage

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod ports;

pub use application::{OrderStateMachine, ShippingRequest};
pub use config::AppConfig;

use domain::aggregates::{OrderError, OrderStatus, PaymentError, PaymentMethod, PaymentStatus};
use domain::services::tariff::TariffError;
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CommerceError {
    #[error("Cart has no orderable items")]
    EmptyCart,

    #[error("Cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment rejected by the provider: {0}")]
    PaymentRejected(String),

    #[error("Webhook rejected: {0}")]
    WebhookRejected(String),

    #[error("Refund failed, order left unchanged: {0}")]
    RefundFailed(String),

    #[error("No shipping tariff for {country}/{mode} at {weight_grams} g")]
    NoTariffFound { country: String, mode: String, weight_grams: u32 },

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Order not found")]
    OrderNotFound,

    #[error("Cart not found")]
    CartNotFound,

    #[error("Payment not found")]
    PaymentNotFound,

    #[error("Payment is {0}, not pending")]
    PaymentNotPending(PaymentStatus),

    #[error("Payment method {0} cannot be used here")]
    UnsupportedPaymentMethod(PaymentMethod),

    #[error("Order total is zero, nothing to pay")]
    NothingToPay,

    #[error("Confirmed amount {confirmed} does not match expected {expected}")]
    AmountMismatch { expected: rust_decimal::Decimal, confirmed: rust_decimal::Decimal },

    #[error("Order is not a store pickup")]
    NotPickupOrder,

    #[error("Order is {0} and can no longer be edited")]
    OrderNotEditable(OrderStatus),

    #[error("Order is {0} and cannot be deleted")]
    OrderNotDeletable(OrderStatus),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Carrier service error: {0}")]
    Carrier(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommerceError {
    /// Caller mistakes, reported as 4xx and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyCart
                | Self::InvalidTransition { .. }
                | Self::NoTariffFound { .. }
                | Self::OrderNotFound
                | Self::CartNotFound
                | Self::PaymentNotFound
                | Self::PaymentNotPending(_)
                | Self::UnsupportedPaymentMethod(_)
                | Self::NothingToPay
                | Self::AmountMismatch { .. }
                | Self::NotPickupOrder
                | Self::OrderNotEditable(_)
                | Self::OrderNotDeletable(_)
                | Self::Validation(_)
                | Self::PaymentRejected(_)
                | Self::WebhookRejected(_)
        )
    }

    /// Transient failures worth one more attempt.
    pub fn is_retriable(&self) -> bool { matches!(self, Self::StorageConflict(_) | Self::GatewayUnavailable(_)) }
}

impl From<OrderError> for CommerceError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::EmptyCart => Self::EmptyCart,
            OrderError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            OrderError::NotEditable(status) => Self::OrderNotEditable(status),
            OrderError::NotPickup => Self::NotPickupOrder,
            OrderError::CurrencyMismatch | OrderError::NegativeShippingCost => Self::Validation(err.to_string()),
        }
    }
}

impl From<PaymentError> for CommerceError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidTransition { from, .. } | PaymentError::NotPending(from) => Self::PaymentNotPending(from),
        }
    }
}

impl From<ports::GatewayError> for CommerceError {
    fn from(err: ports::GatewayError) -> Self {
        match err {
            ports::GatewayError::Unavailable(reason) => Self::GatewayUnavailable(reason),
            ports::GatewayError::Rejected(reason) => Self::PaymentRejected(reason),
            ports::GatewayError::InvalidSignature(reason) => Self::WebhookRejected(reason),
        }
    }
}

impl From<TariffError> for CommerceError {
    fn from(err: TariffError) -> Self {
        match err {
            TariffError::NoTariffFound { country, mode, weight_grams } => Self::NoTariffFound { country, mode, weight_grams },
        }
    }
}

pub type Result<T> = std::result::Result<T, CommerceError>;

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_error_classes() {
        assert!(CommerceError::EmptyCart.is_client_error());
        assert!(!CommerceError::RefundFailed("card expired".into()).is_client_error());
        assert!(!CommerceError::RefundFailed("card expired".into()).is_retriable());
        assert!(CommerceError::StorageConflict("dup".into()).is_retriable());
        let e: CommerceError = OrderError::InvalidTransition { from: OrderStatus::Cancelled, to: OrderStatus::Paid }.into();
        assert_eq!(e.to_string(), "Cannot move order from cancelled to paid");

        let unsigned: CommerceError = ports::GatewayError::InvalidSignature("missing".into()).into();
        assert!(matches!(unsigned, CommerceError::WebhookRejected(_)));
        let down: CommerceError = ports::GatewayError::Unavailable("timeout".into()).into();
        assert!(down.is_retriable() && !down.is_client_error());
    }
}
