//! Payment gateway port (Stripe, PayPal, ...).
//!
//! Each gateway is an instance built once with its own credentials and handed
//! to the state machine; nothing is configured process-wide.
//!
//! The provider is the only authority on whether money moved: payments are
//! settled from [`PaymentGateway::capture`] or from a callback that passed
//! [`PaymentGateway::verify_webhook`], never from what a client reports.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::PaymentMethod;
use crate::domain::value_objects::Money;

/// What the storefront needs to finish a payment client-side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IntentHandle {
    pub transaction_id: String,
    pub client_secret: String,
}

/// A provider callback whose signature checked out.
#[derive(Clone, Debug, PartialEq)]
pub struct WebhookEvent {
    pub transaction_id: String,
    /// Only success events settle a payment; the rest are acknowledged.
    pub succeeded: bool,
    pub amount: Money,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unavailable(String),
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
    #[error("{0}")]
    InvalidSignature(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Creates the provider-side payment object, or updates `existing` when
    /// the order already has one. Calls repeated with the same
    /// `idempotency_key` must resolve to the same provider object.
    async fn create_or_update_intent(
        &self,
        order_id: Uuid,
        amount: &Money,
        idempotency_key: &str,
        existing: Option<&str>,
    ) -> Result<IntentHandle, GatewayError>;

    async fn retrieve_intent(&self, transaction_id: &str) -> Result<IntentHandle, GatewayError>;

    /// Collects the payment, or checks that it was already collected, and
    /// returns the amount the provider holds. Fails with `Rejected` while the
    /// customer has not paid.
    async fn capture(&self, transaction_id: &str) -> Result<Money, GatewayError>;

    /// Authenticates a callback from its raw body and signature header before
    /// anything in it is read.
    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent, GatewayError>;

    async fn refund(&self, transaction_id: &str, amount: &Money) -> Result<(), GatewayError>;
}

/// Gateways by payment method. Counter payments have none.
#[derive(Clone, Default)]
pub struct PaymentGateways {
    by_method: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl PaymentGateways {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.by_method.insert(gateway.method(), gateway);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<&Arc<dyn PaymentGateway>> { self.by_method.get(&method) }

    pub fn methods(&self) -> impl Iterator<Item = PaymentMethod> + '_ { self.by_method.keys().copied() }
}
