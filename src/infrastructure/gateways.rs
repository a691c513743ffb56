//! Simulated payment gateway.
//!
//! Behaves like a provider with idempotency keys: the same key always yields
//! the same payment object, and an existing object is updated in place. Used
//! where no provider adapter is deployed, and only when the configuration
//! asks for it.
//!
//! Callbacks are signed the way hosted providers sign them: the
//! `Webhook-Signature` header carries `t=<unix seconds>,v1=<base64 tag>`,
//! the tag being HMAC-SHA256 over `"<t>.<raw body>"` with the webhook secret.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::GatewayCredentials;
use crate::domain::aggregates::PaymentMethod;
use crate::domain::value_objects::Money;
use crate::ports::{GatewayError, IntentHandle, PaymentGateway, WebhookEvent};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "webhook-signature";
const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
/// Older callbacks are refused, so a captured body cannot be replayed later.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct SimulatedIntent {
    handle: IntentHandle,
    order_id: Uuid,
    amount: Money,
    paid: bool,
    refunded: bool,
}

#[derive(Default)]
struct Ledger {
    by_key: HashMap<String, String>,
    intents: HashMap<String, SimulatedIntent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CallbackBody {
    #[serde(rename = "type")]
    kind: String,
    transaction_id: String,
    order_id: Uuid,
    amount: Decimal,
    currency: String,
}

/// A callback as the provider would deliver it.
#[derive(Debug, Clone)]
pub struct SignedCallback {
    pub payload: Vec<u8>,
    pub signature: String,
}

pub struct SimulatedGateway {
    method: PaymentMethod,
    credentials: GatewayCredentials,
    ledger: Mutex<Ledger>,
}

impl SimulatedGateway {
    pub fn new(method: PaymentMethod, credentials: GatewayCredentials) -> Self {
        Self { method, credentials, ledger: Mutex::new(Ledger::default()) }
    }

    fn account(&self) -> &str { self.credentials.client_id.as_deref().unwrap_or("default") }

    fn new_transaction_id(&self) -> String {
        match self.method {
            PaymentMethod::Paypal => format!("PAYPAL-{}", Uuid::new_v4().simple()).to_uppercase(),
            _ => format!("pi_{}", Uuid::new_v4().simple()),
        }
    }

    fn webhook_secret(&self) -> Result<&str, GatewayError> {
        self.credentials.webhook_secret.as_deref()
            .ok_or_else(|| GatewayError::InvalidSignature("no webhook secret configured".into()))
    }

    /// Plays the customer's side: the payment is marked collected and the
    /// signed success callback the provider would send is returned.
    pub fn complete(&self, transaction_id: &str) -> Result<SignedCallback, GatewayError> {
        let body = {
            let mut ledger = self.ledger.lock();
            let intent = ledger.intents.get_mut(transaction_id)
                .ok_or_else(|| GatewayError::Rejected(format!("no such payment {}", transaction_id)))?;
            if intent.refunded {
                return Err(GatewayError::Rejected(format!("payment {} was refunded", transaction_id)));
            }
            intent.paid = true;
            CallbackBody {
                kind: PAYMENT_SUCCEEDED.to_string(),
                transaction_id: transaction_id.to_string(),
                order_id: intent.order_id,
                amount: intent.amount.amount(),
                currency: intent.amount.currency().to_string(),
            }
        };
        let payload = serde_json::to_vec(&body).map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let signature = signature_header(self.webhook_secret()?, Utc::now().timestamp(), &payload)?;
        info!(%transaction_id, order_id = %body.order_id, "Simulated payment completed");
        Ok(SignedCallback { payload, signature })
    }
}

fn signer(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| GatewayError::InvalidSignature(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, GatewayError> {
    let tag = signer(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={},v1={}", timestamp, STANDARD.encode(tag)))
}

fn parse_signature(header: &str) -> Result<(i64, Vec<u8>), GatewayError> {
    let mut timestamp = None;
    let mut tag = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", v)) => tag = STANDARD.decode(v).ok(),
            _ => {}
        }
    }
    match (timestamp, tag) {
        (Some(t), Some(tag)) => Ok((t, tag)),
        _ => Err(GatewayError::InvalidSignature("malformed signature header".into())),
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn method(&self) -> PaymentMethod { self.method }

    #[instrument(skip(self, amount), fields(gateway = %self.method, account = %self.account(), amount = %amount))]
    async fn create_or_update_intent(&self, order_id: Uuid, amount: &Money, idempotency_key: &str, existing: Option<&str>) -> Result<IntentHandle, GatewayError> {
        if !amount.is_positive() {
            return Err(GatewayError::Rejected("amount must be greater than zero".into()));
        }
        let mut ledger = self.ledger.lock();
        let known = existing
            .filter(|id| ledger.intents.contains_key(*id))
            .map(str::to_string)
            .or_else(|| ledger.by_key.get(idempotency_key).cloned());

        if let Some(transaction_id) = known {
            if let Some(intent) = ledger.intents.get_mut(&transaction_id) {
                if intent.paid {
                    return Err(GatewayError::Rejected(format!("payment {} is already collected", transaction_id)));
                }
                intent.amount = amount.clone();
                info!(%transaction_id, "Simulated payment updated");
                return Ok(intent.handle.clone());
            }
        }

        let transaction_id = self.new_transaction_id();
        let handle = IntentHandle {
            client_secret: format!("{}_secret_{}", transaction_id, Uuid::new_v4().simple()),
            transaction_id: transaction_id.clone(),
        };
        ledger.by_key.insert(idempotency_key.to_string(), transaction_id.clone());
        ledger.intents.insert(
            transaction_id.clone(),
            SimulatedIntent { handle: handle.clone(), order_id, amount: amount.clone(), paid: false, refunded: false },
        );
        info!(%transaction_id, "Simulated payment created");
        Ok(handle)
    }

    async fn retrieve_intent(&self, transaction_id: &str) -> Result<IntentHandle, GatewayError> {
        self.ledger.lock().intents.get(transaction_id)
            .map(|i| i.handle.clone())
            .ok_or_else(|| GatewayError::Rejected(format!("no such payment {}", transaction_id)))
    }

    async fn capture(&self, transaction_id: &str) -> Result<Money, GatewayError> {
        let ledger = self.ledger.lock();
        let intent = ledger.intents.get(transaction_id)
            .ok_or_else(|| GatewayError::Rejected(format!("no such payment {}", transaction_id)))?;
        match (intent.paid, intent.refunded) {
            (_, true) => Err(GatewayError::Rejected(format!("payment {} was refunded", transaction_id))),
            (false, _) => Err(GatewayError::Rejected(format!("payment {} has not been completed by the customer", transaction_id))),
            (true, false) => Ok(intent.amount.clone()),
        }
    }

    fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookEvent, GatewayError> {
        let secret = self.webhook_secret()?;
        let (timestamp, tag) = parse_signature(signature)?;
        let age = (Utc::now().timestamp() - timestamp).abs();
        if age > SIGNATURE_TOLERANCE_SECS {
            return Err(GatewayError::InvalidSignature(format!("signature is {} s old", age)));
        }
        signer(secret, timestamp, payload)?
            .verify_slice(&tag)
            .map_err(|_| GatewayError::InvalidSignature("signature does not match".into()))?;

        let body: CallbackBody = serde_json::from_slice(payload).map_err(|e| GatewayError::Rejected(format!("malformed event: {}", e)))?;
        Ok(WebhookEvent {
            succeeded: body.kind == PAYMENT_SUCCEEDED,
            amount: Money::new(body.amount, &body.currency),
            transaction_id: body.transaction_id,
        })
    }

    #[instrument(skip(self, amount), fields(gateway = %self.method, amount = %amount))]
    async fn refund(&self, transaction_id: &str, amount: &Money) -> Result<(), GatewayError> {
        let mut ledger = self.ledger.lock();
        let intent = ledger.intents.get_mut(transaction_id)
            .ok_or_else(|| GatewayError::Rejected(format!("no such payment {}", transaction_id)))?;
        if !intent.paid {
            return Err(GatewayError::Rejected(format!("payment {} was never collected", transaction_id)));
        }
        if intent.refunded {
            return Err(GatewayError::Rejected(format!("payment {} already refunded", transaction_id)));
        }
        if amount.amount() > intent.amount.amount() {
            return Err(GatewayError::Rejected(format!("refund of {} exceeds {}", amount, intent.amount)));
        }
        intent.refunded = true;
        info!("Simulated refund issued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(method: PaymentMethod, webhook_secret: Option<&str>) -> SimulatedGateway {
        let credentials = GatewayCredentials { client_id: None, secret: "sk_test".into(), webhook_secret: webhook_secret.map(String::from) };
        SimulatedGateway::new(method, credentials)
    }

    #[tokio::test]
    async fn test_same_key_same_intent() {
        let gw = gateway(PaymentMethod::Stripe, Some("whsec"));
        let order = Uuid::new_v4();
        let first = gw.create_or_update_intent(order, &Money::eur(Decimal::TEN), "order-1-stripe", None).await.unwrap();
        let again = gw.create_or_update_intent(order, &Money::eur(Decimal::new(25, 0)), "order-1-stripe", None).await.unwrap();
        assert_eq!(first, again);
        assert!(first.transaction_id.starts_with("pi_"));

        gw.complete(&first.transaction_id).unwrap();
        assert_eq!(gw.capture(&first.transaction_id).await.unwrap().amount(), Decimal::new(25, 0));
        let late = gw.create_or_update_intent(order, &Money::eur(Decimal::ONE), "order-1-stripe", None).await;
        assert!(matches!(late, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_capture_waits_for_the_customer() {
        let gw = gateway(PaymentMethod::Stripe, Some("whsec"));
        let handle = gw.create_or_update_intent(Uuid::new_v4(), &Money::eur(Decimal::TEN), "k", None).await.unwrap();
        assert!(matches!(gw.capture(&handle.transaction_id).await, Err(GatewayError::Rejected(_))));
        assert!(matches!(gw.capture("pi_unknown").await, Err(GatewayError::Rejected(_))));
        gw.complete(&handle.transaction_id).unwrap();
        assert_eq!(gw.capture(&handle.transaction_id).await.unwrap(), Money::eur(Decimal::TEN));
    }

    #[tokio::test]
    async fn test_refund_once() {
        let gw = gateway(PaymentMethod::Paypal, Some("whsec"));
        let handle = gw.create_or_update_intent(Uuid::new_v4(), &Money::eur(Decimal::TEN), "k", None).await.unwrap();
        assert!(handle.transaction_id.starts_with("PAYPAL-"));
        assert!(gw.refund(&handle.transaction_id, &Money::eur(Decimal::TEN)).await.is_err());
        gw.complete(&handle.transaction_id).unwrap();
        gw.refund(&handle.transaction_id, &Money::eur(Decimal::TEN)).await.unwrap();
        assert!(gw.refund(&handle.transaction_id, &Money::eur(Decimal::TEN)).await.is_err());
        assert!(gw.refund("unknown", &Money::eur(Decimal::ONE)).await.is_err());
    }

    #[tokio::test]
    async fn test_signed_callback_verifies() {
        let gw = gateway(PaymentMethod::Stripe, Some("whsec_live"));
        let order = Uuid::new_v4();
        let handle = gw.create_or_update_intent(order, &Money::eur(Decimal::new(2594, 2)), "k", None).await.unwrap();
        let callback = gw.complete(&handle.transaction_id).unwrap();

        let event = gw.verify_webhook(&callback.payload, &callback.signature).unwrap();
        assert!(event.succeeded);
        assert_eq!(event.transaction_id, handle.transaction_id);
        assert_eq!(event.amount, Money::eur(Decimal::new(2594, 2)));
        let body: serde_json::Value = serde_json::from_slice(&callback.payload).unwrap();
        assert_eq!(body["order_id"], order.to_string());
    }

    #[tokio::test]
    async fn test_forged_callbacks_are_refused() {
        let gw = gateway(PaymentMethod::Stripe, Some("whsec_live"));
        let handle = gw.create_or_update_intent(Uuid::new_v4(), &Money::eur(Decimal::TEN), "k", None).await.unwrap();
        let callback = gw.complete(&handle.transaction_id).unwrap();

        let mut tampered: serde_json::Value = serde_json::from_slice(&callback.payload).unwrap();
        tampered["amount"] = serde_json::json!("1000.00");
        let tampered = serde_json::to_vec(&tampered).unwrap();
        let refused = |payload: &[u8], signature: &str| matches!(gw.verify_webhook(payload, signature), Err(GatewayError::InvalidSignature(_)));

        assert!(refused(&tampered, &callback.signature));
        assert!(refused(&callback.payload, ""));
        assert!(refused(&callback.payload, "t=abc,v1=!!"));
        let forged = signature_header("guessed", Utc::now().timestamp(), &callback.payload).unwrap();
        assert!(refused(&callback.payload, &forged));
        let stale = signature_header("whsec_live", Utc::now().timestamp() - 3600, &callback.payload).unwrap();
        assert!(refused(&callback.payload, &stale));

        let unconfigured = gateway(PaymentMethod::Stripe, None);
        assert!(matches!(unconfigured.verify_webhook(&callback.payload, &callback.signature), Err(GatewayError::InvalidSignature(_))));
    }
}
