//! Runtime configuration, read from the environment (and `.env` when present).

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use crate::domain::value_objects::VatRate;
use crate::{CommerceError, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub currency: String,
    pub vat_rate: VatRate,
    pub gateway_timeout: Duration,
    pub notification_timeout: Duration,
    pub nats_url: Option<String>,
    /// `PAYMENT_GATEWAY=simulated`. No provider adapter is built in, so
    /// provider credentials are refused unless the sandbox is asked for.
    pub simulated_payments: bool,
    pub stripe: Option<GatewayCredentials>,
    pub paypal: Option<GatewayCredentials>,
}

/// Credentials for one payment provider. Never logged.
#[derive(Clone)]
pub struct GatewayCredentials {
    pub client_id: Option<String>,
    pub secret: String,
    /// Signs provider callbacks. Without it every webhook is refused.
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("client_id", &self.client_id)
            .field("secret", &"[REDACTED]")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` uses the
    /// process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = get("DATABASE_URL").ok_or_else(|| CommerceError::Config("DATABASE_URL must be set".into()))?;
        let port = parse_or(&get, "PORT", 8083u16)?;
        let currency = get("CURRENCY").unwrap_or_else(|| "EUR".to_string()).to_uppercase();
        let vat = parse_or(&get, "VAT_RATE", Decimal::new(20, 2))?;
        let vat_rate = VatRate::new(vat).ok_or_else(|| CommerceError::Config(format!("VAT_RATE must not be negative, got {}", vat)))?;
        let gateway_timeout = Duration::from_secs(parse_or(&get, "GATEWAY_TIMEOUT_SECS", 10u64)?);
        let notification_timeout = Duration::from_secs(parse_or(&get, "NOTIFICATION_TIMEOUT_SECS", 5u64)?);
        let nats_url = get("NATS_URL").filter(|s| !s.is_empty());

        let simulated_payments = match get("PAYMENT_GATEWAY").filter(|s| !s.trim().is_empty()) {
            None => false,
            Some(backend) if backend.trim().eq_ignore_ascii_case("simulated") => true,
            Some(other) => return Err(CommerceError::Config(format!("Unknown PAYMENT_GATEWAY {:?}, only \"simulated\" is available", other))),
        };

        let stripe_webhook = get("STRIPE_WEBHOOK_SECRET").filter(|s| !s.is_empty());
        let stripe = get("STRIPE_SECRET_KEY").filter(|s| !s.is_empty())
            .map(|secret| GatewayCredentials { client_id: None, secret, webhook_secret: stripe_webhook });
        let paypal_webhook = get("PAYPAL_WEBHOOK_SECRET").filter(|s| !s.is_empty());
        let paypal = match (get("PAYPAL_CLIENT_ID"), get("PAYPAL_CLIENT_SECRET")) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some(GatewayCredentials { client_id: Some(id), secret, webhook_secret: paypal_webhook })
            }
            (None, None) => None,
            _ => return Err(CommerceError::Config("PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET must be set together".into())),
        };
        if !simulated_payments && (stripe.is_some() || paypal.is_some()) {
            return Err(CommerceError::Config(
                "Payment credentials are set but no provider adapter is built in; set PAYMENT_GATEWAY=simulated to run the sandbox gateway".into(),
            ));
        }

        tracing::info!(port, currency = %currency, vat = %vat_rate.rate(), simulated_payments, "Configuration loaded");
        Ok(Self {
            database_url, port, currency, vat_rate, gateway_timeout, notification_timeout, nats_url,
            simulated_payments, stripe, paypal,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|e| CommerceError::Config(format!("Invalid {}: {}", key, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/shop")])).unwrap();
        assert_eq!(cfg.port, 8083);
        assert_eq!(cfg.currency, "EUR");
        assert_eq!(cfg.vat_rate.rate(), Decimal::new(20, 2));
        assert_eq!(cfg.gateway_timeout, Duration::from_secs(10));
        assert!(cfg.stripe.is_none() && cfg.paypal.is_none());
        assert!(!cfg.simulated_payments);
    }

    #[test]
    fn test_credentials_never_select_the_simulator() {
        let live = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "x"), ("STRIPE_SECRET_KEY", "sk_live_123")]));
        assert!(matches!(live, Err(CommerceError::Config(_))));
        let unknown = AppConfig::from_lookup(lookup(&[("DATABASE_URL", "x"), ("PAYMENT_GATEWAY", "stripe")]));
        assert!(matches!(unknown, Err(CommerceError::Config(_))));

        let sandbox = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "x"), ("PAYMENT_GATEWAY", "simulated"),
            ("STRIPE_SECRET_KEY", "sk_test_123"), ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
        ]))
        .unwrap();
        assert!(sandbox.simulated_payments);
        assert_eq!(sandbox.stripe.and_then(|c| c.webhook_secret).as_deref(), Some("whsec_123"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(AppConfig::from_lookup(lookup(&[])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("DATABASE_URL", "x"), ("VAT_RATE", "-0.1")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("DATABASE_URL", "x"), ("PORT", "eighty")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("DATABASE_URL", "x"), ("PAYPAL_CLIENT_ID", "id")])).is_err());
    }

    #[test]
    fn test_secrets_redacted() {
        let cfg = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "x"), ("PAYMENT_GATEWAY", "simulated"),
            ("STRIPE_SECRET_KEY", "sk_test_123"), ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
        ]))
        .unwrap();
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("sk_test_123") && !printed.contains("whsec_123"));
    }
}
