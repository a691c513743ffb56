//! Payment record: one attempt to settle an order through one method.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use crate::domain::value_objects::Money;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stripe,
    Paypal,
    /// Cash or card at the shop counter.
    Boutique,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Stripe => "stripe", Self::Paypal => "paypal", Self::Boutique => "boutique" }
    }
    /// Settled through a remote gateway, as opposed to in person.
    pub fn is_online(&self) -> bool { !matches!(self, Self::Boutique) }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for PaymentMethod {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "paypal" => Ok(Self::Paypal),
            "boutique" | "cash" => Ok(Self::Boutique),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus { #[default] Pending, Success, Failed, Cancelled, Refunded }

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending", Self::Success => "success", Self::Failed => "failed",
            Self::Cancelled => "cancelled", Self::Refunded => "refunded",
        }
    }
    /// Pending and successful records are the ones that count; at most one per
    /// (order, method) may be live.
    pub fn is_live(&self) -> bool { matches!(self, Self::Pending | Self::Success) }
    pub fn can_become(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!((self, next), (Pending, Success) | (Pending, Failed) | (Pending, Cancelled) | (Success, Refunded))
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for PaymentStatus {
    type Err = UnknownValue;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending), "success" => Ok(Self::Success), "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled), "refunded" => Ok(Self::Refunded),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)] pub struct UnknownValue(pub String);
impl std::error::Error for UnknownValue {}
impl fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Unknown value '{}'", self.0) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub amount: Money,
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(order_id: Uuid, method: PaymentMethod, amount: Money, transaction_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), order_id, method, status: PaymentStatus::Pending, amount,
            transaction_id: Some(transaction_id.into()), created_at: now, updated_at: now,
        }
    }

    /// A counter payment is recorded only once the money is in hand.
    pub fn counter(order_id: Uuid, amount: Money) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(), order_id, method: PaymentMethod::Boutique, status: PaymentStatus::Success, amount,
            transaction_id: Some(format!("CASH-{}-{}", order_id, now.timestamp())), created_at: now, updated_at: now,
        }
    }

    pub fn is_paid(&self) -> bool { self.status == PaymentStatus::Success }
    pub fn is_pending(&self) -> bool { self.status == PaymentStatus::Pending }
    pub fn is_live(&self) -> bool { self.status.is_live() }

    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), PaymentError> {
        if !self.status.can_become(next) {
            return Err(PaymentError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Re-quotes a pending attempt after the order total moved.
    pub fn requote(&mut self, amount: Money) -> Result<(), PaymentError> {
        if !self.is_pending() { return Err(PaymentError::NotPending(self.status)); }
        self.amount = amount;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError { InvalidTransition { from: PaymentStatus, to: PaymentStatus }, NotPending(PaymentStatus) }
impl std::error::Error for PaymentError {}
impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => write!(f, "Payment cannot go from {} to {}", from, to),
            Self::NotPending(status) => write!(f, "Payment is {}, not pending", status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    #[test]
    fn test_forward_only() {
        let mut p = PaymentRecord::pending(Uuid::new_v4(), PaymentMethod::Stripe, Money::eur(Decimal::new(25, 0)), "pi_1");
        p.transition(PaymentStatus::Success).unwrap();
        assert!(p.transition(PaymentStatus::Pending).is_err());
        assert!(p.requote(Money::eur(Decimal::ONE)).is_err());
        p.transition(PaymentStatus::Refunded).unwrap();
        assert!(!p.is_live());
    }
    #[test]
    fn test_counter_record_is_settled() {
        let order = Uuid::new_v4();
        let p = PaymentRecord::counter(order, Money::eur(Decimal::new(12, 0)));
        assert!(p.is_paid());
        assert!(p.transaction_id.unwrap().starts_with(&format!("CASH-{}-", order)));
    }
    #[test]
    fn test_method_parsing() {
        assert_eq!("cash".parse::<PaymentMethod>().unwrap(), PaymentMethod::Boutique);
        assert!("bank_transfer".parse::<PaymentMethod>().is_err());
    }
}
