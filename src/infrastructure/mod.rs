//! Adapters for the ports: storage, payment gateways, notifications.
pub mod gateways;
pub mod memory;
pub mod notifier;
pub mod postgres;

pub use gateways::{SignedCallback, SimulatedGateway, SIGNATURE_HEADER};
pub use memory::MemoryOrderStore;
pub use notifier::{LogNotifier, NatsNotifier};
pub use postgres::PgOrderStore;

use crate::domain::aggregates::{PaymentRecord, PaymentStatus};

/// Payments a locked transaction touched, each paired with the status it had
/// when the order was locked (`None` for a record added under the lock).
pub(crate) fn changed_payments<'a>(original: &[PaymentRecord], current: &'a [PaymentRecord]) -> Vec<(&'a PaymentRecord, Option<PaymentStatus>)> {
    current.iter()
        .filter_map(|payment| match original.iter().find(|o| o.id == payment.id) {
            Some(before) if before == payment => None,
            Some(before) => Some((payment, Some(before.status))),
            None => Some((payment, None)),
        })
        .collect()
}
