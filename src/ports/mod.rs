//! Contracts the checkout core depends on. Adapters live in
//! `infrastructure`; tests bring their own.
pub mod carrier;
pub mod gateway;
pub mod notifier;
pub mod store;

pub use carrier::{CarrierError, CarrierRatingService, OpeningHours, PickupPoint, TimeRange};
pub use gateway::{GatewayError, IntentHandle, PaymentGateway, PaymentGateways, WebhookEvent};
pub use notifier::{Notification, NotificationError, NotificationPort};
pub use store::{OrderStore, OrderTransaction};
