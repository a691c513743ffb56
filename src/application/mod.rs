//! Application layer: the order state machine coordinating storage, payment
//! gateways, carriers and notifications around the domain aggregates.

pub mod order_machine;

pub use order_machine::{notifications_for, OrderStateMachine, PaymentIntent, ShippingRequest};
