//! Storage port.
//!
//! Two access paths:
//! - plain reads and the payment-attempt writes used while initiating a
//!   payment, which race each other freely and are arbitrated by the live
//!   `(order, method)` uniqueness rule. Each such write waits for any holder
//!   of the order lock and is refused once the order has left `created`;
//! - [`OrderStore::lock_order`], which holds the order exclusively until the
//!   transaction is committed or dropped. Every status change goes through it,
//!   so a confirmation and a cancellation never interleave.

use async_trait::async_trait;
use uuid::Uuid;
use crate::domain::aggregates::{Cart, Order, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus, StockTarget};
use crate::domain::services::{StockAdjustment, TariffTable};
use crate::Result;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_cart(&self, token: &str) -> Result<Option<Cart>>;

    async fn load_tariffs(&self) -> Result<TariffTable>;

    async fn insert_order(&self, order: &Order) -> Result<()>;

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>>;

    /// Newest first. Returns the page and the total count.
    async fn list_orders(&self, status: Option<OrderStatus>, page: u32, per_page: u32) -> Result<(Vec<Order>, i64)>;

    async fn find_live_payment(&self, order_id: Uuid, method: PaymentMethod) -> Result<Option<PaymentRecord>>;

    async fn find_payment_by_transaction(&self, method: PaymentMethod, transaction_id: &str) -> Result<Option<PaymentRecord>>;

    /// Fails with `StorageConflict` when a pending or successful record
    /// already exists for the same order and method, and with
    /// `InvalidTransition` when the order is no longer `created`.
    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<()>;

    /// Compare-and-swap on status: fails with `StorageConflict` when the
    /// stored record is no longer in `expected`. Writing a live record
    /// (a requote) also needs the order to still be `created`.
    async fn update_payment(&self, payment: &PaymentRecord, expected: PaymentStatus) -> Result<()>;

    /// Fails with `OrderNotFound` when there is no such order.
    async fn lock_order(&self, id: Uuid) -> Result<Box<dyn OrderTransaction>>;

    async fn stock_level(&self, target: StockTarget) -> Result<Option<i64>>;
}

/// An order held exclusively. Dropping it without committing discards every
/// change.
#[async_trait]
pub trait OrderTransaction: Send {
    fn order(&self) -> &Order;

    fn order_mut(&mut self) -> &mut Order;

    /// Persists the order with its payments and applies the stock deltas
    /// (floored at zero), all or nothing. Hands the order back with the
    /// events raised while it was held.
    async fn commit(self: Box<Self>, stock: &[StockAdjustment]) -> Result<Order>;

    async fn delete(self: Box<Self>, stock: &[StockAdjustment]) -> Result<()>;
}
