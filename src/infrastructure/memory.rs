//! In-process store with the same guarantees as the Postgres adapter: one
//! lock per order, at most one live payment per (order, method), and commits
//! that apply order, payments and stock together or not at all.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::domain::aggregates::{Cart, Order, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus, Product, StockTarget};
use crate::domain::services::{StockAdjustment, TariffRow, TariffTable};
use crate::infrastructure::changed_payments;
use crate::ports::{OrderStore, OrderTransaction};
use crate::{CommerceError, Result};

#[derive(Default)]
struct Tables {
    carts: HashMap<String, Cart>,
    orders: HashMap<Uuid, Order>,
    payments: Vec<PaymentRecord>,
    products: HashMap<Uuid, Product>,
    tariffs: Vec<TariffRow>,
}

impl Tables {
    fn hydrate(&self, id: Uuid) -> Option<Order> {
        let mut order = self.orders.get(&id)?.clone();
        order.set_payments(self.payments.iter().filter(|p| p.order_id == id).cloned().collect());
        Some(order)
    }

    fn live_duplicate(&self, payment: &PaymentRecord) -> bool {
        payment.is_live()
            && self.payments.iter().any(|p| p.id != payment.id && p.order_id == payment.order_id && p.method == payment.method && p.is_live())
    }

    fn stored_status(&self, id: Uuid) -> Option<PaymentStatus> { self.payments.iter().find(|p| p.id == id).map(|p| p.status) }

    fn upsert_payment(&mut self, payment: &PaymentRecord) {
        match self.payments.iter_mut().find(|p| p.id == payment.id) {
            Some(stored) => *stored = payment.clone(),
            None => self.payments.push(payment.clone()),
        }
    }

    fn check_payment(&self, payment: &PaymentRecord, expected: Option<PaymentStatus>) -> Result<()> {
        if let Some(expected) = expected {
            if self.stored_status(payment.id) != Some(expected) {
                return Err(CommerceError::StorageConflict(format!("payment {} is no longer {}", payment.id, expected)));
            }
        }
        if self.live_duplicate(payment) {
            return Err(CommerceError::StorageConflict(format!("order {} already has a live {} payment", payment.order_id, payment.method)));
        }
        Ok(())
    }

    /// Write made outside a transaction; the caller holds the order lock.
    fn write_unlocked(&mut self, payment: &PaymentRecord, expected: Option<PaymentStatus>) -> Result<()> {
        let status = self.orders.get(&payment.order_id).map(|o| o.status()).ok_or(CommerceError::OrderNotFound)?;
        if payment.is_live() && status != OrderStatus::Created {
            return Err(CommerceError::InvalidTransition { from: status, to: OrderStatus::Paid });
        }
        self.check_payment(payment, expected)?;
        self.upsert_payment(payment);
        Ok(())
    }

    fn apply_stock(&mut self, stock: &[StockAdjustment]) {
        for adjustment in stock {
            let applied = self.products.values_mut().any(|p| p.adjust_stock(adjustment.target, adjustment.delta));
            if !applied {
                tracing::debug!(stock = ?adjustment.target, "Stock target no longer exists");
            }
        }
    }

    fn store_order(&mut self, order: &Order) {
        let mut stored = order.clone();
        stored.take_events();
        stored.set_payments(Vec::new());
        self.orders.insert(order.id(), stored);
    }

    /// Validates everything before writing anything.
    fn commit(&mut self, order: &Order, original: &[PaymentRecord], stock: &[StockAdjustment]) -> Result<()> {
        if !self.orders.contains_key(&order.id()) {
            return Err(CommerceError::OrderNotFound);
        }
        let changed = changed_payments(original, order.payments());
        for (payment, expected) in &changed {
            self.check_payment(payment, *expected)?;
        }
        for (payment, _) in changed {
            self.upsert_payment(payment);
        }
        self.apply_stock(stock);
        self.store_order(order);
        Ok(())
    }
}

type OrderLocks = Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>;

/// Cheap to clone; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryOrderStore {
    tables: Arc<Mutex<Tables>>,
    locks: OrderLocks,
}

impl MemoryOrderStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_tariffs(self, rows: impl IntoIterator<Item = TariffRow>) -> Self {
        self.tables.lock().tariffs.extend(rows);
        self
    }

    pub fn put_cart(&self, cart: Cart) { self.tables.lock().carts.insert(cart.token().to_string(), cart); }

    pub fn put_product(&self, product: Product) { self.tables.lock().products.insert(product.id(), product); }

    pub fn product(&self, id: Uuid) -> Option<Product> { self.tables.lock().products.get(&id).cloned() }

    pub fn payments_of(&self, order_id: Uuid) -> Vec<PaymentRecord> {
        self.tables.lock().payments.iter().filter(|p| p.order_id == order_id).cloned().collect()
    }

    /// Lock entries exist only for stored orders and go away with them.
    fn order_lock(&self, id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>> {
        if !self.tables.lock().orders.contains_key(&id) {
            return Err(CommerceError::OrderNotFound);
        }
        Ok(self.locks.lock().entry(id).or_default().clone())
    }

    async fn write_unlocked(&self, payment: &PaymentRecord, expected: Option<PaymentStatus>) -> Result<()> {
        let lock = self.order_lock(payment.order_id)?;
        let _held = lock.lock().await;
        self.tables.lock().write_unlocked(payment, expected)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn load_cart(&self, token: &str) -> Result<Option<Cart>> { Ok(self.tables.lock().carts.get(token).cloned()) }

    async fn load_tariffs(&self) -> Result<TariffTable> { Ok(TariffTable::new(self.tables.lock().tariffs.clone())) }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.orders.contains_key(&order.id()) {
            return Err(CommerceError::StorageConflict(format!("order {} already exists", order.id())));
        }
        for payment in order.payments() {
            tables.upsert_payment(payment);
        }
        tables.store_order(order);
        Ok(())
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>> { Ok(self.tables.lock().hydrate(id)) }

    async fn list_orders(&self, status: Option<OrderStatus>, page: u32, per_page: u32) -> Result<(Vec<Order>, i64)> {
        let tables = self.tables.lock();
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, Uuid)> = tables.orders.values()
            .filter(|o| status.map_or(true, |s| o.status() == s))
            .map(|o| (o.created_at(), o.id()))
            .collect();
        ids.sort_by(|a, b| b.cmp(a));
        let total = ids.len() as i64;
        let skip = page.saturating_sub(1) as usize * per_page as usize;
        let orders = ids.into_iter().skip(skip).take(per_page as usize).filter_map(|(_, id)| tables.hydrate(id)).collect();
        Ok((orders, total))
    }

    async fn find_live_payment(&self, order_id: Uuid, method: PaymentMethod) -> Result<Option<PaymentRecord>> {
        Ok(self.tables.lock().payments.iter().find(|p| p.order_id == order_id && p.method == method && p.is_live()).cloned())
    }

    async fn find_payment_by_transaction(&self, method: PaymentMethod, transaction_id: &str) -> Result<Option<PaymentRecord>> {
        Ok(self.tables.lock().payments.iter()
            .find(|p| p.method == method && p.transaction_id.as_deref() == Some(transaction_id))
            .cloned())
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<()> { self.write_unlocked(payment, None).await }

    async fn update_payment(&self, payment: &PaymentRecord, expected: PaymentStatus) -> Result<()> {
        self.write_unlocked(payment, Some(expected)).await
    }

    async fn lock_order(&self, id: Uuid) -> Result<Box<dyn OrderTransaction>> {
        let guard = self.order_lock(id)?.lock_owned().await;
        // Deleted while we waited.
        let Some(order) = self.tables.lock().hydrate(id) else {
            self.locks.lock().remove(&id);
            return Err(CommerceError::OrderNotFound);
        };
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            locks: Arc::clone(&self.locks),
            original: order.payments().to_vec(),
            order,
            _guard: guard,
        }))
    }

    async fn stock_level(&self, target: StockTarget) -> Result<Option<i64>> {
        Ok(self.tables.lock().products.values().find_map(|p| p.stock_of(target)))
    }
}

struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    locks: OrderLocks,
    order: Order,
    original: Vec<PaymentRecord>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl OrderTransaction for MemoryTransaction {
    fn order(&self) -> &Order { &self.order }

    fn order_mut(&mut self) -> &mut Order { &mut self.order }

    async fn commit(self: Box<Self>, stock: &[StockAdjustment]) -> Result<Order> {
        let MemoryTransaction { tables, order, original, _guard, .. } = *self;
        tables.lock().commit(&order, &original, stock)?;
        Ok(order)
    }

    async fn delete(self: Box<Self>, stock: &[StockAdjustment]) -> Result<()> {
        let mut tables = self.tables.lock();
        let id = self.order.id();
        if tables.orders.remove(&id).is_none() {
            return Err(CommerceError::OrderNotFound);
        }
        tables.payments.retain(|p| p.order_id != id);
        tables.apply_stock(stock);
        self.locks.lock().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::CartItem;
    use crate::domain::value_objects::{Money, Weight};
    use rust_decimal::Decimal;

    fn seeded() -> (MemoryOrderStore, Order, Uuid) {
        let store = MemoryOrderStore::new();
        let product = Product::create("Collier", 5);
        let product_id = product.id();
        store.put_product(product);
        let mut cart = Cart::new("tok", "EUR");
        cart.add_item(CartItem {
            product_id: Some(product_id), variant_id: None, name: "Collier".into(), quantity: 2,
            unit_price: Money::eur(Decimal::new(1500, 2)), unit_weight: Weight::kg(Decimal::new(2, 1)),
        });
        let order = Order::from_cart(&cart).unwrap();
        (store, order, product_id)
    }

    #[tokio::test]
    async fn test_one_live_payment_per_method() {
        let (store, order, _) = seeded();
        store.insert_order(&order).await.unwrap();
        let first = PaymentRecord::pending(order.id(), PaymentMethod::Stripe, order.total().clone(), "pi_1");
        let second = PaymentRecord::pending(order.id(), PaymentMethod::Stripe, order.total().clone(), "pi_2");
        store.insert_payment(&first).await.unwrap();
        assert!(matches!(store.insert_payment(&second).await, Err(CommerceError::StorageConflict(_))));

        let mut cancelled = first.clone();
        cancelled.transition(PaymentStatus::Cancelled).unwrap();
        store.update_payment(&cancelled, PaymentStatus::Pending).await.unwrap();
        assert!(matches!(store.update_payment(&cancelled, PaymentStatus::Pending).await, Err(CommerceError::StorageConflict(_))));
        store.insert_payment(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_transaction_changes_nothing() {
        let (store, order, product_id) = seeded();
        store.insert_order(&order).await.unwrap();
        {
            let mut tx = store.lock_order(order.id()).await.unwrap();
            tx.order_mut().mark_paid().unwrap();
        }
        assert_eq!(store.find_order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Created);

        let mut tx = store.lock_order(order.id()).await.unwrap();
        tx.order_mut().mark_paid().unwrap();
        let stock = [StockAdjustment { target: StockTarget::Product(product_id), delta: -7 }];
        tx.commit(&stock).await.unwrap();
        assert_eq!(store.find_order(order.id()).await.unwrap().unwrap().status(), OrderStatus::Paid);
        assert_eq!(store.stock_level(StockTarget::Product(product_id)).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_payment() {
        let (store, order, _) = seeded();
        store.insert_order(&order).await.unwrap();
        let pending = PaymentRecord::pending(order.id(), PaymentMethod::Paypal, order.total().clone(), "PAY-1");
        store.insert_payment(&pending).await.unwrap();

        let mut tx = store.lock_order(order.id()).await.unwrap();
        tx.order_mut().payments_mut()[0].transition(PaymentStatus::Success).unwrap();
        let mut superseded = pending.clone();
        superseded.transition(PaymentStatus::Cancelled).unwrap();
        store.tables.lock().upsert_payment(&superseded);
        assert!(matches!(tx.commit(&[]).await, Err(CommerceError::StorageConflict(_))));
    }

    #[tokio::test]
    async fn test_unlocked_write_waits_for_the_order_lock() {
        let (store, order, _) = seeded();
        store.insert_order(&order).await.unwrap();
        let mut tx = store.lock_order(order.id()).await.unwrap();
        tx.order_mut().cancel().unwrap();

        let writer = store.clone();
        let pending = PaymentRecord::pending(order.id(), PaymentMethod::Stripe, order.total().clone(), "pi_late");
        let insert = tokio::spawn(async move { writer.insert_payment(&pending).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!insert.is_finished());

        tx.commit(&[]).await.unwrap();
        let refused = insert.await.unwrap();
        assert!(matches!(refused, Err(CommerceError::InvalidTransition { from: OrderStatus::Cancelled, .. })));
        assert!(store.payments_of(order.id()).is_empty());
    }

    #[tokio::test]
    async fn test_requote_refused_after_order_moved_on() {
        let (store, order, _) = seeded();
        store.insert_order(&order).await.unwrap();
        let pending = PaymentRecord::pending(order.id(), PaymentMethod::Paypal, order.total().clone(), "PAY-1");
        store.insert_payment(&pending).await.unwrap();

        let mut tx = store.lock_order(order.id()).await.unwrap();
        tx.order_mut().mark_paid().unwrap();
        tx.commit(&[]).await.unwrap();

        let mut requoted = pending.clone();
        requoted.requote(Money::eur(Decimal::new(4500, 2))).unwrap();
        let result = store.update_payment(&requoted, PaymentStatus::Pending).await;
        assert!(matches!(result, Err(CommerceError::InvalidTransition { from: OrderStatus::Paid, .. })));

        let mut closed = pending.clone();
        closed.transition(PaymentStatus::Cancelled).unwrap();
        store.update_payment(&closed, PaymentStatus::Pending).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_outlive_orders() {
        let (store, order, _) = seeded();
        assert!(matches!(store.lock_order(order.id()).await, Err(CommerceError::OrderNotFound)));
        assert!(store.locks.lock().is_empty());

        store.insert_order(&order).await.unwrap();
        let tx = store.lock_order(order.id()).await.unwrap();
        assert_eq!(store.locks.lock().len(), 1);
        tx.delete(&[]).await.unwrap();
        assert!(store.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let (store, first, _) = seeded();
        store.insert_order(&first).await.unwrap();
        let (_, second, _) = seeded();
        store.insert_order(&second).await.unwrap();
        let (page, total) = store.list_orders(None, 1, 1).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        let (paid, total) = store.list_orders(Some(OrderStatus::Paid), 1, 20).await.unwrap();
        assert!(paid.is_empty());
        assert_eq!(total, 0);
    }
}
