//! Order state machine.
//!
//! Every status change runs under [`OrderStore::lock_order`]: the order is
//! read, mutated and committed together with its payments and stock
//! adjustments, so `stock_reserved` is checked and set in the same unit as the
//! status it goes with. Starting a payment is the one unlocked path; it relies
//! on the store rejecting a second live attempt per (order, method), and on
//! the store refusing live attempts once the order has left `created`.
//!
//! Payments are settled only on the provider's word: a server-side capture
//! or a callback whose signature the gateway verified.
//!
//! Notifications are derived from the events the aggregate raised during the
//! commit, after the commit. A replayed command raises nothing and notifies
//! nobody.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::aggregates::{
    Cart, Carrier, Contact, Order, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus, PickupPointRef,
    ShippingInfo, ShippingMethod,
};
use crate::domain::events::{DomainEvent, OrderEvent, PaymentEvent};
use crate::domain::services::{StockAdjustment, StockLedger, TariffTable};
use crate::domain::value_objects::{Money, VatRate, Weight};
use crate::ports::{
    CarrierRatingService, GatewayError, IntentHandle, Notification, NotificationPort, OrderStore, PaymentGateway,
    PaymentGateways, PickupPoint,
};
use crate::{CommerceError, Result};

const DEFAULT_COUNTRY: &str = "FR";

/// Shipping selection for [`OrderStateMachine::attach_shipping`]. Replaces
/// whatever was attached before.
#[derive(Clone, Debug)]
pub struct ShippingRequest {
    pub method: ShippingMethod,
    /// Tax-inclusive cost. Quoted from the tariff table when absent.
    pub cost: Option<Decimal>,
    pub contact: Contact,
    pub pickup_point: Option<PickupPointRef>,
}

/// Handed to the storefront to finish an online payment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PaymentIntent {
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub transaction_id: String,
    pub client_secret: String,
    pub amount: Money,
}

pub struct OrderStateMachine {
    store: Arc<dyn OrderStore>,
    gateways: PaymentGateways,
    notifier: Arc<dyn NotificationPort>,
    carriers: HashMap<Carrier, Arc<dyn CarrierRatingService>>,
    tariffs: Arc<TariffTable>,
    vat: VatRate,
    currency: String,
    gateway_timeout: Duration,
    notification_timeout: Duration,
}

impl OrderStateMachine {
    pub fn new(store: Arc<dyn OrderStore>, gateways: PaymentGateways, notifier: Arc<dyn NotificationPort>, tariffs: TariffTable) -> Self {
        Self {
            store, gateways, notifier, carriers: HashMap::new(), tariffs: Arc::new(tariffs),
            vat: VatRate::default(), currency: "EUR".to_string(),
            gateway_timeout: Duration::from_secs(10), notification_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_vat(mut self, vat: VatRate) -> Self { self.vat = vat; self }
    pub fn with_currency(mut self, currency: &str) -> Self { self.currency = currency.to_uppercase(); self }
    pub fn with_timeouts(mut self, gateway: Duration, notification: Duration) -> Self {
        self.gateway_timeout = gateway;
        self.notification_timeout = notification;
        self
    }
    pub fn with_carrier(mut self, service: Arc<dyn CarrierRatingService>) -> Self {
        self.carriers.insert(service.carrier(), service);
        self
    }

    pub fn vat(&self) -> VatRate { self.vat }
    pub fn currency(&self) -> &str { &self.currency }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order> {
        self.store.find_order(order_id).await?.ok_or(CommerceError::OrderNotFound)
    }

    pub async fn list_orders(&self, status: Option<OrderStatus>, page: u32, per_page: u32) -> Result<(Vec<Order>, i64)> {
        self.store.list_orders(status, page.max(1), per_page.clamp(1, 100)).await
    }

    // ---------------------------------------------------------------------
    // Order creation and shipping
    // ---------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn create_order(&self, cart_token: &str) -> Result<Order> {
        let cart = self.store.load_cart(cart_token).await?.ok_or(CommerceError::CartNotFound)?;
        self.create_order_from_cart(&cart).await
    }

    /// Prices and weights are copied from the cart now and never re-read.
    #[instrument(skip(self, cart), fields(cart = %cart.token()))]
    pub async fn create_order_from_cart(&self, cart: &Cart) -> Result<Order> {
        let order = Order::from_cart(cart)?;
        self.store.insert_order(&order).await?;
        info!(order_id = %order.id(), total = %order.total(), items = order.items().len(), "Order created");
        Ok(self.publish(order).await)
    }

    #[instrument(skip(self, request), fields(method = %request.method))]
    pub async fn attach_shipping(&self, order_id: Uuid, request: ShippingRequest) -> Result<Order> {
        let request = &request;
        self.retrying("attach_shipping", move || self.try_attach_shipping(order_id, request)).await
    }

    async fn try_attach_shipping(&self, order_id: Uuid, request: &ShippingRequest) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        let order = tx.order();
        if order.status() != OrderStatus::Created {
            return Err(CommerceError::OrderNotEditable(order.status()));
        }
        let cost = match request.cost {
            Some(amount) => Money::new(amount, order.currency()),
            None => self.quote_for(&request.method, order.total_weight(), &request.contact.country, order.currency())?,
        };
        let info = ShippingInfo { contact: request.contact.clone(), pickup_point: request.pickup_point.clone() };
        tx.order_mut().attach_shipping(request.method.clone(), cost, Some(info))?;

        let order = tx.commit(&[]).await?;
        info!(shipping = %order.shipping_cost(), total = %order.total(), "Shipping attached");
        Ok(self.publish(order).await)
    }

    /// Tax-inclusive price for a parcel, rounded to the cent.
    pub fn quote_shipping(&self, weight: Weight, mode_code: &str, country_code: Option<&str>) -> Result<Money> {
        let country = country_code.filter(|c| !c.trim().is_empty()).unwrap_or(DEFAULT_COUNTRY);
        Ok(self.tariffs.quote(weight, mode_code, country, self.vat, &self.currency)?)
    }

    fn quote_for(&self, method: &ShippingMethod, weight: Weight, country: &str, currency: &str) -> Result<Money> {
        let Some(mode) = method.tariff_mode() else { return Ok(Money::zero(currency)) };
        let country = if country.trim().is_empty() { DEFAULT_COUNTRY } else { country };
        Ok(self.tariffs.quote(weight, mode, country, self.vat, currency)?)
    }

    #[instrument(skip(self))]
    pub async fn find_pickup_points(&self, carrier: Carrier, postal_code: &str, country: Option<&str>, weight: Weight) -> Result<Vec<PickupPoint>> {
        if postal_code.trim().is_empty() {
            return Err(CommerceError::Validation("postal code is required".into()));
        }
        let service = self.carriers.get(&carrier)
            .ok_or_else(|| CommerceError::Carrier(format!("{} is not configured", carrier.as_str())))?;
        let country = country.filter(|c| !c.trim().is_empty()).unwrap_or(DEFAULT_COUNTRY);
        let search = service.find_pickup_points(postal_code.trim(), country, weight.to_grams());
        match tokio::time::timeout(self.gateway_timeout, search).await {
            Ok(Ok(points)) => {
                debug!(found = points.len(), "Pickup points found");
                Ok(points)
            }
            Ok(Err(e)) => Err(CommerceError::Carrier(e.to_string())),
            Err(_) => Err(CommerceError::Carrier(format!("no answer within {:?}", self.gateway_timeout))),
        }
    }

    // ---------------------------------------------------------------------
    // Payments
    // ---------------------------------------------------------------------

    /// Opens or refreshes the online payment attempt for `method`, cancelling
    /// any pending attempt made with another method first.
    #[instrument(skip(self))]
    pub async fn initiate_payment(&self, order_id: Uuid, method: PaymentMethod) -> Result<PaymentIntent> {
        if !method.is_online() {
            return Err(CommerceError::UnsupportedPaymentMethod(method));
        }
        let gateway = self.gateways.get(method).cloned().ok_or(CommerceError::UnsupportedPaymentMethod(method))?;
        let order = self.get_order(order_id).await?;
        if order.status() != OrderStatus::Created {
            return Err(CommerceError::InvalidTransition { from: order.status(), to: OrderStatus::Paid });
        }
        if !order.total().is_positive() {
            return Err(CommerceError::NothingToPay);
        }

        self.supersede_pending(&order, method).await?;

        let amount = order.total().clone();
        let key = idempotency_key(order_id, method);
        let handle = match self.store.find_live_payment(order_id, method).await? {
            Some(existing) => self.refresh_intent(gateway.as_ref(), existing, &amount, &key).await?,
            None => self.open_intent(gateway.as_ref(), order_id, &amount, &key).await?,
        };
        Ok(PaymentIntent { order_id, method, transaction_id: handle.transaction_id, client_secret: handle.client_secret, amount })
    }

    async fn supersede_pending(&self, order: &Order, method: PaymentMethod) -> Result<()> {
        for stale in order.payments().iter().filter(|p| p.method != method && p.is_pending()) {
            let mut cancelled = stale.clone();
            cancelled.transition(PaymentStatus::Cancelled)?;
            self.store.update_payment(&cancelled, PaymentStatus::Pending).await?;
            info!(superseded = %stale.method, by = %method, "Pending payment superseded");
        }
        Ok(())
    }

    async fn refresh_intent(&self, gateway: &dyn PaymentGateway, mut payment: PaymentRecord, amount: &Money, key: &str) -> Result<IntentHandle> {
        if !payment.is_pending() {
            return Err(CommerceError::PaymentNotPending(payment.status));
        }
        let existing = payment.transaction_id.clone();
        let handle = self.gateway_call(gateway.create_or_update_intent(payment.order_id, amount, key, existing.as_deref())).await?;
        if payment.amount != *amount {
            payment.requote(amount.clone())?;
        }
        payment.transaction_id = Some(handle.transaction_id.clone());
        // Written even when unchanged: the handle is only handed out while the
        // attempt is still pending on a `created` order.
        self.store.update_payment(&payment, PaymentStatus::Pending).await?;
        debug!(transaction_id = %handle.transaction_id, amount = %amount, "Pending payment reused");
        Ok(handle)
    }

    async fn open_intent(&self, gateway: &dyn PaymentGateway, order_id: Uuid, amount: &Money, key: &str) -> Result<IntentHandle> {
        let handle = self.gateway_call(gateway.create_or_update_intent(order_id, amount, key, None)).await?;
        let record = PaymentRecord::pending(order_id, gateway.method(), amount.clone(), handle.transaction_id.clone());
        match self.store.insert_payment(&record).await {
            Ok(()) => {
                info!(transaction_id = %handle.transaction_id, amount = %amount, "Payment initiated");
                Ok(handle)
            }
            Err(e @ CommerceError::InvalidTransition { .. }) => {
                warn!(transaction_id = %handle.transaction_id, error = %e, "Order moved on during initiation, intent discarded");
                Err(e)
            }
            Err(CommerceError::StorageConflict(reason)) => {
                debug!(%reason, "Lost the payment insert race, reading the winner");
                let winner = self.store.find_live_payment(order_id, gateway.method()).await?
                    .ok_or(CommerceError::StorageConflict(reason))?;
                let transaction_id = winner.transaction_id.ok_or(CommerceError::PaymentNotFound)?;
                Ok(self.gateway_call(gateway.retrieve_intent(&transaction_id)).await?)
            }
            Err(e) => Err(e),
        }
    }

    /// Asks the provider whether the attempt was paid and settles it with the
    /// amount the provider holds. The caller only names the transaction.
    #[instrument(skip(self))]
    pub async fn capture_payment(&self, order_id: Uuid, method: PaymentMethod, transaction_id: &str) -> Result<Order> {
        let gateway = self.gateways.get(method).cloned().ok_or(CommerceError::UnsupportedPaymentMethod(method))?;
        let order = self.get_order(order_id).await?;
        let known = order.payments().iter().any(|p| p.method == method && p.transaction_id.as_deref() == Some(transaction_id));
        if !known {
            return Err(CommerceError::PaymentNotFound);
        }
        let collected = self.gateway_call(gateway.capture(transaction_id)).await?;
        let outcome = self.confirm_payment(order_id, method, transaction_id, collected.amount()).await;
        if let Err(e) = &outcome {
            if closed_attempt(e) {
                self.refund_closed_attempt(gateway.as_ref(), transaction_id, &collected).await;
            }
        }
        outcome
    }

    /// Provider callback. Nothing in the body is read before the gateway has
    /// verified its signature. Events other than a success, and successes for
    /// attempts this service never issued, are acknowledged and ignored.
    #[instrument(skip(self, payload, signature))]
    pub async fn handle_webhook(&self, method: PaymentMethod, payload: &[u8], signature: &str) -> Result<Option<Order>> {
        let gateway = self.gateways.get(method).cloned().ok_or(CommerceError::UnsupportedPaymentMethod(method))?;
        let event = gateway.verify_webhook(payload, signature).map_err(|e| {
            warn!(error = %e, "Webhook rejected");
            CommerceError::from(e)
        })?;
        if !event.succeeded {
            debug!(transaction_id = %event.transaction_id, "Webhook event ignored");
            return Ok(None);
        }
        match self.confirm_by_transaction(method, &event.transaction_id, event.amount.amount()).await {
            Err(e) if closed_attempt(&e) => {
                self.refund_closed_attempt(gateway.as_ref(), &event.transaction_id, &event.amount).await;
                Ok(None)
            }
            outcome => outcome,
        }
    }

    /// Money collected for an attempt that was superseded or whose order was
    /// cancelled goes straight back.
    async fn refund_closed_attempt(&self, gateway: &dyn PaymentGateway, transaction_id: &str, collected: &Money) {
        warn!(%transaction_id, amount = %collected, "Payment collected for a closed attempt, refunding");
        match self.gateway_call(gateway.refund(transaction_id, collected)).await {
            Ok(()) => info!(%transaction_id, "Closed attempt refunded"),
            Err(e) => error!(%transaction_id, error = %e, "Refund of a closed attempt failed"),
        }
    }

    /// Marks the attempt successful and the order paid. Replaying the same
    /// confirmation is a no-op. `amount` must come from the provider.
    #[instrument(skip(self, amount))]
    pub async fn confirm_payment(&self, order_id: Uuid, method: PaymentMethod, transaction_id: &str, amount: Decimal) -> Result<Order> {
        self.retrying("confirm_payment", move || self.try_confirm_payment(order_id, method, transaction_id, amount)).await
    }

    async fn try_confirm_payment(&self, order_id: Uuid, method: PaymentMethod, transaction_id: &str, amount: Decimal) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        let index = tx.order().payments().iter()
            .position(|p| p.method == method && p.transaction_id.as_deref() == Some(transaction_id))
            .ok_or(CommerceError::PaymentNotFound)?;

        let payment = &tx.order().payments()[index];
        if payment.is_paid() {
            debug!("Payment already confirmed");
            return Ok(tx.order().clone());
        }
        if !payment.is_pending() {
            warn!(status = %payment.status, "Confirmation for a payment that is no longer pending");
            return Err(CommerceError::PaymentNotPending(payment.status));
        }
        if payment.amount.amount() != amount {
            warn!(expected = %payment.amount.amount(), confirmed = %amount, "Confirmed amount does not match");
            return Err(CommerceError::AmountMismatch { expected: payment.amount.amount(), confirmed: amount });
        }
        if tx.order().status() == OrderStatus::Cancelled {
            warn!("Payment confirmed for a cancelled order, left pending");
            return Err(CommerceError::InvalidTransition { from: OrderStatus::Cancelled, to: OrderStatus::Paid });
        }

        let order = tx.order_mut();
        order.payments_mut()[index].transition(PaymentStatus::Success)?;
        order.raise_payment_event(PaymentEvent::Succeeded { order_id, method, transaction_id: transaction_id.to_string() });
        supersede_others(order, method)?;
        order.mark_paid()?;
        let stock = reserve_stock(order);
        order.record_confirmation();

        let order = tx.commit(&stock).await?;
        info!(status = %order.status(), restocked = stock.len(), "Payment confirmed");
        Ok(self.publish(order).await)
    }

    /// Finds the order from the gateway transaction id, for callbacks that
    /// only carry that. Unknown transactions are acknowledged and ignored.
    #[instrument(skip(self, amount))]
    pub async fn confirm_by_transaction(&self, method: PaymentMethod, transaction_id: &str, amount: Decimal) -> Result<Option<Order>> {
        match self.store.find_payment_by_transaction(method, transaction_id).await? {
            Some(payment) => self.confirm_payment(payment.order_id, method, transaction_id, amount).await.map(Some),
            None => {
                warn!("Confirmation for an unknown transaction ignored");
                Ok(None)
            }
        }
    }

    /// Settles a store-pickup order at the counter and hands it over in one
    /// step: `created` goes straight to `shipped`.
    #[instrument(skip(self))]
    pub async fn confirm_counter_payment(&self, order_id: Uuid) -> Result<Order> {
        self.retrying("confirm_counter_payment", move || self.try_confirm_counter_payment(order_id)).await
    }

    async fn try_confirm_counter_payment(&self, order_id: Uuid) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        let order = tx.order();
        if !order.is_store_pickup() {
            return Err(CommerceError::NotPickupOrder);
        }
        match order.status() {
            OrderStatus::Created => {}
            OrderStatus::Shipped | OrderStatus::Completed => {
                debug!(status = %order.status(), "Counter order already handed over");
                return Ok(order.clone());
            }
            from => return Err(CommerceError::InvalidTransition { from, to: OrderStatus::Shipped }),
        }

        let order = tx.order_mut();
        supersede_others(order, PaymentMethod::Boutique)?;
        let payment = PaymentRecord::counter(order_id, order.total().clone());
        let transaction_id = payment.transaction_id.clone().unwrap_or_default();
        order.add_payment(payment);
        order.raise_payment_event(PaymentEvent::Succeeded { order_id, method: PaymentMethod::Boutique, transaction_id });

        // A reserved pickup already sent its confirmation.
        let stock = reserve_stock(order);
        if !stock.is_empty() {
            order.record_confirmation();
        }
        order.ship()?;

        let order = tx.commit(&stock).await?;
        info!(restocked = stock.len(), "Counter payment settled");
        Ok(self.publish(order).await)
    }

    /// Holds the stock of a store-pickup order that will be paid at the
    /// counter. The order stays `created`.
    #[instrument(skip(self))]
    pub async fn reserve_pickup(&self, order_id: Uuid) -> Result<Order> {
        self.retrying("reserve_pickup", move || self.try_reserve_pickup(order_id)).await
    }

    async fn try_reserve_pickup(&self, order_id: Uuid) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        let order = tx.order();
        if !order.is_store_pickup() {
            return Err(CommerceError::NotPickupOrder);
        }
        match order.status() {
            OrderStatus::Created => {}
            OrderStatus::Cancelled => return Err(CommerceError::OrderNotEditable(OrderStatus::Cancelled)),
            status => {
                debug!(%status, "Pickup already confirmed");
                return Ok(order.clone());
            }
        }
        if order.stock_reserved() {
            debug!("Pickup stock already reserved");
            return Ok(order.clone());
        }

        let order = tx.order_mut();
        let stock = reserve_stock(order);
        order.record_confirmation();
        let order = tx.commit(&stock).await?;
        info!(restocked = stock.len(), "Pickup reserved");
        Ok(self.publish(order).await)
    }

    // ---------------------------------------------------------------------
    // Status changes
    // ---------------------------------------------------------------------

    /// Re-applying the current status is a no-op.
    #[instrument(skip(self))]
    pub async fn transition_status(&self, order_id: Uuid, to: OrderStatus) -> Result<Order> {
        match to {
            OrderStatus::Cancelled => self.cancel_order(order_id).await,
            _ => self.retrying("transition_status", move || self.try_transition(order_id, to)).await,
        }
    }

    async fn try_transition(&self, order_id: Uuid, to: OrderStatus) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        let from = tx.order().status();
        if from == to {
            debug!(status = %to, "Status unchanged");
            return Ok(tx.order().clone());
        }
        if from == OrderStatus::Created && to == OrderStatus::Shipped && tx.order().is_store_pickup() {
            drop(tx);
            return self.try_confirm_counter_payment(order_id).await;
        }

        let order = tx.order_mut();
        let stock = match (from, to) {
            (OrderStatus::Created, OrderStatus::Paid) => {
                order.mark_paid()?;
                let stock = reserve_stock(order);
                order.record_confirmation();
                stock
            }
            (OrderStatus::Paid, OrderStatus::Shipped) => {
                order.ship()?;
                reserve_stock(order)
            }
            (OrderStatus::Shipped, OrderStatus::Completed) => {
                order.complete()?;
                Vec::new()
            }
            _ => return Err(CommerceError::InvalidTransition { from, to }),
        };

        let order = tx.commit(&stock).await?;
        info!(%from, %to, "Order status changed");
        Ok(self.publish(order).await)
    }

    /// Refunds every settled payment, then cancels, restocks and closes the
    /// pending attempts in one commit. A failed refund leaves the order as it
    /// was.
    ///
    /// Not retried on a storage conflict: the refunds have already been
    /// issued by then.
    #[instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        let mut tx = self.store.lock_order(order_id).await?;
        match tx.order().status() {
            OrderStatus::Cancelled => {
                debug!("Order already cancelled");
                return Ok(tx.order().clone());
            }
            OrderStatus::Completed => {
                return Err(CommerceError::InvalidTransition { from: OrderStatus::Completed, to: OrderStatus::Cancelled });
            }
            _ => {}
        }

        let settled: Vec<usize> = tx.order().payments().iter().enumerate()
            .filter(|(_, p)| p.is_paid())
            .map(|(i, _)| i)
            .collect();
        let mut refunded = Vec::with_capacity(settled.len());
        for index in settled {
            let payment = tx.order().payments()[index].clone();
            if let Err(e) = self.refund(&payment).await {
                error!(method = %payment.method, error = %e, "Refund failed, cancellation aborted");
                if !refunded.is_empty() {
                    // Refunds already issued stay on record; the order keeps its status.
                    mark_refunded(tx.order_mut(), &refunded)?;
                    let order = tx.commit(&[]).await?;
                    self.publish(order).await;
                }
                return Err(e);
            }
            refunded.push(index);
        }

        let order = tx.order_mut();
        mark_refunded(order, &refunded)?;
        for pending in order.payments_mut().iter_mut().filter(|p| p.is_pending()) {
            pending.transition(PaymentStatus::Cancelled)?;
        }
        let stock = if order.mark_stock_released() { StockLedger::increment(order) } else { Vec::new() };
        order.cancel()?;

        let order = tx.commit(&stock).await?;
        info!(refunds = refunded.len(), restocked = stock.len(), "Order cancelled");
        Ok(self.publish(order).await)
    }

    async fn refund(&self, payment: &PaymentRecord) -> Result<()> {
        if !payment.method.is_online() {
            info!(amount = %payment.amount, "Counter payment to be returned in person");
            return Ok(());
        }
        let gateway = self.gateways.get(payment.method)
            .ok_or_else(|| CommerceError::RefundFailed(format!("no {} gateway configured", payment.method)))?;
        let transaction_id = payment.transaction_id.as_deref()
            .ok_or_else(|| CommerceError::RefundFailed("payment has no transaction id".into()))?;
        self.gateway_call(gateway.refund(transaction_id, &payment.amount)).await
            .map_err(|e| CommerceError::RefundFailed(e.to_string()))?;
        info!(method = %payment.method, %transaction_id, amount = %payment.amount, "Payment refunded");
        Ok(())
    }

    /// Only `created` and `cancelled` orders can be removed. Reserved stock is
    /// put back in the same commit.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<()> {
        let mut tx = self.store.lock_order(order_id).await?;
        let status = tx.order().status();
        if !tx.order().can_be_deleted() {
            return Err(CommerceError::OrderNotDeletable(status));
        }
        let stock = if tx.order_mut().mark_stock_released() { StockLedger::increment(tx.order()) } else { Vec::new() };
        tx.delete(&stock).await?;
        info!(%status, restocked = stock.len(), "Order deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    async fn gateway_call<T>(&self, call: impl Future<Output = std::result::Result<T, GatewayError>>) -> std::result::Result<T, GatewayError> {
        tokio::time::timeout(self.gateway_timeout, call).await
            .unwrap_or_else(|_| Err(GatewayError::Unavailable(format!("no answer within {:?}", self.gateway_timeout))))
    }

    /// Runs `attempt` again once if it lost a storage race.
    async fn retrying<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match attempt().await {
            Err(CommerceError::StorageConflict(reason)) => {
                warn!(operation, %reason, "Storage conflict, retrying once");
                attempt().await
            }
            outcome => outcome,
        }
    }

    async fn publish(&self, mut order: Order) -> Order {
        let events = order.take_events();
        for event in &events {
            debug!(order_id = %event.order_id(), ?event, "Domain event");
        }
        for notification in notifications_for(&events) {
            let delivery = notification.deliver(self.notifier.as_ref(), &order);
            match tokio::time::timeout(self.notification_timeout, delivery).await {
                Ok(Ok(())) => debug!(kind = notification.as_str(), "Notification sent"),
                Ok(Err(e)) => warn!(order_id = %order.id(), kind = notification.as_str(), error = %e, "Notification failed"),
                Err(_) => warn!(order_id = %order.id(), kind = notification.as_str(), "Notification timed out"),
            }
        }
        order
    }
}

/// Notifications owed for a batch of events, in order.
pub fn notifications_for(events: &[DomainEvent]) -> Vec<Notification> {
    let mut out = Vec::new();
    for event in events {
        match event {
            DomainEvent::Order(OrderEvent::Confirmed { pickup, .. }) => {
                out.push(if *pickup { Notification::PickupConfirmation } else { Notification::OrderConfirmation });
                out.push(Notification::Admin);
            }
            DomainEvent::Order(OrderEvent::Shipped { pickup, .. }) => {
                if !*pickup {
                    out.push(Notification::Shipping);
                }
                out.push(Notification::Invoice);
            }
            _ => {}
        }
    }
    out
}

fn closed_attempt(e: &CommerceError) -> bool {
    matches!(
        e,
        CommerceError::PaymentNotPending(PaymentStatus::Cancelled)
            | CommerceError::InvalidTransition { from: OrderStatus::Cancelled, .. }
    )
}

/// Same key for every call about this order and method, so a retried request
/// lands on the provider object the first one created.
fn idempotency_key(order_id: Uuid, method: PaymentMethod) -> String { format!("order-{}-{}", order_id, method) }

fn reserve_stock(order: &mut Order) -> Vec<StockAdjustment> {
    if order.mark_stock_reserved() { StockLedger::decrement(order) } else { Vec::new() }
}

fn supersede_others(order: &mut Order, method: PaymentMethod) -> Result<()> {
    let order_id = order.id();
    let mut superseded = Vec::new();
    for payment in order.payments_mut().iter_mut().filter(|p| p.method != method && p.is_pending()) {
        payment.transition(PaymentStatus::Cancelled)?;
        superseded.push(payment.method);
    }
    for method in superseded {
        order.raise_payment_event(PaymentEvent::Superseded { order_id, method });
    }
    Ok(())
}

fn mark_refunded(order: &mut Order, indices: &[usize]) -> Result<()> {
    let order_id = order.id();
    for &index in indices {
        let payment = &mut order.payments_mut()[index];
        payment.transition(PaymentStatus::Refunded)?;
        let (method, transaction_id) = (payment.method, payment.transaction_id.clone().unwrap_or_default());
        order.raise_payment_event(PaymentEvent::Refunded { order_id, method, transaction_id });
    }
    Ok(())
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn test_pickup_shipment_sends_no_shipping_notice() {
        let id = Uuid::new_v4();
        let events = vec![
            DomainEvent::Order(OrderEvent::Confirmed { order_id: id, pickup: true }),
            DomainEvent::Order(OrderEvent::Shipped { order_id: id, pickup: true }),
            DomainEvent::Order(OrderEvent::StockReserved { order_id: id }),
        ];
        assert_eq!(
            notifications_for(&events),
            vec![Notification::PickupConfirmation, Notification::Admin, Notification::Invoice]
        );
    }

    #[test]
    fn test_carrier_shipment_notifies_customer() {
        let events = vec![DomainEvent::Order(OrderEvent::Shipped { order_id: Uuid::new_v4(), pickup: false })];
        assert_eq!(notifications_for(&events), vec![Notification::Shipping, Notification::Invoice]);
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(idempotency_key(id, PaymentMethod::Stripe), idempotency_key(id, PaymentMethod::Stripe));
        assert_ne!(idempotency_key(id, PaymentMethod::Stripe), idempotency_key(id, PaymentMethod::Paypal));
    }
}
