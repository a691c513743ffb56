//! Postgres store over sqlx.
//!
//! `lock_order` opens a transaction and takes `SELECT ... FOR UPDATE` on the
//! order row; the transaction is committed by `OrderTransaction::commit` and
//! rolled back when dropped. Payment writes made outside it take `FOR SHARE`
//! on the same row first. The one-live-payment rule is the partial unique
//! index `payments_one_live_per_method`; a violation surfaces as
//! `StorageConflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::aggregates::{
    Cart, CartItem, Order, OrderItem, OrderParts, OrderStatus, PaymentMethod, PaymentRecord, PaymentStatus, ShippingInfo,
    ShippingMethod, StockTarget, UnknownValue,
};
use crate::domain::services::{StockAdjustment, TariffRow, TariffTable};
use crate::domain::value_objects::{Money, Quantity, Weight};
use crate::infrastructure::changed_payments;
use crate::ports::{OrderStore, OrderTransaction};
use crate::{CommerceError, Result};

const SELECT_ORDER: &str = "SELECT id, cart_token, status, currency, shipping_method, shipping_cost, shipping_info, \
    total_weight, stock_reserved, created_at, updated_at FROM orders";
const SELECT_PAYMENT: &str = "SELECT id, order_id, method, status, amount, currency, transaction_id, created_at, updated_at FROM payments";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    cart_token: Option<String>,
    status: String,
    currency: String,
    shipping_method: Option<String>,
    shipping_cost: Decimal,
    shipping_info: Option<Json<ShippingInfo>>,
    total_weight: Decimal,
    stock_reserved: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    variant_id: Option<Uuid>,
    name: String,
    quantity: i32,
    unit_price: Decimal,
    unit_weight: Decimal,
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    method: String,
    status: String,
    amount: Decimal,
    currency: String,
    transaction_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CartItemRow {
    product_id: Option<Uuid>,
    variant_id: Option<Uuid>,
    name: String,
    quantity: i32,
    unit_price: Decimal,
    unit_weight: Decimal,
}

#[derive(sqlx::FromRow)]
struct TariffRecord {
    country_code: String,
    mode_code: String,
    weight_max_g: i32,
    price_ex_tax: Decimal,
}

fn decode<T, E>(value: std::result::Result<T, E>) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    value.map_err(|e| CommerceError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn storage_error(err: sqlx::Error) -> CommerceError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return CommerceError::StorageConflict(db.message().to_string());
        }
    }
    CommerceError::Database(err)
}

impl PaymentRow {
    fn into_record(self) -> Result<PaymentRecord> {
        Ok(PaymentRecord {
            id: self.id,
            order_id: self.order_id,
            method: decode(self.method.parse::<PaymentMethod>())?,
            status: decode(self.status.parse::<PaymentStatus>())?,
            amount: Money::new(self.amount, &self.currency),
            transaction_id: self.transaction_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl ItemRow {
    fn into_item(self, currency: &str) -> Result<OrderItem> {
        let quantity = u32::try_from(self.quantity).ok().and_then(Quantity::new)
            .ok_or_else(|| UnknownValue(format!("quantity {}", self.quantity)));
        Ok(OrderItem {
            id: self.id,
            product_id: self.product_id,
            variant_id: self.variant_id,
            name: self.name,
            quantity: decode(quantity)?,
            unit_price: Money::new(self.unit_price, currency),
            unit_weight: Weight::kg(self.unit_weight),
        })
    }
}

fn assemble(row: OrderRow, items: Vec<ItemRow>, payments: Vec<PaymentRow>) -> Result<Order> {
    let items = items.into_iter().map(|i| i.into_item(&row.currency)).collect::<Result<Vec<_>>>()?;
    let payments = payments.into_iter().map(PaymentRow::into_record).collect::<Result<Vec<_>>>()?;
    Ok(Order::restore(OrderParts {
        id: row.id,
        cart_token: row.cart_token,
        status: decode(row.status.parse::<OrderStatus>())?,
        items,
        shipping_method: decode(row.shipping_method.map(|m| m.parse::<ShippingMethod>()).transpose())?,
        shipping_cost: Money::new(row.shipping_cost, &row.currency),
        shipping_info: row.shipping_info.map(|info| info.0),
        total_weight: Weight::kg(row.total_weight),
        stock_reserved: row.stock_reserved,
        payments,
        created_at: row.created_at,
        updated_at: row.updated_at,
        currency: row.currency,
    }))
}

/// Loads items and payments for a batch of order rows, two queries in all.
async fn hydrate(conn: &mut PgConnection, rows: Vec<OrderRow>) -> Result<Vec<Order>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
    let items: Vec<ItemRow> = sqlx::query_as(
        "SELECT id, order_id, product_id, variant_id, name, quantity, unit_price, unit_weight \
         FROM order_items WHERE order_id = ANY($1) ORDER BY position",
    )
    .bind(&ids[..]).fetch_all(&mut *conn).await?;
    let payments: Vec<PaymentRow> = sqlx::query_as(&format!("{} WHERE order_id = ANY($1) ORDER BY created_at, id", SELECT_PAYMENT))
        .bind(&ids[..]).fetch_all(&mut *conn).await?;

    let mut items_by_order: HashMap<Uuid, Vec<ItemRow>> = HashMap::new();
    for item in items {
        items_by_order.entry(item.order_id).or_default().push(item);
    }
    let mut payments_by_order: HashMap<Uuid, Vec<PaymentRow>> = HashMap::new();
    for payment in payments {
        payments_by_order.entry(payment.order_id).or_default().push(payment);
    }
    rows.into_iter()
        .map(|row| {
            let items = items_by_order.remove(&row.id).unwrap_or_default();
            let payments = payments_by_order.remove(&row.id).unwrap_or_default();
            assemble(row, items, payments)
        })
        .collect()
}

/// Inserts a new payment, or updates one only if its stored status is still
/// `expected`.
async fn write_payment(conn: &mut PgConnection, payment: &PaymentRecord, expected: Option<PaymentStatus>) -> Result<()> {
    match expected {
        None => {
            sqlx::query(
                "INSERT INTO payments (id, order_id, method, status, amount, currency, transaction_id, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(payment.id).bind(payment.order_id).bind(payment.method.as_str()).bind(payment.status.as_str())
            .bind(payment.amount.amount()).bind(payment.amount.currency()).bind(&payment.transaction_id)
            .bind(payment.created_at).bind(payment.updated_at)
            .execute(&mut *conn).await.map_err(storage_error)?;
        }
        Some(expected) => {
            let done = sqlx::query(
                "UPDATE payments SET status = $2, amount = $3, currency = $4, transaction_id = $5, updated_at = $6 \
                 WHERE id = $1 AND status = $7",
            )
            .bind(payment.id).bind(payment.status.as_str()).bind(payment.amount.amount()).bind(payment.amount.currency())
            .bind(&payment.transaction_id).bind(payment.updated_at).bind(expected.as_str())
            .execute(&mut *conn).await.map_err(storage_error)?;
            if done.rows_affected() == 0 {
                return Err(CommerceError::StorageConflict(format!("payment {} is no longer {}", payment.id, expected)));
            }
        }
    }
    Ok(())
}

async fn apply_stock(conn: &mut PgConnection, stock: &[StockAdjustment]) -> Result<()> {
    for adjustment in stock {
        let (sql, id) = match adjustment.target {
            StockTarget::Variant(id) => ("UPDATE product_variants SET stock = GREATEST(0, stock + $2) WHERE id = $1", id),
            StockTarget::Product(id) => ("UPDATE products SET stock = GREATEST(0, stock + $2) WHERE id = $1", id),
        };
        let done = sqlx::query(sql).bind(id).bind(adjustment.delta).execute(&mut *conn).await?;
        if done.rows_affected() == 0 {
            tracing::debug!(stock = ?adjustment.target, "Stock target no longer exists");
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    /// The share lock waits out any `lock_order` transaction, so the status
    /// read here is the one it committed.
    async fn write_unlocked(&self, payment: &PaymentRecord, expected: Option<PaymentStatus>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR SHARE")
            .bind(payment.order_id).fetch_optional(&mut *tx).await?;
        let status = decode(status.ok_or(CommerceError::OrderNotFound)?.parse::<OrderStatus>())?;
        if payment.is_live() && status != OrderStatus::Created {
            return Err(CommerceError::InvalidTransition { from: status, to: OrderStatus::Paid });
        }
        write_payment(&mut tx, payment, expected).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn load_cart(&self, token: &str) -> Result<Option<Cart>> {
        let currency: Option<String> = sqlx::query_scalar("SELECT currency FROM carts WHERE token = $1")
            .bind(token).fetch_optional(&self.pool).await?;
        let Some(currency) = currency else { return Ok(None) };
        let rows: Vec<CartItemRow> = sqlx::query_as(
            "SELECT product_id, variant_id, name, quantity, unit_price, unit_weight FROM cart_items WHERE cart_token = $1 ORDER BY position",
        )
        .bind(token).fetch_all(&self.pool).await?;

        let mut cart = Cart::new(token, &currency);
        for row in rows {
            cart.add_item(CartItem {
                product_id: row.product_id,
                variant_id: row.variant_id,
                name: row.name,
                quantity: u32::try_from(row.quantity).unwrap_or(0),
                unit_price: Money::new(row.unit_price, &currency),
                unit_weight: Weight::kg(row.unit_weight),
            });
        }
        Ok(Some(cart))
    }

    async fn load_tariffs(&self) -> Result<TariffTable> {
        let rows: Vec<TariffRecord> = sqlx::query_as("SELECT country_code, mode_code, weight_max_g, price_ex_tax FROM shipping_tariffs")
            .fetch_all(&self.pool).await?;
        let rows = rows.into_iter()
            .map(|r| {
                let weight_max_g = decode(u32::try_from(r.weight_max_g))?;
                Ok(TariffRow { country_code: r.country_code, mode_code: r.mode_code, weight_max_g, price_ex_tax: r.price_ex_tax })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TariffTable::new(rows))
    }

    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO orders (id, cart_token, status, currency, shipping_method, shipping_cost, shipping_info, \
             total_weight, total, stock_reserved, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(order.id()).bind(order.cart_token()).bind(order.status().as_str()).bind(order.currency())
        .bind(order.shipping_method().map(|m| m.to_string())).bind(order.shipping_cost().amount())
        .bind(order.shipping_info().map(Json)).bind(order.total_weight().as_kg()).bind(order.total().amount())
        .bind(order.stock_reserved()).bind(order.created_at()).bind(order.updated_at())
        .execute(&mut *tx).await.map_err(storage_error)?;

        for (position, item) in order.items().iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, position, product_id, variant_id, name, quantity, unit_price, unit_weight) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(item.id).bind(order.id()).bind(position as i32).bind(item.product_id).bind(item.variant_id)
            .bind(&item.name).bind(item.quantity.value() as i32).bind(item.unit_price.amount()).bind(item.unit_weight.as_kg())
            .execute(&mut *tx).await?;
        }
        for payment in order.payments() {
            write_payment(&mut tx, payment, None).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<OrderRow> = sqlx::query_as(&format!("{} WHERE id = $1", SELECT_ORDER))
            .bind(id).fetch_optional(&mut *conn).await?;
        let Some(row) = row else { return Ok(None) };
        Ok(hydrate(&mut conn, vec![row]).await?.pop())
    }

    async fn list_orders(&self, status: Option<OrderStatus>, page: u32, per_page: u32) -> Result<(Vec<Order>, i64)> {
        let status = status.map(|s| s.as_str());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "{} WHERE ($1::text IS NULL OR status = $1) ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            SELECT_ORDER
        ))
        .bind(status).bind(i64::from(per_page)).bind(offset)
        .fetch_all(&mut *conn).await?;
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM orders WHERE ($1::text IS NULL OR status = $1)")
            .bind(status).fetch_one(&mut *conn).await?;
        Ok((hydrate(&mut conn, rows).await?, total.0))
    }

    async fn find_live_payment(&self, order_id: Uuid, method: PaymentMethod) -> Result<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "{} WHERE order_id = $1 AND method = $2 AND status IN ('pending', 'success') LIMIT 1",
            SELECT_PAYMENT
        ))
        .bind(order_id).bind(method.as_str())
        .fetch_optional(&self.pool).await?;
        row.map(PaymentRow::into_record).transpose()
    }

    async fn find_payment_by_transaction(&self, method: PaymentMethod, transaction_id: &str) -> Result<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "{} WHERE method = $1 AND transaction_id = $2 ORDER BY created_at DESC LIMIT 1",
            SELECT_PAYMENT
        ))
        .bind(method.as_str()).bind(transaction_id)
        .fetch_optional(&self.pool).await?;
        row.map(PaymentRow::into_record).transpose()
    }

    async fn insert_payment(&self, payment: &PaymentRecord) -> Result<()> { self.write_unlocked(payment, None).await }

    async fn update_payment(&self, payment: &PaymentRecord, expected: PaymentStatus) -> Result<()> {
        self.write_unlocked(payment, Some(expected)).await
    }

    async fn lock_order(&self, id: Uuid) -> Result<Box<dyn OrderTransaction>> {
        let mut tx = self.pool.begin().await?;
        let row: Option<OrderRow> = sqlx::query_as(&format!("{} WHERE id = $1 FOR UPDATE", SELECT_ORDER))
            .bind(id).fetch_optional(&mut *tx).await?;
        let row = row.ok_or(CommerceError::OrderNotFound)?;
        let order = hydrate(&mut tx, vec![row]).await?.pop().ok_or(CommerceError::OrderNotFound)?;
        Ok(Box::new(PgOrderTransaction { original: order.payments().to_vec(), order, tx }))
    }

    async fn stock_level(&self, target: StockTarget) -> Result<Option<i64>> {
        let (sql, id) = match target {
            StockTarget::Variant(id) => ("SELECT stock FROM product_variants WHERE id = $1", id),
            StockTarget::Product(id) => ("SELECT stock FROM products WHERE id = $1", id),
        };
        Ok(sqlx::query_scalar(sql).bind(id).fetch_optional(&self.pool).await?)
    }
}

struct PgOrderTransaction {
    tx: Transaction<'static, Postgres>,
    order: Order,
    original: Vec<PaymentRecord>,
}

#[async_trait]
impl OrderTransaction for PgOrderTransaction {
    fn order(&self) -> &Order { &self.order }

    fn order_mut(&mut self) -> &mut Order { &mut self.order }

    async fn commit(self: Box<Self>, stock: &[StockAdjustment]) -> Result<Order> {
        let PgOrderTransaction { mut tx, order, original } = *self;
        sqlx::query(
            "UPDATE orders SET status = $2, shipping_method = $3, shipping_cost = $4, shipping_info = $5, \
             total_weight = $6, total = $7, stock_reserved = $8, updated_at = $9 WHERE id = $1",
        )
        .bind(order.id()).bind(order.status().as_str()).bind(order.shipping_method().map(|m| m.to_string()))
        .bind(order.shipping_cost().amount()).bind(order.shipping_info().map(Json)).bind(order.total_weight().as_kg())
        .bind(order.total().amount()).bind(order.stock_reserved()).bind(order.updated_at())
        .execute(&mut *tx).await?;

        for (payment, expected) in changed_payments(&original, order.payments()) {
            write_payment(&mut tx, payment, expected).await?;
        }
        apply_stock(&mut tx, stock).await?;
        tx.commit().await?;
        Ok(order)
    }

    async fn delete(self: Box<Self>, stock: &[StockAdjustment]) -> Result<()> {
        let PgOrderTransaction { mut tx, order, .. } = *self;
        sqlx::query("DELETE FROM orders WHERE id = $1").bind(order.id()).execute(&mut *tx).await?;
        apply_stock(&mut tx, stock).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_row(quantity: i32) -> ItemRow {
        ItemRow {
            id: Uuid::new_v4(), order_id: Uuid::new_v4(), product_id: Uuid::new_v4(), variant_id: None,
            name: "Bague".into(), quantity, unit_price: Decimal::new(1990, 2), unit_weight: Decimal::new(5, 2),
        }
    }

    #[test]
    fn test_item_rows_decode() {
        let item = item_row(3).into_item("EUR").unwrap();
        assert_eq!(item.quantity.value(), 3);
        assert_eq!(item.line_total().amount(), Decimal::new(5970, 2));
        assert!(matches!(item_row(0).into_item("EUR"), Err(CommerceError::Database(_))));
        assert!(matches!(item_row(-2).into_item("EUR"), Err(CommerceError::Database(_))));
    }

    #[test]
    fn test_unknown_payment_status_is_a_decode_error() {
        let row = PaymentRow {
            id: Uuid::new_v4(), order_id: Uuid::new_v4(), method: "stripe".into(), status: "wc-on-hold".into(),
            amount: Decimal::TEN, currency: "EUR".into(), transaction_id: None, created_at: Utc::now(), updated_at: Utc::now(),
        };
        assert!(matches!(row.into_record(), Err(CommerceError::Database(_))));
    }
}
