//! HTTP surface of the checkout service.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::domain::aggregates::{
    Carrier, Contact, Order, OrderItem, OrderStatus, PaymentMethod, PaymentRecord, PickupPointRef, ShippingInfo, ShippingMethod,
};
use crate::domain::value_objects::{VatRate, Weight};
use crate::infrastructure::SIGNATURE_HEADER;
use crate::ports::PickupPoint;
use crate::{CommerceError, OrderStateMachine, ShippingRequest};

type ApiResult<T> = std::result::Result<T, CommerceError>;

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<OrderStateMachine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy", "service": "opensase-checkout"})) }))
        .route("/api/v1/orders", get(list_orders).post(create_order))
        .route("/api/v1/orders/:id", get(get_order).delete(delete_order))
        .route("/api/v1/orders/:id/shipping", put(attach_shipping))
        .route("/api/v1/orders/:id/payments", post(initiate_payment))
        .route("/api/v1/orders/:id/payments/capture", post(capture_payment))
        .route("/api/v1/orders/:id/payments/counter", post(confirm_counter_payment))
        .route("/api/v1/orders/:id/confirm-pickup", post(reserve_pickup))
        .route("/api/v1/orders/:id/status", patch(transition_status))
        .route("/api/v1/payments/:method/webhook", post(payment_webhook))
        .route("/api/v1/shipping/calculate", post(quote_shipping))
        .route("/api/v1/pudo/search", post(search_pickup_points))
        .with_state(state)
}

impl IntoResponse for CommerceError {
    fn into_response(self) -> Response {
        let status = match &self {
            CommerceError::OrderNotFound | CommerceError::CartNotFound | CommerceError::PaymentNotFound => StatusCode::NOT_FOUND,
            CommerceError::InvalidTransition { .. }
            | CommerceError::OrderNotEditable(_)
            | CommerceError::OrderNotDeletable(_)
            | CommerceError::PaymentNotPending(_)
            | CommerceError::StorageConflict(_) => StatusCode::CONFLICT,
            CommerceError::WebhookRejected(_) => StatusCode::UNAUTHORIZED,
            CommerceError::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            CommerceError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CommerceError::RefundFailed(_) | CommerceError::Carrier(_) => StatusCode::BAD_GATEWAY,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            CommerceError::Database(_) => "Database operation failed".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({"error": message, "retriable": self.is_retriable()}))).into_response()
    }
}

fn validated<T: Validate>(request: T) -> ApiResult<T> {
    request.validate().map_err(|e| CommerceError::Validation(e.to_string()))?;
    Ok(request)
}

fn parse_method(raw: &str) -> ApiResult<PaymentMethod> {
    raw.parse::<PaymentMethod>().map_err(|e| CommerceError::Validation(format!("payment method: {}", e)))
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    pub items: Vec<OrderItem>,
    pub shipping_method: Option<ShippingMethod>,
    pub shipping_info: Option<ShippingInfo>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    pub total_tax: Decimal,
    pub total_weight_kg: Decimal,
    pub stock_reserved: bool,
    pub payments: Vec<PaymentRecord>,
    pub total_paid: Decimal,
    pub remaining: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderView {
    pub fn new(order: &Order, vat: VatRate) -> Self {
        Self {
            id: order.id(),
            status: order.status(),
            currency: order.currency().to_string(),
            items: order.items().to_vec(),
            shipping_method: order.shipping_method().cloned(),
            shipping_info: order.shipping_info().cloned(),
            subtotal: order.subtotal().amount(),
            shipping_cost: order.shipping_cost().amount(),
            total: order.total().amount(),
            total_tax: vat.included_in(order.total().amount()),
            total_weight_kg: order.total_weight().as_kg(),
            stock_reserved: order.stock_reserved(),
            payments: order.payments().to_vec(),
            total_paid: order.total_paid().amount(),
            remaining: order.remaining_amount().amount(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

#[derive(Debug, Deserialize)] pub struct ListParams { pub page: Option<u32>, pub per_page: Option<u32>, pub status: Option<String> }
#[derive(Debug, Serialize)] pub struct PaginatedResponse<T> { pub data: Vec<T>, pub total: i64, pub page: u32 }

// =============================================================================
// Orders
// =============================================================================

async fn list_orders(State(s): State<AppState>, Query(p): Query<ListParams>) -> ApiResult<Json<PaginatedResponse<OrderView>>> {
    let status = p.status.as_deref().filter(|s| !s.is_empty())
        .map(|raw| raw.parse::<OrderStatus>().map_err(|e| CommerceError::Validation(e.to_string())))
        .transpose()?;
    let page = p.page.unwrap_or(1).max(1);
    let (orders, total) = s.machine.list_orders(status, page, p.per_page.unwrap_or(20)).await?;
    let data = orders.iter().map(|o| OrderView::new(o, s.machine.vat())).collect();
    Ok(Json(PaginatedResponse { data, total, page }))
}

async fn get_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<OrderView>> {
    let order = s.machine.get_order(id).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 64, message = "cart token is required"))]
    pub cart_token: String,
}

async fn create_order(State(s): State<AppState>, Json(r): Json<CreateOrderRequest>) -> ApiResult<(StatusCode, Json<OrderView>)> {
    let r = validated(r)?;
    let order = s.machine.create_order(&r.cart_token).await?;
    Ok((StatusCode::CREATED, Json(OrderView::new(&order, s.machine.vat()))))
}

async fn delete_order(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    s.machine.delete_order(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pickup-point fields arrive flat; leaving `pudo_id` out clears any point
/// attached earlier.
#[derive(Debug, Deserialize, Validate)]
pub struct ShippingBody {
    pub shipping_method: ShippingMethod,
    pub shipping_cost: Option<Decimal>,
    #[validate(email(message = "a valid email is required"))]
    pub email: String,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    #[validate(length(max = 2))]
    pub country: String,
    pub phone: Option<String>,
    pub pudo_id: Option<String>,
    pub pudo_name: Option<String>,
    pub pudo_address: Option<String>,
    pub pudo_postal_code: Option<String>,
    pub pudo_city: Option<String>,
    pub pudo_country: Option<String>,
}

impl ShippingBody {
    fn into_request(self) -> ShippingRequest {
        let pickup_point = self.pudo_id.filter(|id| !id.trim().is_empty()).map(|id| PickupPointRef {
            id,
            name: self.pudo_name.unwrap_or_default(),
            address: self.pudo_address.unwrap_or_default(),
            postal_code: self.pudo_postal_code.unwrap_or_default(),
            city: self.pudo_city.unwrap_or_default(),
            country: self.pudo_country,
        });
        ShippingRequest {
            method: self.shipping_method,
            cost: self.shipping_cost,
            contact: Contact {
                email: self.email,
                first_name: self.first_name,
                last_name: self.last_name,
                address: self.address,
                postal_code: self.postal_code,
                city: self.city,
                country: self.country.to_uppercase(),
                phone: self.phone,
            },
            pickup_point,
        }
    }
}

async fn attach_shipping(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<ShippingBody>) -> ApiResult<Json<OrderView>> {
    let r = validated(r)?;
    let order = s.machine.attach_shipping(id, r.into_request()).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

async fn reserve_pickup(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<OrderView>> {
    let order = s.machine.reserve_pickup(id).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

#[derive(Debug, Deserialize)] pub struct StatusRequest { pub status: OrderStatus }

async fn transition_status(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<StatusRequest>) -> ApiResult<Json<OrderView>> {
    let order = s.machine.transition_status(id, r.status).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Deserialize)] pub struct InitiatePaymentRequest { pub method: String }

async fn initiate_payment(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<InitiatePaymentRequest>) -> ApiResult<impl IntoResponse> {
    let intent = s.machine.initiate_payment(id, parse_method(&r.method)?).await?;
    Ok(Json(intent))
}

/// No amount: the provider says what was collected.
#[derive(Debug, Deserialize, Validate)]
pub struct CapturePaymentRequest {
    pub method: String,
    #[validate(length(min = 1, max = 255))]
    pub transaction_id: String,
}

async fn capture_payment(State(s): State<AppState>, Path(id): Path<Uuid>, Json(r): Json<CapturePaymentRequest>) -> ApiResult<Json<OrderView>> {
    let r = validated(r)?;
    let order = s.machine.capture_payment(id, parse_method(&r.method)?, &r.transaction_id).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

/// Settles a store-pickup order at the counter and hands it over.
async fn confirm_counter_payment(State(s): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<OrderView>> {
    let order = s.machine.confirm_counter_payment(id).await?;
    Ok(Json(OrderView::new(&order, s.machine.vat())))
}

/// Provider callback, read as raw bytes so the signature covers exactly what
/// arrived. Acknowledged unless the signature or the confirmation is refused,
/// so the provider does not redeliver for transactions we never issued.
async fn payment_webhook(State(s): State<AppState>, Path(method): Path<String>, headers: HeaderMap, body: Bytes) -> ApiResult<impl IntoResponse> {
    let method = parse_method(&method)?;
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
        .ok_or_else(|| CommerceError::WebhookRejected(format!("missing {} header", SIGNATURE_HEADER)))?;
    let order = s.machine.handle_webhook(method, &body, signature).await?;
    Ok(Json(json!({"received": true, "order_id": order.map(|o| o.id())})))
}

// =============================================================================
// Shipping
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct QuoteRequest {
    pub total_weight: Decimal,
    #[validate(length(min = 1, max = 20))]
    pub mode_code: String,
    pub country_code: Option<String>,
}

async fn quote_shipping(State(s): State<AppState>, Json(r): Json<QuoteRequest>) -> ApiResult<impl IntoResponse> {
    let r = validated(r)?;
    if r.total_weight.is_sign_negative() {
        return Err(CommerceError::Validation("total_weight cannot be negative".into()));
    }
    let country = r.country_code.map(|c| c.to_uppercase());
    let price = s.machine.quote_shipping(Weight::kg(r.total_weight), &r.mode_code, country.as_deref())?;
    Ok(Json(json!({"price": price.amount(), "currency": price.currency()})))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PickupSearchRequest {
    pub carrier: Carrier,
    #[validate(length(min = 4, max = 10))]
    pub postal_code: String,
    pub country_code: Option<String>,
    #[serde(default)]
    pub total_weight: Decimal,
}

async fn search_pickup_points(State(s): State<AppState>, Json(r): Json<PickupSearchRequest>) -> ApiResult<Json<Vec<PickupPoint>>> {
    let r = validated(r)?;
    let country = r.country_code.map(|c| c.to_uppercase());
    let points = s.machine.find_pickup_points(r.carrier, &r.postal_code, country.as_deref(), Weight::kg(r.total_weight)).await?;
    Ok(Json(points))
}
