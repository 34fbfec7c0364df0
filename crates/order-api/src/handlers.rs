//! # Request Handlers
//!
//! Axum request handlers for the ordering API: menu, cart, the two checkout
//! flows, order administration, refunds and the payment webhook.

use crate::extract::CartSession;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use order_core::{
    Applied, CartContents, CartToken, CheckoutError, CheckoutForm, CheckoutResult, Customer,
    Money, Order, OrderLineItem, OrderNumber, OrderStatus, RefundSettlement, StoreError,
    ValidationErrors, MINIMUM_CHARGE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header the gateway signs webhook deliveries with
pub const SIGNATURE_HEADER: &str = "stripe-signature";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Add-to-cart request
#[derive(Debug, Deserialize)]
pub struct AddCartItemRequest {
    pub food_item_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: u32,
}

/// Card flow step 1
#[derive(Debug, Deserialize)]
pub struct PaymentIntentRequest {
    /// Decimal amount, e.g. `28.00`
    pub total_price: f64,
}

#[derive(Debug, Serialize)]
pub struct PaymentIntentResponse {
    pub id: String,
    pub client_secret: Option<String>,
}

/// Card flow step 2: the checkout form plus the intent it pays with
#[derive(Debug, Deserialize)]
pub struct CreateCustomerRequest {
    pub payment_intent_id: String,
    #[serde(flatten)]
    pub form: CheckoutForm,
}

#[derive(Debug, Serialize)]
pub struct CreateCustomerResponse {
    /// Customer id at the gateway
    pub customer_id: String,
    pub order_id: Uuid,
    pub purchase_order_id: OrderNumber,
}

/// Card flow step 3.
///
/// The browser posts back the intent object the gateway's client library
/// returned. Only its `id` is read; the status is fetched server-side.
#[derive(Debug, Deserialize)]
pub struct PaymentStatusRequest {
    #[serde(default)]
    pub payment_intent: Option<IntentReference>,
    /// Bare intent id, accepted in place of `payment_intent`
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    pub customer_id: String,
    pub order_id: Uuid,
}

/// The part of a client-side intent object the server trusts
#[derive(Debug, Deserialize)]
pub struct IntentReference {
    pub id: String,
}

impl PaymentStatusRequest {
    fn intent_id(&self) -> Option<&str> {
        self.payment_intent
            .as_ref()
            .map(|intent| intent.id.as_str())
            .or(self.payment_intent_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Serialize)]
pub struct PlacedOrderResponse {
    pub purchase_order_id: OrderNumber,
    pub redirect_url: String,
}

/// Staff status update
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    /// Short reason code, e.g. `out_of_stock`
    #[serde(default)]
    pub reason: Option<String>,
    /// Free-text explanation
    #[serde(default)]
    pub reason_text: Option<String>,
}

impl UpdateStatusRequest {
    fn combined_reason(&self) -> Option<String> {
        let reason = self.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
        let text = self
            .reason_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());

        match (reason, text) {
            (Some(reason), Some(text)) => Some(format!("{reason}: {text}")),
            (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
            (None, None) => None,
        }
    }
}

/// An order with everything the confirmation view shows
#[derive(Debug, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub items: Vec<OrderLineItem>,
    pub customer: Option<Customer>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Field-level messages for validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ValidationErrors>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
            errors: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn checkout_error_to_response(err: CheckoutError) -> ApiError {
    let code = err.status_code();
    let mut response = ErrorResponse::new(err.to_string(), code);
    if let Some(errors) = err.validation_errors() {
        response.errors = Some(errors.clone());
    }
    if let CheckoutError::Gateway { provider, .. } = &err {
        response = response.with_details(format!("provider: {}", provider));
    }
    (status(code), Json(response))
}

fn store_error_to_response(err: StoreError) -> ApiError {
    checkout_error_to_response(err.into())
}

// =============================================================================
// Handlers: service
// =============================================================================

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "food-order",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Orderable dishes
pub async fn list_menu(State(state): State<AppState>) -> impl IntoResponse {
    let items: Vec<_> = state.menu.active_items().collect();
    Json(json!({
        "items": items,
        "count": items.len()
    }))
}

// =============================================================================
// Handlers: cart
// =============================================================================

/// Issue a token for a new, empty cart
pub async fn create_cart_session() -> impl IntoResponse {
    (
        StatusCode::CREATED,
        Json(json!({ "cart_token": CartToken::generate() })),
    )
}

pub async fn get_cart(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
) -> ApiResult<Json<CartContents>> {
    state
        .carts
        .contents(&cart)
        .await
        .map(Json)
        .map_err(checkout_error_to_response)
}

#[instrument(skip_all, fields(cart = %cart, food_item_id = %request.food_item_id))]
pub async fn add_cart_item(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
    Json(request): Json<AddCartItemRequest>,
) -> ApiResult<(StatusCode, Json<CartContents>)> {
    state
        .carts
        .add_item(&cart, &request.food_item_id, request.quantity)
        .await
        .map_err(checkout_error_to_response)?;

    let contents = state
        .carts
        .contents(&cart)
        .await
        .map_err(checkout_error_to_response)?;
    Ok((StatusCode::CREATED, Json(contents)))
}

pub async fn update_cart_item(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
    Path(food_item_id): Path<String>,
    Json(request): Json<UpdateCartItemRequest>,
) -> ApiResult<Json<CartContents>> {
    state
        .carts
        .set_quantity(&cart, &food_item_id, request.quantity)
        .await
        .map_err(checkout_error_to_response)?;

    state
        .carts
        .contents(&cart)
        .await
        .map(Json)
        .map_err(checkout_error_to_response)
}

pub async fn remove_cart_item(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
    Path(food_item_id): Path<String>,
) -> ApiResult<Json<CartContents>> {
    state
        .carts
        .remove_item(&cart, &food_item_id)
        .await
        .map_err(checkout_error_to_response)?;

    state
        .carts
        .contents(&cart)
        .await
        .map(Json)
        .map_err(checkout_error_to_response)
}

pub async fn clear_cart(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
) -> ApiResult<Json<Value>> {
    let removed = state
        .carts
        .clear(&cart)
        .await
        .map_err(checkout_error_to_response)?;
    Ok(Json(json!({ "removed": removed })))
}

// =============================================================================
// Handlers: checkout
// =============================================================================

/// What the checkout page needs: cart, totals and the browser-side key
pub async fn checkout_summary(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
) -> ApiResult<Json<Value>> {
    let contents = state
        .carts
        .contents(&cart)
        .await
        .map_err(checkout_error_to_response)?;

    Ok(Json(json!({
        "cart": contents,
        "publishable_key": state.gateway.publishable_key(),
        "minimum_charge": MINIMUM_CHARGE,
    })))
}

/// Card flow step 1: create a payment intent for the displayed total
#[instrument(skip(state))]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(request): Json<PaymentIntentRequest>,
) -> ApiResult<Json<PaymentIntentResponse>> {
    let total = Money::from_decimal(request.total_price).ok_or_else(|| {
        checkout_error_to_response(CheckoutError::Validation(ValidationErrors::single(
            "total_price",
            "The total price must be a valid amount.",
        )))
    })?;

    let intent = state
        .checkout
        .create_payment_intent(total)
        .await
        .map_err(|e| {
            error!("Failed to create payment intent: {}", e);
            checkout_error_to_response(e)
        })?;

    Ok(Json(PaymentIntentResponse {
        id: intent.id,
        client_secret: intent.client_secret,
    }))
}

/// Card flow step 2: attach a gateway customer and create the pending order
#[instrument(skip_all, fields(cart = %cart, payment_intent_id = %request.payment_intent_id))]
pub async fn create_customer(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
    Json(request): Json<CreateCustomerRequest>,
) -> ApiResult<Json<CreateCustomerResponse>> {
    let card_order = state
        .checkout
        .create_customer_and_order(&cart, &request.payment_intent_id, &request.form)
        .await
        .map_err(|e| {
            warn!("Card order not created: {}", e);
            checkout_error_to_response(e)
        })?;

    Ok(Json(CreateCustomerResponse {
        customer_id: card_order.gateway_customer_id,
        order_id: card_order.order.id,
        purchase_order_id: card_order.order.purchase_order_id,
    }))
}

/// Card flow step 3: confirm the payment succeeded and place the order.
///
/// Both outcomes carry a `success` flag; failures use 400 for anything the
/// client can act on and 500 otherwise.
#[instrument(skip(state, request), fields(order_id = %request.order_id))]
pub async fn payment_status(
    State(state): State<AppState>,
    Json(request): Json<PaymentStatusRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(intent_id) = request.intent_id() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "The payment intent field is required." })),
        ));
    };

    match state
        .checkout
        .confirm_payment(intent_id, &request.customer_id, request.order_id)
        .await
    {
        Ok(confirmation) => Ok(Json(json!({
            "success": true,
            "transactionID": confirmation.transaction_id,
            "redirect_url": state
                .config
                .confirmation_url(confirmation.order.purchase_order_id.as_str()),
        }))),
        Err(e) => {
            let code = if e.status_code() < 500 {
                StatusCode::BAD_REQUEST
            } else {
                error!("Payment confirmation failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Err((code, Json(json!({ "success": false, "error": e.to_string() }))))
        }
    }
}

/// Pay-on-spot checkout: one call places the order
#[instrument(skip_all, fields(cart = %cart))]
pub async fn store_order(
    State(state): State<AppState>,
    CartSession(cart): CartSession,
    Json(form): Json<CheckoutForm>,
) -> ApiResult<(StatusCode, Json<PlacedOrderResponse>)> {
    let placed = state
        .checkout
        .place_pay_on_spot(&cart, &form)
        .await
        .map_err(checkout_error_to_response)?;

    let redirect_url = state
        .config
        .confirmation_url(placed.order.purchase_order_id.as_str());

    Ok((
        StatusCode::CREATED,
        Json(PlacedOrderResponse {
            purchase_order_id: placed.order.purchase_order_id,
            redirect_url,
        }),
    ))
}

// =============================================================================
// Handlers: orders & refunds
// =============================================================================

pub async fn list_orders(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let orders = state.store.orders().await.map_err(store_error_to_response)?;
    Ok(Json(json!({
        "count": orders.len(),
        "orders": orders,
    })))
}

async fn order_view(state: &AppState, purchase_order_id: &str) -> CheckoutResult<OrderView> {
    let order = state
        .store
        .order_by_number(purchase_order_id)
        .await?
        .ok_or_else(|| CheckoutError::not_found("Order", purchase_order_id))?;
    let items = state.store.order_items(order.id).await?;
    let customer = state.store.customer(order.customer_id).await?;

    Ok(OrderView {
        order,
        items,
        customer,
    })
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(purchase_order_id): Path<String>,
) -> ApiResult<Json<OrderView>> {
    order_view(&state, &purchase_order_id)
        .await
        .map(Json)
        .map_err(checkout_error_to_response)
}

/// Staff action: confirm or cancel an order
#[instrument(skip(state, request), fields(status = %request.status))]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(purchase_order_id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Value>> {
    let requested: OrderStatus = request.status.parse().map_err(|_| {
        checkout_error_to_response(CheckoutError::Validation(ValidationErrors::single(
            "status",
            "The selected status is invalid.",
        )))
    })?;

    let applied = state
        .lifecycle
        .update_status(&purchase_order_id, requested, request.combined_reason())
        .await
        .map_err(checkout_error_to_response)?;

    let (changed, refund_recorded) = match &applied {
        Applied::Moved { refund, .. } => (true, refund.is_some()),
        Applied::Unchanged(_) => (false, false),
    };
    info!(
        "Staff set order {} to {} (changed: {})",
        purchase_order_id, requested, changed
    );

    Ok(Json(json!({
        "order": applied.order(),
        "changed": changed,
        "refund_recorded": refund_recorded,
    })))
}

pub async fn list_refunds(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let refunds = state
        .refunds
        .obligations()
        .await
        .map_err(checkout_error_to_response)?;
    Ok(Json(json!({
        "count": refunds.len(),
        "refunds": refunds,
    })))
}

/// Issue every pending or failed refund through the gateway
#[instrument(skip(state))]
pub async fn settle_refunds(State(state): State<AppState>) -> ApiResult<Json<RefundSettlement>> {
    state
        .refunds
        .settle_open()
        .await
        .map(Json)
        .map_err(checkout_error_to_response)
}

// =============================================================================
// Handlers: webhook
// =============================================================================

/// Handle a gateway webhook delivery.
///
/// Every verified event is acknowledged with 200, whatever handling it did;
/// only signature and payload failures are refused.
#[instrument(skip(state, headers, body))]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(signature) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        warn!("Webhook without signature header");
        return (StatusCode::BAD_REQUEST, "Invalid signature");
    };

    match state.reconciler.handle(&body, signature).await {
        Ok(outcome) => {
            info!("Webhook handled: {:?}", outcome);
            (StatusCode::OK, "Webhook handled")
        }
        Err(CheckoutError::WebhookVerification(_)) => (StatusCode::BAD_REQUEST, "Invalid signature"),
        Err(CheckoutError::WebhookPayload(_)) => (StatusCode::BAD_REQUEST, "Invalid payload"),
        Err(e) => {
            error!("Webhook handler error: {}", e);
            (status(e.status_code()), "Webhook error")
        }
    }
}

// =============================================================================
// Pages
// =============================================================================

/// Confirmation page the checkout flows redirect to
pub async fn order_confirmation_page(
    State(state): State<AppState>,
    Path(purchase_order_id): Path<String>,
) -> Response {
    match order_view(&state, &purchase_order_id).await {
        Ok(view) => Html(render_confirmation(&view)).into_response(),
        Err(e) => (
            status(e.status_code()),
            Html(render_page(
                "Order Not Found",
                "❌",
                &format!(
                    "<p style=\"color: #666;\">No order <code>{}</code>.</p>",
                    escape_html(&purchase_order_id)
                ),
            )),
        )
            .into_response(),
    }
}

fn render_confirmation(view: &OrderView) -> String {
    let order = &view.order;
    let rows: String = view
        .items
        .iter()
        .map(|item| {
            format!(
                "<tr><td>{} × {}</td><td style=\"text-align: right;\">{}</td></tr>",
                item.quantity,
                escape_html(&item.name),
                item.subtotal().display()
            )
        })
        .collect();
    let greeting = view
        .customer
        .as_ref()
        .map(|c| format!("<p>Thank you, {}!</p>", escape_html(&c.first_name)))
        .unwrap_or_default();

    let body = format!(
        r#"{greeting}
        <p>Order <code>{number}</code> is <strong>{status}</strong>.</p>
        <table style="margin: 0 auto; min-width: 280px;">
            {rows}
            <tr><td>Shipping</td><td style="text-align: right;">{shipping}</td></tr>
            <tr><td><strong>Total</strong></td><td style="text-align: right;"><strong>{total}</strong></td></tr>
        </table>"#,
        number = escape_html(order.purchase_order_id.as_str()),
        status = order.status,
        shipping = order.shipping_cost.display(),
        total = order.total().display(),
    );

    render_page("Order Received", "✅", &body)
}

fn render_page(title: &str, icon: &str, body: &str) -> String {
    format!(
        r#"
<!DOCTYPE html>
<html>
<head><title>{title}</title></head>
<body style="font-family: system-ui; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: linear-gradient(135deg, #1a1a2e 0%, #16213e 100%);">
    <div style="background: white; padding: 60px; border-radius: 16px; text-align: center;">
        <div style="font-size: 60px;">{icon}</div>
        <h1>{title}</h1>
        {body}
    </div>
</body>
</html>
"#
    )
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new("Test error", 400);
        assert_eq!(err.error, "Test error");
        assert_eq!(err.code, 400);
    }

    #[test]
    fn test_validation_error_carries_fields() {
        let mut errors = ValidationErrors::new();
        errors.push("address", "The address field is required.");
        errors.push("post_code", "The post code field is required.");

        let (status, Json(body)) = checkout_error_to_response(CheckoutError::Validation(errors));
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let fields = body.errors.unwrap();
        assert!(fields.has_field("address"));
        assert!(fields.has_field("post_code"));
    }

    #[test]
    fn test_gateway_error_keeps_provider_message() {
        let (status, Json(body)) = checkout_error_to_response(CheckoutError::Gateway {
            provider: "stripe".into(),
            message: "Your card was declined.".into(),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Your card was declined.");
        assert_eq!(body.details.as_deref(), Some("provider: stripe"));
    }

    #[test]
    fn test_combined_reason() {
        let request = |reason: Option<&str>, text: Option<&str>| UpdateStatusRequest {
            status: "cancelled".into(),
            reason: reason.map(String::from),
            reason_text: text.map(String::from),
        };

        assert_eq!(
            request(Some("out_of_stock"), Some("no basil")).combined_reason(),
            Some("out_of_stock: no basil".into())
        );
        assert_eq!(
            request(None, Some("closing early")).combined_reason(),
            Some("closing early".into())
        );
        assert_eq!(request(Some("  "), None).combined_reason(), None);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>\"Tom\" & 'Jerry'</b>"),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }
}
