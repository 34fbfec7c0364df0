//! # Routes
//!
//! Axum router configuration for the ordering API.

use crate::handlers;
use crate::state::AppState;
use axum::{
    routing::{get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
///
/// Routes:
/// - Menu & cart (cart calls carry `X-Cart-Token`):
///   - GET    /api/v1/menu
///   - POST   /api/v1/cart/session
///   - GET    /api/v1/cart, DELETE /api/v1/cart
///   - POST   /api/v1/cart/items
///   - PATCH  /api/v1/cart/items/{food_item_id}, DELETE same
///
/// - Checkout:
///   - GET  /api/v1/checkout
///   - POST /api/v1/checkout/payment-intent - card step 1
///   - POST /api/v1/checkout/create-customer - card step 2
///   - POST /api/v1/checkout/payment-status - card step 3
///   - POST /api/v1/checkout/store - pay on spot
///
/// - Orders & refunds:
///   - GET  /api/v1/orders, GET /api/v1/orders/{purchase_order_id}
///   - POST /api/v1/orders/{purchase_order_id}/status
///   - GET  /api/v1/refunds, POST /api/v1/refunds/settle
///
/// - Webhooks:
///   - POST /payments/webhook
///
/// - Pages:
///   - GET /orders/confirmed/{purchase_order_id}
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let cart_routes = Router::new()
        .route("/", get(handlers::get_cart).delete(handlers::clear_cart))
        .route("/session", post(handlers::create_cart_session))
        .route("/items", post(handlers::add_cart_item))
        .route(
            "/items/{food_item_id}",
            patch(handlers::update_cart_item).delete(handlers::remove_cart_item),
        );

    let checkout_routes = Router::new()
        .route("/", get(handlers::checkout_summary))
        .route("/payment-intent", post(handlers::create_payment_intent))
        .route("/create-customer", post(handlers::create_customer))
        .route("/payment-status", post(handlers::payment_status))
        .route("/store", post(handlers::store_order));

    let order_routes = Router::new()
        .route("/", get(handlers::list_orders))
        .route("/{purchase_order_id}", get(handlers::get_order))
        .route(
            "/{purchase_order_id}/status",
            post(handlers::update_order_status),
        );

    let refund_routes = Router::new()
        .route("/", get(handlers::list_refunds))
        .route("/settle", post(handlers::settle_refunds));

    let api_routes = Router::new()
        .route("/menu", get(handlers::list_menu))
        .nest("/cart", cart_routes)
        .nest("/checkout", checkout_routes)
        .nest("/orders", order_routes)
        .nest("/refunds", refund_routes);

    // Raw body, signature checked by the reconciler
    let webhook_routes = Router::new().route("/webhook", post(handlers::payment_webhook));

    Router::new()
        // Health check at root
        .route("/health", get(handlers::health))
        .route("/", get(handlers::health))
        .route(
            "/orders/confirmed/{purchase_order_id}",
            get(handlers::order_confirmation_page),
        )
        .nest("/api/v1", api_routes)
        .nest("/payments", webhook_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
