//! # order-api
//!
//! HTTP API layer for food-order-rs.
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - REST endpoints for the menu, carts, checkout and order administration
//! - Webhook handler for payment events
//!
//! ## Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | GET | `/health` | Health check |
//! | GET | `/api/v1/menu` | List dishes |
//! | POST | `/api/v1/cart/session` | Issue a cart token |
//! | GET | `/api/v1/checkout` | Cart, totals and publishable key |
//! | POST | `/api/v1/checkout/payment-intent` | Card step 1 |
//! | POST | `/api/v1/checkout/create-customer` | Card step 2 |
//! | POST | `/api/v1/checkout/payment-status` | Card step 3 |
//! | POST | `/api/v1/checkout/store` | Pay on spot |
//! | GET | `/api/v1/orders/{purchase_order_id}` | Order confirmation data |
//! | POST | `/payments/webhook` | Stripe webhook |
//!
//! Cart and checkout calls identify the cart with the `X-Cart-Token` header.

pub mod extract;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::{AppConfig, AppState};
