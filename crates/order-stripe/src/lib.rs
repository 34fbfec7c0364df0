//! # order-stripe
//!
//! Stripe payment gateway for food-order-rs.
//!
//! `StripeGateway` implements `order_core::PaymentGateway` on the Payment
//! Intents API:
//!
//! - create / retrieve payment intents (card only)
//! - create a customer and attach it to an intent, reusing an existing one
//! - refunds with caller-supplied idempotency keys
//! - webhook signature verification (`Stripe-Signature` header)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use order_stripe::StripeGateway;
//! use order_core::{Money, PaymentGateway};
//!
//! let gateway = StripeGateway::from_env()?;
//! let intent = gateway.create_payment_intent(Money::from_cents(2800), "Order Payment").await?;
//!
//! // Hand intent.client_secret to Stripe.js
//! ```
//!
//! ## Webhook Handling
//!
//! ```rust,ignore
//! // In your webhook endpoint:
//! let event = gateway.verify_webhook(&body, signature_header).await?;
//! reconciler.apply(&event).await;
//! ```

pub mod config;
pub mod gateway;
pub mod webhook;

// Re-exports
pub use config::StripeConfig;
pub use gateway::StripeGateway;
pub use webhook::{parse_event, sign_payload, verify_signature, REQUIRED_WEBHOOK_EVENTS};
