//! # order-core
//!
//! Core types and services for the food-order checkout backend.
//!
//! This crate provides:
//! - `Menu`, `CartService` and `PricingSnapshot` for the cart
//! - `Order` and the `OrderStatus` state machine, applied by `OrderLifecycle`
//! - `CheckoutOrchestrator` for the pay-on-spot and card flows
//! - `WebhookReconciler` for gateway-pushed payment events
//! - `RefundDesk` for refund obligations of cancelled, paid orders
//! - `PaymentGateway` and `CheckoutStore` traits, plus `MemoryStore`
//! - `CheckoutError` / `StoreError` for typed error handling
//!
//! ## Example
//!
//! ```rust,ignore
//! use order_core::{CartToken, CheckoutForm, CheckoutOrchestrator, MemoryStore};
//!
//! let checkout = CheckoutOrchestrator::new(gateway, Arc::new(MemoryStore::new()));
//!
//! // Step 1: the browser gets a client secret
//! let intent = checkout.create_payment_intent(Money::from_cents(2800)).await?;
//!
//! // Step 2: order is created in_progress
//! let card = checkout.create_customer_and_order(&cart, &intent.id, &form).await?;
//!
//! // Step 3: after the browser confirmed the card
//! let done = checkout.confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id).await?;
//! ```

pub mod cart;
pub mod checkout;
pub mod customer;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod menu;
pub mod money;
pub mod order;
pub mod reconcile;
pub mod refund;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports for convenience
pub use cart::{
    CartContents, CartLine, CartService, CartToken, PricingSnapshot, MAX_LINE_QUANTITY,
};
pub use checkout::{CardOrder, CheckoutOrchestrator, PaymentConfirmation};
pub use customer::{CheckoutForm, ContactDetails, Customer, ValidatedCheckout};
pub use error::{
    CheckoutError, CheckoutResult, DuplicateKey, FieldError, StoreError, StoreResult,
    ValidationErrors,
};
pub use gateway::{
    BoxedPaymentGateway, GatewayCustomer, GatewayEvent, GatewayEventKind, IntentStatus,
    PaymentGateway, PaymentIntent, RefundReceipt, MINIMUM_CHARGE,
};
pub use lifecycle::{Applied, OrderLifecycle, TransitionRequest, STAFF_STATUSES};
pub use memory::MemoryStore;
pub use menu::{FoodItem, Menu};
pub use money::{Money, CURRENCY};
pub use order::{
    FulfillmentType, Order, OrderLineItem, OrderNumber, OrderStatus, PaymentMethod, Transition,
    PAY_ON_SPOT_TRANSACTION, PENDING_TRANSACTION,
};
pub use reconcile::{WebhookOutcome, WebhookReconciler};
pub use refund::{RefundDesk, RefundObligation, RefundSettlement, RefundStatus};
pub use store::{CheckoutStore, Finalize, OrderDraft, PlacedOrder, StatusChange};
