//! # Checkout Store Trait
//!
//! Persistence seam for customers, orders, carts and refund obligations.
//! Implementations: `MemoryStore` (this crate) and `SqliteStore`
//! (`order-store`).
//!
//! Two operations are units of work that must be all-or-nothing:
//!
//! - [`CheckoutStore::create_order`]: first-or-create the customer, insert the
//!   order and its line items, optionally finalize the status and clear the
//!   cart.
//! - [`CheckoutStore::transition`]: change status only if the stored status
//!   still equals `expected`, and in the same write record the transaction id,
//!   clear the cart and record a refund obligation as requested.

use crate::cart::{CartLine, CartToken};
use crate::customer::{ContactDetails, Customer};
use crate::error::StoreResult;
use crate::money::Money;
use crate::order::{
    FulfillmentType, Order, OrderLineItem, OrderNumber, OrderStatus, PaymentMethod,
    PENDING_TRANSACTION,
};
use crate::refund::RefundObligation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status change applied in the same unit of work as order creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalize {
    pub status: OrderStatus,
    pub transaction_id: String,
    pub clear_cart: bool,
}

/// Everything needed to insert a new order
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub purchase_order_id: OrderNumber,
    pub cart_token: CartToken,
    pub contact: ContactDetails,
    pub payment_method: PaymentMethod,
    pub price: Money,
    pub shipping_cost: Money,
    pub payment_intent_id: Option<String>,
    pub fulfillment: FulfillmentType,
    pub notes: Option<String>,
    pub items: Vec<OrderLineItem>,
    pub finalize: Option<Finalize>,
}

impl OrderDraft {
    /// Materialize the order row for `customer_id`.
    ///
    /// The order starts `in_progress` with a `PENDING` transaction id and then
    /// takes the `finalize` status, if any.
    pub fn build(&self, customer_id: Uuid, now: DateTime<Utc>) -> Order {
        let mut order = Order {
            id: Uuid::new_v4(),
            purchase_order_id: self.purchase_order_id.clone(),
            customer_id,
            cart_token: self.cart_token.clone(),
            status: OrderStatus::InProgress,
            payment_method: self.payment_method,
            price: self.price,
            shipping_cost: self.shipping_cost,
            transaction_id: PENDING_TRANSACTION.to_string(),
            payment_intent_id: self.payment_intent_id.clone(),
            fulfillment: self.fulfillment,
            notes: self.notes.clone(),
            address: self.contact.address.clone(),
            post_code: self.contact.post_code.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Some(finalize) = &self.finalize {
            order.status = finalize.status;
            order.transaction_id = finalize.transaction_id.clone();
        }

        order
    }

    pub fn clears_cart(&self) -> bool {
        self.finalize.as_ref().map_or(false, |f| f.clear_cart)
    }
}

/// What `create_order` persisted
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order: Order,
    pub customer: Customer,
    pub items: Vec<OrderLineItem>,
}

/// Status-guarded update of one order
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order_id: Uuid,
    /// Applied only if the stored status still equals this
    pub expected: OrderStatus,
    pub next: OrderStatus,
    /// Replaces the stored transaction id when set
    pub transaction_id: Option<String>,
    /// Delete the lines of the order's cart in the same write
    pub clear_cart: bool,
    /// Insert this obligation in the same write
    pub refund: Option<RefundObligation>,
}

/// Persistence for the checkout domain.
#[async_trait]
pub trait CheckoutStore: Send + Sync {
    async fn cart_lines(&self, cart: &CartToken) -> StoreResult<Vec<CartLine>>;

    /// Insert a line, or add its quantity to the existing line for the same dish.
    async fn add_cart_line(&self, cart: &CartToken, line: CartLine) -> StoreResult<CartLine>;

    /// Returns `None` when the cart has no line for the dish.
    async fn set_cart_quantity(
        &self,
        cart: &CartToken,
        food_item_id: &str,
        quantity: u32,
    ) -> StoreResult<Option<CartLine>>;

    async fn remove_cart_line(&self, cart: &CartToken, food_item_id: &str) -> StoreResult<bool>;

    /// Returns the number of lines removed.
    async fn clear_cart(&self, cart: &CartToken) -> StoreResult<u64>;

    /// Insert an order atomically.
    ///
    /// Fails with `StoreError::Duplicate` if the order number or payment intent
    /// id is already taken; nothing is persisted in that case.
    async fn create_order(&self, draft: OrderDraft) -> StoreResult<PlacedOrder>;

    /// Apply a status change if the order is still in `expected`.
    ///
    /// Fails with `StoreError::StaleStatus` when it is not, and
    /// `StoreError::NotFound` when the order does not exist.
    async fn transition(&self, change: StatusChange) -> StoreResult<Order>;

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>>;

    async fn order_by_number(&self, purchase_order_id: &str) -> StoreResult<Option<Order>>;

    async fn order_by_intent(&self, payment_intent_id: &str) -> StoreResult<Option<Order>>;

    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderLineItem>>;

    /// All orders, newest first.
    async fn orders(&self) -> StoreResult<Vec<Order>>;

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>>;

    /// All refund obligations, oldest first.
    async fn refunds(&self) -> StoreResult<Vec<RefundObligation>>;

    /// Insert an obligation unless one already exists for its transaction.
    ///
    /// Returns whether a row was inserted.
    async fn record_refund(&self, refund: RefundObligation) -> StoreResult<bool>;

    async fn update_refund(&self, refund: &RefundObligation) -> StoreResult<()>;
}
