//! In-memory `CheckoutStore`.
//!
//! Each operation holds the single write lock for its whole duration, so the
//! units of work described on the trait are trivially atomic. All checks run
//! before the first mutation.

use crate::cart::{CartLine, CartToken, MAX_LINE_QUANTITY};
use crate::customer::Customer;
use crate::error::{DuplicateKey, StoreError, StoreResult};
use crate::order::{Order, OrderLineItem};
use crate::refund::RefundObligation;
use crate::store::{CheckoutStore, OrderDraft, PlacedOrder, StatusChange};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    customers: HashMap<Uuid, Customer>,
    customer_by_email: HashMap<String, Uuid>,
    orders: HashMap<Uuid, Order>,
    order_by_number: HashMap<String, Uuid>,
    order_by_intent: HashMap<String, Uuid>,
    items: HashMap<Uuid, Vec<OrderLineItem>>,
    carts: HashMap<CartToken, Vec<CartLine>>,
    refunds: Vec<RefundObligation>,
}

/// Store that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(any(test, feature = "testing"))]
    fail_on_create: RwLock<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(any(test, feature = "testing"))]
impl MemoryStore {
    /// Make every `create_order` fail before touching any table
    pub async fn set_fail_on_create(&self, fail: bool) {
        *self.fail_on_create.write().await = fail;
    }

    /// Number of customer records (for assertions)
    pub async fn customer_count(&self) -> usize {
        self.tables.read().await.customers.len()
    }
}

#[async_trait]
impl CheckoutStore for MemoryStore {
    async fn cart_lines(&self, cart: &CartToken) -> StoreResult<Vec<CartLine>> {
        let tables = self.tables.read().await;
        Ok(tables.carts.get(cart).cloned().unwrap_or_default())
    }

    async fn add_cart_line(&self, cart: &CartToken, line: CartLine) -> StoreResult<CartLine> {
        let mut tables = self.tables.write().await;
        let lines = tables.carts.entry(cart.clone()).or_default();

        match lines.iter_mut().find(|l| l.food_item_id == line.food_item_id) {
            Some(existing) => {
                existing.quantity = existing
                    .quantity
                    .saturating_add(line.quantity)
                    .min(MAX_LINE_QUANTITY);
                Ok(existing.clone())
            }
            None => {
                lines.push(line.clone());
                Ok(line)
            }
        }
    }

    async fn set_cart_quantity(
        &self,
        cart: &CartToken,
        food_item_id: &str,
        quantity: u32,
    ) -> StoreResult<Option<CartLine>> {
        let mut tables = self.tables.write().await;
        let line = tables
            .carts
            .get_mut(cart)
            .and_then(|lines| lines.iter_mut().find(|l| l.food_item_id == food_item_id));

        Ok(line.map(|line| {
            line.quantity = quantity;
            line.clone()
        }))
    }

    async fn remove_cart_line(&self, cart: &CartToken, food_item_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(lines) = tables.carts.get_mut(cart) else {
            return Ok(false);
        };
        let before = lines.len();
        lines.retain(|l| l.food_item_id != food_item_id);
        Ok(lines.len() != before)
    }

    async fn clear_cart(&self, cart: &CartToken) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        Ok(tables.carts.remove(cart).map_or(0, |lines| lines.len() as u64))
    }

    async fn create_order(&self, draft: OrderDraft) -> StoreResult<PlacedOrder> {
        #[cfg(any(test, feature = "testing"))]
        if *self.fail_on_create.read().await {
            return Err(StoreError::Database("injected create_order failure".to_string()));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        if tables
            .order_by_number
            .contains_key(draft.purchase_order_id.as_str())
        {
            return Err(StoreError::Duplicate {
                key: DuplicateKey::OrderNumber,
                value: draft.purchase_order_id.to_string(),
            });
        }
        if let Some(intent) = &draft.payment_intent_id {
            if tables.order_by_intent.contains_key(intent) {
                return Err(StoreError::Duplicate {
                    key: DuplicateKey::PaymentIntent,
                    value: intent.clone(),
                });
            }
        }

        let customer = match tables.customer_by_email.get(&draft.contact.email) {
            Some(id) => tables
                .customers
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::Database(format!("dangling customer index {id}")))?,
            None => {
                let customer = Customer::from_contact(&draft.contact);
                tables
                    .customer_by_email
                    .insert(customer.email.clone(), customer.id);
                tables.customers.insert(customer.id, customer.clone());
                customer
            }
        };

        let order = draft.build(customer.id, Utc::now());

        tables
            .order_by_number
            .insert(order.purchase_order_id.to_string(), order.id);
        if let Some(intent) = &order.payment_intent_id {
            tables.order_by_intent.insert(intent.clone(), order.id);
        }
        tables.items.insert(order.id, draft.items.clone());
        tables.orders.insert(order.id, order.clone());

        if draft.clears_cart() {
            tables.carts.remove(&draft.cart_token);
        }

        Ok(PlacedOrder {
            order,
            customer,
            items: draft.items,
        })
    }

    async fn transition(&self, change: StatusChange) -> StoreResult<Order> {
        let mut tables = self.tables.write().await;

        let order = tables
            .orders
            .get_mut(&change.order_id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", change.order_id)))?;

        if order.status != change.expected {
            return Err(StoreError::StaleStatus {
                order_id: order.id,
                current: order.status,
            });
        }

        order.status = change.next;
        if let Some(transaction_id) = change.transaction_id {
            order.transaction_id = transaction_id;
        }
        order.updated_at = Utc::now();
        let updated = order.clone();

        if change.clear_cart {
            tables.carts.remove(&updated.cart_token);
        }
        if let Some(refund) = change.refund {
            tables.refunds.push(refund);
        }

        Ok(updated)
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn order_by_number(&self, purchase_order_id: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_by_number
            .get(purchase_order_id)
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn order_by_intent(&self, payment_intent_id: &str) -> StoreResult<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_by_intent
            .get(payment_intent_id)
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn order_items(&self, order_id: Uuid) -> StoreResult<Vec<OrderLineItem>> {
        let tables = self.tables.read().await;
        Ok(tables.items.get(&order_id).cloned().unwrap_or_default())
    }

    async fn orders(&self) -> StoreResult<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables.orders.values().cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn customer(&self, id: Uuid) -> StoreResult<Option<Customer>> {
        Ok(self.tables.read().await.customers.get(&id).cloned())
    }

    async fn refunds(&self) -> StoreResult<Vec<RefundObligation>> {
        Ok(self.tables.read().await.refunds.clone())
    }

    async fn record_refund(&self, refund: RefundObligation) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables
            .refunds
            .iter()
            .any(|r| r.transaction_id == refund.transaction_id)
        {
            return Ok(false);
        }
        tables.refunds.push(refund);
        Ok(true)
    }

    async fn update_refund(&self, refund: &RefundObligation) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables
            .refunds
            .iter_mut()
            .find(|r| r.id == refund.id)
            .ok_or_else(|| StoreError::NotFound(format!("refund {}", refund.id)))?;
        *slot = refund.clone();
        Ok(())
    }
}
