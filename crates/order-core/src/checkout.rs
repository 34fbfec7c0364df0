//! # Checkout Orchestrator
//!
//! Turns a priced cart into a placed order. Two flows share one
//! order-creation core:
//!
//! ```text
//! pay on spot:   place_pay_on_spot ─────────────────────────► order_placed
//!
//! card:          create_payment_intent ──► create_customer_and_order
//!                (gateway only)             (order in_progress)
//!                                                   │
//!                          confirm_payment ◄────────┘ client confirms card
//!                          (order_placed, cart cleared)
//! ```
//!
//! Every step of the card flow is safe to retry: a repeated step finds the
//! rows its first attempt wrote instead of creating new ones.

use crate::cart::{CartToken, PricingSnapshot};
use crate::customer::{CheckoutForm, ContactDetails, ValidatedCheckout};
use crate::error::{CheckoutError, CheckoutResult, DuplicateKey, StoreError, ValidationErrors};
use crate::gateway::{BoxedPaymentGateway, IntentStatus, PaymentIntent, MINIMUM_CHARGE};
use crate::lifecycle::{Applied, OrderLifecycle, TransitionRequest};
use crate::money::Money;
use crate::order::{
    Order, OrderLineItem, OrderNumber, OrderStatus, PaymentMethod, PAY_ON_SPOT_TRANSACTION,
};
use crate::store::{CheckoutStore, Finalize, OrderDraft, PlacedOrder};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Fresh order numbers tried before a collision is reported
const ORDER_NUMBER_ATTEMPTS: usize = 5;

/// Result of step 2 of the card flow
#[derive(Debug, Clone, Serialize)]
pub struct CardOrder {
    /// Customer id at the gateway
    pub gateway_customer_id: String,
    pub order: Order,
    /// True when a retried call returned the order created earlier
    pub resumed: bool,
}

/// Result of step 3 of the card flow
#[derive(Debug, Clone, Serialize)]
pub struct PaymentConfirmation {
    pub order: Order,
    pub transaction_id: String,
    /// False when the order had already been placed by this intent
    pub newly_placed: bool,
}

pub struct CheckoutOrchestrator {
    gateway: BoxedPaymentGateway,
    store: Arc<dyn CheckoutStore>,
    lifecycle: OrderLifecycle,
}

impl CheckoutOrchestrator {
    pub fn new(gateway: BoxedPaymentGateway, store: Arc<dyn CheckoutStore>) -> Self {
        let lifecycle = OrderLifecycle::new(store.clone());
        Self {
            gateway,
            store,
            lifecycle,
        }
    }

    /// Cash flow: one call, one atomic write, order ends `order_placed`.
    #[instrument(skip(self, form), fields(cart = %cart))]
    pub async fn place_pay_on_spot(
        &self,
        cart: &CartToken,
        form: &CheckoutForm,
    ) -> CheckoutResult<PlacedOrder> {
        let (snapshot, items) = self.snapshot(cart).await?;
        let checkout = form.validate()?;

        OrderStatus::InProgress.transition(OrderStatus::OrderPlaced)?;

        let draft = draft(
            cart,
            checkout,
            snapshot,
            items,
            PaymentMethod::None,
            None,
            Some(Finalize {
                status: OrderStatus::OrderPlaced,
                transaction_id: PAY_ON_SPOT_TRANSACTION.to_string(),
                clear_cart: true,
            }),
        );

        let placed = self.insert(draft).await?;
        info!(
            "Pay-on-spot order placed: order={}, total={}, items={}",
            placed.order.purchase_order_id,
            placed.order.total(),
            snapshot.item_count
        );
        Ok(placed)
    }

    /// Card flow step 1. Nothing is written locally.
    #[instrument(skip(self))]
    pub async fn create_payment_intent(&self, total: Money) -> CheckoutResult<PaymentIntent> {
        if total < MINIMUM_CHARGE {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "total_price",
                format!("The total price must be at least {}.", MINIMUM_CHARGE),
            )));
        }

        let description = format!("Order Payment #{}", Utc::now().format("%Y%m%d%H%M%S"));
        let intent = self
            .gateway
            .create_payment_intent(total, &description)
            .await?;

        info!(
            "Created {} payment intent {} for {}",
            self.gateway.provider_name(),
            intent.id,
            total
        );
        Ok(intent)
    }

    /// Card flow step 2: attach a gateway customer and create the order in
    /// `in_progress`. The cart is kept until payment is confirmed.
    #[instrument(skip(self, form), fields(cart = %cart))]
    pub async fn create_customer_and_order(
        &self,
        cart: &CartToken,
        payment_intent_id: &str,
        form: &CheckoutForm,
    ) -> CheckoutResult<CardOrder> {
        check_intent_id("payment_intent_id", payment_intent_id)?;
        let checkout = form.validate()?;

        if let Some(existing) = self.store.order_by_intent(payment_intent_id).await? {
            return self
                .resume_card_order(existing, &checkout.contact, payment_intent_id)
                .await;
        }

        let (snapshot, items) = self.snapshot(cart).await?;

        let gateway_customer_id = self
            .gateway
            .attach_customer(
                payment_intent_id,
                &checkout.contact.email,
                &checkout.contact.full_name(),
            )
            .await?;

        let contact = checkout.contact.clone();
        let draft = draft(
            cart,
            checkout,
            snapshot,
            items,
            PaymentMethod::ExternalGateway,
            Some(payment_intent_id.to_string()),
            None,
        );

        match self.insert(draft).await {
            Ok(placed) => {
                info!(
                    "Card order created: order={}, intent={}, customer={}",
                    placed.order.purchase_order_id, payment_intent_id, gateway_customer_id
                );
                Ok(CardOrder {
                    gateway_customer_id,
                    order: placed.order,
                    resumed: false,
                })
            }
            Err(CheckoutError::Store(StoreError::Duplicate {
                key: DuplicateKey::PaymentIntent,
                ..
            })) => {
                // A concurrent retry won the insert.
                let existing = self
                    .store
                    .order_by_intent(payment_intent_id)
                    .await?
                    .ok_or_else(|| CheckoutError::not_found("Order", payment_intent_id))?;
                self.resume_card_order(existing, &contact, payment_intent_id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Card flow step 3: verify the intent with the gateway and place the order.
    #[instrument(skip(self))]
    pub async fn confirm_payment(
        &self,
        payment_intent_id: &str,
        gateway_customer_id: &str,
        order_id: Uuid,
    ) -> CheckoutResult<PaymentConfirmation> {
        check_intent_id("payment_intent", payment_intent_id)?;

        let order = self
            .store
            .order(order_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("Order", order_id))?;

        if order.payment_intent_id.as_deref() != Some(payment_intent_id) {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "payment_intent",
                "The payment intent does not belong to this order.",
            )));
        }

        if order.is_settled_by(payment_intent_id) {
            return Ok(confirmation(order, false));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(self.cancelled_before_payment(order, payment_intent_id).await);
        }
        if order.status != OrderStatus::InProgress {
            return Err(CheckoutError::InvalidTransition {
                from: order.status,
                to: OrderStatus::OrderPlaced,
            });
        }

        let intent = self.gateway.retrieve_payment_intent(payment_intent_id).await?;
        let customer = self.gateway.retrieve_customer(gateway_customer_id).await?;

        if intent.status != IntentStatus::Succeeded {
            warn!(
                "Payment not completed: order={}, intent={}, status={}",
                order.purchase_order_id, intent.id, intent.status
            );
            return Err(CheckoutError::PaymentNotSucceeded {
                status: intent.status.to_string(),
            });
        }
        if intent.customer.as_deref().is_some_and(|c| c != customer.id) {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "customer_id",
                "The customer does not belong to this payment.",
            )));
        }
        if intent.amount != order.total() {
            warn!(
                "Intent amount differs from order total: order={}, intent={}, order_total={}",
                order.purchase_order_id, intent.amount, order.total()
            );
        }

        let request = TransitionRequest::to(OrderStatus::OrderPlaced)
            .with_transaction(payment_intent_id)
            .clearing_cart()
            .with_reason("payment confirmed by client");

        match self.lifecycle.apply(order, &request).await {
            Ok(Applied::Moved { order, .. }) => {
                info!(
                    "Payment confirmed: order={}, transaction={}",
                    order.purchase_order_id, order.transaction_id
                );
                Ok(confirmation(order, true))
            }
            Ok(Applied::Unchanged(order)) => Ok(confirmation(order, false)),
            Err(CheckoutError::InvalidTransition { from, to }) => {
                // The webhook may have settled the order first.
                let current = self
                    .store
                    .order(order_id)
                    .await?
                    .ok_or_else(|| CheckoutError::not_found("Order", order_id))?;
                if current.is_settled_by(payment_intent_id) {
                    Ok(confirmation(current, false))
                } else if current.status == OrderStatus::Cancelled {
                    Err(self.cancelled_before_payment(current, payment_intent_id).await)
                } else {
                    Err(CheckoutError::InvalidTransition { from, to })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The error for confirming a cancelled order. If the intent took money
    /// anyway, a refund obligation is recorded first.
    async fn cancelled_before_payment(&self, order: Order, payment_intent_id: &str) -> CheckoutError {
        let rejection = CheckoutError::InvalidTransition {
            from: OrderStatus::Cancelled,
            to: OrderStatus::OrderPlaced,
        };

        let intent = match self.gateway.retrieve_payment_intent(payment_intent_id).await {
            Ok(intent) => intent,
            Err(e) => return e,
        };
        if intent.status != IntentStatus::Succeeded {
            return rejection;
        }

        match self
            .lifecycle
            .record_stranded_payment(&order, payment_intent_id, intent.amount)
            .await
        {
            Ok(_) => rejection,
            Err(e) => e,
        }
    }

    async fn snapshot(
        &self,
        cart: &CartToken,
    ) -> CheckoutResult<(PricingSnapshot, Vec<OrderLineItem>)> {
        let lines = self.store.cart_lines(cart).await?;
        let snapshot = PricingSnapshot::capture(&lines);
        if snapshot.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        Ok((snapshot, lines.iter().map(OrderLineItem::from_cart_line).collect()))
    }

    async fn resume_card_order(
        &self,
        existing: Order,
        contact: &ContactDetails,
        payment_intent_id: &str,
    ) -> CheckoutResult<CardOrder> {
        let owner = self
            .store
            .customer(existing.customer_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("Customer", existing.customer_id))?;

        if owner.email != contact.email {
            return Err(CheckoutError::IdempotencyConflict(format!(
                "payment intent {} already belongs to order {}",
                payment_intent_id, existing.purchase_order_id
            )));
        }

        let gateway_customer_id = self
            .gateway
            .attach_customer(payment_intent_id, &contact.email, &contact.full_name())
            .await?;

        info!(
            "Retried checkout resumed existing order {} for intent {}",
            existing.purchase_order_id, payment_intent_id
        );
        Ok(CardOrder {
            gateway_customer_id,
            order: existing,
            resumed: true,
        })
    }

    /// `create_order`, regenerating the order number on collision
    async fn insert(&self, mut draft: OrderDraft) -> CheckoutResult<PlacedOrder> {
        for _ in 0..ORDER_NUMBER_ATTEMPTS {
            match self.store.create_order(draft.clone()).await {
                Err(StoreError::Duplicate {
                    key: DuplicateKey::OrderNumber,
                    value,
                }) => {
                    warn!("Order number {} already taken, regenerating", value);
                    draft.purchase_order_id = OrderNumber::generate();
                }
                result => return Ok(result?),
            }
        }
        Err(CheckoutError::Integrity(format!(
            "no free order number after {} attempts",
            ORDER_NUMBER_ATTEMPTS
        )))
    }
}

/// Gateway intent ids look like `pi_` followed by `[A-Za-z0-9_]`
fn check_intent_id(field: &str, id: &str) -> CheckoutResult<()> {
    if id.trim().is_empty() {
        return Err(CheckoutError::Validation(ValidationErrors::single(
            field,
            "The payment intent id field is required.",
        )));
    }
    let well_formed = id.strip_prefix("pi_").is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if !well_formed {
        return Err(CheckoutError::Validation(ValidationErrors::single(
            field,
            "The payment intent id is malformed.",
        )));
    }
    Ok(())
}

fn draft(
    cart: &CartToken,
    checkout: ValidatedCheckout,
    snapshot: PricingSnapshot,
    items: Vec<OrderLineItem>,
    payment_method: PaymentMethod,
    payment_intent_id: Option<String>,
    finalize: Option<Finalize>,
) -> OrderDraft {
    OrderDraft {
        purchase_order_id: OrderNumber::generate(),
        cart_token: cart.clone(),
        contact: checkout.contact,
        payment_method,
        price: snapshot.total,
        shipping_cost: checkout.shipping_cost,
        payment_intent_id,
        fulfillment: checkout.fulfillment,
        notes: checkout.notes,
        items,
        finalize,
    }
}

fn confirmation(order: Order, newly_placed: bool) -> PaymentConfirmation {
    PaymentConfirmation {
        transaction_id: order.transaction_id.clone(),
        order,
        newly_placed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartLine;
    use crate::memory::MemoryStore;
    use crate::order::line_items_total;
    use crate::testing::FakeGateway;

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        checkout: CheckoutOrchestrator,
        cart: CartToken,
    }

    fn line(id: &str, cents: i64, quantity: u32) -> CartLine {
        CartLine {
            food_item_id: id.into(),
            name: id.to_uppercase(),
            quantity,
            unit_price: Money::from_cents(cents),
            unit_discount: Money::ZERO,
            added_at: Utc::now(),
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let checkout = CheckoutOrchestrator::new(gateway.clone(), store.clone());
        let cart = CartToken::generate();

        store.add_cart_line(&cart, line("pizza", 1000, 2)).await.unwrap();
        store.add_cart_line(&cart, line("salad", 500, 1)).await.unwrap();

        Fixture {
            store,
            gateway,
            checkout,
            cart,
        }
    }

    fn form(order_type: &str) -> CheckoutForm {
        CheckoutForm {
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            phone: "0123456789".into(),
            shipping_cost: Some(3.0),
            order_type: order_type.into(),
            ..Default::default()
        }
    }

    fn delivery_form() -> CheckoutForm {
        CheckoutForm {
            address: Some("12 Analytical Row".into()),
            post_code: Some("N1 9GU".into()),
            ..form("delivery")
        }
    }

    #[tokio::test]
    async fn test_pay_on_spot_places_order_and_clears_cart() {
        let fx = fixture().await;

        let placed = fx
            .checkout
            .place_pay_on_spot(&fx.cart, &form("pay_on_spot"))
            .await
            .unwrap();

        assert_eq!(placed.order.price, Money::from_cents(2500));
        assert_eq!(placed.order.total(), Money::from_cents(2800));
        assert_eq!(placed.order.status, OrderStatus::OrderPlaced);
        assert_eq!(placed.order.payment_method, PaymentMethod::None);
        assert_eq!(placed.order.transaction_id, PAY_ON_SPOT_TRANSACTION);
        assert_eq!(line_items_total(&placed.items), placed.order.price);
        assert!(fx.store.cart_lines(&fx.cart).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_frozen_at_checkout() {
        let fx = fixture().await;
        let placed = fx
            .checkout
            .place_pay_on_spot(&fx.cart, &form("takeaway"))
            .await
            .unwrap();

        fx.store.add_cart_line(&fx.cart, line("pizza", 9900, 5)).await.unwrap();

        let stored = fx.store.order(placed.order.id).await.unwrap().unwrap();
        let items = fx.store.order_items(placed.order.id).await.unwrap();
        assert_eq!(stored.price, Money::from_cents(2500));
        assert_eq!(line_items_total(&items), Money::from_cents(2500));
    }

    #[tokio::test]
    async fn test_empty_cart_is_refused() {
        let fx = fixture().await;
        let empty = CartToken::generate();

        let err = fx
            .checkout
            .place_pay_on_spot(&empty, &form("pay_on_spot"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));

        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let err = fx
            .checkout
            .create_customer_and_order(&empty, &intent.id, &form("takeaway"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::EmptyCart));

        assert!(fx.store.orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cart_untouched() {
        let fx = fixture().await;
        fx.store.set_fail_on_create(true).await;

        let result = fx.checkout.place_pay_on_spot(&fx.cart, &form("pay_on_spot")).await;
        assert!(matches!(result, Err(CheckoutError::Store(_))));

        assert_eq!(fx.store.cart_lines(&fx.cart).await.unwrap().len(), 2);
        assert!(fx.store.orders().await.unwrap().is_empty());
        assert_eq!(fx.store.customer_count().await, 0);
    }

    #[tokio::test]
    async fn test_delivery_needs_address_and_post_code() {
        let fx = fixture().await;

        let err = fx
            .checkout
            .place_pay_on_spot(&fx.cart, &form("delivery"))
            .await
            .unwrap_err();
        let errors = err.validation_errors().unwrap();
        assert!(errors.has_field("address"));
        assert!(errors.has_field("post_code"));
        assert!(fx.store.orders().await.unwrap().is_empty());

        let placed = fx.checkout.place_pay_on_spot(&fx.cart, &delivery_form()).await.unwrap();
        assert_eq!(placed.order.address.as_deref(), Some("12 Analytical Row"));
    }

    #[tokio::test]
    async fn test_payment_intent_minimum() {
        let fx = fixture().await;

        let err = fx
            .checkout
            .create_payment_intent(Money::from_cents(49))
            .await
            .unwrap_err();
        assert!(err.validation_errors().unwrap().has_field("total_price"));

        let intent = fx.checkout.create_payment_intent(Money::from_cents(50)).await.unwrap();
        assert!(intent.client_secret.is_some());
    }

    #[tokio::test]
    async fn test_gateway_error_is_verbatim() {
        let fx = fixture().await;
        fx.gateway.fail_next("Your card was declined.");

        let err = fx
            .checkout
            .create_payment_intent(Money::from_cents(2800))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Your card was declined.");
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_card_flow_happy_path() {
        let fx = fixture().await;

        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &delivery_form())
            .await
            .unwrap();

        assert_eq!(card.order.status, OrderStatus::InProgress);
        assert_eq!(card.order.payment_method, PaymentMethod::ExternalGateway);
        assert_eq!(card.order.payment_intent_id.as_deref(), Some(intent.id.as_str()));
        assert_eq!(fx.store.cart_lines(&fx.cart).await.unwrap().len(), 2);

        fx.gateway.set_intent_status(&intent.id, IntentStatus::Succeeded);
        let confirmed = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap();

        assert!(confirmed.newly_placed);
        assert_eq!(confirmed.order.status, OrderStatus::OrderPlaced);
        assert_eq!(confirmed.transaction_id, intent.id);
        assert!(fx.store.cart_lines(&fx.cart).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_payment_twice_is_idempotent() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();
        fx.gateway.set_intent_status(&intent.id, IntentStatus::Succeeded);

        let first = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap();
        let second = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap();

        assert!(!second.newly_placed);
        assert_eq!(second.order.status, OrderStatus::OrderPlaced);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert_eq!(second.order.updated_at, first.order.updated_at);
        assert_eq!(fx.store.order_items(card.order.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retried_step_two_reuses_order_and_customer() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();

        let first = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();
        let second = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();

        assert!(second.resumed);
        assert_eq!(second.order.id, first.order.id);
        assert_eq!(second.gateway_customer_id, first.gateway_customer_id);
        assert_eq!(fx.gateway.customers_created(), 1);
        assert_eq!(fx.store.orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_intent_cannot_be_reused_by_another_customer() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        fx.checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();

        let other = CheckoutForm {
            email: "grace@example.com".into(),
            ..form("takeaway")
        };
        let err = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &other)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_unsucceeded_payment_leaves_order_in_progress() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();

        let err = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::PaymentNotSucceeded { .. }));

        let stored = fx.store.order(card.order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::InProgress);
        assert_eq!(fx.store.cart_lines(&fx.cart).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_after_webhook_settled_order() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();
        fx.gateway.set_intent_status(&intent.id, IntentStatus::Succeeded);

        OrderLifecycle::new(fx.store.clone())
            .apply(
                card.order.clone(),
                &TransitionRequest::to(OrderStatus::Confirmed)
                    .with_transaction(intent.id.clone())
                    .clearing_cart(),
            )
            .await
            .unwrap();

        let confirmed = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap();
        assert!(!confirmed.newly_placed);
        assert_eq!(confirmed.order.status, OrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_confirm_with_foreign_intent_is_rejected() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();

        let err = fx
            .checkout
            .confirm_payment("pi_elsewhere", &card.gateway_customer_id, card.order.id)
            .await
            .unwrap_err();
        assert!(err.validation_errors().unwrap().has_field("payment_intent"));

        let err = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_malformed_intent_id_is_rejected() {
        let fx = fixture().await;

        for bad in ["", "pi_", "cus_123", "pi_1/../../v1/refunds", "pi_1?expand=customer"] {
            let err = fx
                .checkout
                .create_customer_and_order(&fx.cart, bad, &form("takeaway"))
                .await
                .unwrap_err();
            assert!(err.validation_errors().unwrap().has_field("payment_intent_id"), "{bad:?}");

            let err = fx
                .checkout
                .confirm_payment(bad, "cus_000001", Uuid::new_v4())
                .await
                .unwrap_err();
            assert!(err.validation_errors().unwrap().has_field("payment_intent"), "{bad:?}");
        }
        assert_eq!(fx.gateway.customers_created(), 0);
        assert!(fx.store.orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payment_after_cancellation_is_owed_back() {
        use crate::reconcile::{WebhookOutcome, WebhookReconciler};
        use crate::testing::FAKE_SIGNATURE;

        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();

        // First card attempt declined, then the retry on the same intent succeeds.
        let reconciler = WebhookReconciler::new(fx.gateway.clone(), fx.store.clone());
        let failed = FakeGateway::event_payload("payment_intent.payment_failed", &intent.id);
        reconciler.handle(&failed, FAKE_SIGNATURE).await.unwrap();
        fx.gateway.set_intent_status(&intent.id, IntentStatus::Succeeded);

        let err = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidTransition {
                from: OrderStatus::Cancelled,
                to: OrderStatus::OrderPlaced
            }
        ));

        let refunds = fx.store.refunds().await.unwrap();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].order_id, card.order.id);
        assert_eq!(refunds[0].transaction_id, intent.id);
        assert_eq!(refunds[0].amount, Money::from_cents(2800));

        // The webhook for the same success does not record a second one.
        let succeeded = FakeGateway::event_payload("payment_intent.succeeded", &intent.id);
        let outcome = reconciler.handle(&succeeded, FAKE_SIGNATURE).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::RefundOwed { recorded: false, .. }));
        assert!(fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .is_err());
        assert_eq!(fx.store.refunds().await.unwrap().len(), 1);

        let stored = fx.store.order(card.order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_declined_cancelled_order_owes_nothing() {
        let fx = fixture().await;
        let intent = fx.checkout.create_payment_intent(Money::from_cents(2800)).await.unwrap();
        let card = fx
            .checkout
            .create_customer_and_order(&fx.cart, &intent.id, &form("takeaway"))
            .await
            .unwrap();
        OrderLifecycle::new(fx.store.clone())
            .apply(card.order.clone(), &TransitionRequest::to(OrderStatus::Cancelled))
            .await
            .unwrap();

        let err = fx
            .checkout
            .confirm_payment(&intent.id, &card.gateway_customer_id, card.order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidTransition { .. }));
        assert!(fx.store.refunds().await.unwrap().is_empty());
    }
}
