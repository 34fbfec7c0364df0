//! # Order Lifecycle
//!
//! Applies status changes through the canonical table in
//! [`OrderStatus::transition`] using status-guarded writes. When a write loses
//! a race, the order is re-read and the request is re-evaluated against the
//! fresh status.
//!
//! Cancelling an order paid through the gateway records a refund obligation
//! in the same write. A payment that succeeds after its order was cancelled
//! records one too, at most once per payment intent.

use crate::error::{CheckoutError, CheckoutResult, StoreError, ValidationErrors};
use crate::money::Money;
use crate::order::{Order, OrderStatus, Transition};
use crate::refund::RefundObligation;
use crate::store::{CheckoutStore, StatusChange};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Re-reads allowed before a contended order is reported as an error
const MAX_ATTEMPTS: usize = 5;

/// A requested status change
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub next: OrderStatus,
    /// Recorded on the order with the status change
    pub transaction_id: Option<String>,
    /// Clear the order's cart if this change moves it out of `in_progress`
    pub clear_cart_on_leave: bool,
    /// Treat "already at `next`" as success instead of consulting the table
    pub idempotent_at_target: bool,
    /// Why (logged, and stored on refund obligations)
    pub reason: Option<String>,
}

impl TransitionRequest {
    pub fn to(next: OrderStatus) -> Self {
        Self {
            next,
            transaction_id: None,
            clear_cart_on_leave: false,
            idempotent_at_target: false,
            reason: None,
        }
    }

    pub fn with_transaction(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn clearing_cart(mut self) -> Self {
        self.clear_cart_on_leave = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent_at_target = true;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What a transition did
#[derive(Debug, Clone)]
pub enum Applied {
    /// Status changed
    Moved {
        from: OrderStatus,
        order: Order,
        refund: Option<RefundObligation>,
    },
    /// Order was already where the request wanted it
    Unchanged(Order),
}

impl Applied {
    pub fn order(&self) -> &Order {
        match self {
            Applied::Moved { order, .. } => order,
            Applied::Unchanged(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Applied::Moved { order, .. } => order,
            Applied::Unchanged(order) => order,
        }
    }
}

/// Statuses staff may set by hand
pub const STAFF_STATUSES: &[OrderStatus] = &[OrderStatus::Confirmed, OrderStatus::Cancelled];

#[derive(Clone)]
pub struct OrderLifecycle {
    store: Arc<dyn CheckoutStore>,
}

impl OrderLifecycle {
    pub fn new(store: Arc<dyn CheckoutStore>) -> Self {
        Self { store }
    }

    /// Apply `request` to `order`, starting from the caller's copy.
    #[instrument(skip(self, order, request), fields(order = %order.purchase_order_id, next = %request.next))]
    pub async fn apply(&self, mut order: Order, request: &TransitionRequest) -> CheckoutResult<Applied> {
        for _ in 0..MAX_ATTEMPTS {
            if request.idempotent_at_target && order.status == request.next {
                return Ok(Applied::Unchanged(order));
            }
            if order.status.transition(request.next)? == Transition::Stay {
                return Ok(Applied::Unchanged(order));
            }

            let from = order.status;
            let refund = if request.next == OrderStatus::Cancelled {
                RefundObligation::for_order(&order, request.reason.clone())
            } else {
                None
            };

            let change = StatusChange {
                order_id: order.id,
                expected: from,
                next: request.next,
                transaction_id: request.transaction_id.clone(),
                clear_cart: request.clear_cart_on_leave && from == OrderStatus::InProgress,
                refund: refund.clone(),
            };

            match self.store.transition(change).await {
                Ok(updated) => {
                    info!(
                        "Order status updated: order={}, {} -> {}, reason={:?}",
                        updated.purchase_order_id, from, updated.status, request.reason
                    );
                    if let Some(refund) = &refund {
                        warn!(
                            "Refund required for cancelled order: order={}, transaction={}, amount={}",
                            refund.purchase_order_id, refund.transaction_id, refund.amount
                        );
                    }
                    return Ok(Applied::Moved {
                        from,
                        order: updated,
                        refund,
                    });
                }
                Err(StoreError::StaleStatus { current, .. }) => {
                    info!(
                        "Order {} changed to {} concurrently, re-evaluating",
                        order.purchase_order_id, current
                    );
                    order = self
                        .store
                        .order(order.id)
                        .await?
                        .ok_or_else(|| CheckoutError::not_found("Order", order.id))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CheckoutError::Integrity(format!(
            "order {} kept changing status; giving up after {} attempts",
            order.purchase_order_id, MAX_ATTEMPTS
        )))
    }

    /// Record that `payment_intent_id` took `amount` for an order that is
    /// already cancelled. Returns whether a new obligation was written.
    pub async fn record_stranded_payment(
        &self,
        order: &Order,
        payment_intent_id: &str,
        amount: Money,
    ) -> CheckoutResult<bool> {
        let refund = RefundObligation::for_stranded_payment(order, payment_intent_id, amount);
        let recorded = self.store.record_refund(refund).await?;
        if recorded {
            warn!(
                "Payment succeeded on cancelled order, refund required: order={}, transaction={}, amount={}",
                order.purchase_order_id, payment_intent_id, amount
            );
        }
        Ok(recorded)
    }

    /// Staff action: move an order to `confirmed` or `cancelled`.
    pub async fn update_status(
        &self,
        purchase_order_id: &str,
        requested: OrderStatus,
        reason: Option<String>,
    ) -> CheckoutResult<Applied> {
        if !STAFF_STATUSES.contains(&requested) {
            return Err(CheckoutError::Validation(ValidationErrors::single(
                "status",
                "The selected status is invalid.",
            )));
        }

        let order = self
            .store
            .order_by_number(purchase_order_id)
            .await?
            .ok_or_else(|| CheckoutError::not_found("Order", purchase_order_id))?;

        let mut request = TransitionRequest::to(requested);
        request.reason = reason;
        self.apply(order, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartToken;
    use crate::customer::ContactDetails;
    use crate::memory::MemoryStore;
    use crate::money::Money;
    use crate::order::{FulfillmentType, OrderNumber, PaymentMethod};
    use crate::store::{Finalize, OrderDraft};

    async fn placed(store: &MemoryStore, method: PaymentMethod, finalize: Option<Finalize>) -> Order {
        store
            .create_order(OrderDraft {
                purchase_order_id: OrderNumber::generate(),
                cart_token: CartToken::generate(),
                contact: ContactDetails {
                    first_name: "Ada".into(),
                    last_name: "Lovelace".into(),
                    email: "ada@example.com".into(),
                    phone: "0123".into(),
                    address: None,
                    post_code: None,
                },
                payment_method: method,
                price: Money::from_cents(2500),
                shipping_cost: Money::from_cents(300),
                payment_intent_id: None,
                fulfillment: FulfillmentType::Takeaway,
                notes: None,
                items: vec![],
                finalize,
            })
            .await
            .unwrap()
            .order
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_order_untouched() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = OrderLifecycle::new(store.clone());
        let order = placed(&store, PaymentMethod::None, None).await;

        let confirmed = lifecycle
            .apply(order, &TransitionRequest::to(OrderStatus::Confirmed))
            .await
            .unwrap()
            .into_order();

        let err = lifecycle
            .apply(confirmed.clone(), &TransitionRequest::to(OrderStatus::OrderPlaced))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InvalidTransition {
                from: OrderStatus::Confirmed,
                to: OrderStatus::OrderPlaced
            }
        ));

        let stored = store.order(confirmed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(stored.updated_at, confirmed.updated_at);
    }

    #[tokio::test]
    async fn test_stale_copy_is_re_evaluated() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = OrderLifecycle::new(store.clone());
        let stale = placed(&store, PaymentMethod::None, None).await;

        lifecycle
            .apply(stale.clone(), &TransitionRequest::to(OrderStatus::Cancelled))
            .await
            .unwrap();

        // Caller still believes the order is in_progress.
        let result = lifecycle
            .apply(stale.clone(), &TransitionRequest::to(OrderStatus::OrderPlaced))
            .await;
        assert!(matches!(
            result,
            Err(CheckoutError::InvalidTransition {
                from: OrderStatus::Cancelled,
                ..
            })
        ));

        let again = lifecycle
            .apply(stale, &TransitionRequest::to(OrderStatus::Cancelled))
            .await
            .unwrap();
        assert!(matches!(again, Applied::Unchanged(_)));
    }

    #[tokio::test]
    async fn test_cancelling_paid_order_records_refund() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = OrderLifecycle::new(store.clone());
        let order = placed(
            &store,
            PaymentMethod::ExternalGateway,
            Some(Finalize {
                status: OrderStatus::OrderPlaced,
                transaction_id: "pi_paid".into(),
                clear_cart: false,
            }),
        )
        .await;

        let applied = lifecycle
            .update_status(
                order.purchase_order_id.as_str(),
                OrderStatus::Cancelled,
                Some("kitchen closed".into()),
            )
            .await
            .unwrap();

        match applied {
            Applied::Moved { refund: Some(refund), order, .. } => {
                assert_eq!(order.status, OrderStatus::Cancelled);
                assert_eq!(refund.amount, Money::from_cents(2800));
                assert_eq!(refund.reason.as_deref(), Some("kitchen closed"));
            }
            other => panic!("expected a refund obligation, got {other:?}"),
        }
        assert_eq!(store.refunds().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelling_cash_order_records_no_refund() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = OrderLifecycle::new(store.clone());
        let order = placed(
            &store,
            PaymentMethod::None,
            Some(Finalize {
                status: OrderStatus::OrderPlaced,
                transaction_id: "PAY_ON_SPOT".into(),
                clear_cart: false,
            }),
        )
        .await;

        lifecycle
            .update_status(order.purchase_order_id.as_str(), OrderStatus::Cancelled, None)
            .await
            .unwrap();
        assert!(store.refunds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_staff_cannot_set_arbitrary_status() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = OrderLifecycle::new(store.clone());
        let order = placed(&store, PaymentMethod::None, None).await;

        let err = lifecycle
            .update_status(order.purchase_order_id.as_str(), OrderStatus::OrderPlaced, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Validation(_)));

        let err = lifecycle
            .update_status("ORD-missing", OrderStatus::Confirmed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::NotFound { .. }));
    }
}
