//! # Refund obligations
//!
//! Cancelling an order that was paid through the gateway writes a
//! `RefundObligation` in the same unit of work as the status change.
//! `RefundDesk` settles pending obligations through the gateway on demand.

use crate::error::CheckoutResult;
use crate::gateway::BoxedPaymentGateway;
use crate::money::Money;
use crate::order::{Order, OrderNumber};
use crate::store::CheckoutStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    /// Recorded, not yet sent to the gateway
    Pending,
    /// Gateway reported the refund `succeeded`
    Issued,
    /// Last attempt failed; retried on the next settlement
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Issued => "issued",
            RefundStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RefundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "issued" => Ok(RefundStatus::Issued),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(format!("unknown refund status: {other}")),
        }
    }
}

/// Money owed back to a customer for a cancelled, paid order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundObligation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub purchase_order_id: OrderNumber,
    /// Gateway transaction (payment intent) to refund
    pub transaction_id: String,
    pub amount: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub status: RefundStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_refund_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundObligation {
    /// The obligation cancelling `order` creates, if it was paid through the gateway
    pub fn for_order(order: &Order, reason: Option<String>) -> Option<Self> {
        if !order.has_gateway_payment() {
            return None;
        }
        let now = Utc::now();
        Some(Self {
            id: Uuid::new_v4(),
            order_id: order.id,
            purchase_order_id: order.purchase_order_id.clone(),
            transaction_id: order.transaction_id.clone(),
            amount: order.total(),
            reason,
            status: RefundStatus::Pending,
            gateway_refund_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// The obligation a payment that succeeded after `order` was cancelled
    /// creates. The money is owed back regardless of the order's own fields.
    pub fn for_stranded_payment(order: &Order, payment_intent_id: &str, amount: Money) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id: order.id,
            purchase_order_id: order.purchase_order_id.clone(),
            transaction_id: payment_intent_id.to_string(),
            amount,
            reason: Some("payment succeeded after the order was cancelled".to_string()),
            status: RefundStatus::Pending,
            gateway_refund_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Key the gateway deduplicates refund requests on
    pub fn idempotency_key(&self) -> String {
        format!("refund-{}", self.id)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, RefundStatus::Pending | RefundStatus::Failed)
    }
}

/// Outcome of one settlement run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefundSettlement {
    pub issued: usize,
    pub failed: usize,
}

/// Sends open refund obligations to the gateway
pub struct RefundDesk {
    gateway: BoxedPaymentGateway,
    store: Arc<dyn CheckoutStore>,
}

impl RefundDesk {
    pub fn new(gateway: BoxedPaymentGateway, store: Arc<dyn CheckoutStore>) -> Self {
        Self { gateway, store }
    }

    pub async fn obligations(&self) -> CheckoutResult<Vec<RefundObligation>> {
        Ok(self.store.refunds().await?)
    }

    /// Attempt every pending or previously failed refund once.
    ///
    /// Gateway failures are recorded on the obligation, not returned.
    #[instrument(skip(self))]
    pub async fn settle_open(&self) -> CheckoutResult<RefundSettlement> {
        let mut settlement = RefundSettlement::default();

        for mut obligation in self.store.refunds().await? {
            if !obligation.is_open() {
                continue;
            }

            let key = obligation.idempotency_key();
            match self
                .gateway
                .refund(&obligation.transaction_id, Some(obligation.amount), &key)
                .await
            {
                Ok(receipt) if !receipt.is_succeeded() => {
                    warn!(
                        "Refund not completed: order={}, transaction={}, refund={}, status={}",
                        obligation.purchase_order_id,
                        obligation.transaction_id,
                        receipt.refund_id,
                        receipt.status
                    );
                    obligation.status = RefundStatus::Failed;
                    obligation.last_error =
                        Some(format!("refund {} is {}", receipt.refund_id, receipt.status));
                    obligation.gateway_refund_id = Some(receipt.refund_id);
                    settlement.failed += 1;
                }
                Ok(receipt) => {
                    info!(
                        "Refund issued: order={}, transaction={}, refund={}, amount={}",
                        obligation.purchase_order_id,
                        obligation.transaction_id,
                        receipt.refund_id,
                        obligation.amount
                    );
                    obligation.status = RefundStatus::Issued;
                    obligation.gateway_refund_id = Some(receipt.refund_id);
                    obligation.last_error = None;
                    settlement.issued += 1;
                }
                Err(e) => {
                    error!(
                        "Refund failed: order={}, transaction={}: {}",
                        obligation.purchase_order_id, obligation.transaction_id, e
                    );
                    obligation.status = RefundStatus::Failed;
                    obligation.last_error = Some(e.to_string());
                    settlement.failed += 1;
                }
            }

            obligation.updated_at = Utc::now();
            self.store.update_refund(&obligation).await?;
        }

        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::CartToken;
    use crate::order::{FulfillmentType, OrderStatus, PaymentMethod, PENDING_TRANSACTION};

    fn order(method: PaymentMethod, transaction_id: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            purchase_order_id: OrderNumber::generate(),
            customer_id: Uuid::new_v4(),
            cart_token: CartToken::generate(),
            status: OrderStatus::OrderPlaced,
            payment_method: method,
            price: Money::from_cents(2500),
            shipping_cost: Money::from_cents(300),
            transaction_id: transaction_id.to_string(),
            payment_intent_id: None,
            fulfillment: FulfillmentType::Delivery,
            notes: None,
            address: None,
            post_code: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_paid_card_order_owes_full_total() {
        let paid = order(PaymentMethod::ExternalGateway, "pi_123");
        let obligation = RefundObligation::for_order(&paid, Some("customer request".into())).unwrap();

        assert_eq!(obligation.amount, Money::from_cents(2800));
        assert_eq!(obligation.transaction_id, "pi_123");
        assert_eq!(obligation.status, RefundStatus::Pending);
        assert!(obligation.is_open());
    }

    #[test]
    fn test_unpaid_orders_owe_nothing() {
        assert!(RefundObligation::for_order(&order(PaymentMethod::ExternalGateway, PENDING_TRANSACTION), None).is_none());
        assert!(RefundObligation::for_order(&order(PaymentMethod::None, "PAY_ON_SPOT"), None).is_none());
    }

    async fn cancelled_paid_order(store: &Arc<crate::memory::MemoryStore>) {
        use crate::customer::ContactDetails;
        use crate::lifecycle::{OrderLifecycle, TransitionRequest};
        use crate::store::{Finalize, OrderDraft};

        let placed = store
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
                payment_method: PaymentMethod::ExternalGateway,
                price: Money::from_cents(2500),
                shipping_cost: Money::from_cents(300),
                payment_intent_id: Some("pi_paid".into()),
                fulfillment: FulfillmentType::Takeaway,
                notes: None,
                items: vec![],
                finalize: Some(Finalize {
                    status: OrderStatus::OrderPlaced,
                    transaction_id: "pi_paid".into(),
                    clear_cart: false,
                }),
            })
            .await
            .unwrap();
        OrderLifecycle::new(store.clone())
            .apply(placed.order, &TransitionRequest::to(OrderStatus::Cancelled))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_settle_issues_open_refunds_once() {
        use crate::memory::MemoryStore;
        use crate::testing::FakeGateway;

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        cancelled_paid_order(&store).await;

        let desk = RefundDesk::new(gateway.clone(), store.clone());

        gateway.fail_next("rate limited");
        let first = desk.settle_open().await.unwrap();
        assert_eq!(first, RefundSettlement { issued: 0, failed: 1 });
        assert_eq!(desk.obligations().await.unwrap()[0].status, RefundStatus::Failed);

        let second = desk.settle_open().await.unwrap();
        assert_eq!(second, RefundSettlement { issued: 1, failed: 0 });

        let third = desk.settle_open().await.unwrap();
        assert_eq!(third, RefundSettlement::default());

        let refunds = gateway.refunds();
        let obligation = &desk.obligations().await.unwrap()[0];
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].payment_intent_id, "pi_paid");
        assert_eq!(refunds[0].amount, Some(Money::from_cents(2800)));
        assert_eq!(refunds[0].idempotency_key, format!("refund-{}", obligation.id));
        assert_eq!(obligation.status, RefundStatus::Issued);
        assert_eq!(obligation.gateway_refund_id.as_deref(), Some(refunds[0].refund_id.as_str()));
    }

    #[tokio::test]
    async fn test_unfinished_refund_stays_open() {
        use crate::memory::MemoryStore;
        use crate::testing::FakeGateway;

        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new());
        cancelled_paid_order(&store).await;
        let desk = RefundDesk::new(gateway.clone(), store.clone());

        for status in ["pending", "requires_action", "failed"] {
            gateway.set_refund_status(status);
            let run = desk.settle_open().await.unwrap();
            assert_eq!(run, RefundSettlement { issued: 0, failed: 1 }, "{status}");

            let obligation = &desk.obligations().await.unwrap()[0];
            assert_eq!(obligation.status, RefundStatus::Failed);
            assert!(obligation.last_error.as_deref().unwrap().ends_with(status));
        }

        gateway.set_refund_status("succeeded");
        assert_eq!(desk.settle_open().await.unwrap().issued, 1);
        assert_eq!(desk.obligations().await.unwrap()[0].status, RefundStatus::Issued);
        // every attempt reused one idempotency key
        assert_eq!(gateway.refunds().len(), 1);
    }

    #[test]
    fn test_stranded_payment_owes_intent_amount() {
        let cancelled = Order {
            status: OrderStatus::Cancelled,
            ..order(PaymentMethod::ExternalGateway, PENDING_TRANSACTION)
        };
        assert!(RefundObligation::for_order(&cancelled, None).is_none());

        let obligation =
            RefundObligation::for_stranded_payment(&cancelled, "pi_late", Money::from_cents(2750));
        assert_eq!(obligation.transaction_id, "pi_late");
        assert_eq!(obligation.amount, Money::from_cents(2750));
        assert_eq!(obligation.order_id, cancelled.id);
        assert!(obligation.is_open());
    }
}
