//! # Payment Gateway Trait
//!
//! The checkout core talks to the card processor only through
//! `PaymentGateway`. Implementations: Stripe (`order-stripe`), and an
//! in-process fake for tests (`testing` feature).
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PaymentGateway (trait)                    │
//! │  ├── create_payment_intent() / retrieve_payment_intent()    │
//! │  ├── attach_customer() / retrieve_customer()                │
//! │  ├── refund()                                               │
//! │  └── verify_webhook()                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                  ▲                         ▲
//!          ┌───────┴───────┐         ┌───────┴───────┐
//!          │ StripeGateway │         │  FakeGateway  │
//!          └───────────────┘         └───────────────┘
//! ```

use crate::error::CheckoutResult;
use crate::money::Money;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Smallest amount the gateway will charge
pub const MINIMUM_CHARGE: Money = Money::from_cents(50);

/// Gateway-side status of a payment intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::RequiresPaymentMethod => "requires_payment_method",
            IntentStatus::RequiresConfirmation => "requires_confirmation",
            IntentStatus::RequiresAction => "requires_action",
            IntentStatus::Processing => "processing",
            IntentStatus::RequiresCapture => "requires_capture",
            IntentStatus::Canceled => "canceled",
            IntentStatus::Succeeded => "succeeded",
            IntentStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-progress card charge at the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,

    /// Handed to the browser to confirm the card payment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    pub status: IntentStatus,

    /// Amount in cents
    pub amount: Money,

    /// Gateway customer attached to the intent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
}

/// Customer record at the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Result of a refund request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub status: String,
}

impl RefundReceipt {
    /// Only `succeeded` means the money went back; `pending`,
    /// `requires_action`, `failed` and `canceled` do not.
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }
}

/// Webhook event types the reconciler acts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCanceled,
    /// Anything else (acknowledged, not acted on)
    Other(String),
}

impl GatewayEventKind {
    /// Map a `payment_intent.*` event type name
    pub fn from_event_type(name: &str) -> Self {
        match name {
            "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded,
            "payment_intent.payment_failed" => GatewayEventKind::PaymentFailed,
            "payment_intent.canceled" => GatewayEventKind::PaymentCanceled,
            other => GatewayEventKind::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            GatewayEventKind::PaymentSucceeded => "payment_succeeded",
            GatewayEventKind::PaymentFailed => "payment_failed",
            GatewayEventKind::PaymentCanceled => "payment_canceled",
            GatewayEventKind::Other(name) => name,
        }
    }
}

/// A verified webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event_id: String,

    pub kind: GatewayEventKind,

    /// Payment intent the event is about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Money>,

    /// Gateway's explanation for a failed payment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Card processor operations used by checkout, reconciliation and refunds.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a card payment intent for `amount`.
    async fn create_payment_intent(
        &self,
        amount: Money,
        description: &str,
    ) -> CheckoutResult<PaymentIntent>;

    /// Fetch the current state of an intent from the gateway.
    async fn retrieve_payment_intent(&self, intent_id: &str) -> CheckoutResult<PaymentIntent>;

    /// Make sure the intent has a gateway customer and return its id.
    ///
    /// Reuses the customer already attached to the intent, so repeated calls
    /// never create duplicates.
    async fn attach_customer(
        &self,
        intent_id: &str,
        email: &str,
        name: &str,
    ) -> CheckoutResult<String>;

    async fn retrieve_customer(&self, customer_id: &str) -> CheckoutResult<GatewayCustomer>;

    /// Refund a captured intent; `None` refunds the full amount.
    ///
    /// `idempotency_key` lets a retried refund collapse into the first one.
    async fn refund(
        &self,
        payment_intent_id: &str,
        amount: Option<Money>,
        idempotency_key: &str,
    ) -> CheckoutResult<RefundReceipt>;

    /// Verify a webhook signature over the raw payload and parse the event.
    async fn verify_webhook(&self, payload: &[u8], signature: &str)
        -> CheckoutResult<GatewayEvent>;

    /// Get the provider name (for logging and errors).
    fn provider_name(&self) -> &'static str;

    /// Key the browser needs to confirm card payments, if any.
    fn publishable_key(&self) -> Option<&str> {
        None
    }
}

/// Type alias for a shared gateway (dynamic dispatch)
pub type BoxedPaymentGateway = Arc<dyn PaymentGateway>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_deserializes_gateway_shape() {
        let intent: PaymentIntent = serde_json::from_value(serde_json::json!({
            "id": "pi_123",
            "client_secret": "pi_123_secret_abc",
            "status": "requires_payment_method",
            "amount": 2800,
            "customer": null,
            "currency": "usd"
        }))
        .unwrap();

        assert_eq!(intent.status, IntentStatus::RequiresPaymentMethod);
        assert_eq!(intent.amount, Money::from_cents(2800));
        assert!(intent.customer.is_none());
    }

    #[test]
    fn test_event_type_mapping() {
        assert_eq!(
            GatewayEventKind::from_event_type("payment_intent.payment_failed"),
            GatewayEventKind::PaymentFailed
        );
        let other = GatewayEventKind::from_event_type("charge.refunded");
        assert_eq!(other.label(), "charge.refunded");
    }

    #[test]
    fn test_unknown_intent_status() {
        let status: IntentStatus = serde_json::from_str("\"partially_funded\"").unwrap();
        assert_eq!(status, IntentStatus::Unknown);
    }
}
