//! In-process `PaymentGateway` for tests.
//!
//! Intents, customers and refunds live in a map. Webhooks are "signed" with a
//! fixed string; anything else fails verification.

use crate::error::{CheckoutError, CheckoutResult};
use crate::gateway::{
    GatewayCustomer, GatewayEvent, GatewayEventKind, IntentStatus, PaymentGateway, PaymentIntent,
    RefundReceipt,
};
use crate::money::Money;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// The only signature `FakeGateway` accepts
pub const FAKE_SIGNATURE: &str = "t=0,v1=fake";

/// A refund the fake gateway accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRefund {
    pub refund_id: String,
    pub payment_intent_id: String,
    pub amount: Option<Money>,
    pub idempotency_key: String,
}

#[derive(Default)]
struct FakeState {
    intents: HashMap<String, PaymentIntent>,
    customers: HashMap<String, GatewayCustomer>,
    refunds: Vec<FakeRefund>,
    fail_next: Option<String>,
    refund_status: Option<String>,
    next_id: u64,
    customers_created: usize,
}

impl FakeState {
    fn refund_status(&self) -> String {
        self.refund_status
            .clone()
            .unwrap_or_else(|| "succeeded".to_string())
    }

    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{:06}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next gateway call with `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        self.state().fail_next = Some(message.into());
    }

    /// Status reported for refunds from now on, replays included
    pub fn set_refund_status(&self, status: impl Into<String>) {
        self.state().refund_status = Some(status.into());
    }

    /// Simulate the browser confirming (or failing) the card payment
    pub fn set_intent_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(intent) = self.state().intents.get_mut(intent_id) {
            intent.status = status;
        }
    }

    pub fn intent(&self, intent_id: &str) -> Option<PaymentIntent> {
        self.state().intents.get(intent_id).cloned()
    }

    pub fn refunds(&self) -> Vec<FakeRefund> {
        self.state().refunds.clone()
    }

    pub fn customers_created(&self) -> usize {
        self.state().customers_created
    }

    /// Raw webhook body in the gateway's event shape
    pub fn event_payload(event_type: &str, intent_id: &str) -> Vec<u8> {
        let mut object = serde_json::json!({
            "id": intent_id,
            "object": "payment_intent",
            "amount": 2800,
        });
        if event_type == "payment_intent.payment_failed" {
            object["last_payment_error"] = serde_json::json!({ "message": "Your card was declined." });
        }

        serde_json::json!({
            "id": format!("evt_{intent_id}"),
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
        .to_string()
        .into_bytes()
    }

    fn check_failure(&self) -> CheckoutResult<()> {
        match self.state().fail_next.take() {
            Some(message) => Err(gateway_error(message)),
            None => Ok(()),
        }
    }
}

fn gateway_error(message: impl Into<String>) -> CheckoutError {
    CheckoutError::Gateway {
        provider: "fake".to_string(),
        message: message.into(),
    }
}

fn no_such(kind: &str, id: &str) -> CheckoutError {
    gateway_error(format!("No such {kind}: '{id}'"))
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_intent(
        &self,
        amount: Money,
        _description: &str,
    ) -> CheckoutResult<PaymentIntent> {
        self.check_failure()?;
        let mut state = self.state();
        let id = state.id("pi");
        let intent = PaymentIntent {
            client_secret: Some(format!("{id}_secret_fake")),
            id: id.clone(),
            status: IntentStatus::RequiresPaymentMethod,
            amount,
            customer: None,
        };
        state.intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, intent_id: &str) -> CheckoutResult<PaymentIntent> {
        self.check_failure()?;
        self.intent(intent_id)
            .ok_or_else(|| no_such("payment_intent", intent_id))
    }

    async fn attach_customer(
        &self,
        intent_id: &str,
        email: &str,
        name: &str,
    ) -> CheckoutResult<String> {
        self.check_failure()?;
        let mut state = self.state();
        let existing = state
            .intents
            .get(intent_id)
            .ok_or_else(|| no_such("payment_intent", intent_id))?
            .customer
            .clone();
        if let Some(customer_id) = existing {
            return Ok(customer_id);
        }

        let customer_id = state.id("cus");
        state.customers.insert(
            customer_id.clone(),
            GatewayCustomer {
                id: customer_id.clone(),
                email: Some(email.to_string()),
                name: Some(name.to_string()),
            },
        );
        state.customers_created += 1;
        if let Some(intent) = state.intents.get_mut(intent_id) {
            intent.customer = Some(customer_id.clone());
        }
        Ok(customer_id)
    }

    async fn retrieve_customer(&self, customer_id: &str) -> CheckoutResult<GatewayCustomer> {
        self.check_failure()?;
        self.state()
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| no_such("customer", customer_id))
    }

    async fn refund(
        &self,
        payment_intent_id: &str,
        amount: Option<Money>,
        idempotency_key: &str,
    ) -> CheckoutResult<RefundReceipt> {
        self.check_failure()?;
        let mut state = self.state();
        if let Some(previous) = state
            .refunds
            .iter()
            .find(|r| r.idempotency_key == idempotency_key)
        {
            return Ok(RefundReceipt {
                refund_id: previous.refund_id.clone(),
                status: state.refund_status(),
            });
        }

        let refund_id = state.id("re");
        state.refunds.push(FakeRefund {
            refund_id: refund_id.clone(),
            payment_intent_id: payment_intent_id.to_string(),
            amount,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(RefundReceipt {
            refund_id,
            status: state.refund_status(),
        })
    }

    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> CheckoutResult<GatewayEvent> {
        if signature != FAKE_SIGNATURE {
            return Err(CheckoutError::WebhookVerification(
                "No signatures found matching the expected signature".to_string(),
            ));
        }

        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| CheckoutError::WebhookPayload(e.to_string()))?;
        let event_type = value["type"]
            .as_str()
            .ok_or_else(|| CheckoutError::WebhookPayload("missing event type".to_string()))?;
        let object = &value["data"]["object"];

        Ok(GatewayEvent {
            event_id: value["id"].as_str().unwrap_or_default().to_string(),
            kind: GatewayEventKind::from_event_type(event_type),
            payment_intent_id: object["id"].as_str().map(String::from),
            amount: object["amount"].as_i64().map(Money::from_cents),
            failure_message: object["last_payment_error"]["message"]
                .as_str()
                .map(String::from),
            created_at: value["created"]
                .as_i64()
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .unwrap_or_else(Utc::now),
        })
    }

    fn provider_name(&self) -> &'static str {
        "fake"
    }
}
