//! # Stripe Payment Intents
//!
//! `PaymentGateway` over the Stripe REST API: payment intents, customers and
//! refunds, plus webhook verification.

use crate::config::StripeConfig;
use crate::webhook;
use async_trait::async_trait;
use chrono::Utc;
use order_core::{
    CheckoutError, CheckoutResult, GatewayCustomer, GatewayEvent, Money, PaymentGateway,
    PaymentIntent, RefundReceipt, ValidationErrors, CURRENCY,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

const PROVIDER: &str = "stripe";

/// Stripe payment intent gateway
///
/// The browser confirms the card with Stripe.js using the intent's client
/// secret; the server never sees card data.
pub struct StripeGateway {
    config: StripeConfig,
    client: Client,
}

impl StripeGateway {
    /// Create a new Stripe gateway
    pub fn new(config: StripeConfig) -> CheckoutResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                CheckoutError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> CheckoutResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.api_base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    fn post(&self, path: &str, params: &[(&str, String)], idempotency_key: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .header("Idempotency-Key", idempotency_key)
            .form(params)
    }

    /// Send a request, mapping Stripe error bodies to `CheckoutError::Gateway`
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> CheckoutResult<T> {
        let response = request
            .header("Authorization", self.config.auth_header())
            .header("Stripe-Version", &self.config.api_version)
            .send()
            .await
            .map_err(|e| gateway_error(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| gateway_error(e.to_string()))?;

        if !status.is_success() {
            error!("Stripe API error: status={}, body={}", status, body);

            if let Ok(error_response) = serde_json::from_str::<StripeErrorResponse>(&body) {
                return Err(gateway_error(error_response.error.message));
            }
            return Err(gateway_error(format!("HTTP {}: {}", status, body)));
        }

        serde_json::from_str(&body)
            .map_err(|e| gateway_error(format!("Failed to parse Stripe response: {}", e)))
    }
}

/// `{resource}/{id}` for an object id that came from a client. Stripe ids
/// are `[A-Za-z0-9_]`; anything else never reaches the URL.
fn object_path(resource: &str, id: &str) -> CheckoutResult<String> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CheckoutError::Validation(ValidationErrors::single(
            resource.trim_end_matches('s'),
            format!("Invalid Stripe object id: {:?}", id),
        )));
    }
    Ok(format!("{}/{}", resource, id))
}

fn gateway_error(message: impl Into<String>) -> CheckoutError {
    CheckoutError::Gateway {
        provider: PROVIDER.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self))]
    async fn create_payment_intent(
        &self,
        amount: Money,
        description: &str,
    ) -> CheckoutResult<PaymentIntent> {
        let params = [
            ("amount", amount.cents().to_string()),
            ("currency", CURRENCY.to_string()),
            ("description", description.to_string()),
            ("payment_method_types[]", "card".to_string()),
        ];
        let key = Uuid::new_v4().to_string();

        let intent: PaymentIntent = self
            .send(self.post("payment_intents", &params, &key))
            .await?;

        info!("Created Stripe payment intent: id={}, amount={}", intent.id, amount);
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_payment_intent(&self, intent_id: &str) -> CheckoutResult<PaymentIntent> {
        self.send(self.get(&object_path("payment_intents", intent_id)?))
            .await
    }

    #[instrument(skip(self, email, name))]
    async fn attach_customer(
        &self,
        intent_id: &str,
        email: &str,
        name: &str,
    ) -> CheckoutResult<String> {
        let intent = self.retrieve_payment_intent(intent_id).await?;
        if let Some(customer_id) = intent.customer {
            debug!("Intent {} already has customer {}", intent_id, customer_id);
            return Ok(customer_id);
        }

        // Keyed on the intent so a retried call within Stripe's idempotency
        // window gets the same customer back.
        let customer: GatewayCustomer = self
            .send(self.post(
                "customers",
                &[("email", email.to_string()), ("name", name.to_string())],
                &format!("customer-{}", intent_id),
            ))
            .await?;

        let _: PaymentIntent = self
            .send(self.post(
                &object_path("payment_intents", intent_id)?,
                &[("customer", customer.id.clone())],
                &format!("attach-{}-{}", intent_id, customer.id),
            ))
            .await?;

        info!("Attached Stripe customer {} to intent {}", customer.id, intent_id);
        Ok(customer.id)
    }

    #[instrument(skip(self))]
    async fn retrieve_customer(&self, customer_id: &str) -> CheckoutResult<GatewayCustomer> {
        self.send(self.get(&object_path("customers", customer_id)?))
            .await
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        payment_intent_id: &str,
        amount: Option<Money>,
        idempotency_key: &str,
    ) -> CheckoutResult<RefundReceipt> {
        let mut params = vec![("payment_intent", payment_intent_id.to_string())];
        if let Some(amount) = amount {
            params.push(("amount", amount.cents().to_string()));
        }

        let refund: StripeRefundResponse = self
            .send(self.post("refunds", &params, idempotency_key))
            .await?;

        info!(
            "Stripe refund {}: intent={}, status={}",
            refund.id, payment_intent_id, refund.status
        );
        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund.status,
        })
    }

    #[instrument(skip(self, payload, signature))]
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> CheckoutResult<GatewayEvent> {
        webhook::verify_signature(
            payload,
            signature,
            &self.config.webhook_secret,
            self.config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )?;
        webhook::parse_event(payload)
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn publishable_key(&self) -> Option<&str> {
        Some(self.config.publishable_key.as_str())
    }
}

// =============================================================================
// Stripe API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripeRefundResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeError,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use order_core::{GatewayEventKind, IntentStatus};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway(server: &MockServer) -> StripeGateway {
        let config = StripeConfig::new("sk_test_abc123", "pk_test_xyz789", "whsec_secret")
            .with_api_base_url(server.uri());
        StripeGateway::new(config).unwrap()
    }

    fn intent_json(customer: Option<&str>, status: &str) -> serde_json::Value {
        json!({
            "id": "pi_123",
            "object": "payment_intent",
            "amount": 2800,
            "currency": "usd",
            "client_secret": "pi_123_secret_abc",
            "status": status,
            "customer": customer
        })
    }

    #[tokio::test]
    async fn test_create_payment_intent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("Authorization", "Bearer sk_test_abc123"))
            .and(header_exists("Idempotency-Key"))
            .and(body_string_contains("amount=2800"))
            .and(body_string_contains("currency=usd"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(intent_json(None, "requires_payment_method")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let intent = gateway(&server)
            .await
            .create_payment_intent(Money::from_cents(2800), "Order Payment #1")
            .await
            .unwrap();

        assert_eq!(intent.id, "pi_123");
        assert_eq!(intent.client_secret.as_deref(), Some("pi_123_secret_abc"));
        assert_eq!(intent.status, IntentStatus::RequiresPaymentMethod);
    }

    #[tokio::test]
    async fn test_stripe_error_message_is_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": "Amount must be at least $0.50 usd",
                    "param": "amount"
                }
            })))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .await
            .create_payment_intent(Money::from_cents(10), "Order Payment #1")
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Amount must be at least $0.50 usd");
    }

    #[tokio::test]
    async fn test_attach_customer_reuses_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(intent_json(Some("cus_existing"), "requires_payment_method")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "cus_new" })))
            .expect(0)
            .mount(&server)
            .await;

        let customer_id = gateway(&server)
            .await
            .attach_customer("pi_123", "ada@example.com", "Ada Lovelace")
            .await
            .unwrap();

        assert_eq!(customer_id, "cus_existing");
    }

    #[tokio::test]
    async fn test_attach_customer_creates_and_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(intent_json(None, "requires_payment_method")),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/customers"))
            .and(header("Idempotency-Key", "customer-pi_123"))
            .and(body_string_contains("email=ada%40example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cus_new",
                "email": "ada@example.com",
                "name": "Ada Lovelace"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents/pi_123"))
            .and(body_string_contains("customer=cus_new"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(intent_json(Some("cus_new"), "requires_payment_method")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let customer_id = gateway(&server)
            .await
            .attach_customer("pi_123", "ada@example.com", "Ada Lovelace")
            .await
            .unwrap();

        assert_eq!(customer_id, "cus_new");
    }

    #[tokio::test]
    async fn test_refund_sends_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/refunds"))
            .and(header("Idempotency-Key", "refund-key-1"))
            .and(body_string_contains("payment_intent=pi_123"))
            .and(body_string_contains("amount=2800"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "re_1",
                "object": "refund",
                "status": "succeeded"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = gateway(&server)
            .await
            .refund("pi_123", Some(Money::from_cents(2800)), "refund-key-1")
            .await
            .unwrap();

        assert_eq!(receipt.refund_id, "re_1");
        assert_eq!(receipt.status, "succeeded");
    }

    #[tokio::test]
    async fn test_verify_webhook_roundtrip() {
        let server = MockServer::start().await;
        let gateway = gateway(&server).await;

        let payload = json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": Utc::now().timestamp(),
            "data": { "object": { "id": "pi_123", "object": "payment_intent", "amount": 2800 } }
        })
        .to_string();
        let signature =
            webhook::sign_payload("whsec_secret", Utc::now().timestamp(), payload.as_bytes())
                .unwrap();

        let event = gateway.verify_webhook(payload.as_bytes(), &signature).await.unwrap();
        assert_eq!(event.kind, GatewayEventKind::PaymentSucceeded);
        assert_eq!(event.payment_intent_id.as_deref(), Some("pi_123"));

        let err = gateway
            .verify_webhook(payload.as_bytes(), "t=1,v1=deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::WebhookVerification(_)));
    }

    #[tokio::test]
    async fn test_unsafe_object_ids_never_reach_stripe() {
        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;
        let gateway = gateway(&server).await;

        for id in ["pi_1/../refunds", "pi_1?expand[]=customer", "pi%2F1", ""] {
            let err = gateway.retrieve_payment_intent(id).await.unwrap_err();
            assert_eq!(err.status_code(), 422, "{id:?}");
            assert!(gateway.attach_customer(id, "a@b.co", "A B").await.is_err());
        }
        let err = gateway.retrieve_customer("cus_1/../../v1/balance").await.unwrap_err();
        assert!(err.validation_errors().unwrap().has_field("customer"));
    }
}
