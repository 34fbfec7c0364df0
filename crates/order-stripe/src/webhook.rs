//! # Stripe Webhook Handling
//!
//! Signature verification (`Stripe-Signature: t=<ts>,v1=<hex>`) and parsing of
//! `payment_intent.*` events into `GatewayEvent`s.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use order_core::{CheckoutError, CheckoutResult, GatewayEvent, GatewayEventKind, Money};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Events that should be enabled in Stripe Dashboard for this service
pub const REQUIRED_WEBHOOK_EVENTS: &[&str] = &[
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
    "payment_intent.canceled",
];

struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

/// Check `header` against `payload` signed with `secret`.
///
/// `now` is passed in so tolerance can be tested without a clock.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> CheckoutResult<()> {
    let parts = parse_signature_header(header)?;

    let tolerance = u64::try_from(tolerance_secs).unwrap_or(0);
    let within_tolerance = now
        .checked_sub(parts.timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|age| age <= tolerance);
    if !within_tolerance {
        return Err(CheckoutError::WebhookVerification(
            "Timestamp outside tolerance".to_string(),
        ));
    }

    let expected = compute_signature(secret, parts.timestamp, payload)?;
    let valid = parts
        .signatures
        .iter()
        .any(|sig| constant_time_compare(sig, &expected));

    if !valid {
        return Err(CheckoutError::WebhookVerification(
            "Signature mismatch".to_string(),
        ));
    }
    Ok(())
}

/// Build a `Stripe-Signature` header value for `payload` (local tooling and tests)
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> CheckoutResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)?
    ))
}

/// Parse a verified payload into a gateway event
pub fn parse_event(payload: &[u8]) -> CheckoutResult<GatewayEvent> {
    let event: StripeWebhookEvent = serde_json::from_slice(payload).map_err(|e| {
        CheckoutError::WebhookPayload(format!("Failed to parse webhook: {}", e))
    })?;

    debug!("Verified Stripe webhook: type={}", event.event_type);

    let object = event.data.object;
    let kind = GatewayEventKind::from_event_type(&event.event_type);

    // Only payment intent objects carry the intent id in `id`.
    let payment_intent_id = match object.object.as_deref() {
        Some("payment_intent") => object.id,
        _ => object.payment_intent,
    };

    Ok(GatewayEvent {
        event_id: event.id,
        kind,
        payment_intent_id,
        amount: object.amount.map(Money::from_cents),
        failure_message: object.last_payment_error.and_then(|e| e.message),
        created_at: DateTime::from_timestamp(event.created, 0).unwrap_or_else(Utc::now),
    })
}

fn parse_signature_header(header: &str) -> CheckoutResult<SignatureHeader> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        CheckoutError::WebhookVerification("Missing timestamp in signature".to_string())
    })?;

    if signatures.is_empty() {
        return Err(CheckoutError::WebhookVerification(
            "No v1 signature found".to_string(),
        ));
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> CheckoutResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CheckoutError::WebhookVerification(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// =============================================================================
// Stripe Event Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripeWebhookEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
struct StripeEventObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    last_payment_error: Option<StripePaymentError>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentError {
    #[serde(default)]
    message: Option<String>,
}
